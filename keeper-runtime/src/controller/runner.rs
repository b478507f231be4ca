use crate::scheduler::{ScheduleRequest, Scheduler};
use futures::{future::BoxFuture, Future, FutureExt, Stream, StreamExt};
use pin_project::pin_project;
use std::{
    collections::HashMap,
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};

/// Pulls items from a [`Scheduler`], and runs an action for each item in parallel,
/// while making sure to not process [equal](`Eq`) items multiple times at once.
///
/// If an item is to be emitted from the [`Scheduler`] while an equal item is
/// already being processed then it will be held pending until the current item
/// is finished.
///
/// Once the future given to [`Runner::stop_on`] resolves, no new items are taken; the
/// runner terminates as soon as the items already running have finished.
#[pin_project]
pub struct Runner<T, R, F, MkF> {
    #[pin]
    scheduler: Scheduler<T, R>,
    run_msg: MkF,
    /// The running future of every key that is being processed
    slots: HashMap<T, F>,
    max_concurrent_executions: u16,
    stop: Option<BoxFuture<'static, ()>>,
    stopped: bool,
}

impl<T, R, F, MkF> Runner<T, R, F, MkF>
where
    F: Future + Unpin,
    MkF: FnMut(&T) -> F,
{
    /// Run `run_msg` for each scheduled item, at most `max_concurrent_executions` at a time
    /// (`0` means unbounded)
    pub fn new(scheduler: Scheduler<T, R>, max_concurrent_executions: u16, run_msg: MkF) -> Self {
        Self {
            scheduler,
            run_msg,
            slots: HashMap::new(),
            max_concurrent_executions,
            stop: None,
            stopped: false,
        }
    }

    /// Stop taking new items once `signal` resolves
    #[must_use]
    pub fn stop_on(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.stop = Some(signal.boxed());
        self
    }
}

impl<T, R, F, MkF> Stream for Runner<T, R, F, MkF>
where
    T: Eq + Hash + Clone + Unpin,
    R: Stream<Item = ScheduleRequest<T>>,
    F: Future + Unpin,
    MkF: FnMut(&T) -> F,
{
    type Item = F::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if let Some(stop) = this.stop.as_mut() {
            if stop.poll_unpin(cx).is_ready() {
                *this.stopped = true;
                *this.stop = None;
            }
        }
        let slots = this.slots;
        let scheduler = &mut this.scheduler;
        let has_active_slots = match poll_slots(slots, cx) {
            Poll::Ready(Some(result)) => return Poll::Ready(Some(result)),
            Poll::Ready(None) => false,
            Poll::Pending => true,
        };
        if *this.stopped {
            return if has_active_slots {
                Poll::Pending
            } else {
                Poll::Ready(None)
            };
        }
        loop {
            // Respect the concurrency limit; a finishing slot wakes us up again
            let limit = usize::from(*this.max_concurrent_executions);
            if limit > 0 && slots.len() >= limit {
                break Poll::Pending;
            }
            // Try to take a new message that isn't already being processed
            // leave the already-processing ones in the queue, so that we can take them once
            // we're free again.
            let next_msg_poll = scheduler
                .as_mut()
                .hold_unless(|msg| !slots.contains_key(msg))
                .poll_next_unpin(cx);
            match next_msg_poll {
                Poll::Ready(Some(msg)) => {
                    let msg_fut = (this.run_msg)(&msg);
                    let replaced = slots.insert(msg, msg_fut);
                    debug_assert!(replaced.is_none(), "Runner tried to replace a running future");
                    cx.waker().wake_by_ref();
                }
                Poll::Ready(None) => {
                    break if has_active_slots {
                        // We're done listening for new messages, but still have some that
                        // haven't finished quite yet
                        Poll::Pending
                    } else {
                        Poll::Ready(None)
                    };
                }
                Poll::Pending => break Poll::Pending,
            }
        }
    }
}

/// Polls every running slot, removing and returning the first one that finished
///
/// `Ready(None)` means no slot is running.
fn poll_slots<T, F>(slots: &mut HashMap<T, F>, cx: &mut Context<'_>) -> Poll<Option<F::Output>>
where
    T: Eq + Hash + Clone,
    F: Future + Unpin,
{
    if slots.is_empty() {
        return Poll::Ready(None);
    }
    let finished = slots.iter_mut().find_map(|(key, fut)| match fut.poll_unpin(cx) {
        Poll::Ready(output) => Some((key.clone(), output)),
        Poll::Pending => None,
    });
    match finished {
        Some((key, output)) => {
            slots.remove(&key);
            Poll::Ready(Some(output))
        }
        None => Poll::Pending,
    }
}
