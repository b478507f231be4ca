//! Time-ordered, de-duplicating queue of reconcile requests
//!
//! Requests reach the queue from two sides:
//!
//! - triggers ([`ScheduleRequest::trigger`]): store changes, owned children and external
//!   streams, which want the key reconciled right away
//! - requeues ([`ScheduleRequest::requeue`]): the [`Action`](crate::Action) of an earlier
//!   reconcile or of the error policy, which want the key reconciled after a delay
//!
//! A key is queued at most once, at the earliest instant anyone asked for. A trigger therefore
//! pulls a pending requeue forward, while a requeue never postpones a run that is already due
//! sooner.
//!
//! A key that comes due while it is still being reconciled is held (see
//! [`Scheduler::hold_unless`]) rather than emitted. Held keys absorb further requests and are
//! released in the order they came due.
use futures::{
    stream::{Fuse, FusedStream},
    Stream, StreamExt,
};
use pin_project::pin_project;
use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// How long a triggered key waits before it runs
///
/// Changes to one key within this window collapse into a single reconcile.
pub const TRIGGER_DELAY: Duration = Duration::from_millis(1);

/// Ask for `message` to be emitted at `run_at`
#[derive(Debug)]
pub struct ScheduleRequest<T> {
    /// The key to emit
    pub message: T,
    /// When to emit it
    pub run_at: Instant,
}

impl<T> ScheduleRequest<T> {
    /// Run `message` as soon as possible
    pub fn trigger(message: T) -> Self {
        Self {
            message,
            run_at: Instant::now() + TRIGGER_DELAY,
        }
    }

    /// Run `message` again once `delay` has passed
    pub fn requeue(message: T, delay: Duration) -> Self {
        Self {
            message,
            run_at: Instant::now() + delay,
        }
    }
}

/// Timers and bookkeeping for the keys in a [`Scheduler`]
struct Queue<T> {
    timers: DelayQueue<T>,
    /// Keys waiting on a timer, with their deadline
    waiting: HashMap<T, (Instant, delay_queue::Key)>,
    /// Keys that are due but were not allowed out yet, oldest first
    held: VecDeque<T>,
}

impl<T: Hash + Eq + Clone> Queue<T> {
    fn new() -> Self {
        Self {
            timers: DelayQueue::new(),
            waiting: HashMap::new(),
            held: VecDeque::new(),
        }
    }

    fn push(&mut self, request: ScheduleRequest<T>) {
        let ScheduleRequest { message, run_at } = request;
        if self.held.contains(&message) {
            // already due, it leaves as soon as it is allowed to
            return;
        }
        match self.waiting.get_mut(&message) {
            Some((deadline, _)) if *deadline <= run_at => {}
            Some((deadline, timer)) => {
                self.timers.reset_at(timer, run_at);
                *deadline = run_at;
            }
            None => {
                let timer = self.timers.insert_at(message.clone(), run_at);
                self.waiting.insert(message, (run_at, timer));
            }
        }
    }

    fn poll_due(&mut self, cx: &mut Context<'_>, can_take: impl Fn(&T) -> bool) -> Poll<Option<T>> {
        if let Some(pos) = self.held.iter().position(|msg| can_take(msg)) {
            return Poll::Ready(self.held.remove(pos));
        }
        loop {
            match self.timers.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let msg = expired.into_inner();
                    self.waiting.remove(&msg);
                    if can_take(&msg) {
                        return Poll::Ready(Some(msg));
                    }
                    self.held.push_back(msg);
                }
                Poll::Ready(None) if self.held.is_empty() => return Poll::Ready(None),
                Poll::Ready(None) | Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// A [`Stream`] of keys, each emitted once its [`ScheduleRequest::run_at`] has passed
///
/// Built with [`scheduler`]. Ends once the request stream has ended and every queued key has
/// been emitted.
#[pin_project]
pub struct Scheduler<T, R> {
    queue: Queue<T>,
    #[pin]
    requests: Fuse<R>,
}

impl<T, R> Scheduler<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
{
    /// A view of the scheduler that only emits keys for which `can_take_message` holds
    ///
    /// Due keys that fail the check are held and retried on every later poll, oldest first,
    /// so the view is cheap to rebuild for each poll.
    pub fn hold_unless<C: Fn(&T) -> bool>(self: Pin<&mut Self>, can_take_message: C) -> HoldUnless<'_, T, R, C> {
        HoldUnless {
            scheduler: self,
            can_take_message,
        }
    }

    #[cfg(test)]
    fn is_held(&self, msg: &T) -> bool {
        self.queue.held.contains(msg)
    }
}

/// See [`Scheduler::hold_unless`]
pub struct HoldUnless<'a, T, R, C> {
    scheduler: Pin<&'a mut Scheduler<T, R>>,
    can_take_message: C,
}

impl<T, R, C> Stream for HoldUnless<'_, T, R, C>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
    C: Fn(&T) -> bool + Unpin,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let mut scheduler = this.scheduler.as_mut().project();
        while let Poll::Ready(Some(request)) = scheduler.requests.as_mut().poll_next(cx) {
            scheduler.queue.push(request);
        }
        match scheduler.queue.poll_due(cx, &this.can_take_message) {
            // more requests may still arrive
            Poll::Ready(None) if !scheduler.requests.is_terminated() => Poll::Pending,
            polled => polled,
        }
    }
}

impl<T, R> Stream for Scheduler<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.hold_unless(|_| true).poll_next_unpin(cx)
    }
}

/// Emit the key of every request in `requests` at its `run_at`, one queued run per key
pub fn scheduler<T, R>(requests: R) -> Scheduler<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
{
    Scheduler {
        queue: Queue::new(),
        requests: requests.fuse(),
    }
}

#[cfg(test)]
mod tests {
    use super::{scheduler, ScheduleRequest};
    use futures::{channel::mpsc, poll, stream, FutureExt, StreamExt};
    use keeper_core::ObjectRef;
    use std::task::Poll;
    use tokio::time::{advance, Duration};

    fn key(name: &str) -> ObjectRef {
        ObjectRef::new(name).within("default")
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_pulls_a_pending_requeue_forward() {
        let mut scheduler = scheduler(stream::iter(vec![
            ScheduleRequest::requeue(key("book"), Duration::from_secs(300)),
            ScheduleRequest::trigger(key("book")),
        ]));
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.next().now_or_never(), Some(Some(key("book"))));
        // the five minute requeue was replaced, not kept as a second run
        assert_eq!(scheduler.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_never_postpones_an_earlier_run() {
        let mut scheduler = scheduler(stream::iter(vec![
            ScheduleRequest::trigger(key("book")),
            ScheduleRequest::requeue(key("book"), Duration::from_secs(300)),
        ]));
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.next().now_or_never(), Some(Some(key("book"))));
        assert_eq!(scheduler.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_run_on_their_own_schedule() {
        let mut scheduler = scheduler(stream::iter(vec![
            ScheduleRequest::requeue(key("late"), Duration::from_secs(3)),
            ScheduleRequest::requeue(key("early"), Duration::from_secs(1)),
        ]));
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.next().now_or_never(), Some(Some(key("early"))));
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.next().now_or_never(), Some(Some(key("late"))));
        assert_eq!(scheduler.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn held_keys_are_released_in_the_order_they_came_due() {
        let mut scheduler = Box::pin(scheduler(stream::iter(vec![
            ScheduleRequest::requeue(key("b"), Duration::from_secs(2)),
            ScheduleRequest::requeue(key("a"), Duration::from_secs(1)),
        ])));
        advance(Duration::from_secs(3)).await;
        assert!(poll!(scheduler.as_mut().hold_unless(|_| false).next()).is_pending());
        assert!(scheduler.is_held(&key("a")));
        assert!(scheduler.is_held(&key("b")));

        let mut released = Vec::new();
        while let Some(msg) = scheduler.as_mut().hold_unless(|_| true).next().await {
            released.push(msg);
        }
        assert_eq!(released, [key("a"), key("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn held_key_absorbs_new_requests() {
        let (tx, rx) = mpsc::unbounded();
        let mut scheduler = Box::pin(scheduler(rx));
        tx.unbounded_send(ScheduleRequest::trigger(key("busy"))).unwrap();
        advance(Duration::from_secs(1)).await;
        assert!(poll!(scheduler.as_mut().hold_unless(|_| false).next()).is_pending());
        assert!(scheduler.is_held(&key("busy")));

        tx.unbounded_send(ScheduleRequest::trigger(key("busy"))).unwrap();
        tx.unbounded_send(ScheduleRequest::requeue(key("busy"), Duration::from_secs(60)))
            .unwrap();
        drop(tx);
        assert_eq!(scheduler.next().await, Some(key("busy")));
        assert_eq!(scheduler.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn held_key_does_not_block_the_others() {
        let mut scheduler = Box::pin(scheduler(stream::iter(vec![
            ScheduleRequest::trigger(key("busy")),
            ScheduleRequest::trigger(key("idle")),
        ])));
        let next = scheduler
            .as_mut()
            .hold_unless(|msg| msg != &key("busy"))
            .next()
            .await;
        assert_eq!(next, Some(key("idle")));
        assert!(poll!(scheduler.as_mut().hold_unless(|msg| msg != &key("busy")).next()).is_pending());
        assert!(scheduler.is_held(&key("busy")));
    }

    #[tokio::test(start_paused = true)]
    async fn emitted_key_can_be_scheduled_again() {
        let (tx, rx) = mpsc::unbounded();
        let mut scheduler = scheduler(rx);
        tx.unbounded_send(ScheduleRequest::requeue(key("book"), Duration::from_secs(1)))
            .unwrap();
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.next().now_or_never(), Some(Some(key("book"))));

        tx.unbounded_send(ScheduleRequest::requeue(key("book"), Duration::from_secs(1)))
            .unwrap();
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.next().now_or_never(), Some(Some(key("book"))));
        // the request channel is still open
        assert!(matches!(poll!(scheduler.next()), Poll::Pending));
    }
}
