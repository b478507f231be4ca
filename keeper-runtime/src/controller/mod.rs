//! Runs a [`Reconciler`] over the keys that need it
use self::runner::Runner;
use crate::{
    config::ControllerConfig,
    reconciler::{self, Reconcile, Reconciler},
    scheduler::{scheduler, ScheduleRequest},
    store::{Change, ResourceStore, Watch},
    utils::CancelableJoinHandle,
};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::{
    channel::mpsc,
    future::{self, BoxFuture},
    stream::{self, BoxStream, SelectAll},
    FutureExt, Stream, StreamExt, TryFuture, TryFutureExt, TryStream, TryStreamExt,
};
use keeper_core::{HasStatus, ObjectRef, ObservedStatus, Resource};
use std::{collections::HashMap, error::Error as StdError, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::trace;

mod runner;

/// Errors yielded by a running [`Controller`] or [`applier`]
#[derive(Debug, Error)]
pub enum Error<ReconcilerErr: StdError + 'static, QueueErr: StdError + 'static> {
    /// The reconciler failed for the given key; it has been requeued according to the error policy
    #[error("reconciler for object {1} failed")]
    ReconcilerFailed(#[source] ReconcilerErr, ObjectRef),
    /// A trigger source failed
    #[error("event queue error")]
    QueueError(#[source] QueueErr),
}

/// Results of the reconciliation attempt
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Action {
    /// Whether (and when) to next trigger the reconciliation if no external watch triggers hit
    ///
    /// For example, use this to query external systems for updates, expire time-limited resources, or
    /// (in your error policy) retry after errors.
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`, even if no external watch triggers hit
    ///
    /// Use this when the reconciled state may drift from the desired state without the
    /// resource itself changing.
    #[must_use]
    pub const fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Reconcile again as soon as possible
    #[must_use]
    pub const fn requeue_now() -> Self {
        Self::requeue(Duration::ZERO)
    }

    /// Do nothing until a change is detected
    ///
    /// This stops the controller periodically reconciling this object until a relevant watch event
    /// was **detected**.
    #[must_use]
    pub const fn await_change() -> Self {
        Self { requeue_after: None }
    }

    /// The delay after which the object is reconciled again, if any
    #[must_use]
    pub const fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Decides when to retry a key whose reconcile failed
pub trait ErrorPolicy<E> {
    /// Pick the [`Action`] for a failed reconcile of `obj_ref`
    fn on_error(&mut self, obj_ref: &ObjectRef, error: &E) -> Action;

    /// Called after every successful reconcile of `obj_ref`
    fn on_success(&mut self, _obj_ref: &ObjectRef) {}
}

impl<F, E> ErrorPolicy<E> for F
where
    F: FnMut(&ObjectRef, &E) -> Action,
{
    fn on_error(&mut self, obj_ref: &ObjectRef, error: &E) -> Action {
        self(obj_ref, error)
    }
}

/// The default [`ErrorPolicy`]
///
/// Write conflicts are retried after a short fixed delay, since a fresh fetch is all they need.
/// Every other error is retried with exponential backoff tracked per key, starting at
/// [`ControllerConfig::min_backoff`] and capped at [`ControllerConfig::max_backoff`].
/// A successful reconcile resets the backoff of its key.
#[derive(Debug)]
pub struct ErrorBackoff {
    conflict_retry: Duration,
    max_backoff: Duration,
    builder: ExponentialBuilder,
    backoffs: HashMap<ObjectRef, ExponentialBackoff>,
}

impl ErrorBackoff {
    /// Build from the backoff settings in `config`
    #[must_use]
    pub fn new(config: &ControllerConfig) -> Self {
        let max_backoff = config.max_backoff.as_std();
        Self {
            conflict_retry: config.conflict_retry.as_std(),
            max_backoff,
            builder: ExponentialBuilder::default()
                .with_min_delay(config.min_backoff.as_std().min(max_backoff))
                .with_max_delay(max_backoff)
                .without_max_times(),
            backoffs: HashMap::new(),
        }
    }

    /// The next delay for `obj_ref`
    pub fn next_delay(&mut self, obj_ref: &ObjectRef, is_conflict: bool) -> Duration {
        if is_conflict {
            return self.conflict_retry;
        }
        let builder = self.builder;
        self.backoffs
            .entry(obj_ref.clone())
            .or_insert_with(|| builder.build())
            .next()
            .unwrap_or(self.max_backoff)
    }

    /// Forget the backoff state of `obj_ref`
    pub fn reset(&mut self, obj_ref: &ObjectRef) {
        self.backoffs.remove(obj_ref);
    }
}

impl<E: StdError + 'static> ErrorPolicy<reconciler::Error<E>> for ErrorBackoff {
    fn on_error(&mut self, obj_ref: &ObjectRef, error: &reconciler::Error<E>) -> Action {
        Action::requeue(self.next_delay(obj_ref, error.is_conflict()))
    }

    fn on_success(&mut self, obj_ref: &ObjectRef) {
        self.reset(obj_ref);
    }
}

/// Helper for building custom trigger filters, see [`trigger_self`] and [`trigger_owners`] for some examples.
pub fn trigger_with<T, I, S>(stream: S, mapper: impl Fn(T) -> I) -> impl Stream<Item = Result<ObjectRef, S::Error>>
where
    S: TryStream<Ok = T>,
    I: IntoIterator<Item = ObjectRef>,
{
    stream
        .map_ok(move |obj| stream::iter(mapper(obj).into_iter().map(Ok)))
        .try_flatten()
}

/// Enqueues the changed object itself for reconciliation, if it is a `K`
pub fn trigger_self<K, S>(stream: S) -> impl Stream<Item = Result<ObjectRef, S::Error>>
where
    K: Resource,
    S: TryStream<Ok = Change>,
{
    trigger_with(stream, |change: Change| {
        change.is::<K>().then(|| ObjectRef::from_meta(&change.meta))
    })
}

/// Enqueues any owners of type `KOwner` of the changed object, if it is a `Child`
pub fn trigger_owners<KOwner, Child, S>(stream: S) -> impl Stream<Item = Result<ObjectRef, S::Error>>
where
    KOwner: Resource,
    Child: Resource,
    S: TryStream<Ok = Change>,
{
    trigger_with(stream, |change: Change| {
        let owners = if change.is::<Child>() {
            change.meta.owner_references.unwrap_or_default()
        } else {
            Vec::new()
        };
        let ns = change.meta.namespace;
        owners
            .into_iter()
            .filter(|owner| owner.kind == KOwner::KIND && owner.api_version == KOwner::api_version())
            .map(move |owner| ObjectRef::from_owner_ref(ns.as_deref(), &owner))
    })
}

/// Apply a reconciler to an input stream, with a given retry policy
///
/// The `queue` is a source of external events that trigger the reconciler,
/// usually a store's [`Watch::changes`] passed through a trigger function such as
/// [`trigger_self`].
///
/// Every key is reconciled at most once at a time; triggers for a key that is already being
/// reconciled are held until it finishes, and duplicate triggers collapse into one.
/// `concurrency` caps the number of keys reconciled at once (`0` for unbounded).
///
/// Once `shutdown` resolves, no new reconciles are started; the stream ends once the running
/// ones finish.
///
/// This is the "hard-mode" version of [`Controller`], which allows you some more customization
/// (such as triggering from arbitrary [`Stream`]s), at the cost of some more verbosity.
pub fn applier<QueueStream, ReconcilerFut, P>(
    mut reconciler: impl FnMut(ObjectRef) -> ReconcilerFut,
    mut error_policy: P,
    queue: QueueStream,
    concurrency: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> impl Stream<Item = Result<(ObjectRef, Action), Error<ReconcilerFut::Error, QueueStream::Error>>>
where
    ReconcilerFut: TryFuture<Ok = Action> + Unpin,
    ReconcilerFut::Error: StdError + 'static,
    QueueStream: TryStream<Ok = ObjectRef>,
    QueueStream::Error: StdError + 'static,
    P: ErrorPolicy<ReconcilerFut::Error>,
{
    let shutdown = shutdown.boxed().shared();
    let (requeue_tx, requeue_rx) = mpsc::unbounded::<ScheduleRequest<ObjectRef>>();
    let (queue_err_tx, queue_err_rx) = mpsc::unbounded::<QueueStream::Error>();
    let requests = stream::select(
        // 1. inputs from the trigger queue
        queue
            .into_stream()
            .take_until(shutdown.clone())
            .filter_map(move |res| {
                future::ready(match res {
                    Ok(obj_ref) => Some(ScheduleRequest::trigger(obj_ref)),
                    Err(err) => {
                        // surfaced through the output stream, the queue keeps going
                        if queue_err_tx.unbounded_send(err).is_err() {
                            trace!("controller output is gone, dropping queue error");
                        }
                        None
                    }
                })
            }),
        // 2. requeues decided by earlier reconciles
        requeue_rx.take_until(shutdown.clone()),
    );
    let results = Runner::new(scheduler(requests), concurrency, move |obj_ref: &ObjectRef| {
        let obj_ref = obj_ref.clone();
        reconciler(obj_ref.clone())
            .into_future()
            .map(move |res| (obj_ref, res))
    })
    .stop_on(shutdown.clone())
    // finally, for each completed reconcile call:
    .map(move |(obj_ref, reconciler_result)| {
        let action = match &reconciler_result {
            Ok(action) => {
                error_policy.on_success(&obj_ref);
                action.clone()
            }
            Err(err) => error_policy.on_error(&obj_ref, err),
        };
        // Transmit the requeue request to the scheduler (picked up again at top)
        if let Some(delay) = action.requeue_after() {
            if requeue_tx
                .unbounded_send(ScheduleRequest::requeue(obj_ref.clone(), delay))
                .is_err()
            {
                trace!(object.ref = %obj_ref, "scheduler is shut down, dropping requeue");
            }
        }
        reconciler_result
            .map(|action| (obj_ref.clone(), action))
            .map_err(|err| Error::ReconcilerFailed(err, obj_ref))
    });
    stream::select(
        results,
        queue_err_rx.take_until(shutdown).map(|err| Err(Error::QueueError(err))),
    )
}

/// Controller
///
/// A controller is made up of:
/// - a [`Reconciler`] for the managed kind `K`, together with the store it reads and writes
/// - the store's change feed for `K` (and optionally for owned child kinds)
/// - a default [`ErrorBackoff`] error policy
///
/// All reconcile requests go through an internal scheduler, so every object is reconciled by at
/// most one task at a time while different objects are reconciled in parallel.
///
/// ```no_run
/// use keeper_runtime::{
///     events::{Reporter, TracingRecorder},
///     Controller, ControllerConfig, Outcome, Reconcile, Reconciler, ReconcilerConfig,
///     store::MemoryStore,
/// };
/// # use keeper_core::{Condition, ObjectMeta, ObservedStatus, Resource, HasStatus, Scheme};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Debug, Serialize, Deserialize)]
/// # struct Guestbook { metadata: ObjectMeta, status: Option<GuestbookStatus> }
/// # #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
/// # struct GuestbookStatus { conditions: Vec<Condition>, observed_generation: Option<i64> }
/// # impl ObservedStatus for GuestbookStatus {
/// #     fn conditions(&self) -> &Vec<Condition> { &self.conditions }
/// #     fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
/// #     fn observed_generation(&self) -> Option<i64> { self.observed_generation }
/// #     fn set_observed_generation(&mut self, g: Option<i64>) { self.observed_generation = g }
/// # }
/// # impl Resource for Guestbook {
/// #     const GROUP: &'static str = "webapp.example.com";
/// #     const KIND: &'static str = "Guestbook";
/// #     const PLURAL: &'static str = "guestbooks";
/// #     const VERSION: &'static str = "v1";
/// #     fn meta(&self) -> &ObjectMeta { &self.metadata }
/// #     fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
/// # }
/// # impl HasStatus for Guestbook {
/// #     type Status = GuestbookStatus;
/// #     fn status(&self) -> Option<&GuestbookStatus> { self.status.as_ref() }
/// #     fn status_mut(&mut self) -> &mut Option<GuestbookStatus> { &mut self.status }
/// # }
/// use futures::StreamExt;
/// use std::sync::Arc;
///
/// struct Hooks;
///
/// #[async_trait::async_trait]
/// impl Reconcile<Guestbook> for Hooks {
///     type Error = std::io::Error;
///
///     async fn apply(&self, _book: Arc<Guestbook>) -> Result<Outcome, Self::Error> {
///         // converge child objects here
///         Ok(Outcome::ready("all replicas present"))
///     }
///
///     async fn cleanup(&self, _book: Arc<Guestbook>) -> Result<(), Self::Error> {
///         Ok(())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut scheme = Scheme::new();
///     scheme.register::<Guestbook>()?;
///     let store = Arc::new(MemoryStore::new(Arc::new(scheme)));
///     let recorder = Arc::new(TracingRecorder::new(Reporter::from("guestbook-controller")));
///     let reconciler = Reconciler::new(store, Hooks, recorder, ReconcilerConfig::default());
///     Controller::new(reconciler, ControllerConfig::default())
///         .graceful_shutdown_on(async {
///             let _ = tokio::signal::ctrl_c().await;
///         })
///         .run()
///         .for_each(|res| async move {
///             match res {
///                 Ok(o) => println!("reconciled {:?}", o),
///                 Err(e) => println!("reconcile failed: {}", e),
///             }
///         })
///         .await; // controller does nothing unless polled
///     Ok(())
/// }
/// ```
pub struct Controller<K, S, H>
where
    K: Resource + HasStatus + Clone + Send + Sync + 'static,
    K::Status: ObservedStatus + Clone + PartialEq + Send + Sync,
    S: ResourceStore<K> + Watch + 'static,
    H: Reconcile<K>,
{
    reconciler: Arc<Reconciler<K, S, H>>,
    trigger_selector: SelectAll<BoxStream<'static, Result<ObjectRef, keeper_core::Error>>>,
    graceful_shutdown: Option<BoxFuture<'static, ()>>,
    config: ControllerConfig,
}

impl<K, S, H> Controller<K, S, H>
where
    K: Resource + HasStatus + Clone + Send + Sync + 'static,
    K::Status: ObservedStatus + Clone + PartialEq + Send + Sync,
    S: ResourceStore<K> + Watch + 'static,
    H: Reconcile<K>,
{
    /// Create a Controller for the objects of kind `K` in the reconciler's store
    ///
    /// Every existing `K` is reconciled once on startup, and again whenever it is created,
    /// updated or deleted. Status writes do not trigger reconciles.
    pub fn new(reconciler: Reconciler<K, S, H>, config: ControllerConfig) -> Self {
        let store = reconciler.store().clone();
        // subscribe before listing, so nothing written in between is missed
        let changes = trigger_self::<K, _>(store.changes().map(Ok));
        let existing = stream::once(async move { ResourceStore::<K>::list(&*store).await })
            .map_ok(|objs| {
                stream::iter(
                    objs.into_iter()
                        .map(|obj| Ok::<_, keeper_core::Error>(ObjectRef::from_obj(&obj))),
                )
            })
            .try_flatten();
        let mut trigger_selector = SelectAll::new();
        trigger_selector.push(existing.chain(changes).boxed());
        Self {
            reconciler: Arc::new(reconciler),
            trigger_selector,
            graceful_shutdown: None,
            config,
        }
    }

    /// The reconciler this controller drives
    pub fn reconciler(&self) -> &Arc<Reconciler<K, S, H>> {
        &self.reconciler
    }

    /// Indicate child objects `Child` that `K` owns and be notified when they change
    ///
    /// A change to a `Child` triggers a reconcile of every `K` named in its owner references.
    #[must_use]
    pub fn owns<Child: Resource + 'static>(mut self) -> Self {
        let changes = self.reconciler.store().changes().map(Ok);
        self.trigger_selector
            .push(trigger_owners::<K, Child, _>(changes).boxed());
        self
    }

    /// Trigger a reconcile of the given keys whenever the stream yields them
    ///
    /// Useful for reacting to systems outside of the store.
    #[must_use]
    pub fn reconcile_on(mut self, trigger: impl Stream<Item = ObjectRef> + Send + 'static) -> Self {
        self.trigger_selector.push(trigger.map(Ok).boxed());
        self
    }

    /// Start a graceful shutdown when `trigger` resolves
    ///
    /// Once triggered, no new reconciles are started and the stream returned by
    /// [`run`](Self::run) ends as soon as the running ones have finished.
    /// May be called several times; the first trigger to resolve wins.
    #[must_use]
    pub fn graceful_shutdown_on(mut self, trigger: impl std::future::Future<Output = ()> + Send + 'static) -> Self {
        self.graceful_shutdown = Some(match self.graceful_shutdown.take() {
            None => trigger.boxed(),
            Some(existing) => future::select(existing, trigger.boxed()).map(|_| ()).boxed(),
        });
        self
    }

    /// Consume the Controller and start the applier stream
    ///
    /// Each reconcile runs on its own task; dropping the stream aborts the ones in flight.
    pub fn run(
        self,
    ) -> impl Stream<Item = Result<(ObjectRef, Action), Error<reconciler::Error<H::Error>, keeper_core::Error>>>
    {
        let reconciler = self.reconciler;
        let shutdown = self.graceful_shutdown.unwrap_or_else(|| future::pending().boxed());
        applier(
            move |obj_ref| {
                let reconciler = reconciler.clone();
                CancelableJoinHandle::spawn(
                    async move { reconciler.reconcile(&obj_ref).await },
                    &Handle::current(),
                )
            },
            ErrorBackoff::new(&self.config),
            self.trigger_selector,
            self.config.concurrency,
            shutdown,
        )
    }
}
