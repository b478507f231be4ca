//! The reconcile-with-finalizer state machine
//!
//! [`Reconciler::reconcile`] takes one Reconcile Request through these states:
//!
//! | State | Entered when | Action | Exit |
//! |---|---|---|---|
//! | NotFound | the object is gone | none | done |
//! | Deleting, no finalizer | `deletionTimestamp` set, marker absent | none | done |
//! | Cleanup | `deletionTimestamp` set, marker present | [`Reconcile::cleanup`] | marker removed, or retried |
//! | Attach | not deleting, marker absent | add the marker | requeue immediately |
//! | Apply | not deleting, marker present | [`Reconcile::apply`], then status | requeue per [`Outcome`] |
//!
//! Spec and metadata are only written through [`ResourceStore::update`] (the finalizer marker),
//! the status only through [`ResourceStore::update_status`].
use crate::{
    config::ReconcilerConfig,
    controller::Action,
    events::{EventRecorder, NewEvent},
    finalizer::{self, finalizer},
    store::ResourceStore,
};
use async_trait::async_trait;
use keeper_core::{
    conditions::{DEGRADED, READY},
    Condition, ConditionStatus, Conditions, HasStatus, ObjectRef, ObservedStatus, Resource, ResourceExt,
};
use std::{error::Error as StdError, marker::PhantomData, sync::Arc};
use thiserror::Error;
use tracing::{debug, warn};

/// Reason of the `Ready` condition after a successful apply
pub const REASON_RECONCILED: &str = "Reconciled";
/// Reason of the `Degraded=False` condition
pub const REASON_AS_EXPECTED: &str = "AsExpected";

const ACTION_RECONCILE: &str = "Reconcile";
const ACTION_CLEANUP: &str = "Cleanup";

/// The business logic of a controller
///
/// Both hooks must be idempotent: they run again after restarts, failures, spec changes and
/// every drift interval. `cleanup` must also tolerate `apply` never having run.
#[async_trait]
pub trait Reconcile<K>: Send + Sync + 'static
where
    K: Send + Sync + 'static,
{
    /// Error of a hard failure, retried with backoff
    type Error: StdError + Send + Sync + 'static;

    /// Converge the children of `obj` towards its spec
    async fn apply(&self, obj: Arc<K>) -> Result<Outcome, Self::Error>;

    /// Release everything `obj` owns outside the store, before it is deleted
    async fn cleanup(&self, obj: Arc<K>) -> Result<(), Self::Error>;
}

/// How far [`Reconcile::apply`] got, when it did not fail outright
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Actual state matches the spec
    Ready {
        /// Shown on the `Ready` condition
        message: String,
    },
    /// Not there yet, try again after the retry interval
    Retry {
        /// CamelCase reason shown on the `Ready` condition
        reason: String,
        /// Shown on the `Ready` condition
        message: String,
    },
    /// The spec can not be satisfied; wait for it to change
    Invalid {
        /// CamelCase reason shown on the `Ready` and `Degraded` conditions
        reason: String,
        /// Shown on the `Ready` and `Degraded` conditions
        message: String,
    },
}

impl Outcome {
    /// See [`Outcome::Ready`]
    pub fn ready(message: impl Into<String>) -> Self {
        Self::Ready {
            message: message.into(),
        }
    }

    /// See [`Outcome::Retry`]
    pub fn retry(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// See [`Outcome::Invalid`]
    pub fn invalid(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Errors from [`Reconciler::reconcile`]
#[derive(Debug, Error)]
pub enum Error<E: StdError + 'static> {
    /// Reading the object failed for a reason other than it being gone
    #[error("failed to fetch object: {0}")]
    FetchFailed(#[source] keeper_core::Error),
    /// A hook or a finalizer write failed
    #[error(transparent)]
    Finalizer(finalizer::Error<E>),
    /// Persisting the status failed
    #[error("failed to update status: {0}")]
    StatusUpdateFailed(#[source] keeper_core::Error),
}

impl<E: StdError + 'static> Error<E> {
    /// Whether a write lost an optimistic concurrency race, so a fresh fetch is all it takes
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::FetchFailed(_) => false,
            Error::Finalizer(err) => err.is_conflict(),
            Error::StatusUpdateFailed(err) => err.is_conflict(),
        }
    }
}

/// Failures inside the finalizer callback
#[derive(Debug, Error)]
enum HookError<E: StdError + 'static> {
    #[error(transparent)]
    Hook(E),
    #[error(transparent)]
    Status(keeper_core::Error),
}

fn flatten<E: StdError + 'static>(err: finalizer::Error<HookError<E>>) -> Error<E> {
    use finalizer::Error as F;
    match err {
        F::ApplyFailed(HookError::Hook(err)) => Error::Finalizer(F::ApplyFailed(err)),
        F::CleanupFailed(HookError::Hook(err)) => Error::Finalizer(F::CleanupFailed(err)),
        F::ApplyFailed(HookError::Status(err)) | F::CleanupFailed(HookError::Status(err)) => {
            Error::StatusUpdateFailed(err)
        }
        F::AddFinalizer(err) => Error::Finalizer(F::AddFinalizer(err)),
        F::RemoveFinalizer(err) => Error::Finalizer(F::RemoveFinalizer(err)),
        F::UnnamedObject => Error::Finalizer(F::UnnamedObject),
        F::InvalidFinalizer => Error::Finalizer(F::InvalidFinalizer),
    }
}

/// Drives the hooks `H` for objects of kind `K` kept in the store `S`
///
/// Holds no state between calls; everything is read back from the store.
pub struct Reconciler<K, S, H> {
    store: Arc<S>,
    hooks: H,
    recorder: Arc<dyn EventRecorder>,
    config: Arc<ReconcilerConfig>,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S, H> Reconciler<K, S, H>
where
    K: Resource + HasStatus + Clone + Send + Sync + 'static,
    K::Status: ObservedStatus + Clone + PartialEq + Send + Sync,
    S: ResourceStore<K> + 'static,
    H: Reconcile<K>,
{
    /// Reconcile `K`s in `store` with `hooks`, publishing events to `recorder`
    pub fn new(store: Arc<S>, hooks: H, recorder: Arc<dyn EventRecorder>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            hooks,
            recorder,
            config: Arc::new(config),
            _kind: PhantomData,
        }
    }

    /// The store objects are read from and written to
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The business hooks
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// The settings in use
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one reconciliation of `request`
    ///
    /// # Errors
    ///
    /// Hard failures of the hooks and failed store calls, including write conflicts.
    /// A missing object is not an error.
    #[tracing::instrument(skip_all, fields(object.ref = %request))]
    pub async fn reconcile(&self, request: &ObjectRef) -> Result<Action, Error<H::Error>> {
        let Some(obj) = self.store.get_opt(request).await.map_err(Error::FetchFailed)? else {
            debug!("object is gone, nothing to do");
            return Ok(Action::await_change());
        };
        finalizer(&*self.store, &self.config.finalizer, Arc::new(obj), |event| async move {
            match event {
                finalizer::Event::Apply(obj) => self.apply(obj).await,
                finalizer::Event::Cleanup(obj) => self.cleanup(obj).await,
            }
        })
        .await
        .map_err(flatten)
    }

    async fn apply(&self, obj: Arc<K>) -> Result<Action, HookError<H::Error>> {
        let outcome = self.hooks.apply(obj.clone()).await.map_err(HookError::Hook)?;
        let generation = obj.generation();
        let (action, ready, degraded, event) = match outcome {
            Outcome::Ready { message } => (
                Action::requeue(self.config.drift_interval.as_std()),
                Condition::new(READY, ConditionStatus::True, REASON_RECONCILED, &message, generation),
                Condition::new(DEGRADED, ConditionStatus::False, REASON_AS_EXPECTED, "", generation),
                NewEvent::normal(ACTION_RECONCILE, READY, message),
            ),
            Outcome::Retry { reason, message } => (
                Action::requeue(self.config.retry_interval.as_std()),
                Condition::new(READY, ConditionStatus::False, &reason, &message, generation),
                Condition::new(DEGRADED, ConditionStatus::False, REASON_AS_EXPECTED, "", generation),
                NewEvent::warning(ACTION_RECONCILE, &reason, message),
            ),
            Outcome::Invalid { reason, message } => (
                Action::await_change(),
                Condition::new(READY, ConditionStatus::False, &reason, &message, generation),
                Condition::new(DEGRADED, ConditionStatus::True, &reason, &message, generation),
                NewEvent::warning(ACTION_RECONCILE, &reason, message),
            ),
        };

        let mut status = obj.status().cloned().unwrap_or_default();
        status.conditions_mut().set(ready);
        status.conditions_mut().set(degraded);
        status.set_observed_generation(Some(generation));
        if obj.status() == Some(&status) {
            debug!("status unchanged");
            return Ok(action);
        }

        let mut updated = (*obj).clone();
        *updated.status_mut() = Some(status);
        self.store
            .update_status(&updated)
            .await
            .map_err(HookError::Status)?;
        debug!(generation, reason = %event.reason, "status updated");
        self.publish(&*obj, event).await;
        Ok(action)
    }

    async fn cleanup(&self, obj: Arc<K>) -> Result<Action, HookError<H::Error>> {
        match self.hooks.cleanup(obj.clone()).await {
            Ok(()) => {
                self.publish(&*obj, NewEvent::normal(ACTION_CLEANUP, "CleanedUp", ""))
                    .await;
                Ok(Action::await_change())
            }
            Err(err) => {
                self.publish(&*obj, NewEvent::warning(ACTION_CLEANUP, "CleanupFailed", err.to_string()))
                    .await;
                Err(HookError::Hook(err))
            }
        }
    }

    async fn publish(&self, obj: &K, event: NewEvent) {
        if let Err(err) = self.recorder.publish(&obj.object_ref(), event).await {
            warn!(error = %err, "failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Outcome, Reconcile, Reconciler};
    use crate::{
        config::ReconcilerConfig,
        controller::Action,
        events::{EventType, MemoryRecorder},
        finalizer,
        store::{MemoryStore, Op, ResourceStore},
    };
    use async_trait::async_trait;
    use keeper_core::{
        conditions::{DEGRADED, READY},
        Condition, Conditions, ErrorResponse, HasStatus, ObjectMeta, ObjectRef, ObservedStatus, Resource,
        ResourceExt, Scheme,
    };
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{sync::Arc, time::Duration};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Gadget {
        metadata: ObjectMeta,
        spec: GadgetSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<GadgetStatus>,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct GadgetSpec {
        mode: String,
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct GadgetStatus {
        conditions: Vec<Condition>,
        observed_generation: Option<i64>,
    }

    impl ObservedStatus for GadgetStatus {
        fn conditions(&self) -> &Vec<Condition> {
            &self.conditions
        }

        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.conditions
        }

        fn observed_generation(&self) -> Option<i64> {
            self.observed_generation
        }

        fn set_observed_generation(&mut self, generation: Option<i64>) {
            self.observed_generation = generation;
        }
    }

    impl Resource for Gadget {
        const GROUP: &'static str = "test.keeper.dev";
        const KIND: &'static str = "Gadget";
        const PLURAL: &'static str = "gadgets";
        const VERSION: &'static str = "v1";

        fn meta(&self) -> &ObjectMeta {
            &self.metadata
        }

        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
    }

    impl HasStatus for Gadget {
        type Status = GadgetStatus;

        fn status(&self) -> Option<&GadgetStatus> {
            self.status.as_ref()
        }

        fn status_mut(&mut self) -> &mut Option<GadgetStatus> {
            &mut self.status
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("backend exploded")]
    struct Exploded;

    /// Maps `spec.mode` straight to an outcome
    #[derive(Default)]
    struct ModeHooks {
        applied: Mutex<usize>,
    }

    #[async_trait]
    impl Reconcile<Gadget> for ModeHooks {
        type Error = Exploded;

        async fn apply(&self, obj: Arc<Gadget>) -> Result<Outcome, Exploded> {
            *self.applied.lock() += 1;
            match obj.spec.mode.as_str() {
                "ready" => Ok(Outcome::ready("all good")),
                "slow" => Ok(Outcome::retry("Provisioning", "still provisioning")),
                "broken" => Ok(Outcome::invalid("BadMode", "mode is not supported")),
                _ => Err(Exploded),
            }
        }

        async fn cleanup(&self, _obj: Arc<Gadget>) -> Result<(), Exploded> {
            Ok(())
        }
    }

    type TestReconciler = Reconciler<Gadget, MemoryStore, ModeHooks>;

    async fn setup(mode: &str) -> (TestReconciler, MemoryRecorder, ObjectRef) {
        let mut scheme = Scheme::new();
        scheme.register::<Gadget>().unwrap();
        let store = Arc::new(MemoryStore::new(Arc::new(scheme)));
        let gadget = Gadget {
            metadata: ObjectMeta {
                name: Some("g".into()),
                namespace: Some("default".into()),
                ..ObjectMeta::default()
            },
            spec: GadgetSpec { mode: mode.into() },
            status: None,
        };
        store.create(&gadget).await.unwrap();
        let recorder = MemoryRecorder::new();
        let reconciler = Reconciler::new(
            store,
            ModeHooks::default(),
            Arc::new(recorder.clone()),
            ReconcilerConfig::with_finalizer("test.keeper.dev/cleanup"),
        );
        (reconciler, recorder, ObjectRef::new("g").within("default"))
    }

    async fn stored(reconciler: &TestReconciler, key: &ObjectRef) -> Gadget {
        reconciler.store().get(key).await.unwrap()
    }

    #[tokio::test]
    async fn retry_outcome_is_not_an_error() {
        let (reconciler, recorder, key) = setup("slow").await;
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::requeue_now());
        let action = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));

        let status = stored(&reconciler, &key).await.status.unwrap();
        let ready = status.conditions.find(READY).unwrap();
        assert!(status.conditions.is_false(READY));
        assert_eq!(ready.reason, "Provisioning");
        assert!(status.conditions.is_false(DEGRADED));
        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.event_type, EventType::Warning);
        assert_eq!(events[0].event.reason, "Provisioning");
    }

    #[tokio::test]
    async fn invalid_outcome_degrades_and_waits_for_a_change() {
        let (reconciler, _recorder, key) = setup("broken").await;
        reconciler.reconcile(&key).await.unwrap();
        let action = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = stored(&reconciler, &key).await.status.unwrap();
        assert!(status.conditions.is_true(DEGRADED));
        assert!(status.conditions.is_false(READY));
        assert_eq!(status.conditions.find(DEGRADED).unwrap().reason, "BadMode");
    }

    #[tokio::test]
    async fn hard_failures_skip_the_status_write() {
        let (reconciler, recorder, key) = setup("explode").await;
        reconciler.reconcile(&key).await.unwrap();
        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, Error::Finalizer(finalizer::Error::ApplyFailed(Exploded))));
        assert!(!err.is_conflict());
        assert!(stored(&reconciler, &key).await.status.is_none());
        assert!(recorder.events().is_empty());
        let status_writes = reconciler
            .store()
            .writes()
            .into_iter()
            .filter(|w| w.op == Op::UpdateStatus)
            .count();
        assert_eq!(status_writes, 0);
    }

    #[tokio::test]
    async fn status_conflicts_are_reported_as_conflicts() {
        let (reconciler, _recorder, key) = setup("ready").await;
        reconciler.reconcile(&key).await.unwrap();
        reconciler
            .store()
            .fail_next(Op::UpdateStatus, ErrorResponse::conflict("gadgets \"g\""));
        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, Error::StatusUpdateFailed(_)));
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn failed_event_publishing_does_not_fail_the_reconcile() {
        let (reconciler, recorder, key) = setup("ready").await;
        reconciler.reconcile(&key).await.unwrap();
        recorder.fail_next(1);
        let action = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        assert!(stored(&reconciler, &key).await.status.unwrap().conditions.is_true(READY));
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn fetch_failures_are_surfaced() {
        let (reconciler, _recorder, key) = setup("ready").await;
        reconciler
            .store()
            .fail_next(Op::Get, ErrorResponse::unavailable("store is down"));
        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, Error::FetchFailed(_)));
        assert_eq!(*reconciler.hooks().applied.lock(), 0);
        let gadget = stored(&reconciler, &key).await;
        assert!(!gadget.has_finalizer("test.keeper.dev/cleanup"));
    }
}
