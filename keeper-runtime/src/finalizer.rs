//! Finalizer helper for [`Reconciler`](crate::Reconciler)s
use crate::{controller::Action, store::ResourceStore};
use futures::{TryFuture, TryFutureExt};
use keeper_core::{Resource, ResourceExt};
use std::{error::Error as StdError, sync::Arc};
use thiserror::Error;
use tracing::debug;

/// Errors from [`finalizer`]
#[derive(Debug, Error)]
pub enum Error<ReconcileErr>
where
    ReconcileErr: StdError + 'static,
{
    /// [`Event::Apply`] failed
    #[error("failed to apply object: {0}")]
    ApplyFailed(#[source] ReconcileErr),
    /// [`Event::Cleanup`] failed, the finalizer was kept
    #[error("failed to clean up object: {0}")]
    CleanupFailed(#[source] ReconcileErr),
    /// Persisting the added finalizer failed
    #[error("failed to add finalizer: {0}")]
    AddFinalizer(#[source] keeper_core::Error),
    /// Persisting the removed finalizer failed
    #[error("failed to remove finalizer: {0}")]
    RemoveFinalizer(#[source] keeper_core::Error),
    /// The object carries no name, so it cannot be written back
    #[error("object has no name")]
    UnnamedObject,
    /// The finalizer name is empty or contains whitespace
    #[error("invalid finalizer")]
    InvalidFinalizer,
}

impl<E: StdError + 'static> Error<E> {
    /// Whether the finalizer write lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::AddFinalizer(err) | Error::RemoveFinalizer(err) => err.is_conflict(),
            _ => false,
        }
    }
}

struct FinalizerState {
    has_finalizer: bool,
    is_deleting: bool,
}

impl FinalizerState {
    fn for_object<K: Resource>(obj: &K, finalizer_name: &str) -> Self {
        Self {
            has_finalizer: obj.has_finalizer(finalizer_name),
            is_deleting: obj.is_deleting(),
        }
    }
}

/// Reconcile an object in a way that requires cleanup before an object can be deleted.
///
/// It does this by managing a `metadata.finalizers` entry, which prevents the store
/// from deleting the object before the cleanup is done.
///
/// # Expected Flow
///
/// 1. User creates object
/// 2. Reconciler sees object
/// 3. `finalizer` adds `finalizer_name` to `metadata.finalizers` and asks to be requeued
/// 4. Reconciler sees updated object
/// 5. `finalizer` runs [`Event::Apply`]
/// 6. User updates object
/// 7. Reconciler sees updated object
/// 8. `finalizer` runs [`Event::Apply`]
/// 9. User deletes object
/// 10. Reconciler sees deleting object
/// 11. `finalizer` runs [`Event::Cleanup`]
/// 12. `finalizer` removes `finalizer_name` from `metadata.finalizers`
/// 13. The store sees that all finalizers are gone and finally deletes the object
///
/// # Guarantees
///
/// If [`Event::Apply`] is ever started then [`Event::Cleanup`] must succeed before the object deletion completes.
///
/// # Assumptions
///
/// `finalizer_name` must be unique among the controllers interacting with the object
///
/// [`Event::Apply`] and [`Event::Cleanup`] must both be idempotent, and tolerate being executed several times (even if previously cancelled).
///
/// [`Event::Cleanup`] must tolerate [`Event::Apply`] never having ran at all, or never having succeeded. Keep in mind that
/// even infallible `.await`s are cancellation points.
///
/// # Caveats
///
/// Object deletes will get stuck while the controller is not running, or if `cleanup` fails for some reason.
///
/// `reconcile` should take the object that the [`Event`] contains, rather than trying to reuse `obj`, since it may have been updated.
///
/// # Errors
///
/// [`Event::Apply`] and [`Event::Cleanup`] are both fallible, their errors are passed through as [`Error::ApplyFailed`]
/// and [`Error::CleanupFailed`], respectively.
///
/// In addition, adding and removing the finalizer itself may fail. Both writes carry the `resourceVersion`
/// of `obj`, so if anyone else wrote the object in the meantime the write fails with a conflict instead of
/// clobbering their change.
pub async fn finalizer<K, S, ReconcileFut>(
    store: &S,
    finalizer_name: &str,
    obj: Arc<K>,
    reconcile: impl FnOnce(Event<K>) -> ReconcileFut,
) -> Result<Action, Error<ReconcileFut::Error>>
where
    K: Resource + Clone + Send + Sync + 'static,
    S: ResourceStore<K> + ?Sized,
    ReconcileFut: TryFuture<Ok = Action>,
    ReconcileFut::Error: StdError + 'static,
{
    if finalizer_name.is_empty() || finalizer_name.chars().any(char::is_whitespace) {
        return Err(Error::InvalidFinalizer);
    }
    match FinalizerState::for_object(&*obj, finalizer_name) {
        FinalizerState {
            has_finalizer: true,
            is_deleting: false,
        } => reconcile(Event::Apply(obj))
            .into_future()
            .await
            .map_err(Error::ApplyFailed),
        FinalizerState {
            has_finalizer: true,
            is_deleting: true,
        } => {
            // Cleanup reconciliation must succeed before it's safe to remove the finalizer
            let mut released = (*obj).clone();
            if released.meta().name.is_none() {
                return Err(Error::UnnamedObject);
            }
            let action = reconcile(Event::Cleanup(obj))
                .into_future()
                .await
                // Short-circuit, so that we keep the finalizer if cleanup fails
                .map_err(Error::CleanupFailed)?;
            released.finalizers_mut().retain(|f| f != finalizer_name);
            store.update(&released).await.map_err(Error::RemoveFinalizer)?;
            debug!(finalizer = finalizer_name, "removed finalizer");
            Ok(action)
        }
        FinalizerState {
            has_finalizer: false,
            is_deleting: false,
        } => {
            // Finalizer must be added before it's safe to run an `Apply` reconciliation
            let mut claimed = (*obj).clone();
            if claimed.meta().name.is_none() {
                return Err(Error::UnnamedObject);
            }
            claimed.finalizers_mut().push(finalizer_name.to_string());
            store.update(&claimed).await.map_err(Error::AddFinalizer)?;
            debug!(finalizer = finalizer_name, "added finalizer");
            Ok(Action::requeue_now())
        }
        FinalizerState {
            has_finalizer: false,
            is_deleting: true,
        } => {
            // Our work here is done
            Ok(Action::await_change())
        }
    }
}

/// A representation of an action that should be taken by a reconciler.
pub enum Event<K> {
    /// The reconciler should ensure that the actual state matches the state desired in the object.
    ///
    /// This must be idempotent, since it may be recalled if, for example (this list is non-exhaustive):
    ///
    /// - The controller is restarted
    /// - The object is updated
    /// - The reconciliation fails
    /// - The drift interval elapses
    Apply(Arc<K>),
    /// The object is being deleted, and the reconciler should remove all resources that it owns.
    ///
    /// This must be idempotent, since it may be recalled if, for example (this list is non-exhaustive):
    ///
    /// - The controller is restarted while the deletion is in progress
    /// - The reconciliation fails
    /// - Another finalizer was removed in the meantime
    Cleanup(Arc<K>),
}
