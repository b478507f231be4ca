//! The resource store collaborator
//!
//! A [`ResourceStore`] is the only way the runtime reads and writes managed resources.
//! It has two write paths on purpose:
//!
//! - [`ResourceStore::update`] persists spec and metadata (finalizers, labels, owners)
//! - [`ResourceStore::update_status`] persists the status and nothing else
//!
//! Both check `metadata.resourceVersion` and fail with a 409 Conflict if the object moved on
//! in the meantime. A conflict must be answered by re-fetching, never by overwriting.
use async_trait::async_trait;
use futures::stream::BoxStream;
use keeper_core::{GroupVersionKind, ObjectMeta, ObjectRef, Resource, Result};

mod memory;
pub use memory::{MemoryStore, Op, Write, DEFAULT_WRITE_LOG_CAPACITY};

/// Typed access to persisted resources of kind `K`
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Fetch an object, failing with a 404 if it does not exist
    async fn get(&self, key: &ObjectRef) -> Result<K>;

    /// Fetch an object, mapping a 404 to `None`
    async fn get_opt(&self, key: &ObjectRef) -> Result<Option<K>> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// All objects of the kind
    async fn list(&self) -> Result<Vec<K>>;

    /// Persist a new object
    async fn create(&self, obj: &K) -> Result<K>;

    /// Persist spec and metadata changes; any status on `obj` is ignored
    async fn update(&self, obj: &K) -> Result<K>;

    /// Persist the status; spec and metadata on `obj` are ignored
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Request deletion
    ///
    /// Objects with finalizers are only marked with a `deletionTimestamp`; they disappear
    /// once an [`update`](ResourceStore::update) removes the last finalizer.
    async fn delete(&self, key: &ObjectRef) -> Result<()>;
}

/// A change to a stored object, as seen by watchers
#[derive(Clone, Debug)]
pub struct Change {
    /// Kind of the changed object
    pub gvk: GroupVersionKind,
    /// Metadata of the object after the change
    pub meta: ObjectMeta,
    /// Whether the object is now gone
    pub deleted: bool,
}

impl Change {
    /// Whether the change concerns kind `K`
    pub fn is<K: Resource>(&self) -> bool {
        self.gvk == K::gvk()
    }
}

/// A source of [`Change`]s
///
/// Status writes are not reported: only creation, spec/metadata updates and deletion
/// produce a change, so writing status can never re-trigger reconciliation.
pub trait Watch: Send + Sync {
    /// Subscribe to every change made from now on
    fn changes(&self) -> BoxStream<'static, Change>;
}
