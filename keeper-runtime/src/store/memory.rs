use super::{Change, ResourceStore, Watch};
use async_trait::async_trait;
use chrono::Utc;
use futures::{channel::mpsc, stream::BoxStream, StreamExt};
use keeper_core::{
    Error, ErrorResponse, GroupVersionKind, ObjectMeta, ObjectRef, Resource, Result, Scheme,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};
use tracing::trace;

/// A store operation, used to inject failures and to inspect the write log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// [`ResourceStore::get`]
    Get,
    /// [`ResourceStore::list`]
    List,
    /// [`ResourceStore::create`]
    Create,
    /// [`ResourceStore::update`]
    Update,
    /// [`ResourceStore::update_status`]
    UpdateStatus,
    /// [`ResourceStore::delete`]
    Delete,
}

/// A successful write, in the order it happened
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    /// Which write path was used
    pub op: Op,
    /// Kind of the written object
    pub gvk: GroupVersionKind,
    /// Key of the written object
    pub key: ObjectRef,
}

type Key = (GroupVersionKind, Option<String>, String);

/// Number of writes [`MemoryStore::writes`] remembers by default
pub const DEFAULT_WRITE_LOG_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    revision: u64,
    faults: HashMap<Op, VecDeque<ErrorResponse>>,
    writes: VecDeque<Write>,
    write_log_capacity: usize,
    subscribers: Vec<mpsc::UnboundedSender<Change>>,
}

/// An in-memory [`ResourceStore`] with the write semantics of the Kubernetes API server
///
/// Records are kept as JSON and decoded through the shared [`Scheme`], so only registered
/// kinds can be stored. The store:
///
/// - assigns `uid`, `generation` and `resourceVersion` on create,
/// - rejects writes carrying a stale `resourceVersion` with 409 Conflict,
/// - bumps `generation` only when the serialized `spec` changes,
/// - keeps spec and status writes apart (each path ignores the other half of the object),
/// - only marks objects with finalizers as deleting, and removes them once the last finalizer
///   is gone.
#[derive(Clone)]
pub struct MemoryStore {
    scheme: Arc<Scheme>,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// An empty store that accepts the kinds registered in `scheme`
    #[must_use]
    pub fn new(scheme: Arc<Scheme>) -> Self {
        Self {
            scheme,
            state: Arc::new(Mutex::new(State {
                write_log_capacity: DEFAULT_WRITE_LOG_CAPACITY,
                ..State::default()
            })),
        }
    }

    /// Only remember the last `capacity` writes, `0` turns the write log off
    #[must_use]
    pub fn with_write_log(self, capacity: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.write_log_capacity = capacity;
            while state.writes.len() > capacity {
                state.writes.pop_front();
            }
        }
        self
    }

    /// Make the next `op` (on any kind) fail with `err`
    ///
    /// Calls queue up: failing an op twice makes the next two calls fail.
    pub fn fail_next(&self, op: Op, err: ErrorResponse) {
        self.state.lock().faults.entry(op).or_default().push_back(err);
    }

    /// The most recent successful writes, oldest first
    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().writes.iter().cloned().collect()
    }

    /// Number of stored objects across all kinds
    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key<K: Resource>(obj_ref: &ObjectRef) -> Key {
        (K::gvk(), obj_ref.namespace.clone(), obj_ref.name.clone())
    }

    fn describe<K: Resource>(name: &str) -> String {
        format!("{}.{} \"{name}\"", K::PLURAL, K::GROUP)
    }

    fn decode<K>(&self, record: &Value) -> Result<K>
    where
        K: Resource + DeserializeOwned + 'static,
    {
        Ok(self.scheme.decode(record)?)
    }

    fn encode<K>(&self, obj: &K) -> Result<Value>
    where
        K: Resource + Serialize + 'static,
    {
        Ok(self.scheme.encode(obj)?)
    }
}

impl State {
    fn take_fault(&mut self, op: Op) -> Result<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(Error::Api(err)),
            None => Ok(()),
        }
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn record(&mut self, op: Op, key: &Key) {
        if self.write_log_capacity == 0 {
            return;
        }
        if self.writes.len() >= self.write_log_capacity {
            self.writes.pop_front();
        }
        let (gvk, namespace, name) = key.clone();
        let mut obj_ref = ObjectRef::new(&name);
        obj_ref.namespace = namespace;
        self.writes.push_back(Write { op, gvk, key: obj_ref });
    }

    fn notify(&mut self, gvk: &GroupVersionKind, meta: &ObjectMeta, deleted: bool) {
        let change = Change {
            gvk: gvk.clone(),
            meta: meta.clone(),
            deleted,
        };
        self.subscribers
            .retain(|tx| tx.unbounded_send(change.clone()).is_ok());
    }
}

fn meta_of(record: &Value) -> Result<ObjectMeta> {
    match record.get("metadata") {
        Some(meta) => Ok(serde_json::from_value(meta.clone())?),
        None => Ok(ObjectMeta::default()),
    }
}

fn put(record: &mut Value, field: &str, value: Value) -> Result<()> {
    let map = record
        .as_object_mut()
        .ok_or_else(|| ErrorResponse::invalid("record is not an object"))?;
    if value.is_null() {
        map.remove(field);
    } else {
        map.insert(field.to_string(), value);
    }
    Ok(())
}

fn check_version(stored: &ObjectMeta, incoming: &ObjectMeta, what: &str) -> Result<()> {
    match &incoming.resource_version {
        Some(rv) if Some(rv) != stored.resource_version.as_ref() => {
            Err(ErrorResponse::conflict(what).into())
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore
where
    K: Resource + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectRef) -> Result<K> {
        let record = {
            let mut state = self.state.lock();
            state.take_fault(Op::Get)?;
            state.objects.get(&Self::key::<K>(key)).cloned()
        };
        match record {
            Some(record) => self.decode(&record),
            None => Err(ErrorResponse::not_found(Self::describe::<K>(&key.name)).into()),
        }
    }

    async fn list(&self) -> Result<Vec<K>> {
        let records = {
            let mut state = self.state.lock();
            state.take_fault(Op::List)?;
            let gvk = K::gvk();
            state
                .objects
                .iter()
                .filter(|((kind, ..), _)| *kind == gvk)
                .map(|(_, record)| record.clone())
                .collect::<Vec<_>>()
        };
        records.iter().map(|r| self.decode(r)).collect()
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut record = self.encode(obj)?;
        let mut meta = obj.meta().clone();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| ErrorResponse::invalid("metadata.name: Required value"))?;
        let key = (K::gvk(), meta.namespace.clone(), name.clone());

        let mut state = self.state.lock();
        state.take_fault(Op::Create)?;
        if state.objects.contains_key(&key) {
            return Err(ErrorResponse::already_exists(Self::describe::<K>(&name)).into());
        }
        let revision = state.next_revision();
        meta.uid = Some(format!("{:08x}-{revision}", state.objects.len() + 1));
        meta.generation = Some(1);
        meta.resource_version = Some(revision);
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;
        put(&mut record, "metadata", serde_json::to_value(&meta)?)?;
        put(&mut record, "status", Value::Null)?;

        let created = self.decode(&record)?;
        state.objects.insert(key.clone(), record);
        state.record(Op::Create, &key);
        state.notify(&key.0, &meta, false);
        trace!(object = %Self::describe::<K>(&name), "created");
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let incoming_record = self.encode(obj)?;
        let incoming = obj.meta();
        let obj_ref = ObjectRef::from_meta(incoming);
        let key = Self::key::<K>(&obj_ref);
        let what = Self::describe::<K>(&obj_ref.name);

        let mut state = self.state.lock();
        state.take_fault(Op::Update)?;
        let stored_record = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ErrorResponse::not_found(&what))?;
        let stored = meta_of(&stored_record)?;
        check_version(&stored, incoming, &what)?;

        let incoming_finalizers = incoming.finalizers.clone().unwrap_or_default();
        if stored.deletion_timestamp.is_some() {
            let stored_finalizers = stored.finalizers.clone().unwrap_or_default();
            if incoming_finalizers.iter().any(|f| !stored_finalizers.contains(f)) {
                return Err(ErrorResponse::invalid(format!(
                    "{what}: finalizers cannot be added to an object that is being deleted"
                ))
                .into());
            }
        }

        let spec_changed = incoming_record.get("spec") != stored_record.get("spec");
        let mut meta = ObjectMeta {
            uid: stored.uid.clone(),
            generation: stored.generation,
            creation_timestamp: stored.creation_timestamp,
            deletion_timestamp: stored.deletion_timestamp,
            ..incoming.clone()
        };
        if spec_changed {
            meta.generation = Some(stored.generation.unwrap_or_default() + 1);
        }
        meta.resource_version = Some(state.next_revision());

        let mut record = incoming_record;
        put(&mut record, "metadata", serde_json::to_value(&meta)?)?;
        put(
            &mut record,
            "status",
            stored_record.get("status").cloned().unwrap_or(Value::Null),
        )?;
        let updated = self.decode(&record)?;

        state.record(Op::Update, &key);
        if meta.deletion_timestamp.is_some() && incoming_finalizers.is_empty() {
            state.objects.remove(&key);
            state.notify(&key.0, &meta, true);
            trace!(object = %what, "last finalizer removed, object deleted");
        } else {
            state.objects.insert(key.clone(), record);
            state.notify(&key.0, &meta, false);
        }
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let incoming_record = self.encode(obj)?;
        let incoming = obj.meta();
        let obj_ref = ObjectRef::from_meta(incoming);
        let key = Self::key::<K>(&obj_ref);
        let what = Self::describe::<K>(&obj_ref.name);

        let mut state = self.state.lock();
        state.take_fault(Op::UpdateStatus)?;
        let mut record = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ErrorResponse::not_found(&what))?;
        let mut meta = meta_of(&record)?;
        check_version(&meta, incoming, &what)?;

        meta.resource_version = Some(state.next_revision());
        put(&mut record, "metadata", serde_json::to_value(&meta)?)?;
        put(
            &mut record,
            "status",
            incoming_record.get("status").cloned().unwrap_or(Value::Null),
        )?;
        let updated = self.decode(&record)?;
        state.objects.insert(key.clone(), record);
        state.record(Op::UpdateStatus, &key);
        // status writes are deliberately invisible to watchers
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectRef) -> Result<()> {
        let key = Self::key::<K>(key);
        let what = Self::describe::<K>(&key.2);

        let mut state = self.state.lock();
        state.take_fault(Op::Delete)?;
        let mut record = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ErrorResponse::not_found(&what))?;
        let mut meta = meta_of(&record)?;

        if meta.finalizers.as_ref().is_none_or(Vec::is_empty) {
            state.objects.remove(&key);
            state.record(Op::Delete, &key);
            state.notify(&key.0, &meta, true);
            return Ok(());
        }
        if meta.deletion_timestamp.is_some() {
            // already terminating, waiting on finalizers
            return Ok(());
        }
        meta.deletion_timestamp = Some(Utc::now());
        meta.generation = Some(meta.generation.unwrap_or_default() + 1);
        meta.resource_version = Some(state.next_revision());
        put(&mut record, "metadata", serde_json::to_value(&meta)?)?;
        state.objects.insert(key.clone(), record);
        state.record(Op::Delete, &key);
        state.notify(&key.0, &meta, false);
        Ok(())
    }
}

impl Watch for MemoryStore {
    fn changes(&self) -> BoxStream<'static, Change> {
        let (tx, rx) = mpsc::unbounded();
        self.state.lock().subscribers.push(tx);
        rx.boxed()
    }
}
