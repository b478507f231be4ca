//! A replicated app resource and a fake backend that "runs" its replicas
#![allow(dead_code)]
use async_trait::async_trait;
use keeper_core::{
    Condition, HasSpec, HasStatus, ObjectMeta, ObjectRef, ObservedStatus, OwnerReference, Resource,
    ResourceExt, Scheme,
};
use keeper_runtime::{
    events::MemoryRecorder,
    store::{MemoryStore, ResourceStore},
    Outcome, Reconcile, Reconciler, ReconcilerConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Instant;

pub const FINALIZER: &str = "apps.keeper.dev/finalizer";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct App {
    pub metadata: ObjectMeta,
    pub spec: AppSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AppStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub replicas: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ObservedStatus for AppStatus {
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

impl Resource for App {
    const GROUP: &'static str = "apps.keeper.dev";
    const KIND: &'static str = "App";
    const PLURAL: &'static str = "apps";
    const VERSION: &'static str = "v1";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl HasSpec for App {
    type Spec = AppSpec;

    fn spec(&self) -> &AppSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut AppSpec {
        &mut self.spec
    }
}

impl HasStatus for App {
    type Status = AppStatus;

    fn status(&self) -> Option<&AppStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<AppStatus> {
        &mut self.status
    }
}

/// A child record owned by an [`App`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page {
    pub metadata: ObjectMeta,
}

impl Resource for Page {
    const GROUP: &'static str = "apps.keeper.dev";
    const KIND: &'static str = "Page";
    const PLURAL: &'static str = "pages";
    const VERSION: &'static str = "v1";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, thiserror::Error)]
#[error("backend unavailable")]
pub struct BackendDown;

/// Something the backend did outside the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideEffect {
    pub app: String,
    pub what: &'static str,
    /// Whether the app carried the finalizer in the store when it happened
    pub finalizer_persisted: bool,
}

/// Runs `spec.replicas` copies of each app, outside the store
pub struct Backend {
    store: Arc<MemoryStore>,
    pub running: Mutex<BTreeMap<String, i32>>,
    pub side_effects: Mutex<Vec<SideEffect>>,
    pub apply_calls: Mutex<Vec<Instant>>,
    apply_failures: Mutex<usize>,
    cleanup_failures: Mutex<usize>,
}

impl Backend {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            running: Mutex::default(),
            side_effects: Mutex::default(),
            apply_calls: Mutex::default(),
            apply_failures: Mutex::new(0),
            cleanup_failures: Mutex::new(0),
        }
    }

    pub fn fail_apply(&self, times: usize) {
        *self.apply_failures.lock() = times;
    }

    pub fn fail_cleanup(&self, times: usize) {
        *self.cleanup_failures.lock() = times;
    }

    async fn record(&self, app: &App, what: &'static str) {
        let stored: Option<App> = self.store.get_opt(&ObjectRef::from_obj(app)).await.ok().flatten();
        self.side_effects.lock().push(SideEffect {
            app: app.name_any(),
            what,
            finalizer_persisted: stored.is_some_and(|s| s.has_finalizer(FINALIZER)),
        });
    }

    fn take_failure(counter: &Mutex<usize>) -> bool {
        let mut left = counter.lock();
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl Reconcile<App> for Backend {
    type Error = BackendDown;

    async fn apply(&self, app: Arc<App>) -> Result<Outcome, BackendDown> {
        self.apply_calls.lock().push(Instant::now());
        if Self::take_failure(&self.apply_failures) {
            return Err(BackendDown);
        }
        let replicas = app.spec().replicas;
        if replicas < 0 {
            return Ok(Outcome::invalid("InvalidReplicas", "spec.replicas must not be negative"));
        }
        let name = app.name_any();
        let current = self.running.lock().get(&name).copied();
        if current != Some(replicas) {
            self.record(&app, "scale").await;
            self.running.lock().insert(name, replicas);
        }
        Ok(Outcome::ready(format!("{replicas} replicas running")))
    }

    async fn cleanup(&self, app: Arc<App>) -> Result<(), BackendDown> {
        if Self::take_failure(&self.cleanup_failures) {
            return Err(BackendDown);
        }
        if self.running.lock().remove(&app.name_any()).is_some() {
            self.record(&app, "stop").await;
        }
        Ok(())
    }
}

pub type AppReconciler = Reconciler<App, MemoryStore, Backend>;

pub fn store() -> Arc<MemoryStore> {
    let mut scheme = Scheme::new();
    scheme.register::<App>().unwrap();
    scheme.register::<Page>().unwrap();
    Arc::new(MemoryStore::new(Arc::new(scheme)))
}

pub fn reconciler(store: Arc<MemoryStore>, recorder: MemoryRecorder) -> AppReconciler {
    Reconciler::new(
        store.clone(),
        Backend::new(store),
        Arc::new(recorder),
        ReconcilerConfig::with_finalizer(FINALIZER),
    )
}

pub fn app(name: &str, replicas: i32) -> App {
    App {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            ..ObjectMeta::default()
        },
        spec: AppSpec { replicas },
        status: None,
    }
}

pub fn page_of(owner: &App, name: &str) -> Page {
    Page {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: owner.namespace(),
            owner_references: Some(owner.controller_owner_ref().into_iter().collect::<Vec<OwnerReference>>()),
            ..ObjectMeta::default()
        },
    }
}

pub fn key(name: &str) -> ObjectRef {
    ObjectRef::new(name).within("default")
}

pub async fn fetch(store: &MemoryStore, name: &str) -> Option<App> {
    store.get_opt(&key(name)).await.unwrap()
}

/// Route runtime logs to the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
