//! Registers every `MyResource` with an external registry, and unregisters it before deletion.
//!
//! The registry takes one pass to provision a new entry, so a fresh resource is first
//! reported as not ready and picked up again after the retry interval. Stop it with ctrl-c.
use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use keeper::{
    core::{Condition, HasSpec, HasStatus, ObjectMeta, ObjectRef, ObservedStatus, Resource, ResourceExt, Scheme},
    runtime::{
        events::{Reporter, TracingRecorder},
        store::{MemoryStore, ResourceStore},
        Config, Controller, Outcome, Reconcile, Reconciler,
    },
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// YAML config file, falls back to $KEEPER_CONFIG
    #[clap(long, short)]
    config: Option<PathBuf>,
    /// Log filter directives
    #[clap(long, default_value = "info,keeper_runtime=debug")]
    log_filter: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MyResource {
    metadata: ObjectMeta,
    spec: MyResourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<MyResourceStatus>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct MyResourceSpec {
    endpoint: String,
    size: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MyResourceStatus {
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    observed_generation: Option<i64>,
}

impl ObservedStatus for MyResourceStatus {
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

impl Resource for MyResource {
    const GROUP: &'static str = "example.com";
    const KIND: &'static str = "MyResource";
    const PLURAL: &'static str = "myresources";
    const VERSION: &'static str = "v1";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl HasSpec for MyResource {
    type Spec = MyResourceSpec;

    fn spec(&self) -> &MyResourceSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut MyResourceSpec {
        &mut self.spec
    }
}

impl HasStatus for MyResource {
    type Status = MyResourceStatus;

    fn status(&self) -> Option<&MyResourceStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<MyResourceStatus> {
        &mut self.status
    }
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("registry unavailable")]
    RegistryUnavailable,
}

#[derive(Clone, Debug, PartialEq)]
struct Registration {
    endpoint: String,
    size: u32,
    provisioned: bool,
}

/// Stand-in for a service living outside the store
#[derive(Default)]
struct Registry {
    entries: Mutex<BTreeMap<String, Registration>>,
    outages: Mutex<usize>,
}

impl Registry {
    fn check(&self) -> Result<(), Error> {
        let mut outages = self.outages.lock();
        if *outages > 0 {
            *outages -= 1;
            return Err(Error::RegistryUnavailable);
        }
        Ok(())
    }

    /// Registers or updates `key`, returning whether it is provisioned
    fn register(&self, key: &str, spec: &MyResourceSpec) -> Result<bool, Error> {
        self.check()?;
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Registration {
            endpoint: spec.endpoint.clone(),
            size: spec.size,
            provisioned: false,
        });
        if entry.endpoint != spec.endpoint || entry.size != spec.size {
            entry.endpoint.clone_from(&spec.endpoint);
            entry.size = spec.size;
            entry.provisioned = false;
            return Ok(false);
        }
        let was_provisioned = entry.provisioned;
        entry.provisioned = true;
        Ok(was_provisioned)
    }

    fn unregister(&self, key: &str) -> Result<(), Error> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    fn fail_next(&self, count: usize) {
        *self.outages.lock() += count;
    }

    fn forget(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

struct Registrar {
    registry: Arc<Registry>,
}

fn registry_key(res: &MyResource) -> String {
    format!("{}/{}", res.namespace().unwrap_or_default(), res.name_any())
}

#[async_trait::async_trait]
impl Reconcile<MyResource> for Registrar {
    type Error = Error;

    async fn apply(&self, res: Arc<MyResource>) -> Result<Outcome, Error> {
        let spec = res.spec();
        if spec.endpoint.trim().is_empty() {
            return Ok(Outcome::invalid("MissingEndpoint", "spec.endpoint must be set"));
        }
        if self.registry.register(&registry_key(&res), spec)? {
            Ok(Outcome::ready(format!("registered {} at size {}", spec.endpoint, spec.size)))
        } else {
            Ok(Outcome::retry("Provisioning", "waiting for the registry to provision"))
        }
    }

    async fn cleanup(&self, res: Arc<MyResource>) -> Result<(), Error> {
        self.registry.unregister(&registry_key(&res))
    }
}

fn my_resource(name: &str, endpoint: &str, size: u32) -> MyResource {
    MyResource {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            ..ObjectMeta::default()
        },
        spec: MyResourceSpec {
            endpoint: endpoint.into(),
            size,
        },
        status: None,
    }
}

/// Plays the part of the users of the store and of the registry's operators
async fn simulate_users(store: Arc<MemoryStore>, registry: Arc<Registry>) -> Result<()> {
    store.create(&my_resource("alpha", "https://alpha.internal", 3)).await?;
    store.create(&my_resource("broken", "", 1)).await?;
    tokio::time::sleep(Duration::from_secs(40)).await;

    registry.forget("default/alpha");
    info!("registry lost alpha, it comes back on the next drift check");

    registry.fail_next(2);
    ResourceStore::<MyResource>::delete(&*store, &ObjectRef::new("alpha").within("default")).await?;
    info!("deleted alpha while the registry is flaky");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter)?)
        .init();
    let config = Config::load(args.config.as_deref())?;

    let mut scheme = Scheme::new();
    scheme.register::<MyResource>()?;
    let store = Arc::new(MemoryStore::new(Arc::new(scheme)));
    let registry = Arc::new(Registry::default());
    let recorder = Arc::new(TracingRecorder::new(Reporter::from("myresource-controller")));
    let registrar = Registrar {
        registry: registry.clone(),
    };
    let reconciler = Reconciler::new(store.clone(), registrar, recorder, config.reconciler);

    tokio::spawn({
        let store = store.clone();
        async move {
            if let Err(err) = simulate_users(store, registry).await {
                warn!("simulated users failed: {err:#}");
            }
        }
    });

    Controller::new(reconciler, config.controller)
        .graceful_shutdown_on(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .run()
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => info!("reconciled {obj_ref}: {action:?}"),
                Err(err) => warn!("reconcile failed: {err}"),
            }
        })
        .await;
    info!("controller terminated");
    Ok(())
}
