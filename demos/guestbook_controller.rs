//! Keeps one `GuestbookEntry` record per replica for every `Guestbook`.
//!
//! The store is in-memory and seeded with a couple of guestbooks, which are then scaled and
//! deleted while the controller runs. Stop it with ctrl-c.
use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use keeper::{
    core::{
        Condition, HasSpec, HasStatus, ObjectMeta, ObjectRef, ObservedStatus, OwnerReference, Resource,
        ResourceExt, Scheme,
    },
    runtime::{
        events::{Reporter, TracingRecorder},
        store::{MemoryStore, ResourceStore},
        Config, Controller, Outcome, Reconcile, Reconciler,
    },
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};
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
struct Guestbook {
    metadata: ObjectMeta,
    spec: GuestbookSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<GuestbookStatus>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct GuestbookSpec {
    replicas: i32,
    greeting: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestbookStatus {
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    observed_generation: Option<i64>,
}

impl ObservedStatus for GuestbookStatus {
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

impl Resource for Guestbook {
    const GROUP: &'static str = "webapp.example.com";
    const KIND: &'static str = "Guestbook";
    const PLURAL: &'static str = "guestbooks";
    const VERSION: &'static str = "v1";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl HasSpec for Guestbook {
    type Spec = GuestbookSpec;

    fn spec(&self) -> &GuestbookSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut GuestbookSpec {
        &mut self.spec
    }
}

impl HasStatus for Guestbook {
    type Status = GuestbookStatus;

    fn status(&self) -> Option<&GuestbookStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<GuestbookStatus> {
        &mut self.status
    }
}

/// One replica of a guestbook
#[derive(Clone, Debug, Serialize, Deserialize)]
struct GuestbookEntry {
    metadata: ObjectMeta,
    spec: EntrySpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct EntrySpec {
    index: i32,
    greeting: String,
}

impl Resource for GuestbookEntry {
    const GROUP: &'static str = "webapp.example.com";
    const KIND: &'static str = "GuestbookEntry";
    const PLURAL: &'static str = "guestbookentries";
    const VERSION: &'static str = "v1";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("store request failed: {0}")]
    Store(#[from] keeper::core::Error),
    #[error("guestbook has no uid yet")]
    MissingIdentity,
}

/// Converges the entries of each guestbook
struct Entries {
    store: Arc<MemoryStore>,
}

impl Entries {
    async fn owned_by(&self, owner: &OwnerReference) -> Result<Vec<GuestbookEntry>, Error> {
        let entries: Vec<GuestbookEntry> = self.store.list().await?;
        Ok(entries.into_iter().filter(|e| e.is_controlled_by(owner)).collect())
    }
}

#[async_trait::async_trait]
impl Reconcile<Guestbook> for Entries {
    type Error = Error;

    async fn apply(&self, book: Arc<Guestbook>) -> Result<Outcome, Error> {
        let spec = book.spec();
        if spec.replicas < 0 {
            return Ok(Outcome::invalid("InvalidReplicas", "spec.replicas must not be negative"));
        }
        if spec.greeting.trim().is_empty() {
            return Ok(Outcome::invalid("MissingGreeting", "spec.greeting must be set"));
        }
        let owner = book.controller_owner_ref().ok_or(Error::MissingIdentity)?;
        let existing = self.owned_by(&owner).await?;

        for index in 0..spec.replicas {
            let name = format!("{}-{index}", book.name_any());
            let desired = EntrySpec {
                index,
                greeting: spec.greeting.clone(),
            };
            match existing.iter().find(|e| e.name_any() == name) {
                Some(entry) if entry.spec == desired => {}
                Some(entry) => {
                    let mut entry = entry.clone();
                    entry.spec = desired;
                    self.store.update(&entry).await?;
                }
                None => {
                    let entry = GuestbookEntry {
                        metadata: ObjectMeta {
                            name: Some(name),
                            namespace: book.namespace(),
                            owner_references: Some(vec![owner.clone()]),
                            ..ObjectMeta::default()
                        },
                        spec: desired,
                    };
                    self.store.create(&entry).await?;
                }
            }
        }
        for extra in existing.iter().filter(|e| e.spec.index >= spec.replicas) {
            delete_entry(&self.store, extra).await?;
        }
        Ok(Outcome::ready(format!("{} entries present", spec.replicas)))
    }

    async fn cleanup(&self, book: Arc<Guestbook>) -> Result<(), Error> {
        let Some(owner) = book.controller_owner_ref() else {
            return Ok(());
        };
        for entry in self.owned_by(&owner).await? {
            delete_entry(&self.store, &entry).await?;
        }
        Ok(())
    }
}

async fn delete_entry(store: &MemoryStore, entry: &GuestbookEntry) -> Result<(), Error> {
    match ResourceStore::<GuestbookEntry>::delete(store, &ObjectRef::from_obj(entry)).await {
        Err(err) if err.is_not_found() => Ok(()),
        res => res.map_err(Error::from),
    }
}

fn guestbook(name: &str, replicas: i32, greeting: &str) -> Guestbook {
    Guestbook {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            ..ObjectMeta::default()
        },
        spec: GuestbookSpec {
            replicas,
            greeting: greeting.into(),
        },
        status: None,
    }
}

/// Plays the part of the users of the store
async fn simulate_users(store: Arc<MemoryStore>) -> Result<()> {
    store.create(&guestbook("lobby", 2, "welcome")).await?;
    store.create(&guestbook("garden", 3, "mind the roses")).await?;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let key = ObjectRef::new("lobby").within("default");
    let mut lobby: Guestbook = store.get(&key).await?;
    lobby.spec.replicas = 4;
    store.update(&lobby).await?;
    info!("scaled lobby to 4 entries");
    tokio::time::sleep(Duration::from_secs(5)).await;

    ResourceStore::<Guestbook>::delete(&*store, &ObjectRef::new("garden").within("default")).await?;
    info!("deleted garden");
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
    scheme.register::<Guestbook>()?.register::<GuestbookEntry>()?;
    let store = Arc::new(MemoryStore::new(Arc::new(scheme)));
    let recorder = Arc::new(TracingRecorder::new(Reporter::from("guestbook-controller")));
    let entries = Entries { store: store.clone() };
    let reconciler = Reconciler::new(store.clone(), entries, recorder, config.reconciler);

    tokio::spawn({
        let store = store.clone();
        async move {
            if let Err(err) = simulate_users(store).await {
                warn!("simulated users failed: {err:#}");
            }
        }
    });

    Controller::new(reconciler, config.controller)
        .owns::<GuestbookEntry>()
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
