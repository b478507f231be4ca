//! Keeper is an umbrella-crate for building reconcile-with-finalizer controllers in Rust.
//!
//! # Overview
//!
//! A controller keeps stored resources converged with their spec. For every resource it
//! attaches a finalizer before touching anything outside the store, reports progress through
//! status conditions, and runs cleanup before the resource is allowed to disappear.
//!
//! The main modules are:
//!
//! - [`core`](crate::core) with object metadata, conditions and the [`Scheme`](crate::core::Scheme) type registry
//! - [`runtime`](crate::runtime) with the [`Reconciler`](crate::runtime::Reconciler) state machine and the
//!   [`Controller`](crate::runtime::Controller) that drives it
//!
//! # Writing a controller
//!
//! ```no_run
//! use keeper::{
//!     core::{Condition, HasStatus, ObjectMeta, ObservedStatus, Resource, Scheme},
//!     runtime::{
//!         events::{Reporter, TracingRecorder},
//!         store::MemoryStore,
//!         Config, Controller, Outcome, Reconcile, Reconciler,
//!     },
//! };
//! use futures::StreamExt;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct Bucket {
//!     metadata: ObjectMeta,
//!     spec: BucketSpec,
//!     status: Option<BucketStatus>,
//! }
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct BucketSpec {
//!     region: String,
//! }
//!
//! #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct BucketStatus {
//!     conditions: Vec<Condition>,
//!     observed_generation: Option<i64>,
//! }
//! # impl ObservedStatus for BucketStatus {
//! #     fn conditions(&self) -> &Vec<Condition> { &self.conditions }
//! #     fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
//! #     fn observed_generation(&self) -> Option<i64> { self.observed_generation }
//! #     fn set_observed_generation(&mut self, g: Option<i64>) { self.observed_generation = g }
//! # }
//! # impl Resource for Bucket {
//! #     const GROUP: &'static str = "storage.example.com";
//! #     const KIND: &'static str = "Bucket";
//! #     const PLURAL: &'static str = "buckets";
//! #     const VERSION: &'static str = "v1";
//! #     fn meta(&self) -> &ObjectMeta { &self.metadata }
//! #     fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
//! # }
//! # impl HasStatus for Bucket {
//! #     type Status = BucketStatus;
//! #     fn status(&self) -> Option<&BucketStatus> { self.status.as_ref() }
//! #     fn status_mut(&mut self) -> &mut Option<BucketStatus> { &mut self.status }
//! # }
//!
//! struct Buckets;
//!
//! #[async_trait::async_trait]
//! impl Reconcile<Bucket> for Buckets {
//!     type Error = std::io::Error;
//!
//!     async fn apply(&self, bucket: Arc<Bucket>) -> Result<Outcome, Self::Error> {
//!         if bucket.spec.region.is_empty() {
//!             return Ok(Outcome::invalid("MissingRegion", "spec.region must be set"));
//!         }
//!         Ok(Outcome::ready(format!("bucket provisioned in {}", bucket.spec.region)))
//!     }
//!
//!     async fn cleanup(&self, _bucket: Arc<Bucket>) -> Result<(), Self::Error> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let mut scheme = Scheme::new();
//!     scheme.register::<Bucket>()?;
//!     let store = Arc::new(MemoryStore::new(Arc::new(scheme)));
//!     let recorder = Arc::new(TracingRecorder::new(Reporter::from("bucket-controller")));
//!     let reconciler = Reconciler::new(store, Buckets, recorder, config.reconciler);
//!     Controller::new(reconciler, config.controller)
//!         .run()
//!         .for_each(|res| async move {
//!             match res {
//!                 Ok((obj_ref, action)) => println!("reconciled {obj_ref}: {action:?}"),
//!                 Err(err) => println!("reconcile failed: {err}"),
//!             }
//!         })
//!         .await;
//!     Ok(())
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

macro_rules! cfg_runtime {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "runtime")]
            #[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
            $item
        )*
    };
}

cfg_runtime! {
    #[doc(inline)]
    pub use keeper_runtime as runtime;
}

/// Re-exports from `keeper-core`
#[doc(inline)]
pub use keeper_core as core;

// Re-exports from keeper-core
pub use crate::core::{Resource, ResourceExt};

#[cfg(all(test, feature = "runtime"))]
mod tests {
    use crate::{
        core::{ObjectMeta, ObjectRef, Resource, Scheme},
        runtime::store::{MemoryStore, ResourceStore},
    };
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Note {
        metadata: ObjectMeta,
    }

    impl Resource for Note {
        const GROUP: &'static str = "";
        const KIND: &'static str = "Note";
        const PLURAL: &'static str = "notes";
        const VERSION: &'static str = "v1";

        fn meta(&self) -> &ObjectMeta {
            &self.metadata
        }

        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
    }

    #[tokio::test]
    async fn facade_reexports_work_together() {
        let mut scheme = Scheme::new();
        scheme.register::<Note>().unwrap();
        let store = MemoryStore::new(Arc::new(scheme));
        let note = Note {
            metadata: ObjectMeta {
                name: Some("hello".into()),
                ..ObjectMeta::default()
            },
        };
        store.create(&note).await.unwrap();
        let fetched: Note = store.get(&ObjectRef::new("hello")).await.unwrap();
        assert_eq!(Note::api_version(), "v1");
        assert_eq!(fetched.metadata.generation, Some(1));
    }
}
