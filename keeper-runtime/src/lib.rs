//! Crate with the keeper controller runtime
//!
//! This crate contains the building blocks for controllers that keep a set of stored
//! resources converged with their spec, with a finalizer guarding cleanup before deletion.
//!
//! Newcomers should generally get started with the [`Controller`] builder, which drives a
//! [`Reconciler`] from a store's change feed and manages requeues and backoff for you.

#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod config;
pub mod controller;
pub mod events;
pub mod finalizer;
pub mod reconciler;
pub mod scheduler;
pub mod store;
mod utils;

pub use config::{Config, ControllerConfig, ReconcilerConfig};
pub use controller::{applier, Action, Controller, ErrorBackoff, ErrorPolicy};
pub use finalizer::finalizer;
pub use reconciler::{Outcome, Reconcile, Reconciler};
pub use scheduler::scheduler;
