//! Crate with the types and traits shared by keeper controllers
//!
//! This crate holds everything that does not need a runtime: object metadata, the
//! [`Resource`] accessor traits, typed status [`conditions`], the [`Scheme`] type registry
//! and the store error types.
//! The same information here is always re-exported from `keeper` under `keeper::core`.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod conditions;
pub use conditions::{Condition, ConditionStatus, Conditions, ObservedStatus};

pub mod duration;

pub mod gvk;
pub use gvk::{GroupVersion, GroupVersionKind};

pub mod metadata;
pub use metadata::{ObjectMeta, ObjectReference, OwnerReference, Time};

mod object_ref;
pub use object_ref::{Extra, ObjectRef};

mod resource;
pub use resource::{HasSpec, HasStatus, Resource, ResourceExt};

pub mod scheme;
pub use scheme::Scheme;

mod error;
pub use error::{Error, ErrorResponse};

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
