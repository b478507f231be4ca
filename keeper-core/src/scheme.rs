//! An explicit registry of the kinds a process knows how to decode.
//!
//! Build one [`Scheme`] at startup, register every kind the process handles, then share it
//! (usually behind an `Arc`) with whatever needs to turn stored records into typed values.
//!
//! ```
//! # use keeper_core::{ObjectMeta, Resource, Scheme};
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Guestbook { metadata: ObjectMeta }
//! # impl Resource for Guestbook {
//! #     const GROUP: &'static str = "webapp.example.com";
//! #     const KIND: &'static str = "Guestbook";
//! #     const PLURAL: &'static str = "guestbooks";
//! #     const VERSION: &'static str = "v1";
//! #     fn meta(&self) -> &ObjectMeta { &self.metadata }
//! #     fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
//! # }
//! let mut scheme = Scheme::new();
//! scheme.register::<Guestbook>()?;
//! let record = scheme.encode(&Guestbook { metadata: ObjectMeta::default() })?;
//! assert_eq!(record["apiVersion"], "webapp.example.com/v1");
//! let _book: Guestbook = scheme.decode(&record)?;
//! # Ok::<(), keeper_core::scheme::SchemeError>(())
//! ```
use crate::{
    gvk::{GroupVersionKind, ParseGroupVersionError},
    metadata::TypeMeta,
    resource::Resource,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{any::TypeId, collections::BTreeMap};
use thiserror::Error;

/// Errors from encoding or decoding through a [`Scheme`]
#[derive(Debug, Error)]
pub enum SchemeError {
    /// The kind was never registered
    #[error("no kind {0} is registered in the scheme")]
    NotRegistered(GroupVersionKind),

    /// A different type is already registered under the same kind
    #[error("kind {0} is already registered to {1}")]
    AlreadyRegistered(GroupVersionKind, &'static str),

    /// The record is of a different kind than the requested type
    #[error("expected a {expected} record but found {found}")]
    KindMismatch {
        /// The kind of the requested type
        expected: GroupVersionKind,
        /// The kind named in the record
        found: GroupVersionKind,
    },

    /// The record lacks an `apiVersion`/`kind` header
    #[error("record is missing apiVersion/kind: {0}")]
    MissingTypeMeta(#[source] serde_json::Error),

    /// The record's `apiVersion` is malformed
    #[error(transparent)]
    InvalidApiVersion(#[from] ParseGroupVersionError),

    /// The record is not a JSON object
    #[error("record is not an object")]
    NotAnObject,

    /// The record body does not match the registered type
    #[error("failed to convert record: {0}")]
    Serde(#[source] serde_json::Error),
}

#[derive(Debug, Clone)]
struct Registration {
    type_id: TypeId,
    type_name: &'static str,
    plural: &'static str,
}

/// Registry mapping kinds to the Rust types that represent them.
#[derive(Debug, Default, Clone)]
pub struct Scheme {
    kinds: BTreeMap<GroupVersionKind, Registration>,
}

impl Scheme {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `K` under its kind
    ///
    /// Registering the same type twice is a no-op; registering a different type under
    /// an existing kind is an error.
    pub fn register<K: Resource + 'static>(&mut self) -> Result<&mut Self, SchemeError> {
        let gvk = K::gvk();
        let registration = Registration {
            type_id: TypeId::of::<K>(),
            type_name: std::any::type_name::<K>(),
            plural: K::PLURAL,
        };
        match self.kinds.get(&gvk) {
            Some(existing) if existing.type_id != registration.type_id => {
                return Err(SchemeError::AlreadyRegistered(gvk, existing.type_name));
            }
            Some(_) => {}
            None => {
                self.kinds.insert(gvk, registration);
            }
        }
        Ok(self)
    }

    /// Whether `gvk` is registered
    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains_key(gvk)
    }

    /// The plural resource name of a registered kind
    pub fn plural(&self, gvk: &GroupVersionKind) -> Option<&'static str> {
        self.kinds.get(gvk).map(|r| r.plural)
    }

    /// All registered kinds, in a stable order
    pub fn kinds(&self) -> impl Iterator<Item = &GroupVersionKind> {
        self.kinds.keys()
    }

    /// Read the kind a serialized record claims to be
    pub fn type_of(record: &Value) -> Result<GroupVersionKind, SchemeError> {
        let TypeMeta { api_version, kind } =
            <TypeMeta as Deserialize>::deserialize(record).map_err(SchemeError::MissingTypeMeta)?;
        Ok(GroupVersionKind::from_api_version(&api_version, &kind)?)
    }

    /// Serialize `obj` into a record carrying its `apiVersion`/`kind` header
    pub fn encode<K: Resource + Serialize + 'static>(&self, obj: &K) -> Result<Value, SchemeError> {
        self.registered::<K>()?;
        let mut record = serde_json::to_value(obj).map_err(SchemeError::Serde)?;
        let map = record.as_object_mut().ok_or(SchemeError::NotAnObject)?;
        map.insert("apiVersion".into(), Value::String(K::api_version().into_owned()));
        map.insert("kind".into(), Value::String(K::KIND.into()));
        Ok(record)
    }

    /// Decode a record into `K`, checking its header against the registration
    pub fn decode<K: Resource + DeserializeOwned + 'static>(&self, record: &Value) -> Result<K, SchemeError> {
        let expected = self.registered::<K>()?;
        let found = Self::type_of(record)?;
        if found != expected {
            return Err(SchemeError::KindMismatch { expected, found });
        }
        <K as Deserialize>::deserialize(record).map_err(SchemeError::Serde)
    }

    fn registered<K: Resource + 'static>(&self) -> Result<GroupVersionKind, SchemeError> {
        let gvk = K::gvk();
        match self.kinds.get(&gvk) {
            Some(r) if r.type_id == TypeId::of::<K>() => Ok(gvk),
            _ => Err(SchemeError::NotRegistered(gvk)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Scheme, SchemeError};
    use crate::{metadata::ObjectMeta, resource::Resource};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Guestbook {
        metadata: ObjectMeta,
        spec: GuestbookSpec,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct GuestbookSpec {
        size: u32,
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

    #[derive(Serialize, Deserialize)]
    struct Imposter {
        metadata: ObjectMeta,
    }

    impl Resource for Imposter {
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

    fn scheme() -> Scheme {
        let mut scheme = Scheme::new();
        scheme.register::<Guestbook>().unwrap();
        scheme
    }

    #[test]
    fn encode_adds_type_header_and_decode_reads_it_back() {
        let scheme = scheme();
        let book = Guestbook {
            metadata: ObjectMeta {
                name: Some("b".into()),
                ..ObjectMeta::default()
            },
            spec: GuestbookSpec { size: 2 },
        };
        let record = scheme.encode(&book).unwrap();
        assert_eq!(record["apiVersion"], json!("webapp.example.com/v1"));
        assert_eq!(record["kind"], json!("Guestbook"));
        assert_eq!(scheme.decode::<Guestbook>(&record).unwrap(), book);
        assert_eq!(scheme.plural(&Guestbook::gvk()), Some("guestbooks"));
    }

    #[test]
    fn decode_rejects_unregistered_and_mismatched_records() {
        let empty = Scheme::new();
        let record = json!({
            "apiVersion": "webapp.example.com/v1",
            "kind": "Guestbook",
            "metadata": {},
            "spec": {"size": 1},
        });
        assert!(matches!(
            empty.decode::<Guestbook>(&record),
            Err(SchemeError::NotRegistered(_))
        ));

        let scheme = scheme();
        let wrong_version = json!({"apiVersion": "webapp.example.com/v2", "kind": "Guestbook", "metadata": {}});
        assert!(matches!(
            scheme.decode::<Guestbook>(&wrong_version),
            Err(SchemeError::KindMismatch { .. })
        ));
        let headless = json!({"metadata": {}});
        assert!(matches!(
            scheme.decode::<Guestbook>(&headless),
            Err(SchemeError::MissingTypeMeta(_))
        ));
    }

    #[test]
    fn register_is_idempotent_but_refuses_a_second_type_for_a_kind() {
        let mut scheme = scheme();
        assert!(scheme.register::<Guestbook>().is_ok());
        assert!(matches!(
            scheme.register::<Imposter>(),
            Err(SchemeError::AlreadyRegistered(..))
        ));
        assert_eq!(scheme.kinds().count(), 1);
    }
}
