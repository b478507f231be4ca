//! Metadata carried by every persisted resource.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A point in time, serialized as RFC3339.
pub type Time = DateTime<Utc>;

/// Standard object metadata.
///
/// The identity part of a managed resource. The store owns `uid`, `generation`,
/// `resource_version`, `creation_timestamp` and `deletion_timestamp`; clients should
/// treat those as read-only and only ever echo them back on writes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Name of the object, unique within its namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Namespace of the object, `None` for cluster-scoped kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Unique id assigned by the store on creation
    ///
    /// A re-created object with the same name gets a different uid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Sequence number of the desired state
    ///
    /// Incremented by the store every time the spec changes (and when deletion starts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,

    /// Opaque version used for optimistic concurrency on writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// When the object was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<Time>,

    /// When deletion of the object was requested
    ///
    /// Once set the object is read-only apart from its finalizers, and it is removed
    /// as soon as the finalizer list is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<Time>,

    /// Markers that must all be removed before the object can be deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizers: Option<Vec<String>>,

    /// Identifying key/value pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Non-identifying key/value pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Objects that own this object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_references: Option<Vec<OwnerReference>>,
}

/// A pointer from a child object to the object that owns it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// `apiVersion` of the owner
    pub api_version: String,
    /// Kind of the owner
    pub kind: String,
    /// Name of the owner
    pub name: String,
    /// Uid of the owner
    pub uid: String,
    /// Whether the owner is the managing controller of this object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

/// A reference to an object, as attached to events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// `apiVersion` of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Name of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Namespace of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Uid of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Resource version of the referent at the time the reference was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Metadata of a record whose concrete type is not known, used when only the
/// `apiVersion`/`kind` header of a serialized object has been read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// The version of the API, e.g. `webapp.example.com/v1`
    pub api_version: String,
    /// The name of the kind, e.g. `Guestbook`
    pub kind: String,
}

#[cfg(test)]
mod tests {
    use super::{ObjectMeta, OwnerReference};
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn metadata_serializes_camel_case_and_skips_unset_fields() {
        let meta = ObjectMeta {
            name: Some("book".into()),
            namespace: Some("default".into()),
            resource_version: Some("12".into()),
            finalizers: Some(vec!["guestbook.webapp.example.com/finalizer".into()]),
            owner_references: Some(vec![OwnerReference {
                api_version: "webapp.example.com/v1".into(),
                kind: "Guestbook".into(),
                name: "parent".into(),
                uid: "abc".into(),
                controller: Some(true),
            }]),
            ..ObjectMeta::default()
        };
        assert_json_eq!(
            serde_json::to_value(&meta).unwrap(),
            json!({
                "name": "book",
                "namespace": "default",
                "resourceVersion": "12",
                "finalizers": ["guestbook.webapp.example.com/finalizer"],
                "ownerReferences": [{
                    "apiVersion": "webapp.example.com/v1",
                    "kind": "Guestbook",
                    "name": "parent",
                    "uid": "abc",
                    "controller": true,
                }],
            })
        );
    }

    #[test]
    fn metadata_parses_deletion_timestamp() {
        let meta: ObjectMeta = serde_yaml::from_str(
            r#"
            name: book
            generation: 3
            deletionTimestamp: "2026-01-02T03:04:05Z"
            "#,
        )
        .unwrap();
        assert_eq!(meta.generation, Some(3));
        assert_eq!(
            meta.deletion_timestamp.unwrap().to_rfc3339(),
            "2026-01-02T03:04:05+00:00"
        );
    }
}
