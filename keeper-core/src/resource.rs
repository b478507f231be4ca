use crate::{
    gvk::GroupVersionKind,
    metadata::{ObjectMeta, ObjectReference, OwnerReference},
};
use std::{borrow::Cow, collections::BTreeMap};

/// An accessor trait for a managed resource.
///
/// Types implementing this trait carry an [`ObjectMeta`] and know their kind at compile time.
/// They SHOULD all have:
/// - `.metadata`
/// - `.metadata.name`
///
/// And these optional properties:
/// - `.metadata.namespace`
/// - `.metadata.resource_version`
pub trait Resource {
    /// Kind of this resource, e.g. `Guestbook`
    const KIND: &'static str;
    /// API group of this resource, empty for the core group
    const GROUP: &'static str;
    /// Version of this resource, e.g. `v1`
    const VERSION: &'static str;
    /// Plural name of the kind, e.g. `guestbooks`
    const PLURAL: &'static str;

    /// Returns apiVersion of this object
    fn api_version() -> Cow<'static, str> {
        if Self::GROUP.is_empty() {
            return Self::VERSION.into();
        }
        format!("{}/{}", Self::GROUP, Self::VERSION).into()
    }

    /// Returns the full type information of this kind
    fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk(Self::GROUP, Self::VERSION, Self::KIND)
    }

    /// Metadata that all persisted resources must have
    fn meta(&self) -> &ObjectMeta;
    /// Metadata that all persisted resources must have
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Generates an object reference for the resource
    fn object_ref(&self) -> ObjectReference {
        let meta = self.meta();
        ObjectReference {
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
            api_version: Some(Self::api_version().into_owned()),
            kind: Some(Self::KIND.to_string()),
        }
    }

    /// Generates a controller owner reference pointing to this resource
    ///
    /// Returns `None` until the resource has been persisted and carries a name and uid.
    fn controller_owner_ref(&self) -> Option<OwnerReference> {
        let meta = self.meta();
        Some(OwnerReference {
            api_version: Self::api_version().into_owned(),
            kind: Self::KIND.to_string(),
            name: meta.name.clone()?,
            uid: meta.uid.clone()?,
            controller: Some(true),
        })
    }
}

/// Helper methods for resources.
pub trait ResourceExt: Resource {
    /// Returns the name of the resource, or an empty string when unset
    ///
    /// This is intended to provide something quick and simple for logging purposes.
    fn name_any(&self) -> String;
    /// The namespace the resource is in
    fn namespace(&self) -> Option<String>;
    /// The resource version
    fn resource_version(&self) -> Option<String>;
    /// Unique ID (if you delete resource and then create a new
    /// resource with the same name, it will have different ID)
    fn uid(&self) -> Option<String>;
    /// The generation of the desired state, `0` if the store never assigned one
    fn generation(&self) -> i64;
    /// Whether deletion of the resource has been requested
    fn is_deleting(&self) -> bool;
    /// Provides mutable access to the labels
    fn labels_mut(&mut self) -> &mut BTreeMap<String, String>;
    /// Returns resource owner references
    fn owner_references(&self) -> &[OwnerReference];
    /// Provides mutable access to the owner references
    fn owner_references_mut(&mut self) -> &mut Vec<OwnerReference>;
    /// Returns resource finalizers
    fn finalizers(&self) -> &[String];
    /// Provides mutable access to the finalizers
    fn finalizers_mut(&mut self) -> &mut Vec<String>;
    /// Whether `finalizer` is present
    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }
    /// Whether this resource is controlled by `owner` (matched by uid)
    fn is_controlled_by(&self, owner: &OwnerReference) -> bool {
        self.owner_references()
            .iter()
            .any(|o| o.uid == owner.uid && o.controller == Some(true))
    }
}

impl<K: Resource> ResourceExt for K {
    fn name_any(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    fn resource_version(&self) -> Option<String> {
        self.meta().resource_version.clone()
    }

    fn uid(&self) -> Option<String> {
        self.meta().uid.clone()
    }

    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or_default()
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.meta_mut().labels.get_or_insert_with(BTreeMap::new)
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.meta().owner_references.as_deref().unwrap_or_default()
    }

    fn owner_references_mut(&mut self) -> &mut Vec<OwnerReference> {
        self.meta_mut().owner_references.get_or_insert_with(Vec::new)
    }

    fn finalizers(&self) -> &[String] {
        self.meta().finalizers.as_deref().unwrap_or_default()
    }

    fn finalizers_mut(&mut self) -> &mut Vec<String> {
        self.meta_mut().finalizers.get_or_insert_with(Vec::new)
    }
}

/// A trait to access the `spec` of a resource.
pub trait HasSpec {
    /// The type of the `spec` of this resource
    type Spec;

    /// Returns a reference to the `spec` of the object
    fn spec(&self) -> &Self::Spec;

    /// Returns a mutable reference to the `spec` of the object
    fn spec_mut(&mut self) -> &mut Self::Spec;
}

/// A trait to access the `status` of a resource.
///
/// The status is the observed half of a resource. It is written through a separate
/// path from the spec, see the `update_status` operation of the resource store.
pub trait HasStatus {
    /// The type of the `status` object
    type Status;

    /// Returns an optional reference to the `status` of the object
    fn status(&self) -> Option<&Self::Status>;

    /// Returns an optional mutable reference to the `status` of the object
    fn status_mut(&mut self) -> &mut Option<Self::Status>;
}
