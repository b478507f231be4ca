use crate::{
    metadata::{ObjectMeta, OwnerReference},
    resource::Resource,
};
use educe::Educe;
use std::fmt::{Debug, Display};

/// A namespaced (if relevant) reference to an object, used as the key of a reconcile request
///
/// ```
/// use keeper_core::ObjectRef;
/// assert_ne!(ObjectRef::new("a"), ObjectRef::new("a").within("ns"));
/// assert_eq!(ObjectRef::new("a").within("ns").to_string(), "a.ns");
/// ```
#[derive(Educe)]
#[educe(Debug, PartialEq, Eq, Hash, Clone)]
#[non_exhaustive]
pub struct ObjectRef {
    /// The name of the object
    pub name: String,
    /// The namespace of the object
    ///
    /// May only be `None` if the kind is cluster-scoped (not located in a namespace).
    pub namespace: Option<String>,
    /// Extra information about the object being referred to
    ///
    /// This is *not* considered when comparing objects, so two requests for the same
    /// key collapse into one regardless of which version of the object triggered them.
    #[educe(Hash(ignore), PartialEq(ignore))]
    pub extra: Extra,
}

/// Non-vital information about an object being referred to
///
/// See [`ObjectRef::extra`].
#[derive(Default, Debug, Clone)]
#[non_exhaustive]
pub struct Extra {
    /// The version of the resource at the time of reference
    pub resource_version: Option<String>,
    /// The uid of the object
    pub uid: Option<String>,
}

impl ObjectRef {
    /// Reference an object by name
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            extra: Extra::default(),
        }
    }

    /// Place the reference in a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates `ObjectRef` from the resource
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        Self::from_meta(obj.meta())
    }

    /// Creates `ObjectRef` from bare metadata
    #[must_use]
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
            extra: Extra::from_obj_meta(meta),
        }
    }

    /// Create an `ObjectRef` from an `OwnerReference`
    ///
    /// Owners are assumed to live in the same namespace as the owned object.
    #[must_use]
    pub fn from_owner_ref(namespace: Option<&str>, owner: &OwnerReference) -> Self {
        Self {
            name: owner.name.clone(),
            namespace: namespace.map(String::from),
            extra: Extra {
                resource_version: None,
                uid: Some(owner.uid.clone()),
            },
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}

impl Extra {
    fn from_obj_meta(obj_meta: &ObjectMeta) -> Self {
        Self {
            resource_version: obj_meta.resource_version.clone(),
            uid: obj_meta.uid.clone(),
        }
    }
}
