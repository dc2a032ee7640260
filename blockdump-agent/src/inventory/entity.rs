//! Identity of hypervisor-side objects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to a managed object: a type tag plus the endpoint's id
/// for it (`VirtualMachine` / `vm-42`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagedRef {
    pub kind: String,
    pub value: String,
}

impl ManagedRef {
    pub const VIRTUAL_MACHINE: &'static str = "VirtualMachine";
    pub const SNAPSHOT: &'static str = "VirtualMachineSnapshot";
    pub const VIRTUAL_DISK: &'static str = "VirtualDisk";

    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn vm(value: impl Into<String>) -> Self {
        Self::new(Self::VIRTUAL_MACHINE, value)
    }

    pub fn snapshot(value: impl Into<String>) -> Self {
        Self::new(Self::SNAPSHOT, value)
    }

    pub fn disk(value: impl Into<String>) -> Self {
        Self::new(Self::VIRTUAL_DISK, value)
    }
}

impl fmt::Display for ManagedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Name, reference and owning endpoint of a managed object.
///
/// Immutable once built. Within a session, refs are minted through
/// [`crate::transport::Session::entity`], which stamps the session's
/// endpoint instance id, so two refs to the same object never disagree on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    name: String,
    reference: ManagedRef,
    endpoint_instance_id: String,
}

impl EntityRef {
    pub fn new(
        name: impl Into<String>,
        reference: ManagedRef,
        endpoint_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            reference,
            endpoint_instance_id: endpoint_instance_id.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference(&self) -> &ManagedRef {
        &self.reference
    }

    pub fn endpoint_instance_id(&self) -> &str {
        &self.endpoint_instance_id
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.reference)
    }
}
