//! Virtual disk layout as captured by a snapshot.

use super::entity::{EntityRef, ManagedRef};
use serde::{Deserialize, Serialize};

/// One virtual disk of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDisk {
    /// Device key, unique within the VM
    pub key: i32,

    /// Display label ("Hard disk 1")
    pub label: String,

    /// Stable disk uuid, used as the repository disk id
    pub uuid: String,

    pub capacity_bytes: u64,

    /// Datastore path of the backing file
    pub backing_path: String,

    #[serde(default)]
    pub change_tracking_enabled: bool,

    /// Changed-block tracking id recorded at snapshot time
    #[serde(default)]
    pub change_id: Option<String>,
}

impl VirtualDisk {
    pub fn disk_id(&self) -> &str {
        &self.uuid
    }

    pub fn reference(&self) -> ManagedRef {
        ManagedRef::disk(&self.uuid)
    }

    pub fn entity(&self, endpoint_instance_id: &str) -> EntityRef {
        EntityRef::new(&self.label, self.reference(), endpoint_instance_id)
    }
}

/// Disk configuration frozen at snapshot time. Never mutated after binding;
/// workers share it behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskConfig {
    #[serde(default)]
    pub disks: Vec<VirtualDisk>,
}

impl DiskConfig {
    pub fn disk(&self, key: i32) -> Option<&VirtualDisk> {
        self.disks.iter().find(|d| d.key == key)
    }

    pub fn position(&self, key: i32) -> Option<usize> {
        self.disks.iter().position(|d| d.key == key)
    }

    pub fn total_capacity(&self) -> u64 {
        self.disks.iter().map(|d| d.capacity_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_config_from_property_json() {
        let json = r#"{
            "disks": [
                {"key": 2000, "label": "Hard disk 1", "uuid": "6000C29a",
                 "capacityBytes": 1048576, "backingPath": "[ds1] web/web.vmdk",
                 "changeTrackingEnabled": true, "changeId": "52 de/3"},
                {"key": 2001, "label": "Hard disk 2", "uuid": "6000C29b",
                 "capacityBytes": 4096, "backingPath": "[ds1] web/web_1.vmdk"}
            ]
        }"#;

        let config: DiskConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.disks.len(), 2);
        assert_eq!(config.total_capacity(), 1048576 + 4096);

        let second = config.disk(2001).unwrap();
        assert!(!second.change_tracking_enabled);
        assert!(second.change_id.is_none());
        assert_eq!(config.position(2001), Some(1));
        assert!(config.disk(3000).is_none());
    }

    #[test]
    fn test_disk_entity() {
        let disk = VirtualDisk {
            key: 2000,
            label: "Hard disk 1".into(),
            uuid: "6000C29a".into(),
            capacity_bytes: 100,
            backing_path: "[ds1] a.vmdk".into(),
            change_tracking_enabled: true,
            change_id: None,
        };
        let entity = disk.entity("vc-1");
        assert_eq!(entity.name(), "Hard disk 1");
        assert_eq!(entity.reference(), &ManagedRef::disk("6000C29a"));
        assert_eq!(entity.endpoint_instance_id(), "vc-1");
    }
}
