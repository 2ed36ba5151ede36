//! Events emitted by store mutations.
//!
//! Dispatched via a broadcast channel to subscribers, mirroring the
//! teacher's `store::event::Event`.

use crate::domain::{LifecycleKind, RuntimeState, VmState};

#[derive(Debug, Clone)]
pub enum Event {
    SliceValidated {
        slice_id: i64,
    },
    SliceVlansMapped {
        slice_id: i64,
        vlans: Vec<u32>,
    },
    SliceDeployed {
        slice_id: i64,
    },
    SliceLifecycleChanged {
        slice_id: i64,
        old: LifecycleKind,
        new: LifecycleKind,
    },
    SliceRuntimeChanged {
        slice_id: i64,
        old: Option<RuntimeState>,
        new: Option<RuntimeState>,
    },
    SliceDeleted {
        slice_id: i64,
    },
    /// Terminal pipeline failure (§7); carries the stable error code and
    /// message so `create_slice`'s awaiting caller can surface them without
    /// a dedicated error column on the slice row.
    SliceFailed {
        slice_id: i64,
        code: String,
        message: String,
    },
    VmStateChanged {
        slice_id: i64,
        vm_name: String,
        old: Option<VmState>,
        new: VmState,
    },
    SecurityGroupCreated {
        id: i64,
        slice_id: i64,
    },
    SecurityGroupDeleted {
        id: i64,
        slice_id: i64,
    },
    ImageRegistered {
        id: i64,
    },
    ImageDeleted {
        id: i64,
    },
}

impl Event {
    pub fn resource_type(&self) -> &'static str {
        match self {
            Event::SliceValidated { .. }
            | Event::SliceVlansMapped { .. }
            | Event::SliceDeployed { .. }
            | Event::SliceLifecycleChanged { .. }
            | Event::SliceRuntimeChanged { .. }
            | Event::SliceDeleted { .. }
            | Event::SliceFailed { .. } => "slice",
            Event::VmStateChanged { .. } => "vm",
            Event::SecurityGroupCreated { .. } | Event::SecurityGroupDeleted { .. } => {
                "security_group"
            }
            Event::ImageRegistered { .. } | Event::ImageDeleted { .. } => "image",
        }
    }
}
