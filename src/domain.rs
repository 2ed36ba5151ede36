//! Core data model: slices, topologies, VMs, links, security groups, images,
//! VNC reservations, and placement tracking entries (spec §3).

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// =============================================================================
// Zone
// =============================================================================

/// One of the two backing clusters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Linux,
    Openstack,
}

impl Zone {
    /// VLAN pool bounds for this zone (inclusive), per §4.2.
    pub fn vlan_pool(&self) -> (u32, u32) {
        match self {
            Zone::Linux => (5, 900),
            Zone::Openstack => (15, 900),
        }
    }

    /// Well-known zone-wide internet VLAN id (§3).
    pub fn internet_vlan(&self) -> u32 {
        match self {
            Zone::Linux => 1,
            Zone::Openstack => 11,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Linux => "linux",
            Zone::Openstack => "openstack",
        }
    }
}

impl std::str::FromStr for Zone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Zone::Linux),
            "openstack" => Ok(Zone::Openstack),
            other => Err(format!("unknown zone: {other}")),
        }
    }
}

// =============================================================================
// Slice
// =============================================================================

/// Lifecycle kind, §3/§4.4.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Validated,
    VlansMapped,
    Deployed,
    Error,
    Deleted,
}

/// Runtime state, §3/§4.4. Empty string before any VM exists is modeled as `None`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Corriendo,
    Pausado,
    Apagado,
    Eliminado,
}

/// A slice row (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Slice {
    pub id: i64,
    pub owner_user_id: String,
    pub name: String,
    pub zone: Zone,
    pub lifecycle_kind: LifecycleKind,
    pub runtime_state: Option<RuntimeState>,
    /// Original topology request document, mutated in place as stages add data.
    pub request_json: serde_json::Value,
    /// Allocated VLAN ids for this slice, comma-joined on the wire.
    pub vlans: Vec<u32>,
    pub vms: Vec<Vm>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub deployed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Slice {
    /// Invariant (§3): a slice with kind != deployed has an empty VM array.
    pub fn check_vms_invariant(&self) -> bool {
        self.lifecycle_kind == LifecycleKind::Deployed || self.vms.is_empty()
    }
}

// =============================================================================
// Topology
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    #[serde(rename = "1vm")]
    OneVm,
    Lineal,
    Anillo,
    Arbol,
}

impl TopologyKind {
    /// Allowed VM-count range for this topology kind (inclusive), §3.
    pub fn allowed_vm_count(&self) -> std::ops::RangeInclusive<u32> {
        match self {
            TopologyKind::OneVm => 1..=1,
            TopologyKind::Lineal => 2..=12,
            TopologyKind::Anillo => 3..=12,
            TopologyKind::Arbol => 5..=12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Topology {
    pub kind: TopologyKind,
    pub internet: bool,
    pub vms: Vec<Vm>,
}

// =============================================================================
// VM
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "PascalCase")]
pub enum VmState {
    Corriendo,
    Pausado,
    Apagado,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Vm {
    /// Stable name, unique within the slice (`vmN`).
    pub name: String,
    pub cores: u32,
    /// RAM in MiB (256-999) or as whole GiB*1024 for 1.0-1.5G values.
    pub ram_mb: u32,
    pub disk_gb: u32,
    pub image: String,
    pub internet: bool,
    /// Assigned VLAN membership, populated by C2.
    pub vlans: Vec<u32>,
    /// Assigned worker, populated by C3.
    pub server: Option<String>,
    /// VNC display number, populated by C5.
    pub vnc_port: Option<u32>,
    pub state: Option<VmState>,
}

impl Vm {
    /// Materialized name in the cluster: `id{sliceId}_{name}`.
    pub fn cluster_name(&self, slice_id: i64) -> String {
        format!("id{slice_id}_{}", self.name)
    }
}

// =============================================================================
// Link
// =============================================================================

/// An unordered pair of VM names. Never stored standalone — always derived.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub vm_a: String,
    pub vm_b: String,
}

impl Link {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            vm_a: a.into(),
            vm_b: b.into(),
        }
    }

    /// Whether this link touches the given VM name.
    pub fn touches(&self, vm: &str) -> bool {
        self.vm_a == vm || self.vm_b == vm
    }
}

// =============================================================================
// Security Group
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SecurityGroupRule {
    /// Sequential within the SG, starting at 1.
    pub id: u32,
    pub direction: RuleDirection,
    pub ether_type: String,
    pub protocol: Option<String>,
    pub port_range_start: Option<u16>,
    pub port_range_end: Option<u16>,
    pub remote_cidr: Option<String>,
    pub remote_sg_name: Option<String>,
    pub description: Option<String>,
    /// Foreign rule UUID, only meaningful for the openstack zone.
    pub foreign_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SecurityGroup {
    pub id: i64,
    /// 0 is reserved for the template row.
    pub slice_id: i64,
    pub name: String,
    pub is_default: bool,
    pub description: Option<String>,
    pub rules: Vec<SecurityGroupRule>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Image
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImageLifecycle {
    Pending,
    Validated,
    Propagated,
    Registered,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImportSource {
    Url,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Image {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub filename: String,
    pub format: String,
    pub size_bytes: u64,
    pub import_source: ImportSource,
    pub openstack_id: Option<String>,
    pub lifecycle: ImageLifecycle,
}

// =============================================================================
// VNC reservation
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VncReservation {
    pub slice_id: i64,
    /// Per-worker display numbers claimed by this slice, in [1, 1000].
    pub displays: Vec<(String, u32)>,
}

// =============================================================================
// Placement tracking
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlacementEntry {
    pub slice_id: i64,
    pub vm_name: String,
    pub cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_vm_invariant_holds_for_non_deployed() {
        let slice = Slice {
            id: 1,
            owner_user_id: "u1".into(),
            name: "s1".into(),
            zone: Zone::Linux,
            lifecycle_kind: LifecycleKind::Validated,
            runtime_state: None,
            request_json: serde_json::json!({}),
            vlans: vec![],
            vms: vec![],
            created_at: chrono::Utc::now(),
            deployed_at: None,
        };
        assert!(slice.check_vms_invariant());
    }

    #[test]
    fn zone_vlan_pools_match_spec() {
        assert_eq!(Zone::Linux.vlan_pool(), (5, 900));
        assert_eq!(Zone::Openstack.vlan_pool(), (15, 900));
        assert_eq!(Zone::Linux.internet_vlan(), 1);
        assert_eq!(Zone::Openstack.internet_vlan(), 11);
    }

    #[test]
    fn topology_vm_count_ranges_match_spec() {
        assert_eq!(TopologyKind::OneVm.allowed_vm_count(), 1..=1);
        assert_eq!(TopologyKind::Lineal.allowed_vm_count(), 2..=12);
        assert_eq!(TopologyKind::Anillo.allowed_vm_count(), 3..=12);
        assert_eq!(TopologyKind::Arbol.allowed_vm_count(), 5..=12);
    }
}
