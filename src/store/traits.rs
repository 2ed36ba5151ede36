//! `DataStore` trait composition, generalized from the teacher's
//! `mvirt-api/src/store/traits.rs` aggregate-trait pattern: one trait per
//! aggregate, composed into a single object-safe `DataStore` stored in
//! `AppState`.

use async_trait::async_trait;

use crate::domain::{Image, ImageLifecycle, PlacementEntry, SecurityGroup, Slice, Vm, Zone};

use super::error::Result;

// =============================================================================
// Slice aggregate
// =============================================================================

#[async_trait]
pub trait SliceStore: Send + Sync {
    /// Persist a new slice row with `lifecycle_kind = validated` (§4.1 step 3).
    async fn create_slice(
        &self,
        owner_user_id: &str,
        name: &str,
        zone: Zone,
        request_json: serde_json::Value,
    ) -> Result<Slice>;

    async fn get_slice(&self, id: i64) -> Result<Slice>;

    /// List slices visible to `owner_user_id`, or all slices when `None`
    /// (admin read path, §4.1).
    async fn list_slices(&self, owner_user_id: Option<&str>) -> Result<Vec<Slice>>;

    /// Atomically read the zone's occupied-VLAN set and write this slice's
    /// allocation (§4.2 steps 2-5), serialized per zone.
    async fn plan_vlans(&self, slice_id: i64, zone: Zone, link_count: usize) -> Result<Vec<u32>>;

    /// Persist the VLAN-mapped request JSON and per-VM `conexiones_vlans`
    /// alongside the `vlans_mapped` lifecycle transition.
    async fn apply_vlan_mapping(
        &self,
        slice_id: i64,
        request_json: serde_json::Value,
        vms: Vec<Vm>,
    ) -> Result<()>;

    async fn set_lifecycle_kind(&self, slice_id: i64, kind: crate::domain::LifecycleKind) -> Result<()>;

    /// Persist the fully-placed/deployed VM array (§4.3/§4.5) and flip the
    /// slice to `deployed`.
    async fn mark_deployed(&self, slice_id: i64, vms: Vec<Vm>) -> Result<()>;

    async fn update_vms(&self, slice_id: i64, vms: Vec<Vm>) -> Result<()>;

    async fn set_runtime_state(
        &self,
        slice_id: i64,
        state: Option<crate::domain::RuntimeState>,
    ) -> Result<()>;

    /// Release this slice's VLANs back to the zone pool and mark `deleted`
    /// (§4.4 delete protocol).
    async fn delete_slice(&self, slice_id: i64) -> Result<()>;
}

// =============================================================================
// Security group aggregate
// =============================================================================

#[async_trait]
pub trait SecurityGroupStore: Send + Sync {
    /// Clone the template row (slice id 0) into a fresh default SG for
    /// `slice_id` (§4.6).
    async fn create_default_sg(&self, slice_id: i64) -> Result<SecurityGroup>;

    async fn create_custom_sg(
        &self,
        slice_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<SecurityGroup>;

    async fn get_sg(&self, id: i64) -> Result<SecurityGroup>;

    async fn list_sgs(&self, slice_id: i64) -> Result<Vec<SecurityGroup>>;

    /// Append a rule, checked against `expected_updated_at` for optimistic
    /// concurrency (§5).
    async fn add_rule(
        &self,
        sg_id: i64,
        rule: crate::domain::SecurityGroupRule,
        expected_updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SecurityGroup>;

    async fn remove_rule(
        &self,
        sg_id: i64,
        rule_id: u32,
        expected_updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SecurityGroup>;

    /// Backfill cluster-native rule UUIDs after an openstack deploy (§4.5).
    async fn set_rule_foreign_ids(&self, sg_id: i64, foreign_ids: Vec<(u32, String)>) -> Result<()>;

    async fn delete_sg(&self, sg_id: i64) -> Result<()>;
}

// =============================================================================
// Image aggregate
// =============================================================================

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn create_image(
        &self,
        name: &str,
        description: Option<&str>,
        filename: &str,
        format: &str,
        size_bytes: u64,
        import_source: crate::domain::ImportSource,
    ) -> Result<Image>;

    async fn get_image(&self, id: i64) -> Result<Image>;

    async fn get_image_by_name(&self, name: &str) -> Result<Image>;

    async fn list_images(&self) -> Result<Vec<Image>>;

    async fn set_image_lifecycle(&self, id: i64, lifecycle: ImageLifecycle) -> Result<()>;

    async fn set_image_openstack_id(&self, id: i64, openstack_id: Option<String>) -> Result<()>;

    /// Record the on-disk filename once the staged file has been renamed to
    /// `image_{id}.{ext}` (§4.7).
    async fn set_image_filename(&self, id: i64, filename: &str) -> Result<()>;

    async fn delete_image(&self, id: i64) -> Result<()>;
}

// =============================================================================
// VNC reservation aggregate
// =============================================================================

#[async_trait]
pub trait VncStore: Send + Sync {
    /// Reserve `count` free display numbers on `worker` for `slice_id`,
    /// claimed from [1,1000] (§3, §4.5 "reserve VNC displays before any VM
    /// is started").
    async fn reserve_displays(&self, slice_id: i64, worker: &str, count: usize) -> Result<Vec<u32>>;

    async fn release_slice(&self, slice_id: i64) -> Result<()>;
}

// =============================================================================
// Placement ledger aggregate
// =============================================================================

#[async_trait]
pub trait PlacementStore: Send + Sync {
    async fn assigned_resources(&self, zone: Zone, worker: &str) -> Result<(f64, f64, f64)>;

    async fn add_entry(&self, zone: Zone, worker: &str, entry: PlacementEntry) -> Result<()>;

    /// Roll back every ledger entry added for this slice in this zone
    /// (§4.3 placement rollback).
    async fn remove_slice(&self, zone: Zone, slice_id: i64) -> Result<usize>;

    async fn list_zone(&self, zone: Zone) -> Result<Vec<(String, PlacementEntry)>>;
}

/// Single object-safe facade composing every aggregate trait, matching the
/// teacher's `DataStore` shape.
pub trait DataStore: SliceStore + SecurityGroupStore + ImageStore + VncStore + PlacementStore {}

impl<T> DataStore for T where T: SliceStore + SecurityGroupStore + ImageStore + VncStore + PlacementStore {}
