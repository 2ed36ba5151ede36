//! In-memory `DataStore`, following the teacher's `state.rs` convention of
//! keeping a plain in-process `ApiState` for tests independent of any real
//! external backend (§10.1/§10.7). Used by `--dev` mode and by this crate's
//! own test suite.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::domain::{
    Image, ImageLifecycle, ImportSource, LifecycleKind, PlacementEntry, RuntimeState,
    SecurityGroup, SecurityGroupRule, Slice, Vm, Zone,
};

use super::error::{Result, StoreError};
use super::traits::{ImageStore, PlacementStore, SecurityGroupStore, SliceStore, VncStore};

#[derive(Default)]
struct Inner {
    slices: HashMap<i64, Slice>,
    security_groups: HashMap<i64, SecurityGroup>,
    images: HashMap<i64, Image>,
    vnc: HashMap<i64, Vec<(String, u32)>>,
    /// `zone -> worker -> entries`
    placement: HashMap<Zone, HashMap<String, Vec<PlacementEntry>>>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_slice_id: AtomicI64,
    next_sg_id: AtomicI64,
    next_image_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_slice_id: AtomicI64::new(1),
            next_sg_id: AtomicI64::new(1),
            next_image_id: AtomicI64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn default_sg_rules() -> Vec<SecurityGroupRule> {
        vec![
            SecurityGroupRule {
                id: 1,
                direction: crate::domain::RuleDirection::Egress,
                ether_type: "IPv4".into(),
                protocol: None,
                port_range_start: None,
                port_range_end: None,
                remote_cidr: Some("0.0.0.0/0".into()),
                remote_sg_name: None,
                description: Some("allow all egress".into()),
                foreign_id: None,
            },
            SecurityGroupRule {
                id: 2,
                direction: crate::domain::RuleDirection::Ingress,
                ether_type: "IPv4".into(),
                protocol: None,
                port_range_start: None,
                port_range_end: None,
                remote_cidr: None,
                remote_sg_name: Some("default".into()),
                description: Some("allow intra-sg ingress".into()),
                foreign_id: None,
            },
        ]
    }
}

#[async_trait]
impl SliceStore for MemoryStore {
    async fn create_slice(
        &self,
        owner_user_id: &str,
        name: &str,
        zone: Zone,
        request_json: serde_json::Value,
    ) -> Result<Slice> {
        let id = self.next_slice_id.fetch_add(1, Ordering::SeqCst);
        let slice = Slice {
            id,
            owner_user_id: owner_user_id.to_string(),
            name: name.to_string(),
            zone,
            lifecycle_kind: LifecycleKind::Validated,
            runtime_state: None,
            request_json,
            vlans: vec![],
            vms: vec![],
            created_at: chrono::Utc::now(),
            deployed_at: None,
        };
        self.lock().slices.insert(id, slice.clone());
        Ok(slice)
    }

    async fn get_slice(&self, id: i64) -> Result<Slice> {
        self.lock()
            .slices
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("slice {id} not found")))
    }

    async fn list_slices(&self, owner_user_id: Option<&str>) -> Result<Vec<Slice>> {
        let mut slices: Vec<Slice> = self
            .lock()
            .slices
            .values()
            .filter(|s| owner_user_id.is_none_or(|uid| s.owner_user_id == uid))
            .cloned()
            .collect();
        slices.sort_by_key(|s| s.id);
        Ok(slices)
    }

    async fn plan_vlans(&self, slice_id: i64, zone: Zone, link_count: usize) -> Result<Vec<u32>> {
        let mut inner = self.lock();
        let mut occupied = std::collections::BTreeSet::new();
        for slice in inner.slices.values() {
            if slice.zone == zone
                && matches!(
                    slice.lifecycle_kind,
                    LifecycleKind::Validated | LifecycleKind::VlansMapped | LifecycleKind::Deployed
                )
            {
                occupied.extend(slice.vlans.iter().copied());
            }
        }
        let allocated = crate::planner::allocate_vlans(zone, &occupied, link_count)?;
        if let Some(slice) = inner.slices.get_mut(&slice_id) {
            slice.vlans = allocated.clone();
        }
        Ok(allocated)
    }

    async fn apply_vlan_mapping(
        &self,
        slice_id: i64,
        request_json: serde_json::Value,
        vms: Vec<Vm>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let slice = inner
            .slices
            .get_mut(&slice_id)
            .ok_or_else(|| StoreError::NotFound(format!("slice {slice_id} not found")))?;
        slice.request_json = request_json;
        slice.vms = vms;
        slice.lifecycle_kind = LifecycleKind::VlansMapped;
        Ok(())
    }

    async fn set_lifecycle_kind(&self, slice_id: i64, kind: LifecycleKind) -> Result<()> {
        let mut inner = self.lock();
        let slice = inner
            .slices
            .get_mut(&slice_id)
            .ok_or_else(|| StoreError::NotFound(format!("slice {slice_id} not found")))?;
        slice.lifecycle_kind = kind;
        Ok(())
    }

    async fn mark_deployed(&self, slice_id: i64, vms: Vec<Vm>) -> Result<()> {
        let mut inner = self.lock();
        let slice = inner
            .slices
            .get_mut(&slice_id)
            .ok_or_else(|| StoreError::NotFound(format!("slice {slice_id} not found")))?;
        slice.vms = vms;
        slice.lifecycle_kind = LifecycleKind::Deployed;
        slice.deployed_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn update_vms(&self, slice_id: i64, vms: Vec<Vm>) -> Result<()> {
        let mut inner = self.lock();
        let slice = inner
            .slices
            .get_mut(&slice_id)
            .ok_or_else(|| StoreError::NotFound(format!("slice {slice_id} not found")))?;
        slice.vms = vms;
        Ok(())
    }

    async fn set_runtime_state(&self, slice_id: i64, state: Option<RuntimeState>) -> Result<()> {
        let mut inner = self.lock();
        let slice = inner
            .slices
            .get_mut(&slice_id)
            .ok_or_else(|| StoreError::NotFound(format!("slice {slice_id} not found")))?;
        slice.runtime_state = state;
        Ok(())
    }

    async fn delete_slice(&self, slice_id: i64) -> Result<()> {
        let mut inner = self.lock();
        let slice = inner
            .slices
            .get_mut(&slice_id)
            .ok_or_else(|| StoreError::NotFound(format!("slice {slice_id} not found")))?;
        slice.lifecycle_kind = LifecycleKind::Deleted;
        slice.vlans.clear();
        slice.runtime_state = None;
        Ok(())
    }
}

#[async_trait]
impl SecurityGroupStore for MemoryStore {
    async fn create_default_sg(&self, slice_id: i64) -> Result<SecurityGroup> {
        let id = self.next_sg_id.fetch_add(1, Ordering::SeqCst);
        let sg = SecurityGroup {
            id,
            slice_id,
            name: "default".into(),
            is_default: true,
            description: Some("default security group".into()),
            rules: Self::default_sg_rules(),
            updated_at: chrono::Utc::now(),
        };
        self.lock().security_groups.insert(id, sg.clone());
        Ok(sg)
    }

    async fn create_custom_sg(
        &self,
        slice_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<SecurityGroup> {
        let mut inner = self.lock();
        if inner
            .security_groups
            .values()
            .any(|sg| sg.slice_id == slice_id && sg.name == name)
        {
            return Err(StoreError::Conflict(format!(
                "security group {name:?} already exists for slice {slice_id}"
            )));
        }
        let id = self.next_sg_id.fetch_add(1, Ordering::SeqCst);
        let sg = SecurityGroup {
            id,
            slice_id,
            name: name.to_string(),
            is_default: false,
            description: description.map(str::to_string),
            rules: vec![],
            updated_at: chrono::Utc::now(),
        };
        inner.security_groups.insert(id, sg.clone());
        Ok(sg)
    }

    async fn get_sg(&self, id: i64) -> Result<SecurityGroup> {
        self.lock()
            .security_groups
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("security group {id} not found")))
    }

    async fn list_sgs(&self, slice_id: i64) -> Result<Vec<SecurityGroup>> {
        let mut sgs: Vec<SecurityGroup> = self
            .lock()
            .security_groups
            .values()
            .filter(|sg| sg.slice_id == slice_id)
            .cloned()
            .collect();
        sgs.sort_by_key(|sg| sg.id);
        Ok(sgs)
    }

    async fn add_rule(
        &self,
        sg_id: i64,
        rule: SecurityGroupRule,
        expected_updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SecurityGroup> {
        let mut inner = self.lock();
        let sg = inner
            .security_groups
            .get_mut(&sg_id)
            .ok_or_else(|| StoreError::NotFound(format!("security group {sg_id} not found")))?;
        if sg.updated_at != expected_updated_at {
            return Err(StoreError::Conflict(format!("security group {sg_id} was modified concurrently")));
        }
        sg.rules.push(rule);
        sg.updated_at = chrono::Utc::now();
        Ok(sg.clone())
    }

    async fn remove_rule(
        &self,
        sg_id: i64,
        rule_id: u32,
        expected_updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SecurityGroup> {
        let mut inner = self.lock();
        let sg = inner
            .security_groups
            .get_mut(&sg_id)
            .ok_or_else(|| StoreError::NotFound(format!("security group {sg_id} not found")))?;
        if sg.updated_at != expected_updated_at {
            return Err(StoreError::Conflict(format!("security group {sg_id} was modified concurrently")));
        }
        if sg.rules.len() <= 1 {
            return Err(StoreError::Conflict("the last rule of a security group may not be removed".into()));
        }
        let before = sg.rules.len();
        sg.rules.retain(|r| r.id != rule_id);
        if sg.rules.len() == before {
            return Err(StoreError::NotFound(format!("rule {rule_id} not found in security group {sg_id}")));
        }
        sg.updated_at = chrono::Utc::now();
        Ok(sg.clone())
    }

    async fn set_rule_foreign_ids(&self, sg_id: i64, foreign_ids: Vec<(u32, String)>) -> Result<()> {
        let mut inner = self.lock();
        let sg = inner
            .security_groups
            .get_mut(&sg_id)
            .ok_or_else(|| StoreError::NotFound(format!("security group {sg_id} not found")))?;
        for rule in sg.rules.iter_mut() {
            if let Some((_, fid)) = foreign_ids.iter().find(|(id, _)| *id == rule.id) {
                rule.foreign_id = Some(fid.clone());
            }
        }
        Ok(())
    }

    async fn delete_sg(&self, sg_id: i64) -> Result<()> {
        self.lock().security_groups.remove(&sg_id);
        Ok(())
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn create_image(
        &self,
        name: &str,
        description: Option<&str>,
        filename: &str,
        format: &str,
        size_bytes: u64,
        import_source: ImportSource,
    ) -> Result<Image> {
        let id = self.next_image_id.fetch_add(1, Ordering::SeqCst);
        let image = Image {
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
            filename: filename.to_string(),
            format: format.to_string(),
            size_bytes,
            import_source,
            openstack_id: None,
            lifecycle: ImageLifecycle::Pending,
        };
        self.lock().images.insert(id, image.clone());
        Ok(image)
    }

    async fn get_image(&self, id: i64) -> Result<Image> {
        self.lock()
            .images
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("image {id} not found")))
    }

    async fn get_image_by_name(&self, name: &str) -> Result<Image> {
        self.lock()
            .images
            .values()
            .find(|i| i.name == name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("image {name:?} not found")))
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        let mut images: Vec<Image> = self.lock().images.values().cloned().collect();
        images.sort_by_key(|i| i.id);
        Ok(images)
    }

    async fn set_image_lifecycle(&self, id: i64, lifecycle: ImageLifecycle) -> Result<()> {
        let mut inner = self.lock();
        let image = inner
            .images
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("image {id} not found")))?;
        image.lifecycle = lifecycle;
        Ok(())
    }

    async fn set_image_openstack_id(&self, id: i64, openstack_id: Option<String>) -> Result<()> {
        let mut inner = self.lock();
        let image = inner
            .images
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("image {id} not found")))?;
        image.openstack_id = openstack_id;
        Ok(())
    }

    async fn set_image_filename(&self, id: i64, filename: &str) -> Result<()> {
        let mut inner = self.lock();
        let image = inner
            .images
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("image {id} not found")))?;
        image.filename = filename.to_string();
        Ok(())
    }

    async fn delete_image(&self, id: i64) -> Result<()> {
        self.lock().images.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl VncStore for MemoryStore {
    async fn reserve_displays(&self, slice_id: i64, worker: &str, count: usize) -> Result<Vec<u32>> {
        let mut inner = self.lock();
        let mut taken: std::collections::HashSet<u32> = std::collections::HashSet::new();
        for entries in inner.vnc.values() {
            for (w, display) in entries {
                if w == worker {
                    taken.insert(*display);
                }
            }
        }
        let mut allocated = Vec::with_capacity(count);
        let mut candidate = 1u32;
        while candidate <= 1000 && allocated.len() < count {
            if !taken.contains(&candidate) {
                allocated.push(candidate);
            }
            candidate += 1;
        }
        if allocated.len() < count {
            return Err(StoreError::ResourceExhausted(format!(
                "worker {worker} has no more free VNC displays in [1,1000]"
            )));
        }
        inner
            .vnc
            .entry(slice_id)
            .or_default()
            .extend(allocated.iter().map(|d| (worker.to_string(), *d)));
        Ok(allocated)
    }

    async fn release_slice(&self, slice_id: i64) -> Result<()> {
        self.lock().vnc.remove(&slice_id);
        Ok(())
    }
}

#[async_trait]
impl PlacementStore for MemoryStore {
    async fn assigned_resources(&self, zone: Zone, worker: &str) -> Result<(f64, f64, f64)> {
        let inner = self.lock();
        let entries = inner
            .placement
            .get(&zone)
            .and_then(|workers| workers.get(worker));
        let Some(entries) = entries else {
            return Ok((0.0, 0.0, 0.0));
        };
        let cpu: f64 = entries.iter().map(|e| e.cores as f64).sum();
        let ram_gb: f64 = entries.iter().map(|e| e.ram_mb as f64 / 1024.0).sum();
        let disk_gb: f64 = entries.iter().map(|e| e.disk_gb as f64).sum();
        Ok((cpu, ram_gb, disk_gb))
    }

    async fn add_entry(&self, zone: Zone, worker: &str, entry: PlacementEntry) -> Result<()> {
        let mut inner = self.lock();
        inner
            .placement
            .entry(zone)
            .or_default()
            .entry(worker.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn remove_slice(&self, zone: Zone, slice_id: i64) -> Result<usize> {
        let mut inner = self.lock();
        let mut removed = 0;
        if let Some(workers) = inner.placement.get_mut(&zone) {
            for entries in workers.values_mut() {
                let before = entries.len();
                entries.retain(|e| e.slice_id != slice_id);
                removed += before - entries.len();
            }
        }
        Ok(removed)
    }

    async fn list_zone(&self, zone: Zone) -> Result<Vec<(String, PlacementEntry)>> {
        let inner = self.lock();
        let Some(workers) = inner.placement.get(&zone) else {
            return Ok(vec![]);
        };
        Ok(workers
            .iter()
            .flat_map(|(worker, entries)| entries.iter().map(move |e| (worker.clone(), e.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_slice_round_trips() {
        let store = MemoryStore::new();
        let slice = store
            .create_slice("u1", "test", Zone::Linux, serde_json::json!({}))
            .await
            .unwrap();
        let fetched = store.get_slice(slice.id).await.unwrap();
        assert_eq!(fetched.owner_user_id, "u1");
        assert_eq!(fetched.lifecycle_kind, LifecycleKind::Validated);
    }

    #[tokio::test]
    async fn plan_vlans_excludes_occupied_across_slices() {
        let store = MemoryStore::new();
        let s1 = store.create_slice("u1", "a", Zone::Linux, serde_json::json!({})).await.unwrap();
        let s2 = store.create_slice("u1", "b", Zone::Linux, serde_json::json!({})).await.unwrap();

        let first = store.plan_vlans(s1.id, Zone::Linux, 2).await.unwrap();
        assert_eq!(first, vec![5, 6]);

        let second = store.plan_vlans(s2.id, Zone::Linux, 2).await.unwrap();
        assert_eq!(second, vec![7, 8]);
    }

    #[tokio::test]
    async fn last_rule_cannot_be_removed() {
        let store = MemoryStore::new();
        let sg = store.create_default_sg(1).await.unwrap();
        let updated_at = sg.updated_at;
        let after_first = store.remove_rule(sg.id, 2, updated_at).await.unwrap();
        assert_eq!(after_first.rules.len(), 1);
        let err = store.remove_rule(sg.id, 1, after_first.updated_at).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn placement_rollback_restores_ledger() {
        let store = MemoryStore::new();
        store
            .add_entry(
                Zone::Linux,
                "worker1",
                PlacementEntry { slice_id: 1, vm_name: "vm1".into(), cores: 1, ram_mb: 512, disk_gb: 1 },
            )
            .await
            .unwrap();
        let removed = store.remove_slice(Zone::Linux, 1).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_zone(Zone::Linux).await.unwrap().len(), 0);
    }
}
