//! Security-Group Manager (C6, spec §4.6).
//!
//! Orchestrates the logical `SecurityGroupStore` rows together with the
//! per-zone driver calls that reflect them onto the cluster. The default SG
//! is cloned from the template row (slice id 0) at VLAN-mapping time, before
//! deploy; custom SGs are created on demand. Rule add/remove is guarded by
//! optimistic concurrency on the row's `updated_at` (§5).

use crate::domain::{SecurityGroup, SecurityGroupRule, Zone};
use crate::drivers::Driver;
use crate::store::error::{Result, StoreError};
use crate::store::DataStore;

/// Create the slice's default SG (§4.6, invoked right after VLAN mapping,
/// before deploy -- see `planner::plan_slice`).
pub async fn create_default_sg(store: &dyn DataStore, slice_id: i64) -> Result<SecurityGroup> {
    store.create_default_sg(slice_id).await
}

/// Backfill cluster-native rule UUIDs into the default SG once deploy
/// reports them (§4.5 "Foreign rule UUIDs ... are recorded back into the
/// SecurityGroup row").
pub async fn record_foreign_ids(
    store: &dyn DataStore,
    sg_id: i64,
    foreign_ids: Vec<(u32, String)>,
) -> Result<()> {
    if foreign_ids.is_empty() {
        return Ok(());
    }
    store.set_rule_foreign_ids(sg_id, foreign_ids).await
}

#[allow(clippy::too_many_arguments)]
pub async fn create_custom_sg(
    store: &dyn DataStore,
    driver: &Driver,
    audit: &crate::audit::ApiAuditLogger,
    zone: Zone,
    slice_id: i64,
    name: &str,
    description: Option<&str>,
) -> Result<SecurityGroup> {
    let sg = store.create_custom_sg(slice_id, name, description).await?;
    if let Err(e) = driver.for_zone(zone).create_custom_sg(slice_id, name).await {
        let _ = store.delete_sg(sg.id).await;
        return Err(e);
    }
    audit.security_group_created(sg.id, slice_id, name);
    Ok(sg)
}

/// The default SG cannot be deleted while the slice exists (§4.6); callers
/// must route through the slice delete protocol instead (§4.4).
pub async fn delete_custom_sg(
    store: &dyn DataStore,
    driver: &Driver,
    audit: &crate::audit::ApiAuditLogger,
    zone: Zone,
    slice_id: i64,
    sg_id: i64,
) -> Result<()> {
    let sg = store.get_sg(sg_id).await?;
    if sg.is_default {
        return Err(StoreError::Conflict("the default security group cannot be deleted while the slice exists".into()));
    }
    driver.for_zone(zone).delete_custom_sg(slice_id, &sg.name).await?;
    store.delete_sg(sg_id).await?;
    audit.security_group_deleted(sg_id);
    Ok(())
}

/// Compute the next sequential rule id (`max(id)+1` within the SG, §4.6).
fn next_rule_id(sg: &SecurityGroup) -> u32 {
    sg.rules.iter().map(|r| r.id).max().unwrap_or(0) + 1
}

pub struct NewRule {
    pub direction: crate::domain::RuleDirection,
    pub ether_type: String,
    pub protocol: Option<String>,
    pub port_range_start: Option<u16>,
    pub port_range_end: Option<u16>,
    pub remote_cidr: Option<String>,
    pub remote_sg_name: Option<String>,
    pub description: Option<String>,
}

/// Add a rule: compute next sequential id, persist, then apply to the
/// cluster (§4.6). The cluster call runs after the DB write succeeds so a
/// failed cluster apply still leaves a durable record to retry from.
#[allow(clippy::too_many_arguments)]
pub async fn add_rule(
    store: &dyn DataStore,
    driver: &Driver,
    audit: &crate::audit::ApiAuditLogger,
    zone: Zone,
    slice_id: i64,
    sg_id: i64,
    new_rule: NewRule,
) -> Result<SecurityGroup> {
    let sg = store.get_sg(sg_id).await?;
    let rule = SecurityGroupRule {
        id: next_rule_id(&sg),
        direction: new_rule.direction,
        ether_type: new_rule.ether_type,
        protocol: new_rule.protocol,
        port_range_start: new_rule.port_range_start,
        port_range_end: new_rule.port_range_end,
        remote_cidr: new_rule.remote_cidr,
        remote_sg_name: new_rule.remote_sg_name,
        description: new_rule.description,
        foreign_id: None,
    };

    let updated = store.add_rule(sg_id, rule.clone(), sg.updated_at).await?;
    let foreign_id = driver.for_zone(zone).add_rule(slice_id, &sg.name, &rule).await?;
    audit.security_group_rule_added(sg_id, rule.id);
    if let Some(foreign_id) = foreign_id {
        store.set_rule_foreign_ids(sg_id, vec![(rule.id, foreign_id)]).await?;
        return store.get_sg(sg_id).await;
    }
    Ok(updated)
}

/// Remove a rule: look up the openstack foreign uuid when needed, ask the
/// driver to remove, then prune the JSON. The last rule of an SG may not be
/// removed -- enforced by the store (§4.6).
#[allow(clippy::too_many_arguments)]
pub async fn remove_rule(
    store: &dyn DataStore,
    driver: &Driver,
    audit: &crate::audit::ApiAuditLogger,
    zone: Zone,
    slice_id: i64,
    sg_id: i64,
    rule_id: u32,
) -> Result<SecurityGroup> {
    let sg = store.get_sg(sg_id).await?;
    let rule = sg
        .rules
        .iter()
        .find(|r| r.id == rule_id)
        .cloned()
        .ok_or_else(|| StoreError::NotFound(format!("rule {rule_id} not found in security group {sg_id}")))?;

    driver.for_zone(zone).remove_rule(slice_id, &sg.name, &rule).await?;
    let updated = store.remove_rule(sg_id, rule_id, sg.updated_at).await?;
    audit.security_group_rule_removed(sg_id, rule_id);
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn next_rule_id_is_max_plus_one() {
        let store = MemoryStore::new();
        let sg = store.create_default_sg(1).await.unwrap();
        assert_eq!(next_rule_id(&sg), 3);
    }
}
