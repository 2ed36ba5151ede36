//! Audit trail for orchestration events (§10.4).
//!
//! The teacher dispatches every audit event to a separate Raft-replicated
//! `mvirt-log` service over gRPC. Nothing in this spec calls for a standalone
//! audit microservice, so events are logged directly via `tracing::info!`
//! structured fields instead -- the shape (one method per event kind) is
//! kept so call sites at the orchestration stages read the same way.

use tracing::info;

#[derive(Debug, Default)]
pub struct ApiAuditLogger;

impl ApiAuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn slice_created(&self, slice_id: i64, owner_user_id: &str, zone: &str) {
        info!(slice_id, owner_user_id, zone, "slice created");
    }

    pub fn slice_vlans_mapped(&self, slice_id: i64, vlans: &[u32]) {
        info!(slice_id, ?vlans, "slice VLANs mapped");
    }

    pub fn slice_deployed(&self, slice_id: i64) {
        info!(slice_id, "slice deployed");
    }

    pub fn slice_error(&self, slice_id: i64, code: &str, message: &str) {
        info!(slice_id, code, message, "slice entered error state");
    }

    pub fn slice_deleted(&self, slice_id: i64) {
        info!(slice_id, "slice deleted");
    }

    pub fn slice_runtime_changed(&self, slice_id: i64, old: Option<&str>, new: Option<&str>) {
        info!(slice_id, ?old, ?new, "slice runtime state changed");
    }

    pub fn vm_state_changed(&self, slice_id: i64, vm_name: &str, old: Option<&str>, new: &str) {
        info!(slice_id, vm_name, ?old, new, "VM state changed");
    }

    pub fn security_group_created(&self, id: i64, slice_id: i64, name: &str) {
        info!(id, slice_id, name, "security group created");
    }

    pub fn security_group_rule_added(&self, sg_id: i64, rule_id: u32) {
        info!(sg_id, rule_id, "security group rule added");
    }

    pub fn security_group_rule_removed(&self, sg_id: i64, rule_id: u32) {
        info!(sg_id, rule_id, "security group rule removed");
    }

    pub fn security_group_deleted(&self, id: i64) {
        info!(id, "security group deleted");
    }

    pub fn image_registered(&self, id: i64, name: &str) {
        info!(id, name, "image registered");
    }

    pub fn image_deleted(&self, id: i64) {
        info!(id, "image deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_never_panics() {
        let logger = ApiAuditLogger::new();
        logger.slice_created(1, "u1", "linux");
        logger.slice_vlans_mapped(1, &[5, 6]);
        logger.slice_deployed(1);
        logger.slice_error(1, "resource_exhausted", "no free VLANs");
        logger.slice_deleted(1);
        logger.slice_runtime_changed(1, Some("corriendo"), Some("pausado"));
        logger.vm_state_changed(1, "vm1", Some("Corriendo"), "Pausado");
        logger.security_group_created(1, 1, "default");
        logger.security_group_rule_added(1, 3);
        logger.security_group_rule_removed(1, 3);
        logger.security_group_deleted(1);
        logger.image_registered(1, "cirros");
        logger.image_deleted(1);
    }
}
