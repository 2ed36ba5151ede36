//! Cluster Drivers (C5, spec §4.5).
//!
//! Both zones implement the same `ClusterDriver` contract; `Driver` is the
//! single façade that picks one by zone, shaped after how `mvirt-api`'s
//! `grpc/server.rs` centralizes dispatch over a `dyn DataStore` rather than
//! matching on zone at every call site. Deploy/delete/pause/resume/
//! shutdown/start are all idempotent or designed to be retried at-most-once
//! by the queue substrate (§4.8); a driver that fails partway through
//! `deploy` must undo everything it created for that slice id before
//! returning.

pub mod linux;
pub mod openstack;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::domain::{SecurityGroupRule, Slice, Zone};
use crate::store::error::Result;

pub use linux::LinuxDriver;
pub use openstack::OpenstackDriver;

/// Result of a successful deploy: per-VM VNC display assignments (linux
/// zone only; empty for openstack) plus any security-group rule foreign
/// ids minted by the cluster's native SG API (openstack zone only).
#[derive(Debug, Default, Clone)]
pub struct DeployOutcome {
    pub vnc_by_vm: BTreeMap<String, u32>,
    pub default_sg_foreign_ids: Vec<(u32, String)>,
}

#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Materialize networks, ports/TAPs, and VMs for a fully VLAN-mapped and
    /// placed slice. Atomic from the caller's perspective (§4.5).
    async fn deploy(&self, slice: &Slice) -> Result<DeployOutcome>;

    /// Idempotent; removes everything tagged with `slice_id`.
    async fn delete(&self, slice_id: i64) -> Result<()>;

    async fn pause(&self, slice_id: i64) -> Result<()>;
    async fn resume(&self, slice_id: i64) -> Result<()>;
    async fn shutdown(&self, slice_id: i64) -> Result<()>;
    async fn start(&self, slice_id: i64) -> Result<()>;

    async fn pause_vm(&self, slice_id: i64, vm_name: &str) -> Result<()>;
    async fn resume_vm(&self, slice_id: i64, vm_name: &str) -> Result<()>;
    async fn shutdown_vm(&self, slice_id: i64, vm_name: &str) -> Result<()>;
    async fn start_vm(&self, slice_id: i64, vm_name: &str) -> Result<()>;

    async fn create_custom_sg(&self, slice_id: i64, sg_name: &str) -> Result<()>;
    async fn delete_custom_sg(&self, slice_id: i64, sg_name: &str) -> Result<()>;
    /// Only called on slice delete (§4.6 "cannot be deleted while the slice
    /// exists").
    async fn delete_default_sg(&self, slice_id: i64) -> Result<()>;
    async fn add_rule(&self, slice_id: i64, sg_name: &str, rule: &SecurityGroupRule) -> Result<Option<String>>;
    async fn remove_rule(&self, slice_id: i64, sg_name: &str, rule: &SecurityGroupRule) -> Result<()>;
}

/// Picks a concrete driver by zone (§4.5 "both drivers run behind a single
/// façade").
pub struct Driver {
    linux: LinuxDriver,
    openstack: OpenstackDriver,
}

impl Driver {
    pub fn new(linux: LinuxDriver, openstack: OpenstackDriver) -> Self {
        Self { linux, openstack }
    }

    pub fn for_zone(&self, zone: Zone) -> &dyn ClusterDriver {
        match zone {
            Zone::Linux => &self.linux,
            Zone::Openstack => &self.openstack,
        }
    }
}
