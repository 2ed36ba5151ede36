//! Linux zone (KVM/OVS-on-bare-metal) cluster driver (§4.5).
//!
//! Talks to the per-worker agent HTTP surface described in §6 ("Egress:
//! worker agent protocol"): `create-vm`, `pause/resume/shutdown/start`
//! (single and bulk by slice), `delete-slice`, `cleanup-vlan`,
//! `apply-security-group`, all bearer-token-protected and returning
//! `{success, message, details?}`. Endpoint names and the VM-create request
//! shape are carried over from the original `vm_node_manager.py` worker
//! agent (`CreateVMRequest`/`VMResponse`).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::WorkerMap;
use crate::domain::{SecurityGroupRule, Slice};
use crate::store::error::{Result, StoreError};
use crate::store::DataStore;

use super::{ClusterDriver, DeployOutcome};

#[derive(Debug, Serialize)]
struct CreateVmRequest {
    id: i64,
    vm_name: String,
    ovs_name: String,
    cpu_cores: u32,
    ram_size: String,
    storage_size: String,
    vnc_port: u32,
    image: String,
    vlans: String,
}

#[derive(Debug, Serialize)]
struct SliceIdRequest {
    id: i64,
}

#[derive(Debug, Serialize)]
struct VmOpRequest {
    id: i64,
    vm_name: String,
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    success: bool,
    message: String,
}

pub struct LinuxDriver {
    http: reqwest::Client,
    workers: WorkerMap,
    agent_token: String,
    store: Arc<dyn DataStore>,
}

impl LinuxDriver {
    pub fn new(workers: WorkerMap, agent_token: String, store: Arc<dyn DataStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            workers,
            agent_token,
            store,
        }
    }

    fn base_url(&self, worker: &str) -> Result<&str> {
        self.workers
            .get(worker)
            .map(String::as_str)
            .ok_or_else(|| StoreError::DriverFailure(format!("unknown linux worker {worker:?}")))
    }

    async fn post<B: Serialize>(&self, worker: &str, path: &str, body: &B) -> Result<()> {
        let base = self.base_url(worker)?;
        let resp = self
            .http
            .post(format!("{base}/{path}"))
            .bearer_auth(&self.agent_token)
            .json(body)
            .send()
            .await
            .map_err(|e| StoreError::DriverFailure(format!("agent call {worker}/{path} failed: {e}")))?;

        let status = resp.status();
        let parsed: AgentResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::DriverFailure(format!("agent response {worker}/{path} malformed: {e}")))?;

        if !status.is_success() || !parsed.success {
            return Err(StoreError::DriverFailure(format!(
                "agent {worker}/{path} reported failure: {}",
                parsed.message
            )));
        }
        Ok(())
    }

    async fn workers_of(&self, slice_id: i64) -> Result<Vec<String>> {
        let slice = self.store.get_slice(slice_id).await?;
        let mut workers: Vec<String> = slice.vms.iter().filter_map(|vm| vm.server.clone()).collect();
        workers.sort();
        workers.dedup();
        Ok(workers)
    }
}

#[async_trait]
impl ClusterDriver for LinuxDriver {
    async fn deploy(&self, slice: &Slice) -> Result<DeployOutcome> {
        let mut by_worker: BTreeMap<String, Vec<&crate::domain::Vm>> = BTreeMap::new();
        for vm in &slice.vms {
            let worker = vm
                .server
                .clone()
                .ok_or_else(|| StoreError::DriverFailure(format!("VM {} has no assigned worker", vm.name)))?;
            by_worker.entry(worker).or_default().push(vm);
        }

        // Reserve VNC displays before any VM is started (§4.5).
        let mut vnc_by_vm = BTreeMap::new();
        for (worker, vms) in &by_worker {
            let displays = match self.store.reserve_displays(slice.id, worker, vms.len()).await {
                Ok(d) => d,
                Err(e) => {
                    let _ = self.store.release_slice(slice.id).await;
                    return Err(e);
                }
            };
            for (vm, display) in vms.iter().zip(displays) {
                vnc_by_vm.insert(vm.name.clone(), display);
            }
        }

        let mut touched_workers: Vec<String> = Vec::new();
        for vm in &slice.vms {
            let worker = vm.server.as_ref().expect("checked above");
            let display = vnc_by_vm[&vm.name];
            let body = CreateVmRequest {
                id: slice.id,
                vm_name: vm.cluster_name(slice.id),
                ovs_name: format!("br-{worker}"),
                cpu_cores: vm.cores,
                ram_size: format!("{}M", vm.ram_mb),
                storage_size: format!("{}G", vm.disk_gb),
                vnc_port: display,
                image: vm.image.clone(),
                vlans: vm.vlans.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
            };

            if !touched_workers.contains(worker) {
                touched_workers.push(worker.clone());
            }

            if let Err(e) = self.post(worker, "create-vm", &body).await {
                for w in &touched_workers {
                    let _ = self.post(w, "delete-slice", &SliceIdRequest { id: slice.id }).await;
                }
                let _ = self.store.release_slice(slice.id).await;
                return Err(e);
            }
        }

        Ok(DeployOutcome {
            vnc_by_vm,
            default_sg_foreign_ids: vec![],
        })
    }

    async fn delete(&self, slice_id: i64) -> Result<()> {
        for worker in self.workers_of(slice_id).await? {
            self.post(&worker, "delete-slice", &SliceIdRequest { id: slice_id }).await?;
            self.post(&worker, "cleanup-vlan", &SliceIdRequest { id: slice_id }).await?;
        }
        self.store.release_slice(slice_id).await
    }

    async fn pause(&self, slice_id: i64) -> Result<()> {
        for worker in self.workers_of(slice_id).await? {
            self.post(&worker, "pause-slice", &SliceIdRequest { id: slice_id }).await?;
        }
        Ok(())
    }

    async fn resume(&self, slice_id: i64) -> Result<()> {
        for worker in self.workers_of(slice_id).await? {
            self.post(&worker, "resume-slice", &SliceIdRequest { id: slice_id }).await?;
        }
        Ok(())
    }

    async fn shutdown(&self, slice_id: i64) -> Result<()> {
        for worker in self.workers_of(slice_id).await? {
            self.post(&worker, "shutdown-slice", &SliceIdRequest { id: slice_id }).await?;
        }
        Ok(())
    }

    async fn start(&self, slice_id: i64) -> Result<()> {
        for worker in self.workers_of(slice_id).await? {
            self.post(&worker, "start-slice", &SliceIdRequest { id: slice_id }).await?;
        }
        Ok(())
    }

    async fn pause_vm(&self, slice_id: i64, vm_name: &str) -> Result<()> {
        let slice = self.store.get_slice(slice_id).await?;
        let worker = worker_of_vm(&slice, vm_name)?;
        self.post(&worker, "pause-vm", &VmOpRequest { id: slice_id, vm_name: vm_name.to_string() }).await
    }

    async fn resume_vm(&self, slice_id: i64, vm_name: &str) -> Result<()> {
        let slice = self.store.get_slice(slice_id).await?;
        let worker = worker_of_vm(&slice, vm_name)?;
        self.post(&worker, "resume-vm", &VmOpRequest { id: slice_id, vm_name: vm_name.to_string() }).await
    }

    async fn shutdown_vm(&self, slice_id: i64, vm_name: &str) -> Result<()> {
        let slice = self.store.get_slice(slice_id).await?;
        let worker = worker_of_vm(&slice, vm_name)?;
        self.post(&worker, "shutdown-vm", &VmOpRequest { id: slice_id, vm_name: vm_name.to_string() }).await
    }

    async fn start_vm(&self, slice_id: i64, vm_name: &str) -> Result<()> {
        let slice = self.store.get_slice(slice_id).await?;
        let worker = worker_of_vm(&slice, vm_name)?;
        self.post(&worker, "start-vm", &VmOpRequest { id: slice_id, vm_name: vm_name.to_string() }).await
    }

    async fn create_custom_sg(&self, slice_id: i64, sg_name: &str) -> Result<()> {
        for worker in self.workers_of(slice_id).await? {
            self.post(
                &worker,
                "apply-security-group",
                &serde_json::json!({ "id": slice_id, "sg_name": sg_name, "action": "create" }),
            )
            .await?;
        }
        Ok(())
    }

    async fn delete_custom_sg(&self, slice_id: i64, sg_name: &str) -> Result<()> {
        for worker in self.workers_of(slice_id).await? {
            self.post(
                &worker,
                "apply-security-group",
                &serde_json::json!({ "id": slice_id, "sg_name": sg_name, "action": "delete" }),
            )
            .await?;
        }
        Ok(())
    }

    async fn delete_default_sg(&self, slice_id: i64) -> Result<()> {
        self.delete_custom_sg(slice_id, "default").await
    }

    async fn add_rule(&self, slice_id: i64, sg_name: &str, rule: &SecurityGroupRule) -> Result<Option<String>> {
        for worker in self.workers_of(slice_id).await? {
            self.post(
                &worker,
                "apply-security-group",
                &serde_json::json!({ "id": slice_id, "sg_name": sg_name, "action": "add-rule", "rule": rule }),
            )
            .await?;
        }
        // The linux zone has no foreign rule-id concept (§3: only openstack).
        Ok(None)
    }

    async fn remove_rule(&self, slice_id: i64, sg_name: &str, rule: &SecurityGroupRule) -> Result<()> {
        for worker in self.workers_of(slice_id).await? {
            self.post(
                &worker,
                "apply-security-group",
                &serde_json::json!({ "id": slice_id, "sg_name": sg_name, "action": "remove-rule", "rule": rule }),
            )
            .await?;
        }
        Ok(())
    }
}

fn worker_of_vm(slice: &Slice, vm_name: &str) -> Result<String> {
    slice
        .vms
        .iter()
        .find(|vm| vm.name == vm_name)
        .and_then(|vm| vm.server.clone())
        .ok_or_else(|| StoreError::NotFound(format!("VM {vm_name:?} not found in slice {}", slice.id)))
}
