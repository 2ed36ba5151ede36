//! OpenStack zone cluster driver (§4.5).
//!
//! Grounded in `z_cluster_openstack/headnode/main.py`'s `deploy_topology`/
//! `delete_slice`/`_slice_action`/`_vm_action` shape: one tenant project per
//! slice, one VLAN-provider network (plus subnet) per allocated VLAN, one
//! port per (VM, VLAN) pair, one server per VM pinned to an availability
//! zone derived from the assigned worker. Every step failure rolls back the
//! project and everything nested under it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::WorkerMap;
use crate::domain::{SecurityGroupRule, Slice};
use crate::store::error::{Result, StoreError};
use crate::store::DataStore;

use super::{ClusterDriver, DeployOutcome};

pub struct OpenstackDriver {
    http: reqwest::Client,
    base_url: String,
    admin_token: String,
    internet_network_id: String,
    /// worker -> availability zone name.
    availability_zones: WorkerMap,
    store: Arc<dyn DataStore>,
}

impl OpenstackDriver {
    pub fn new(
        base_url: String,
        admin_token: String,
        internet_network_id: String,
        availability_zones: WorkerMap,
        store: Arc<dyn DataStore>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            admin_token,
            internet_network_id,
            availability_zones,
            store,
        }
    }

    fn project_name(slice_id: i64) -> String {
        format!("id{slice_id}_project")
    }

    fn network_name(slice_id: i64, vlan: u32) -> String {
        format!("id{slice_id}_net_{vlan}")
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        let mut req = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .header("X-Auth-Token", &self.admin_token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("openstack call {path} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StoreError::DriverFailure(format!(
                "openstack {path} returned {status}: {text}"
            )));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        resp.json()
            .await
            .map_err(|e| StoreError::DriverFailure(format!("openstack response {path} malformed: {e}")))
    }

    async fn create_project(&self, slice_id: i64) -> Result<String> {
        let resp = self
            .request(
                reqwest::Method::POST,
                "/v3/projects",
                Some(json!({ "project": { "name": Self::project_name(slice_id), "enabled": true } })),
            )
            .await?;
        resp["project"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StoreError::DriverFailure("openstack project create: missing id".into()))
    }

    async fn create_network_and_subnet(&self, project_id: &str, slice_id: i64, vlan: u32) -> Result<String> {
        let net = self
            .request(
                reqwest::Method::POST,
                "/v2.0/networks",
                Some(json!({ "network": {
                    "name": Self::network_name(slice_id, vlan),
                    "project_id": project_id,
                    "provider:network_type": "vlan",
                    "provider:segmentation_id": vlan,
                } })),
            )
            .await?;
        let network_id = net["network"]["id"]
            .as_str()
            .ok_or_else(|| StoreError::DriverFailure("openstack network create: missing id".into()))?
            .to_string();

        self.request(
            reqwest::Method::POST,
            "/v2.0/subnets",
            Some(json!({ "subnet": {
                "network_id": network_id,
                "project_id": project_id,
                "ip_version": 4,
                "cidr": format!("10.{}.{}.0/24", vlan / 256, vlan % 256),
            } })),
        )
        .await?;

        Ok(network_id)
    }

    async fn create_port(&self, project_id: &str, network_id: &str) -> Result<String> {
        let resp = self
            .request(
                reqwest::Method::POST,
                "/v2.0/ports",
                Some(json!({ "port": { "network_id": network_id, "project_id": project_id } })),
            )
            .await?;
        resp["port"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StoreError::DriverFailure("openstack port create: missing id".into()))
    }

    async fn create_server(
        &self,
        project_id: &str,
        slice: &Slice,
        vm: &crate::domain::Vm,
        port_ids: &[String],
        availability_zone: &str,
    ) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            "/v2.1/servers",
            Some(json!({ "server": {
                "name": vm.cluster_name(slice.id),
                "project_id": project_id,
                "imageRef": vm.image,
                "flavorRef": format!("cores-{}-ram-{}-disk-{}", vm.cores, vm.ram_mb, vm.disk_gb),
                "availability_zone": availability_zone,
                "networks": port_ids.iter().map(|p| json!({ "port": p })).collect::<Vec<_>>(),
            } })),
        )
        .await?;
        Ok(())
    }

    async fn delete_project_cascade(&self, project_id: &str) {
        let _ = self
            .request(reqwest::Method::DELETE, &format!("/v3/projects/{project_id}"), None)
            .await;
    }

    async fn availability_zone_for(&self, worker: &str) -> Result<String> {
        self.availability_zones
            .get(worker)
            .cloned()
            .ok_or_else(|| StoreError::DriverFailure(format!("no availability zone configured for worker {worker:?}")))
    }

    async fn project_id_for_slice(&self, slice_id: i64) -> Result<String> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v3/projects?name={}", Self::project_name(slice_id)),
                None,
            )
            .await?;
        resp["projects"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|p| p["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| StoreError::NotFound(format!("no openstack project for slice {slice_id}")))
    }

    async fn server_action(&self, slice_id: i64, vm_name: &str, action: &str) -> Result<()> {
        let server_name = format!("id{slice_id}_{vm_name}");
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v2.1/servers?name={server_name}"),
                None,
            )
            .await?;
        let server_id = resp["servers"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|s| s["id"].as_str())
            .ok_or_else(|| StoreError::NotFound(format!("server {server_name} not found")))?;
        self.request(
            reqwest::Method::POST,
            &format!("/v2.1/servers/{server_id}/action"),
            Some(json!({ action: None::<Value> })),
        )
        .await?;
        Ok(())
    }

    async fn vm_names_of(&self, slice_id: i64) -> Result<Vec<String>> {
        let slice = self.store.get_slice(slice_id).await?;
        Ok(slice.vms.into_iter().map(|vm| vm.name).collect())
    }
}

#[async_trait]
impl ClusterDriver for OpenstackDriver {
    async fn deploy(&self, slice: &Slice) -> Result<DeployOutcome> {
        let project_id = self.create_project(slice.id).await?;

        let deploy_result: Result<()> = async {
            let mut network_by_vlan: BTreeMap<u32, String> = BTreeMap::new();
            for &vlan in &slice.vlans {
                let network_id = self.create_network_and_subnet(&project_id, slice.id, vlan).await?;
                network_by_vlan.insert(vlan, network_id);
            }

            for vm in &slice.vms {
                let worker = vm
                    .server
                    .as_ref()
                    .ok_or_else(|| StoreError::DriverFailure(format!("VM {} has no assigned worker", vm.name)))?;
                let availability_zone = self.availability_zone_for(worker).await?;

                let mut port_ids = Vec::with_capacity(vm.vlans.len());
                for vlan in &vm.vlans {
                    let network_id = if *vlan == self.internet_network_id_for_zone() {
                        self.internet_network_id.clone()
                    } else {
                        network_by_vlan
                            .get(vlan)
                            .cloned()
                            .ok_or_else(|| StoreError::DriverFailure(format!("no network for vlan {vlan}")))?
                    };
                    port_ids.push(self.create_port(&project_id, &network_id).await?);
                }

                self.create_server(&project_id, slice, vm, &port_ids, &availability_zone).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = deploy_result {
            self.delete_project_cascade(&project_id).await;
            return Err(e);
        }

        Ok(DeployOutcome {
            vnc_by_vm: BTreeMap::new(),
            default_sg_foreign_ids: vec![],
        })
    }

    async fn delete(&self, slice_id: i64) -> Result<()> {
        match self.project_id_for_slice(slice_id).await {
            Ok(project_id) => {
                self.delete_project_cascade(&project_id).await;
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()), // idempotent
            Err(e) => Err(e),
        }
    }

    async fn pause(&self, slice_id: i64) -> Result<()> {
        for vm_name in self.vm_names_of(slice_id).await? {
            self.server_action(slice_id, &vm_name, "os-pause").await?;
        }
        Ok(())
    }

    async fn resume(&self, slice_id: i64) -> Result<()> {
        for vm_name in self.vm_names_of(slice_id).await? {
            self.server_action(slice_id, &vm_name, "os-unpause").await?;
        }
        Ok(())
    }

    async fn shutdown(&self, slice_id: i64) -> Result<()> {
        for vm_name in self.vm_names_of(slice_id).await? {
            self.server_action(slice_id, &vm_name, "os-stop").await?;
        }
        Ok(())
    }

    async fn start(&self, slice_id: i64) -> Result<()> {
        for vm_name in self.vm_names_of(slice_id).await? {
            self.server_action(slice_id, &vm_name, "os-start").await?;
        }
        Ok(())
    }

    async fn pause_vm(&self, slice_id: i64, vm_name: &str) -> Result<()> {
        self.server_action(slice_id, vm_name, "os-pause").await
    }

    async fn resume_vm(&self, slice_id: i64, vm_name: &str) -> Result<()> {
        self.server_action(slice_id, vm_name, "os-unpause").await
    }

    async fn shutdown_vm(&self, slice_id: i64, vm_name: &str) -> Result<()> {
        self.server_action(slice_id, vm_name, "os-stop").await
    }

    async fn start_vm(&self, slice_id: i64, vm_name: &str) -> Result<()> {
        self.server_action(slice_id, vm_name, "os-start").await
    }

    async fn create_custom_sg(&self, slice_id: i64, sg_name: &str) -> Result<()> {
        let project_id = self.project_id_for_slice(slice_id).await?;
        self.request(
            reqwest::Method::POST,
            "/v2.0/security-groups",
            Some(json!({ "security_group": { "name": sg_name, "project_id": project_id } })),
        )
        .await?;
        Ok(())
    }

    async fn delete_custom_sg(&self, slice_id: i64, sg_name: &str) -> Result<()> {
        let id = self.sg_id_by_name(slice_id, sg_name).await?;
        self.request(reqwest::Method::DELETE, &format!("/v2.0/security-groups/{id}"), None)
            .await?;
        Ok(())
    }

    async fn delete_default_sg(&self, slice_id: i64) -> Result<()> {
        self.delete_custom_sg(slice_id, "default").await
    }

    async fn add_rule(&self, slice_id: i64, sg_name: &str, rule: &SecurityGroupRule) -> Result<Option<String>> {
        let sg_id = self.sg_id_by_name(slice_id, sg_name).await?;
        let resp = self
            .request(
                reqwest::Method::POST,
                "/v2.0/security-group-rules",
                Some(json!({ "security_group_rule": {
                    "security_group_id": sg_id,
                    "direction": rule.direction,
                    "ethertype": rule.ether_type,
                    "protocol": rule.protocol,
                    "port_range_min": rule.port_range_start,
                    "port_range_max": rule.port_range_end,
                    "remote_ip_prefix": rule.remote_cidr,
                } })),
            )
            .await?;
        Ok(resp["security_group_rule"]["id"].as_str().map(str::to_string))
    }

    async fn remove_rule(&self, slice_id: i64, sg_name: &str, rule: &SecurityGroupRule) -> Result<()> {
        let Some(foreign_id) = &rule.foreign_id else {
            return Err(StoreError::DriverFailure(format!(
                "rule {} in {sg_name} has no openstack foreign id",
                rule.id
            )));
        };
        let _ = slice_id;
        self.request(
            reqwest::Method::DELETE,
            &format!("/v2.0/security-group-rules/{foreign_id}"),
            None,
        )
        .await?;
        Ok(())
    }
}

impl OpenstackDriver {
    /// Well-known internet VLAN for this zone (§3); kept here rather than a
    /// free function since the mapping to a network id is driver state.
    fn internet_network_id_for_zone(&self) -> u32 {
        crate::domain::Zone::Openstack.internet_vlan()
    }

    async fn sg_id_by_name(&self, slice_id: i64, sg_name: &str) -> Result<String> {
        let project_id = self.project_id_for_slice(slice_id).await?;
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v2.0/security-groups?project_id={project_id}&name={sg_name}"),
                None,
            )
            .await?;
        resp["security_groups"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|sg| sg["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| StoreError::NotFound(format!("security group {sg_name:?} not found for slice {slice_id}")))
    }
}
