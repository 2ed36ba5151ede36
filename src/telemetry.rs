//! PromQL-style telemetry client (§4.3, §6 "Telemetry source").
//!
//! Query shapes are carried over verbatim from the original
//! `vm_placement_api/placement_algorithm.py`'s `PrometheusClient`
//! (blackbox headnode/worker probes, 10-minute `avg_over_time` windows for
//! CPU/RAM/disk) since spec §4.3 only describes them in prose.
//!
//! Per §9's design note, telemetry is treated as a pure function of time:
//! callers re-query per VM in the placement loop rather than caching, so
//! scoring always reflects the latest *used* numbers.

use serde::Deserialize;

use crate::domain::Zone;
use crate::store::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerMetrics {
    pub total_cpu: f64,
    pub total_ram_gb: f64,
    pub total_disk_gb: f64,
    pub used_cpu: f64,
    pub used_ram_gb: f64,
    pub used_disk_gb: f64,
    pub state: WorkerState,
}

#[derive(Debug, Clone)]
pub struct TelemetryClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct PromResponse {
    status: String,
    data: PromData,
}

#[derive(Deserialize)]
struct PromData {
    result: Vec<PromResult>,
}

#[derive(Deserialize)]
struct PromResult {
    value: (f64, String),
}

impl TelemetryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Run a PromQL instant query and return its scalar value, or 0.0 if the
    /// result vector is empty (matches the original's fail-soft behavior --
    /// callers distinguish "down" from "zero" via the dedicated probe query).
    pub async fn query(&self, promql: &str) -> Result<f64> {
        let resp = self
            .http
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", promql)])
            .send()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("telemetry query failed: {e}")))?;

        let parsed: PromResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("telemetry response malformed: {e}")))?;

        if parsed.status != "success" {
            return Ok(0.0);
        }
        Ok(parsed
            .data
            .result
            .first()
            .and_then(|r| r.value.1.parse::<f64>().ok())
            .unwrap_or(0.0))
    }

    /// Blackbox probe against the zone's headnode (§4.3 (i)).
    pub async fn check_cluster_availability(&self, zone: Zone, headnode_instance: &str) -> Result<bool> {
        let value = self
            .query(&format!(
                r#"probe_success{{job="blackbox-headnodes", instance="{headnode_instance}", cluster="{}"}}"#,
                zone.as_str()
            ))
            .await?;
        Ok(value == 1.0)
    }

    /// Full metrics bundle for one worker (§4.3 (ii)-(iv)).
    pub async fn worker_metrics(&self, worker_instance: &str, zone: Zone) -> Result<WorkerMetrics> {
        let blackbox_job = format!("blackbox-workers-{}", zone.as_str());
        let node_instance = format!("{worker_instance}:9100");

        let total_cpu = self
            .query(&format!(
                r#"count(node_cpu_seconds_total{{mode="idle", instance="{node_instance}"}}) by (instance)"#
            ))
            .await?;

        let total_ram_bytes = self
            .query(&format!(r#"node_memory_MemTotal_bytes{{instance="{node_instance}"}}"#))
            .await?;
        let total_ram_gb = total_ram_bytes / GIB;

        let total_disk_bytes = self
            .query(&format!(
                r#"node_filesystem_size_bytes{{instance="{node_instance}", mountpoint="/", fstype!="tmpfs"}}"#
            ))
            .await?;
        let total_disk_gb = total_disk_bytes / GIB;

        let used_cpu_percent = self
            .query(&format!(
                r#"100 - (avg_over_time(avg by (instance) (rate(node_cpu_seconds_total{{mode="idle", instance="{node_instance}"}}[5m]))[10m:]) * 100)"#
            ))
            .await?;
        let used_cpu = (used_cpu_percent / 100.0) * total_cpu;

        let used_ram_bytes = self
            .query(&format!(
                r#"avg_over_time((node_memory_MemTotal_bytes{{instance="{node_instance}"}} - node_memory_MemAvailable_bytes{{instance="{node_instance}"}})[10m:])"#
            ))
            .await?;
        let used_ram_gb = used_ram_bytes / GIB;

        let used_disk_bytes = self
            .query(&format!(
                r#"avg_over_time((node_filesystem_size_bytes{{instance="{node_instance}", mountpoint="/", fstype!="tmpfs"}} - node_filesystem_avail_bytes{{instance="{node_instance}", mountpoint="/", fstype!="tmpfs"}})[10m:])"#
            ))
            .await?;
        let used_disk_gb = used_disk_bytes / GIB;

        let probe = self
            .query(&format!(r#"probe_success{{job="{blackbox_job}", instance="{worker_instance}"}}"#))
            .await?;
        let state = if probe == 1.0 { WorkerState::Up } else { WorkerState::Down };

        Ok(WorkerMetrics {
            total_cpu,
            total_ram_gb,
            total_disk_gb,
            used_cpu,
            used_ram_gb,
            used_disk_gb,
            state,
        })
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
