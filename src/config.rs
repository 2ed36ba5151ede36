//! Process configuration, parsed once at startup (§10.3).
//!
//! Mirrors the teacher's `main.rs` `Args` struct: a flat `clap::Parser`
//! covering every external endpoint the orchestrator talks to, plus a
//! `--dev` flag that swaps the Postgres/NATS-backed store and queue for
//! in-memory stand-ins so the binary can run without external services.

use std::collections::BTreeMap;

use clap::Parser;

use crate::domain::Zone;

#[derive(Parser, Debug, Clone)]
#[command(name = "slice-orchestrator")]
#[command(about = "Multi-tenant cloud slice orchestrator")]
pub struct Args {
    /// REST API listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL", default_value = "")]
    pub database_url: String,

    /// NATS server URL for the queue substrate.
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// Comma-separated `worker=base_url` pairs for the linux zone's
    /// per-worker agent HTTP endpoints (§6 "Egress: worker agent protocol").
    #[arg(long, value_parser = parse_worker_map, default_value = "")]
    pub linux_workers: WorkerMap,

    /// Comma-separated `worker=availability_zone` pairs for the openstack
    /// zone's workers (availability zones pinned at server-create time).
    #[arg(long, value_parser = parse_worker_map, default_value = "")]
    pub openstack_workers: WorkerMap,

    /// Base URL of the Prometheus-compatible telemetry source (§6).
    #[arg(long, default_value = "http://prometheus:9090")]
    pub prometheus_url: String,

    /// Base URL of the OpenStack control plane (Identity/Compute/Network),
    /// fronted as a single endpoint per §6.
    #[arg(long, default_value = "http://openstack-headnode:5000")]
    pub openstack_url: String,

    /// Blackbox-exporter `instance` label identifying the linux zone's
    /// headnode (§4.3 cluster-reachability probe).
    #[arg(long, default_value = "headnode-linux")]
    pub linux_headnode_instance: String,

    /// Blackbox-exporter `instance` label identifying the openstack zone's
    /// headnode (§4.3 cluster-reachability probe).
    #[arg(long, default_value = "headnode-openstack")]
    pub openstack_headnode_instance: String,

    /// Well-known shared "internet" OpenStack network id (§9 open question:
    /// configuration parameter, not a hard-coded constant).
    #[arg(long, default_value = "")]
    pub openstack_internet_network_id: String,

    /// Admin-scoped Keystone token used by the openstack driver to create
    /// per-slice projects, networks, ports, and servers.
    #[arg(long, env = "OPENSTACK_ADMIN_TOKEN", default_value = "")]
    pub openstack_admin_token: String,

    /// Bearer token the linux zone's worker agents expect on every call
    /// (§6 "Egress: worker agent protocol").
    #[arg(long, env = "LINUX_AGENT_TOKEN", default_value = "")]
    pub linux_agent_token: String,

    /// Base URL of the image catalog (§6 "Egress: image catalog").
    #[arg(long, default_value = "http://image-catalog:8090")]
    pub image_catalog_url: String,

    /// HMAC key used to verify bearer tokens (issuance is out of scope, §1).
    #[arg(long, env = "JWT_SECRET", default_value = "")]
    pub jwt_secret: String,

    /// Run against in-memory store/queue stand-ins instead of Postgres/NATS;
    /// used by the integration tests and for local experimentation.
    #[arg(long)]
    pub dev: bool,
}

/// `worker_name -> value` parsed from a `k=v,k=v` CLI argument.
pub type WorkerMap = BTreeMap<String, String>;

fn parse_worker_map(raw: &str) -> Result<WorkerMap, String> {
    let mut map = BTreeMap::new();
    for pair in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected worker=value, got {pair:?}"))?;
        map.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(map)
}

impl Args {
    pub fn workers_for(&self, zone: Zone) -> &WorkerMap {
        match zone {
            Zone::Linux => &self.linux_workers,
            Zone::Openstack => &self.openstack_workers,
        }
    }

    pub fn headnode_instance_for(&self, zone: Zone) -> &str {
        match zone {
            Zone::Linux => &self.linux_headnode_instance,
            Zone::Openstack => &self.openstack_headnode_instance,
        }
    }
}
