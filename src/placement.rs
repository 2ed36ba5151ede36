//! Placement Engine (C3, spec §4.3).
//!
//! Scores each zone worker for every VM in turn using live telemetry plus
//! the placement ledger's *assigned* column, picks the best-scoring
//! admissible worker, and rolls back every ledger entry it added for the
//! slice if any VM turns out to be unplaceable. Scoring weights and the
//! capacity/stability formulas are carried over verbatim from
//! `vm_placement_api/placement_algorithm.py`'s `VMPlacementAlgorithm`.

use std::collections::BTreeMap;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::domain::{PlacementEntry, Vm, Zone};
use crate::store::{PlacementStore, Result, StoreError};
use crate::telemetry::{TelemetryClient, WorkerState};

/// OpenStack-style overcommit ratios applied to raw totals (§4.3).
const CPU_ALLOCATION_RATIO: f64 = 16.0;
const RAM_ALLOCATION_RATIO: f64 = 1.5;
const DISK_ALLOCATION_RATIO: f64 = 1.0;

const CAP_WEIGHT_RAM: f64 = 0.5;
const CAP_WEIGHT_CPU: f64 = 0.3;
const CAP_WEIGHT_DISK: f64 = 0.2;

const STAB_WEIGHT_RAM: f64 = 0.65;
const STAB_WEIGHT_CPU: f64 = 0.15;
const STAB_WEIGHT_DISK: f64 = 0.2;

const FINAL_WEIGHT_CAPACITY: f64 = 0.6;
const FINAL_WEIGHT_STABILITY: f64 = 0.4;

#[derive(Debug, Clone, Copy, Default)]
struct Resources {
    cpu: f64,
    ram_gb: f64,
    disk_gb: f64,
}

#[derive(Debug, Clone, Copy)]
struct WorkerSnapshot {
    total: Resources,
    used: Resources,
    assigned: Resources,
    available: Resources,
    state: WorkerState,
}

/// Per-VM resource ask, converted to the same (cpu cores, GB, GB) units the
/// scoring formulas operate on.
#[derive(Debug, Clone, Copy)]
struct VmRequirements {
    cpu: f64,
    ram_gb: f64,
    disk_gb: f64,
}

fn vm_requirements(vm: &Vm) -> VmRequirements {
    VmRequirements {
        cpu: vm.cores as f64,
        ram_gb: vm.ram_mb as f64 / 1024.0,
        disk_gb: vm.disk_gb as f64,
    }
}

fn calculate_available(total: Resources, assigned: Resources) -> Resources {
    Resources {
        cpu: total.cpu * CPU_ALLOCATION_RATIO - assigned.cpu,
        ram_gb: total.ram_gb * RAM_ALLOCATION_RATIO - assigned.ram_gb,
        disk_gb: total.disk_gb * DISK_ALLOCATION_RATIO - assigned.disk_gb,
    }
}

fn can_fit(available: Resources, req: VmRequirements) -> bool {
    available.cpu >= req.cpu && available.ram_gb >= req.ram_gb && available.disk_gb >= req.disk_gb
}

fn capacity_score(available: Resources, total: Resources) -> f64 {
    let total_with_ratio = Resources {
        cpu: total.cpu * CPU_ALLOCATION_RATIO,
        ram_gb: total.ram_gb * RAM_ALLOCATION_RATIO,
        disk_gb: total.disk_gb * DISK_ALLOCATION_RATIO,
    };
    let ram_ratio = ratio(available.ram_gb, total_with_ratio.ram_gb);
    let cpu_ratio = ratio(available.cpu, total_with_ratio.cpu);
    let disk_ratio = ratio(available.disk_gb, total_with_ratio.disk_gb);
    let score = CAP_WEIGHT_RAM * ram_ratio + CAP_WEIGHT_CPU * cpu_ratio + CAP_WEIGHT_DISK * disk_ratio;
    score.clamp(0.0, 1.0)
}

fn stability_score(used: Resources, total: Resources) -> f64 {
    let ram_ratio = ratio(used.ram_gb, total.ram_gb);
    let cpu_ratio = ratio(used.cpu, total.cpu);
    let disk_ratio = ratio(used.disk_gb, total.disk_gb);
    let saturation =
        STAB_WEIGHT_RAM * ram_ratio + STAB_WEIGHT_CPU * cpu_ratio + STAB_WEIGHT_DISK * disk_ratio;
    (1.0 - saturation).clamp(0.0, 1.0)
}

fn final_score(cap: f64, stab: f64) -> f64 {
    FINAL_WEIGHT_CAPACITY * cap + FINAL_WEIGHT_STABILITY * stab
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn find_best_worker(req: VmRequirements, workers: &BTreeMap<String, WorkerSnapshot>) -> Option<String> {
    let mut best: Option<(String, f64)> = None;
    for (worker, snap) in workers {
        if snap.state != WorkerState::Up {
            continue;
        }
        if !can_fit(snap.available, req) {
            continue;
        }
        let cap = capacity_score(snap.available, snap.total);
        let stab = stability_score(snap.used, snap.total);
        let score = final_score(cap, stab);
        if best.as_ref().is_none_or(|(_, best_score)| score > *best_score) {
            best = Some((worker.clone(), score));
        }
    }
    best.map(|(worker, _)| worker)
}

/// Assigns every VM in `vms` to a worker in `zone`, mutating `vm.server` in
/// place. On partial failure, every ledger entry this call added is rolled
/// back and a `resource_exhausted` error is returned (§4.3, scenario S4).
pub async fn assign_vms(
    store: &dyn PlacementStore,
    telemetry: &TelemetryClient,
    headnode_instance: &str,
    zone: Zone,
    slice_id: i64,
    workers: &[String],
    vms: &mut [Vm],
) -> Result<()> {
    if !telemetry.check_cluster_availability(zone, headnode_instance).await? {
        return Err(StoreError::DependencyUnavailable(format!(
            "zone {} unavailable: headnode probe down",
            zone.as_str()
        )));
    }

    let mut snapshots = BTreeMap::new();
    for worker in workers {
        let metrics = match telemetry.worker_metrics(worker, zone).await {
            Ok(m) => m,
            Err(e) => {
                warn!(worker, error = %e, "could not fetch worker metrics, skipping");
                continue;
            }
        };
        let (assigned_cpu, assigned_ram_gb, assigned_disk_gb) =
            store.assigned_resources(zone, worker).await?;
        let total = Resources {
            cpu: metrics.total_cpu,
            ram_gb: metrics.total_ram_gb,
            disk_gb: metrics.total_disk_gb,
        };
        let assigned = Resources {
            cpu: assigned_cpu,
            ram_gb: assigned_ram_gb,
            disk_gb: assigned_disk_gb,
        };
        let available = calculate_available(total, assigned);
        snapshots.insert(
            worker.clone(),
            WorkerSnapshot {
                total,
                used: Resources {
                    cpu: metrics.used_cpu,
                    ram_gb: metrics.used_ram_gb,
                    disk_gb: metrics.used_disk_gb,
                },
                assigned,
                available,
                state: metrics.state,
            },
        );
    }

    let any_up = snapshots.values().any(|s| s.state == WorkerState::Up);
    if !any_up || snapshots.is_empty() {
        return Err(StoreError::DependencyUnavailable(format!(
            "zone {} unavailable: every worker is down or unreachable",
            zone.as_str()
        )));
    }

    let total_available_cpu: f64 = snapshots
        .values()
        .filter(|s| s.state == WorkerState::Up)
        .map(|s| s.available.cpu)
        .sum();
    let total_available_ram: f64 = snapshots
        .values()
        .filter(|s| s.state == WorkerState::Up)
        .map(|s| s.available.ram_gb)
        .sum();
    if total_available_cpu <= 0.0 && total_available_ram <= 0.0 {
        return Err(StoreError::ResourceExhausted(format!(
            "zone {} is at full capacity",
            zone.as_str()
        )));
    }

    for vm in vms.iter_mut() {
        let req = vm_requirements(vm);
        let Some(worker) = find_best_worker(req, &snapshots) else {
            let removed = store.remove_slice(zone, slice_id).await?;
            warn!(slice_id, zone = zone.as_str(), removed, "placement rollback");
            return Err(StoreError::ResourceExhausted(format!(
                "VM {} could not be placed: no admissible worker in zone {}",
                vm.name,
                zone.as_str()
            )));
        };

        vm.server = Some(worker.clone());
        store
            .add_entry(
                zone,
                &worker,
                PlacementEntry {
                    slice_id,
                    vm_name: vm.name.clone(),
                    cores: vm.cores,
                    ram_mb: vm.ram_mb,
                    disk_gb: vm.disk_gb,
                },
            )
            .await?;

        info!(slice_id, vm = %vm.name, worker, "VM placed");

        if let Some(snap) = snapshots.get_mut(&worker) {
            snap.available.cpu -= req.cpu;
            snap.available.ram_gb -= req.ram_gb;
            snap.available.disk_gb -= req.disk_gb;
            snap.assigned.cpu += req.cpu;
            snap.assigned.ram_gb += req.ram_gb;
            snap.assigned.disk_gb += req.disk_gb;
        }
    }

    Ok(())
}

/// Zone-scoped mutex held across the telemetry read and ledger write of a
/// single `assign_vms` call (§5 "a zone mutex held across the telemetry read
/// and ledger write"). A DB advisory lock was ruled out here, unlike VLAN
/// allocation: holding one across an outbound HTTP telemetry call for the
/// length of a whole slice's placement would pin a pool connection for the
/// duration of the round trips.
pub struct ZoneLocks {
    linux: AsyncMutex<()>,
    openstack: AsyncMutex<()>,
}

impl Default for ZoneLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneLocks {
    pub fn new() -> Self {
        Self {
            linux: AsyncMutex::new(()),
            openstack: AsyncMutex::new(()),
        }
    }

    pub fn for_zone(&self, zone: Zone) -> &AsyncMutex<()> {
        match zone {
            Zone::Linux => &self.linux,
            Zone::Openstack => &self.openstack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn capacity_score_matches_worked_example() {
        let total = Resources { cpu: 8.0, ram_gb: 16.0, disk_gb: 100.0 };
        let available = calculate_available(total, Resources::default());
        let score = capacity_score(available, total);
        assert!((0.999..=1.0).contains(&score));
    }

    #[test]
    fn stability_score_drops_as_usage_rises() {
        let total = Resources { cpu: 8.0, ram_gb: 16.0, disk_gb: 100.0 };
        let low_use = Resources { cpu: 1.0, ram_gb: 1.0, disk_gb: 10.0 };
        let high_use = Resources { cpu: 7.0, ram_gb: 15.0, disk_gb: 90.0 };
        assert!(stability_score(low_use, total) > stability_score(high_use, total));
    }

    #[test]
    fn find_best_worker_skips_down_and_undersized() {
        let mut workers = BTreeMap::new();
        workers.insert(
            "worker-down".to_string(),
            WorkerSnapshot {
                total: Resources { cpu: 64.0, ram_gb: 64.0, disk_gb: 1000.0 },
                used: Resources::default(),
                assigned: Resources::default(),
                available: Resources { cpu: 64.0, ram_gb: 64.0, disk_gb: 1000.0 },
                state: WorkerState::Down,
            },
        );
        workers.insert(
            "worker-tiny".to_string(),
            WorkerSnapshot {
                total: Resources { cpu: 1.0, ram_gb: 1.0, disk_gb: 1.0 },
                used: Resources::default(),
                assigned: Resources::default(),
                available: Resources { cpu: 0.1, ram_gb: 0.1, disk_gb: 0.1 },
                state: WorkerState::Up,
            },
        );
        workers.insert(
            "worker-ok".to_string(),
            WorkerSnapshot {
                total: Resources { cpu: 8.0, ram_gb: 16.0, disk_gb: 100.0 },
                used: Resources::default(),
                assigned: Resources::default(),
                available: Resources { cpu: 8.0, ram_gb: 16.0, disk_gb: 100.0 },
                state: WorkerState::Up,
            },
        );

        let req = VmRequirements { cpu: 1.0, ram_gb: 1.0, disk_gb: 1.0 };
        assert_eq!(find_best_worker(req, &workers), Some("worker-ok".to_string()));
    }

    #[tokio::test]
    async fn ledger_rollback_removes_only_the_failed_slice() {
        let store = MemoryStore::new();
        let zone = Zone::Linux;
        store
            .add_entry(
                zone,
                "worker1",
                PlacementEntry { slice_id: 1, vm_name: "vm1".into(), cores: 2, ram_mb: 2048, disk_gb: 10 },
            )
            .await
            .unwrap();
        store
            .add_entry(
                zone,
                "worker1",
                PlacementEntry { slice_id: 2, vm_name: "vm1".into(), cores: 1, ram_mb: 512, disk_gb: 4 },
            )
            .await
            .unwrap();

        let removed = store.remove_slice(zone, 1).await.unwrap();
        assert_eq!(removed, 1);
        let remaining = store.list_zone(zone).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1.slice_id, 2);
    }
}
