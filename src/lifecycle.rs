//! Lifecycle State Machine (C4, spec §4.4).
//!
//! Drives VM and slice runtime transitions through the `Driver` façade and
//! keeps the store's `runtime_state` column in sync with the per-VM states
//! it derives from, the way `mvirt-api/src/state.rs` applies one state
//! mutation at a time against its own aggregate rather than recomputing
//! from scratch. Every operation here is serialized per slice id (§5) via
//! `SliceLocks`, since two concurrent pause/resume calls on the same slice
//! must not race on the store's `update_vms`/`set_runtime_state` pair.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::domain::{RuntimeState, Slice, VmState};
use crate::drivers::Driver;
use crate::store::{DataStore, Result, StoreError};

/// Single VM action requested through the REST surface (§4.4 diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Pause,
    Resume,
    Shutdown,
    Start,
}

/// Validate a VM-level transition against the state diagram in §4.4:
/// Corriendo <-> Pausado, either -> Apagado, Apagado -> Corriendo (start).
/// Returns the resulting state, or a `conflict` if the action does not apply
/// to the VM's current state.
pub fn validate_vm_transition(current: VmState, action: VmAction) -> Result<VmState> {
    use VmAction::*;
    use VmState::*;
    match (current, action) {
        (Corriendo, Pause) => Ok(Pausado),
        (Pausado, Resume) => Ok(Corriendo),
        (Corriendo, Shutdown) | (Pausado, Shutdown) => Ok(Apagado),
        (Apagado, Start) => Ok(Corriendo),
        (state, action) => Err(StoreError::Conflict(format!(
            "cannot {action:?} a VM in state {state:?}"
        ))),
    }
}

/// Derive a slice's runtime state from its VMs' individual states (§4.4):
/// any VM Corriendo makes the slice Corriendo; a uniform Pausado or Apagado
/// set makes the slice that state; a mixed Pausado/Apagado set (no VM
/// running) reports Corriendo, since at least one VM would need to be woken
/// to call the slice settled in either terminal state.
pub fn derive_runtime_state(states: &[VmState]) -> Option<RuntimeState> {
    if states.is_empty() {
        return None;
    }
    if states.iter().any(|s| *s == VmState::Corriendo) {
        return Some(RuntimeState::Corriendo);
    }
    if states.iter().all(|s| *s == VmState::Pausado) {
        return Some(RuntimeState::Pausado);
    }
    if states.iter().all(|s| *s == VmState::Apagado) {
        return Some(RuntimeState::Apagado);
    }
    Some(RuntimeState::Corriendo)
}

/// Per-slice mutex registry (§5 "serialized per slice id"), grown lazily.
#[derive(Default)]
pub struct SliceLocks {
    inner: std::sync::Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl SliceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, slice_id: i64) -> tokio::sync::OwnedMutexGuard<()> {
        let entry = {
            let mut guard = self.inner.lock().expect("slice lock registry poisoned");
            guard.entry(slice_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        entry.lock_owned().await
    }
}

async fn audit_vm_change(
    store: &dyn DataStore,
    audit: &crate::audit::ApiAuditLogger,
    slice: &Slice,
    vm_name: &str,
    old: Option<VmState>,
    new: VmState,
) -> Result<()> {
    let mut vms = slice.vms.clone();
    let vm = vms
        .iter_mut()
        .find(|v| v.name == vm_name)
        .ok_or_else(|| StoreError::NotFound(format!("VM {vm_name:?} not found in slice {}", slice.id)))?;
    vm.state = Some(new);
    store.update_vms(slice.id, vms.clone()).await?;

    let derived = derive_runtime_state(&vms.iter().filter_map(|v| v.state).collect::<Vec<_>>());
    if derived != slice.runtime_state {
        store.set_runtime_state(slice.id, derived).await?;
    }
    audit.vm_state_changed(slice.id, vm_name, old.map(debug_state), debug_state(new));
    Ok(())
}

fn debug_state(s: VmState) -> &'static str {
    match s {
        VmState::Corriendo => "Corriendo",
        VmState::Pausado => "Pausado",
        VmState::Apagado => "Apagado",
    }
}

async fn single_vm_op(
    store: &dyn DataStore,
    driver: &Driver,
    locks: &SliceLocks,
    audit: &crate::audit::ApiAuditLogger,
    slice_id: i64,
    vm_name: &str,
    action: VmAction,
) -> Result<()> {
    let _guard = locks.lock_for(slice_id).await;
    let slice = store.get_slice(slice_id).await?;
    let vm = slice
        .vms
        .iter()
        .find(|v| v.name == vm_name)
        .ok_or_else(|| StoreError::NotFound(format!("VM {vm_name:?} not found in slice {slice_id}")))?;
    let current = vm
        .state
        .ok_or_else(|| StoreError::Conflict(format!("VM {vm_name:?} has no runtime state yet")))?;
    let target = validate_vm_transition(current, action)?;

    let driver = driver.for_zone(slice.zone);
    match action {
        VmAction::Pause => driver.pause_vm(slice_id, vm_name).await?,
        VmAction::Resume => driver.resume_vm(slice_id, vm_name).await?,
        VmAction::Shutdown => driver.shutdown_vm(slice_id, vm_name).await?,
        VmAction::Start => driver.start_vm(slice_id, vm_name).await?,
    }

    audit_vm_change(store, audit, &slice, vm_name, Some(current), target).await
}

pub async fn pause_vm(store: &dyn DataStore, driver: &Driver, locks: &SliceLocks, audit: &crate::audit::ApiAuditLogger, slice_id: i64, vm_name: &str) -> Result<()> {
    single_vm_op(store, driver, locks, audit, slice_id, vm_name, VmAction::Pause).await
}

pub async fn resume_vm(store: &dyn DataStore, driver: &Driver, locks: &SliceLocks, audit: &crate::audit::ApiAuditLogger, slice_id: i64, vm_name: &str) -> Result<()> {
    single_vm_op(store, driver, locks, audit, slice_id, vm_name, VmAction::Resume).await
}

pub async fn shutdown_vm(store: &dyn DataStore, driver: &Driver, locks: &SliceLocks, audit: &crate::audit::ApiAuditLogger, slice_id: i64, vm_name: &str) -> Result<()> {
    single_vm_op(store, driver, locks, audit, slice_id, vm_name, VmAction::Shutdown).await
}

pub async fn start_vm(store: &dyn DataStore, driver: &Driver, locks: &SliceLocks, audit: &crate::audit::ApiAuditLogger, slice_id: i64, vm_name: &str) -> Result<()> {
    single_vm_op(store, driver, locks, audit, slice_id, vm_name, VmAction::Start).await
}

/// Bulk fan-out: drive every VM for which `action` is a valid transition to
/// its new state, skipping VMs for which it is not (§4.4 "bulk fan-outs that
/// drive every VM to the desired terminal state" -- a slice-level pause on a
/// slice with one already-shut-down VM still succeeds for the rest).
async fn bulk_vm_op(
    store: &dyn DataStore,
    driver: &Driver,
    locks: &SliceLocks,
    audit: &crate::audit::ApiAuditLogger,
    slice_id: i64,
    action: VmAction,
) -> Result<()> {
    let _guard = locks.lock_for(slice_id).await;
    let slice = store.get_slice(slice_id).await?;
    if slice.vms.is_empty() {
        return Err(StoreError::Conflict(format!("slice {slice_id} has no VMs to operate on")));
    }

    let driver = driver.for_zone(slice.zone);
    match action {
        VmAction::Pause => driver.pause(slice_id).await?,
        VmAction::Resume => driver.resume(slice_id).await?,
        VmAction::Shutdown => driver.shutdown(slice_id).await?,
        VmAction::Start => driver.start(slice_id).await?,
    }

    let mut vms = slice.vms.clone();
    for vm in &mut vms {
        if let Some(current) = vm.state {
            if let Ok(target) = validate_vm_transition(current, action) {
                vm.state = Some(target);
            }
        }
    }
    store.update_vms(slice_id, vms.clone()).await?;

    let derived = derive_runtime_state(&vms.iter().filter_map(|v| v.state).collect::<Vec<_>>());
    let old = slice.runtime_state;
    if derived != old {
        store.set_runtime_state(slice_id, derived).await?;
    }
    audit.slice_runtime_changed(slice_id, old.map(debug_runtime), derived.map(debug_runtime));
    Ok(())
}

fn debug_runtime(s: RuntimeState) -> &'static str {
    match s {
        RuntimeState::Corriendo => "corriendo",
        RuntimeState::Pausado => "pausado",
        RuntimeState::Apagado => "apagado",
        RuntimeState::Eliminado => "eliminado",
    }
}

pub async fn pause_slice(store: &dyn DataStore, driver: &Driver, locks: &SliceLocks, audit: &crate::audit::ApiAuditLogger, slice_id: i64) -> Result<()> {
    bulk_vm_op(store, driver, locks, audit, slice_id, VmAction::Pause).await
}

pub async fn resume_slice(store: &dyn DataStore, driver: &Driver, locks: &SliceLocks, audit: &crate::audit::ApiAuditLogger, slice_id: i64) -> Result<()> {
    bulk_vm_op(store, driver, locks, audit, slice_id, VmAction::Resume).await
}

pub async fn shutdown_slice(store: &dyn DataStore, driver: &Driver, locks: &SliceLocks, audit: &crate::audit::ApiAuditLogger, slice_id: i64) -> Result<()> {
    bulk_vm_op(store, driver, locks, audit, slice_id, VmAction::Shutdown).await
}

pub async fn start_slice(store: &dyn DataStore, driver: &Driver, locks: &SliceLocks, audit: &crate::audit::ApiAuditLogger, slice_id: i64) -> Result<()> {
    bulk_vm_op(store, driver, locks, audit, slice_id, VmAction::Start).await
}

/// Delete protocol (§4.4): driver delete first (idempotent, removes every
/// cluster-side object tagged with the slice id), then release VLANs,
/// placement-ledger entries, VNC reservations, and security groups, then
/// mark the row deleted. A failed driver delete aborts before any store
/// mutation so the slice stays retryable from the same state.
pub async fn delete_slice(store: &dyn DataStore, driver: &Driver, locks: &SliceLocks, audit: &crate::audit::ApiAuditLogger, slice_id: i64) -> Result<()> {
    let _guard = locks.lock_for(slice_id).await;
    let slice = store.get_slice(slice_id).await?;

    driver.for_zone(slice.zone).delete(slice_id).await?;
    store.remove_slice(slice.zone, slice_id).await?;
    store.release_slice(slice_id).await?;

    for sg in store.list_sgs(slice_id).await? {
        let _ = store.delete_sg(sg.id).await;
    }

    store.delete_slice(slice_id).await?;
    audit.slice_deleted(slice_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_transitions_match_the_spec_diagram() {
        assert_eq!(validate_vm_transition(VmState::Corriendo, VmAction::Pause).unwrap(), VmState::Pausado);
        assert_eq!(validate_vm_transition(VmState::Pausado, VmAction::Resume).unwrap(), VmState::Corriendo);
        assert_eq!(validate_vm_transition(VmState::Corriendo, VmAction::Shutdown).unwrap(), VmState::Apagado);
        assert_eq!(validate_vm_transition(VmState::Pausado, VmAction::Shutdown).unwrap(), VmState::Apagado);
        assert_eq!(validate_vm_transition(VmState::Apagado, VmAction::Start).unwrap(), VmState::Corriendo);
    }

    #[test]
    fn vm_transitions_reject_invalid_moves() {
        assert!(validate_vm_transition(VmState::Corriendo, VmAction::Resume).is_err());
        assert!(validate_vm_transition(VmState::Apagado, VmAction::Pause).is_err());
        assert!(validate_vm_transition(VmState::Pausado, VmAction::Start).is_err());
    }

    #[test]
    fn derive_runtime_state_any_running_wins() {
        let states = vec![VmState::Corriendo, VmState::Apagado, VmState::Pausado];
        assert_eq!(derive_runtime_state(&states), Some(RuntimeState::Corriendo));
    }

    #[test]
    fn derive_runtime_state_uniform_states() {
        assert_eq!(derive_runtime_state(&[VmState::Pausado, VmState::Pausado]), Some(RuntimeState::Pausado));
        assert_eq!(derive_runtime_state(&[VmState::Apagado, VmState::Apagado]), Some(RuntimeState::Apagado));
    }

    #[test]
    fn derive_runtime_state_mixed_non_running_reports_corriendo() {
        let states = vec![VmState::Apagado, VmState::Pausado];
        assert_eq!(derive_runtime_state(&states), Some(RuntimeState::Corriendo));
    }

    #[test]
    fn derive_runtime_state_empty_is_none() {
        assert_eq!(derive_runtime_state(&[]), None);
    }

    #[tokio::test]
    async fn slice_locks_serialize_same_slice_not_different_ones() {
        let locks = SliceLocks::new();
        let g1 = locks.lock_for(1).await;
        // A different slice id must not block on slice 1's guard.
        let g2 = tokio::time::timeout(std::time::Duration::from_millis(50), locks.lock_for(2)).await;
        assert!(g2.is_ok());
        drop(g1);
        drop(g2);
    }
}
