//! Ingress DTOs and structural/cross-field validation for slice creation
//! (§4.1 step 2, §6). Validation runs before any side effect: on failure the
//! caller gets a `StoreError::Validation` naming the rule violated and
//! nothing is persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use utoipa::ToSchema;

use crate::domain::{Topology, TopologyKind, Vm};
use crate::store::error::{Result, StoreError};

// =============================================================================
// Wire DTOs (§6 "Ingress: slice creation")
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CreateSliceRequest {
    pub nombre_slice: String,
    pub zona_despliegue: String,
    pub solicitud_json: SolicitudJson,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct SolicitudJson {
    pub total_vms: u32,
    #[serde(default)]
    pub conexiones_vms: String,
    pub topologias: Vec<TopologiaJson>,
    #[serde(default)]
    pub id_slice: String,
    #[serde(default)]
    pub vlans_usadas: String,
    #[serde(default)]
    pub vncs_usadas: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct TopologiaJson {
    pub nombre: String,
    pub cantidad_vms: String,
    pub vms: Vec<VmJson>,
    #[serde(default)]
    pub internet: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct VmJson {
    pub nombre: String,
    pub cores: String,
    pub ram: String,
    pub almacenamiento: String,
    pub image: String,
    pub internet: String,
    #[serde(default)]
    pub puerto_vnc: String,
    #[serde(default)]
    pub conexiones_vlans: String,
    #[serde(default)]
    pub server: String,
}

// =============================================================================
// Validated output
// =============================================================================

pub struct ValidatedSlice {
    pub name: String,
    pub zone: crate::domain::Zone,
    pub topologies: Vec<Topology>,
    pub conexiones_vms: String,
}

/// Validate every field constraint and cross-field invariant in §3/§6.
pub fn validate_create_request(req: &CreateSliceRequest) -> Result<ValidatedSlice> {
    let name_len = req.nombre_slice.chars().count();
    if !(3..=200).contains(&name_len) {
        return Err(StoreError::Validation(format!(
            "nombre_slice must be 3-200 chars, got {name_len}"
        )));
    }

    let zone: crate::domain::Zone = req
        .zona_despliegue
        .parse()
        .map_err(|_| StoreError::Validation(format!("unknown zona_despliegue: {}", req.zona_despliegue)))?;

    let sol = &req.solicitud_json;
    if !sol.id_slice.is_empty() || !sol.vlans_usadas.is_empty() || !sol.vncs_usadas.is_empty() {
        return Err(StoreError::Validation(
            "id_slice, vlans_usadas, and vncs_usadas must be empty on input".into(),
        ));
    }

    if !(1..=3).contains(&sol.topologias.len()) {
        return Err(StoreError::Validation(format!(
            "a slice must contain 1-3 topologies, got {}",
            sol.topologias.len()
        )));
    }

    let mut topologies = Vec::with_capacity(sol.topologias.len());
    let mut total_vms_seen: u32 = 0;
    let mut all_vm_names: HashSet<String> = HashSet::new();

    for topologia in &sol.topologias {
        let kind = parse_topology_kind(&topologia.nombre)?;

        let declared_count: u32 = topologia.cantidad_vms.parse().map_err(|_| {
            StoreError::Validation(format!(
                "cantidad_vms must be a stringified integer, got {:?}",
                topologia.cantidad_vms
            ))
        })?;
        if declared_count as usize != topologia.vms.len() {
            return Err(StoreError::Validation(format!(
                "cantidad_vms ({declared_count}) does not match vms list length ({})",
                topologia.vms.len()
            )));
        }
        let range = kind.allowed_vm_count();
        if !range.contains(&declared_count) {
            return Err(StoreError::Validation(format!(
                "topology {:?} allows {}-{} VMs, got {declared_count}",
                kind,
                range.start(),
                range.end()
            )));
        }

        let internet = parse_si_no(topologia.internet.as_deref().unwrap_or("no"), "topology internet")?;

        let mut vms = Vec::with_capacity(topologia.vms.len());
        for vm_json in &topologia.vms {
            let vm = validate_vm(vm_json)?;
            if !all_vm_names.insert(vm.name.clone()) {
                return Err(StoreError::Validation(format!(
                    "duplicate VM name {:?} in slice",
                    vm.name
                )));
            }
            vms.push(vm);
        }

        total_vms_seen += declared_count;
        topologies.push(Topology { kind, internet, vms });
    }

    if total_vms_seen != sol.total_vms {
        return Err(StoreError::Validation(format!(
            "total_vms ({}) does not match sum of topology VM counts ({total_vms_seen})",
            sol.total_vms
        )));
    }
    // §6 states the general range as 2-12, but boundary scenario S1 (§8)
    // is exactly a single `1vm` topology with one VM (total_vms=1) and
    // expects it to succeed. Resolved in favor of the explicit scenario:
    // 1 is admitted as the standalone-`1vm` edge case, see DESIGN.md.
    if !(1..=12).contains(&sol.total_vms) {
        return Err(StoreError::Validation(format!(
            "total_vms must be 1-12, got {}",
            sol.total_vms
        )));
    }

    validate_links(&topologies, &sol.conexiones_vms, &all_vm_names)?;

    Ok(ValidatedSlice {
        name: req.nombre_slice.clone(),
        zone,
        topologies,
        conexiones_vms: sol.conexiones_vms.clone(),
    })
}

/// Reconstruct validated topologies from a slice row's stored `request_json`
/// (the planner worker's entry point, §4.2 step 1). Re-runs the same
/// per-field validation `validate_create_request` does -- cheap, and keeps a
/// single source of truth for what a well-formed `solicitud_json` looks like
/// -- but skips the placeholder-must-be-empty check, since a slice that has
/// already passed VLAN mapping once (and is being reprocessed after a crash)
/// may carry a non-empty `id_slice`/`conexiones_vlans` from that earlier pass.
pub fn topologies_from_request_json(request_json: &serde_json::Value) -> Result<(Vec<Topology>, String)> {
    let sol: SolicitudJson = serde_json::from_value(request_json.clone())
        .map_err(|e| StoreError::Internal(format!("stored request_json is not valid solicitud_json: {e}")))?;

    let mut topologies = Vec::with_capacity(sol.topologias.len());
    for topologia in &sol.topologias {
        let kind = parse_topology_kind(&topologia.nombre)?;
        let internet = parse_si_no(topologia.internet.as_deref().unwrap_or("no"), "topology internet")?;
        let mut vms = Vec::with_capacity(topologia.vms.len());
        for vm_json in &topologia.vms {
            vms.push(validate_vm_ignoring_placeholders(vm_json)?);
        }
        topologies.push(Topology { kind, internet, vms });
    }
    Ok((topologies, sol.conexiones_vms.clone()))
}

/// Same field parsing as `validate_vm`, without the "placeholders must be
/// empty on input" check (see `topologies_from_request_json`).
fn validate_vm_ignoring_placeholders(vm: &VmJson) -> Result<Vm> {
    if !is_vm_name(&vm.nombre) {
        return Err(StoreError::Validation(format!(
            "VM name must match vm\\d+, got {:?}",
            vm.nombre
        )));
    }
    let cores: u32 = match vm.cores.as_str() {
        "1" => 1,
        "2" => 2,
        other => {
            return Err(StoreError::Validation(format!(
                "VM {:?}: cores must be \"1\" or \"2\", got {other:?}",
                vm.nombre
            )));
        }
    };
    let ram_mb = parse_ram(&vm.ram).map_err(|e| StoreError::Validation(format!("VM {:?}: {e}", vm.nombre)))?;
    let disk_gb = parse_disk(&vm.almacenamiento)
        .map_err(|e| StoreError::Validation(format!("VM {:?}: {e}", vm.nombre)))?;
    let internet = parse_si_no(&vm.internet, &format!("VM {:?} internet", vm.nombre))?;

    Ok(Vm {
        name: vm.nombre.clone(),
        cores,
        ram_mb,
        disk_gb,
        image: vm.image.clone(),
        internet,
        vlans: vec![],
        server: None,
        vnc_port: None,
        state: None,
    })
}

fn parse_topology_kind(raw: &str) -> Result<TopologyKind> {
    match raw {
        "1vm" => Ok(TopologyKind::OneVm),
        "lineal" => Ok(TopologyKind::Lineal),
        "anillo" => Ok(TopologyKind::Anillo),
        "arbol" => Ok(TopologyKind::Arbol),
        other => Err(StoreError::Validation(format!("unknown topology kind: {other:?}"))),
    }
}

fn parse_si_no(raw: &str, field: &str) -> Result<bool> {
    match raw {
        "si" => Ok(true),
        "no" => Ok(false),
        other => Err(StoreError::Validation(format!("{field} must be \"si\" or \"no\", got {other:?}"))),
    }
}

fn validate_vm(vm: &VmJson) -> Result<Vm> {
    if !is_vm_name(&vm.nombre) {
        return Err(StoreError::Validation(format!(
            "VM name must match vm\\d+, got {:?}",
            vm.nombre
        )));
    }
    if !vm.puerto_vnc.is_empty() || !vm.conexiones_vlans.is_empty() || !vm.server.is_empty() {
        return Err(StoreError::Validation(format!(
            "VM {:?}: puerto_vnc, conexiones_vlans, and server must be empty on input",
            vm.nombre
        )));
    }

    let cores: u32 = match vm.cores.as_str() {
        "1" => 1,
        "2" => 2,
        other => {
            return Err(StoreError::Validation(format!(
                "VM {:?}: cores must be \"1\" or \"2\", got {other:?}",
                vm.nombre
            )));
        }
    };

    let ram_mb = parse_ram(&vm.ram).map_err(|e| StoreError::Validation(format!("VM {:?}: {e}", vm.nombre)))?;
    let disk_gb = parse_disk(&vm.almacenamiento)
        .map_err(|e| StoreError::Validation(format!("VM {:?}: {e}", vm.nombre)))?;

    if vm.image.trim().is_empty() {
        return Err(StoreError::Validation(format!("VM {:?}: image must not be empty", vm.nombre)));
    }

    let internet = parse_si_no(&vm.internet, &format!("VM {:?} internet", vm.nombre))?;

    Ok(Vm {
        name: vm.nombre.clone(),
        cores,
        ram_mb,
        disk_gb,
        image: vm.image.clone(),
        internet,
        vlans: vec![],
        server: None,
        vnc_port: None,
        state: None,
    })
}

fn is_vm_name(s: &str) -> bool {
    s.strip_prefix("vm")
        .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// `[256-999]M` or `[1.0-1.5]G` -> whole MiB.
fn parse_ram(raw: &str) -> std::result::Result<u32, String> {
    if let Some(num) = raw.strip_suffix('M') {
        let v: u32 = num.parse().map_err(|_| format!("invalid ram {raw:?}"))?;
        if (256..=999).contains(&v) {
            return Ok(v);
        }
        return Err(format!("ram in MiB must be 256-999, got {v}"));
    }
    if let Some(num) = raw.strip_suffix('G') {
        let v: f64 = num.parse().map_err(|_| format!("invalid ram {raw:?}"))?;
        if (1.0..=1.5).contains(&v) {
            return Ok((v * 1024.0).round() as u32);
        }
        return Err(format!("ram in GiB must be 1.0-1.5, got {v}"));
    }
    Err(format!("ram must end in M or G, got {raw:?}"))
}

fn parse_disk(raw: &str) -> std::result::Result<u32, String> {
    match raw {
        "1G" => Ok(1),
        "2G" => Ok(2),
        "4G" => Ok(4),
        other => Err(format!("almacenamiento must be 1G, 2G, or 4G, got {other:?}")),
    }
}

/// Cross-field link invariants (§3 Link):
/// - `conexiones_vms` endpoints must reference existing VMs.
/// - No duplicate links (intra- or inter-topology).
/// - When >= 2 topologies exist, the undirected topology graph induced by
///   inter-topology connections must be connected.
fn validate_links(
    topologies: &[Topology],
    conexiones_vms: &str,
    all_vm_names: &HashSet<String>,
) -> Result<()> {
    let mut seen_links: HashSet<(String, String)> = HashSet::new();

    // topology index per VM name, used for the connectivity check below.
    let mut vm_topology_index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for (idx, topology) in topologies.iter().enumerate() {
        for vm in &topology.vms {
            vm_topology_index.insert(vm.name.clone(), idx);
        }
        for (a, b) in crate::planner::topology_links(
            topology.kind,
            topology.vms.len() as u32,
        ) {
            let name_a = &topology.vms[(a - 1) as usize].name;
            let name_b = &topology.vms[(b - 1) as usize].name;
            insert_unique_link(&mut seen_links, name_a, name_b)?;
        }
    }

    let connections = crate::planner::parse_inter_topology_connections(conexiones_vms);
    let mut union_find = UnionFind::new(topologies.len());
    for (a, b) in &connections {
        if !all_vm_names.contains(a) {
            return Err(StoreError::Validation(format!("conexiones_vms references unknown VM {a:?}")));
        }
        if !all_vm_names.contains(b) {
            return Err(StoreError::Validation(format!("conexiones_vms references unknown VM {b:?}")));
        }
        insert_unique_link(&mut seen_links, a, b)?;

        if let (Some(&ta), Some(&tb)) = (vm_topology_index.get(a), vm_topology_index.get(b)) {
            union_find.union(ta, tb);
        }
    }

    if topologies.len() >= 2 && !union_find.is_fully_connected() {
        return Err(StoreError::Validation(
            "the undirected graph of topologies must be connected by at least one inter-topology link".into(),
        ));
    }

    Ok(())
}

fn insert_unique_link(seen: &mut HashSet<(String, String)>, a: &str, b: &str) -> Result<()> {
    let key = if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    };
    if !seen.insert(key) {
        return Err(StoreError::Validation(format!("duplicate link between {a:?} and {b:?}")));
    }
    Ok(())
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }

    fn is_fully_connected(&mut self) -> bool {
        if self.parent.is_empty() {
            return true;
        }
        let root = self.find(0);
        (0..self.parent.len()).all(|i| self.find(i) == root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_json(nombre: &str) -> VmJson {
        VmJson {
            nombre: nombre.to_string(),
            cores: "1".into(),
            ram: "512M".into(),
            almacenamiento: "1G".into(),
            image: "cirros".into(),
            internet: "no".into(),
            puerto_vnc: String::new(),
            conexiones_vlans: String::new(),
            server: String::new(),
        }
    }

    #[test]
    fn scenario_s1_minimal_slice_is_valid() {
        // One `1vm` topology, one VM, internet=no, zone linux (§8 S1):
        // total_vms=1 is the standalone-`1vm` edge case (see DESIGN.md).
        let req = CreateSliceRequest {
            nombre_slice: "minimal".into(),
            zona_despliegue: "linux".into(),
            solicitud_json: SolicitudJson {
                total_vms: 1,
                conexiones_vms: String::new(),
                topologias: vec![TopologiaJson {
                    nombre: "1vm".into(),
                    cantidad_vms: "1".into(),
                    vms: vec![vm_json("vm1")],
                    internet: Some("no".into()),
                }],
                id_slice: String::new(),
                vlans_usadas: String::new(),
                vncs_usadas: String::new(),
            },
        };
        let validated = validate_create_request(&req).expect("should validate");
        assert_eq!(validated.topologies.len(), 1);
        assert_eq!(validated.topologies[0].vms.len(), 1);
        assert_eq!(crate::planner::enumerate_links(&validated.topologies, &validated.conexiones_vms).len(), 0);
    }

    #[test]
    fn two_vm_lineal_slice_is_also_valid() {
        let req = CreateSliceRequest {
            nombre_slice: "two-vm".into(),
            zona_despliegue: "linux".into(),
            solicitud_json: SolicitudJson {
                total_vms: 2,
                conexiones_vms: String::new(),
                topologias: vec![TopologiaJson {
                    nombre: "lineal".into(),
                    cantidad_vms: "2".into(),
                    vms: vec![vm_json("vm1"), vm_json("vm2")],
                    internet: Some("no".into()),
                }],
                id_slice: String::new(),
                vlans_usadas: String::new(),
                vncs_usadas: String::new(),
            },
        };
        let validated = validate_create_request(&req).expect("should validate");
        assert_eq!(validated.topologies.len(), 1);
    }

    #[test]
    fn rejects_mismatched_total_vms() {
        let req = CreateSliceRequest {
            nombre_slice: "bad".into(),
            zona_despliegue: "linux".into(),
            solicitud_json: SolicitudJson {
                total_vms: 3,
                conexiones_vms: String::new(),
                topologias: vec![TopologiaJson {
                    nombre: "lineal".into(),
                    cantidad_vms: "2".into(),
                    vms: vec![vm_json("vm1"), vm_json("vm2")],
                    internet: None,
                }],
                id_slice: String::new(),
                vlans_usadas: String::new(),
                vncs_usadas: String::new(),
            },
        };
        let err = validate_create_request(&req).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn scenario_s3_multi_topology_requires_connectivity() {
        let req = CreateSliceRequest {
            nombre_slice: "multi".into(),
            zona_despliegue: "linux".into(),
            solicitud_json: SolicitudJson {
                total_vms: 7,
                conexiones_vms: String::new(), // disconnected: no inter-topology link
                topologias: vec![
                    TopologiaJson {
                        nombre: "lineal".into(),
                        cantidad_vms: "3".into(),
                        vms: vec![vm_json("vm1"), vm_json("vm2"), vm_json("vm3")],
                        internet: None,
                    },
                    TopologiaJson {
                        nombre: "anillo".into(),
                        cantidad_vms: "4".into(),
                        vms: vec![vm_json("vm4"), vm_json("vm5"), vm_json("vm6"), vm_json("vm7")],
                        internet: None,
                    },
                ],
                id_slice: String::new(),
                vlans_usadas: String::new(),
                vncs_usadas: String::new(),
            },
        };
        let err = validate_create_request(&req).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let mut connected = req;
        connected.solicitud_json.conexiones_vms = "vm2-vm5".into();
        let validated = validate_create_request(&connected).expect("should validate once connected");
        assert_eq!(validated.topologies.len(), 2);
    }

    #[test]
    fn topologies_from_request_json_round_trips_validated_request() {
        let req = CreateSliceRequest {
            nombre_slice: "rt".into(),
            zona_despliegue: "linux".into(),
            solicitud_json: SolicitudJson {
                total_vms: 2,
                conexiones_vms: String::new(),
                topologias: vec![TopologiaJson {
                    nombre: "lineal".into(),
                    cantidad_vms: "2".into(),
                    vms: vec![vm_json("vm1"), vm_json("vm2")],
                    internet: Some("si".into()),
                }],
                id_slice: String::new(),
                vlans_usadas: String::new(),
                vncs_usadas: String::new(),
            },
        };
        let json = serde_json::to_value(&req.solicitud_json).unwrap();
        let (topologies, conexiones) = topologies_from_request_json(&json).unwrap();
        assert_eq!(topologies.len(), 1);
        assert!(topologies[0].internet);
        assert_eq!(topologies[0].vms.len(), 2);
        assert_eq!(conexiones, "");
    }

    #[test]
    fn rejects_placeholder_fields_set_on_input() {
        let mut vm = vm_json("vm1");
        vm.server = "worker1".into();
        let req = CreateSliceRequest {
            nombre_slice: "bad".into(),
            zona_despliegue: "linux".into(),
            solicitud_json: SolicitudJson {
                total_vms: 2,
                conexiones_vms: String::new(),
                topologias: vec![TopologiaJson {
                    nombre: "lineal".into(),
                    cantidad_vms: "2".into(),
                    vms: vec![vm, vm_json("vm2")],
                    internet: None,
                }],
                id_slice: String::new(),
                vlans_usadas: String::new(),
                vncs_usadas: String::new(),
            },
        };
        let err = validate_create_request(&req).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }
}
