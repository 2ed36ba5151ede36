//! VLAN / Network Planner (C2, spec §4.2).
//!
//! Link enumeration follows the original `topology_calculator.py` generators
//! literally (chain, ring, binary-tree-by-BFS-level); VLAN allocation walks
//! the zone pool upward over the occupied-id set read from the store.

use crate::domain::{Link, Topology, TopologyKind, Zone};
use crate::store::error::{Result, StoreError};

/// Canonical intra-topology links for a topology of the given kind, using
/// 1-based VM indices within the topology (`vm1`, `vm2`, ...).
pub fn topology_links(kind: TopologyKind, num_vms: u32) -> Vec<(u32, u32)> {
    match kind {
        TopologyKind::OneVm => vec![],
        TopologyKind::Lineal => linear_links(num_vms),
        TopologyKind::Anillo => ring_links(num_vms),
        TopologyKind::Arbol => tree_links(num_vms, 2),
    }
}

fn linear_links(num_vms: u32) -> Vec<(u32, u32)> {
    (1..num_vms).map(|i| (i, i + 1)).collect()
}

fn ring_links(num_vms: u32) -> Vec<(u32, u32)> {
    let mut links: Vec<(u32, u32)> = (1..num_vms).map(|i| (i, i + 1)).collect();
    if num_vms > 0 {
        links.push((num_vms, 1));
    }
    links
}

fn tree_links(num_vms: u32, branches: u32) -> Vec<(u32, u32)> {
    let mut links = Vec::new();
    let mut vm_counter = 2u32;
    let mut parent_queue = vec![1u32];

    while vm_counter <= num_vms && !parent_queue.is_empty() {
        let mut next_parents = Vec::new();
        'outer: for parent in parent_queue {
            for _ in 0..branches {
                if vm_counter > num_vms {
                    break 'outer;
                }
                links.push((parent, vm_counter));
                next_parents.push(vm_counter);
                vm_counter += 1;
            }
        }
        parent_queue = next_parents;
    }

    links
}

/// Parse the slice-level `conexiones_vms` string: `"vm2-vm6;vm7-vm11"`.
pub fn parse_inter_topology_connections(connections: &str) -> Vec<(String, String)> {
    if connections.trim().is_empty() {
        return vec![];
    }
    connections
        .split(';')
        .filter_map(|segment| segment.split_once('-'))
        .map(|(a, b)| (a.trim().to_string(), b.trim().to_string()))
        .collect()
}

/// Produce the full ordered link list for a slice: intra-topology links for
/// each topology in declared order, then inter-topology connections in
/// declared order (§4.2 step 1).
pub fn enumerate_links(topologies: &[Topology], conexiones_vms: &str) -> Vec<Link> {
    let mut links = Vec::new();

    for topology in topologies {
        let num_vms = topology.vms.len() as u32;
        for (a, b) in topology_links(topology.kind, num_vms) {
            let name_a = &topology.vms[(a - 1) as usize].name;
            let name_b = &topology.vms[(b - 1) as usize].name;
            links.push(Link::new(name_a.clone(), name_b.clone()));
        }
    }

    for (a, b) in parse_inter_topology_connections(conexiones_vms) {
        links.push(Link::new(a, b));
    }

    links
}

/// Allocate `count` free VLAN ids from the zone's pool, walking upward and
/// skipping `occupied` (§4.2 step 3).
pub fn allocate_vlans(zone: Zone, occupied: &std::collections::BTreeSet<u32>, count: usize) -> Result<Vec<u32>> {
    let (lo, hi) = zone.vlan_pool();
    let mut allocated = Vec::with_capacity(count);
    let mut candidate = lo;
    while candidate <= hi && allocated.len() < count {
        if !occupied.contains(&candidate) {
            allocated.push(candidate);
        }
        candidate += 1;
    }
    if allocated.len() < count {
        return Err(StoreError::ResourceExhausted(format!(
            "zone {} has only {} free VLAN ids, needed {count}",
            zone.as_str(),
            allocated.len()
        )));
    }
    Ok(allocated)
}

/// Zip allocated VLANs onto the ordered link list, then compute each VM's
/// VLAN membership set (§4.2 step 4).
///
/// Returns `(link -> vlan)` pairs in link order and a map of vm name -> sorted
/// VLAN membership (internet VLAN prepended when the VM's topology carries
/// `internet=true`).
pub fn map_vlans_onto_links(
    links: &[Link],
    allocated: &[u32],
) -> Vec<(Link, u32)> {
    links
        .iter()
        .cloned()
        .zip(allocated.iter().copied())
        .collect()
}

/// Compute the sorted VLAN membership for one VM given the link->vlan
/// mapping and whether the VM's topology has `internet=true`.
pub fn vm_vlan_membership(
    vm_name: &str,
    internet: bool,
    zone: Zone,
    link_vlans: &[(Link, u32)],
) -> Vec<u32> {
    let mut vlans: Vec<u32> = link_vlans
        .iter()
        .filter(|(link, _)| link.touches(vm_name))
        .map(|(_, vlan)| *vlan)
        .collect();
    vlans.sort_unstable();
    vlans.dedup();
    if internet {
        let iv = zone.internet_vlan();
        vlans.retain(|v| *v != iv);
        vlans.insert(0, iv);
    }
    vlans
}

/// A VM gains internet membership if either its own `internet` flag or its
/// topology's `internet` flag is set (§3 describes the flag on the topology;
/// §6's ingress format carries it per-VM too -- honoring either keeps both
/// readings of the spec satisfied rather than silently dropping one).
pub fn effective_internet(vm: &crate::domain::Vm, topology_internet: bool) -> bool {
    vm.internet || topology_internet
}

/// Mutate the stored request document in place with this planning pass's
/// outputs (§4.2 steps 4-5): top-level `id_slice`/`vlans_usadas`, and each
/// VM's `conexiones_vlans`, matching the fields already present on
/// `SolicitudJson`/`VmJson` so the same document serializes back out over
/// the wire unchanged in shape.
pub fn augment_request_json(json: &mut serde_json::Value, slice_id: i64, allocated: &[u32], vms: &[crate::domain::Vm]) {
    let Some(obj) = json.as_object_mut() else { return };
    obj.insert("id_slice".to_string(), serde_json::Value::String(slice_id.to_string()));
    obj.insert("vlans_usadas".to_string(), serde_json::Value::String(join_commas(allocated)));

    let Some(topologias) = obj.get_mut("topologias").and_then(|t| t.as_array_mut()) else { return };
    for topologia in topologias {
        let Some(vm_array) = topologia.get_mut("vms").and_then(|v| v.as_array_mut()) else { continue };
        for vm_json in vm_array {
            let name = vm_json.get("nombre").and_then(|n| n.as_str()).map(str::to_string);
            let Some(name) = name else { continue };
            let Some(vm) = vms.iter().find(|v| v.name == name) else { continue };
            if let Some(vm_obj) = vm_json.as_object_mut() {
                vm_obj.insert("conexiones_vlans".to_string(), serde_json::Value::String(join_commas(&vm.vlans)));
            }
        }
    }
}

fn join_commas(xs: &[u32]) -> String {
    xs.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Vm;

    fn vm(name: &str) -> Vm {
        Vm {
            name: name.to_string(),
            cores: 1,
            ram_mb: 512,
            disk_gb: 1,
            image: "cirros".into(),
            internet: false,
            vlans: vec![],
            server: None,
            vnc_port: None,
            state: None,
        }
    }

    #[test]
    fn linear_links_are_a_chain() {
        assert_eq!(linear_links(4), vec![(1, 2), (2, 3), (3, 4)]);
    }

    #[test]
    fn ring_links_close_the_loop() {
        assert_eq!(ring_links(4), vec![(1, 2), (2, 3), (3, 4), (4, 1)]);
    }

    #[test]
    fn tree_links_are_binary_bfs() {
        assert_eq!(
            tree_links(5, 2),
            vec![(1, 2), (1, 3), (2, 4), (2, 5)]
        );
    }

    #[test]
    fn one_vm_topology_has_no_intra_links() {
        assert_eq!(topology_links(TopologyKind::OneVm, 1), vec![]);
    }

    #[test]
    fn parses_semicolon_separated_connections() {
        assert_eq!(
            parse_inter_topology_connections("vm2-vm6;vm7-vm11"),
            vec![
                ("vm2".to_string(), "vm6".to_string()),
                ("vm7".to_string(), "vm11".to_string())
            ]
        );
    }

    #[test]
    fn empty_connections_string_yields_no_links() {
        assert_eq!(parse_inter_topology_connections(""), vec![]);
        assert_eq!(parse_inter_topology_connections("   "), vec![]);
    }

    #[test]
    fn scenario_s3_multi_topology_link_sequence() {
        // lineal/3 + anillo/4, conexiones_vms="vm2-vm5"
        let topologies = vec![
            Topology {
                kind: TopologyKind::Lineal,
                internet: false,
                vms: vec![vm("vm1"), vm("vm2"), vm("vm3")],
            },
            Topology {
                kind: TopologyKind::Anillo,
                internet: false,
                vms: vec![vm("vm4"), vm("vm5"), vm("vm6"), vm("vm7")],
            },
        ];
        let links = enumerate_links(&topologies, "vm2-vm5");
        let expected = vec![
            Link::new("vm1", "vm2"),
            Link::new("vm2", "vm3"),
            Link::new("vm4", "vm5"),
            Link::new("vm5", "vm6"),
            Link::new("vm6", "vm7"),
            Link::new("vm7", "vm4"),
            Link::new("vm2", "vm5"),
        ];
        assert_eq!(links, expected);
    }

    #[test]
    fn allocate_vlans_skips_occupied() {
        let occupied: std::collections::BTreeSet<u32> = [5, 6, 7].into_iter().collect();
        let allocated = allocate_vlans(Zone::Linux, &occupied, 2).unwrap();
        assert_eq!(allocated, vec![8, 9]);
    }

    #[test]
    fn allocate_vlans_fails_on_exhaustion() {
        let occupied: std::collections::BTreeSet<u32> = (5..=900).collect();
        let err = allocate_vlans(Zone::Linux, &occupied, 1).unwrap_err();
        assert!(matches!(err, StoreError::ResourceExhausted(_)));
    }

    #[test]
    fn vm_membership_prepends_internet_vlan() {
        let link_vlans = vec![
            (Link::new("vm2", "vm5"), 100u32),
            (Link::new("vm5", "vm6"), 50),
        ];
        let membership = vm_vlan_membership("vm5", true, Zone::Linux, &link_vlans);
        assert_eq!(membership, vec![1, 50, 100]);
    }

    #[test]
    fn augment_request_json_sets_ids_and_per_vm_vlans() {
        let mut json = serde_json::json!({
            "total_vms": 1,
            "conexiones_vms": "",
            "topologias": [{
                "nombre": "1vm",
                "cantidad_vms": "1",
                "vms": [{"nombre": "vm1", "cores": "1", "ram": "512M", "almacenamiento": "1G", "image": "cirros", "internet": "no"}],
            }],
            "id_slice": "",
            "vlans_usadas": "",
            "vncs_usadas": "",
        });
        let mut vm1 = vm("vm1");
        vm1.vlans = vec![1, 5];
        augment_request_json(&mut json, 42, &[5], &[vm1]);
        assert_eq!(json["id_slice"], "42");
        assert_eq!(json["vlans_usadas"], "5");
        assert_eq!(json["topologias"][0]["vms"][0]["conexiones_vlans"], "1,5");
    }
}
