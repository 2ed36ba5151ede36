//! REST API integration tests: real axum router, real HTTP client, in-memory
//! store/queue. These exercise the ingress layer's auth gate, structural
//! validation, and access-control rules (spec §4.1, §6, §8 scenario S6)
//! without requiring a live Postgres/NATS/cluster-driver backend.

mod common;

use common::{admin_token, cliente_token, TestServer};
use serde_json::json;
use slice_orchestrator::domain::Zone;
use slice_orchestrator::store::SliceStore;

fn minimal_linear_slice(name: &str) -> serde_json::Value {
    json!({
        "nombre_slice": name,
        "zona_despliegue": "linux",
        "solicitud_json": {
            "total_vms": 2,
            "conexiones_vms": "",
            "topologias": [{
                "nombre": "lineal",
                "cantidad_vms": "2",
                "internet": "no",
                "vms": [
                    {"nombre": "vm1", "cores": "1", "ram": "512M", "almacenamiento": "1G", "image": "cirros", "internet": "no"},
                    {"nombre": "vm2", "cores": "1", "ram": "512M", "almacenamiento": "1G", "image": "cirros", "internet": "no"}
                ]
            }],
            "id_slice": "",
            "vlans_usadas": "",
            "vncs_usadas": ""
        }
    })
}

// =============================================================================
// Authentication (§6 "Bearer token on all endpoints")
// =============================================================================

#[tokio::test]
async fn missing_bearer_token_is_rejected() {
    let server = TestServer::spawn().await;

    let response = server.get("/api/v1/slices", None).await;
    assert_eq!(response.status(), 401);

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_bearer_token_is_rejected() {
    let server = TestServer::spawn().await;

    let response = server.get("/api/v1/slices", Some("not-a-real-jwt")).await;
    assert_eq!(response.status(), 401);

    server.shutdown().await;
}

// =============================================================================
// Slice creation validation (§4.1 step 2, §6, §8)
// =============================================================================

#[tokio::test]
async fn unknown_zone_is_rejected_before_any_side_effect() {
    let server = TestServer::spawn().await;
    let token = cliente_token("u1");

    let mut body = minimal_linear_slice("bad-zone-slice");
    body["zona_despliegue"] = json!("nonexistent-zone");

    let response = server.post_json("/api/v1/slices", Some(&token), &body).await;
    assert_eq!(response.status(), 400);
    let err: serde_json::Value = response.json().await.unwrap();
    assert_eq!(err["code"], "validation");

    let slices = server.store.list_slices(Some("u1")).await.unwrap();
    assert!(slices.is_empty(), "a validation failure must not persist anything");

    server.shutdown().await;
}

#[tokio::test]
async fn total_vms_mismatch_is_rejected() {
    let server = TestServer::spawn().await;
    let token = cliente_token("u1");

    let mut body = minimal_linear_slice("mismatch-slice");
    body["solicitud_json"]["total_vms"] = json!(5);

    let response = server.post_json("/api/v1/slices", Some(&token), &body).await;
    assert_eq!(response.status(), 400);

    server.shutdown().await;
}

#[tokio::test]
async fn non_empty_placeholder_fields_are_rejected() {
    let server = TestServer::spawn().await;
    let token = cliente_token("u1");

    let mut body = minimal_linear_slice("placeholder-slice");
    body["solicitud_json"]["vlans_usadas"] = json!("5,6");

    let response = server.post_json("/api/v1/slices", Some(&token), &body).await;
    assert_eq!(response.status(), 400);

    server.shutdown().await;
}

#[tokio::test]
async fn duplicate_vm_names_are_rejected() {
    let server = TestServer::spawn().await;
    let token = cliente_token("u1");

    let mut body = minimal_linear_slice("dup-vm-slice");
    body["solicitud_json"]["topologias"][0]["vms"][1]["nombre"] = json!("vm1");

    let response = server.post_json("/api/v1/slices", Some(&token), &body).await;
    assert_eq!(response.status(), 400);

    server.shutdown().await;
}

#[tokio::test]
async fn disconnected_topologies_are_rejected() {
    let server = TestServer::spawn().await;
    let token = cliente_token("u1");

    let body = json!({
        "nombre_slice": "disconnected-slice",
        "zona_despliegue": "linux",
        "solicitud_json": {
            "total_vms": 3,
            "conexiones_vms": "",
            "topologias": [
                {
                    "nombre": "1vm",
                    "cantidad_vms": "1",
                    "internet": "no",
                    "vms": [{"nombre": "vm1", "cores": "1", "ram": "512M", "almacenamiento": "1G", "image": "cirros", "internet": "no"}]
                },
                {
                    "nombre": "lineal",
                    "cantidad_vms": "2",
                    "internet": "no",
                    "vms": [
                        {"nombre": "vm2", "cores": "1", "ram": "512M", "almacenamiento": "1G", "image": "cirros", "internet": "no"},
                        {"nombre": "vm3", "cores": "1", "ram": "512M", "almacenamiento": "1G", "image": "cirros", "internet": "no"}
                    ]
                }
            ],
            "id_slice": "", "vlans_usadas": "", "vncs_usadas": ""
        }
    });

    let response = server.post_json("/api/v1/slices", Some(&token), &body).await;
    assert_eq!(response.status(), 400);

    server.shutdown().await;
}

// =============================================================================
// Access control (§4.1 read paths, §8 scenario S6)
// =============================================================================

#[tokio::test]
async fn owner_can_read_their_own_slice() {
    let server = TestServer::spawn().await;
    let slice_id = server.seed_slice("owner", "s1", Zone::Linux).await;
    let token = cliente_token("owner");

    let response = server.get(&format!("/api/v1/slices/{slice_id}"), Some(&token)).await;
    assert_eq!(response.status(), 200);

    server.shutdown().await;
}

#[tokio::test]
async fn stranger_gets_forbidden_admin_gets_through() {
    let server = TestServer::spawn().await;
    let slice_id = server.seed_slice("owner", "s10", Zone::Linux).await;

    let stranger = cliente_token("stranger");
    let response = server.get(&format!("/api/v1/slices/{slice_id}"), Some(&stranger)).await;
    assert_eq!(response.status(), 403);

    let admin = admin_token("root-admin");
    let response = server.get(&format!("/api/v1/slices/{slice_id}"), Some(&admin)).await;
    assert_eq!(response.status(), 200);

    server.shutdown().await;
}

#[tokio::test]
async fn delete_respects_ownership_then_succeeds_for_admin() {
    let server = TestServer::spawn().await;
    let slice_id = server.seed_slice("owner", "s-del", Zone::Linux).await;

    let stranger = cliente_token("stranger");
    let response = server.delete(&format!("/api/v1/slices/{slice_id}"), Some(&stranger)).await;
    assert_eq!(response.status(), 403);

    // The slice is untouched by the rejected attempt.
    let slice = server.store.get_slice(slice_id).await.unwrap();
    assert_eq!(slice.lifecycle_kind, slice_orchestrator::domain::LifecycleKind::Validated);

    let admin = admin_token("root-admin");
    let response = server.delete(&format!("/api/v1/slices/{slice_id}"), Some(&admin)).await;
    assert_eq!(response.status(), 204);

    let slice = server.store.get_slice(slice_id).await.unwrap();
    assert_eq!(slice.lifecycle_kind, slice_orchestrator::domain::LifecycleKind::Deleted);

    server.shutdown().await;
}

#[tokio::test]
async fn list_slices_is_scoped_to_the_caller_unless_admin() {
    let server = TestServer::spawn().await;
    server.seed_slice("alice", "alice-slice", Zone::Linux).await;
    server.seed_slice("bob", "bob-slice", Zone::Linux).await;

    let alice = cliente_token("alice");
    let response = server.get("/api/v1/slices", Some(&alice)).await;
    assert_eq!(response.status(), 200);
    let visible: Vec<serde_json::Value> = response.json().await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0]["owner_user_id"], "alice");

    let admin = admin_token("root-admin");
    let response = server.get("/api/v1/slices", Some(&admin)).await;
    let visible: Vec<serde_json::Value> = response.json().await.unwrap();
    assert_eq!(visible.len(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn getting_an_unknown_slice_is_not_found() {
    let server = TestServer::spawn().await;
    let token = cliente_token("u1");

    let response = server.get("/api/v1/slices/999999", Some(&token)).await;
    assert_eq!(response.status(), 404);

    server.shutdown().await;
}

// =============================================================================
// Images: admin-only catalog (§4.7, §6)
// =============================================================================

#[tokio::test]
async fn non_admin_cannot_manage_images() {
    let server = TestServer::spawn().await;
    let token = cliente_token("u1");

    let response = server.delete("/api/v1/images/1", Some(&token)).await;
    assert_eq!(response.status(), 403);

    server.shutdown().await;
}

#[tokio::test]
async fn anyone_authenticated_can_list_the_shared_catalog() {
    let server = TestServer::spawn().await;
    let token = cliente_token("u1");

    let response = server.get("/api/v1/images", Some(&token)).await;
    assert_eq!(response.status(), 200);
    let images: Vec<serde_json::Value> = response.json().await.unwrap();
    assert!(images.is_empty());

    server.shutdown().await;
}

// =============================================================================
// VM lifecycle endpoints: not-found / conflict surface (§4.4, §7)
// =============================================================================

#[tokio::test]
async fn pausing_a_vm_on_an_unknown_slice_is_not_found() {
    let server = TestServer::spawn().await;
    let token = cliente_token("u1");

    let response = server.post_json("/api/v1/slices/999999/vms/vm1/pause", Some(&token), &json!({})).await;
    assert_eq!(response.status(), 404);

    server.shutdown().await;
}

#[tokio::test]
async fn pausing_a_vm_on_a_slice_with_no_vms_yet_is_not_found() {
    let server = TestServer::spawn().await;
    let slice_id = server.seed_slice("owner", "no-vms-yet", Zone::Linux).await;
    let token = cliente_token("owner");

    // The slice was seeded directly through the store and never left
    // `validated`, so it carries no VMs at all -- the VM lookup itself
    // fails not_found before any state-transition check runs.
    let response = server
        .post_json(&format!("/api/v1/slices/{slice_id}/vms/vm1/pause"), Some(&token), &json!({}))
        .await;
    assert_eq!(response.status(), 404);

    server.shutdown().await;
}

#[tokio::test]
async fn security_group_operations_on_unknown_slice_are_not_found() {
    let server = TestServer::spawn().await;
    let token = cliente_token("owner");

    let response = server
        .post_json("/api/v1/slices/999999/security-groups", Some(&token), &json!({"name": "custom"}))
        .await;
    assert_eq!(response.status(), 404);

    server.shutdown().await;
}
