use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers::{self, images, security_groups, slices, vms, AppState};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Slice Orchestrator API",
        version = "0.1.0",
        description = "Multi-tenant cloud slice orchestrator: validate topology requests, allocate VLANs, place and deploy VMs across the linux and openstack zones, and drive their lifecycle, security groups, and shared image catalog.",
        license(name = "MIT")
    ),
    tags(
        (name = "slices", description = "Slice creation, inspection, and lifecycle"),
        (name = "vms", description = "Per-VM lifecycle, scoped to a slice"),
        (name = "security-groups", description = "Per-slice security group CRUD"),
        (name = "images", description = "Shared image catalog (admin-gated)")
    ),
    paths(
        slices::create_slice,
        slices::list_slices,
        slices::get_slice,
        slices::delete_slice,
        slices::pause_slice,
        slices::resume_slice,
        slices::shutdown_slice,
        slices::start_slice,
        vms::pause_vm,
        vms::resume_vm,
        vms::shutdown_vm,
        vms::start_vm,
        security_groups::create_sg,
        security_groups::delete_sg,
        security_groups::add_rule,
        security_groups::remove_rule,
        images::upload_image,
        images::import_from_catalog,
        images::list_images,
        images::delete_image,
    ),
    components(schemas(
        handlers::ApiError,
        crate::request::CreateSliceRequest,
        crate::request::SolicitudJson,
        crate::request::TopologiaJson,
        crate::request::VmJson,
        crate::domain::Slice,
        crate::domain::Zone,
        crate::domain::LifecycleKind,
        crate::domain::RuntimeState,
        crate::domain::Topology,
        crate::domain::TopologyKind,
        crate::domain::Vm,
        crate::domain::VmState,
        crate::domain::SecurityGroup,
        crate::domain::SecurityGroupRule,
        crate::domain::RuleDirection,
        crate::domain::Image,
        crate::domain::ImageLifecycle,
        crate::domain::ImportSource,
        security_groups::CreateSgRequest,
        security_groups::AddRuleRequest,
        images::ImportFromCatalogRequest,
    ))
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Slices
        .route("/slices", get(slices::list_slices).post(slices::create_slice))
        .route("/slices/{id}", get(slices::get_slice).delete(slices::delete_slice))
        .route("/slices/{id}/pause", post(slices::pause_slice))
        .route("/slices/{id}/resume", post(slices::resume_slice))
        .route("/slices/{id}/shutdown", post(slices::shutdown_slice))
        .route("/slices/{id}/start", post(slices::start_slice))
        // VMs
        .route("/slices/{id}/vms/{vm_name}/pause", post(vms::pause_vm))
        .route("/slices/{id}/vms/{vm_name}/resume", post(vms::resume_vm))
        .route("/slices/{id}/vms/{vm_name}/shutdown", post(vms::shutdown_vm))
        .route("/slices/{id}/vms/{vm_name}/start", post(vms::start_vm))
        // Security groups
        .route(
            "/slices/{id}/security-groups",
            post(security_groups::create_sg),
        )
        .route(
            "/slices/{id}/security-groups/{sg_id}",
            delete(security_groups::delete_sg),
        )
        .route(
            "/slices/{id}/security-groups/{sg_id}/rules",
            post(security_groups::add_rule),
        )
        .route(
            "/slices/{id}/security-groups/{sg_id}/rules/{rule_id}",
            delete(security_groups::remove_rule),
        )
        // Images
        .route("/images", get(images::list_images).post(images::upload_image))
        .route("/images/import", post(images::import_from_catalog))
        .route("/images/{id}", delete(images::delete_image));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
