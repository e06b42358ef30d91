// rest/mod.rs — HTTP surface of the control plane.
//
// Four route families on one listener:
//   /v1/*        OpenAI-compatible client API + self-service
//   /admin/*     operator surface (single admin token)
//   /nodes/*     node-agent ingress
//   /webhooks/*  billing-provider events
// plus /healthz and /metrics for operations.

pub mod extract;
pub mod routes;
pub mod sse;

use anyhow::Result;
use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Operations (no auth)
        .route("/healthz", get(routes::health::healthz))
        .route("/metrics", get(routes::health::metrics))
        // Client API
        .route("/v1/chat/completions", post(routes::inference::chat_completions))
        .route("/v1/completions", post(routes::inference::completions))
        .route("/v1/embeddings", post(routes::inference::embeddings))
        .route("/v1/models", get(routes::inference::list_models))
        // Self-service (reserved/enterprise tenants)
        .route(
            "/v1/keys",
            post(routes::selfservice::create_key).get(routes::selfservice::list_keys),
        )
        .route("/v1/keys/{id}", delete(routes::selfservice::revoke_key))
        .route(
            "/v1/nodes",
            post(routes::selfservice::launch_node).get(routes::selfservice::list_nodes),
        )
        .route(
            "/v1/nodes/{id}/terminate",
            post(routes::selfservice::terminate_node),
        )
        .route("/v1/nodes/{id}/logs", get(routes::selfservice::node_logs))
        // Admin: node management
        .route("/admin/nodes/launch", post(routes::admin_nodes::launch_node))
        .route("/admin/nodes", get(routes::admin_nodes::list_nodes))
        .route(
            "/admin/nodes/{cluster}/terminate",
            post(routes::admin_nodes::terminate_node),
        )
        .route(
            "/admin/nodes/{cluster}/status",
            get(routes::admin_nodes::node_status),
        )
        .route("/admin/nodes/{id}/logs", get(routes::admin_nodes::node_logs))
        .route(
            "/admin/nodes/{id}/logs/stream",
            get(sse::node_logs_stream),
        )
        .route("/admin/jobs/{id}", get(routes::admin_nodes::job_status))
        .route("/admin/audit", get(routes::admin_nodes::audit_entries))
        // Admin: catalogs
        .route(
            "/admin/tenants",
            post(routes::admin_crud::create_tenant).get(routes::admin_crud::list_tenants),
        )
        .route("/admin/tenants/{id}", get(routes::admin_crud::get_tenant))
        .route(
            "/admin/tenants/{id}/status",
            patch(routes::admin_crud::update_tenant_status),
        )
        .route(
            "/admin/tenants/{id}/plan",
            patch(routes::admin_crud::update_tenant_plan),
        )
        .route(
            "/admin/tenants/{id}/environments",
            post(routes::admin_crud::create_environment)
                .get(routes::admin_crud::list_environments),
        )
        .route(
            "/admin/environments/{id}",
            delete(routes::admin_crud::delete_environment),
        )
        .route("/admin/keys", post(routes::admin_crud::create_key))
        .route(
            "/admin/tenants/{id}/keys",
            get(routes::admin_crud::list_keys),
        )
        .route("/admin/keys/{id}/revoke", post(routes::admin_crud::revoke_key))
        .route(
            "/admin/models",
            post(routes::admin_crud::create_model).get(routes::admin_crud::list_models),
        )
        .route(
            "/admin/models/{id}/status",
            patch(routes::admin_crud::update_model_status),
        )
        .route("/admin/regions", get(routes::admin_crud::list_regions))
        .route("/admin/regions/{code}", put(routes::admin_crud::upsert_region))
        // Node agent ingress
        .route("/nodes/register", post(routes::agent::register))
        .route("/nodes/{id}/heartbeat", post(routes::agent::heartbeat))
        .route("/nodes/{id}/spot-warning", post(routes::agent::spot_warning))
        .route("/nodes/{id}/shutdown", post(routes::agent::shutdown))
        .route("/nodes/{id}/metrics", post(routes::agent::push_metrics))
        // External events
        .route("/webhooks/billing", post(routes::webhooks::billing_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Bind and serve until `shutdown` resolves, then stop accepting new
/// connections and let in-flight requests finish.
pub async fn serve(
    ctx: Arc<AppContext>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", ctx.config.port).parse()?;
    let router = build_router(ctx);

    info!("control plane listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
