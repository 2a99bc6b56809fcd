use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{auth::AuthenticatedUser, state::AppState};

pub mod audit;
pub mod auth;
pub mod companies;
pub mod documents;
pub mod health;
pub mod projects;
pub mod versions;

pub fn create_router(state: AppState) -> anyhow::Result<Router<()>> {
    let cors = build_cors(state.config.cors_allowed_origin.as_deref())?;
    let body_limit = state.config.max_upload_bytes;

    let companies_routes = Router::new()
        .route(
            "/",
            get(companies::list_companies).post(companies::create_company),
        )
        .route(
            "/:id",
            get(companies::get_company)
                .patch(companies::update_company)
                .delete(companies::delete_company),
        );

    let projects_routes = Router::new()
        .route(
            "/",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/:id",
            get(projects::get_project).patch(projects::update_project),
        )
        .route(
            "/:id/members",
            get(projects::list_members).post(projects::add_member),
        )
        .route("/:id/members/:user_id", delete(projects::remove_member));

    let documents_routes = Router::new()
        .route(
            "/",
            get(documents::list_documents).post(documents::create_document),
        )
        .route(
            "/:id",
            get(documents::get_document).patch(documents::update_document),
        )
        .route(
            "/:id/versions",
            get(versions::list_document_versions).post(versions::upload_version),
        )
        .route("/:id/history", get(documents::document_history));

    let versions_routes = Router::new()
        .route("/", get(versions::list_versions))
        .route(
            "/:id",
            get(versions::get_version)
                .put(versions::update_version)
                .patch(versions::update_version)
                .delete(versions::delete_version),
        )
        .route("/:id/download", get(versions::download_version));

    let audit_routes = Router::new()
        .route(
            "/",
            get(audit::list_audit_logs).post(audit::create_audit_log),
        )
        .route(
            "/:id",
            get(audit::get_audit_log)
                .put(audit::update_audit_log)
                .patch(audit::update_audit_log)
                .delete(audit::delete_audit_log),
        );

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/companies", companies_routes)
        .nest("/api/projects", projects_routes)
        .nest("/api/documents", documents_routes)
        .nest("/api/versions", versions_routes)
        .nest("/api/audit-logs", audit_routes)
        .route("/api/auth/me", get(auth::me))
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    Ok(Router::new()
        .merge(protected_routes)
        .route("/api/auth/login", post(auth::login))
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit)))
}

fn build_cors(allowed: Option<&str>) -> anyhow::Result<CorsLayer> {
    let allow_origin = match allowed {
        Some(origins) => {
            let mut headers = Vec::new();
            for origin in origins.split(',').map(str::trim).filter(|o| !o.is_empty()) {
                let value = origin
                    .parse::<HeaderValue>()
                    .map_err(|err| anyhow::anyhow!("invalid CORS allowed origin {origin}: {err}"))?;
                headers.push(value);
            }
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}
