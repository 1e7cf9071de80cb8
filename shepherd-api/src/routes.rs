//! HTTP routes
//!
//! JSON API over the cluster registry. Every route under `/api/v1` requires
//! a bearer token; errors are rendered as [`ErrorResponse`](crate::error::ErrorResponse).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware as axum_middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use shepherd_common::auth::Actor;
use shepherd_common::{Cluster, ClusterField};
use tower_http::trace::TraceLayer;

use crate::clusters::{ClusterId, ClusterQuery, CreateOptions, DeleteOptions, DeleteOutcome, UpdateRequest};
use crate::error::ApiError;
use crate::middleware;
use crate::state::AppState;

/// Build the application router
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/clusters", get(list_clusters).post(create_cluster))
        .route(
            "/api/v1/clusters/:id",
            get(get_cluster).put(update_cluster).delete(delete_cluster),
        )
        .route("/api/v1/clusters/:id/refresh", post(refresh_cluster))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(health_check))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterList {
    pub items: Vec<Cluster>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateParams {
    #[serde(default)]
    pub upsert: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct IdParams {
    #[serde(rename = "id.type")]
    pub id_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    #[serde(rename = "id.type")]
    pub id_type: Option<String>,
    /// Comma-separated attribute names
    pub updated_fields: Option<String>,
    pub resource_version: Option<u64>,
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_clusters(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<ClusterQuery>,
) -> Result<Json<ClusterList>, ApiError> {
    let items = state.registry.list(&actor, &query).await?;
    Ok(Json(ClusterList { items }))
}

async fn create_cluster(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Query(params): Query<CreateParams>,
    Json(cluster): Json<Cluster>,
) -> Result<(StatusCode, Json<Cluster>), ApiError> {
    let options = CreateOptions {
        upsert: params.upsert,
        ..Default::default()
    };
    let cluster = state.registry.create(&actor, cluster, options).await?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

async fn get_cluster(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Query(params): Query<IdParams>,
) -> Result<Json<Cluster>, ApiError> {
    let id = ClusterId::parse(&id, params.id_type.as_deref())?;
    Ok(Json(state.registry.get(&actor, &id).await?))
}

async fn update_cluster(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Query(params): Query<UpdateParams>,
    Json(patch): Json<Cluster>,
) -> Result<Json<Cluster>, ApiError> {
    let id = ClusterId::parse(&id, params.id_type.as_deref())?;
    let fields = match params.updated_fields.as_deref() {
        Some(list) => ClusterField::parse_list(list)?,
        None => Vec::new(),
    };

    let request = UpdateRequest {
        fields,
        patch,
        expected_version: params.resource_version,
    };
    Ok(Json(state.registry.update(&actor, &id, request).await?))
}

async fn delete_cluster(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Query(params): Query<IdParams>,
) -> Result<Json<DeleteOutcome>, ApiError> {
    let id = ClusterId::parse(&id, params.id_type.as_deref())?;
    let outcome = state
        .registry
        .delete(&actor, &id, DeleteOptions::default())
        .await?;
    Ok(Json(outcome))
}

async fn refresh_cluster(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Query(params): Query<IdParams>,
) -> Result<(StatusCode, Json<Cluster>), ApiError> {
    let id = ClusterId::parse(&id, params.id_type.as_deref())?;
    let cluster = state.registry.refresh(&actor, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(cluster)))
}
