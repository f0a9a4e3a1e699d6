use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::catalog::{self, PLAN_ID, SERVICE_ID};
use super::AppState;
use crate::errors::BrokerError;
use crate::reconcile::{BindOutcome, Credentials, PlatformContext, ProvisionOutcome};

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub organization_guid: String,
    #[serde(default)]
    pub space_guid: String,
    pub parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub service_id: String,
    pub plan_id: Option<String>,
    pub parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct BindRequest {
    pub service_id: String,
    pub plan_id: String,
    pub app_guid: Option<String>,
    pub bind_resource: Option<BindResource>,
}

#[derive(Debug, Deserialize)]
pub struct BindResource {
    pub app_guid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Serialize)]
pub struct ProvisionResponse {
    pub dashboard_url: String,
}

#[derive(Serialize)]
pub struct BindResponse {
    pub credentials: Credentials,
}

// ── Handlers ─────────────────────────────────────────────────

pub async fn get_catalog() -> Json<catalog::Catalog> {
    Json(catalog::catalog())
}

pub async fn provision(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<ProvisionRequest>,
) -> Result<Response, BrokerError> {
    check_offering(&req.service_id, Some(&req.plan_id))?;
    let spec = state.parameters.desired_spec(req.parameters.as_ref())?;
    let ctx = PlatformContext {
        org_id: req.organization_guid,
        space_id: req.space_guid,
    };

    let _guard = state.locks.acquire(&instance_id).await;
    let (status, instance) = match state.broker.provision(&instance_id, &spec, &ctx).await? {
        ProvisionOutcome::Created(instance) => (StatusCode::CREATED, instance),
        ProvisionOutcome::AlreadyExists(instance) => (StatusCode::OK, instance),
    };

    Ok((
        status,
        Json(ProvisionResponse {
            dashboard_url: instance.dashboard_url,
        }),
    )
        .into_response())
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<UpdateRequest>,
) -> Result<Response, BrokerError> {
    check_offering(&req.service_id, req.plan_id.as_deref())?;
    let spec = state.parameters.desired_spec(req.parameters.as_ref())?;

    let _guard = state.locks.acquire(&instance_id).await;
    state.broker.update(&instance_id, &spec).await?;
    Ok((StatusCode::OK, Json(json!({}))).into_response())
}

pub async fn deprovision(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Response, BrokerError> {
    check_offering(&params.service_id, Some(&params.plan_id))?;

    let _guard = state.locks.acquire(&instance_id).await;
    match state.broker.deprovision(&instance_id).await {
        Ok(()) => Ok((StatusCode::OK, Json(json!({}))).into_response()),
        Err(BrokerError::InstanceNotFound { .. }) => {
            Ok((StatusCode::GONE, Json(json!({}))).into_response())
        }
        Err(e) => Err(e),
    }
}

pub async fn bind(
    State(state): State<Arc<AppState>>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Json(req): Json<BindRequest>,
) -> Result<Response, BrokerError> {
    check_offering(&req.service_id, Some(&req.plan_id))?;
    let app_guid = req
        .bind_resource
        .and_then(|r| r.app_guid)
        .or(req.app_guid);

    let _guard = state.locks.acquire(&instance_id).await;
    let (status, credentials) = match state
        .broker
        .bind(&instance_id, &binding_id, app_guid.as_deref())
        .await?
    {
        BindOutcome::Created(credentials) => (StatusCode::CREATED, credentials),
        BindOutcome::AlreadyExists(credentials) => (StatusCode::OK, credentials),
    };

    Ok((status, Json(BindResponse { credentials })).into_response())
}

pub async fn unbind(
    State(state): State<Arc<AppState>>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Query(params): Query<DeleteParams>,
) -> Result<Response, BrokerError> {
    check_offering(&params.service_id, Some(&params.plan_id))?;

    let _guard = state.locks.acquire(&instance_id).await;
    state.broker.unbind(&binding_id).await?;
    Ok((StatusCode::OK, Json(json!({}))).into_response())
}

fn check_offering(service_id: &str, plan_id: Option<&str>) -> Result<(), BrokerError> {
    if service_id != SERVICE_ID {
        return Err(BrokerError::InvalidParameters(format!(
            "invalid service ID {}",
            service_id
        )));
    }
    match plan_id {
        Some(plan_id) if plan_id != PLAN_ID => Err(BrokerError::InvalidParameters(format!(
            "invalid plan ID {}",
            plan_id
        ))),
        _ => Ok(()),
    }
}
