use crate::engine::ResolveOutcome;
use crate::error::GatewayError;
use crate::handlers::GatewayState;
use actix_web::{HttpResponse, web};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::info;

fn outcome_response(outcome: ResolveOutcome) -> HttpResponse {
    match outcome {
        ResolveOutcome::Value(value) => HttpResponse::Ok().json(json!({ "result": value })),
        ResolveOutcome::Async { request_id } => {
            HttpResponse::Accepted().json(json!({ "requestId": request_id }))
        }
    }
}

/// POST /api/pathways/{name}/run: execute a built-in pathway. The body is
/// the argument map; `async`/`stream` switch to the request-id flow.
pub async fn run_pathway(
    path: web::Path<String>,
    body: web::Json<Map<String, Value>>,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let name = path.into_inner();
    info!(pathway = %name, "pathway_run_requested");
    let outcome = state.engine.resolve_by_name(&name, body.into_inner()).await?;
    Ok(outcome_response(outcome))
}

/// POST /api/dynamic/{userId}/{name}/run: execute a user pathway
pub async fn run_dynamic_pathway(
    path: web::Path<(String, String)>,
    body: web::Json<Map<String, Value>>,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let (user_id, name) = path.into_inner();
    let pathway = state
        .store
        .get_pathway(&user_id, &name)
        .await
        .ok_or_else(|| GatewayError::PathwayNotFound(format!("{}/{}", user_id, name)))?;
    info!(user_id = %user_id, pathway = %name, "dynamic_pathway_run_requested");
    let outcome = state
        .engine
        .resolve(&Arc::new(pathway), body.into_inner())
        .await?;
    Ok(outcome_response(outcome))
}
