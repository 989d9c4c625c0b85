use crate::error::GatewayError;
use crate::handlers::GatewayState;
use crate::streaming::progress_stream;
use actix_web::{HttpResponse, Responder, web};
use serde_json::{Value, json};

/// GET /api/requests/{id}/events: SSE progress stream. Attaching begins
/// the work for an async request that has not started yet.
pub async fn progress_events(
    path: web::Path<String>,
    state: web::Data<GatewayState>,
) -> Result<impl Responder, GatewayError> {
    let request_id = path.into_inner();
    progress_stream(&state.engine, &request_id)
}

/// POST /api/requests/{id}/cancel: flip the cooperative cancel flag
pub async fn cancel_request(
    path: web::Path<String>,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let request_id = path.into_inner();
    if state.engine.registry().cancel(&request_id) {
        Ok(HttpResponse::Ok().json(json!({ "canceled": true })))
    } else {
        Err(GatewayError::RequestNotFound(request_id))
    }
}

/// POST /api/callbacks/{callbackId}: submit a client-tool result. The
/// waiter may live on another instance; resolution fans out over the bus
/// either way, so a local miss is not an error.
pub async fn resolve_callback(
    path: web::Path<String>,
    body: web::Json<Value>,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let callback_id = path.into_inner();
    let result = body
        .into_inner()
        .get("result")
        .cloned()
        .unwrap_or(Value::Null);
    let resolved_here = state.engine.callbacks().resolve(&callback_id, result);
    Ok(HttpResponse::Ok().json(json!({ "resolvedHere": resolved_here })))
}
