use crate::error::GatewayError;
use crate::handlers::GatewayState;
use crate::store::StoredPathway;
use actix_web::{HttpResponse, web};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(flatten)]
    pub pathway: StoredPathway,
    pub publish_key: Option<String>,
    pub prompt_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub secret: String,
    pub publish_key: Option<String>,
}

/// PUT /api/dynamic/{userId}/{name}: create or update a user pathway
pub async fn publish_pathway(
    path: web::Path<(String, String)>,
    body: web::Json<PublishRequest>,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let (user_id, name) = path.into_inner();
    let request = body.into_inner();
    state
        .store
        .put(
            &user_id,
            &name,
            request.pathway,
            request.publish_key.as_deref(),
            request.prompt_names.as_deref(),
        )
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "saved": true })))
}

/// DELETE /api/dynamic/{userId}/{name}
pub async fn delete_pathway(
    path: web::Path<(String, String)>,
    body: web::Json<DeleteRequest>,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let (user_id, name) = path.into_inner();
    let request = body.into_inner();
    state
        .store
        .delete(&user_id, &name, &request.secret, request.publish_key.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "deleted": true })))
}

/// GET /api/dynamic/{userId}/{name}: materialized pathway, secret-free
pub async fn get_pathway(
    path: web::Path<(String, String)>,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let (user_id, name) = path.into_inner();
    let pathway = state
        .store
        .get_pathway(&user_id, &name)
        .await
        .ok_or_else(|| GatewayError::PathwayNotFound(format!("{}/{}", user_id, name)))?;
    Ok(HttpResponse::Ok().json(pathway))
}

/// GET /api/dynamic: every published pathway, namespaced by user
pub async fn list_pathways(state: web::Data<GatewayState>) -> HttpResponse {
    HttpResponse::Ok().json(state.store.list_pathways().await)
}
