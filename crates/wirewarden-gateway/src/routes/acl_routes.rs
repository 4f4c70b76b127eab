//! ACL rule CRUD (spec §4.4).

use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::app::App;
use crate::error::ApiError;
use crate::extract::AuthUser;

#[derive(Debug, Deserialize)]
struct CreateAclRequest {
    source_peer_id: String,
    target_peer_id: String,
    #[serde(default)]
    bidirectional: bool,
}

async fn list_rules(_auth: AuthUser, app: web::Data<App>) -> Result<HttpResponse, ApiError> {
    let rules = app.acl.list().await?;
    Ok(HttpResponse::Ok().json(rules))
}

async fn create_rule(
    _auth: AuthUser,
    app: web::Data<App>,
    body: web::Json<CreateAclRequest>,
) -> Result<HttpResponse, ApiError> {
    let rule = app
        .acl
        .create(&body.source_peer_id, &body.target_peer_id, body.bidirectional)
        .await?;
    app.applier.request_apply();
    Ok(HttpResponse::Created().json(rule))
}

async fn delete_rule(
    _auth: AuthUser,
    app: web::Data<App>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    app.acl.delete(path.into_inner()).await?;
    app.applier.request_apply();
    Ok(HttpResponse::NoContent().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/acl/rules")
            .route(web::get().to(list_rules))
            .route(web::post().to(create_rule)),
    )
    .service(web::resource("/api/acl/rules/{id}").route(web::delete().to(delete_rule)));
}
