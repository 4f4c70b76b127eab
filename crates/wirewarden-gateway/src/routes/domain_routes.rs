//! Domain route CRUD (spec §3 "Domain Route").

use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::app::App;
use crate::db::routes::NewRoute;
use crate::error::ApiError;
use crate::extract::AuthUser;

#[derive(Debug, Deserialize)]
struct RouteRequest {
    domain: String,
    target_ip: String,
    target_port: i32,
    #[serde(default)]
    peer_id: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    https_backend: bool,
    #[serde(default)]
    middlewares: Vec<String>,
    #[serde(default)]
    description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl From<RouteRequest> for NewRoute {
    fn from(req: RouteRequest) -> Self {
        NewRoute {
            domain: req.domain,
            target_ip: req.target_ip,
            target_port: req.target_port,
            peer_id: req.peer_id,
            enabled: req.enabled,
            https_backend: req.https_backend,
            middlewares: req.middlewares,
            description: req.description,
        }
    }
}

async fn list_routes(_auth: AuthUser, app: web::Data<App>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(app.routes.list().await?))
}

async fn get_route(
    _auth: AuthUser,
    app: web::Data<App>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let route = app.routes.get(path.into_inner()).await?.ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(route))
}

async fn create_route(
    _auth: AuthUser,
    app: web::Data<App>,
    body: web::Json<RouteRequest>,
) -> Result<HttpResponse, ApiError> {
    let route = app.routes.create(body.into_inner().into()).await?;
    Ok(HttpResponse::Created().json(route))
}

async fn update_route(
    _auth: AuthUser,
    app: web::Data<App>,
    path: web::Path<i64>,
    body: web::Json<RouteRequest>,
) -> Result<HttpResponse, ApiError> {
    let route = app.routes.update(path.into_inner(), body.into_inner().into()).await?;
    Ok(HttpResponse::Ok().json(route))
}

async fn delete_route(
    _auth: AuthUser,
    app: web::Data<App>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    app.routes.delete(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/routes")
            .route(web::get().to(list_routes))
            .route(web::post().to(create_route)),
    )
    .service(
        web::resource("/api/routes/{id}")
            .route(web::get().to(get_route))
            .route(web::put().to(update_route))
            .route(web::delete().to(delete_route)),
    );
}
