//! Firewall entry CRUD (spec §4.3).

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use wirewarden_types::{Direction, EntryKind, EntrySource, FirewallAction, Protocol};

use crate::app::App;
use crate::db::firewall::EntryInput;
use crate::error::ApiError;
use crate::extract::AuthUser;

#[derive(Debug, Deserialize)]
struct EntryRequest {
    kind: EntryKind,
    value: String,
    action: FirewallAction,
    #[serde(default = "default_direction")]
    direction: Direction,
    #[serde(default = "default_protocol")]
    protocol: Protocol,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    essential: bool,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_direction() -> Direction {
    Direction::Both
}

fn default_protocol() -> Protocol {
    Protocol::Both
}

fn default_true() -> bool {
    true
}

impl From<EntryRequest> for EntryInput {
    fn from(req: EntryRequest) -> Self {
        EntryInput {
            kind: req.kind,
            value: req.value,
            action: req.action,
            direction: req.direction,
            protocol: req.protocol,
            source: EntrySource::Manual,
            reason: req.reason,
            display_name: req.display_name,
            essential: req.essential,
            expires_at: req.expires_at,
            enabled: req.enabled,
        }
    }
}

async fn list_entries(_auth: AuthUser, app: web::Data<App>) -> Result<HttpResponse, ApiError> {
    let entries = app.firewall.list().await?;
    Ok(HttpResponse::Ok().json(entries))
}

async fn create_entry(
    _auth: AuthUser,
    app: web::Data<App>,
    body: web::Json<EntryRequest>,
) -> Result<HttpResponse, ApiError> {
    let entry = app.firewall.create(body.into_inner().into()).await?;
    app.applier.request_apply();
    Ok(HttpResponse::Created().json(entry))
}

async fn update_entry(
    _auth: AuthUser,
    app: web::Data<App>,
    path: web::Path<i64>,
    body: web::Json<EntryRequest>,
) -> Result<HttpResponse, ApiError> {
    let entry = app.firewall.update(path.into_inner(), body.into_inner().into()).await?;
    app.applier.request_apply();
    Ok(HttpResponse::Ok().json(entry))
}

async fn delete_entry(
    _auth: AuthUser,
    app: web::Data<App>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    app.firewall.delete(path.into_inner()).await?;
    app.applier.request_apply();
    Ok(HttpResponse::NoContent().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/firewall/entries")
            .route(web::get().to(list_entries))
            .route(web::post().to(create_entry)),
    )
    .service(
        web::resource("/api/firewall/entries/{id}")
            .route(web::put().to(update_entry))
            .route(web::delete().to(delete_entry)),
    );
}
