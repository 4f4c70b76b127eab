//! Peer CRUD and client-config download (spec §4.5), grounded on the
//! donor's `server_routes.rs` CRUD shape.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use wirewarden_types::peer::ClientConfigMode;
use wirewarden_types::{AclPolicy, PeerKind};

use crate::app::App;
use crate::db::peers::NewPeer;
use crate::error::ApiError;
use crate::extract::AuthUser;

#[derive(Debug, Deserialize)]
struct CreatePeerRequest {
    name: String,
    kind: PeerKind,
    #[serde(default)]
    acl_policy: Option<AclPolicy>,
    #[serde(default)]
    preshared_key: bool,
}

async fn list_peers(_auth: AuthUser, app: web::Data<App>) -> HttpResponse {
    HttpResponse::Ok().json(app.peers.list())
}

async fn get_peer(
    _auth: AuthUser,
    app: web::Data<App>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let peer = app.peers.get(&path.into_inner()).ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(peer))
}

async fn create_peer(
    _auth: AuthUser,
    app: web::Data<App>,
    body: web::Json<CreatePeerRequest>,
) -> Result<HttpResponse, ApiError> {
    let cidr = match body.kind {
        PeerKind::Wireguard => app.config.peer_cidr,
        PeerKind::Mesh => app
            .config
            .mesh_cidr
            .ok_or_else(|| ApiError::Validation("no mesh CIDR configured".into()))?,
    };

    let address = app.peers.allocate_ip(cidr);
    if address.is_empty() {
        return Err(ApiError::Validation("no available addresses in this CIDR".into()));
    }

    let (public_key, private_key) = crate::db::peers::PeerStore::generate_keypair();
    let preshared_key = body.preshared_key.then(|| {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
    });

    let peer = app
        .peers
        .add(NewPeer {
            name: body.name.clone(),
            address: address.parse().map_err(|_| ApiError::Internal)?,
            kind: body.kind,
            public_key,
            private_key,
            preshared_key,
            acl_policy: body.acl_policy.unwrap_or(AclPolicy::Selected),
        })
        .await?;

    app.applier.request_apply();
    app.wg_sync.sync_or_log().await;
    Ok(HttpResponse::Created().json(peer))
}

async fn delete_peer(
    _auth: AuthUser,
    app: web::Data<App>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    app.peers.delete(&path.into_inner()).await?;
    app.applier.request_apply();
    app.wg_sync.sync_or_log().await;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
struct ClientConfigQuery {
    #[serde(default)]
    mode: Option<String>,
}

async fn client_config(
    _auth: AuthUser,
    app: web::Data<App>,
    path: web::Path<String>,
    query: web::Query<ClientConfigQuery>,
) -> Result<HttpResponse, ApiError> {
    let peer = app.peers.get(&path.into_inner()).ok_or(ApiError::NotFound)?;
    let mode = match query.mode.as_deref() {
        Some("full") => ClientConfigMode::Full,
        _ => ClientConfigMode::Split,
    };

    let endpoint = format!("{}:{}", app.config.server_public_ip, app.config.wg_listen_port);

    let config = app.peers.generate_client_config(
        &peer,
        mode,
        &app.server_public_key,
        &endpoint,
        app.config.peer_cidr,
        app.config.mesh_cidr,
        app.config.dns_address.as_deref(),
    );

    Ok(HttpResponse::Ok().content_type("text/plain").body(config))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/peers")
            .route(web::get().to(list_peers))
            .route(web::post().to(create_peer)),
    )
    .service(
        web::resource("/api/peers/{id}")
            .route(web::get().to(get_peer))
            .route(web::delete().to(delete_peer)),
    )
    .service(web::resource("/api/peers/{id}/config").route(web::get().to(client_config)));
}
