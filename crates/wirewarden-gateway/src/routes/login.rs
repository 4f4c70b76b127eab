//! Login endpoint, guarded by the per-IP rate limiter (spec §4.11).

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::app::App;
use crate::error::ApiError;
use crate::ratelimit::{resolve_client_ip, Verdict};

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    req: HttpRequest,
    app: web::Data<App>,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let remote = req
        .peer_addr()
        .map(|a| a.ip())
        .ok_or(ApiError::Internal)?;
    let forwarded_for = header_str(&req, "x-forwarded-for");
    let real_ip = header_str(&req, "x-real-ip");
    let client_ip = resolve_client_ip(
        remote,
        forwarded_for.as_deref(),
        real_ip.as_deref(),
        &app.config.trusted_proxy_cidrs,
    );

    if let Some(retry_after_secs) = app.rate_limiter.remaining_lockout_secs(client_ip) {
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    match app.identity.login(&body.username, &body.password).await {
        Ok(session) => {
            app.rate_limiter.clear(client_ip);
            Ok(HttpResponse::Ok().json(session))
        }
        Err(err) => {
            if let Verdict::Locked { retry_after_secs } = app.rate_limiter.check_and_record_failure(client_ip) {
                return Err(ApiError::RateLimited { retry_after_secs });
            }
            Err(err.into())
        }
    }
}

fn header_str(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/login").route(web::post().to(login)));
}
