//! Request extractors. Grounded on the donor's `AuthServer` token-lookup
//! pattern, adapted to validate against the external identity service
//! instead of a local token store.

use actix_web::dev::Payload;
use actix_web::web::Data;
use actix_web::{FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;

use crate::app::App;
use crate::error::ApiError;
use crate::identity::ResolvedUser;

#[derive(Debug)]
pub struct AuthUser(pub ResolvedUser);

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let app = req.app_data::<Data<App>>().cloned();
        let token = bearer_token(req);

        Box::pin(async move {
            let app = app.ok_or(ApiError::Internal)?;
            let token = token.ok_or(ApiError::Unauthorized)?;
            let user = app.identity.validate_token(&token).await?;
            Ok(AuthUser(user))
        })
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}
