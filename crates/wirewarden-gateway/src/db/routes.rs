//! Domain route store (spec §3 "Domain Route").

use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use wirewarden_types::DomainRoute;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Validation(String),
}

type Result<T> = std::result::Result<T, RouteError>;

pub struct NewRoute {
    pub domain: String,
    pub target_ip: String,
    pub target_port: i32,
    pub peer_id: Option<String>,
    pub enabled: bool,
    pub https_backend: bool,
    pub middlewares: Vec<String>,
    pub description: Option<String>,
}

fn validate_domain(domain: &str) -> Result<()> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    if !valid {
        return Err(RouteError::Validation(format!("{domain} is not a valid domain name")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct RouteStore {
    pool: PgPool,
}

impl RouteStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<DomainRoute>> {
        let routes = sqlx::query_as("SELECT * FROM domain_routes ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(routes)
    }

    pub async fn get(&self, id: i64) -> Result<Option<DomainRoute>> {
        let route = sqlx::query_as("SELECT * FROM domain_routes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(route)
    }

    #[tracing::instrument(skip(self, input))]
    pub async fn create(&self, input: NewRoute) -> Result<DomainRoute> {
        validate_domain(&input.domain)?;
        let now = Utc::now();
        let route = sqlx::query_as(
            "INSERT INTO domain_routes
                (domain, target_ip, target_port, peer_id, enabled, https_backend,
                 middlewares, description, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
             RETURNING *",
        )
        .bind(&input.domain)
        .bind(&input.target_ip)
        .bind(input.target_port)
        .bind(&input.peer_id)
        .bind(input.enabled)
        .bind(input.https_backend)
        .bind(&input.middlewares)
        .bind(&input.description)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(route)
    }

    #[tracing::instrument(skip(self, input))]
    pub async fn update(&self, id: i64, input: NewRoute) -> Result<DomainRoute> {
        validate_domain(&input.domain)?;
        let route = sqlx::query_as(
            "UPDATE domain_routes SET
                domain = $1, target_ip = $2, target_port = $3, peer_id = $4,
                enabled = $5, https_backend = $6, middlewares = $7, description = $8,
                updated_at = $9
             WHERE id = $10
             RETURNING *",
        )
        .bind(&input.domain)
        .bind(&input.target_ip)
        .bind(input.target_port)
        .bind(&input.peer_id)
        .bind(input.enabled)
        .bind(input.https_backend)
        .bind(&input.middlewares)
        .bind(&input.description)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(route)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM domain_routes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_malformed_domains() {
        assert!(validate_domain("").is_err());
        assert!(validate_domain("..").is_err());
    }

    #[test]
    fn accepts_plain_fqdn() {
        assert!(validate_domain("vpn.example.com").is_ok());
    }
}
