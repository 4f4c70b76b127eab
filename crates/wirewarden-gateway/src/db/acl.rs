//! ACL rule store (spec §3 "ACL Rule", §4.4).

use sqlx::PgPool;
use thiserror::Error;
use wirewarden_types::AclRule;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Validation(String),
}

type Result<T> = std::result::Result<T, AclError>;

#[derive(Clone)]
pub struct AclStore {
    pool: PgPool,
}

impl AclStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<AclRule>> {
        let rules = sqlx::query_as("SELECT * FROM acl_rules ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rules)
    }

    /// Insert a source→target rule pair, unique as a pair (spec §3).
    #[tracing::instrument(skip(self))]
    pub async fn create(
        &self,
        source_peer_id: &str,
        target_peer_id: &str,
        bidirectional: bool,
    ) -> Result<AclRule> {
        if source_peer_id == target_peer_id {
            return Err(AclError::Validation(
                "a peer cannot have an ACL rule against itself".into(),
            ));
        }

        let rule = sqlx::query_as(
            "INSERT INTO acl_rules (source_peer_id, target_peer_id, bidirectional)
             VALUES ($1, $2, $3)
             ON CONFLICT (source_peer_id, target_peer_id) DO UPDATE SET bidirectional = EXCLUDED.bidirectional
             RETURNING *",
        )
        .bind(source_peer_id)
        .bind(target_peer_id)
        .bind(bidirectional)
        .fetch_one(&self.pool)
        .await?;
        Ok(rule)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM acl_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
