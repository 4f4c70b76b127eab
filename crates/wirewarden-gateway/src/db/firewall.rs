//! Firewall entry store (spec §3 "Firewall Entry", §4.3 load path).

use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use wirewarden_types::{Direction, EntryKind, EntrySource, FirewallAction, FirewallEntry, Protocol};

#[derive(Debug, Error)]
pub enum FirewallStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Validation(String),
}

type Result<T> = std::result::Result<T, FirewallStoreError>;

/// Fields accepted when creating or updating a firewall entry.
pub struct EntryInput {
    pub kind: EntryKind,
    pub value: String,
    pub action: FirewallAction,
    pub direction: Direction,
    pub protocol: Protocol,
    pub source: EntrySource,
    pub reason: Option<String>,
    pub display_name: Option<String>,
    pub essential: bool,
    pub expires_at: Option<chrono::DateTime<Utc>>,
    pub enabled: bool,
}

/// Validate the invariants from spec §3: `kind=port ⇒ action=allow`,
/// `kind=country ⇒ value matches ^[A-Z]{2}$`, `kind=range ⇒ value parses as IPv4 CIDR`.
fn validate(input: &EntryInput) -> Result<()> {
    match input.kind {
        EntryKind::Port if input.action != FirewallAction::Allow => {
            return Err(FirewallStoreError::Validation(
                "port entries must have action = allow".into(),
            ));
        }
        EntryKind::Country => {
            let valid = input.value.len() == 2 && input.value.chars().all(|c| c.is_ascii_uppercase());
            if !valid {
                return Err(FirewallStoreError::Validation(
                    "country entries require a two-letter ISO-3166 alpha-2 code".into(),
                ));
            }
        }
        EntryKind::Range => {
            if input.value.parse::<ipnetwork::Ipv4Network>().is_err() {
                return Err(FirewallStoreError::Validation(
                    "range entries must be a valid IPv4 CIDR".into(),
                ));
            }
        }
        EntryKind::Ip => {
            if input.value.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(FirewallStoreError::Validation(
                    "ip entries must be a valid IPv4 address".into(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

#[derive(Clone)]
pub struct FirewallStore {
    pool: PgPool,
}

impl FirewallStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<FirewallEntry>> {
        let entries = sqlx::query_as("SELECT * FROM firewall_entries ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    pub async fn get(&self, id: i64) -> Result<Option<FirewallEntry>> {
        let entry = sqlx::query_as("SELECT * FROM firewall_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    #[tracing::instrument(skip(self, input))]
    pub async fn create(&self, input: EntryInput) -> Result<FirewallEntry> {
        validate(&input)?;
        let entry = sqlx::query_as(
            "INSERT INTO firewall_entries
                (kind, value, action, direction, protocol, source, reason, display_name,
                 essential, expires_at, enabled, hit_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0)
             RETURNING *",
        )
        .bind(input.kind)
        .bind(&input.value)
        .bind(input.action)
        .bind(input.direction)
        .bind(input.protocol)
        .bind(input.source)
        .bind(&input.reason)
        .bind(&input.display_name)
        .bind(input.essential)
        .bind(input.expires_at)
        .bind(input.enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(entry)
    }

    #[tracing::instrument(skip(self, input))]
    pub async fn update(&self, id: i64, input: EntryInput) -> Result<FirewallEntry> {
        validate(&input)?;
        let entry = sqlx::query_as(
            "UPDATE firewall_entries SET
                kind = $1, value = $2, action = $3, direction = $4, protocol = $5,
                source = $6, reason = $7, display_name = $8, essential = $9,
                expires_at = $10, enabled = $11
             WHERE id = $12
             RETURNING *",
        )
        .bind(input.kind)
        .bind(&input.value)
        .bind(input.action)
        .bind(input.direction)
        .bind(input.protocol)
        .bind(input.source)
        .bind(&input.reason)
        .bind(&input.display_name)
        .bind(input.essential)
        .bind(input.expires_at)
        .bind(input.enabled)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM firewall_entries WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bulk delete, used by the overlap pruner (spec §4.3) — the one place a
    /// builder writes to the store it reads from.
    pub async fn delete_many(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM firewall_entries WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_hit(&self, id: i64, count: i64) -> Result<()> {
        sqlx::query("UPDATE firewall_entries SET hit_count = hit_count + $1 WHERE id = $2")
            .bind(count)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> EntryInput {
        EntryInput {
            kind: EntryKind::Ip,
            value: "1.2.3.4".to_string(),
            action: FirewallAction::Block,
            direction: Direction::Inbound,
            protocol: Protocol::Both,
            source: EntrySource::Manual,
            reason: None,
            display_name: None,
            essential: false,
            expires_at: None,
            enabled: true,
        }
    }

    #[test]
    fn port_entries_must_allow() {
        let mut input = base_input();
        input.kind = EntryKind::Port;
        input.value = "443".to_string();
        input.action = FirewallAction::Block;
        assert!(validate(&input).is_err());

        input.action = FirewallAction::Allow;
        assert!(validate(&input).is_ok());
    }

    #[test]
    fn country_requires_two_letter_code() {
        let mut input = base_input();
        input.kind = EntryKind::Country;
        input.value = "usa".to_string();
        assert!(validate(&input).is_err());

        input.value = "US".to_string();
        assert!(validate(&input).is_ok());
    }

    #[test]
    fn range_requires_valid_cidr() {
        let mut input = base_input();
        input.kind = EntryKind::Range;
        input.value = "not-a-cidr".to_string();
        assert!(validate(&input).is_err());

        input.value = "10.0.0.0/24".to_string();
        assert!(validate(&input).is_ok());
    }
}
