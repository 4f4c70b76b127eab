//! Geolocation CIDR collaborator (spec §4.3, §6 "a separate directory holds
//! geolocation data files"). Out of scope as a provider of truth — this is a
//! thin adapter over flat per-country CIDR list files.

use std::path::PathBuf;

use chrono::Utc;
use futures::future::BoxFuture;
use wirewarden_types::{Direction, EntryKind, FirewallAction};

use crate::db::firewall::FirewallStore;

/// Resolves blocked-country firewall entries to concrete CIDRs.
pub trait GeoProvider: Send + Sync {
    /// All CIDRs implied by enabled, non-expired `kind=country` block entries.
    /// When `outbound_only`, only entries whose direction includes outbound
    /// are considered.
    fn get_all_blocked_cidrs(&self, outbound_only: bool) -> BoxFuture<'_, Vec<String>>;
}

/// Reads `<data_dir>/<ISO-3166 code>.cidr`, one CIDR per line.
pub struct FileGeoProvider {
    data_dir: PathBuf,
    store: FirewallStore,
}

impl FileGeoProvider {
    pub fn new(data_dir: impl Into<PathBuf>, store: FirewallStore) -> Self {
        Self { data_dir: data_dir.into(), store }
    }

    async fn load_country(&self, code: &str) -> Vec<String> {
        let path = self.data_dir.join(format!("{code}.cidr"));
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from)
                .collect(),
            Err(err) => {
                tracing::warn!(code, path = %path.display(), error = %err, "no geoip data for country");
                Vec::new()
            }
        }
    }
}

impl GeoProvider for FileGeoProvider {
    fn get_all_blocked_cidrs(&self, outbound_only: bool) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let entries = match self.store.list().await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(error = %err, "failed to load firewall entries for geo resolution");
                    return Vec::new();
                }
            };

            let now = Utc::now();
            let codes: Vec<&str> = entries
                .iter()
                .filter(|e| e.kind == EntryKind::Country && e.action == FirewallAction::Block)
                .filter(|e| e.is_active(now))
                .filter(|e| {
                    if outbound_only {
                        matches!(e.direction, Direction::Outbound | Direction::Both)
                    } else {
                        matches!(e.direction, Direction::Inbound | Direction::Both)
                    }
                })
                .map(|e| e.value.as_str())
                .collect();

            let mut cidrs = Vec::new();
            for code in codes {
                cidrs.extend(self.load_country(code).await);
            }
            cidrs
        })
    }
}
