//! Table registry and applier (spec §4.2), plus the two table builders that
//! feed it (§4.3, §4.4).

pub mod acl_table;
pub mod firewall_table;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;
use wirewarden_kernel::nft::{parse_set_element_count, NftError, NftRunner};

pub use acl_table::AclTableBuilder;
pub use firewall_table::FirewallTableBuilder;

/// Errors raised loading/validating the data a table is built from. Matches
/// the shape of the per-store errors it wraps so `ApiError` can translate it.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Validation(String),
}

impl From<crate::db::firewall::FirewallStoreError> for FirewallError {
    fn from(err: crate::db::firewall::FirewallStoreError) -> Self {
        match err {
            crate::db::firewall::FirewallStoreError::Database(e) => Self::Database(e),
            crate::db::firewall::FirewallStoreError::Validation(m) => Self::Validation(m),
        }
    }
}

impl From<crate::db::acl::AclError> for FirewallError {
    fn from(err: crate::db::acl::AclError) -> Self {
        match err {
            crate::db::acl::AclError::Database(e) => Self::Database(e),
            crate::db::acl::AclError::Validation(m) => Self::Validation(m),
        }
    }
}

/// Errors raised applying a built script to the kernel. Kept separate from
/// [`FirewallError`]: apply failures are reported via [`ApplyEvent`], never
/// surfaced as an HTTP error (spec §7 "apply failures are reported, not fatal").
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("building table script: {0}")]
    Build(#[from] FirewallError),

    #[error("nft: {0}")]
    Nft(#[from] NftError),
}

/// A registered table: pure builder plus the static facts the applier needs
/// about it (spec §4.2 `register`).
pub trait TableBuilder: Send + Sync {
    fn family(&self) -> &'static str;
    fn name(&self) -> &'static str;
    /// Apply-ordering priority; ascending order is applied first (spec §4.2 `apply_all`).
    fn priority(&self) -> i32;
    fn set_names(&self) -> Vec<String>;
    fn build(&self) -> BoxFuture<'_, Result<String, FirewallError>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub name: String,
    pub exists: bool,
    pub set_counts: HashMap<String, usize>,
}

/// Status events published to the hub's `traffic`/apply-status consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum ApplyEvent {
    Pending,
    Applying,
    Applied { tables: Vec<TableStats> },
    Error { message: String },
}

struct ApplierState {
    pending: bool,
    generation: u64,
    last_apply_at: Option<DateTime<Utc>>,
    last_apply_error: Option<String>,
}

/// C2 Table Registry & Applier. Holds ordered table builders, coalesces
/// apply requests behind a 500ms debounce timer, and performs atomic
/// delete+replace of each table via [`NftRunner`].
pub struct Applier {
    runner: NftRunner,
    tables: AsyncMutex<Vec<Arc<dyn TableBuilder>>>,
    state: Mutex<ApplierState>,
    events: mpsc::UnboundedSender<ApplyEvent>,
    debounce: Duration,
}

impl Applier {
    pub fn new(runner: NftRunner, events: mpsc::UnboundedSender<ApplyEvent>) -> Arc<Self> {
        Arc::new(Self {
            runner,
            tables: AsyncMutex::new(Vec::new()),
            state: Mutex::new(ApplierState {
                pending: false,
                generation: 0,
                last_apply_at: None,
                last_apply_error: None,
            }),
            events,
            debounce: Duration::from_millis(500),
        })
    }

    /// Idempotent by name (spec §4.2 `register`).
    pub async fn register(&self, builder: Arc<dyn TableBuilder>) {
        let mut tables = self.tables.lock().await;
        if let Some(slot) = tables.iter_mut().find(|t| t.name() == builder.name()) {
            *slot = builder;
        } else {
            tables.push(builder);
        }
    }

    /// Sets `pending`, emits `Pending`, and (re)starts the 500ms debounce
    /// timer. Coalescing: only the call whose generation survives untouched
    /// for the full debounce window actually fires (spec §4.2, testable
    /// scenario S1).
    pub fn request_apply(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock().unwrap();
            state.pending = true;
            state.generation += 1;
            state.generation
        };
        let _ = self.events.send(ApplyEvent::Pending);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            let fires = this.state.lock().unwrap().generation == generation;
            if fires {
                this.fire().await;
            }
        });
    }

    async fn fire(&self) {
        self.state.lock().unwrap().pending = false;
        let _ = self.events.send(ApplyEvent::Applying);

        match self.apply_all().await {
            Ok(tables) => {
                let mut state = self.state.lock().unwrap();
                state.last_apply_at = Some(Utc::now());
                state.last_apply_error = None;
                drop(state);
                let _ = self.events.send(ApplyEvent::Applied { tables });
            }
            Err(err) => {
                let message = err.to_string();
                let mut state = self.state.lock().unwrap();
                state.last_apply_error = Some(message.clone());
                drop(state);
                let _ = self.events.send(ApplyEvent::Error { message });
            }
        }
    }

    /// Snapshots registered tables, sorts ascending by priority, applies
    /// each in turn, aborting on first failure (spec §4.2 `apply_all`).
    pub async fn apply_all(&self) -> Result<Vec<TableStats>, ApplyError> {
        let mut snapshot: Vec<Arc<dyn TableBuilder>> = self.tables.lock().await.clone();
        snapshot.sort_by_key(|t| t.priority());

        let mut stats = Vec::with_capacity(snapshot.len());
        for table in &snapshot {
            stats.push(self.apply_table(table.as_ref()).await?);
        }
        Ok(stats)
    }

    /// Prepends `delete table <family> <name>` (atomic replace idiom);
    /// retries once without the prefix if the table doesn't exist yet
    /// (spec §4.2 `apply_table`).
    async fn apply_table(&self, table: &dyn TableBuilder) -> Result<TableStats, ApplyError> {
        let script = table.build().await?;
        let with_delete = format!("delete table {} {}\n{}", table.family(), table.name(), script);

        match self.runner.apply_script(&with_delete).await {
            Ok(()) => {}
            Err(NftError::NonZeroExit { stderr, .. })
                if stderr.contains("No such file") || stderr.contains("does not exist") =>
            {
                warn!(table = table.name(), "table not yet installed, retrying without delete");
                self.runner.apply_script(&script).await?;
            }
            Err(err) => return Err(ApplyError::Nft(err)),
        }

        self.table_stats(table).await
    }

    async fn table_stats(&self, table: &dyn TableBuilder) -> Result<TableStats, ApplyError> {
        match self.runner.list(table.family(), table.name(), None).await {
            Ok(listing) => {
                let set_counts = table
                    .set_names()
                    .into_iter()
                    .map(|name| {
                        let count = parse_set_element_count(&listing, &name);
                        (name, count)
                    })
                    .collect();
                Ok(TableStats { name: table.name().to_string(), exists: true, set_counts })
            }
            Err(_) => Ok(TableStats {
                name: table.name().to_string(),
                exists: false,
                set_counts: HashMap::new(),
            }),
        }
    }

    /// For each registered table: `{exists, set_counts}` from a fresh
    /// listing (spec §4.2 `stats`).
    pub async fn stats(&self) -> Vec<TableStats> {
        let snapshot: Vec<Arc<dyn TableBuilder>> = self.tables.lock().await.clone();
        let mut out = Vec::with_capacity(snapshot.len());
        for table in &snapshot {
            if let Ok(stat) = self.table_stats(table.as_ref()).await {
                out.push(stat);
            }
        }
        out
    }

    pub fn last_apply_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_apply_at
    }

    pub fn last_apply_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_apply_error.clone()
    }
}
