// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Exercises the table applier and the kernel sync component against fakes,
//! without a live `nft` binary or netlink socket (spec §8 testable scenarios).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use wirewarden_gateway::firewall::{ApplyEvent, Applier, TableBuilder};
use wirewarden_gateway::wgsync::WireguardSync;
use wirewarden_kernel::nft::NftRunner;
use wirewarden_kernel::{Platform, PlatformError};

// -- Applier, driven against `/usr/bin/true` in place of `nft` --

struct FakeTable {
    name: &'static str,
    priority: i32,
    build_calls: Arc<AtomicUsize>,
}

impl TableBuilder for FakeTable {
    fn family(&self) -> &'static str {
        "inet"
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn set_names(&self) -> Vec<String> {
        vec![]
    }

    fn build(&self) -> BoxFuture<'_, Result<String, wirewarden_gateway::firewall::FirewallError>> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(format!("table inet {} {{}}", self.name)) })
    }
}

#[tokio::test]
async fn apply_all_applies_tables_in_priority_order() {
    let (tx, _rx) = mpsc::unbounded_channel::<ApplyEvent>();
    let applier = Applier::new(NftRunner::new("true"), tx);

    let calls = Arc::new(AtomicUsize::new(0));
    applier
        .register(Arc::new(FakeTable { name: "second", priority: 10, build_calls: calls.clone() }))
        .await;
    applier
        .register(Arc::new(FakeTable { name: "first", priority: 0, build_calls: calls.clone() }))
        .await;

    let stats = applier.apply_all().await.expect("fake nft runner should always succeed");
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].name, "first");
    assert_eq!(stats[1].name, "second");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn request_apply_coalesces_bursts_into_one_fire() {
    let (tx, mut rx) = mpsc::unbounded_channel::<ApplyEvent>();
    let applier = Applier::new(NftRunner::new("true"), tx);

    let calls = Arc::new(AtomicUsize::new(0));
    applier
        .register(Arc::new(FakeTable { name: "only", priority: 0, build_calls: calls.clone() }))
        .await;

    // Three rapid calls within the debounce window should still only fire once.
    applier.request_apply();
    applier.request_apply();
    applier.request_apply();

    // Drain events until the debounce timer's single `Applied` event arrives.
    let mut applied_count = 0;
    while let Some(event) = rx.recv().await {
        match event {
            ApplyEvent::Applied { .. } => {
                applied_count += 1;
                break;
            }
            ApplyEvent::Error { message } => panic!("unexpected apply error: {message}"),
            _ => {}
        }
    }

    assert_eq!(applied_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "table should only be built once for the coalesced burst");
    assert!(applier.last_apply_at().is_some());
    assert!(applier.last_apply_error().is_none());
}

// -- WireguardSync against a recording fake Platform --

#[derive(Default)]
struct RecordingPlatform;

static ENSURE_CALLS: AtomicUsize = AtomicUsize::new(0);
static APPLY_CALLS: AtomicUsize = AtomicUsize::new(0);
static LAST_PEER_COUNT: AtomicUsize = AtomicUsize::new(usize::MAX);

impl Platform for RecordingPlatform {
    async fn ensure_interface(_name: &str) -> Result<(), PlatformError> {
        ENSURE_CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_interface(_name: &str) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn interface_exists(_name: &str) -> Result<bool, PlatformError> {
        Ok(true)
    }

    async fn apply_config(
        _name: &str,
        desired: &wirewarden_types::WireguardDesiredState,
        _prev: Option<&wirewarden_types::WireguardDesiredState>,
    ) -> Result<(), PlatformError> {
        APPLY_CALLS.fetch_add(1, Ordering::SeqCst);
        LAST_PEER_COUNT.store(desired.peers.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn read_counters(
        _name: &str,
    ) -> Result<Vec<wirewarden_kernel::PeerCounterSample>, PlatformError> {
        Ok(Vec::new())
    }
}

fn lazy_pool() -> sqlx::PgPool {
    sqlx::pool::PoolOptions::new()
        .connect_lazy("postgres://unused/unused")
        .expect("connect_lazy never touches the network")
}

#[tokio::test]
async fn sync_ensures_interface_and_pushes_empty_state_for_empty_registry() {
    let peers = wirewarden_gateway::db::peers::PeerStore::new(lazy_pool(), [0u8; 32]);
    let cidr: ipnetwork::Ipv4Network = "10.8.0.0/24".parse().unwrap();

    let sync = WireguardSync::<RecordingPlatform>::new(
        peers,
        "wwg-test".to_string(),
        51820,
        "server-priv".to_string(),
        cidr,
    );

    sync.sync().await.expect("recording platform never fails");

    assert!(ENSURE_CALLS.load(Ordering::SeqCst) >= 1);
    assert!(APPLY_CALLS.load(Ordering::SeqCst) >= 1);
    assert_eq!(LAST_PEER_COUNT.load(Ordering::SeqCst), 0, "no peers registered yet");
}

#[tokio::test]
async fn sync_or_log_never_panics_on_success() {
    let peers = wirewarden_gateway::db::peers::PeerStore::new(lazy_pool(), [0u8; 32]);
    let cidr: ipnetwork::Ipv4Network = "10.9.0.0/24".parse().unwrap();

    let sync = WireguardSync::<RecordingPlatform>::new(
        peers,
        "wwg-test-2".to_string(),
        51821,
        "server-priv-2".to_string(),
        cidr,
    );

    sync.sync_or_log().await;
}
