//! C6 Traffic Reconciler (spec §4.6).
//!
//! [`reconcile_once`] is the pure delta/reset-detection core; everything
//! else here is the 30s I/O loop driving it.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{error, warn};
use wirewarden_kernel::{PeerCounterSample, Platform};

use crate::db::peers::{PeerStore, TrafficRow};

/// Compute one reconciliation pass: for each stored peer, fold in the
/// current kernel sample (if any). Peers absent from `samples` are offline
/// for this tick and pass through untouched. `current < last` is treated as
/// an interface restart, not a negative delta (spec §4.6 step 4).
pub fn reconcile_once(rows: &[TrafficRow], samples: &[PeerCounterSample]) -> Vec<TrafficRow> {
    let by_key: HashMap<&str, &PeerCounterSample> =
        samples.iter().map(|s| (s.public_key.as_str(), s)).collect();

    rows.iter()
        .map(|row| match by_key.get(row.public_key.as_str()) {
            None => row.clone(),
            Some(sample) => {
                let current_tx = sample.tx_bytes as i64;
                let current_rx = sample.rx_bytes as i64;
                let delta_tx = (current_tx - row.last_tx).max(0);
                let delta_rx = (current_rx - row.last_rx).max(0);
                TrafficRow {
                    id: row.id.clone(),
                    public_key: row.public_key.clone(),
                    total_tx: row.total_tx + delta_tx,
                    total_rx: row.total_rx + delta_rx,
                    last_tx: current_tx,
                    last_rx: current_rx,
                }
            }
        })
        .collect()
}

/// Instantaneous traffic rate, clamped to non-negative (spec §4.6 step 6,
/// testable property 5).
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TrafficRates {
    pub tx_bytes_per_sec: f64,
    pub rx_bytes_per_sec: f64,
}

/// Drives [`reconcile_once`] on a 30s ticker against the live kernel
/// interface. Generic over [`Platform`] so tests can substitute a fake.
pub struct TrafficReconciler<P: Platform> {
    store: PeerStore,
    interface: String,
    rates: Mutex<TrafficRates>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    _platform: PhantomData<P>,
}

impl<P: Platform + Send + Sync + 'static> TrafficReconciler<P> {
    pub fn new(store: PeerStore, interface: String) -> Arc<Self> {
        Arc::new(Self {
            store,
            interface,
            rates: Mutex::new(TrafficRates::default()),
            handle: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            _platform: PhantomData,
        })
    }

    /// Idempotent: a second call while already running is a no-op
    /// (spec §4.6 "Start is idempotent").
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { this.run().await }));
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    pub fn rates(&self) -> TrafficRates {
        *self.rates.lock().unwrap()
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        let mut prev_totals: (i64, i64) = (0, 0);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let elapsed = last_tick.elapsed();
                    last_tick = Instant::now();
                    if let Err(err) = self.tick(&mut prev_totals, elapsed).await {
                        error!(error = %err, "traffic reconciliation tick failed");
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn tick(
        &self,
        prev_totals: &mut (i64, i64),
        elapsed: Duration,
    ) -> Result<(), crate::db::peers::PeerStoreError> {
        let rows = self.store.traffic_snapshot().await?;

        let samples = match P::read_counters(&self.interface).await {
            Ok(samples) => samples,
            Err(err) => {
                warn!(error = %err, "failed to read kernel counters, treating all peers as offline this tick");
                Vec::new()
            }
        };

        let updated = reconcile_once(&rows, &samples);

        let now_tx: i64 = updated.iter().map(|r| r.total_tx).sum();
        let now_rx: i64 = updated.iter().map(|r| r.total_rx).sum();
        let secs = elapsed.as_secs_f64().max(1.0);
        let rates = TrafficRates {
            tx_bytes_per_sec: ((now_tx - prev_totals.0) as f64 / secs).max(0.0),
            rx_bytes_per_sec: ((now_rx - prev_totals.1) as f64 / secs).max(0.0),
        };
        *prev_totals = (now_tx, now_rx);
        *self.rates.lock().unwrap() = rates;

        for row in &updated {
            if let Err(err) = self
                .store
                .record_traffic(&row.id, row.total_tx, row.total_rx, row.last_tx, row.last_rx)
                .await
            {
                error!(peer_id = %row.id, error = %err, "failed to persist traffic counters");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn row(public_key: &str, total_tx: i64, total_rx: i64, last_tx: i64, last_rx: i64) -> TrafficRow {
        TrafficRow {
            id: public_key.to_string(),
            public_key: public_key.to_string(),
            total_tx,
            total_rx,
            last_tx,
            last_rx,
        }
    }

    fn sample(public_key: &str, tx: u64, rx: u64) -> PeerCounterSample {
        PeerCounterSample { public_key: public_key.to_string(), tx_bytes: tx, rx_bytes: rx }
    }

    // Testable property 4 & scenario S4: a restart (current < last) adds zero
    // to the total instead of going negative, and a later increase adds only
    // the delta since the restart.
    #[test_case(1000, 1000, 300, 0, 300 ; "restart yields zero delta")]
    #[test_case(300, 1200, 500, 200, 500 ; "post-restart delta is normal")]
    fn reconcile_handles_counter_resets(
        total_before: i64,
        last_before: i64,
        current: u64,
        expected_delta: i64,
        expected_last: i64,
    ) {
        let rows = vec![row("peer-a", total_before, 0, last_before, 0)];
        let samples = vec![sample("peer-a", current, 0)];
        let updated = reconcile_once(&rows, &samples);

        assert_eq!(updated[0].total_tx, total_before + expected_delta);
        assert_eq!(updated[0].last_tx, expected_last);
    }

    #[test]
    fn offline_peer_totals_untouched() {
        let rows = vec![row("peer-a", 500, 500, 100, 100)];
        let updated = reconcile_once(&rows, &[]);
        assert_eq!(updated[0].total_tx, 500);
        assert_eq!(updated[0].last_tx, 100);
    }

    #[test]
    fn totals_never_decrease_across_arbitrary_resets() {
        let mut row = row("peer-a", 0, 0, 0, 0);
        let history = [1000u64, 300, 500, 10, 2000, 1];
        for &current in &history {
            let updated = reconcile_once(&[row.clone()], &[sample("peer-a", current, 0)]);
            assert!(updated[0].total_tx >= row.total_tx);
            row = updated[0].clone();
        }
    }
}
