//! C6 Traffic Reconciler (spec §4.6).

mod reconciler;

pub use reconciler::{reconcile_once, TrafficRates, TrafficReconciler};
