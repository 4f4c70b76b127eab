//! C3 Firewall Table Builder (spec §4.3).

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use ipnetwork::Ipv4Network;
use wirewarden_kernel::nft::{build_chain, build_set};
use wirewarden_types::{Direction, EntryKind, FirewallAction, FirewallEntry, Protocol};

use crate::db::firewall::FirewallStore;
use crate::geo::GeoProvider;
use crate::firewall::{FirewallError, TableBuilder};

/// Parse every `kind=range` entry's CIDR to `[start, end]` in u32 space, sort
/// by `(start asc, size desc)`, and sweep: any range whose end falls at or
/// before the running maximum is fully contained in one already kept and is
/// dead weight. Returns the ids to delete (spec §4.3, testable property 2:
/// a second pass over the surviving set deletes nothing).
///
/// Scoped to the non-expired, enabled set (spec §4.3): a disabled or expired
/// range is never installed in the kernel set, so it must neither be deleted
/// nor allowed to absorb an active range sharing its start.
pub fn prune_contained_ranges(entries: &[FirewallEntry]) -> Vec<i64> {
    let now = Utc::now();
    let mut ranges: Vec<(i64, u32, u32)> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Range && e.is_active(now))
        .filter_map(|e| {
            e.value
                .parse::<Ipv4Network>()
                .ok()
                .map(|net| (e.id, u32::from(net.network()), u32::from(net.broadcast())))
        })
        .collect();

    // start asc, size desc (larger ranges first when starts tie, so the
    // larger survivor absorbs any smaller range sharing its start).
    ranges.sort_by(|a, b| a.1.cmp(&b.1).then((b.2 - b.1).cmp(&(a.2 - a.1))));

    let mut to_delete = Vec::new();
    let mut current_end: Option<u32> = None;
    for (id, start, end) in ranges {
        if let Some(running) = current_end {
            if end <= running {
                to_delete.push(id);
                continue;
            }
        }
        current_end = Some(current_end.map_or(end, |running| running.max(end)));
        let _ = start;
    }
    to_delete
}

#[derive(Default)]
struct Bags {
    blocked_ips_in: Vec<String>,
    blocked_ips_out: Vec<String>,
    blocked_ranges_in: Vec<String>,
    blocked_ranges_out: Vec<String>,
    allowed_tcp_ports: Vec<String>,
    allowed_udp_ports: Vec<String>,
}

fn categorize(entries: &[FirewallEntry]) -> Bags {
    let now = Utc::now();
    let mut bags = Bags::default();

    for e in entries.iter().filter(|e| e.is_active(now)) {
        match (e.kind, e.action) {
            (EntryKind::Ip, FirewallAction::Block) => {
                if matches!(e.direction, Direction::Inbound | Direction::Both) {
                    bags.blocked_ips_in.push(e.value.clone());
                }
                if matches!(e.direction, Direction::Outbound | Direction::Both) {
                    bags.blocked_ips_out.push(e.value.clone());
                }
            }
            (EntryKind::Range, FirewallAction::Block) => {
                if matches!(e.direction, Direction::Inbound | Direction::Both) {
                    bags.blocked_ranges_in.push(e.value.clone());
                }
                if matches!(e.direction, Direction::Outbound | Direction::Both) {
                    bags.blocked_ranges_out.push(e.value.clone());
                }
            }
            (EntryKind::Port, FirewallAction::Allow) => match e.protocol {
                Protocol::Tcp => bags.allowed_tcp_ports.push(e.value.clone()),
                Protocol::Udp => bags.allowed_udp_ports.push(e.value.clone()),
                Protocol::Both => {
                    bags.allowed_tcp_ports.push(e.value.clone());
                    bags.allowed_udp_ports.push(e.value.clone());
                }
            },
            _ => {}
        }
    }

    bags
}

/// Translates firewall entries + country CIDRs into the three base chains
/// (input, forward, output) of one nftables table.
pub struct FirewallTableBuilder {
    store: FirewallStore,
    geo: Arc<dyn GeoProvider>,
    vpn_interfaces: Vec<String>,
    table_name: &'static str,
}

impl FirewallTableBuilder {
    pub fn new(store: FirewallStore, geo: Arc<dyn GeoProvider>, vpn_interfaces: Vec<String>) -> Self {
        Self { store, geo, vpn_interfaces, table_name: "wirewarden_firewall" }
    }
}

impl TableBuilder for FirewallTableBuilder {
    fn family(&self) -> &'static str {
        "inet"
    }

    fn name(&self) -> &'static str {
        self.table_name
    }

    fn priority(&self) -> i32 {
        0
    }

    fn set_names(&self) -> Vec<String> {
        vec![
            "blocked_ips_in".into(),
            "blocked_ips_out".into(),
            "blocked_ranges_in".into(),
            "blocked_ranges_out".into(),
            "allowed_tcp_ports".into(),
            "allowed_udp_ports".into(),
        ]
    }

    fn build(&self) -> BoxFuture<'_, Result<String, FirewallError>> {
        Box::pin(async move {
            let entries = self.store.list().await?;

            let stale = prune_contained_ranges(&entries);
            if !stale.is_empty() {
                self.store.delete_many(&stale).await?;
            }
            let entries: Vec<FirewallEntry> =
                entries.into_iter().filter(|e| !stale.contains(&e.id)).collect();

            let mut bags = categorize(&entries);
            bags.blocked_ranges_in.extend(self.geo.get_all_blocked_cidrs(false).await);
            bags.blocked_ranges_out.extend(self.geo.get_all_blocked_cidrs(true).await);

            let ref_vec = |v: &[String]| v.iter().map(String::as_str).collect::<Vec<_>>();

            let mut script = String::new();
            script.push_str(&build_set("blocked_ips_in", "ipv4_addr", &[], &ref_vec(&bags.blocked_ips_in)));
            script.push_str(&build_set("blocked_ips_out", "ipv4_addr", &[], &ref_vec(&bags.blocked_ips_out)));
            script.push_str(&build_set(
                "blocked_ranges_in",
                "ipv4_addr",
                &["interval"],
                &ref_vec(&bags.blocked_ranges_in),
            ));
            script.push_str(&build_set(
                "blocked_ranges_out",
                "ipv4_addr",
                &["interval"],
                &ref_vec(&bags.blocked_ranges_out),
            ));
            script.push_str(&build_set(
                "allowed_tcp_ports",
                "inet_service",
                &[],
                &ref_vec(&bags.allowed_tcp_ports),
            ));
            script.push_str(&build_set(
                "allowed_udp_ports",
                "inet_service",
                &[],
                &ref_vec(&bags.allowed_udp_ports),
            ));

            let input_rules = vec![
                "ct state established,related accept".to_string(),
                "iifname \"lo\" accept".to_string(),
                "icmp type echo-request accept".to_string(),
                "icmpv6 type { echo-request, nd-neighbor-solicit, nd-neighbor-advert } accept".to_string(),
                "ip saddr @blocked_ips_in drop".to_string(),
                "ip saddr @blocked_ranges_in drop".to_string(),
                "tcp dport @allowed_tcp_ports accept".to_string(),
                "udp dport @allowed_udp_ports accept".to_string(),
                "limit rate 5/minute log prefix \"wirewarden-input-drop: \" drop".to_string(),
            ];
            script.push_str(&build_chain(
                "input",
                "filter",
                "input",
                0,
                "drop",
                &input_rules.iter().map(String::as_str).collect::<Vec<_>>(),
            ));

            let mut forward_rules = vec![
                "ct state established,related accept".to_string(),
                "ip saddr @blocked_ips_out drop".to_string(),
                "ip saddr @blocked_ranges_out drop".to_string(),
                "ip daddr @blocked_ips_in drop".to_string(),
                "ip daddr @blocked_ranges_in drop".to_string(),
            ];
            for iface in &self.vpn_interfaces {
                forward_rules.push(format!(
                    "iifname \"{iface}\" ct state new log prefix \"wirewarden-fwd: \" accept"
                ));
                forward_rules.push(format!(
                    "oifname \"{iface}\" ct state new log prefix \"wirewarden-fwd: \" accept"
                ));
            }
            script.push_str(&build_chain(
                "forward",
                "filter",
                "forward",
                -1,
                "accept",
                &forward_rules.iter().map(String::as_str).collect::<Vec<_>>(),
            ));

            let output_rules = vec![
                "ct state established,related accept".to_string(),
                "ip daddr @blocked_ips_out drop".to_string(),
                "ip daddr @blocked_ranges_out drop".to_string(),
            ];
            script.push_str(&build_chain(
                "output",
                "filter",
                "output",
                0,
                "accept",
                &output_rules.iter().map(String::as_str).collect::<Vec<_>>(),
            ));

            Ok(format!("table inet {} {{\n{}\n}}\n", self.table_name, script))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wirewarden_types::EntrySource;

    fn range_entry(id: i64, cidr: &str) -> FirewallEntry {
        FirewallEntry {
            id,
            kind: EntryKind::Range,
            value: cidr.to_string(),
            action: FirewallAction::Block,
            direction: Direction::Both,
            protocol: Protocol::Both,
            source: EntrySource::Manual,
            reason: None,
            display_name: None,
            essential: false,
            expires_at: None,
            enabled: true,
            hit_count: 0,
            created_at: Utc::now(),
        }
    }

    // Testable property 2 / scenario S2: a /25 fully inside a /24 is pruned;
    // the /24 and an unrelated /30 survive, and re-running on the survivors
    // prunes nothing further.
    #[test]
    fn prunes_contained_ranges_and_is_idempotent() {
        let entries = vec![
            range_entry(1, "10.0.0.0/24"),
            range_entry(2, "10.0.0.128/25"),
            range_entry(3, "10.0.1.0/30"),
        ];
        let pruned = prune_contained_ranges(&entries);
        assert_eq!(pruned, vec![2]);

        let survivors: Vec<FirewallEntry> =
            entries.into_iter().filter(|e| !pruned.contains(&e.id)).collect();
        assert!(prune_contained_ranges(&survivors).is_empty());
    }

    #[test]
    fn disjoint_ranges_all_survive() {
        let entries = vec![range_entry(1, "10.0.0.0/30"), range_entry(2, "10.0.1.0/30")];
        assert!(prune_contained_ranges(&entries).is_empty());
    }
}
