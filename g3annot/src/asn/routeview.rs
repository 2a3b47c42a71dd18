/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use ip_network::IpNetwork;
use log::{debug, warn};

use g3_ip_annotate::System;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn matches(self, addr: IpAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// One parsed RouteViews row: the announced network and its origin
/// systems string, still unsplit. The systems string is interned so the
/// index does not hold one allocation per row.
pub(crate) struct NetEntry {
    network: IpNetwork,
    key: Box<[u8]>,
    systems: Arc<str>,
}

impl NetEntry {
    pub(crate) fn cidr(&self) -> String {
        self.network.to_string()
    }

    pub(crate) fn systems(&self) -> &str {
        &self.systems
    }
}

/// Per-row parse outcomes, tallied for the parser counters.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ParseTally {
    pub(crate) parsed: u64,
    pub(crate) missing_fields: u64,
    pub(crate) corrupt_netblock: u64,
    pub(crate) corrupt_prefix: u64,
}

/// Longest-prefix-match index over one address family: entries grouped
/// by prefix length, each group sorted by network bytes, groups ordered
/// from longest prefix to shortest.
pub(crate) struct Index {
    family: IpFamily,
    groups: Vec<(u8, Vec<NetEntry>)>,
}

impl Index {
    /// Parse the tab-separated `prefix\tlength\tsystems` blob. Malformed
    /// rows are skipped and tallied by category; they never fail the
    /// whole load.
    pub(crate) fn parse(blob: &[u8], family: IpFamily) -> (Self, ParseTally) {
        let mut tally = ParseTally::default();
        let mut interned: HashMap<String, Arc<str>> = HashMap::new();
        let mut by_len: BTreeMap<u8, Vec<NetEntry>> = BTreeMap::new();

        for line in blob.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let Ok(line) = std::str::from_utf8(line) else {
                tally.missing_fields += 1;
                continue;
            };
            let mut fields = line.split('\t');
            let (Some(prefix), Some(len), Some(systems)) =
                (fields.next(), fields.next(), fields.next())
            else {
                tally.missing_fields += 1;
                continue;
            };

            let Ok(len) = u8::from_str(len) else {
                debug!("failed to convert netblock size: {len}");
                tally.corrupt_netblock += 1;
                continue;
            };
            let network = IpAddr::from_str(prefix)
                .ok()
                .filter(|addr| family.matches(*addr))
                .and_then(|addr| IpNetwork::new(addr, len).ok());
            let Some(network) = network else {
                debug!("failed to parse CIDR prefix: {prefix} with netblock: {len}");
                tally.corrupt_prefix += 1;
                continue;
            };

            let systems = match interned.get(systems) {
                Some(shared) => shared.clone(),
                None => {
                    let shared: Arc<str> = Arc::from(systems);
                    interned.insert(systems.to_string(), shared.clone());
                    shared
                }
            };

            tally.parsed += 1;
            by_len.entry(len).or_default().push(NetEntry {
                key: network_key(&network),
                network,
                systems,
            });
        }

        let mut groups: Vec<(u8, Vec<NetEntry>)> = Vec::with_capacity(by_len.len());
        for (len, mut entries) in by_len.into_iter().rev() {
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            groups.push((len, entries));
        }

        (Index { family, groups }, tally)
    }

    /// Find the most specific network containing `ip`. IPv4-mapped IPv6
    /// addresses are canonicalized to 4 bytes first; a family mismatch
    /// with the index always misses.
    pub(crate) fn search(&self, ip: IpAddr) -> Option<&NetEntry> {
        let ip = canonicalize(ip);
        if !self.family.matches(ip) {
            return None;
        }
        let probe = ip_key(&ip);

        for (_len, group) in &self.groups {
            let idx = group.partition_point(|e| e.key.as_ref() <= probe.as_slice());
            if idx == 0 {
                continue;
            }
            let candidate = &group[idx - 1];
            if !candidate.network.contains(ip) {
                continue;
            }
            // duplicate rows share the network bytes; return the first
            let first = group.partition_point(|e| e.key < candidate.key);
            return Some(&group[first]);
        }
        None
    }
}

fn canonicalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
    }
}

fn network_key(network: &IpNetwork) -> Box<[u8]> {
    match network {
        IpNetwork::V4(n) => n.network_address().octets().to_vec().into_boxed_slice(),
        IpNetwork::V6(n) => n.network_address().octets().to_vec().into_boxed_slice(),
    }
}

fn ip_key(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Split a RouteViews systems string into its origin systems. `_`
/// separates independent origins of a Multi-Origin AS; `,` separates
/// the ASNs of one AS-set. Unparseable ASN tokens are skipped.
pub(crate) fn parse_systems(s: &str) -> Vec<System> {
    s.split('_')
        .map(|group| System {
            asns: group
                .split(',')
                .filter_map(|token| match u32::from_str(token) {
                    Ok(asn) => Some(asn),
                    Err(e) => {
                        warn!("invalid ASN token {token:?} in systems string {s:?}: {e}");
                        None
                    }
                })
                .collect(),
        })
        .collect()
}
