/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use arc_swap::ArcSwap;
use ip_network::IpNetwork;
use log::warn;
use serde::Deserialize;

use g3_ip_annotate::{Annotations, ServerAnnotations};

use crate::annotate::{AnnotateError, Annotator, Direction, SockId, find_direction};
use crate::rawfile::{FetchError, Provider};

mod hostname;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SiteType {
    #[default]
    Physical,
    Virtual,
}

#[derive(Debug, Default, Deserialize)]
struct SiteNetwork {
    #[serde(rename = "IPv4", default)]
    ipv4: String,
    #[serde(rename = "IPv6", default)]
    ipv6: String,
}

/// One inventory entry, keyed by canonical hostname in the blob.
#[derive(Debug, Deserialize)]
struct SiteEntry {
    #[serde(rename = "Type", default)]
    site_type: SiteType,
    #[serde(rename = "Network", default)]
    network: SiteNetwork,
    #[serde(rename = "Annotation", default)]
    annotation: ServerAnnotations,
}

/// A configured site network: the verbatim inventory string, the parsed
/// network for family checks, and the declared address itself.
struct SiteNet {
    cidr: String,
    addr: IpAddr,
}

fn parse_site_net(s: &str) -> anyhow::Result<Option<SiteNet>> {
    if s.is_empty() {
        return Ok(None);
    }
    let addr = match s.split_once('/') {
        Some((addr, len)) => {
            let addr = IpAddr::from_str(addr).map_err(|e| anyhow!("bad address in {s:?}: {e}"))?;
            let len = u8::from_str(len).map_err(|e| anyhow!("bad prefix length in {s:?}: {e}"))?;
            // reject out-of-range prefixes up front
            IpNetwork::new_truncate(addr, len).map_err(|e| anyhow!("bad network {s:?}: {e}"))?;
            addr
        }
        None => IpAddr::from_str(s).map_err(|e| anyhow!("bad address {s:?}: {e}"))?,
    };
    Ok(Some(SiteNet {
        cidr: s.to_string(),
        addr,
    }))
}

/// The resolved identity of this node: the server-side annotations to
/// stamp, and the declared site networks per address family.
pub(crate) struct SiteSnapshot {
    server: ServerAnnotations,
    site_type: SiteType,
    v4: Option<SiteNet>,
    v6: Option<SiteNet>,
}

impl SiteSnapshot {
    /// Resolve the inventory entry for this hostname. Absence and
    /// malformed network values are errors; at startup they are fatal.
    pub(crate) fn resolve(inventory: &[u8], canonical_hostname: &str) -> anyhow::Result<Self> {
        let parsed = hostname::parse(canonical_hostname)
            .map_err(|e| anyhow!("invalid hostname: {e}"))?;
        let mut entries: HashMap<String, SiteEntry> = serde_json::from_slice(inventory)
            .map_err(|e| anyhow!("invalid site inventory JSON: {e}"))?;
        let entry = entries
            .remove(canonical_hostname)
            .ok_or_else(|| anyhow!("hostname {canonical_hostname} not found in site inventory"))?;

        let v4 = parse_site_net(&entry.network.ipv4)
            .context("invalid site IPv4 network")?;
        let v6 = parse_site_net(&entry.network.ipv6)
            .context("invalid site IPv6 network")?;

        let mut server = entry.annotation;
        server.site = parsed.site;
        server.machine = parsed.machine;

        Ok(SiteSnapshot {
            server,
            site_type: entry.site_type,
            v4,
            v6,
        })
    }

    /// The addresses a virtual site exposes on the wire. These belong in
    /// the local-IP set: traffic toward a virtual node carries the load
    /// balancer address, not any interface address on the box.
    pub(crate) fn public_addrs(&self) -> Vec<IpAddr> {
        if self.site_type != SiteType::Virtual {
            return Vec::new();
        }
        let mut addrs = Vec::new();
        if let Some(net) = &self.v4 {
            addrs.push(net.addr);
        }
        if let Some(net) = &self.v6 {
            addrs.push(net.addr);
        }
        addrs
    }

    /// Stamp the server annotations when the endpoint's address family
    /// has a configured site network, with the configured CIDR on the
    /// network annotation. A cross-family endpoint stays unannotated.
    fn annotate_server(&self, endpoint_ip: &str, server: &mut ServerAnnotations) {
        let Ok(ip) = IpAddr::from_str(endpoint_ip) else {
            return;
        };
        let net = match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };
        let Some(net) = net else {
            return;
        };
        *server = self.server.clone();
        if let Some(network) = &mut server.network {
            network.cidr = net.cidr.clone();
        }
    }
}

/// Annotates the server side of each flow with the node's resolved site
/// identity. Snapshot swap discipline matches the other annotators.
pub(crate) struct SiteAnnotator {
    local_ips: Arc<Vec<IpAddr>>,
    src: Provider,
    hostname: String,
    snapshot: ArcSwap<SiteSnapshot>,
}

impl SiteAnnotator {
    /// Fetch and resolve the initial snapshot. Run before the local-IP
    /// set is frozen so the caller can fold in `public_addrs`.
    pub(crate) async fn load(src: &Provider, canonical_hostname: &str) -> anyhow::Result<SiteSnapshot> {
        match src.get().await {
            Ok(data) => SiteSnapshot::resolve(&data, canonical_hostname),
            Err(FetchError::NoChange) => {
                Err(anyhow!("site inventory provider returned no initial content"))
            }
            Err(e) => Err(e).context("could not fetch site inventory"),
        }
    }

    pub(crate) fn new(
        src: Provider,
        hostname: String,
        snapshot: SiteSnapshot,
        local_ips: Arc<Vec<IpAddr>>,
    ) -> Self {
        SiteAnnotator {
            local_ips,
            src,
            hostname,
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Refresh the inventory. The local-IP set stays frozen even if the
    /// declared virtual addresses changed; direction classification
    /// keeps the startup view until restart.
    pub(crate) async fn reload(&self) {
        let data = match self.src.get().await {
            Ok(data) => data,
            Err(FetchError::NoChange) => return,
            Err(e) => {
                warn!("could not reload site inventory: {e:?}");
                return;
            }
        };
        match SiteSnapshot::resolve(&data, &self.hostname) {
            Ok(snapshot) => self.snapshot.store(Arc::new(snapshot)),
            Err(e) => warn!("could not resolve site inventory: {e:?}"),
        }
    }
}

impl Annotator for SiteAnnotator {
    fn annotate(&self, id: &SockId, record: &mut Annotations) -> Result<(), AnnotateError> {
        let server_ip = match find_direction(id, &self.local_ips)? {
            Direction::SrcIsServer => &id.src_ip,
            Direction::DstIsServer => &id.dst_ip,
        };
        let snapshot = self.snapshot.load();
        snapshot.annotate_server(server_ip, &mut record.server);
        Ok(())
    }
}
