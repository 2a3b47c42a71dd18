/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use arc_swap::ArcSwap;
use log::warn;

use g3_ip_annotate::{Annotations, Network};

use crate::annotate::{AnnotateError, Annotator, Direction, SockId, find_direction};
use crate::rawfile::{self, FetchError, Provider};
use crate::stat::RouteviewStats;

mod routeview;
pub(crate) use routeview::ParseTally;
use routeview::{Index, IpFamily, NetEntry};

mod asnames;
use asnames::AsNames;

/// Annotates the client side of each flow with RouteViews origin-AS
/// metadata. Each dataset snapshot sits behind an atomic pointer; the
/// reload path builds replacements off to the side and swaps them in.
pub(crate) struct AsnAnnotator {
    local_ips: Arc<Vec<IpAddr>>,
    as4_src: Provider,
    as6_src: Provider,
    names_src: Provider,
    asn4: ArcSwap<Index>,
    asn6: ArcSwap<Index>,
    names: ArcSwap<AsNames>,
    stats: Arc<RouteviewStats>,
}

impl AsnAnnotator {
    pub(crate) async fn new(
        as4_src: Provider,
        as6_src: Provider,
        names_src: Provider,
        local_ips: Arc<Vec<IpAddr>>,
        stats: Arc<RouteviewStats>,
    ) -> anyhow::Result<Self> {
        let asn4 = load_index(&as4_src, IpFamily::V4, &stats)
            .await
            .context("could not load RouteViews IPv4 table")?
            .ok_or_else(|| anyhow!("RouteViews IPv4 provider returned no initial content"))?;
        let asn6 = load_index(&as6_src, IpFamily::V6, &stats)
            .await
            .context("could not load RouteViews IPv6 table")?
            .ok_or_else(|| anyhow!("RouteViews IPv6 provider returned no initial content"))?;
        let names = load_names(&names_src)
            .await
            .context("could not load AS name table")?
            .ok_or_else(|| anyhow!("AS name provider returned no initial content"))?;

        Ok(AsnAnnotator {
            local_ips,
            as4_src,
            as6_src,
            names_src,
            asn4: ArcSwap::from_pointee(asn4),
            asn6: ArcSwap::from_pointee(asn6),
            names: ArcSwap::from_pointee(names),
            stats,
        })
    }

    /// Refresh all three datasets from their providers. Any failure
    /// leaves every current snapshot in place; the no-change sentinel
    /// keeps the affected snapshot pointer as is.
    pub(crate) async fn reload(&self) {
        let new4 = match load_index(&self.as4_src, IpFamily::V4, &self.stats).await {
            Ok(v) => v,
            Err(e) => {
                warn!("could not reload RouteViews IPv4 table: {e:?}");
                return;
            }
        };
        let new6 = match load_index(&self.as6_src, IpFamily::V6, &self.stats).await {
            Ok(v) => v,
            Err(e) => {
                warn!("could not reload RouteViews IPv6 table: {e:?}");
                return;
            }
        };
        let new_names = match load_names(&self.names_src).await {
            Ok(v) => v,
            Err(e) => {
                warn!("could not reload AS name table: {e:?}");
                return;
            }
        };

        if let Some(index) = new4 {
            self.asn4.store(Arc::new(index));
        }
        if let Some(index) = new6 {
            self.asn6.store(Arc::new(index));
        }
        if let Some(names) = new_names {
            self.names.store(Arc::new(names));
        }
    }

    /// Shape the RouteViews entry for one IP into a `Network`. A miss in
    /// both families yields missing=true.
    pub(crate) fn annotate_ip(&self, ip: IpAddr) -> Network {
        let names = self.names.load();

        let asn4 = self.asn4.load();
        if let Some(entry) = asn4.search(ip) {
            return shape_network(entry, &names);
        }
        let asn6 = self.asn6.load();
        if let Some(entry) = asn6.search(ip) {
            return shape_network(entry, &names);
        }
        Network {
            missing: true,
            ..Default::default()
        }
    }
}

impl Annotator for AsnAnnotator {
    fn annotate(&self, id: &SockId, record: &mut Annotations) -> Result<(), AnnotateError> {
        let client_ip = match find_direction(id, &self.local_ips)? {
            Direction::DstIsServer => &id.src_ip,
            Direction::SrcIsServer => &id.dst_ip,
        };
        let network = match IpAddr::from_str(client_ip) {
            Ok(ip) => self.annotate_ip(ip),
            Err(_) => Network {
                missing: true,
                ..Default::default()
            },
        };
        record.client.network = Some(network);
        Ok(())
    }
}

fn shape_network(entry: &NetEntry, names: &AsNames) -> Network {
    let systems = routeview::parse_systems(entry.systems());
    let mut network = Network {
        cidr: entry.cidr(),
        systems,
        ..Default::default()
    };
    network.as_number = network.first_asn();
    network.as_name = names.get(network.as_number);
    network
}

async fn load_index(
    src: &Provider,
    family: IpFamily,
    stats: &RouteviewStats,
) -> anyhow::Result<Option<Index>> {
    let gz = match src.get().await {
        Ok(gz) => gz,
        Err(FetchError::NoChange) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let data = rawfile::from_gz(&gz)?;
    let (index, tally) = Index::parse(&data, family);
    stats.add_tally(&tally);
    Ok(Some(index))
}

async fn load_names(src: &Provider) -> anyhow::Result<Option<AsNames>> {
    let data = match src.get().await {
        Ok(data) => data,
        Err(FetchError::NoChange) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(AsNames::parse(&data)?))
}
