/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::net::IpAddr;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use g3_ip_annotate::Annotations;

/// The 4-tuple identifying one flow, as delivered by the event source.
/// Addresses are textual and normalized by parsing before comparison.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub(crate) struct SockId {
    #[serde(rename = "SPort", default)]
    pub(crate) sport: u16,
    #[serde(rename = "DPort", default)]
    pub(crate) dport: u16,
    #[serde(rename = "SrcIP", default)]
    pub(crate) src_ip: String,
    #[serde(rename = "DstIP", default)]
    pub(crate) dst_ip: String,
    #[serde(rename = "Cookie", default)]
    pub(crate) cookie: u64,
}

#[derive(Debug, Error)]
pub(crate) enum AnnotateError {
    #[error("unknown direction for flow {0}:{1} -> {2}:{3}")]
    UnknownDirection(String, u16, String, u16),
    #[error("could not annotate IP address: {0}")]
    NoAnnotation(String),
}

/// Which end of the connection is the local server. Events arrive
/// without regard to which end is which.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    SrcIsServer,
    DstIsServer,
}

/// Decide which endpoint is the server by membership in the local-IP
/// set. The source is checked against the whole set first, so loopback
/// flows where both ends are local resolve to `SrcIsServer`.
///
/// Every annotator routes through this one function so that an ambiguous
/// flow is never split differently by different annotators.
pub(crate) fn find_direction(
    id: &SockId,
    local_ips: &[IpAddr],
) -> Result<Direction, AnnotateError> {
    let src = IpAddr::from_str(&id.src_ip).ok();
    let dst = IpAddr::from_str(&id.dst_ip).ok();

    if src.is_some() && local_ips.iter().any(|local| src == Some(*local)) {
        return Ok(Direction::SrcIsServer);
    }
    if dst.is_some() && local_ips.iter().any(|local| dst == Some(*local)) {
        return Ok(Direction::DstIsServer);
    }
    Err(AnnotateError::UnknownDirection(
        id.src_ip.clone(),
        id.sport,
        id.dst_ip.clone(),
        id.dport,
    ))
}

/// Implemented by every subsystem that adds metadata to a flow record.
pub(crate) trait Annotator: Send + Sync {
    fn annotate(&self, id: &SockId, record: &mut Annotations) -> Result<(), AnnotateError>;
}

/// The IP addresses configured on the host interfaces. Established once
/// at process start; the site resolver may extend the returned set
/// before it is frozen.
pub(crate) fn local_interface_ips() -> anyhow::Result<Vec<IpAddr>> {
    let mut ips = Vec::new();
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            ips.push(IpAddr::V4(sin.ip()));
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            ips.push(IpAddr::V6(sin6.ip()));
        }
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(src: &str, dst: &str) -> SockId {
        SockId {
            sport: 1,
            dport: 2,
            src_ip: src.to_string(),
            dst_ip: dst.to_string(),
            cookie: 0,
        }
    }

    #[test]
    fn src_is_server() {
        let local = vec!["1.0.0.1".parse().unwrap()];
        let dir = find_direction(&flow("1.0.0.1", "9.0.0.9"), &local).unwrap();
        assert_eq!(dir, Direction::SrcIsServer);
    }

    #[test]
    fn dst_is_server() {
        let local = vec!["1.0.0.1".parse().unwrap()];
        let dir = find_direction(&flow("9.0.0.9", "1.0.0.1"), &local).unwrap();
        assert_eq!(dir, Direction::DstIsServer);
    }

    #[test]
    fn unknown_direction() {
        let local = vec!["1.0.0.1".parse().unwrap()];
        assert!(find_direction(&flow("9.0.0.9", "8.0.0.8"), &local).is_err());
        assert!(find_direction(&flow("not-an-ip", "also-bad"), &local).is_err());
    }

    #[test]
    fn both_local_pins_src() {
        // loopback traffic matches both ends; src wins by convention,
        // independent of local-IP ordering
        let local: Vec<IpAddr> = vec![
            "127.0.0.2".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
        ];
        let dir = find_direction(&flow("127.0.0.1", "127.0.0.2"), &local).unwrap();
        assert_eq!(dir, Direction::SrcIsServer);
    }

    #[test]
    fn textual_addresses_are_normalized() {
        // the same v6 address spelled differently still matches
        let local = vec!["2001:5a0:4300::2".parse().unwrap()];
        let dir = find_direction(&flow("2001:05a0:4300:0::2", "2600::1"), &local).unwrap();
        assert_eq!(dir, Direction::SrcIsServer);
    }

    #[test]
    fn event_wire_decoding() {
        let id: SockId = serde_json::from_str(
            r#"{"SPort":5000,"DPort":443,"SrcIP":"1.0.0.1","DstIP":"9.0.0.9","Cookie":12}"#,
        )
        .unwrap();
        assert_eq!(id.src_ip, "1.0.0.1");
        assert_eq!(id.dst_ip, "9.0.0.9");
        assert_eq!(id.sport, 5000);
        assert_eq!(id.dport, 443);
        assert_eq!(id.cookie, 12);
    }
}
