/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// One autonomous system. A prefix originated by an AS-set carries more
/// than one ASN in a single system.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    #[serde(rename = "ASNs", default, skip_serializing_if = "Vec::is_empty")]
    pub asns: Vec<u32>,
}

/// Routing metadata for one IP address, shaped from the RouteViews
/// prefix table and the AS-name map.
///
/// `missing` set means the lookup ran and found nothing; all other
/// fields are then zero-valued.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(rename = "CIDR", default, skip_serializing_if = "String::is_empty")]
    pub cidr: String,
    #[serde(rename = "ASNumber", default, skip_serializing_if = "is_zero_u32")]
    pub as_number: u32,
    #[serde(rename = "ASName", default, skip_serializing_if = "String::is_empty")]
    pub as_name: String,
    #[serde(rename = "Missing", default, skip_serializing_if = "is_false")]
    pub missing: bool,
    #[serde(rename = "Systems", default, skip_serializing_if = "Vec::is_empty")]
    pub systems: Vec<System>,
}

impl Network {
    /// The first ASN of the first system, which serves as the canonical
    /// origin AS for the prefix.
    pub fn first_asn(&self) -> u32 {
        self.systems
            .first()
            .and_then(|s| s.asns.first())
            .copied()
            .unwrap_or_default()
    }
}

/// Geolocation metadata for one IP address, shaped from the MaxMind City
/// database. `missing` distinguishes "looked up, not found" from a
/// record that was never looked up.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    #[serde(rename = "ContinentCode", default, skip_serializing_if = "String::is_empty")]
    pub continent_code: String,
    #[serde(rename = "CountryCode", default, skip_serializing_if = "String::is_empty")]
    pub country_code: String,
    #[serde(rename = "CountryName", default, skip_serializing_if = "String::is_empty")]
    pub country_name: String,
    #[serde(rename = "Subdivision1ISOCode", default, skip_serializing_if = "String::is_empty")]
    pub subdivision1_iso_code: String,
    #[serde(rename = "Subdivision1Name", default, skip_serializing_if = "String::is_empty")]
    pub subdivision1_name: String,
    #[serde(rename = "Subdivision2ISOCode", default, skip_serializing_if = "String::is_empty")]
    pub subdivision2_iso_code: String,
    #[serde(rename = "Subdivision2Name", default, skip_serializing_if = "String::is_empty")]
    pub subdivision2_name: String,
    #[serde(rename = "MetroCode", default, skip_serializing_if = "is_zero_i64")]
    pub metro_code: i64,
    #[serde(rename = "City", default, skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(rename = "PostalCode", default, skip_serializing_if = "String::is_empty")]
    pub postal_code: String,
    #[serde(rename = "Latitude", default)]
    pub latitude: f64,
    #[serde(rename = "Longitude", default)]
    pub longitude: f64,
    #[serde(rename = "AccuracyRadiusKm", default, skip_serializing_if = "is_zero_i64")]
    pub accuracy_radius_km: i64,
    #[serde(rename = "Missing", default, skip_serializing_if = "is_false")]
    pub missing: bool,
}

/// Annotations attached to the server side of a flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerAnnotations {
    #[serde(rename = "Site", default, skip_serializing_if = "String::is_empty")]
    pub site: String,
    #[serde(rename = "Geo", default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geolocation>,
    #[serde(rename = "Network", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
    #[serde(rename = "Machine", default, skip_serializing_if = "String::is_empty")]
    pub machine: String,
}

/// Annotations attached to the client side of a flow, and the value type
/// of the RPC response map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientAnnotations {
    #[serde(rename = "Geo", default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geolocation>,
    #[serde(rename = "Network", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
}

/// The per-UUID record written for every flow-creation event. The
/// timestamp is the event timestamp, never the wall clock at write time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Server", default)]
    pub server: ServerAnnotations,
    #[serde(rename = "Client", default)]
    pub client: ClientAnnotations,
}

impl Annotations {
    pub fn new(uuid: String, timestamp: DateTime<Utc>) -> Self {
        Annotations {
            uuid,
            timestamp,
            server: ServerAnnotations::default(),
            client: ClientAnnotations::default(),
        }
    }
}
