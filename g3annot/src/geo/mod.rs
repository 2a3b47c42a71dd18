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
use maxminddb::{MaxMindDBError, geoip2};

use g3_ip_annotate::{Annotations, Geolocation};

use crate::annotate::{AnnotateError, Annotator, Direction, SockId, find_direction};
use crate::rawfile::{self, FetchError, Provider};

#[cfg(test)]
pub(crate) mod testdb;

const CITY_DB_NAME: &str = "GeoLite2-City.mmdb";

/// Annotates the client side of each flow with MaxMind City data. The
/// reader snapshot follows the same swap discipline as the ASN indexes.
pub(crate) struct GeoAnnotator {
    local_ips: Arc<Vec<IpAddr>>,
    src: Provider,
    reader: ArcSwap<maxminddb::Reader<Vec<u8>>>,
}

impl GeoAnnotator {
    pub(crate) async fn new(
        src: Provider,
        local_ips: Arc<Vec<IpAddr>>,
    ) -> anyhow::Result<Self> {
        let reader = load_reader(&src)
            .await
            .context("could not load MaxMind City database")?
            .ok_or_else(|| anyhow!("MaxMind provider returned no initial content"))?;
        Ok(GeoAnnotator {
            local_ips,
            src,
            reader: ArcSwap::from_pointee(reader),
        })
    }

    pub(crate) async fn reload(&self) {
        match load_reader(&self.src).await {
            Ok(Some(reader)) => self.reader.store(Arc::new(reader)),
            Ok(None) => {}
            Err(e) => warn!("could not reload MaxMind City database: {e:?}"),
        }
    }

    /// Look up one IP. A database miss or an empty record is data
    /// (missing=true); only a failed read is an error.
    pub(crate) fn annotate_ip(&self, ip: IpAddr) -> Result<Geolocation, AnnotateError> {
        let reader = self.reader.load();
        match reader.lookup::<geoip2::City>(ip) {
            Ok(record) => {
                if is_empty(&record) {
                    Ok(Geolocation {
                        missing: true,
                        ..Default::default()
                    })
                } else {
                    Ok(shape_geolocation(&record))
                }
            }
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(Geolocation {
                missing: true,
                ..Default::default()
            }),
            Err(e) => Err(AnnotateError::NoAnnotation(format!(
                "geo lookup for {ip} failed: {e}"
            ))),
        }
    }
}

impl Annotator for GeoAnnotator {
    fn annotate(&self, id: &SockId, record: &mut Annotations) -> Result<(), AnnotateError> {
        let client_ip = match find_direction(id, &self.local_ips)? {
            Direction::DstIsServer => &id.src_ip,
            Direction::SrcIsServer => &id.dst_ip,
        };
        let ip = IpAddr::from_str(client_ip).map_err(|_| {
            AnnotateError::NoAnnotation(format!("failed to parse IP {client_ip:?}"))
        })?;
        record.client.geo = Some(self.annotate_ip(ip)?);
        Ok(())
    }
}

/// "Not found" in a well-functioning database is an accurate reflection
/// of data that is missing, so an all-empty record maps to missing=true
/// instead of an error.
fn is_empty(record: &geoip2::City) -> bool {
    record.city.as_ref().and_then(|c| c.geoname_id).is_none()
        && record.country.as_ref().and_then(|c| c.geoname_id).is_none()
        && record.continent.as_ref().and_then(|c| c.geoname_id).is_none()
}

fn name_en(names: &Option<std::collections::BTreeMap<&str, &str>>) -> String {
    names
        .as_ref()
        .and_then(|m| m.get("en").copied())
        .unwrap_or_default()
        .to_string()
}

fn shape_geolocation(record: &geoip2::City) -> Geolocation {
    let mut geo = Geolocation::default();
    if let Some(continent) = &record.continent {
        geo.continent_code = continent.code.unwrap_or_default().to_string();
    }
    if let Some(country) = &record.country {
        geo.country_code = country.iso_code.unwrap_or_default().to_string();
        geo.country_name = name_en(&country.names);
    }
    if let Some(subdivisions) = &record.subdivisions {
        if let Some(sub1) = subdivisions.first() {
            geo.subdivision1_iso_code = sub1.iso_code.unwrap_or_default().to_string();
            geo.subdivision1_name = name_en(&sub1.names);
        }
        if let Some(sub2) = subdivisions.get(1) {
            geo.subdivision2_iso_code = sub2.iso_code.unwrap_or_default().to_string();
            geo.subdivision2_name = name_en(&sub2.names);
        }
    }
    if let Some(city) = &record.city {
        geo.city = name_en(&city.names);
    }
    if let Some(postal) = &record.postal {
        geo.postal_code = postal.code.unwrap_or_default().to_string();
    }
    if let Some(location) = &record.location {
        geo.metro_code = i64::from(location.metro_code.unwrap_or_default());
        geo.latitude = location.latitude.unwrap_or_default();
        geo.longitude = location.longitude.unwrap_or_default();
        geo.accuracy_radius_km = i64::from(location.accuracy_radius.unwrap_or_default());
    }
    geo
}

async fn load_reader(src: &Provider) -> anyhow::Result<Option<maxminddb::Reader<Vec<u8>>>> {
    let tgz = match src.get().await {
        Ok(data) => data,
        Err(FetchError::NoChange) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let data = rawfile::read_from_tar_gz(&tgz, CITY_DB_NAME)?;
    let reader = maxminddb::Reader::from_source(data)
        .map_err(|e| anyhow!("invalid {CITY_DB_NAME}: {e}"))?;
    Ok(Some(reader))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_full_record() {
        let js = r#"{
            "city": {"geoname_id": 2643743, "names": {"en": "Boxford"}},
            "continent": {"code": "EU", "geoname_id": 6255148, "names": {"en": "Europe"}},
            "country": {"geoname_id": 2635167, "iso_code": "GB", "names": {"en": "United Kingdom"}},
            "location": {"accuracy_radius": 100, "latitude": 51.75, "longitude": -1.25, "metro_code": 821},
            "postal": {"code": "OX1"},
            "subdivisions": [
                {"geoname_id": 6269131, "iso_code": "ENG", "names": {"en": "England"}},
                {"geoname_id": 3333217, "iso_code": "WBK", "names": {"en": "West Berkshire"}}
            ]
        }"#;
        let record: geoip2::City = serde_json::from_str(js).unwrap();
        assert!(!is_empty(&record));

        let geo = shape_geolocation(&record);
        assert_eq!(geo.continent_code, "EU");
        assert_eq!(geo.country_code, "GB");
        assert_eq!(geo.country_name, "United Kingdom");
        assert_eq!(geo.subdivision1_iso_code, "ENG");
        assert_eq!(geo.subdivision1_name, "England");
        assert_eq!(geo.subdivision2_iso_code, "WBK");
        assert_eq!(geo.subdivision2_name, "West Berkshire");
        assert_eq!(geo.city, "Boxford");
        assert_eq!(geo.postal_code, "OX1");
        assert_eq!(geo.metro_code, 821);
        assert_eq!(geo.latitude, 51.75);
        assert_eq!(geo.longitude, -1.25);
        assert_eq!(geo.accuracy_radius_km, 100);
        assert!(!geo.missing);
    }

    #[test]
    fn shapes_partial_record() {
        let js = r#"{"country": {"geoname_id": 2635167, "iso_code": "GB"}}"#;
        let record: geoip2::City = serde_json::from_str(js).unwrap();
        assert!(!is_empty(&record));

        let geo = shape_geolocation(&record);
        assert_eq!(geo.country_code, "GB");
        assert_eq!(geo.country_name, "");
        assert_eq!(geo.city, "");
        assert_eq!(geo.latitude, 0.0);
    }

    #[test]
    fn empty_record_detection() {
        let record: geoip2::City = serde_json::from_str("{}").unwrap();
        assert!(is_empty(&record));

        // a record with any geoname id is not empty
        let record: geoip2::City =
            serde_json::from_str(r#"{"continent": {"geoname_id": 6255148}}"#).unwrap();
        assert!(!is_empty(&record));
    }

    #[tokio::test]
    async fn corrupt_archive_is_an_error() {
        let src = crate::rawfile::SeqProvider::new([Ok(b"junk".to_vec())]);
        assert!(load_reader(&src).await.is_err());
    }

    #[tokio::test]
    async fn no_change_keeps_nothing_to_load() {
        let src = crate::rawfile::SeqProvider::new([Err(FetchError::NoChange)]);
        assert!(load_reader(&src).await.unwrap().is_none());
    }

    use crate::annotate::SockId;
    use crate::rawfile::SeqProvider;

    async fn boxford_annotator() -> GeoAnnotator {
        GeoAnnotator::new(
            SeqProvider::new([Ok(testdb::boxford_tgz())]),
            Arc::new(vec!["64.86.148.137".parse().unwrap()]),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn lookup_shapes_the_database_record() {
        let geo = boxford_annotator().await;
        let g = geo.annotate_ip("2.125.160.216".parse().unwrap()).unwrap();
        assert!(!g.missing);
        assert_eq!(g.continent_code, "EU");
        assert_eq!(g.country_code, "GB");
        assert_eq!(g.country_name, "United Kingdom");
        assert_eq!(g.city, "Boxford");
        assert_eq!(g.subdivision1_iso_code, "ENG");
        assert_eq!(g.subdivision2_name, "West Berkshire");
        assert_eq!(g.postal_code, "OX1");
        assert_eq!(g.latitude, 51.75);
        assert_eq!(g.longitude, -1.25);
        assert_eq!(g.accuracy_radius_km, 100);
    }

    #[tokio::test]
    async fn lookup_miss_is_missing_not_error() {
        let geo = boxford_annotator().await;
        let g = geo.annotate_ip("127.0.0.1".parse().unwrap()).unwrap();
        assert!(g.missing);
        assert_eq!(g.country_code, "");
    }

    #[tokio::test]
    async fn annotates_client_side_geo() {
        let geo = boxford_annotator().await;
        let id = SockId {
            sport: 1,
            dport: 2,
            src_ip: "2.125.160.216".to_string(),
            dst_ip: "64.86.148.137".to_string(),
            cookie: 0,
        };
        let mut record = g3_ip_annotate::Annotations::default();
        geo.annotate(&id, &mut record).unwrap();
        assert_eq!(record.client.geo.unwrap().city, "Boxford");
        assert!(record.server.geo.is_none());
    }

    #[tokio::test]
    async fn no_change_reload_keeps_snapshot_pointer() {
        let geo = boxford_annotator().await;
        let before = geo.reader.load_full();
        geo.reload().await;
        assert!(Arc::ptr_eq(&before, &geo.reader.load_full()));
    }

    #[tokio::test]
    async fn failed_reload_keeps_prior_snapshot() {
        let geo = GeoAnnotator::new(
            SeqProvider::new([Ok(testdb::boxford_tgz()), Ok(b"garbage".to_vec())]),
            Arc::new(Vec::new()),
        )
        .await
        .unwrap();

        geo.reload().await;
        let g = geo.annotate_ip("2.125.160.216".parse().unwrap()).unwrap();
        assert_eq!(g.city, "Boxford");
    }

    #[tokio::test]
    async fn successful_reload_swaps_snapshot() {
        let other = testdb::tar_gz_city_db(testdb::city_db(
            [8, 8, 8],
            &testdb::Value::Map(vec![(
                "country",
                testdb::Value::Map(vec![
                    ("geoname_id", testdb::Value::Uint32(6252001)),
                    ("iso_code", testdb::Value::String("US")),
                ]),
            )]),
        ));
        let geo = GeoAnnotator::new(
            SeqProvider::new([Ok(testdb::boxford_tgz()), Ok(other)]),
            Arc::new(Vec::new()),
        )
        .await
        .unwrap();

        geo.reload().await;
        assert!(geo
            .annotate_ip("2.125.160.216".parse().unwrap())
            .unwrap()
            .missing);
        let g = geo.annotate_ip("8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(g.country_code, "US");
    }
}
