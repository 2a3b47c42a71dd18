/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! Minimal MaxMind-DB writer for tests: one IPv4 /24 prefix mapped to
//! one data record, with the search tree, data section, and metadata
//! laid out as the MaxMind-DB format requires. Enough for the real
//! reader to resolve real lookups without a canned binary fixture.

const METADATA_MARKER: &[u8] = b"\xab\xcd\xefMaxMind.com";

const NODE_COUNT: u32 = 24;
const RECORD_SIZE_BITS: u16 = 24;

pub(crate) enum Value<'a> {
    String(&'a str),
    Double(f64),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Map(Vec<(&'a str, Value<'a>)>),
    Array(Vec<Value<'a>>),
}

fn write_control(out: &mut Vec<u8>, type_num: u8, size: usize) {
    assert!(size < 29, "large sizes are not needed here");
    if type_num < 8 {
        out.push((type_num << 5) | size as u8);
    } else {
        // extended type: zero type bits, the type follows the control byte
        out.push(size as u8);
        out.push(type_num - 7);
    }
}

fn write_uint(out: &mut Vec<u8>, type_num: u8, v: u64) {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    write_control(out, type_num, 8 - skip);
    out.extend_from_slice(&bytes[skip..]);
}

fn write_value(out: &mut Vec<u8>, v: &Value) {
    match v {
        Value::String(s) => {
            write_control(out, 2, s.len());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Double(d) => {
            write_control(out, 3, 8);
            out.extend_from_slice(&d.to_be_bytes());
        }
        Value::Uint16(v) => write_uint(out, 5, u64::from(*v)),
        Value::Uint32(v) => write_uint(out, 6, u64::from(*v)),
        Value::Uint64(v) => write_uint(out, 9, *v),
        Value::Map(pairs) => {
            write_control(out, 7, pairs.len());
            for (key, value) in pairs {
                write_control(out, 2, key.len());
                out.extend_from_slice(key.as_bytes());
                write_value(out, value);
            }
        }
        Value::Array(items) => {
            write_control(out, 11, items.len());
            for item in items {
                write_value(out, item);
            }
        }
    }
}

/// Build an ip_version=4 database mapping `prefix`/24 to `record`.
/// The search tree is a 24-node chain following the prefix bits; any
/// address outside the prefix resolves to the not-found node.
pub(crate) fn city_db(prefix: [u8; 3], record: &Value) -> Vec<u8> {
    let mut out = Vec::new();

    for i in 0..24usize {
        let bit = (prefix[i / 8] >> (7 - (i % 8))) & 1;
        let next: u32 = if i == 23 {
            // data pointer: offset 0 in the data section
            NODE_COUNT + 16
        } else {
            (i + 1) as u32
        };
        let (left, right) = if bit == 0 {
            (next, NODE_COUNT)
        } else {
            (NODE_COUNT, next)
        };
        out.extend_from_slice(&left.to_be_bytes()[1..]);
        out.extend_from_slice(&right.to_be_bytes()[1..]);
    }

    // data section separator
    out.extend_from_slice(&[0u8; 16]);
    write_value(&mut out, record);

    out.extend_from_slice(METADATA_MARKER);
    let metadata = Value::Map(vec![
        ("binary_format_major_version", Value::Uint16(2)),
        ("binary_format_minor_version", Value::Uint16(0)),
        ("build_epoch", Value::Uint64(1_700_000_000)),
        ("database_type", Value::String("GeoLite2-City")),
        (
            "description",
            Value::Map(vec![("en", Value::String("test city database"))]),
        ),
        ("ip_version", Value::Uint16(4)),
        ("languages", Value::Array(vec![Value::String("en")])),
        ("node_count", Value::Uint32(NODE_COUNT)),
        ("record_size", Value::Uint16(RECORD_SIZE_BITS)),
    ]);
    write_value(&mut out, &metadata);
    out
}

/// The record the GeoLite2 test dataset carries for 2.125.160.0/24.
pub(crate) fn boxford_record() -> Value<'static> {
    Value::Map(vec![
        (
            "city",
            Value::Map(vec![
                ("geoname_id", Value::Uint32(2655045)),
                ("names", Value::Map(vec![("en", Value::String("Boxford"))])),
            ]),
        ),
        (
            "continent",
            Value::Map(vec![
                ("code", Value::String("EU")),
                ("geoname_id", Value::Uint32(6255148)),
                ("names", Value::Map(vec![("en", Value::String("Europe"))])),
            ]),
        ),
        (
            "country",
            Value::Map(vec![
                ("geoname_id", Value::Uint32(2635167)),
                ("iso_code", Value::String("GB")),
                (
                    "names",
                    Value::Map(vec![("en", Value::String("United Kingdom"))]),
                ),
            ]),
        ),
        (
            "location",
            Value::Map(vec![
                ("accuracy_radius", Value::Uint16(100)),
                ("latitude", Value::Double(51.75)),
                ("longitude", Value::Double(-1.25)),
            ]),
        ),
        ("postal", Value::Map(vec![("code", Value::String("OX1"))])),
        (
            "subdivisions",
            Value::Array(vec![
                Value::Map(vec![
                    ("geoname_id", Value::Uint32(6269131)),
                    ("iso_code", Value::String("ENG")),
                    ("names", Value::Map(vec![("en", Value::String("England"))])),
                ]),
                Value::Map(vec![
                    ("geoname_id", Value::Uint32(3333217)),
                    ("iso_code", Value::String("WBK")),
                    (
                        "names",
                        Value::Map(vec![("en", Value::String("West Berkshire"))]),
                    ),
                ]),
            ]),
        ),
    ])
}

/// A gzipped tarball holding the database under the member name the
/// loader extracts, as the MaxMind distribution does.
pub(crate) fn boxford_tgz() -> Vec<u8> {
    tar_gz_city_db(city_db([2, 125, 160], &boxford_record()))
}

pub(crate) fn tar_gz_city_db(db: Vec<u8>) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(db.len() as u64);
    header.set_cksum();
    builder
        .append_data(
            &mut header,
            "GeoLite2-City_20250101/GeoLite2-City.mmdb",
            db.as_slice(),
        )
        .unwrap();
    let tarball = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tarball).unwrap();
    encoder.finish().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_resolves_the_encoded_record() {
        let db = city_db([2, 125, 160], &boxford_record());
        let reader = maxminddb::Reader::from_source(db).unwrap();
        assert_eq!(reader.metadata.node_count, NODE_COUNT);
        assert_eq!(reader.metadata.ip_version, 4);

        let city: maxminddb::geoip2::City =
            reader.lookup("2.125.160.216".parse().unwrap()).unwrap();
        assert_eq!(city.country.as_ref().unwrap().iso_code, Some("GB"));
        assert_eq!(
            city.city.as_ref().unwrap().names.as_ref().unwrap().get("en"),
            Some(&"Boxford")
        );

        let r = reader.lookup::<maxminddb::geoip2::City>("127.0.0.1".parse().unwrap());
        assert!(matches!(
            r,
            Err(maxminddb::MaxMindDBError::AddressNotFoundError(_))
        ));
    }
}
