/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::anyhow;
use log::warn;

/// Map from AS number to the registered AS name, parsed from the
/// IPinfo CSV export.
#[derive(Default)]
pub(crate) struct AsNames(HashMap<u32, String>);

impl AsNames {
    /// Parse the CSV blob. The first row is a header. The first field of
    /// each data row is `AS<number>`; rows without the `AS` prefix are
    /// ignored.
    pub(crate) fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let mut map = HashMap::new();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(data);
        for (i, record) in reader.records().enumerate() {
            let record = record.map_err(|e| anyhow!("invalid CSV record #{i}: {e}"))?;
            let (Some(asn), Some(name)) = (record.get(0), record.get(1)) else {
                warn!("short CSV row #{i} in AS name data");
                continue;
            };
            let Some(number) = asn.strip_prefix("AS") else {
                continue;
            };
            match u32::from_str(number) {
                Ok(number) => {
                    map.insert(number, name.to_string());
                }
                Err(e) => warn!("bad AS number {asn:?} in row #{i}: {e}"),
            }
        }
        Ok(AsNames(map))
    }

    /// An absent entry yields the empty name, not a missing flag.
    pub(crate) fn get(&self, asn: u32) -> String {
        self.0.get(&asn).cloned().unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_names() {
        let data = b"asn,name,domain\n\
                     AS13335,\"Cloudflare, Inc.\",cloudflare.com\n\
                     AS6453,TATA COMMUNICATIONS (AMERICA) INC,tatacommunications.com\n";
        let names = AsNames::parse(data).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names.get(13335), "Cloudflare, Inc.");
        assert_eq!(names.get(6453), "TATA COMMUNICATIONS (AMERICA) INC");
    }

    #[test]
    fn absent_asn_yields_empty_name() {
        let names = AsNames::parse(b"asn,name\nAS5,Five\n").unwrap();
        assert_eq!(names.get(9), "");
    }

    #[test]
    fn rows_without_as_prefix_are_ignored() {
        let data = b"asn,name\n\
                     AS5,Five\n\
                     1234,No Prefix\n\
                     ASx,Bad Number\n";
        let names = AsNames::parse(data).unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names.get(5), "Five");
    }
}
