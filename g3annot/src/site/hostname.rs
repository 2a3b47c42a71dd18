/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum HostnameError {
    #[error("hostname {0:?} has too few labels")]
    TooFewLabels(String),
    #[error("invalid machine name {0:?}")]
    InvalidMachine(String),
    #[error("invalid site name {0:?}")]
    InvalidSite(String),
}

/// The machine/site pair carried by a canonical node hostname.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Hostname {
    pub(crate) machine: String,
    pub(crate) site: String,
}

/// Parse `<machine>-<site>.<project>.<tld>` or the legacy
/// `<machine>.<site>.<tld>`. The machine must be `mlab` plus one digit;
/// the site is three lowercase letters, a digit, and a digit or one of
/// `t`/`c` for testing and canary sites.
pub(crate) fn parse(hostname: &str) -> Result<Hostname, HostnameError> {
    let mut labels = hostname.split('.');
    let first = labels
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| HostnameError::TooFewLabels(hostname.to_string()))?;

    let (machine, site) = match first.split_once('-') {
        Some((machine, site)) => (machine, site),
        None => {
            let site = labels
                .next()
                .ok_or_else(|| HostnameError::TooFewLabels(hostname.to_string()))?;
            (first, site)
        }
    };
    if labels.next().is_none() {
        return Err(HostnameError::TooFewLabels(hostname.to_string()));
    }

    if !valid_machine(machine) {
        return Err(HostnameError::InvalidMachine(machine.to_string()));
    }
    if !valid_site(site) {
        return Err(HostnameError::InvalidSite(site.to_string()));
    }
    Ok(Hostname {
        machine: machine.to_string(),
        site: site.to_string(),
    })
}

fn valid_machine(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 5 && s.starts_with("mlab") && b[4].is_ascii_digit()
}

fn valid_site(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 5
        && b[..3].iter().all(|c| c.is_ascii_lowercase())
        && b[3].is_ascii_digit()
        && (b[4].is_ascii_digit() || b[4] == b't' || b[4] == b'c')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form() {
        let h = parse("mlab1-lga03.mlab-sandbox.measurement-lab.org").unwrap();
        assert_eq!(h.machine, "mlab1");
        assert_eq!(h.site, "lga03");
    }

    #[test]
    fn legacy_form() {
        let h = parse("mlab1.lga03.measurement-lab.org").unwrap();
        assert_eq!(h.machine, "mlab1");
        assert_eq!(h.site, "lga03");
    }

    #[test]
    fn testing_and_canary_sites() {
        assert_eq!(parse("mlab4-abc0t.mlab-staging.measurement-lab.org").unwrap().site, "abc0t");
        assert_eq!(parse("mlab1-lga1c.mlab-oti.measurement-lab.org").unwrap().site, "lga1c");
    }

    #[test]
    fn bad_machine() {
        assert_eq!(
            parse("mlabX-lga03.measurement-lab.org"),
            Err(HostnameError::InvalidMachine("mlabX".to_string()))
        );
        assert_eq!(
            parse("node1-lga03.measurement-lab.org"),
            Err(HostnameError::InvalidMachine("node1".to_string()))
        );
    }

    #[test]
    fn bad_site() {
        assert_eq!(
            parse("mlab1-lga0x.measurement-lab.org"),
            Err(HostnameError::InvalidSite("lga0x".to_string()))
        );
        assert_eq!(
            parse("mlab1-LGA03.measurement-lab.org"),
            Err(HostnameError::InvalidSite("LGA03".to_string()))
        );
        assert_eq!(
            parse("mlab1-lga035x.measurement-lab.org"),
            Err(HostnameError::InvalidSite("lga035x".to_string()))
        );
    }

    #[test]
    fn too_few_labels() {
        assert!(matches!(parse(""), Err(HostnameError::TooFewLabels(_))));
        assert!(matches!(
            parse("mlab1-lga03"),
            Err(HostnameError::TooFewLabels(_))
        ));
        assert!(matches!(
            parse("mlab1.lga03"),
            Err(HostnameError::TooFewLabels(_))
        ));
    }
}
