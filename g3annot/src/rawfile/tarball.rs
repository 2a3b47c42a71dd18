/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::Read;

use anyhow::anyhow;
use flate2::bufread::GzDecoder;

/// Decompress a gzip blob fully into memory.
pub(crate) fn from_gz(gz: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(gz);
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(|e| anyhow!("gzip decompression failed: {e}"))?;
    Ok(data)
}

/// Read the member whose path ends with `name` out of a .tar.gz blob.
pub(crate) fn read_from_tar_gz(tgz: &[u8], name: &str) -> anyhow::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(GzDecoder::new(tgz));
    for entry in archive
        .entries()
        .map_err(|e| anyhow!("invalid tar archive: {e}"))?
    {
        let mut entry = entry.map_err(|e| anyhow!("invalid tar entry: {e}"))?;
        let path = entry.path().map_err(|e| anyhow!("invalid entry path: {e}"))?;
        if path.to_string_lossy().ends_with(name) {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| anyhow!("failed to read {name} from archive: {e}"))?;
            return Ok(data);
        }
    }
    Err(anyhow!("file {name} not found in archive"))
}
