/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use log::debug;
use reqwest::StatusCode;
use reqwest::header;
use thiserror::Error;
use url::Url;

use crate::stat::DatasetStats;

mod tarball;
pub(crate) use tarball::{from_gz, read_from_tar_gz};

#[derive(Debug, Error)]
pub(crate) enum FetchError {
    /// Distinguished sentinel: the backing object is unchanged since the
    /// last successful fetch, keep the current snapshot.
    #[error("content unchanged since last fetch")]
    NoChange,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
}

/// A raw dataset source. `get` returns the current full blob, or the
/// `NoChange` sentinel when the source can prove the blob is the one
/// already delivered. Caching beyond that is up to each variant.
pub(crate) enum Provider {
    File(FileProvider),
    Gcs(GcsProvider),
    #[cfg(test)]
    Seq(SeqProvider),
}

impl Provider {
    pub(crate) async fn get(&self) -> Result<Vec<u8>, FetchError> {
        match self {
            Provider::File(p) => p.get().await,
            Provider::Gcs(p) => p.get().await,
            #[cfg(test)]
            Provider::Seq(p) => p.get(),
        }
    }
}

/// Build a provider from a dataset URL. Supported schemes are
/// `file:<path>` and `gs://bucket/object`; anything else is a
/// configuration error surfaced at startup.
pub(crate) fn from_url(raw: &str, stats: &Arc<DatasetStats>) -> anyhow::Result<Provider> {
    let Some((scheme, rest)) = raw.split_once(':') else {
        return Err(anyhow!("no URL scheme in {raw}"));
    };
    match scheme {
        "file" => {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(anyhow!("no file path in {raw}"));
            }
            Ok(Provider::File(FileProvider {
                path: PathBuf::from(path),
            }))
        }
        "gs" => {
            let url = Url::parse(raw).map_err(|e| anyhow!("invalid gs url {raw}: {e}"))?;
            let bucket = url
                .host_str()
                .ok_or_else(|| anyhow!("no bucket in {raw}"))?;
            let object = url.path().trim_start_matches('/');
            if object.is_empty() {
                return Err(anyhow!("no object name in {raw}"));
            }
            Ok(Provider::Gcs(GcsProvider::new(bucket, object, stats)))
        }
        _ => Err(anyhow!("unsupported URL scheme {scheme}")),
    }
}

/// Reads the blob from local disk on every call. Change detection is
/// left to the caller's parser; local files are for development and
/// tests, where a spurious reparse is harmless.
pub(crate) struct FileProvider {
    path: PathBuf,
}

impl FileProvider {
    async fn get(&self) -> Result<Vec<u8>, FetchError> {
        let data = tokio::fs::read(&self.path).await?;
        Ok(data)
    }
}

/// Fetches the blob over the object-storage HTTP endpoint. The ETag of
/// the last delivered blob is replayed as `If-None-Match`, so an
/// unchanged object costs one 304 round trip and yields `NoChange`.
pub(crate) struct GcsProvider {
    client: reqwest::Client,
    media_url: String,
    etag: Mutex<Option<String>>,
    stats: Arc<DatasetStats>,
}

impl GcsProvider {
    fn new(bucket: &str, object: &str, stats: &Arc<DatasetStats>) -> Self {
        GcsProvider {
            client: reqwest::Client::new(),
            media_url: format!("https://storage.googleapis.com/{bucket}/{object}"),
            etag: Mutex::new(None),
            stats: stats.clone(),
        }
    }

    async fn get(&self) -> Result<Vec<u8>, FetchError> {
        let mut req = self.client.get(&self.media_url);
        let last_etag = self.etag.lock().unwrap().clone();
        if let Some(tag) = &last_etag {
            req = req.header(header::IF_NONE_MATCH, tag.clone());
        }

        let rsp = req.send().await?;
        if rsp.status() == StatusCode::NOT_MODIFIED {
            return Err(FetchError::NoChange);
        }
        if !rsp.status().is_success() {
            return Err(FetchError::Status(rsp.status().as_u16()));
        }

        // keep the ETag verbatim for If-None-Match; the gauge label is
        // the unquoted form
        let new_etag = rsp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let data = rsp.bytes().await?.to_vec();

        if let Some(tag) = new_etag {
            debug!("{}: loaded object version {tag}", self.media_url);
            let mut etag = self.etag.lock().unwrap();
            if let Some(old) = etag.replace(tag.clone()) {
                self.stats.set_replaced(old.trim_matches('"'));
            }
            self.stats.set_loaded(tag.trim_matches('"'));
        }
        Ok(data)
    }
}

/// Scripted provider for tests: pops one prepared result per call and
/// reports `NoChange` once the script runs dry.
#[cfg(test)]
pub(crate) struct SeqProvider {
    results: Mutex<std::collections::VecDeque<Result<Vec<u8>, FetchError>>>,
}

#[cfg(test)]
impl SeqProvider {
    pub(crate) fn new(
        results: impl IntoIterator<Item = Result<Vec<u8>, FetchError>>,
    ) -> Provider {
        Provider::Seq(SeqProvider {
            results: Mutex::new(results.into_iter().collect()),
        })
    }

    fn get(&self) -> Result<Vec<u8>, FetchError> {
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(FetchError::NoChange))
    }
}
