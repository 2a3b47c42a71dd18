/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::ClientAnnotations;

#[derive(Default)]
pub struct ClientStats {
    request_total: AtomicU64,
    request_ok: AtomicU64,
    connect_fail: AtomicU64,
    status_fail: AtomicU64,
    decode_fail: AtomicU64,
}

macro_rules! impl_for_field {
    ($add:ident, $get:ident, $field:ident) => {
        fn $add(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl ClientStats {
    impl_for_field!(add_request_total, request_total, request_total);
    impl_for_field!(add_request_ok, request_ok, request_ok);
    impl_for_field!(add_connect_fail, connect_fail, connect_fail);
    impl_for_field!(add_status_fail, status_fail, status_fail);
    impl_for_field!(add_decode_fail, decode_fail, decode_fail);
}

/// Client side of the local annotation RPC. All IPC details beyond the
/// socket path are internal to this crate and may change; callers get a
/// map from each valid input IP to its annotations.
pub struct AnnotateClient {
    socket_path: PathBuf,
    stats: Arc<ClientStats>,
}

impl AnnotateClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        AnnotateClient {
            socket_path: socket_path.as_ref().to_path_buf(),
            stats: Arc::new(ClientStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        self.stats.clone()
    }

    /// Fetch annotations for each of the given IP addresses. Invalid
    /// input IPs are absent from the returned map.
    pub async fn annotate(
        &self,
        ips: &[&str],
    ) -> anyhow::Result<HashMap<String, ClientAnnotations>> {
        self.stats.add_request_total();

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for ip in ips {
            query.append_pair("ip", ip);
        }
        let query = query.finish();

        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            self.stats.add_connect_fail();
            anyhow!(
                "failed to connect to annotation socket {}: {e}",
                self.socket_path.display()
            )
        })?;

        let req = format!(
            "GET {}?{query} HTTP/1.1\r\nHost: unix\r\nConnection: close\r\n\r\n",
            super::ANNOTATE_PATH
        );
        stream
            .write_all(req.as_bytes())
            .await
            .map_err(|e| anyhow!("failed to send request: {e}"))?;

        let mut rsp = Vec::with_capacity(4096);
        stream
            .read_to_end(&mut rsp)
            .await
            .map_err(|e| anyhow!("failed to read response: {e}"))?;

        let body = self.check_response(&rsp)?;
        match serde_json::from_slice::<HashMap<String, ClientAnnotations>>(body) {
            Ok(map) => {
                self.stats.add_request_ok();
                Ok(map)
            }
            Err(e) => {
                self.stats.add_decode_fail();
                Err(anyhow!("invalid response body: {e}"))
            }
        }
    }

    fn check_response<'a>(&self, rsp: &'a [u8]) -> anyhow::Result<&'a [u8]> {
        let header_end = find_header_end(rsp).ok_or_else(|| {
            self.stats.add_decode_fail();
            anyhow!("malformed response: no header end found")
        })?;
        let head = std::str::from_utf8(&rsp[..header_end])
            .map_err(|e| anyhow!("malformed response header: {e}"))?;
        let status_line = head.lines().next().unwrap_or_default();
        let code = status_line.split(' ').nth(1).unwrap_or_default();
        if code != "200" {
            self.stats.add_status_fail();
            return Err(anyhow!("got HTTP {code}, but wanted HTTP 200"));
        }
        Ok(&rsp[header_end..])
    }
}

fn find_header_end(rsp: &[u8]) -> Option<usize> {
    rsp.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
