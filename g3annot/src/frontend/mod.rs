/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use http::{StatusCode, Uri};
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use g3_ip_annotate::{ANNOTATE_PATH, ClientAnnotations};

use crate::asn::AsnAnnotator;
use crate::geo::GeoAnnotator;
use crate::stat::FrontendStats;

/// The annotation RPC service: HTTP/1.1 over a unix stream socket,
/// answering point lookups straight from the in-memory snapshots. The
/// annotators are optional so the wire plumbing can run without data.
pub(crate) struct AnnotationFrontend {
    listener: UnixListener,
    listen_path: PathBuf,
    asn: Option<Arc<AsnAnnotator>>,
    geo: Option<Arc<GeoAnnotator>>,
    stats: Arc<FrontendStats>,
}

impl AnnotationFrontend {
    pub(crate) fn new(
        path: impl AsRef<Path>,
        asn: Option<Arc<AsnAnnotator>>,
        geo: Option<Arc<GeoAnnotator>>,
        stats: Arc<FrontendStats>,
    ) -> io::Result<Self> {
        let listen_path = path.as_ref().to_path_buf();
        // container restarts can leave a stale socket file in the way;
        // remove it unconditionally before binding
        let _ = std::fs::remove_file(&listen_path);
        let listener = UnixListener::bind(&listen_path)?;
        Ok(AnnotationFrontend {
            listener,
            listen_path,
            asn,
            geo,
            stats,
        })
    }

    pub(crate) async fn into_running(self, quit: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = quit.cancelled() => break,
                r = self.listener.accept() => {
                    match r {
                        Ok((stream, _addr)) => {
                            let asn = self.asn.clone();
                            let geo = self.geo.clone();
                            let stats = self.stats.clone();
                            tokio::spawn(async move {
                                handle_conn(stream, asn, geo, stats).await;
                            });
                        }
                        Err(e) => {
                            warn!("annotation frontend {} accept: {e}", self.listen_path.display());
                        }
                    }
                }
            }
        }
    }
}

impl Drop for AnnotationFrontend {
    fn drop(&mut self) {
        if self.listen_path.exists() {
            debug!("unlink socket file {}", self.listen_path.display());
            let _ = std::fs::remove_file(&self.listen_path);
        }
    }
}

async fn handle_conn(
    stream: UnixStream,
    asn: Option<Arc<AsnAnnotator>>,
    geo: Option<Arc<GeoAnnotator>>,
    stats: Arc<FrontendStats>,
) {
    stats.add_request_total();

    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);

    let mut request_line = String::new();
    match reader.read_line(&mut request_line).await {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
    }
    // drain the header section; nothing in it changes the answer
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                if header == "\r\n" || header == "\n" {
                    break;
                }
            }
        }
    }

    let (status, body) = handle_request(request_line.trim_end(), &asn, &geo, &stats);
    let rsp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown"),
        body.len(),
    );
    if w.write_all(rsp.as_bytes()).await.is_err() {
        stats.add_write_error();
        return;
    }
    let _ = w.shutdown().await;
    if status == StatusCode::OK {
        stats.add_request_ok();
    }
}

fn handle_request(
    request_line: &str,
    asn: &Option<Arc<AsnAnnotator>>,
    geo: &Option<Arc<GeoAnnotator>>,
    stats: &FrontendStats,
) -> (StatusCode, String) {
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        stats.add_bad_request();
        return (StatusCode::BAD_REQUEST, String::new());
    };
    if method != "GET" {
        stats.add_bad_request();
        return (StatusCode::METHOD_NOT_ALLOWED, String::new());
    }
    let Ok(uri) = Uri::from_str(target) else {
        stats.add_bad_request();
        return (StatusCode::BAD_REQUEST, String::new());
    };
    if uri.path() != ANNOTATE_PATH {
        stats.add_bad_request();
        return (StatusCode::NOT_FOUND, String::new());
    }

    let mut rsp = BTreeMap::<String, ClientAnnotations>::new();
    let query = uri.query().unwrap_or_default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key != "ip" {
            continue;
        }
        let Ok(ip) = IpAddr::from_str(&value) else {
            debug!("could not parse IP {value:?}");
            stats.add_bad_ip();
            continue;
        };
        let mut ann = ClientAnnotations::default();
        if let Some(asn) = asn {
            ann.network = Some(asn.annotate_ip(ip));
        }
        if let Some(geo) = geo {
            match geo.annotate_ip(ip) {
                Ok(g) => ann.geo = Some(g),
                Err(e) => warn!("could not geo annotate {ip}: {e}"),
            }
        }
        rsp.insert(value.to_string(), ann);
    }

    if rsp.is_empty() {
        debug!("could not process request ip argument(s)");
        stats.add_bad_request();
        return (StatusCode::BAD_REQUEST, String::new());
    }

    match serde_json::to_string(&rsp) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            warn!("could not serialize annotation response: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
