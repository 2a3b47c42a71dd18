/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

macro_rules! impl_for_field {
    ($add:ident, $get:ident, $field:ident) => {
        pub(crate) fn $add(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub(crate) fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

/// Counters owned by the event handler and its worker.
#[derive(Default)]
pub(crate) struct HandlerStats {
    pipe_full: AtomicU64,
    write_fail: AtomicU64,
    annotation_errors: AtomicU64,
    files_written: AtomicU64,
}

impl HandlerStats {
    impl_for_field!(add_pipe_full, pipe_full, pipe_full);
    impl_for_field!(add_write_fail, write_fail, write_fail);
    impl_for_field!(add_annotation_error, annotation_errors, annotation_errors);
    impl_for_field!(add_file_written, files_written, files_written);
}

/// Counters owned by the annotation RPC frontend.
#[derive(Default)]
pub(crate) struct FrontendStats {
    request_total: AtomicU64,
    request_ok: AtomicU64,
    bad_ip: AtomicU64,
    bad_request: AtomicU64,
    write_error: AtomicU64,
}

impl FrontendStats {
    impl_for_field!(add_request_total, request_total, request_total);
    impl_for_field!(add_request_ok, request_ok, request_ok);
    impl_for_field!(add_bad_ip, bad_ip, bad_ip);
    impl_for_field!(add_bad_request, bad_request, bad_request);
    impl_for_field!(add_write_error, write_error, write_error);
}

/// Counters owned by the flow event source listener.
#[derive(Default)]
pub(crate) struct EventSourceStats {
    connects: AtomicU64,
    events: AtomicU64,
    invalid: AtomicU64,
}

impl EventSourceStats {
    impl_for_field!(add_connect, connects, connects);
    impl_for_field!(add_event, events, events);
    impl_for_field!(add_invalid, invalid, invalid);
}

/// Parser-category counters for the RouteViews table loads.
#[derive(Default)]
pub(crate) struct RouteviewStats {
    rows_parsed: AtomicU64,
    rows_missing_fields: AtomicU64,
    rows_corrupt_netblock: AtomicU64,
    rows_corrupt_prefix: AtomicU64,
}

impl RouteviewStats {
    pub(crate) fn add_tally(&self, tally: &crate::asn::ParseTally) {
        self.rows_parsed.fetch_add(tally.parsed, Ordering::Relaxed);
        self.rows_missing_fields
            .fetch_add(tally.missing_fields, Ordering::Relaxed);
        self.rows_corrupt_netblock
            .fetch_add(tally.corrupt_netblock, Ordering::Relaxed);
        self.rows_corrupt_prefix
            .fetch_add(tally.corrupt_prefix, Ordering::Relaxed);
    }

    fn snapshot(&self) -> [(&'static str, u64); 4] {
        [
            ("parsed", self.rows_parsed.load(Ordering::Relaxed)),
            (
                "missing-fields",
                self.rows_missing_fields.load(Ordering::Relaxed),
            ),
            (
                "corrupt-netblock",
                self.rows_corrupt_netblock.load(Ordering::Relaxed),
            ),
            (
                "corrupt-prefix",
                self.rows_corrupt_prefix.load(Ordering::Relaxed),
            ),
        ]
    }
}

/// Which dataset blob versions are currently loaded. The gauge for a
/// hash is 1 while its blob backs a live snapshot and drops to 0 once
/// the blob has been replaced.
#[derive(Default)]
pub(crate) struct DatasetStats {
    hashes: Mutex<HashMap<String, bool>>,
}

impl DatasetStats {
    pub(crate) fn set_loaded(&self, tag: &str) {
        let mut hashes = self.hashes.lock().unwrap();
        hashes.insert(tag.to_string(), true);
    }

    pub(crate) fn set_replaced(&self, tag: &str) {
        let mut hashes = self.hashes.lock().unwrap();
        if let Some(loaded) = hashes.get_mut(tag) {
            *loaded = false;
        }
    }

    fn snapshot(&self) -> Vec<(String, bool)> {
        let hashes = self.hashes.lock().unwrap();
        let mut v: Vec<(String, bool)> = hashes.iter().map(|(k, l)| (k.clone(), *l)).collect();
        v.sort();
        v
    }
}

pub(crate) struct DaemonStats {
    pub(crate) handler: Arc<HandlerStats>,
    pub(crate) frontend: Arc<FrontendStats>,
    pub(crate) source: Arc<EventSourceStats>,
    pub(crate) dataset: Arc<DatasetStats>,
    pub(crate) routeview: Arc<RouteviewStats>,
}

impl DaemonStats {
    pub(crate) fn new() -> Self {
        DaemonStats {
            handler: Arc::new(HandlerStats::default()),
            frontend: Arc::new(FrontendStats::default()),
            source: Arc::new(EventSourceStats::default()),
            dataset: Arc::new(DatasetStats::default()),
            routeview: Arc::new(RouteviewStats::default()),
        }
    }

    /// Render every counter in the prometheus text exposition format.
    pub(crate) fn prometheus_text(&self) -> String {
        let mut out = String::with_capacity(2048);

        out.push_str(
            "# HELP g3annot_missed_jobs_total Flow events received but not written, by reason\n\
             # TYPE g3annot_missed_jobs_total counter\n",
        );
        let _ = writeln!(
            out,
            "g3annot_missed_jobs_total{{reason=\"pipefull\"}} {}",
            self.handler.pipe_full()
        );
        let _ = writeln!(
            out,
            "g3annot_missed_jobs_total{{reason=\"writefail\"}} {}",
            self.handler.write_fail()
        );

        out.push_str(
            "# HELP g3annot_annotation_errors_total Times an annotator returned an error\n\
             # TYPE g3annot_annotation_errors_total counter\n",
        );
        let _ = writeln!(
            out,
            "g3annot_annotation_errors_total {}",
            self.handler.annotation_errors()
        );

        out.push_str(
            "# HELP g3annot_annotations_written_total Annotation files written\n\
             # TYPE g3annot_annotations_written_total counter\n",
        );
        let _ = writeln!(
            out,
            "g3annot_annotations_written_total {}",
            self.handler.files_written()
        );

        out.push_str(
            "# HELP g3annot_server_requests_total Connections accepted by the annotation RPC service\n\
             # TYPE g3annot_server_requests_total counter\n",
        );
        let _ = writeln!(
            out,
            "g3annot_server_requests_total {}",
            self.frontend.request_total()
        );

        out.push_str(
            "# HELP g3annot_server_rpcs_total Annotation RPC requests served, by outcome\n\
             # TYPE g3annot_server_rpcs_total counter\n",
        );
        for (status, value) in [
            ("success", self.frontend.request_ok()),
            ("badip_error", self.frontend.bad_ip()),
            ("bad_request_error", self.frontend.bad_request()),
            ("write_error", self.frontend.write_error()),
        ] {
            let _ = writeln!(
                out,
                "g3annot_server_rpcs_total{{status=\"{status}\"}} {value}"
            );
        }

        out.push_str(
            "# HELP g3annot_event_source_connects_total Connections made to the flow event socket\n\
             # TYPE g3annot_event_source_connects_total counter\n",
        );
        let _ = writeln!(
            out,
            "g3annot_event_source_connects_total {}",
            self.source.connects()
        );
        out.push_str(
            "# HELP g3annot_events_received_total Flow events read from the event socket\n\
             # TYPE g3annot_events_received_total counter\n",
        );
        let _ = writeln!(out, "g3annot_events_received_total {}", self.source.events());
        out.push_str(
            "# HELP g3annot_events_invalid_total Event socket lines that failed to decode\n\
             # TYPE g3annot_events_invalid_total counter\n",
        );
        let _ = writeln!(out, "g3annot_events_invalid_total {}", self.source.invalid());

        out.push_str(
            "# HELP g3annot_routeview_rows_total RouteViews rows seen, by parse outcome\n\
             # TYPE g3annot_routeview_rows_total counter\n",
        );
        for (category, value) in self.routeview.snapshot() {
            let _ = writeln!(
                out,
                "g3annot_routeview_rows_total{{category=\"{category}\"}} {value}"
            );
        }

        out.push_str(
            "# HELP g3annot_dataset_hash_loaded Whether the dataset blob with this hash is live\n\
             # TYPE g3annot_dataset_hash_loaded gauge\n",
        );
        for (tag, loaded) in self.dataset.snapshot() {
            let _ = writeln!(
                out,
                "g3annot_dataset_hash_loaded{{etag=\"{tag}\"}} {}",
                u8::from(loaded)
            );
        }

        out
    }
}

/// Serve the counters over plain HTTP for a prometheus scraper. Every
/// request gets the full exposition; the handler holds no state beyond
/// the shared counters. The listener is bound by the caller so a bad
/// metrics address fails startup.
pub(crate) async fn run_metrics_server(
    listener: TcpListener,
    stats: Arc<DaemonStats>,
    quit: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("metrics handler listening on {addr}");
    }

    loop {
        tokio::select! {
            biased;

            _ = quit.cancelled() => break,
            r = listener.accept() => {
                match r {
                    Ok((mut stream, _peer)) => {
                        let stats = stats.clone();
                        tokio::spawn(async move {
                            // drain whatever request line the scraper sent
                            let mut buf = [0u8; 1024];
                            let _ = stream.read(&mut buf).await;

                            let body = stats.prometheus_text();
                            let rsp = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                                body.len()
                            );
                            let _ = stream.write_all(rsp.as_bytes()).await;
                        });
                    }
                    Err(e) => warn!("metrics listener accept: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_all_series() {
        let stats = DaemonStats::new();
        stats.handler.add_pipe_full();
        stats.handler.add_pipe_full();
        stats.frontend.add_request_ok();
        stats.dataset.set_loaded("abc123");

        let text = stats.prometheus_text();
        assert!(text.contains("g3annot_missed_jobs_total{reason=\"pipefull\"} 2"));
        assert!(text.contains("g3annot_missed_jobs_total{reason=\"writefail\"} 0"));
        assert!(text.contains("g3annot_server_rpcs_total{status=\"success\"} 1"));
        assert!(text.contains("g3annot_dataset_hash_loaded{etag=\"abc123\"} 1"));
    }

    #[test]
    fn dataset_hash_drops_to_zero_on_replacement() {
        let stats = DatasetStats::default();
        stats.set_loaded("v1");
        stats.set_loaded("v2");
        stats.set_replaced("v1");
        assert_eq!(
            stats.snapshot(),
            vec![("v1".to_string(), false), ("v2".to_string(), true)]
        );
    }
}
