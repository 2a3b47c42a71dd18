/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::annotate::SockId;
use crate::stat::EventSourceStats;

use super::Handler;

const RECONNECT_PAUSE: Duration = Duration::from_millis(100);

/// The event discriminator is serialized as the upstream protocol's
/// integer enum: 0 for a flow open, 1 for a flow close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
enum EventKind {
    Open,
    Close,
}

impl TryFrom<i64> for EventKind {
    type Error = String;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(EventKind::Open),
            1 => Ok(EventKind::Close),
            _ => Err(format!("unknown event kind {v}")),
        }
    }
}

/// One newline-delimited JSON message from the flow event socket. Only
/// open events carry the 4-tuple.
#[derive(Debug, Deserialize)]
struct FlowEvent {
    #[serde(rename = "Event")]
    event: EventKind,
    #[serde(rename = "Timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "UUID")]
    uuid: String,
    #[serde(rename = "ID", default)]
    id: Option<SockId>,
}

/// Consume the flow event socket, dispatching each event to the
/// handler. The connection is retried with a short pause for as long as
/// the token is live; the event source restarts independently of us.
pub(crate) async fn run_event_listener(
    path: PathBuf,
    handler: Handler,
    stats: Arc<EventSourceStats>,
    quit: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = quit.cancelled() => break,
            r = UnixStream::connect(&path) => {
                match r {
                    Ok(stream) => {
                        stats.add_connect();
                        info!("connected to event socket {}", path.display());
                        read_events(stream, &handler, &stats, &quit).await;
                        if !quit.is_cancelled() {
                            warn!("event socket {} disconnected", path.display());
                        }
                    }
                    Err(e) => {
                        debug!("could not connect to event socket {}: {e}", path.display());
                    }
                }
            }
        }

        tokio::select! {
            biased;

            _ = quit.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
        }
    }
}

async fn read_events(
    stream: UnixStream,
    handler: &Handler,
    stats: &EventSourceStats,
    quit: &CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            biased;

            _ = quit.cancelled() => return,
            r = lines.next_line() => {
                match r {
                    Ok(Some(line)) => dispatch(&line, handler, stats),
                    Ok(None) => return,
                    Err(e) => {
                        warn!("event socket read failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}

fn dispatch(line: &str, handler: &Handler, stats: &EventSourceStats) {
    if line.is_empty() {
        return;
    }
    let event: FlowEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            stats.add_invalid();
            debug!("invalid event line: {e}");
            return;
        }
    };
    stats.add_event();
    match event.event {
        EventKind::Open => {
            let Some(id) = event.id else {
                stats.add_invalid();
                return;
            };
            handler.open(event.timestamp, event.uuid, id);
        }
        EventKind::Close => handler.close(event.timestamp, &event.uuid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::HandlerStats;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    fn pair() -> (Handler, crate::event::Worker, Arc<HandlerStats>) {
        let stats = Arc::new(HandlerStats::default());
        let (handler, worker) = crate::event::new(
            16,
            Vec::new(),
            Box::new(crate::event::FsStore::new("/nonexistent")),
            stats.clone(),
        );
        (handler, worker, stats)
    }

    #[test]
    fn dispatch_open_event() {
        let (handler, worker, _stats) = pair();
        let stats = EventSourceStats::default();

        dispatch(
            r#"{"Event":0,"Timestamp":"2025-03-09T15:22:08Z","UUID":"uuid-1","ID":{"SPort":1,"DPort":2,"SrcIP":"1.0.0.1","DstIP":"9.0.0.9","Cookie":3}}"#,
            &handler,
            &stats,
        );
        assert_eq!(stats.events(), 1);
        let job = worker.receiver.try_recv().unwrap();
        assert_eq!(job.uuid, "uuid-1");
        assert_eq!(job.id.src_ip, "1.0.0.1");
    }

    #[test]
    fn dispatch_ignores_close_and_junk() {
        let (handler, worker, _stats) = pair();
        let stats = EventSourceStats::default();

        dispatch(
            r#"{"Event":1,"Timestamp":"2025-03-09T15:22:08Z","UUID":"uuid-1"}"#,
            &handler,
            &stats,
        );
        dispatch("", &handler, &stats);
        dispatch("not json", &handler, &stats);
        // an unknown event kind fails to decode
        dispatch(
            r#"{"Event":7,"Timestamp":"2025-03-09T15:22:08Z","UUID":"uuid-1"}"#,
            &handler,
            &stats,
        );
        // an open without a 4-tuple cannot be annotated
        dispatch(
            r#"{"Event":0,"Timestamp":"2025-03-09T15:22:08Z","UUID":"uuid-2"}"#,
            &handler,
            &stats,
        );

        assert!(worker.receiver.try_recv().is_err());
        assert_eq!(stats.events(), 2);
        assert_eq!(stats.invalid(), 3);
    }

    #[tokio::test]
    async fn listens_and_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let (handler, worker, _stats) = pair();
        let stats = Arc::new(EventSourceStats::default());
        let quit = CancellationToken::new();
        let task = tokio::spawn(run_event_listener(
            path.clone(),
            handler,
            stats.clone(),
            quit.clone(),
        ));

        // first connection delivers one event, then drops
        let (mut conn, _) = listener.accept().await.unwrap();
        conn.write_all(
            b"{\"Event\":0,\"Timestamp\":\"2025-03-09T15:22:08Z\",\"UUID\":\"one\",\"ID\":{\"SPort\":1,\"DPort\":2,\"SrcIP\":\"1.0.0.1\",\"DstIP\":\"9.0.0.9\",\"Cookie\":0}}\n",
        )
        .await
        .unwrap();
        let job = worker.receiver.recv_async().await.unwrap();
        assert_eq!(job.uuid, "one");
        drop(conn);

        // the listener reconnects and keeps consuming
        let (mut conn, _) = listener.accept().await.unwrap();
        conn.write_all(
            b"{\"Event\":0,\"Timestamp\":\"2025-03-09T15:22:09Z\",\"UUID\":\"two\",\"ID\":{\"SPort\":1,\"DPort\":2,\"SrcIP\":\"1.0.0.1\",\"DstIP\":\"9.0.0.9\",\"Cookie\":0}}\n",
        )
        .await
        .unwrap();
        let job = worker.receiver.recv_async().await.unwrap();
        assert_eq!(job.uuid, "two");
        assert_eq!(stats.connects(), 2);

        quit.cancel();
        task.await.unwrap();
    }
}
