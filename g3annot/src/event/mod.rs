/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;
use tokio_util::sync::CancellationToken;

use g3_ip_annotate::Annotations;

use crate::annotate::{Annotator, SockId};
use crate::stat::HandlerStats;

mod socket;
pub(crate) use socket::run_event_listener;

struct Job {
    timestamp: DateTime<Utc>,
    uuid: String,
    id: SockId,
}

/// Where finished records land. The daemon writes through the real file
/// system; tests inject a failing store.
pub(crate) trait OutputStore: Send + Sync {
    fn write(&self, relative_dir: &str, file_name: &str, data: &[u8]) -> io::Result<()>;
}

pub(crate) struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub(crate) fn new(root: impl AsRef<Path>) -> Self {
        FsStore {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl OutputStore for FsStore {
    fn write(&self, relative_dir: &str, file_name: &str, data: &[u8]) -> io::Result<()> {
        let dir = self.root.join(relative_dir);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(file_name), data)
    }
}

/// The non-blocking half handed to the event source. A full queue drops
/// the event and bumps the pipefull counter; the event source is never
/// back-pressured.
#[derive(Clone)]
pub(crate) struct Handler {
    sender: flume::Sender<Job>,
    stats: Arc<HandlerStats>,
}

impl Handler {
    pub(crate) fn open(&self, timestamp: DateTime<Utc>, uuid: String, id: SockId) {
        let job = Job {
            timestamp,
            uuid,
            id,
        };
        if self.sender.try_send(job).is_err() {
            self.stats.add_pipe_full();
        }
    }

    pub(crate) fn close(&self, _timestamp: DateTime<Utc>, _uuid: &str) {
        // flow teardown carries nothing we record
    }
}

/// The draining half: runs every annotator over each job in arrival
/// order and writes one JSON file per UUID.
pub(crate) struct Worker {
    receiver: flume::Receiver<Job>,
    annotators: Vec<Arc<dyn Annotator>>,
    store: Box<dyn OutputStore>,
    stats: Arc<HandlerStats>,
}

pub(crate) fn new(
    buffer_size: usize,
    annotators: Vec<Arc<dyn Annotator>>,
    store: Box<dyn OutputStore>,
    stats: Arc<HandlerStats>,
) -> (Handler, Worker) {
    let (sender, receiver) = flume::bounded::<Job>(buffer_size);
    (
        Handler {
            sender,
            stats: stats.clone(),
        },
        Worker {
            receiver,
            annotators,
            store,
            stats,
        },
    )
}

impl Worker {
    /// Drain jobs until cancellation, or until every handler clone is
    /// gone and the queue is empty.
    pub(crate) async fn into_running(self, quit: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = quit.cancelled() => break,
                r = self.receiver.recv_async() => {
                    match r {
                        Ok(job) => self.annotate_and_save(&job),
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn annotate_and_save(&self, job: &Job) {
        let mut record = Annotations::new(job.uuid.clone(), job.timestamp);
        for annotator in &self.annotators {
            if let Err(e) = annotator.annotate(&job.id, &mut record) {
                warn!("{e}");
                self.stats.add_annotation_error();
            }
        }

        let data = match serde_json::to_vec(&record) {
            Ok(data) => data,
            Err(e) => {
                warn!("could not serialize record for {}: {e}", job.uuid);
                self.stats.add_write_fail();
                return;
            }
        };
        // the event timestamp, in UTC, decides the date partition
        let dir = job.timestamp.format("%Y/%m/%d").to_string();
        let file_name = format!("{}.json", job.uuid);
        match self.store.write(&dir, &file_name, &data) {
            Ok(()) => self.stats.add_file_written(),
            Err(e) => {
                warn!("could not write metadata for {}: {e}", job.uuid);
                self.stats.add_write_fail();
            }
        }
    }
}
