// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline orchestrator: the consumer side of the file queue.
//!
//! Runs on its own thread inside a current-thread tokio runtime. Every
//! dequeued log is parsed, its records are filtered through the dedup cache,
//! and the surviving bytes go through the frame compressor; each ready
//! output buffer is fanned out to every host writer. When the reader's end
//! sentinel arrives, the compressor is finalized, the writers are shut down
//! and joined, and the per-host reports are collected.
//!
//! Failure policy: writer errors are per-host and never stop the run (though
//! the loop exits early once every host has failed); parser errors do not
//! exist (bad lines are skipped); compressor and TLS-setup errors are fatal.

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::compress::FrameCompressor;
use crate::dedup::DedupCache;
use crate::error::PipelineError;
use crate::options::Options;
use crate::parser::LogParser;
use crate::tls::TlsSettings;
use crate::writer::{HostReport, WriterHandle};

/// Bounded capacity of the reader → consumer file queue.
pub const FILE_QUEUE_CAPACITY: usize = 30;

/// How many files to process between all-hosts-failed checks.
const QUORUM_CHECK_INTERVAL: u64 = 50;

/// Create the bounded file queue connecting the reader to the consumer.
pub fn file_queue() -> (mpsc::Sender<Vec<u16>>, mpsc::Receiver<Vec<u16>>) {
    mpsc::channel(FILE_QUEUE_CAPACITY)
}

/// Totals and per-host outcomes of one run.
#[derive(Debug)]
pub struct RunSummary {
    /// Records that survived deduplication and were handed to the compressor.
    pub reports: u64,
    /// Bytes handed to the writers (compressed size in compressing mode).
    pub compressed_bytes: u64,
    pub duration: Duration,
    pub hosts: Vec<HostReport>,
}

impl RunSummary {
    pub fn failed_hosts(&self) -> usize {
        self.hosts.iter().filter(|report| !report.is_success()).count()
    }
}

enum LoopExit {
    Sentinel,
    AllHostsFailed,
    Fatal(PipelineError),
}

/// Consume the file queue until the end sentinel and upload everything to
/// all configured hosts.
pub async fn run(
    options: &Options,
    mut queue: mpsc::Receiver<Vec<u16>>,
) -> Result<RunSummary, PipelineError> {
    let start_time = Instant::now();

    let tls = match TlsSettings::build(options) {
        Ok(tls) => tls,
        Err(err) => {
            // Unblock the reader before propagating.
            drain_queue(&mut queue).await;
            return Err(err.into());
        }
    };

    let mut writers: Vec<WriterHandle> = options
        .hosts
        .iter()
        .map(|host| WriterHandle::spawn(host.clone(), tls.connector_for(host), options.timeout))
        .collect();

    let mut parser = LogParser::new();
    let mut dedup = DedupCache::default();
    let mut compressor = FrameCompressor::new(options.compress);

    let mut reports = 0u64;
    let mut compressed_bytes = 0u64;
    let mut batch: Vec<u8> = Vec::new();
    let mut iteration = 0u64;

    let exit = loop {
        let Some(log) = queue.recv().await else {
            // The reader half is gone; treat it like the sentinel.
            break LoopExit::Sentinel;
        };
        if log.is_empty() {
            break LoopExit::Sentinel;
        }

        let parsed = parser.parse(&log);
        batch.clear();
        for record in parsed.records() {
            if dedup.add_if_absent(record.key) {
                batch.extend_from_slice(record.bytes);
                reports += 1;
            }
        }

        if !batch.is_empty() {
            match compressor.push_chunk(&batch) {
                Ok(Some(ready)) => {
                    compressed_bytes += ready.len() as u64;
                    push_to_writers(&writers, &ready);
                }
                Ok(None) => {}
                Err(err) => break LoopExit::Fatal(err),
            }
        }

        iteration += 1;
        if iteration % QUORUM_CHECK_INTERVAL == 0
            && writers.iter().all(WriterHandle::has_failed)
        {
            break LoopExit::AllHostsFailed;
        }
    };

    let mut fatal = None;
    match exit {
        LoopExit::Sentinel => match compressor.finalize() {
            Ok(Some(tail)) => {
                compressed_bytes += tail.len() as u64;
                push_to_writers(&writers, &tail);
            }
            Ok(None) => {}
            Err(err) => fatal = Some(err),
        },
        LoopExit::AllHostsFailed => {
            warn!("all uploads failed, processing stopped early");
            drain_queue(&mut queue).await;
        }
        LoopExit::Fatal(err) => {
            drain_queue(&mut queue).await;
            fatal = Some(err);
        }
    }

    for writer in &mut writers {
        writer.shutdown();
    }
    let hosts = join_all(writers.into_iter().map(WriterHandle::finish)).await;
    debug!(
        reports,
        compressed_bytes,
        failed_hosts = hosts.iter().filter(|report| !report.is_success()).count(),
        "pipeline finished"
    );

    match fatal {
        Some(err) => Err(err),
        None => Ok(RunSummary {
            reports,
            compressed_bytes,
            duration: start_time.elapsed(),
            hosts,
        }),
    }
}

fn push_to_writers(writers: &[WriterHandle], buf: &Bytes) {
    for writer in writers {
        writer.push_buffer(buf.clone());
    }
}

/// Close the queue and discard whatever the reader still delivers, so its
/// spin-enqueue loop terminates.
async fn drain_queue(queue: &mut mpsc::Receiver<Vec<u16>>) {
    queue.close();
    while queue.recv().await.is_some() {}
}
