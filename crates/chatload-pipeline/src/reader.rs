// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log discovery and loading.
//!
//! Runs synchronously on its own OS thread: enumerate the log directory,
//! skip files the mtime cache has already seen, load the rest as UTF-16LE
//! code units, and hand them to the consumer through the bounded file queue.
//! An empty code-unit sequence is the end-of-input sentinel.
//!
//! Backpressure is the queue's capacity: when it is full the reader spins on
//! `try_send`, yielding the thread between attempts.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::filecache::{self, FileCache};
use crate::options::Options;

/// Sending side of the file queue; payloads are UTF-16 code-unit sequences.
pub type LogSender = Sender<Vec<u16>>;

/// Totals reported by the reader at end of scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadStats {
    pub files_read: u64,
    pub bytes_read: u64,
    pub duration: Duration,
}

/// Metadata of one accepted log file, as passed to the progress callback.
#[derive(Debug, Clone)]
pub struct LogFile {
    pub name: String,
    pub size: u64,
    pub mtime: u64,
}

/// Scan the log directory and enqueue every new matching file, then the end
/// sentinel. A directory that cannot be opened is fatal (the sentinel is
/// still enqueued so the consumer terminates); unreadable files are skipped.
pub fn read_logs(
    options: &Options,
    queue: &LogSender,
    mut progress: Option<&mut dyn FnMut(&LogFile)>,
) -> Result<ReadStats, PipelineError> {
    let start_time = Instant::now();
    let mut stats = ReadStats::default();

    let mut cache = match (&options.cache_path, options.use_cache) {
        (Some(path), true) => filecache::load(path),
        _ => FileCache::new(),
    };

    let entries = match fs::read_dir(&options.log_dir) {
        Ok(entries) => entries,
        Err(source) => {
            enqueue(queue, Vec::new());
            return Err(PipelineError::Directory {
                dir: options.log_dir.clone(),
                source,
            });
        }
    };

    for entry in entries.flatten() {
        // `DirEntry::file_type` does not follow symlinks, which excludes
        // them along with directories.
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !options.filename_regex.is_match(&name) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Some(mtime) = modified_epoch(&metadata) else {
            continue;
        };
        if cache.get(&name).is_some_and(|&seen| seen >= mtime) {
            continue;
        }

        let Some(units) = load_utf16le(&entry.path()) else {
            debug!(file = %name, "skipping unreadable or malformed log");
            continue;
        };
        if !enqueue(queue, units) {
            // The consumer bailed out; stop reading but still save the cache.
            warn!("file queue closed, aborting scan");
            break;
        }

        cache.insert(name.clone(), mtime);
        stats.files_read += 1;
        stats.bytes_read += metadata.len();
        if let Some(callback) = progress.as_deref_mut() {
            callback(&LogFile {
                name,
                size: metadata.len(),
                mtime,
            });
        }
    }

    enqueue(queue, Vec::new());

    if options.use_cache {
        if let Some(path) = &options.cache_path {
            if let Err(err) = filecache::save(&cache, path) {
                warn!(path = %path.display(), error = %err, "failed to save filename cache");
            }
        }
    }

    stats.duration = start_time.elapsed();
    Ok(stats)
}

/// Spin on `try_send` until the buffer is accepted. Returns `false` if the
/// consumer dropped the queue.
fn enqueue(queue: &LogSender, mut units: Vec<u16>) -> bool {
    loop {
        match queue.try_send(units) {
            Ok(()) => return true,
            Err(TrySendError::Full(rejected)) => {
                units = rejected;
                std::thread::yield_now();
            }
            Err(TrySendError::Closed(_)) => return false,
        }
    }
}

fn modified_epoch(metadata: &fs::Metadata) -> Option<u64> {
    let modified = metadata.modified().ok()?;
    let since_epoch = modified.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs())
}

/// Load a BOM-prefixed UTF-16LE file as code units. Rejects files without
/// content past the BOM (an empty sequence is reserved for the sentinel) and
/// files of odd length.
fn load_utf16le(path: &Path) -> Option<Vec<u16>> {
    let bytes = fs::read(path).ok()?;
    if bytes.len() <= 2 || bytes.len() % 2 != 0 {
        return None;
    }

    let mut units = Vec::with_capacity((bytes.len() - 2) / 2);
    for pair in bytes[2..].chunks_exact(2) {
        units.push(u16::from_le_bytes([pair[0], pair[1]]));
    }
    Some(units)
}
