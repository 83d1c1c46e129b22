// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filename write-time cache.
//!
//! Persists `{filename → last-seen mtime}` across runs so unchanged logs are
//! skipped entirely. The on-disk format is one tab-separated entry per line:
//! `name\tmtime\n`. Log filenames never contain tabs or newlines.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

pub type FileCache = HashMap<String, u64>;

/// Load a cache file. A missing or unreadable file yields an empty cache;
/// malformed lines are skipped silently.
pub fn load(path: &Path) -> FileCache {
    let Ok(contents) = fs::read_to_string(path) else {
        return FileCache::new();
    };

    let mut cache = FileCache::new();
    for line in contents.lines() {
        let Some((name, mtime)) = line.split_once('\t') else {
            continue;
        };
        let Ok(mtime) = mtime.trim().parse::<u64>() else {
            continue;
        };
        // Duplicate names resolve to the last entry.
        cache.insert(name.to_owned(), mtime);
    }
    cache
}

/// Truncate-write the cache, creating missing ancestor directories first.
pub fn save(cache: &FileCache, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_ancestors(parent)?;
        }
    }

    let mut out = String::with_capacity(cache.len() * 32);
    for (name, mtime) in cache {
        out.push_str(name);
        out.push('\t');
        out.push_str(&mtime.to_string());
        out.push('\n');
    }
    fs::write(path, out)
}

#[cfg(unix)]
fn create_ancestors(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_ancestors(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}
