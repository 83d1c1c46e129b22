// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Option surface consumed by the pipeline core.
//!
//! The command-line layer owns parsing and default resolution (platform
//! directories in particular); the pipeline only ever sees this struct.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

/// Default collector endpoint.
pub const DEFAULT_HOST: &str = "chatload.bloecher.dev";
pub const DEFAULT_PORT: u16 = 36643;

/// Default upload timeout, armed once streaming begins.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A single collector endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub port: u16,
    /// Disables peer certificate and hostname verification for this host only.
    pub insecure_tls: bool,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Host {
            name: name.into(),
            port,
            insecure_tls: false,
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Host::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The default port is elided, matching the user-facing host notation.
        if self.port == DEFAULT_PORT {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

/// Options consumed by the pipeline core.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory scanned for chat logs. Resolved by the caller.
    pub log_dir: PathBuf,
    /// Filename mtime cache location; `None` disables caching silently.
    pub cache_path: Option<PathBuf>,
    pub use_cache: bool,
    /// Only filenames matching this pattern are read.
    pub filename_regex: Regex,
    pub verbose: bool,
    /// Collector endpoints; every upload goes to all of them.
    pub hosts: Vec<Host>,
    /// Extra PEM trust material, loaded on top of the platform trust store.
    pub ca_file: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    /// Restrict TLSv1.2 cipher suites to the named ones (colon/comma separated).
    pub cipher_list: Option<String>,
    /// Restrict TLSv1.3 cipher suites to the named ones (colon/comma separated).
    pub ciphersuites: Option<String>,
    pub timeout: Duration,
    /// LZ4 frame compression of the report stream; raw pass-through when off.
    pub compress: bool,
}

impl Default for Options {
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Options {
            log_dir: PathBuf::new(),
            cache_path: None,
            use_cache: true,
            filename_regex: Regex::new(".*").expect("literal regex"),
            verbose: false,
            hosts: vec![Host::default()],
            ca_file: None,
            ca_path: None,
            cipher_list: None,
            ciphersuites: None,
            timeout: DEFAULT_TIMEOUT,
            compress: true,
        }
    }
}
