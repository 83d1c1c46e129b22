// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;

/// Per-host upload failures.
///
/// A writer stores the first error it observes and ignores everything after
/// it; the orchestrator collects these into the end-of-run host reports.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("server does not support this client's version of the chatload protocol")]
    ProtocolVersionNotSupported,

    #[error("server sent command {0:#010x}, which is not part of the negotiated chatload protocol")]
    UnknownCommand(u32),

    #[error("server initiated a connection shutdown mid-stream")]
    ServerShutdown,

    #[error("connection timeout exceeded")]
    Timeout,

    #[error("hostname resolution failed: {0}")]
    Resolve(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures that stop the whole pipeline, as opposed to a single host.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to search for logs in {dir}: {source}")]
    Directory {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to build TLS context: {0}")]
    TlsSetup(#[from] crate::tls::TlsSetupError),

    #[error("compression failed: {0}")]
    Compressor(#[source] io::Error),
}
