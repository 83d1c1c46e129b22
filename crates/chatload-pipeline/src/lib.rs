// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Chatload Pipeline
//!
//! Core data path of the chatload client: discover chat logs on disk, parse
//! them into per-channel character activity reports, and stream those reports
//! to one or more collector endpoints over TLS.
//!
//! ## Architecture
//!
//! ```text
//!   Reader thread                Consumer thread (current-thread runtime)
//!   ┌────────────┐   bounded    ┌────────┐  ┌───────┐  ┌────────────┐
//!   │ scan + load│ ──────────▶  │ parser │─▶│ dedup │─▶│ compressor │
//!   └────────────┘   queue(30)  └────────┘  └───────┘  └─────┬──────┘
//!                                                            │ fan-out
//!                                               ┌────────────┼────────────┐
//!                                               v            v            v
//!                                           TLS writer   TLS writer   TLS writer
//! ```
//!
//! The library is organized into one module per pipeline stage:
//! - [`reader`]: directory enumeration, mtime cache, UTF-16LE loading
//! - [`parser`]: log grammar and per-channel aggregation
//! - [`dedup`]: lossy fixed-size duplicate suppression
//! - [`compress`]: streaming LZ4 frame compression (or pass-through)
//! - [`writer`]: per-host TLS upload state machine
//! - [`pipeline`]: the orchestrator tying the stages together
//!
//! Hosts fail independently: a dead collector never stops uploads to the
//! remaining ones.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod compress;
pub mod dedup;
pub mod error;
pub mod filecache;
pub mod options;
pub mod parser;
pub mod pipeline;
pub mod reader;
pub mod tls;
pub mod writer;

pub use error::{PipelineError, UploadError};
pub use options::{Host, Options};
pub use pipeline::{file_queue, RunSummary};
pub use reader::ReadStats;
pub use writer::HostReport;
