// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming LZ4 frame compression of the report stream.
//!
//! Records are fed in per-file chunks and come out as LZ4 frame fragments:
//! 64 KiB maximum block size, linked blocks, content checksum at the frame
//! end. The encoder buffers input internally, so a chunk only produces
//! output once a block boundary is crossed; [`FrameCompressor::finalize`]
//! emits the frame terminator.
//!
//! The pass-through variant ships records uncompressed through the same
//! interface, so the network path works identically either way.

use std::io::{self, Write};
use std::mem;

use bytes::Bytes;
use lz4_flex::frame::{BlockMode, BlockSize, FrameEncoder, FrameInfo};

use crate::error::PipelineError;

/// Streaming report compressor: a real LZ4 frame encoder or a pass-through.
pub enum FrameCompressor {
    Lz4(FrameEncoder<Vec<u8>>),
    PassThrough,
}

impl FrameCompressor {
    pub fn new(compress: bool) -> Self {
        if compress {
            let info = FrameInfo::new()
                .block_size(BlockSize::Max64KB)
                .block_mode(BlockMode::Linked)
                .content_checksum(true);
            FrameCompressor::Lz4(FrameEncoder::with_frame_info(info, Vec::new()))
        } else {
            FrameCompressor::PassThrough
        }
    }

    /// Whether compression is actually taking place.
    pub fn is_active(&self) -> bool {
        matches!(self, FrameCompressor::Lz4(_))
    }

    /// Hand the compressor a chunk of record bytes. Returns a ready output
    /// buffer whenever block accumulation crossed a boundary (the frame
    /// header rides along with the first one).
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Option<Bytes>, PipelineError> {
        match self {
            FrameCompressor::Lz4(encoder) => {
                encoder
                    .write_all(chunk)
                    .map_err(PipelineError::Compressor)?;
                Ok(take_ready(encoder.get_mut()))
            }
            FrameCompressor::PassThrough => {
                if chunk.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Bytes::copy_from_slice(chunk)))
                }
            }
        }
    }

    /// Emit the terminating block and content checksum.
    pub fn finalize(self) -> Result<Option<Bytes>, PipelineError> {
        match self {
            FrameCompressor::Lz4(encoder) => {
                let sink = encoder
                    .finish()
                    .map_err(|err| PipelineError::Compressor(io::Error::other(err)))?;
                if sink.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Bytes::from(sink)))
                }
            }
            FrameCompressor::PassThrough => Ok(None),
        }
    }
}

fn take_ready(sink: &mut Vec<u8>) -> Option<Bytes> {
    if sink.is_empty() {
        None
    } else {
        Some(Bytes::from(mem::take(sink)))
    }
}
