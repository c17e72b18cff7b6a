// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CRC32C digests for PDU headers and data segments.
//!
//! NVMe/TCP uses the reflected CRC32C polynomial with initial value
//! `0xFFFFFFFF` and final XOR `0xFFFFFFFF`; digest words travel little-endian
//! on the wire. The `crc32c` crate implements exactly this (Castagnoli), so
//! the helpers below only add the multi-part accumulation and the zero-pad
//! to 4-byte alignment required for data digests.

use std::{future::Future, pin::Pin, sync::Arc};

use crc32c::crc32c_append;

use crate::pdu::common::DIGEST_LEN;

#[inline]
fn pad_len(n: usize) -> usize {
    (DIGEST_LEN - (n % DIGEST_LEN)) % DIGEST_LEN
}

#[inline]
fn crc32c_of_parts(parts: &[&[u8]]) -> u32 {
    let mut acc = 0u32;
    for p in parts {
        if !p.is_empty() {
            acc = crc32c_append(acc, p);
        }
    }
    acc
}

/// Digest over the full PDU header (common + type-specific), `hlen` bytes.
#[inline]
pub fn calc_header_digest(header: &[u8]) -> u32 {
    crc32c_of_parts(&[header])
}

/// Digest over a data segment spread across iovs, zero-padded to the digest
/// alignment. The padding participates in the CRC but is never sent.
pub fn calc_data_digest(iovs: &[&[u8]]) -> u32 {
    let mut acc = crc32c_of_parts(iovs);
    let total: usize = iovs.iter().map(|p| p.len()).sum();
    let pad = pad_len(total);
    if pad != 0 {
        let zeros = [0u8; 3];
        acc = crc32c_append(acc, &zeros[..pad]);
    }
    acc
}

/// Incremental data-digest accumulator for the receive path, where payload
/// bytes are copied into request buffers chunk by chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestAccum {
    crc: u32,
    len: usize,
}

impl DigestAccum {
    pub fn update(&mut self, chunk: &[u8]) {
        if !chunk.is_empty() {
            self.crc = crc32c_append(self.crc, chunk);
            self.len += chunk.len();
        }
    }

    /// Finalize: apply the zero padding for the bytes seen so far.
    pub fn finish(self) -> u32 {
        let pad = pad_len(self.len);
        if pad == 0 {
            self.crc
        } else {
            let zeros = [0u8; 3];
            crc32c_append(self.crc, &zeros[..pad])
        }
    }
}

/// Serialize a digest word the way it travels on the wire.
#[inline]
pub fn digest_to_wire(crc: u32) -> [u8; DIGEST_LEN] {
    crc.to_le_bytes()
}

/// Parse a wire digest word.
#[inline]
pub fn digest_from_wire(bytes: [u8; DIGEST_LEN]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// Pluggable digest engine. CRC32C may be computed synchronously or shipped
/// to an accelerator channel; the poll group installs whichever it owns and
/// the send path stays oblivious.
pub type DigestFuture<'a> = Pin<Box<dyn Future<Output = u32> + Send + 'a>>;

pub trait DigestEngine: Send + Sync {
    fn data_digest<'a>(&'a self, iovs: &'a [&'a [u8]]) -> DigestFuture<'a>;
}

/// Default software engine backed by [`calc_data_digest`].
#[derive(Debug, Default)]
pub struct SoftwareDigest;

impl DigestEngine for SoftwareDigest {
    fn data_digest<'a>(&'a self, iovs: &'a [&'a [u8]]) -> DigestFuture<'a> {
        Box::pin(std::future::ready(calc_data_digest(iovs)))
    }
}

pub type SharedDigestEngine = Arc<dyn DigestEngine>;
