// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scatter/gather assembly for PDU serialization.
//!
//! A PDU leaves the target as up to four kinds of spans: header (+ header
//! digest), zero padding up to `pdo`, the data iovs, and the data-digest
//! word. [`IovCursor`] walks those spans with a running offset so a short
//! write can resume exactly where the socket stopped, and reports the total
//! mapped length so the sender can detect truncation.

use std::io::IoSlice;

/// Maximum number of data descriptors a single PDU may reference; callers
/// provide an output table of at least `MAX_SGL_DESCRIPTORS + 2` entries to
/// leave room for the header and digest spans.
pub const MAX_SGL_DESCRIPTORS: usize = 16;

/// Largest supported `pdo` padding run (CPDA is capped at 31, i.e. 128-byte
/// alignment).
static ZERO_PAD: [u8; 128] = [0u8; 128];

/// A `(skip, total)` pair driving span-by-span iov assembly.
///
/// `skip` swallows the bytes already written in a previous attempt;
/// `total` accumulates the length of everything mapped this time.
#[derive(Debug, Default, Clone, Copy)]
pub struct IovCursor {
    skip: usize,
    total: usize,
}

impl IovCursor {
    pub fn at_offset(offset: usize) -> Self {
        Self { skip: offset, total: 0 }
    }

    /// Bytes mapped into the output table so far.
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Append `span`, honouring the resume offset. Returns `false` once the
    /// output table is full and assembly must stop.
    pub fn append<'a>(
        &mut self,
        out: &mut Vec<IoSlice<'a>>,
        max_iovs: usize,
        span: &'a [u8],
    ) -> bool {
        if self.skip >= span.len() {
            self.skip -= span.len();
            return true;
        }
        let tail = &span[self.skip..];
        self.skip = 0;
        out.push(IoSlice::new(tail));
        self.total += tail.len();
        out.len() < max_iovs
    }
}

/// Assemble the wire image of one PDU into `out`.
///
/// Layout: header (+ optional header digest, already part of `header`),
/// `padding` zero bytes, each data span, then the optional data-digest word.
/// `writev_offset` resumes after a short write. Returns the mapped length;
/// callers compare it against `plen - writev_offset` to detect an output
/// table too small for the remaining spans.
pub fn build_iovs<'a>(
    out: &mut Vec<IoSlice<'a>>,
    max_iovs: usize,
    header: &'a [u8],
    padding: usize,
    data: &'a [&'a [u8]],
    ddgst: Option<&'a [u8; 4]>,
    writev_offset: usize,
) -> usize {
    debug_assert!(padding <= ZERO_PAD.len());
    let mut cur = IovCursor::at_offset(writev_offset);

    if !cur.append(out, max_iovs, header) {
        return cur.total();
    }
    if padding > 0 && !cur.append(out, max_iovs, &ZERO_PAD[..padding]) {
        return cur.total();
    }
    for span in data {
        if !cur.append(out, max_iovs, span) {
            return cur.total();
        }
    }
    if let Some(word) = ddgst {
        cur.append(out, max_iovs, word.as_slice());
    }
    cur.total()
}

/// Consume-side cursor: copy an inbound byte run into a destination iov list
/// starting at a logical offset. Used when H2C_DATA payload lands in request
/// buffers at `datao`.
pub fn copy_into_iovs(dst: &mut [&mut [u8]], mut offset: usize, mut src: &[u8]) -> usize {
    let mut copied = 0usize;
    for iov in dst.iter_mut() {
        if src.is_empty() {
            break;
        }
        if offset >= iov.len() {
            offset -= iov.len();
            continue;
        }
        let space = iov.len() - offset;
        let take = space.min(src.len());
        iov[offset..offset + take].copy_from_slice(&src[..take]);
        offset = 0;
        copied += take;
        src = &src[take..];
    }
    copied
}
