/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use log::warn;

use crate::real::TraceFile;

/// Default arena capacity.
pub const MEMBUF_CAPACITY: usize = 6 * 1024 * 1024;

/// Fixed-capacity byte arena that batches record bytes before the real
/// `fwrite`. All encoders emit through this buffer; the flush path must
/// never reach an intercepted call.
pub struct MemBuf {
    buffer: Box<[u8]>,
    pos: usize,
}

impl MemBuf {
    pub fn new() -> Self {
        MemBuf::with_capacity(MEMBUF_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MemBuf {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
        }
    }

    /// Buffer `bytes`, flushing as needed. A chunk at least as large as
    /// the arena is flushed around: the buffer is drained and the chunk
    /// goes straight to the file so the arena never grows.
    pub fn append(&mut self, bytes: &[u8], out: &TraceFile) {
        if bytes.len() >= self.buffer.len() {
            self.flush(out);
            if !out.write(bytes) {
                warn!("short write of oversized {}-byte record chunk", bytes.len());
            }
            return;
        }
        if self.pos + bytes.len() >= self.buffer.len() {
            self.flush(out);
        }
        self.buffer[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// Write the buffered bytes through the real call table and reset.
    pub fn flush(&mut self, out: &TraceFile) {
        if self.pos > 0 && !out.write(&self.buffer[..self.pos]) {
            warn!("short write of {}-byte trace buffer", self.pos);
        }
        self.pos = 0;
    }

    /// Release the backing storage. The caller flushes beforehand;
    /// anything still buffered is dropped.
    pub fn destroy(&mut self) {
        self.buffer = Vec::new().into_boxed_slice();
        self.pos = 0;
    }

    pub fn buffered(&self) -> usize {
        self.pos
    }
}

impl Default for MemBuf {
    fn default() -> Self {
        MemBuf::new()
    }
}
