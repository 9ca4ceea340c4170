// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A small ring of pre-allocated byte buffers (the buffer-reuse design),
//! so the hot RTP receive path doesn't allocate per packet.

use bytes::BytesMut;

/// Default pool depth and per-buffer capacity: 8 x 2048.
pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;

/// A bounded ring of reusable [BytesMut] buffers. Ownership: buffers are
/// owned by the [super::Transport] that holds the pool, lent out via
/// [Pool::take] for the duration of one read, and [Pool::give_back] when the
/// caller is done with it (normally: once the processor has copied out or
/// consumed the data it needed).
pub struct Pool {
    capacity: usize,
    free: Vec<BytesMut>,
}

impl Pool {
    pub fn new(size: usize, capacity: usize) -> Self {
        let mut free = Vec::with_capacity(size);
        for _ in 0..size {
            free.push(BytesMut::with_capacity(capacity));
        }
        Self { capacity, free }
    }

    /// Takes a buffer from the pool, allocating a new one if the pool is
    /// momentarily exhausted (e.g. many in-flight reads on a busy stream).
    pub fn take(&mut self) -> BytesMut {
        self.free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity))
    }

    /// Returns a buffer to the pool for reuse, clearing its contents first.
    /// Buffers that grew beyond a few multiples of the original capacity are
    /// dropped rather than recycled, so one oversized packet doesn't pin
    /// excess memory in the pool forever.
    pub fn give_back(&mut self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() <= self.capacity * 4 && self.free.len() < self.free.capacity() {
            self.free.push(buf);
        }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE, DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_give_back_reuses_buffer() {
        let mut pool = Pool::new(2, 64);
        assert_eq!(pool.len(), 2);
        let mut buf = pool.take();
        assert_eq!(pool.len(), 1);
        buf.extend_from_slice(b"hello");
        pool.give_back(buf);
        assert_eq!(pool.len(), 2);
        let buf2 = pool.take();
        assert!(buf2.is_empty());
    }

    #[test]
    fn exhausted_pool_allocates_fresh_buffer() {
        let mut pool = Pool::new(1, 16);
        let _a = pool.take();
        let b = pool.take();
        assert_eq!(b.capacity(), 16);
    }

    #[test]
    fn oversized_buffer_is_not_recycled() {
        let mut pool = Pool::new(1, 16);
        let mut buf = pool.take();
        buf.extend_from_slice(&[0u8; 1000]);
        let cap = buf.capacity();
        assert!(cap > 16 * 4);
        pool.give_back(buf);
        assert_eq!(pool.len(), 0);
    }
}
