//! A single-producer/single-consumer lock-free byte ring buffer, used
//! as the TX/RX staging buffer inside
//! [`crate::message_transport::MessageTransport`]. Exposes gather-buffer
//! ("first read/write array") views and a `pop_until` scan rather than
//! a plain push/pop API, so a caller can write or read directly into
//! the ring's backing storage without an intermediate copy.
//!
//! The buffer is split into a [`Producer`] and a [`Consumer`] handle so
//! that the single-writer/single-reader discipline is enforced by the
//! type system rather than by caller convention.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pads a cursor to its own cache line so the producer's and consumer's
/// indices never share a cache line (avoids false sharing under
/// concurrent access).
#[repr(align(64))]
struct CachePadded<T>(T);

struct Shared {
    // Storage is `capacity + 1` bytes: one slot is always left empty so
    // that `read_index == write_index` is an unambiguous "empty" signal
    // and never collides with "full".
    storage: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    read_index: CachePadded<AtomicUsize>,
    write_index: CachePadded<AtomicUsize>,
}

// SAFETY: `storage` is only ever written through `Producer` (single
// writer) and only ever read through `Consumer` (single reader); the
// atomic indices provide the acquire/release synchronization between
// the two halves.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Creates a ring buffer with the given usable capacity (in bytes) and
/// returns its producer/consumer halves.
pub fn ring_buffer(capacity: usize) -> (Producer, Consumer) {
    assert!(capacity > 0, "ring buffer capacity must be non-zero");
    let storage_len = capacity + 1;
    let mut storage = Vec::with_capacity(storage_len);
    for _ in 0..storage_len {
        storage.push(UnsafeCell::new(0u8));
    }
    let shared = Arc::new(Shared {
        storage: storage.into_boxed_slice(),
        capacity,
        read_index: CachePadded(AtomicUsize::new(0)),
        write_index: CachePadded(AtomicUsize::new(0)),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer { shared },
    )
}

impl Shared {
    fn storage_len(&self) -> usize {
        self.storage.len()
    }

    fn size(&self, read: usize, write: usize) -> usize {
        if write >= read {
            write - read
        } else {
            self.storage_len() - read + write
        }
    }

    fn free(&self, read: usize, write: usize) -> usize {
        self.capacity - self.size(read, write)
    }

    /// # Safety
    /// Caller must only call this from the producer side.
    unsafe fn slot_mut(&self, index: usize) -> *mut u8 {
        self.storage[index].get()
    }

    /// # Safety
    /// Caller must only call this from the consumer side.
    unsafe fn slot(&self, index: usize) -> u8 {
        unsafe { *self.storage[index].get() }
    }
}

/// The write half of a ring buffer.
pub struct Producer {
    shared: Arc<Shared>,
}

/// SAFETY: `Producer` only ever touches storage slots between
/// `write_index` and `read_index`, and only advances `write_index` with
/// `Release` after the bytes are written, so handing it to another
/// thread (but keeping it single-owner) is sound.
unsafe impl Send for Producer {}

impl Producer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn free_space(&self) -> usize {
        let read = self.shared.read_index.0.load(Ordering::Acquire);
        let write = self.shared.write_index.0.load(Ordering::Relaxed);
        self.shared.free(read, write)
    }

    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Copies as much of `data` as fits into the buffer. Returns the
    /// number of bytes actually written (may be fewer than `data.len()`
    /// if the buffer is close to full).
    pub fn write(&self, data: &[u8]) -> usize {
        let mut written = 0;
        while written < data.len() {
            let n = self.write_span(&data[written..]);
            if n == 0 {
                break;
            }
            written += n;
        }
        written
    }

    fn write_span(&self, data: &[u8]) -> usize {
        let slice = self.first_write_array();
        let n = slice.len().min(data.len());
        if n == 0 {
            return 0;
        }
        slice[..n].copy_from_slice(&data[..n]);
        self.commit_first_write_array(n);
        n
    }

    /// Returns a mutable view over the first contiguous writable span.
    /// Since the underlying storage wraps, a write that would cross the
    /// end of the storage must be issued as two calls (write the first
    /// span, commit it, then call again for the remainder).
    pub fn first_write_array(&self) -> &mut [u8] {
        let read = self.shared.read_index.0.load(Ordering::Acquire);
        let write = self.shared.write_index.0.load(Ordering::Relaxed);
        let storage_len = self.shared.storage_len();
        let free = self.shared.free(read, write);
        if free == 0 {
            return &mut [];
        }
        let contiguous = if write >= read {
            // Free space runs from `write` to the end of storage, unless
            // `read == 0` in which case the last slot must stay empty.
            let to_end = storage_len - write;
            if read == 0 { to_end - 1 } else { to_end }
        } else {
            read - write - 1
        };
        let len = contiguous.min(free);
        // SAFETY: `[write, write+len)` is disjoint from the consumer's
        // readable range by the free-space computation above, and only
        // the producer calls this method.
        unsafe {
            let ptr = self.shared.slot_mut(write);
            std::slice::from_raw_parts_mut(ptr, len)
        }
    }

    /// Advances the write cursor after the caller has written `n` bytes
    /// directly into the slice returned by [`Producer::first_write_array`].
    pub fn commit_first_write_array(&self, n: usize) {
        let write = self.shared.write_index.0.load(Ordering::Relaxed);
        let storage_len = self.shared.storage_len();
        let new_write = (write + n) % storage_len;
        self.shared.write_index.0.store(new_write, Ordering::Release);
    }
}

/// The read half of a ring buffer.
pub struct Consumer {
    shared: Arc<Shared>,
}

unsafe impl Send for Consumer {}

impl Consumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn size(&self) -> usize {
        let read = self.shared.read_index.0.load(Ordering::Relaxed);
        let write = self.shared.write_index.0.load(Ordering::Acquire);
        self.shared.size(read, write)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Copies as many bytes as available (up to `buf.len()`) out of the
    /// buffer. Returns the number of bytes read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut read_total = 0;
        while read_total < buf.len() {
            let span = self.first_read_array();
            if span.is_empty() {
                break;
            }
            let n = span.len().min(buf.len() - read_total);
            buf[read_total..read_total + n].copy_from_slice(&span[..n]);
            self.commit_first_read_array(n);
            read_total += n;
        }
        read_total
    }

    /// Drops up to `n` bytes from the front of the buffer without
    /// copying them anywhere. Returns the number of bytes actually
    /// discarded.
    pub fn discard(&self, n: usize) -> usize {
        let mut discarded = 0;
        while discarded < n {
            let span = self.first_read_array();
            if span.is_empty() {
                break;
            }
            let take = span.len().min(n - discarded);
            self.commit_first_read_array(take);
            discarded += take;
        }
        discarded
    }

    /// Returns a view over the first contiguous readable span. As with
    /// [`Producer::first_write_array`], a logically-contiguous read that
    /// wraps storage must be issued as two calls.
    pub fn first_read_array(&self) -> &[u8] {
        let read = self.shared.read_index.0.load(Ordering::Relaxed);
        let write = self.shared.write_index.0.load(Ordering::Acquire);
        let storage_len = self.shared.storage_len();
        let available = self.shared.size(read, write);
        if available == 0 {
            return &[];
        }
        let contiguous = if write >= read {
            write - read
        } else {
            storage_len - read
        };
        let len = contiguous.min(available);
        // SAFETY: `[read, read+len)` is disjoint from the producer's
        // writable range by the size computation above, and only the
        // consumer calls this method.
        unsafe {
            let ptr = self.shared.slot_mut(read);
            std::slice::from_raw_parts(ptr, len)
        }
    }

    /// Copies up to `max` buffered bytes from the front of the buffer
    /// without consuming them, handling the wrap the way
    /// [`Consumer::first_read_array`] alone cannot when the peeked range
    /// spans the end of storage. Used by the message transport to sniff
    /// a size field before committing to consuming it.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        let read = self.shared.read_index.0.load(Ordering::Relaxed);
        let write = self.shared.write_index.0.load(Ordering::Acquire);
        let storage_len = self.shared.storage_len();
        let available = self.shared.size(read, write).min(max);
        let mut out = Vec::with_capacity(available);
        for i in 0..available {
            let idx = (read + i) % storage_len;
            // SAFETY: `idx` is within the consumer's readable range.
            out.push(unsafe { self.shared.slot(idx) });
        }
        out
    }

    /// Advances the read cursor after the caller has consumed `n` bytes
    /// from the slice returned by [`Consumer::first_read_array`].
    pub fn commit_first_read_array(&self, n: usize) {
        let read = self.shared.read_index.0.load(Ordering::Relaxed);
        let storage_len = self.shared.storage_len();
        let new_read = (read + n) % storage_len;
        self.shared.read_index.0.store(new_read, Ordering::Release);
    }

    /// Scans byte-by-byte for the first index `i` where `predicate(byte)`
    /// is true, and if found, returns the bytes from the front of the
    /// buffer up to and including that byte, removing them from the
    /// buffer. Returns `None` (without consuming anything) if no
    /// matching byte is currently buffered.
    pub fn pop_until(&self, mut predicate: impl FnMut(u8) -> bool) -> Option<Vec<u8>> {
        let read = self.shared.read_index.0.load(Ordering::Relaxed);
        let write = self.shared.write_index.0.load(Ordering::Acquire);
        let storage_len = self.shared.storage_len();
        let available = self.shared.size(read, write);
        let mut found_at = None;
        for i in 0..available {
            let idx = (read + i) % storage_len;
            // SAFETY: `idx` is within the consumer's readable range.
            let byte = unsafe { self.shared.slot(idx) };
            if predicate(byte) {
                found_at = Some(i + 1);
                break;
            }
        }
        let len = found_at?;
        let mut out = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let span = self.first_read_array();
            let n = span.len().min(remaining);
            out.extend_from_slice(&span[..n]);
            self.commit_first_read_array(n);
            remaining -= n;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let (producer, consumer) = ring_buffer(8);
        assert_eq!(producer.write(b"hello"), 5);
        let mut buf = [0u8; 5];
        assert_eq!(consumer.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert!(consumer.is_empty());
    }

    #[test]
    fn write_saturates_at_capacity() {
        let (producer, consumer) = ring_buffer(4);
        assert_eq!(producer.write(b"abcdef"), 4);
        assert!(producer.is_full());
        let mut buf = [0u8; 4];
        assert_eq!(consumer.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn wraps_around_storage() {
        let (producer, consumer) = ring_buffer(4);
        assert_eq!(producer.write(b"ab"), 2);
        let mut buf = [0u8; 2];
        assert_eq!(consumer.read(&mut buf), 2);
        assert_eq!(producer.write(b"cdef"), 4);
        let mut buf = [0u8; 4];
        assert_eq!(consumer.read(&mut buf), 4);
        assert_eq!(&buf, b"cdef");
    }

    #[test]
    fn discard_drops_without_copying() {
        let (producer, consumer) = ring_buffer(8);
        producer.write(b"abcdef");
        assert_eq!(consumer.discard(3), 3);
        let mut buf = [0u8; 3];
        assert_eq!(consumer.read(&mut buf), 3);
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn pop_until_finds_delimiter() {
        let (producer, consumer) = ring_buffer(16);
        producer.write(b"abc\ndef");
        let line = consumer.pop_until(|b| b == b'\n').unwrap();
        assert_eq!(line, b"abc\n");
        assert_eq!(consumer.size(), 3);
    }

    #[test]
    fn pop_until_returns_none_without_consuming() {
        let (producer, consumer) = ring_buffer(16);
        producer.write(b"no newline here");
        assert!(consumer.pop_until(|b| b == b'\n').is_none());
        assert_eq!(consumer.size(), 16.min(b"no newline here".len()));
    }

    #[test]
    fn concurrent_spsc_producer_consumer() {
        let (producer, consumer) = ring_buffer(37);
        let total = 200_000usize;
        let writer = std::thread::spawn(move || {
            let mut sent = 0u8;
            let mut remaining = total;
            while remaining > 0 {
                let chunk = [sent; 1];
                if producer.write(&chunk) == 1 {
                    sent = sent.wrapping_add(1);
                    remaining -= 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });
        let reader = std::thread::spawn(move || {
            let mut expected = 0u8;
            let mut remaining = total;
            let mut buf = [0u8; 1];
            while remaining > 0 {
                if consumer.read(&mut buf) == 1 {
                    assert_eq!(buf[0], expected);
                    expected = expected.wrapping_add(1);
                    remaining -= 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
