//! Many-to-one ring buffer carrying client commands to the driver.
//!
//! Producers (any number of client threads, in any process) claim space
//! with a CAS on the tail position, write their record, then publish it by
//! storing the record length with release semantics. The single consumer
//! (the driver conductor) reads from the head, zeroes what it consumed, and
//! advances the head with a release store.
//!
//! Record layout: `{ length: i32, msg_type_id: i32, payload... }`, records
//! aligned to 8 bytes. A padding record (`msg_type_id == -1`) fills the
//! tail of the buffer when a record would otherwise wrap.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::region::{align_up, Region};

/// Reserved message type id for padding records.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Record header: length (i32) then msg type id (i32).
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Records are aligned to the header length.
pub const RB_ALIGNMENT: usize = RECORD_HEADER_LENGTH;

/// Trailer appended after the data section (six cache-line-pair slots).
pub const RB_TRAILER_LENGTH: usize = size_of::<RingBufferDescriptor>();

/// Ring buffer trailer. Each counter sits on its own cache line pair so
/// producers hammering the tail do not invalidate the consumer's head line.
#[repr(C)]
pub struct RingBufferDescriptor {
    _begin_pad: [u8; 128],
    pub tail_position: AtomicI64,
    _tail_pad: [u8; 120],
    pub head_cache_position: AtomicI64,
    _head_cache_pad: [u8; 120],
    pub head_position: AtomicI64,
    _head_pad: [u8; 120],
    pub correlation_counter: AtomicI64,
    _correlation_pad: [u8; 120],
    pub consumer_heartbeat: AtomicI64,
    _heartbeat_pad: [u8; 120],
}

const _: () = assert!(size_of::<RingBufferDescriptor>() == 768);

/// Errors from ring buffer construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    /// Region too small for any capacity plus the trailer.
    TooSmall,
    /// Data capacity is not a power of two.
    CapacityNotPowerOfTwo,
}

impl std::fmt::Display for RingBufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooSmall => write!(f, "region too small for ring buffer"),
            Self::CapacityNotPowerOfTwo => write!(f, "ring capacity must be a power of two"),
        }
    }
}

impl std::error::Error for RingBufferError {}

/// Errors from a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingWriteError {
    /// Not enough space between tail and head.
    Full,
    /// Message exceeds `capacity / 8`.
    MessageTooLong,
    /// Type ids must be positive.
    InvalidTypeId,
}

impl std::fmt::Display for RingWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "ring buffer full"),
            Self::MessageTooLong => write!(f, "message exceeds max message length"),
            Self::InvalidTypeId => write!(f, "message type id must be positive"),
        }
    }
}

impl std::error::Error for RingWriteError {}

/// Many-writer, single-reader ring buffer over a shared region.
pub struct RingBuffer {
    buffer: Region,
    descriptor: *const RingBufferDescriptor,
    capacity: usize,
    max_message_length: usize,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Wrap a region of `capacity + RB_TRAILER_LENGTH` bytes where
    /// `capacity` is a power of two. The region must be zeroed when the
    /// ring is first created; attaching to a live ring is also done with
    /// this constructor.
    pub fn new(region: Region) -> Result<Self, RingBufferError> {
        if region.len() <= RB_TRAILER_LENGTH {
            return Err(RingBufferError::TooSmall);
        }
        let capacity = region.len() - RB_TRAILER_LENGTH;
        if !capacity.is_power_of_two() {
            return Err(RingBufferError::CapacityNotPowerOfTwo);
        }

        let descriptor = region.offset(capacity) as *const RingBufferDescriptor;

        Ok(Self {
            buffer: region.slice(0, capacity),
            descriptor,
            capacity,
            max_message_length: capacity / 8,
        })
    }

    #[inline]
    fn descriptor(&self) -> &RingBufferDescriptor {
        // SAFETY: constructor validated the region covers the trailer.
        unsafe { &*self.descriptor }
    }

    #[inline]
    fn length_field(&self, index: usize) -> &AtomicI32 {
        debug_assert!(index + RECORD_HEADER_LENGTH <= self.capacity);
        unsafe { &*(self.buffer.offset(index) as *const AtomicI32) }
    }

    #[inline]
    fn type_field(&self, index: usize) -> &AtomicI32 {
        unsafe { &*(self.buffer.offset(index + 4) as *const AtomicI32) }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    /// Claim space for an aligned record, inserting a padding record if the
    /// claim would wrap. Returns the record index.
    fn claim_capacity(&self, required: usize) -> Result<usize, RingWriteError> {
        let descriptor = self.descriptor();
        let mask = (self.capacity - 1) as i64;

        let mut head = descriptor.head_cache_position.load(Ordering::Relaxed);

        loop {
            let tail = descriptor.tail_position.load(Ordering::Acquire);
            let available = self.capacity as i64 - (tail - head);

            if (required as i64) > available {
                head = descriptor.head_position.load(Ordering::Acquire);
                if (required as i64) > self.capacity as i64 - (tail - head) {
                    return Err(RingWriteError::Full);
                }
                descriptor.head_cache_position.store(head, Ordering::Release);
            }

            let tail_index = (tail & mask) as usize;
            let to_end = self.capacity - tail_index;
            let mut padding = 0usize;

            if required > to_end {
                // Wrap: the record goes at index 0, padding covers the tail.
                let mut head_index = (head & mask) as usize;

                if required > head_index {
                    head = descriptor.head_position.load(Ordering::Acquire);
                    head_index = (head & mask) as usize;
                    if required > head_index {
                        return Err(RingWriteError::Full);
                    }
                    descriptor.head_cache_position.store(head, Ordering::Release);
                }

                padding = to_end;
            }

            if descriptor
                .tail_position
                .compare_exchange(
                    tail,
                    tail + (required + padding) as i64,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if padding != 0 {
                    self.type_field(tail_index).store(PADDING_MSG_TYPE_ID, Ordering::Relaxed);
                    self.length_field(tail_index).store(padding as i32, Ordering::Release);
                    return Ok(0);
                }
                return Ok(tail_index);
            }
        }
    }

    /// Write one message. Space is claimed atomically; the record becomes
    /// visible to the consumer only when the final release store of the
    /// length lands.
    pub fn write(&self, msg_type_id: i32, msg: &[u8]) -> Result<(), RingWriteError> {
        if msg_type_id < 1 {
            return Err(RingWriteError::InvalidTypeId);
        }
        if msg.len() > self.max_message_length {
            return Err(RingWriteError::MessageTooLong);
        }

        let record_length = msg.len() + RECORD_HEADER_LENGTH;
        let required = align_up(record_length, RB_ALIGNMENT);
        let index = self.claim_capacity(required)?;

        // Negative length blocks the consumer while the payload is copied.
        self.length_field(index).store(-(record_length as i32), Ordering::Release);
        self.type_field(index).store(msg_type_id, Ordering::Relaxed);
        unsafe {
            std::ptr::copy_nonoverlapping(
                msg.as_ptr(),
                self.buffer.offset(index + RECORD_HEADER_LENGTH),
                msg.len(),
            );
        }
        self.length_field(index).store(record_length as i32, Ordering::Release);

        Ok(())
    }

    /// Read up to `message_count_limit` messages, invoking the handler with
    /// `(msg_type_id, payload)`. Consumed bytes are zeroed and the head is
    /// advanced once at the end.
    pub fn read(
        &self,
        mut handler: impl FnMut(i32, &[u8]),
        message_count_limit: usize,
    ) -> usize {
        let descriptor = self.descriptor();
        let head = descriptor.head_position.load(Ordering::Relaxed);
        let head_index = (head & (self.capacity as i64 - 1)) as usize;
        let contiguous = self.capacity - head_index;

        let mut bytes_read = 0usize;
        let mut messages_read = 0usize;

        while bytes_read < contiguous && messages_read < message_count_limit {
            let record_index = head_index + bytes_read;
            let record_length = self.length_field(record_index).load(Ordering::Acquire);

            if record_length <= 0 {
                break;
            }

            bytes_read += align_up(record_length as usize, RB_ALIGNMENT);
            let msg_type_id = self.type_field(record_index).load(Ordering::Relaxed);

            if msg_type_id == PADDING_MSG_TYPE_ID {
                continue;
            }

            messages_read += 1;
            let payload = unsafe {
                std::slice::from_raw_parts(
                    self.buffer.offset(record_index + RECORD_HEADER_LENGTH),
                    record_length as usize - RECORD_HEADER_LENGTH,
                )
            };
            handler(msg_type_id, payload);
        }

        if bytes_read != 0 {
            unsafe {
                std::ptr::write_bytes(self.buffer.offset(head_index), 0, bytes_read);
            }
            descriptor.head_position.store(head + bytes_read as i64, Ordering::Release);
        }

        messages_read
    }

    /// Allocate the next correlation id. Ids are shared by every producer
    /// on this ring, so they are unique per driver.
    #[inline]
    pub fn next_correlation_id(&self) -> i64 {
        self.descriptor().correlation_counter.fetch_add(1, Ordering::AcqRel)
    }

    #[inline]
    pub fn consumer_heartbeat_time_ms(&self) -> i64 {
        self.descriptor().consumer_heartbeat.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_consumer_heartbeat_time_ms(&self, now_ms: i64) {
        self.descriptor().consumer_heartbeat.store(now_ms, Ordering::Release);
    }

    #[inline]
    pub fn consumer_position(&self) -> i64 {
        self.descriptor().head_position.load(Ordering::Acquire)
    }

    #[inline]
    pub fn producer_position(&self) -> i64 {
        self.descriptor().tail_position.load(Ordering::Acquire)
    }

    /// Recover from a producer that died between claiming and publishing.
    ///
    /// If the record at the head has a negative length the claimant is gone
    /// mid-copy: the record is turned into padding. If the length is zero
    /// but later records were published, the gap up to the first published
    /// record is padded over. Returns true if progress was unblocked.
    pub fn unblock(&self) -> bool {
        let descriptor = self.descriptor();
        let mask = self.capacity as i64 - 1;
        let head = descriptor.head_position.load(Ordering::Acquire);
        let tail = descriptor.tail_position.load(Ordering::Acquire);

        if head == tail {
            return false;
        }

        let head_index = (head & mask) as usize;
        let length = self.length_field(head_index).load(Ordering::Acquire);

        if length < 0 {
            self.type_field(head_index).store(PADDING_MSG_TYPE_ID, Ordering::Relaxed);
            self.length_field(head_index).store(-length, Ordering::Release);
            return true;
        }

        if length == 0 {
            let limit = std::cmp::min((tail - head) as usize, self.capacity - head_index);
            let mut scan = RB_ALIGNMENT;

            while scan < limit {
                let probed = self.length_field(head_index + scan).load(Ordering::Acquire);
                if probed != 0 {
                    self.type_field(head_index).store(PADDING_MSG_TYPE_ID, Ordering::Relaxed);
                    self.length_field(head_index).store(scan as i32, Ordering::Release);
                    return true;
                }
                scan += RB_ALIGNMENT;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use std::sync::atomic::AtomicUsize;

    fn make_ring(capacity: usize) -> (HeapRegion, RingBuffer) {
        let heap = HeapRegion::new_zeroed(capacity + RB_TRAILER_LENGTH);
        let rb = RingBuffer::new(heap.region()).unwrap();
        (heap, rb)
    }

    #[test]
    fn rejects_non_power_of_two() {
        let heap = HeapRegion::new_zeroed(1000 + RB_TRAILER_LENGTH);
        assert_eq!(
            RingBuffer::new(heap.region()).err(),
            Some(RingBufferError::CapacityNotPowerOfTwo)
        );
    }

    #[test]
    fn write_read_roundtrip() {
        let (_heap, rb) = make_ring(1024);

        rb.write(7, b"hello").unwrap();
        rb.write(9, b"worlds").unwrap();

        let mut seen = Vec::new();
        let n = rb.read(|t, payload| seen.push((t, payload.to_vec())), 10);

        assert_eq!(n, 2);
        assert_eq!(seen[0], (7, b"hello".to_vec()));
        assert_eq!(seen[1], (9, b"worlds".to_vec()));
    }

    #[test]
    fn rejects_bad_type_and_oversize() {
        let (_heap, rb) = make_ring(1024);
        assert_eq!(rb.write(0, b"x"), Err(RingWriteError::InvalidTypeId));
        assert_eq!(rb.write(-3, b"x"), Err(RingWriteError::InvalidTypeId));
        assert_eq!(rb.write(1, &[0u8; 129]), Err(RingWriteError::MessageTooLong));
    }

    #[test]
    fn fills_then_reports_full() {
        let (_heap, rb) = make_ring(256);
        let msg = [0u8; 24]; // 32-byte records

        let mut written = 0;
        while rb.write(1, &msg).is_ok() {
            written += 1;
        }

        assert!(written >= 7);
        assert_eq!(rb.write(1, &msg), Err(RingWriteError::Full));

        // Draining frees the space again.
        rb.read(|_, _| {}, usize::MAX);
        assert!(rb.write(1, &msg).is_ok());
    }

    #[test]
    fn wraps_with_padding_record() {
        let (_heap, rb) = make_ring(1024);

        // March the tail around the buffer until a record must wrap; the
        // reader should only ever observe whole records.
        for _ in 0..24 {
            rb.write(2, &[0xEE; 100]).unwrap();
            let mut count = 0;
            rb.read(
                |t, payload| {
                    assert_eq!(t, 2);
                    assert!(payload.iter().all(|&b| b == 0xEE));
                    count += 1;
                },
                usize::MAX,
            );
            assert_eq!(count, 1);
        }
    }

    #[test]
    fn correlation_ids_are_monotonic() {
        let (_heap, rb) = make_ring(1024);
        let a = rb.next_correlation_id();
        let b = rb.next_correlation_id();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn unblock_turns_dead_claim_into_padding() {
        let (_heap, rb) = make_ring(1024);

        // Simulate a producer that claimed 32 bytes then died: bump the
        // tail and leave a negative length at the head.
        let descriptor = rb.descriptor();
        descriptor.tail_position.store(32, Ordering::Release);
        rb.length_field(0).store(-32, Ordering::Release);

        assert_eq!(rb.read(|_, _| {}, usize::MAX), 0);
        assert!(rb.unblock());
        assert_eq!(rb.read(|_, _| {}, usize::MAX), 0); // padding skipped
        assert_eq!(rb.consumer_position(), 32);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;

        let (_heap, rb) = make_ring(64 * 1024);
        let rb = &rb;
        let received = AtomicUsize::new(0);
        let sum = AtomicI64::new(0);

        std::thread::scope(|s| {
            for p in 0..PRODUCERS {
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let value = (p * PER_PRODUCER + i) as i64;
                        let bytes = value.to_le_bytes();
                        loop {
                            match rb.write(1, &bytes) {
                                Ok(()) => break,
                                Err(RingWriteError::Full) => std::thread::yield_now(),
                                Err(e) => panic!("unexpected write error: {e}"),
                            }
                        }
                    }
                });
            }

            let expected = PRODUCERS * PER_PRODUCER;
            while received.load(Ordering::Relaxed) < expected {
                rb.read(
                    |_, payload| {
                        let value = i64::from_le_bytes(payload.try_into().unwrap());
                        sum.fetch_add(value, Ordering::Relaxed);
                        received.fetch_add(1, Ordering::Relaxed);
                    },
                    64,
                );
            }
        });

        let n = (PRODUCERS * PER_PRODUCER) as i64;
        assert_eq!(sum.load(Ordering::Relaxed), n * (n - 1) / 2);
    }
}
