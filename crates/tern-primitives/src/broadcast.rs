//! One-to-many broadcast buffer carrying driver responses to clients.
//!
//! A single transmitter (the driver conductor) appends records; any number
//! of receivers follow with private cursors. The transmitter never waits
//! for receivers: a receiver that falls more than a buffer's length behind
//! is lapped, reseeks to the latest record, and reports the loss.
//!
//! The tail-intent counter is advanced (release) before a record is
//! written and the tail counter after, so a receiver can detect that bytes
//! it copied were concurrently overwritten and discard them.

use std::mem::size_of;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::region::{align_up, Region};

/// Reserved message type id for padding records.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Record header: length (i32) then msg type id (i32).
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Records are aligned to the header length.
pub const BROADCAST_ALIGNMENT: usize = RECORD_HEADER_LENGTH;

/// Trailer appended after the data section.
pub const BROADCAST_TRAILER_LENGTH: usize = size_of::<BroadcastDescriptor>();

#[repr(C)]
pub struct BroadcastDescriptor {
    pub tail_intent_counter: AtomicI64,
    _pad1: [u8; 120],
    pub tail_counter: AtomicI64,
    _pad2: [u8; 120],
    pub latest_counter: AtomicI64,
    _pad3: [u8; 120],
}

const _: () = assert!(size_of::<BroadcastDescriptor>() == 384);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastError {
    TooSmall,
    CapacityNotPowerOfTwo,
    MessageTooLong,
    InvalidTypeId,
}

impl std::fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooSmall => write!(f, "region too small for broadcast buffer"),
            Self::CapacityNotPowerOfTwo => write!(f, "broadcast capacity must be a power of two"),
            Self::MessageTooLong => write!(f, "message exceeds max message length"),
            Self::InvalidTypeId => write!(f, "message type id must be positive"),
        }
    }
}

impl std::error::Error for BroadcastError {}

/// Loss report for a lapped receiver. The receiver has already reseeked to
/// the latest record when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastLoss {
    /// Times this receiver has been lapped in total.
    pub lapped_count: u64,
}

impl std::fmt::Display for BroadcastLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "broadcast receiver lapped (count={})", self.lapped_count)
    }
}

impl std::error::Error for BroadcastLoss {}

fn buffer_and_descriptor(region: Region) -> Result<(Region, *const BroadcastDescriptor), BroadcastError> {
    if region.len() <= BROADCAST_TRAILER_LENGTH {
        return Err(BroadcastError::TooSmall);
    }
    let capacity = region.len() - BROADCAST_TRAILER_LENGTH;
    if !capacity.is_power_of_two() {
        return Err(BroadcastError::CapacityNotPowerOfTwo);
    }
    let descriptor = region.offset(capacity) as *const BroadcastDescriptor;
    Ok((region.slice(0, capacity), descriptor))
}

/// The single writer side.
pub struct BroadcastTransmitter {
    buffer: Region,
    descriptor: *const BroadcastDescriptor,
    capacity: usize,
    max_message_length: usize,
}

unsafe impl Send for BroadcastTransmitter {}

impl BroadcastTransmitter {
    pub fn new(region: Region) -> Result<Self, BroadcastError> {
        let (buffer, descriptor) = buffer_and_descriptor(region)?;
        let capacity = buffer.len();
        Ok(Self { buffer, descriptor, capacity, max_message_length: capacity / 8 })
    }

    #[inline]
    fn descriptor(&self) -> &BroadcastDescriptor {
        unsafe { &*self.descriptor }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn write_header(&self, offset: usize, length: i32, msg_type_id: i32) {
        unsafe {
            let p = self.buffer.offset(offset) as *mut i32;
            p.write(length);
            p.add(1).write(msg_type_id);
        }
    }

    /// Append one record. Receivers that cannot keep up are lapped, never
    /// waited for.
    pub fn transmit(&self, msg_type_id: i32, msg: &[u8]) -> Result<(), BroadcastError> {
        if msg_type_id < 1 {
            return Err(BroadcastError::InvalidTypeId);
        }
        if msg.len() > self.max_message_length {
            return Err(BroadcastError::MessageTooLong);
        }

        let descriptor = self.descriptor();
        let mask = self.capacity as i64 - 1;
        let record_length = msg.len() + RECORD_HEADER_LENGTH;
        let aligned_length = align_up(record_length, BROADCAST_ALIGNMENT);

        let mut tail = descriptor.tail_counter.load(Ordering::Relaxed);
        let mut record_offset = (tail & mask) as usize;
        let to_end = self.capacity - record_offset;

        if aligned_length > to_end {
            // Pad out the end of the buffer and wrap to offset zero.
            descriptor
                .tail_intent_counter
                .store(tail + (to_end + aligned_length) as i64, Ordering::Release);

            self.write_header(record_offset, to_end as i32, PADDING_MSG_TYPE_ID);
            tail += to_end as i64;
            record_offset = 0;
        } else {
            descriptor
                .tail_intent_counter
                .store(tail + aligned_length as i64, Ordering::Release);
        }

        self.write_header(record_offset, record_length as i32, msg_type_id);
        unsafe {
            std::ptr::copy_nonoverlapping(
                msg.as_ptr(),
                self.buffer.offset(record_offset + RECORD_HEADER_LENGTH),
                msg.len(),
            );
        }

        descriptor.latest_counter.store(tail, Ordering::Relaxed);
        descriptor.tail_counter.store(tail + aligned_length as i64, Ordering::Release);

        Ok(())
    }
}

/// One receiver's view. Each receiver owns a private cursor; constructing a
/// receiver late joins at the current tail.
pub struct BroadcastReceiver {
    buffer: Region,
    descriptor: *const BroadcastDescriptor,
    capacity: usize,
    cursor: i64,
    lapped_count: u64,
    scratch: Vec<u8>,
}

unsafe impl Send for BroadcastReceiver {}

impl BroadcastReceiver {
    pub fn new(region: Region) -> Result<Self, BroadcastError> {
        let (buffer, descriptor) = buffer_and_descriptor(region)?;
        let capacity = buffer.len();
        let cursor = unsafe { (*descriptor).tail_counter.load(Ordering::Acquire) };
        Ok(Self { buffer, descriptor, capacity, cursor, lapped_count: 0, scratch: Vec::new() })
    }

    #[inline]
    fn descriptor(&self) -> &BroadcastDescriptor {
        unsafe { &*self.descriptor }
    }

    #[inline]
    pub fn lapped_count(&self) -> u64 {
        self.lapped_count
    }

    #[inline]
    fn read_header(&self, offset: usize) -> (i32, i32) {
        unsafe {
            let p = self.buffer.offset(offset) as *const i32;
            (p.read_volatile(), p.add(1).read_volatile())
        }
    }

    /// Receive the next record, if any. The payload is copied out and
    /// validated against the tail intent before the handler runs, so the
    /// handler never observes torn bytes.
    ///
    /// Returns `Ok(true)` when a record was delivered, `Ok(false)` when the
    /// buffer has nothing new, and `Err` when this receiver was lapped (it
    /// has already reseeked; call again for the next record).
    pub fn receive(&mut self, mut handler: impl FnMut(i32, &[u8])) -> Result<bool, BroadcastLoss> {
        let mask = self.capacity as i64 - 1;
        let tail = self.descriptor().tail_counter.load(Ordering::Acquire);

        if tail <= self.cursor {
            return Ok(false);
        }

        if tail - self.cursor >= self.capacity as i64 {
            return Err(self.reseek());
        }

        let mut cursor = self.cursor;
        let mut record_offset = (cursor & mask) as usize;
        let (mut length, mut msg_type_id) = self.read_header(record_offset);

        if msg_type_id == PADDING_MSG_TYPE_ID {
            cursor += length as i64;
            record_offset = 0;
            let h = self.read_header(0);
            length = h.0;
            msg_type_id = h.1;
        }

        let payload_length = length as usize - RECORD_HEADER_LENGTH;
        self.scratch.resize(payload_length, 0);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.buffer.offset(record_offset + RECORD_HEADER_LENGTH),
                self.scratch.as_mut_ptr(),
                payload_length,
            );
        }

        // Validate that the transmitter did not lap us mid-copy.
        let tail_intent = self.descriptor().tail_intent_counter.load(Ordering::Acquire);
        if tail_intent - self.cursor > self.capacity as i64 {
            return Err(self.reseek());
        }

        self.cursor = cursor + align_up(length as usize, BROADCAST_ALIGNMENT) as i64;
        handler(msg_type_id, &self.scratch);
        Ok(true)
    }

    fn reseek(&mut self) -> BroadcastLoss {
        self.cursor = self.descriptor().latest_counter.load(Ordering::Acquire);
        self.lapped_count += 1;
        BroadcastLoss { lapped_count: self.lapped_count }
    }
}
