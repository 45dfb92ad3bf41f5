//! Data frame header access.
//!
//! Every frame in a term starts with a 32-byte header. The `frame_length`
//! field doubles as the publication gate: it is negative while the frame is
//! under construction and is stored positive, with release semantics, only
//! after the payload and reserved value are in place. Readers acquire-load
//! it and treat `<= 0` as "not yet available".
//!
//! All fields are little-endian.

use std::sync::atomic::{AtomicI32, Ordering};

use tern_primitives::Region;

/// Frame header length in bytes.
pub const HEADER_LENGTH: usize = 32;

/// Frames are aligned to this many bytes within a term.
pub const FRAME_ALIGNMENT: usize = 32;

/// Header field offsets.
pub const FRAME_LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_VALUE_OFFSET: usize = 24;

/// Frame types.
pub const HDR_TYPE_PAD: i16 = 0x00;
pub const HDR_TYPE_DATA: i16 = 0x01;
pub const HDR_TYPE_SM: i16 = 0x03;
pub const HDR_TYPE_SETUP: i16 = 0x05;
pub const HDR_TYPE_NAK: i16 = 0x06;

/// Fragmentation flags.
pub const BEGIN_FRAG_FLAG: u8 = 0x80;
pub const END_FRAG_FLAG: u8 = 0x40;
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

/// Protocol version carried in every header.
pub const CURRENT_VERSION: i8 = 0;

/// Value reserved until a producer's supplier fills it in.
pub const DEFAULT_RESERVED_VALUE: i64 = 0;

#[inline]
fn length_field(term: Region, frame_offset: usize) -> &'static AtomicI32 {
    // Frame offsets are 32-byte aligned so the length field is aligned for
    // an atomic i32. The 'static is bounded in practice by the mapping.
    unsafe { &*(term.offset(frame_offset + FRAME_LENGTH_OFFSET) as *const AtomicI32) }
}

/// Acquire-load of a frame's length. Non-positive means not yet published.
#[inline]
pub fn frame_length_volatile(term: Region, frame_offset: usize) -> i32 {
    length_field(term, frame_offset).load(Ordering::Acquire)
}

/// Release-store of a frame's length: the publication point.
#[inline]
pub fn set_frame_length_ordered(term: Region, frame_offset: usize, length: i32) {
    length_field(term, frame_offset).store(length, Ordering::Release);
}

#[inline]
pub fn frame_type(term: Region, frame_offset: usize) -> i16 {
    unsafe { (term.offset(frame_offset + TYPE_OFFSET) as *const i16).read() }
}

#[inline]
pub fn frame_flags(term: Region, frame_offset: usize) -> u8 {
    unsafe { term.offset(frame_offset + FLAGS_OFFSET).read() }
}

#[inline]
pub fn frame_version(term: Region, frame_offset: usize) -> i8 {
    unsafe { (term.offset(frame_offset + VERSION_OFFSET) as *const i8).read() }
}

#[inline]
pub fn frame_term_offset(term: Region, frame_offset: usize) -> i32 {
    unsafe { (term.offset(frame_offset + TERM_OFFSET_OFFSET) as *const i32).read() }
}

#[inline]
pub fn frame_session_id(term: Region, frame_offset: usize) -> i32 {
    unsafe { (term.offset(frame_offset + SESSION_ID_OFFSET) as *const i32).read() }
}

#[inline]
pub fn frame_stream_id(term: Region, frame_offset: usize) -> i32 {
    unsafe { (term.offset(frame_offset + STREAM_ID_OFFSET) as *const i32).read() }
}

#[inline]
pub fn frame_term_id(term: Region, frame_offset: usize) -> i32 {
    unsafe { (term.offset(frame_offset + TERM_ID_OFFSET) as *const i32).read() }
}

#[inline]
pub fn frame_reserved_value(term: Region, frame_offset: usize) -> i64 {
    unsafe { (term.offset(frame_offset + RESERVED_VALUE_OFFSET) as *const i64).read_unaligned() }
}

#[inline]
pub fn set_frame_reserved_value(term: Region, frame_offset: usize, value: i64) {
    unsafe { (term.offset(frame_offset + RESERVED_VALUE_OFFSET) as *mut i64).write_unaligned(value) }
}

#[inline]
pub fn is_padding_frame(term: Region, frame_offset: usize) -> bool {
    frame_type(term, frame_offset) == HDR_TYPE_PAD
}

/// Write a frame header with a still-negative length.
///
/// The negative length blocks readers until [`set_frame_length_ordered`]
/// publishes the positive value.
#[allow(clippy::too_many_arguments)]
pub fn write_header(
    term: Region,
    frame_offset: usize,
    frame_length: i32,
    frame_type_value: i16,
    flags: u8,
    term_id: i32,
    session_id: i32,
    stream_id: i32,
) {
    set_frame_length_ordered(term, frame_offset, -frame_length);
    unsafe {
        (term.offset(frame_offset + VERSION_OFFSET) as *mut i8).write(CURRENT_VERSION);
        term.offset(frame_offset + FLAGS_OFFSET).write(flags);
        (term.offset(frame_offset + TYPE_OFFSET) as *mut i16).write(frame_type_value);
        (term.offset(frame_offset + TERM_OFFSET_OFFSET) as *mut i32).write(frame_offset as i32);
        (term.offset(frame_offset + SESSION_ID_OFFSET) as *mut i32).write(session_id);
        (term.offset(frame_offset + STREAM_ID_OFFSET) as *mut i32).write(stream_id);
        (term.offset(frame_offset + TERM_ID_OFFSET) as *mut i32).write(term_id);
        (term.offset(frame_offset + RESERVED_VALUE_OFFSET) as *mut i64).write_unaligned(DEFAULT_RESERVED_VALUE);
    }
}

/// Write and immediately publish a padding frame covering
/// `[frame_offset, frame_offset + length)`.
pub fn write_padding_frame(
    term: Region,
    frame_offset: usize,
    length: i32,
    term_id: i32,
    session_id: i32,
    stream_id: i32,
) {
    write_header(term, frame_offset, length, HDR_TYPE_PAD, UNFRAGMENTED, term_id, session_id, stream_id);
    set_frame_length_ordered(term, frame_offset, length);
}

/// A copied-out frame header handed to fragment handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub frame_length: i32,
    pub version: i8,
    pub flags: u8,
    pub frame_type: i16,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
    /// Bits to shift when computing positions for this stream.
    pub position_bits_to_shift: u32,
    pub initial_term_id: i32,
}

impl Header {
    pub fn read(term: Region, frame_offset: usize, position_bits_to_shift: u32, initial_term_id: i32) -> Self {
        Self {
            frame_length: frame_length_volatile(term, frame_offset),
            version: frame_version(term, frame_offset),
            flags: frame_flags(term, frame_offset),
            frame_type: frame_type(term, frame_offset),
            term_offset: frame_term_offset(term, frame_offset),
            session_id: frame_session_id(term, frame_offset),
            stream_id: frame_stream_id(term, frame_offset),
            term_id: frame_term_id(term, frame_offset),
            reserved_value: frame_reserved_value(term, frame_offset),
            position_bits_to_shift,
            initial_term_id,
        }
    }

    /// Stream position just past this frame.
    pub fn position(&self) -> i64 {
        let end_offset = self.term_offset + align_frame_length(self.frame_length as usize) as i32;
        crate::descriptor::compute_position(
            self.term_id,
            end_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }
}

/// Align a frame length up to [`FRAME_ALIGNMENT`].
#[inline]
pub const fn align_frame_length(length: usize) -> usize {
    (length + (FRAME_ALIGNMENT - 1)) & !(FRAME_ALIGNMENT - 1)
}
