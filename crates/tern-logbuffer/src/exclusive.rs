//! Exclusive (single-producer) term appender.
//!
//! The sole writer tracks its own term id and offset, so the tail counter
//! is updated with a plain ordered store instead of `fetch_add`. Framing
//! and publication ordering are identical to the shared appender.

use std::sync::atomic::{AtomicI64, Ordering};

use tern_primitives::Region;

use crate::appender::{BufferClaim, ReservedValueSupplier, TERM_APPENDER_TRIPPED};
use crate::descriptor::pack_tail;
use crate::frame::{align_frame_length, set_frame_length_ordered, write_header, write_padding_frame};
use crate::frame::{BEGIN_FRAG_FLAG, END_FRAG_FLAG, HDR_TYPE_DATA, HEADER_LENGTH, UNFRAGMENTED};

/// Single-producer appender over one term.
pub struct ExclusiveTermAppender<'a> {
    term: Region,
    tail_counter: &'a AtomicI64,
}

impl<'a> ExclusiveTermAppender<'a> {
    pub fn new(term: Region, tail_counter: &'a AtomicI64) -> Self {
        Self { term, tail_counter }
    }

    #[inline]
    fn put_raw_tail_ordered(&self, term_id: i32, term_offset: i64) {
        self.tail_counter.store(pack_tail(term_id, term_offset as i32), Ordering::Release);
    }

    /// Append one unfragmented message at the caller-tracked offset.
    pub fn append_unfragmented(
        &self,
        term_id: i32,
        term_offset: i32,
        msg: &[u8],
        reserved_value_supplier: Option<ReservedValueSupplier<'_>>,
        session_id: i32,
        stream_id: i32,
    ) -> i32 {
        let frame_length = msg.len() + HEADER_LENGTH;
        let aligned_length = align_frame_length(frame_length);
        let resulting_offset = term_offset as i64 + aligned_length as i64;

        self.put_raw_tail_ordered(term_id, resulting_offset);

        if resulting_offset > self.term.len() as i64 {
            self.pad_to_end(term_offset, term_id, session_id, stream_id);
            return TERM_APPENDER_TRIPPED;
        }

        let frame_offset = term_offset as usize;
        write_header(
            self.term,
            frame_offset,
            frame_length as i32,
            HDR_TYPE_DATA,
            UNFRAGMENTED,
            term_id,
            session_id,
            stream_id,
        );
        unsafe {
            std::ptr::copy_nonoverlapping(
                msg.as_ptr(),
                self.term.offset(frame_offset + HEADER_LENGTH),
                msg.len(),
            );
        }

        if let Some(supplier) = reserved_value_supplier {
            let frame = unsafe { std::slice::from_raw_parts_mut(self.term.offset(frame_offset), frame_length) };
            let value = supplier(frame);
            crate::frame::set_frame_reserved_value(self.term, frame_offset, value);
        }

        set_frame_length_ordered(self.term, frame_offset, frame_length as i32);
        resulting_offset as i32
    }

    /// Append a fragmented message at the caller-tracked offset.
    #[allow(clippy::too_many_arguments)]
    pub fn append_fragmented(
        &self,
        term_id: i32,
        term_offset: i32,
        msg: &[u8],
        max_payload_length: usize,
        reserved_value_supplier: Option<ReservedValueSupplier<'_>>,
        session_id: i32,
        stream_id: i32,
    ) -> i32 {
        let num_max_payloads = msg.len() / max_payload_length;
        let remaining_payload = msg.len() - (num_max_payloads * max_payload_length);
        let last_frame_length = if remaining_payload > 0 {
            align_frame_length(remaining_payload + HEADER_LENGTH)
        } else {
            0
        };
        let required_length = num_max_payloads * (max_payload_length + HEADER_LENGTH) + last_frame_length;
        let resulting_offset = term_offset as i64 + required_length as i64;

        self.put_raw_tail_ordered(term_id, resulting_offset);

        if resulting_offset > self.term.len() as i64 {
            self.pad_to_end(term_offset, term_id, session_id, stream_id);
            return TERM_APPENDER_TRIPPED;
        }

        let mut flags = BEGIN_FRAG_FLAG;
        let mut remaining = msg.len();
        let mut frame_offset = term_offset as usize;

        loop {
            let bytes_to_write = std::cmp::min(remaining, max_payload_length);
            let frame_length = bytes_to_write + HEADER_LENGTH;
            let aligned_length = align_frame_length(frame_length);

            if remaining <= max_payload_length {
                flags |= END_FRAG_FLAG;
            }

            write_header(
                self.term,
                frame_offset,
                frame_length as i32,
                HDR_TYPE_DATA,
                flags,
                term_id,
                session_id,
                stream_id,
            );
            unsafe {
                std::ptr::copy_nonoverlapping(
                    msg.as_ptr().add(msg.len() - remaining),
                    self.term.offset(frame_offset + HEADER_LENGTH),
                    bytes_to_write,
                );
            }

            if let Some(supplier) = reserved_value_supplier {
                let frame = unsafe { std::slice::from_raw_parts_mut(self.term.offset(frame_offset), frame_length) };
                let value = supplier(frame);
                crate::frame::set_frame_reserved_value(self.term, frame_offset, value);
            }

            set_frame_length_ordered(self.term, frame_offset, frame_length as i32);

            flags = 0;
            frame_offset += aligned_length;
            remaining -= bytes_to_write;

            if remaining == 0 {
                break;
            }
        }

        resulting_offset as i32
    }

    /// Claim a frame at the caller-tracked offset.
    pub fn claim(
        &self,
        term_id: i32,
        term_offset: i32,
        length: usize,
        session_id: i32,
        stream_id: i32,
    ) -> (i32, Option<BufferClaim>) {
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = align_frame_length(frame_length);
        let resulting_offset = term_offset as i64 + aligned_length as i64;

        self.put_raw_tail_ordered(term_id, resulting_offset);

        if resulting_offset > self.term.len() as i64 {
            self.pad_to_end(term_offset, term_id, session_id, stream_id);
            return (TERM_APPENDER_TRIPPED, None);
        }

        let frame_offset = term_offset as usize;
        write_header(
            self.term,
            frame_offset,
            frame_length as i32,
            HDR_TYPE_DATA,
            UNFRAGMENTED,
            term_id,
            session_id,
            stream_id,
        );

        (resulting_offset as i32, Some(BufferClaim::new(self.term, frame_offset, frame_length)))
    }

    fn pad_to_end(&self, term_offset: i32, term_id: i32, session_id: i32, stream_id: i32) {
        let term_length = self.term.len() as i64;
        if (term_offset as i64) < term_length {
            let padding_length = (term_length - term_offset as i64) as i32;
            write_padding_frame(self.term, term_offset as usize, padding_length, term_id, session_id, stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{term_id as tail_term_id, term_offset as tail_term_offset};
    use crate::frame;
    use tern_primitives::HeapRegion;

    const TERM_LENGTH: usize = 64 * 1024;

    #[test]
    fn appends_track_explicit_offsets() {
        let heap = HeapRegion::new_zeroed(TERM_LENGTH);
        let tail = AtomicI64::new(0);
        let appender = ExclusiveTermAppender::new(heap.region(), &tail);

        let r1 = appender.append_unfragmented(5, 0, &[1u8; 10], None, 1, 2);
        assert_eq!(r1, 64);
        let r2 = appender.append_unfragmented(5, r1, &[2u8; 10], None, 1, 2);
        assert_eq!(r2, 128);

        let raw = tail.load(Ordering::Relaxed);
        assert_eq!(tail_term_id(raw), 5);
        assert_eq!(tail_term_offset(raw, TERM_LENGTH as i64), 128);
    }

    #[test]
    fn trip_pads_and_reports() {
        let heap = HeapRegion::new_zeroed(TERM_LENGTH);
        let tail = AtomicI64::new(0);
        let appender = ExclusiveTermAppender::new(heap.region(), &tail);

        let offset = (TERM_LENGTH - 32) as i32;
        let r = appender.append_unfragmented(5, offset, &[0u8; 64], None, 1, 2);
        assert_eq!(r, TERM_APPENDER_TRIPPED);
        assert!(frame::is_padding_frame(heap.region(), TERM_LENGTH - 32));
    }

    #[test]
    fn claim_then_commit() {
        let heap = HeapRegion::new_zeroed(TERM_LENGTH);
        let tail = AtomicI64::new(0);
        let appender = ExclusiveTermAppender::new(heap.region(), &tail);

        let (r, claim) = appender.claim(5, 0, 16, 1, 2);
        assert_eq!(r, 64);
        let mut claim = claim.unwrap();
        claim.data().copy_from_slice(&[9u8; 16]);
        claim.commit();

        assert_eq!(frame::frame_length_volatile(heap.region(), 0), (16 + HEADER_LENGTH) as i32);
    }

    #[test]
    fn fragments_share_term_id_and_consecutive_offsets() {
        let heap = HeapRegion::new_zeroed(TERM_LENGTH);
        let tail = AtomicI64::new(0);
        let appender = ExclusiveTermAppender::new(heap.region(), &tail);

        let msg = vec![3u8; 300];
        let r = appender.append_fragmented(8, 0, &msg, 128, None, 1, 2);
        assert!(r > 0);

        let term = heap.region();
        let mut offset = 0usize;
        let mut term_offsets = Vec::new();
        for _ in 0..3 {
            term_offsets.push(frame::frame_term_offset(term, offset));
            assert_eq!(frame::frame_term_id(term, offset), 8);
            offset += frame::align_frame_length(frame::frame_length_volatile(term, offset) as usize);
        }
        assert_eq!(term_offsets, vec![0, 160, 320]);
    }
}
