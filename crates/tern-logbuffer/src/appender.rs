//! Shared (multi-producer) term appender.
//!
//! Appends are wait-free: one `fetch_add` on the packed tail counter
//! reserves the byte range, after which the producer owns it outright.
//! When a reservation crosses the end of the term the producer writes a
//! padding frame over whatever usable space remains and reports `TRIPPED`
//! so the publication layer can rotate to the next term.

use std::sync::atomic::{AtomicI64, Ordering};

use tern_primitives::Region;

use crate::descriptor::term_id as tail_term_id;
use crate::frame::{align_frame_length, set_frame_length_ordered, write_header, write_padding_frame};
use crate::frame::{BEGIN_FRAG_FLAG, END_FRAG_FLAG, HDR_TYPE_DATA, HDR_TYPE_PAD, HEADER_LENGTH, UNFRAGMENTED};

/// The append would cross the term boundary; the caller must rotate.
pub const TERM_APPENDER_TRIPPED: i32 = -1;

/// The append cannot proceed (log closed or range exhausted).
pub const TERM_APPENDER_FAILED: i32 = -2;

/// Computes a per-frame reserved value after the payload is in place. The
/// slice is the whole frame including its header.
pub type ReservedValueSupplier<'a> = &'a dyn Fn(&mut [u8]) -> i64;

/// Multi-producer appender over one term.
pub struct TermAppender<'a> {
    term: Region,
    tail_counter: &'a AtomicI64,
}

impl<'a> TermAppender<'a> {
    pub fn new(term: Region, tail_counter: &'a AtomicI64) -> Self {
        Self { term, tail_counter }
    }

    #[inline]
    fn term_length(&self) -> usize {
        self.term.len()
    }

    #[inline]
    pub fn raw_tail_volatile(&self) -> i64 {
        self.tail_counter.load(Ordering::Acquire)
    }

    #[inline]
    fn get_and_add_raw_tail(&self, aligned_length: usize) -> i64 {
        self.tail_counter.fetch_add(aligned_length as i64, Ordering::AcqRel)
    }

    /// Append a whole message that fits inside one frame.
    ///
    /// Returns the term offset just past the appended frame, or
    /// [`TERM_APPENDER_TRIPPED`] when rotation is required.
    pub fn append_unfragmented(
        &self,
        msg: &[u8],
        reserved_value_supplier: Option<ReservedValueSupplier<'_>>,
        session_id: i32,
        stream_id: i32,
    ) -> i32 {
        let frame_length = msg.len() + HEADER_LENGTH;
        let aligned_length = align_frame_length(frame_length);

        let raw_tail = self.get_and_add_raw_tail(aligned_length);
        let term_offset = (raw_tail & 0xFFFF_FFFF) as i64;
        let term_id = tail_term_id(raw_tail);

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.term_length() as i64 {
            self.handle_end_of_term(term_offset, term_id, session_id, stream_id);
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

        self.apply_reserved_value(frame_offset, frame_length, reserved_value_supplier);
        set_frame_length_ordered(self.term, frame_offset, frame_length as i32);

        resulting_offset as i32
    }

    /// Append a message larger than the max payload as a BEGIN..END run of
    /// MTU-sized fragments. The whole run is reserved with one tail add so
    /// the fragments are contiguous within the term.
    #[allow(clippy::too_many_arguments)]
    pub fn append_fragmented(
        &self,
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

        let raw_tail = self.get_and_add_raw_tail(required_length);
        let term_offset = (raw_tail & 0xFFFF_FFFF) as i64;
        let term_id = tail_term_id(raw_tail);

        let resulting_offset = term_offset + required_length as i64;
        if resulting_offset > self.term_length() as i64 {
            self.handle_end_of_term(term_offset, term_id, session_id, stream_id);
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

            self.apply_reserved_value(frame_offset, frame_length, reserved_value_supplier);
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

    /// Append a message gathered from multiple buffers, without an
    /// intermediate copy. Framing is identical to the contiguous variants.
    #[allow(clippy::too_many_arguments)]
    pub fn append_vec(
        &self,
        iov: &[&[u8]],
        max_payload_length: usize,
        reserved_value_supplier: Option<ReservedValueSupplier<'_>>,
        session_id: i32,
        stream_id: i32,
    ) -> i32 {
        let total_length: usize = iov.iter().map(|v| v.len()).sum();

        if total_length <= max_payload_length {
            let frame_length = total_length + HEADER_LENGTH;
            let aligned_length = align_frame_length(frame_length);

            let raw_tail = self.get_and_add_raw_tail(aligned_length);
            let term_offset = (raw_tail & 0xFFFF_FFFF) as i64;
            let term_id = tail_term_id(raw_tail);

            let resulting_offset = term_offset + aligned_length as i64;
            if resulting_offset > self.term_length() as i64 {
                self.handle_end_of_term(term_offset, term_id, session_id, stream_id);
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

            let mut dest = frame_offset + HEADER_LENGTH;
            for buf in iov {
                unsafe {
                    std::ptr::copy_nonoverlapping(buf.as_ptr(), self.term.offset(dest), buf.len());
                }
                dest += buf.len();
            }

            self.apply_reserved_value(frame_offset, frame_length, reserved_value_supplier);
            set_frame_length_ordered(self.term, frame_offset, frame_length as i32);
            return resulting_offset as i32;
        }

        // Gathered fragmentation walks the iovec with a slice cursor.
        let num_max_payloads = total_length / max_payload_length;
        let remaining_payload = total_length - (num_max_payloads * max_payload_length);
        let last_frame_length = if remaining_payload > 0 {
            align_frame_length(remaining_payload + HEADER_LENGTH)
        } else {
            0
        };
        let required_length = num_max_payloads * (max_payload_length + HEADER_LENGTH) + last_frame_length;

        let raw_tail = self.get_and_add_raw_tail(required_length);
        let term_offset = (raw_tail & 0xFFFF_FFFF) as i64;
        let term_id = tail_term_id(raw_tail);

        let resulting_offset = term_offset + required_length as i64;
        if resulting_offset > self.term_length() as i64 {
            self.handle_end_of_term(term_offset, term_id, session_id, stream_id);
            return TERM_APPENDER_TRIPPED;
        }

        let mut flags = BEGIN_FRAG_FLAG;
        let mut remaining = total_length;
        let mut frame_offset = term_offset as usize;
        let mut vec_index = 0usize;
        let mut vec_offset = 0usize;

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

            let mut dest = frame_offset + HEADER_LENGTH;
            let mut to_copy = bytes_to_write;
            while to_copy > 0 {
                if vec_offset == iov[vec_index].len() {
                    vec_index += 1;
                    vec_offset = 0;
                    continue;
                }
                let source = &iov[vec_index][vec_offset..];
                let chunk = std::cmp::min(to_copy, source.len());
                unsafe {
                    std::ptr::copy_nonoverlapping(source.as_ptr(), self.term.offset(dest), chunk);
                }
                dest += chunk;
                to_copy -= chunk;
                vec_offset += chunk;
            }

            self.apply_reserved_value(frame_offset, frame_length, reserved_value_supplier);
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

    /// Reserve a frame for zero-copy writing. The claim must be committed
    /// or aborted promptly: the frame stays invisible to readers (negative
    /// length) until then, and readers cannot advance past it.
    pub fn claim(
        &self,
        length: usize,
        session_id: i32,
        stream_id: i32,
    ) -> (i32, Option<BufferClaim>) {
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = align_frame_length(frame_length);

        let raw_tail = self.get_and_add_raw_tail(aligned_length);
        let term_offset = (raw_tail & 0xFFFF_FFFF) as i64;
        let term_id = tail_term_id(raw_tail);

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.term_length() as i64 {
            self.handle_end_of_term(term_offset, term_id, session_id, stream_id);
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

        let claim = BufferClaim {
            term: self.term,
            frame_offset,
            frame_length,
        };

        (resulting_offset as i32, Some(claim))
    }

    fn apply_reserved_value(
        &self,
        frame_offset: usize,
        frame_length: usize,
        supplier: Option<ReservedValueSupplier<'_>>,
    ) {
        if let Some(supplier) = supplier {
            let frame = unsafe {
                std::slice::from_raw_parts_mut(self.term.offset(frame_offset), frame_length)
            };
            let value = supplier(frame);
            crate::frame::set_frame_reserved_value(self.term, frame_offset, value);
        }
    }

    /// Pad out the rest of the term, if any usable space remains at the
    /// offset this producer reserved. Producers whose reservation starts at
    /// or past the term end have nothing to pad; the earlier tripper did.
    fn handle_end_of_term(&self, term_offset: i64, term_id: i32, session_id: i32, stream_id: i32) {
        let term_length = self.term_length() as i64;
        if term_offset < term_length {
            let padding_length = (term_length - term_offset) as i32;
            write_padding_frame(self.term, term_offset as usize, padding_length, term_id, session_id, stream_id);
        }
    }
}

/// A claimed but unpublished frame.
///
/// Obtained from [`TermAppender::claim`]; the caller writes the payload via
/// [`BufferClaim::data`] then publishes with [`BufferClaim::commit`] or
/// backs out with [`BufferClaim::abort`].
pub struct BufferClaim {
    term: Region,
    frame_offset: usize,
    frame_length: usize,
}

impl BufferClaim {
    pub(crate) fn new(term: Region, frame_offset: usize, frame_length: usize) -> Self {
        Self { term, frame_offset, frame_length }
    }

    /// The payload section of the claimed frame.
    #[inline]
    pub fn data(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.term.offset(self.frame_offset + HEADER_LENGTH),
                self.frame_length - HEADER_LENGTH,
            )
        }
    }

    #[inline]
    pub fn frame_offset(&self) -> usize {
        self.frame_offset
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.frame_length - HEADER_LENGTH
    }

    /// Publish the frame to readers.
    pub fn commit(self) {
        set_frame_length_ordered(self.term, self.frame_offset, self.frame_length as i32);
    }

    /// Publish the frame as padding so readers skip the space.
    pub fn abort(self) {
        unsafe {
            (self.term.offset(self.frame_offset + crate::frame::TYPE_OFFSET) as *mut i16).write(HDR_TYPE_PAD);
        }
        set_frame_length_ordered(self.term, self.frame_offset, self.frame_length as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::pack_tail;
    use crate::frame;
    use tern_primitives::HeapRegion;

    const TERM_LENGTH: usize = 64 * 1024;
    const SESSION_ID: i32 = 5;
    const STREAM_ID: i32 = 10;

    fn term_and_tail(term_id: i32) -> (HeapRegion, AtomicI64) {
        let heap = HeapRegion::new_zeroed(TERM_LENGTH);
        let tail = AtomicI64::new(pack_tail(term_id, 0));
        (heap, tail)
    }

    #[test]
    fn unfragmented_appends_advance_by_aligned_length() {
        let (heap, tail) = term_and_tail(3);
        let appender = TermAppender::new(heap.region(), &tail);

        let msg = [7u8; 20]; // frame 52 -> aligned 64
        let first = appender.append_unfragmented(&msg, None, SESSION_ID, STREAM_ID);
        let second = appender.append_unfragmented(&msg, None, SESSION_ID, STREAM_ID);

        assert_eq!(first, 64);
        assert_eq!(second, 128);

        let term = heap.region();
        assert_eq!(frame::frame_length_volatile(term, 0), 52);
        assert_eq!(frame::frame_flags(term, 0), UNFRAGMENTED);
        assert_eq!(frame::frame_term_id(term, 0), 3);
        assert_eq!(frame::frame_session_id(term, 64), SESSION_ID);
        let payload = unsafe { std::slice::from_raw_parts(term.offset(HEADER_LENGTH), 20) };
        assert_eq!(payload, &msg);
    }

    #[test]
    fn trip_pads_remaining_space() {
        let (heap, tail) = term_and_tail(1);
        tail.store(pack_tail(1, (TERM_LENGTH - 64) as i32), Ordering::Relaxed);
        let appender = TermAppender::new(heap.region(), &tail);

        let msg = [0u8; 100]; // frame 132 -> aligned 160, will not fit in 64
        let result = appender.append_unfragmented(&msg, None, SESSION_ID, STREAM_ID);
        assert_eq!(result, TERM_APPENDER_TRIPPED);

        let term = heap.region();
        let pad_offset = TERM_LENGTH - 64;
        assert!(frame::is_padding_frame(term, pad_offset));
        assert_eq!(frame::frame_length_volatile(term, pad_offset), 64);
    }

    #[test]
    fn second_tripper_does_not_pad_again() {
        let (heap, tail) = term_and_tail(1);
        tail.store(pack_tail(1, (TERM_LENGTH - 32) as i32), Ordering::Relaxed);
        let appender = TermAppender::new(heap.region(), &tail);

        let msg = [0u8; 64];
        assert_eq!(appender.append_unfragmented(&msg, None, SESSION_ID, STREAM_ID), TERM_APPENDER_TRIPPED);
        // Tail is now past the term end; another append must not write.
        assert_eq!(appender.append_unfragmented(&msg, None, SESSION_ID, STREAM_ID), TERM_APPENDER_TRIPPED);
    }

    #[test]
    fn fragmented_append_marks_begin_and_end() {
        let (heap, tail) = term_and_tail(9);
        let appender = TermAppender::new(heap.region(), &tail);

        let max_payload = 1024;
        let msg: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let result = appender.append_fragmented(&msg, max_payload, None, SESSION_ID, STREAM_ID);
        assert!(result > 0);

        let term = heap.region();
        // Fragment 1: BEGIN
        assert_eq!(frame::frame_flags(term, 0), BEGIN_FRAG_FLAG);
        assert_eq!(frame::frame_length_volatile(term, 0), (max_payload + HEADER_LENGTH) as i32);
        // Fragment 2: middle
        let f2 = align_frame_length(max_payload + HEADER_LENGTH);
        assert_eq!(frame::frame_flags(term, f2), 0);
        // Fragment 3: END, 2500 - 2048 = 452 bytes
        let f3 = f2 * 2;
        assert_eq!(frame::frame_flags(term, f3), END_FRAG_FLAG);
        assert_eq!(frame::frame_length_volatile(term, f3), (452 + HEADER_LENGTH) as i32);

        // All fragments carry the same term id.
        for offset in [0, f2, f3] {
            assert_eq!(frame::frame_term_id(term, offset), 9);
        }

        // Payload reassembles to the original.
        let mut assembled = Vec::new();
        for offset in [0, f2, f3] {
            let len = frame::frame_length_volatile(term, offset) as usize - HEADER_LENGTH;
            let payload = unsafe { std::slice::from_raw_parts(term.offset(offset + HEADER_LENGTH), len) };
            assembled.extend_from_slice(payload);
        }
        assert_eq!(assembled, msg);
    }

    #[test]
    fn vectored_append_gathers_buffers() {
        let (heap, tail) = term_and_tail(6);
        let appender = TermAppender::new(heap.region(), &tail);

        let result = appender.append_vec(&[b"head", b"", b"-and-", b"tail"], 1024, None, SESSION_ID, STREAM_ID);
        assert!(result > 0);

        let term = heap.region();
        let length = frame::frame_length_volatile(term, 0) as usize;
        assert_eq!(length, HEADER_LENGTH + 13);
        let payload = unsafe { std::slice::from_raw_parts(term.offset(HEADER_LENGTH), 13) };
        assert_eq!(payload, b"head-and-tail");
    }

    #[test]
    fn vectored_append_fragments_across_slice_boundaries() {
        let (heap, tail) = term_and_tail(6);
        let appender = TermAppender::new(heap.region(), &tail);

        let a = vec![1u8; 100];
        let b = vec![2u8; 100];
        let c = vec![3u8; 100];
        let max_payload = 128;
        let result = appender.append_vec(&[&a, &b, &c], max_payload, None, SESSION_ID, STREAM_ID);
        assert!(result > 0);

        let term = heap.region();
        let mut assembled = Vec::new();
        let mut offset = 0usize;
        while offset < TERM_LENGTH {
            let length = frame::frame_length_volatile(term, offset);
            if length <= 0 {
                break;
            }
            let payload_len = length as usize - HEADER_LENGTH;
            let payload = unsafe { std::slice::from_raw_parts(term.offset(offset + HEADER_LENGTH), payload_len) };
            assembled.extend_from_slice(payload);
            offset += align_frame_length(length as usize);
        }

        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        expected.extend_from_slice(&c);
        assert_eq!(assembled, expected);
    }

    #[test]
    fn claim_commit_publishes_frame() {
        let (heap, tail) = term_and_tail(2);
        let appender = TermAppender::new(heap.region(), &tail);

        let (result, claim) = appender.claim(48, SESSION_ID, STREAM_ID);
        assert!(result > 0);
        let mut claim = claim.unwrap();

        let term = heap.region();
        // Not yet visible.
        assert!(frame::frame_length_volatile(term, 0) < 0);

        claim.data().fill(0xAB);
        claim.commit();

        assert_eq!(frame::frame_length_volatile(term, 0), (48 + HEADER_LENGTH) as i32);
        let payload = unsafe { std::slice::from_raw_parts(term.offset(HEADER_LENGTH), 48) };
        assert!(payload.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn claim_abort_leaves_padding() {
        let (heap, tail) = term_and_tail(2);
        let appender = TermAppender::new(heap.region(), &tail);

        let (_, claim) = appender.claim(48, SESSION_ID, STREAM_ID);
        claim.unwrap().abort();

        let term = heap.region();
        assert!(frame::is_padding_frame(term, 0));
        assert!(frame::frame_length_volatile(term, 0) > 0);
    }

    #[test]
    fn reserved_value_supplier_runs_before_publication() {
        let (heap, tail) = term_and_tail(4);
        let appender = TermAppender::new(heap.region(), &tail);

        let supplier = |frame: &mut [u8]| -> i64 { frame.len() as i64 * 100 };
        let result = appender.append_unfragmented(&[1, 2, 3], Some(&supplier), SESSION_ID, STREAM_ID);
        assert!(result > 0);

        let term = heap.region();
        assert_eq!(frame::frame_reserved_value(term, 0), (3 + HEADER_LENGTH) as i64 * 100);
    }

    #[test]
    fn concurrent_producers_get_disjoint_ranges() {
        const THREADS: usize = 4;
        const APPENDS: usize = 200;

        let heap = HeapRegion::new_zeroed(TERM_LENGTH);
        let tail = AtomicI64::new(pack_tail(0, 0));
        let term = heap.region();

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let tail = &tail;
                s.spawn(move || {
                    let appender = TermAppender::new(term, tail);
                    let msg = [t as u8; 24];
                    for _ in 0..APPENDS {
                        let r = appender.append_unfragmented(&msg, None, SESSION_ID, STREAM_ID);
                        assert!(r > 0, "term should be large enough for all appends");
                    }
                });
            }
        });

        // Walk the term: every frame is whole, aligned, and uniformly
        // filled with its writer's tag; ranges are disjoint by construction
        // of the walk.
        let mut offset = 0usize;
        let mut frames = 0usize;
        while offset < TERM_LENGTH {
            let length = frame::frame_length_volatile(term, offset);
            if length <= 0 {
                break;
            }
            let payload_len = length as usize - HEADER_LENGTH;
            let payload = unsafe { std::slice::from_raw_parts(term.offset(offset + HEADER_LENGTH), payload_len) };
            assert!(payload.windows(2).all(|w| w[0] == w[1]), "torn frame at {offset}");
            frames += 1;
            offset += align_frame_length(length as usize);
        }
        assert_eq!(frames, THREADS * APPENDS);
    }
}
