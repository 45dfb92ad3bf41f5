//! Term reading.
//!
//! Readers are wait-free: each frame's length is acquire-loaded and a
//! non-positive value ends the scan (the frame is unpublished or the term
//! simply ends there). Padding frames advance the offset without reaching
//! the handler.

use tern_primitives::Region;

use crate::frame::{self, align_frame_length, Header, HEADER_LENGTH};

/// Outcome of a [`read_term`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub fragments_read: usize,
    pub offset: usize,
}

/// Read published frames from `offset`, handing `(payload, header)` pairs
/// to the handler, up to `fragments_limit` data frames.
pub fn read_term(
    term: Region,
    offset: usize,
    fragments_limit: usize,
    position_bits_to_shift: u32,
    initial_term_id: i32,
    handler: &mut dyn FnMut(&[u8], &Header),
) -> ReadOutcome {
    let term_length = term.len();
    let mut offset = offset;
    let mut fragments_read = 0;

    while fragments_read < fragments_limit && offset < term_length {
        let frame_length = frame::frame_length_volatile(term, offset);
        if frame_length <= 0 {
            break;
        }

        let frame_offset = offset;
        offset += align_frame_length(frame_length as usize);

        if frame::is_padding_frame(term, frame_offset) {
            continue;
        }

        let header = Header::read(term, frame_offset, position_bits_to_shift, initial_term_id);
        let payload = unsafe {
            std::slice::from_raw_parts(
                term.offset(frame_offset + HEADER_LENGTH),
                frame_length as usize - HEADER_LENGTH,
            )
        };

        fragments_read += 1;
        handler(payload, &header);
    }

    ReadOutcome { fragments_read, offset }
}

/// How many contiguous published bytes, in whole frames, are available from
/// `offset` up to `max_length`. Padding frames count toward the total so a
/// consumer can step over term ends.
pub fn scan_for_availability(term: Region, offset: usize, max_length: usize) -> usize {
    let limit = std::cmp::min(offset + max_length, term.len());
    let mut scan = offset;

    while scan < limit {
        let frame_length = frame::frame_length_volatile(term, scan);
        if frame_length <= 0 {
            break;
        }

        let aligned = align_frame_length(frame_length as usize);
        if scan + aligned > limit {
            break;
        }
        scan += aligned;
    }

    scan - offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender::TermAppender;
    use crate::descriptor::pack_tail;
    use crate::frame::{write_padding_frame, UNFRAGMENTED};
    use std::sync::atomic::AtomicI64;
    use tern_primitives::HeapRegion;

    const TERM_LENGTH: usize = 64 * 1024;

    fn filled_term(messages: &[&[u8]]) -> (HeapRegion, AtomicI64) {
        let heap = HeapRegion::new_zeroed(TERM_LENGTH);
        let tail = AtomicI64::new(pack_tail(1, 0));
        {
            let appender = TermAppender::new(heap.region(), &tail);
            for msg in messages {
                assert!(appender.append_unfragmented(msg, None, 7, 8) > 0);
            }
        }
        (heap, tail)
    }

    #[test]
    fn reads_messages_in_order_with_increasing_offsets() {
        let (heap, _tail) = filled_term(&[b"first", b"second message", b"third"]);
        let term = heap.region();

        let mut seen = Vec::new();
        let outcome = read_term(term, 0, usize::MAX, 16, 1, &mut |payload, header| {
            seen.push((payload.to_vec(), header.term_offset));
        });

        assert_eq!(outcome.fragments_read, 3);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, b"first");
        assert_eq!(seen[1].0, b"second message");
        assert_eq!(seen[2].0, b"third");
        // Offsets strictly increase with no overlap.
        assert!(seen.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn stops_at_unpublished_frame() {
        let (heap, _tail) = filled_term(&[b"one"]);
        let term = heap.region();

        // Fake an in-progress frame after the published one.
        frame::set_frame_length_ordered(term, 64, -40);

        let outcome = read_term(term, 0, usize::MAX, 16, 1, &mut |_, _| {});
        assert_eq!(outcome.fragments_read, 1);
        assert_eq!(outcome.offset, 64);
    }

    #[test]
    fn skips_padding_without_invoking_handler() {
        let heap = HeapRegion::new_zeroed(TERM_LENGTH);
        let term = heap.region();

        write_padding_frame(term, 0, 96, 1, 7, 8);
        let tail = AtomicI64::new(pack_tail(1, 96));
        TermAppender::new(term, &tail).append_unfragmented(b"after pad", None, 7, 8);

        let mut seen = Vec::new();
        let outcome = read_term(term, 0, usize::MAX, 16, 1, &mut |payload, _| seen.push(payload.to_vec()));

        assert_eq!(outcome.fragments_read, 1);
        assert_eq!(seen, vec![b"after pad".to_vec()]);
    }

    #[test]
    fn respects_fragment_limit_and_resumes() {
        let (heap, _tail) = filled_term(&[b"a", b"b", b"c", b"d"]);
        let term = heap.region();

        let first = read_term(term, 0, 2, 16, 1, &mut |_, _| {});
        assert_eq!(first.fragments_read, 2);

        let second = read_term(term, first.offset, 2, 16, 1, &mut |_, _| {});
        assert_eq!(second.fragments_read, 2);
        assert!(second.offset > first.offset);
    }

    #[test]
    fn header_flags_and_position_are_exposed() {
        let (heap, _tail) = filled_term(&[b"x"]);
        let term = heap.region();

        read_term(term, 0, 1, 16, 1, &mut |_, header| {
            assert_eq!(header.flags, UNFRAGMENTED);
            assert_eq!(header.session_id, 7);
            assert_eq!(header.stream_id, 8);
            assert_eq!(header.term_id, 1);
            assert_eq!(header.position(), 64); // one aligned frame from term begin
        });
    }

    #[test]
    fn availability_scan_counts_whole_frames() {
        let (heap, _tail) = filled_term(&[b"0123456789", b"0123456789"]);
        let term = heap.region();

        assert_eq!(scan_for_availability(term, 0, TERM_LENGTH), 128);
        assert_eq!(scan_for_availability(term, 0, 70), 64);
        assert_eq!(scan_for_availability(term, 128, TERM_LENGTH), 0);
    }
}
