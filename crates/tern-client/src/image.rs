//! Client-side images.
//!
//! An image is one remote producer session as seen by one subscription.
//! Polling scans published frames from the subscriber's position counter
//! and advances it with release semantics so the driver can compute flow
//! control from it.

use std::collections::HashMap;
use std::rc::Rc;

use tern_logbuffer::descriptor::{
    compute_term_offset_from_position, index_by_position, position_bits_to_shift,
};
use tern_logbuffer::frame::{BEGIN_FRAG_FLAG, END_FRAG_FLAG};
use tern_logbuffer::{read_term, Header, MappedRawLog};
use tern_primitives::counters::propose_max_ordered;
use tern_primitives::CountersReader;

/// Receives `(payload, header)` for each polled fragment.
pub type FragmentHandler<'a> = &'a mut dyn FnMut(&[u8], &Header);

pub struct Image {
    pub(crate) correlation_id: i64,
    pub(crate) session_id: i32,
    pub(crate) source_identity: String,
    pub(crate) log: MappedRawLog,
    pub(crate) counters: Rc<CountersReader>,
    pub(crate) subscriber_position_id: i32,
    pub(crate) is_closed: bool,
}

impl Image {
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Position this image has been consumed to.
    pub fn position(&self) -> i64 {
        self.counters.counter_value(self.subscriber_position_id)
    }

    /// Position at which the producer signalled end-of-stream, or i64::MAX.
    pub fn end_of_stream_position(&self) -> i64 {
        self.log.metadata().end_of_stream_position()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.position() >= self.end_of_stream_position()
    }

    /// Poll up to `fragment_limit` fragments, advancing the subscriber
    /// position past everything consumed.
    pub fn poll(&mut self, handler: FragmentHandler<'_>, fragment_limit: usize) -> usize {
        if self.is_closed {
            return 0;
        }

        let position = self.position();
        let term_length = self.log.term_length() as i32;
        let bits = position_bits_to_shift(term_length);
        let index = index_by_position(position, bits);
        let term_offset = compute_term_offset_from_position(position, bits);
        let metadata = self.log.metadata();

        let outcome = read_term(
            self.log.term(index),
            term_offset as usize,
            fragment_limit,
            bits,
            metadata.initial_term_id,
            handler,
        );

        let new_position = position + (outcome.offset as i64 - term_offset as i64);
        if new_position > position {
            propose_max_ordered(self.counters.counter_addr(self.subscriber_position_id), new_position);
        }

        outcome.fragments_read
    }
}

/// Reassembles BEGIN..END fragment runs into whole messages, per session.
///
/// Wrap a handler with [`FragmentAssembler::handler`] and poll through it;
/// unfragmented frames pass straight through.
#[derive(Default)]
pub struct FragmentAssembler {
    builders: HashMap<i32, Vec<u8>>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<'a>(
        &'a mut self,
        delegate: &'a mut dyn FnMut(&[u8], &Header),
    ) -> impl FnMut(&[u8], &Header) + 'a {
        move |payload: &[u8], header: &Header| {
            let begin = header.flags & BEGIN_FRAG_FLAG != 0;
            let end = header.flags & END_FRAG_FLAG != 0;

            if begin && end {
                delegate(payload, header);
                return;
            }

            if begin {
                let builder = self.builders.entry(header.session_id).or_default();
                builder.clear();
                builder.extend_from_slice(payload);
                return;
            }

            if let Some(builder) = self.builders.get_mut(&header.session_id) {
                // An empty builder means no BEGIN is on record (joined
                // mid-message); drop fragments until the next BEGIN.
                if !builder.is_empty() {
                    builder.extend_from_slice(payload);
                    if end {
                        let message = std::mem::take(builder);
                        delegate(&message, header);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_logbuffer::frame::UNFRAGMENTED;

    fn header(flags: u8, session_id: i32) -> Header {
        Header {
            frame_length: 64,
            version: 0,
            flags,
            frame_type: 1,
            term_offset: 0,
            session_id,
            stream_id: 1,
            term_id: 0,
            reserved_value: 0,
            position_bits_to_shift: 16,
            initial_term_id: 0,
        }
    }

    #[test]
    fn unfragmented_passes_through() {
        let mut assembler = FragmentAssembler::new();
        let mut seen = Vec::new();
        let mut delegate = |payload: &[u8], _h: &Header| seen.push(payload.to_vec());
        let mut wrapped = assembler.handler(&mut delegate);

        wrapped(b"whole", &header(UNFRAGMENTED, 1));
        drop(wrapped);
        assert_eq!(seen, vec![b"whole".to_vec()]);
    }

    #[test]
    fn fragments_reassemble_in_order() {
        let mut assembler = FragmentAssembler::new();
        let mut seen = Vec::new();
        let mut delegate = |payload: &[u8], _h: &Header| seen.push(payload.to_vec());
        let mut wrapped = assembler.handler(&mut delegate);

        wrapped(b"aaa", &header(BEGIN_FRAG_FLAG, 1));
        wrapped(b"bbb", &header(0, 1));
        wrapped(b"ccc", &header(END_FRAG_FLAG, 1));
        drop(wrapped);

        assert_eq!(seen, vec![b"aaabbbccc".to_vec()]);
    }

    #[test]
    fn sessions_do_not_interleave() {
        let mut assembler = FragmentAssembler::new();
        let mut seen = Vec::new();
        let mut delegate = |payload: &[u8], h: &Header| seen.push((h.session_id, payload.to_vec()));
        let mut wrapped = assembler.handler(&mut delegate);

        wrapped(b"s1-a", &header(BEGIN_FRAG_FLAG, 1));
        wrapped(b"s2-a", &header(BEGIN_FRAG_FLAG, 2));
        wrapped(b"s1-b", &header(END_FRAG_FLAG, 1));
        wrapped(b"s2-b", &header(END_FRAG_FLAG, 2));
        drop(wrapped);

        assert_eq!(seen[0], (1, b"s1-as1-b".to_vec()));
        assert_eq!(seen[1], (2, b"s2-as2-b".to_vec()));
    }

    #[test]
    fn orphan_fragments_are_dropped() {
        let mut assembler = FragmentAssembler::new();
        let mut seen: Vec<Vec<u8>> = Vec::new();
        let mut delegate = |payload: &[u8], _h: &Header| seen.push(payload.to_vec());
        let mut wrapped = assembler.handler(&mut delegate);

        // END without BEGIN: joined mid-message.
        wrapped(b"tail", &header(END_FRAG_FLAG, 7));
        drop(wrapped);
        assert!(seen.is_empty());
    }
}
