//! Client-side publications.
//!
//! `offer` and `try_claim` return the new stream position on success or a
//! negative sentinel. They never block and never allocate: the hot path is
//! one limit check, one tail reservation, and a payload copy into the
//! mapped term.

use std::rc::Rc;

use tern_logbuffer::appender::TERM_APPENDER_TRIPPED;
use tern_logbuffer::descriptor::{
    compute_max_message_length, compute_position, compute_term_begin_position, index_by_term_count,
    max_possible_position, position_bits_to_shift, rotate_log, term_id as tail_term_id,
    term_offset as tail_term_offset,
};
use tern_logbuffer::{BufferClaim, ExclusiveTermAppender, MappedRawLog, TermAppender, HEADER_LENGTH};
use tern_primitives::CountersReader;

/// No subscriber is connected; the message was not appended.
pub const NOT_CONNECTED: i64 = -1;
/// The position limit is reached; retry after consumers advance.
pub const BACK_PRESSURED: i64 = -2;
/// An administrative action (term rotation) occurred; retry immediately.
pub const ADMIN_ACTION: i64 = -3;
/// The publication is closed.
pub const CLOSED: i64 = -4;
/// The stream has reached its maximum possible position.
pub const MAX_POSITION_EXCEEDED: i64 = -5;
/// Invalid arguments (message too long).
pub const PUBLICATION_ERROR: i64 = -6;

/// Computes a per-frame reserved value before publication.
pub type ReservedValueSupplier<'a> = &'a dyn Fn(&mut [u8]) -> i64;

/// A shared publication: any number of threads may offer concurrently.
pub struct Publication {
    pub(crate) registration_id: i64,
    pub(crate) original_registration_id: i64,
    pub(crate) channel: String,
    pub(crate) stream_id: i32,
    pub(crate) session_id: i32,
    pub(crate) log: MappedRawLog,
    pub(crate) counters: Rc<CountersReader>,
    pub(crate) position_limit_counter_id: i32,
    pub(crate) is_closed: bool,
}

impl Publication {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    /// Registration id of the underlying shared log (differs from
    /// [`Publication::registration_id`] when this handle joined an
    /// existing publication).
    pub fn original_registration_id(&self) -> i64 {
        self.original_registration_id
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub fn max_message_length(&self) -> usize {
        compute_max_message_length(self.log.term_length() as i32)
    }

    pub fn max_payload_length(&self) -> usize {
        self.log.metadata().mtu_length as usize - HEADER_LENGTH
    }

    /// True once a consumer is attached.
    pub fn is_connected(&self) -> bool {
        self.log.metadata().is_connected()
    }

    /// Current producer position.
    pub fn position(&self) -> i64 {
        let metadata = self.log.metadata();
        let term_length = self.log.term_length() as i64;
        let bits = position_bits_to_shift(term_length as i32);
        let index = index_by_term_count(metadata.active_term_count());
        let raw_tail = metadata.raw_tail_volatile(index);

        compute_position(
            tail_term_id(raw_tail),
            tail_term_offset(raw_tail, term_length),
            bits,
            metadata.initial_term_id,
        )
    }

    /// Current position limit imposed by flow control.
    pub fn position_limit(&self) -> i64 {
        self.counters.counter_value(self.position_limit_counter_id)
    }

    /// Offer a message; returns the new position or a negative sentinel.
    pub fn offer(&self, msg: &[u8]) -> i64 {
        self.offer_with_reserved_value(msg, None)
    }

    pub fn offer_with_reserved_value(
        &self,
        msg: &[u8],
        reserved_value_supplier: Option<ReservedValueSupplier<'_>>,
    ) -> i64 {
        if self.is_closed {
            return CLOSED;
        }

        let metadata = self.log.metadata();
        let term_length = self.log.term_length() as i64;
        let bits = position_bits_to_shift(term_length as i32);
        let initial_term_id = metadata.initial_term_id;

        let term_count = metadata.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = metadata.raw_tail_volatile(index);
        let term_offset = tail_term_offset(raw_tail, term_length) as i64;
        let term_id = tail_term_id(raw_tail);
        let position = compute_term_begin_position(term_id, bits, initial_term_id) + term_offset;

        // A rotation is in flight; let the rotator finish and retry.
        if term_count != term_id.wrapping_sub(initial_term_id) {
            return ADMIN_ACTION;
        }

        let limit = self.position_limit();
        if position >= max_possible_position(term_length as i32) {
            return MAX_POSITION_EXCEEDED;
        }
        if position >= limit {
            return self.back_pressure_status();
        }

        let appender = TermAppender::new(self.log.term(index), &metadata.term_tail_counters[index]);
        let resulting_offset = if msg.len() <= self.max_payload_length() {
            appender.append_unfragmented(msg, reserved_value_supplier, self.session_id, self.stream_id)
        } else {
            if msg.len() > self.max_message_length() {
                return PUBLICATION_ERROR;
            }
            appender.append_fragmented(
                msg,
                self.max_payload_length(),
                reserved_value_supplier,
                self.session_id,
                self.stream_id,
            )
        };

        self.new_position(term_count, term_id, term_offset, position, resulting_offset)
    }

    /// Offer a message gathered from multiple buffers.
    pub fn offerv(&self, iov: &[&[u8]]) -> i64 {
        if self.is_closed {
            return CLOSED;
        }

        let total_length: usize = iov.iter().map(|v| v.len()).sum();
        if total_length > self.max_message_length() {
            return PUBLICATION_ERROR;
        }

        let metadata = self.log.metadata();
        let term_length = self.log.term_length() as i64;
        let bits = position_bits_to_shift(term_length as i32);
        let initial_term_id = metadata.initial_term_id;

        let term_count = metadata.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = metadata.raw_tail_volatile(index);
        let term_offset = tail_term_offset(raw_tail, term_length) as i64;
        let term_id = tail_term_id(raw_tail);
        let position = compute_term_begin_position(term_id, bits, initial_term_id) + term_offset;

        if term_count != term_id.wrapping_sub(initial_term_id) {
            return ADMIN_ACTION;
        }
        if position >= max_possible_position(term_length as i32) {
            return MAX_POSITION_EXCEEDED;
        }
        if position >= self.position_limit() {
            return self.back_pressure_status();
        }

        let appender = TermAppender::new(self.log.term(index), &metadata.term_tail_counters[index]);
        let resulting_offset =
            appender.append_vec(iov, self.max_payload_length(), None, self.session_id, self.stream_id);

        self.new_position(term_count, term_id, term_offset, position, resulting_offset)
    }

    /// Claim a frame for zero-copy writing. On success the claim must be
    /// committed or aborted promptly.
    pub fn try_claim(&self, length: usize) -> (i64, Option<BufferClaim>) {
        if self.is_closed {
            return (CLOSED, None);
        }
        if length > self.max_payload_length() {
            return (PUBLICATION_ERROR, None);
        }

        let metadata = self.log.metadata();
        let term_length = self.log.term_length() as i64;
        let bits = position_bits_to_shift(term_length as i32);
        let initial_term_id = metadata.initial_term_id;

        let term_count = metadata.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = metadata.raw_tail_volatile(index);
        let term_offset = tail_term_offset(raw_tail, term_length) as i64;
        let term_id = tail_term_id(raw_tail);
        let position = compute_term_begin_position(term_id, bits, initial_term_id) + term_offset;

        if term_count != term_id.wrapping_sub(initial_term_id) {
            return (ADMIN_ACTION, None);
        }
        if position >= max_possible_position(term_length as i32) {
            return (MAX_POSITION_EXCEEDED, None);
        }
        if position >= self.position_limit() {
            return (self.back_pressure_status(), None);
        }

        let appender = TermAppender::new(self.log.term(index), &metadata.term_tail_counters[index]);
        let (resulting_offset, claim) = appender.claim(length, self.session_id, self.stream_id);

        (
            self.new_position(term_count, term_id, term_offset, position, resulting_offset),
            claim,
        )
    }

    fn new_position(
        &self,
        term_count: i32,
        term_id: i32,
        term_offset: i64,
        position: i64,
        resulting_offset: i32,
    ) -> i64 {
        if resulting_offset > 0 {
            return (position - term_offset) + resulting_offset as i64;
        }

        if resulting_offset == TERM_APPENDER_TRIPPED {
            // Pre-clean the term two ahead so rotation hands over a
            // writable buffer, then advance the active term.
            let next_next_index = index_by_term_count(term_count.wrapping_add(2));
            self.log.pre_clean_term(next_next_index);
            rotate_log(self.log.metadata(), term_count, term_id);
        }

        ADMIN_ACTION
    }

    fn back_pressure_status(&self) -> i64 {
        if self.is_connected() {
            BACK_PRESSURED
        } else {
            NOT_CONNECTED
        }
    }

    pub(crate) fn close(&mut self) {
        self.is_closed = true;
    }
}

/// An exclusive publication: a single writer that tracks its own term
/// state, avoiding the atomic reservation of the shared path.
pub struct ExclusivePublication {
    pub(crate) registration_id: i64,
    pub(crate) channel: String,
    pub(crate) stream_id: i32,
    pub(crate) session_id: i32,
    pub(crate) log: MappedRawLog,
    pub(crate) counters: Rc<CountersReader>,
    pub(crate) position_limit_counter_id: i32,
    pub(crate) is_closed: bool,
    term_count: i32,
    term_id: i32,
    term_offset: i32,
}

impl ExclusivePublication {
    pub(crate) fn new(
        registration_id: i64,
        channel: String,
        stream_id: i32,
        session_id: i32,
        log: MappedRawLog,
        counters: Rc<CountersReader>,
        position_limit_counter_id: i32,
    ) -> Self {
        let metadata = log.metadata();
        let term_count = metadata.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = metadata.raw_tail_volatile(index);
        let term_length = log.term_length() as i64;

        Self {
            registration_id,
            channel,
            stream_id,
            session_id,
            term_count,
            term_id: tail_term_id(raw_tail),
            term_offset: tail_term_offset(raw_tail, term_length),
            log,
            counters,
            position_limit_counter_id,
            is_closed: false,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn is_connected(&self) -> bool {
        self.log.metadata().is_connected()
    }

    pub fn max_payload_length(&self) -> usize {
        self.log.metadata().mtu_length as usize - HEADER_LENGTH
    }

    pub fn max_message_length(&self) -> usize {
        compute_max_message_length(self.log.term_length() as i32)
    }

    /// Position of the single writer.
    pub fn position(&self) -> i64 {
        let bits = position_bits_to_shift(self.log.term_length() as i32);
        compute_position(
            self.term_id,
            self.term_offset,
            bits,
            self.log.metadata().initial_term_id,
        )
    }

    pub fn offer(&mut self, msg: &[u8]) -> i64 {
        self.offer_with_reserved_value(msg, None)
    }

    pub fn offer_with_reserved_value(
        &mut self,
        msg: &[u8],
        reserved_value_supplier: Option<ReservedValueSupplier<'_>>,
    ) -> i64 {
        if self.is_closed {
            return CLOSED;
        }

        let position = self.position();
        let term_length = self.log.term_length() as i64;

        if position >= max_possible_position(term_length as i32) {
            return MAX_POSITION_EXCEEDED;
        }
        if position >= self.counters.counter_value(self.position_limit_counter_id) {
            return if self.is_connected() { BACK_PRESSURED } else { NOT_CONNECTED };
        }

        let index = index_by_term_count(self.term_count);
        let appender =
            ExclusiveTermAppender::new(self.log.term(index), &self.log.metadata().term_tail_counters[index]);

        let resulting_offset = if msg.len() <= self.max_payload_length() {
            appender.append_unfragmented(
                self.term_id,
                self.term_offset,
                msg,
                reserved_value_supplier,
                self.session_id,
                self.stream_id,
            )
        } else {
            if msg.len() > self.max_message_length() {
                return PUBLICATION_ERROR;
            }
            appender.append_fragmented(
                self.term_id,
                self.term_offset,
                msg,
                self.max_payload_length(),
                reserved_value_supplier,
                self.session_id,
                self.stream_id,
            )
        };

        if resulting_offset == TERM_APPENDER_TRIPPED {
            self.rotate_term();
            return ADMIN_ACTION;
        }

        let old_term_offset = self.term_offset as i64;
        self.term_offset = resulting_offset;
        position + (resulting_offset as i64 - old_term_offset)
    }

    /// Claim a frame for zero-copy writing.
    pub fn try_claim(&mut self, length: usize) -> (i64, Option<BufferClaim>) {
        if self.is_closed {
            return (CLOSED, None);
        }
        if length > self.max_payload_length() {
            return (PUBLICATION_ERROR, None);
        }

        let position = self.position();
        let term_length = self.log.term_length() as i64;

        if position >= max_possible_position(term_length as i32) {
            return (MAX_POSITION_EXCEEDED, None);
        }
        if position >= self.counters.counter_value(self.position_limit_counter_id) {
            let status = if self.is_connected() { BACK_PRESSURED } else { NOT_CONNECTED };
            return (status, None);
        }

        let index = index_by_term_count(self.term_count);
        let appender =
            ExclusiveTermAppender::new(self.log.term(index), &self.log.metadata().term_tail_counters[index]);

        let (resulting_offset, claim) =
            appender.claim(self.term_id, self.term_offset, length, self.session_id, self.stream_id);

        if resulting_offset == TERM_APPENDER_TRIPPED {
            self.rotate_term();
            return (ADMIN_ACTION, None);
        }

        let old_offset = self.term_offset as i64;
        self.term_offset = resulting_offset;
        ((position - old_offset) + resulting_offset as i64, claim)
    }

    fn rotate_term(&mut self) {
        let next_next_index = index_by_term_count(self.term_count.wrapping_add(2));
        self.log.pre_clean_term(next_next_index);
        rotate_log(self.log.metadata(), self.term_count, self.term_id);

        self.term_count = self.term_count.wrapping_add(1);
        self.term_id = self.term_id.wrapping_add(1);
        self.term_offset = 0;
    }

    pub(crate) fn close(&mut self) {
        self.is_closed = true;
    }
}
