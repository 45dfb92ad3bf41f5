//! Driver-side publications.
//!
//! A publication owns the mapped log producers append to, the position and
//! limit counters around it, and a refcount across the clients sharing it.
//! Lifecycle runs entirely inside the conductor's duty cycle: when the
//! last reference drops the publication drains, lingers for its configured
//! timeout so late consumers can finish, then frees its log and counters.

use tern_logbuffer::descriptor::{
    compute_position, index_by_term_count, position_bits_to_shift, term_id, term_offset,
};
use tern_logbuffer::MappedRawLog;
use tern_primitives::CountersManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationState {
    Active,
    Draining,
    Linger,
    Done,
}

/// A publication onto a network channel.
pub struct NetworkPublication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub endpoint_registration_id: i64,
    pub log: MappedRawLog,
    pub channel: String,
    pub pub_pos_counter_id: i32,
    pub pub_lmt_counter_id: i32,
    pub snd_pos_counter_id: i32,
    pub snd_lmt_counter_id: i32,
    pub initial_term_id: i32,
    pub window_length: usize,
    pub is_exclusive: bool,
    pub signal_eos: bool,
    pub entity_tag: Option<i64>,
    pub linger_timeout_ns: i64,
    pub refcount: i32,
    pub state: PublicationState,
    pub time_of_last_state_change_ns: i64,
}

impl NetworkPublication {
    /// Position of the producer, read from the active term tail.
    pub fn producer_position(&self) -> i64 {
        let metadata = self.log.metadata();
        let term_count = metadata.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = metadata.raw_tail_volatile(index);
        let term_length = self.log.term_length() as i64;

        compute_position(
            term_id(raw_tail),
            term_offset(raw_tail, term_length),
            position_bits_to_shift(term_length as i32),
            self.initial_term_id,
        )
    }

    /// Update the producer limit from the sender's progress. With no
    /// connected receivers the limit stays put and producers see
    /// back pressure or not-connected.
    pub fn update_pub_lmt(&self, counters: &CountersManager) -> usize {
        if !self.log.metadata().is_connected() {
            return 0;
        }

        let snd_pos = counters.get_value(self.snd_pos_counter_id);
        let proposed = snd_pos + self.window_length as i64;
        let current = counters.get_value(self.pub_lmt_counter_id);

        if proposed > current {
            counters.set_value(self.pub_lmt_counter_id, proposed);
            return 1;
        }
        0
    }

    pub fn incref(&mut self) {
        self.refcount += 1;
    }

    pub fn decref(&mut self, now_ns: i64) -> i32 {
        self.refcount -= 1;
        if self.refcount <= 0 {
            self.state = PublicationState::Draining;
            self.time_of_last_state_change_ns = now_ns;

            if self.signal_eos {
                self.log.metadata().set_end_of_stream_position(self.producer_position());
            }
        }
        self.refcount
    }

    /// Advance the lifecycle; returns true when the publication reached
    /// end of life and should be deleted.
    pub fn on_time_event(&mut self, now_ns: i64, counters: &CountersManager) -> bool {
        match self.state {
            PublicationState::Active => {
                counters.set_value(self.pub_pos_counter_id, self.producer_position());
                false
            }
            PublicationState::Draining => {
                // Drained when the sender has caught the producer; with no
                // sender attached the producer position is the bar.
                let snd_pos = counters.get_value(self.snd_pos_counter_id);
                if snd_pos >= self.producer_position() || !self.log.metadata().is_connected() {
                    self.state = PublicationState::Linger;
                    self.time_of_last_state_change_ns = now_ns;
                }
                false
            }
            PublicationState::Linger => {
                if now_ns - self.time_of_last_state_change_ns > self.linger_timeout_ns {
                    self.state = PublicationState::Done;
                }
                false
            }
            PublicationState::Done => true,
        }
    }
}

/// A publication between processes on the same driver, no network leg.
pub struct IpcPublication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub log: MappedRawLog,
    pub channel: String,
    pub pub_pos_counter_id: i32,
    pub pub_lmt_counter_id: i32,
    pub initial_term_id: i32,
    pub window_length: usize,
    pub is_exclusive: bool,
    pub signal_eos: bool,
    pub entity_tag: Option<i64>,
    pub linger_timeout_ns: i64,
    pub refcount: i32,
    pub state: PublicationState,
    pub time_of_last_state_change_ns: i64,
    /// Subscriber position counters bounding the producer window.
    pub subscriber_position_ids: Vec<(i64, i32)>,
}

impl IpcPublication {
    pub fn producer_position(&self) -> i64 {
        let metadata = self.log.metadata();
        let term_count = metadata.active_term_count();
        let index = index_by_term_count(term_count);
        let raw_tail = metadata.raw_tail_volatile(index);
        let term_length = self.log.term_length() as i64;

        compute_position(
            term_id(raw_tail),
            term_offset(raw_tail, term_length),
            position_bits_to_shift(term_length as i32),
            self.initial_term_id,
        )
    }

    /// Producer limit: minimum consumer position plus the window. Without
    /// consumers the limit does not advance.
    pub fn update_pub_lmt(&self, counters: &CountersManager) -> usize {
        if self.subscriber_position_ids.is_empty() {
            return 0;
        }

        let min_sub_pos = self
            .subscriber_position_ids
            .iter()
            .map(|&(_, counter_id)| counters.get_value(counter_id))
            .min()
            .unwrap_or(0);

        let proposed = min_sub_pos + self.window_length as i64;
        if proposed > counters.get_value(self.pub_lmt_counter_id) {
            counters.set_value(self.pub_lmt_counter_id, proposed);
            return 1;
        }
        0
    }

    pub fn is_drained(&self, counters: &CountersManager) -> bool {
        let position = self.producer_position();
        self.subscriber_position_ids
            .iter()
            .all(|&(_, counter_id)| counters.get_value(counter_id) >= position)
    }

    pub fn incref(&mut self) {
        self.refcount += 1;
    }

    pub fn decref(&mut self, now_ns: i64) -> i32 {
        self.refcount -= 1;
        if self.refcount <= 0 {
            self.state = PublicationState::Draining;
            self.time_of_last_state_change_ns = now_ns;

            if self.signal_eos {
                self.log.metadata().set_end_of_stream_position(self.producer_position());
            }
        }
        self.refcount
    }

    pub fn on_time_event(&mut self, now_ns: i64, counters: &CountersManager) -> bool {
        match self.state {
            PublicationState::Active => {
                counters.set_value(self.pub_pos_counter_id, self.producer_position());
                self.update_pub_lmt(counters);
                false
            }
            PublicationState::Draining => {
                if self.is_drained(counters) || self.subscriber_position_ids.is_empty() {
                    self.state = PublicationState::Linger;
                    self.time_of_last_state_change_ns = now_ns;
                }
                false
            }
            PublicationState::Linger => {
                if now_ns - self.time_of_last_state_change_ns > self.linger_timeout_ns {
                    self.state = PublicationState::Done;
                }
                false
            }
            PublicationState::Done => true,
        }
    }
}
