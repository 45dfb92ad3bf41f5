//! Log buffer metadata layout and position arithmetic.
//!
//! A log is three equal term buffers followed by one metadata page. At any
//! moment exactly one term is active for appends (`active_term_count mod 3`
//! selects it); the other two hold history or stand pre-cleaned for the
//! next rotation.
//!
//! A session's position is a 63-bit byte count decomposing as
//! `((term_id - initial_term_id) << position_bits_to_shift) + term_offset`.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use tern_primitives::Region;

/// Number of term buffers per log.
pub const PARTITION_COUNT: usize = 3;

/// Metadata section length (one page, trailing the terms).
pub const LOG_META_DATA_LENGTH: usize = 4096;

/// Term length bounds; must be a power of two.
pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

/// Page size bounds; must be a power of two.
pub const PAGE_MIN_SIZE: usize = 4 * 1024;
pub const PAGE_MAX_SIZE: usize = 1024 * 1024 * 1024;

/// Absolute cap on a single message regardless of term length.
pub const MAX_MESSAGE_LENGTH_CAP: usize = 16 * 1024 * 1024;

/// Shared metadata for one log buffer.
///
/// Tail counters pack `(term_id << 32) | tail_offset`; the hot fields sit
/// in the first two cache lines, cold configuration after them.
#[repr(C)]
pub struct LogMetadata {
    /// One packed tail per term, CAS/fetch-add target of every append.
    pub term_tail_counters: [AtomicI64; PARTITION_COUNT],
    /// Rotation counter; `active_term_count % 3` is the active index.
    pub active_term_count: AtomicI32,
    _pad0: [u8; 100],
    /// Position at which the producer signalled end-of-stream, or i64::MAX.
    pub end_of_stream_position: AtomicI64,
    /// Non-zero once a consumer is connected.
    pub is_connected: AtomicI32,
    /// Transports actively delivering into this log (network side).
    pub active_transport_count: AtomicI32,
    _pad1: [u8; 112],
    pub correlation_id: i64,
    pub initial_term_id: i32,
    pub mtu_length: i32,
    pub term_length: i32,
    pub page_size: i32,
    _pad2: [u8; 3816],
}

const _: () = assert!(size_of::<LogMetadata>() == LOG_META_DATA_LENGTH);

impl LogMetadata {
    /// One-time initialisation by the log's creator. Tail 0 starts at the
    /// initial term; the other partitions carry the term id they will hold
    /// one full rotation later, so `rotate_log` can verify its CAS target.
    pub fn init(&mut self, correlation_id: i64, initial_term_id: i32, term_length: i32, mtu_length: i32, page_size: i32) {
        self.term_tail_counters[0] = AtomicI64::new(pack_tail(initial_term_id, 0));
        for i in 1..PARTITION_COUNT {
            let expected_term_id = initial_term_id.wrapping_add(i as i32).wrapping_sub(PARTITION_COUNT as i32);
            self.term_tail_counters[i] = AtomicI64::new(pack_tail(expected_term_id, 0));
        }
        self.active_term_count = AtomicI32::new(0);
        self.end_of_stream_position = AtomicI64::new(i64::MAX);
        self.is_connected = AtomicI32::new(0);
        self.active_transport_count = AtomicI32::new(0);
        self.correlation_id = correlation_id;
        self.initial_term_id = initial_term_id;
        self.mtu_length = mtu_length;
        self.term_length = term_length;
        self.page_size = page_size;
    }

    #[inline]
    pub fn active_term_count(&self) -> i32 {
        self.active_term_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn raw_tail_volatile(&self, index: usize) -> i64 {
        self.term_tail_counters[index].load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn set_is_connected(&self, connected: bool) {
        self.is_connected.store(connected as i32, Ordering::Release);
    }

    #[inline]
    pub fn end_of_stream_position(&self) -> i64 {
        self.end_of_stream_position.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_end_of_stream_position(&self, position: i64) {
        self.end_of_stream_position.store(position, Ordering::Release);
    }

    /// View of the metadata page of a mapped log.
    ///
    /// # Safety
    ///
    /// `region` must be the metadata section of an initialised log, and the
    /// backing mapping must outlive the chosen lifetime.
    pub unsafe fn from_region<'a>(region: Region) -> &'a LogMetadata {
        assert!(region.len() >= LOG_META_DATA_LENGTH);
        unsafe { &*(region.as_ptr() as *const LogMetadata) }
    }
}

/// log2 of the term length, the shift between term ids and positions.
#[inline]
pub fn position_bits_to_shift(term_length: i32) -> u32 {
    (term_length as u32).trailing_zeros()
}

#[inline]
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

#[inline]
pub fn term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Tail offset capped at the term length: concurrent trippers push the raw
/// offset past the end, observers must not.
#[inline]
pub fn term_offset(raw_tail: i64, term_length: i64) -> i32 {
    let tail = raw_tail & 0xFFFF_FFFF;
    std::cmp::min(tail, term_length) as i32
}

#[inline]
pub fn index_by_term_count(term_count: i32) -> usize {
    term_count.rem_euclid(PARTITION_COUNT as i32) as usize
}

#[inline]
pub fn index_by_term(initial_term_id: i32, active_term_id: i32) -> usize {
    index_by_term_count(active_term_id.wrapping_sub(initial_term_id))
}

#[inline]
pub fn index_by_position(position: i64, bits_to_shift: u32) -> usize {
    ((position >> bits_to_shift) % PARTITION_COUNT as i64) as usize
}

#[inline]
pub fn compute_term_begin_position(active_term_id: i32, bits_to_shift: u32, initial_term_id: i32) -> i64 {
    (active_term_id.wrapping_sub(initial_term_id) as i64) << bits_to_shift
}

#[inline]
pub fn compute_position(active_term_id: i32, term_offset: i32, bits_to_shift: u32, initial_term_id: i32) -> i64 {
    compute_term_begin_position(active_term_id, bits_to_shift, initial_term_id) + term_offset as i64
}

#[inline]
pub fn compute_term_id_from_position(position: i64, bits_to_shift: u32, initial_term_id: i32) -> i32 {
    ((position >> bits_to_shift) as i32).wrapping_add(initial_term_id)
}

#[inline]
pub fn compute_term_offset_from_position(position: i64, bits_to_shift: u32) -> i32 {
    (position & ((1i64 << bits_to_shift) - 1)) as i32
}

/// Highest position a session can reach before term ids would wrap.
#[inline]
pub fn max_possible_position(term_length: i32) -> i64 {
    (term_length as i64) << 31
}

/// Largest single message: an eighth of a term, capped at 16 MiB.
#[inline]
pub fn compute_max_message_length(term_length: i32) -> usize {
    std::cmp::min(term_length as usize / 8, MAX_MESSAGE_LENGTH_CAP)
}

/// Total file length of a log with the given term length.
#[inline]
pub fn compute_log_length(term_length: usize) -> usize {
    PARTITION_COUNT * term_length + LOG_META_DATA_LENGTH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthError {
    TermTooSmall(usize),
    TermTooLarge(usize),
    NotPowerOfTwo(usize),
    PageTooSmall(usize),
    PageTooLarge(usize),
}

impl std::fmt::Display for LengthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TermTooSmall(v) => write!(f, "term length {v} < min {TERM_MIN_LENGTH}"),
            Self::TermTooLarge(v) => write!(f, "term length {v} > max {TERM_MAX_LENGTH}"),
            Self::NotPowerOfTwo(v) => write!(f, "length {v} is not a power of two"),
            Self::PageTooSmall(v) => write!(f, "page size {v} < min {PAGE_MIN_SIZE}"),
            Self::PageTooLarge(v) => write!(f, "page size {v} > max {PAGE_MAX_SIZE}"),
        }
    }
}

impl std::error::Error for LengthError {}

pub fn check_term_length(term_length: usize) -> Result<(), LengthError> {
    if term_length < TERM_MIN_LENGTH {
        return Err(LengthError::TermTooSmall(term_length));
    }
    if term_length > TERM_MAX_LENGTH {
        return Err(LengthError::TermTooLarge(term_length));
    }
    if !term_length.is_power_of_two() {
        return Err(LengthError::NotPowerOfTwo(term_length));
    }
    Ok(())
}

pub fn check_page_size(page_size: usize) -> Result<(), LengthError> {
    if page_size < PAGE_MIN_SIZE {
        return Err(LengthError::PageTooSmall(page_size));
    }
    if page_size > PAGE_MAX_SIZE {
        return Err(LengthError::PageTooLarge(page_size));
    }
    if !page_size.is_power_of_two() {
        return Err(LengthError::NotPowerOfTwo(page_size));
    }
    Ok(())
}

/// Rotate the log to the next term.
///
/// The caller that observed `TRIPPED` drives this; racing rotators are
/// harmless because both CAS steps verify the state they expect. Returns
/// true if the active term count was advanced by this call.
pub fn rotate_log(metadata: &LogMetadata, current_term_count: i32, current_term_id: i32) -> bool {
    let next_term_id = current_term_id.wrapping_add(1);
    let next_term_count = current_term_count.wrapping_add(1);
    let next_index = index_by_term_count(next_term_count);
    let expected_term_id = next_term_id.wrapping_sub(PARTITION_COUNT as i32);
    let new_raw_tail = pack_tail(next_term_id, 0);

    let tail = &metadata.term_tail_counters[next_index];
    loop {
        let raw_tail = tail.load(Ordering::Acquire);
        if expected_term_id != term_id(raw_tail) {
            break;
        }
        if tail.compare_exchange(raw_tail, new_raw_tail, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            break;
        }
    }

    metadata
        .active_term_count
        .compare_exchange(current_term_count, next_term_count, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_primitives::HeapRegion;

    fn metadata() -> (HeapRegion, &'static LogMetadata) {
        let heap = HeapRegion::new_zeroed(LOG_META_DATA_LENGTH);
        let region = heap.region();
        unsafe {
            let m = &mut *(region.as_ptr() as *mut LogMetadata);
            m.init(42, 100, 64 * 1024, 1408, 4096);
        }
        let m = unsafe { LogMetadata::from_region(region) };
        (heap, m)
    }

    #[test]
    fn position_round_trips() {
        let term_length = 64 * 1024;
        let bits = position_bits_to_shift(term_length);
        assert_eq!(bits, 16);

        let initial = -5;
        for (term_id_, offset) in [(-5, 0), (-4, 1024), (0, 32 * 1024), (7, 0)] {
            let pos = compute_position(term_id_, offset, bits, initial);
            assert_eq!(compute_term_id_from_position(pos, bits, initial), term_id_);
            assert_eq!(compute_term_offset_from_position(pos, bits), offset);
        }
    }

    #[test]
    fn successive_terms_advance_position_by_term_length() {
        let bits = position_bits_to_shift(64 * 1024);
        let p0 = compute_term_begin_position(10, bits, 10);
        let p1 = compute_term_begin_position(11, bits, 10);
        assert_eq!(p0, 0);
        assert_eq!(p1, 64 * 1024);
    }

    #[test]
    fn tail_packing() {
        let raw = pack_tail(7, 4096);
        assert_eq!(term_id(raw), 7);
        assert_eq!(term_offset(raw, 64 * 1024), 4096);

        // Negative term ids survive the packing.
        let raw = pack_tail(-3, 128);
        assert_eq!(term_id(raw), -3);
        assert_eq!(term_offset(raw, 64 * 1024), 128);

        // Offsets past the end are reported as the term length.
        let raw = pack_tail(1, 70 * 1024);
        assert_eq!(term_offset(raw, 64 * 1024), 64 * 1024);
    }

    #[test]
    fn indexes_cycle_through_three_partitions() {
        assert_eq!(index_by_term_count(0), 0);
        assert_eq!(index_by_term_count(1), 1);
        assert_eq!(index_by_term_count(2), 2);
        assert_eq!(index_by_term_count(3), 0);
        assert_eq!(index_by_term(100, 104), 1);
    }

    #[test]
    fn max_message_length_rule() {
        assert_eq!(compute_max_message_length(64 * 1024), 8 * 1024);
        assert_eq!(compute_max_message_length(1024 * 1024 * 1024), MAX_MESSAGE_LENGTH_CAP);
    }

    #[test]
    fn term_length_checks() {
        assert!(check_term_length(64 * 1024).is_ok());
        assert!(matches!(check_term_length(32 * 1024), Err(LengthError::TermTooSmall(_))));
        assert!(matches!(check_term_length(96 * 1024), Err(LengthError::NotPowerOfTwo(_))));
    }

    #[test]
    fn init_seeds_tail_counters_for_rotation() {
        let (_heap, m) = metadata();
        assert_eq!(term_id(m.raw_tail_volatile(0)), 100);
        assert_eq!(term_id(m.raw_tail_volatile(1)), 98);
        assert_eq!(term_id(m.raw_tail_volatile(2)), 99);
    }

    #[test]
    fn rotate_advances_active_term() {
        let (_heap, m) = metadata();

        assert!(rotate_log(m, 0, 100));
        assert_eq!(m.active_term_count(), 1);
        assert_eq!(term_id(m.raw_tail_volatile(1)), 101);
        assert_eq!(term_offset(m.raw_tail_volatile(1), 64 * 1024), 0);

        // A lagging rotator for the same term count is a no-op.
        assert!(!rotate_log(m, 0, 100));
        assert_eq!(m.active_term_count(), 1);
    }
}
