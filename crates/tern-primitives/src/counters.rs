//! Shared-memory counters.
//!
//! Counters are the observable state of the driver: positions, limits,
//! channel statuses, client heartbeats. Metadata records (512 bytes) live
//! in one region, values (128-byte stride) in another, so hot value writes
//! never share a cache line with cold labels.
//!
//! The manager is owned by the driver conductor and is not itself
//! thread-safe; the *values* are atomics and may be read or written from
//! any process that maps the values region.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::region::Region;

/// Stride of one metadata record.
pub const METADATA_LENGTH: usize = 512;

/// Stride of one value record.
pub const VALUE_LENGTH: usize = 128;

/// Max key blob length within a metadata record.
pub const MAX_KEY_LENGTH: usize = 112;

/// Max label length within a metadata record.
pub const MAX_LABEL_LENGTH: usize = 380;

/// Record states.
pub const RECORD_UNUSED: i32 = 0;
pub const RECORD_ALLOCATED: i32 = 1;
pub const RECORD_RECLAIMED: i32 = -1;

/// Deadline value meaning "not reclaimable yet".
pub const NOT_FREE_TO_REUSE: i64 = i64::MAX;

/// Counter type ids used by the driver.
pub mod type_ids {
    pub const SYSTEM: i32 = 0;
    pub const PUBLISHER_LIMIT: i32 = 1;
    pub const SENDER_POSITION: i32 = 2;
    pub const RECEIVER_HWM: i32 = 3;
    pub const SUBSCRIBER_POSITION: i32 = 4;
    pub const RECEIVER_POSITION: i32 = 5;
    pub const SEND_CHANNEL_STATUS: i32 = 6;
    pub const RECEIVE_CHANNEL_STATUS: i32 = 7;
    pub const SENDER_LIMIT: i32 = 9;
    pub const CLIENT_HEARTBEAT: i32 = 11;
    pub const PUBLISHER_POSITION: i32 = 12;
}

#[repr(C)]
struct CounterMetadata {
    state: AtomicI32,
    type_id: i32,
    free_for_reuse_deadline_ms: AtomicI64,
    key: [u8; MAX_KEY_LENGTH],
    label_length: AtomicI32,
    label: [u8; MAX_LABEL_LENGTH],
}

const _: () = assert!(size_of::<CounterMetadata>() == METADATA_LENGTH);

#[repr(C)]
struct CounterValue {
    counter_value: AtomicI64,
    registration_id: AtomicI64,
    owner_id: i64,
    _pad: [u8; VALUE_LENGTH - 24],
}

const _: () = assert!(size_of::<CounterValue>() == VALUE_LENGTH);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountersError {
    /// Metadata and values regions do not describe the same record count.
    MismatchedBufferSizes,
    /// All counter slots are allocated.
    Exhausted,
}

impl std::fmt::Display for CountersError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MismatchedBufferSizes => write!(f, "counters metadata/values length mismatch"),
            Self::Exhausted => write!(f, "no free counter slots"),
        }
    }
}

impl std::error::Error for CountersError {}

/// Allocator side, owned by the driver conductor.
pub struct CountersManager {
    reader: CountersReader,
    free_list: Vec<i32>,
    id_high_water_mark: i32,
    free_to_reuse_timeout_ms: i64,
}

impl CountersManager {
    pub fn new(
        metadata: Region,
        values: Region,
        free_to_reuse_timeout_ms: i64,
    ) -> Result<Self, CountersError> {
        let reader = CountersReader::new(metadata, values)?;
        Ok(Self {
            reader,
            free_list: Vec::new(),
            id_high_water_mark: -1,
            free_to_reuse_timeout_ms,
        })
    }

    #[inline]
    pub fn reader(&self) -> &CountersReader {
        &self.reader
    }

    #[inline]
    pub fn max_counter_id(&self) -> i32 {
        self.reader.max_counter_id()
    }

    /// Allocate a counter, preferring reclaimed slots whose reuse deadline
    /// has passed. The value is zeroed before the metadata goes live.
    pub fn allocate(
        &mut self,
        now_ms: i64,
        type_id: i32,
        key: &[u8],
        label: &str,
        registration_id: i64,
        owner_id: i64,
    ) -> Result<i32, CountersError> {
        let counter_id = self.next_counter_id(now_ms)?;

        // SAFETY: the conductor is the only writer of metadata records, and
        // this slot is not ALLOCATED so no reader dereferences it yet.
        unsafe {
            let m = self.reader.metadata_ptr(counter_id);
            (*m).free_for_reuse_deadline_ms.store(NOT_FREE_TO_REUSE, Ordering::Relaxed);
            (*m).type_id = type_id;
            (*m).key = [0; MAX_KEY_LENGTH];
            let key_len = key.len().min(MAX_KEY_LENGTH);
            (&mut (*m).key)[..key_len].copy_from_slice(&key[..key_len]);

            let label_bytes = label.as_bytes();
            let label_len = label_bytes.len().min(MAX_LABEL_LENGTH);
            (*m).label = [0; MAX_LABEL_LENGTH];
            (&mut (*m).label)[..label_len].copy_from_slice(&label_bytes[..label_len]);
            (*m).label_length.store(label_len as i32, Ordering::Relaxed);
        }

        let value = self.reader.value(counter_id);
        value.counter_value.store(0, Ordering::Relaxed);
        value.registration_id.store(registration_id, Ordering::Relaxed);
        unsafe {
            (*self.reader.value_ptr(counter_id)).owner_id = owner_id;
        }

        self.reader.metadata(counter_id).state.store(RECORD_ALLOCATED, Ordering::Release);
        Ok(counter_id)
    }

    /// Release a counter. The slot becomes reusable once the reuse timeout
    /// elapses, giving observers time to see the reclaimed state.
    pub fn free(&mut self, now_ms: i64, counter_id: i32) {
        let metadata = self.reader.metadata(counter_id);
        metadata.state.store(RECORD_RECLAIMED, Ordering::Release);
        metadata
            .free_for_reuse_deadline_ms
            .store(now_ms + self.free_to_reuse_timeout_ms, Ordering::Release);
        self.free_list.push(counter_id);
    }

    #[inline]
    pub fn set_value(&self, counter_id: i32, value: i64) {
        self.reader.value(counter_id).counter_value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn get_value(&self, counter_id: i32) -> i64 {
        self.reader.counter_value(counter_id)
    }

    fn next_counter_id(&mut self, now_ms: i64) -> Result<i32, CountersError> {
        for i in 0..self.free_list.len() {
            let counter_id = self.free_list[i];
            let deadline = self
                .reader
                .metadata(counter_id)
                .free_for_reuse_deadline_ms
                .load(Ordering::Acquire);

            if now_ms >= deadline {
                self.free_list.remove(i);
                return Ok(counter_id);
            }
        }

        if self.id_high_water_mark + 1 > self.reader.max_counter_id() {
            return Err(CountersError::Exhausted);
        }

        self.id_high_water_mark += 1;
        Ok(self.id_high_water_mark)
    }
}

/// Read-only view over the two counter regions; clients construct this
/// from the CnC mapping.
pub struct CountersReader {
    metadata: Region,
    values: Region,
    max_counter_id: i32,
}

impl CountersReader {
    pub fn new(metadata: Region, values: Region) -> Result<Self, CountersError> {
        let by_metadata = metadata.len() / METADATA_LENGTH;
        let by_values = values.len() / VALUE_LENGTH;
        if by_metadata == 0 || by_metadata != by_values {
            return Err(CountersError::MismatchedBufferSizes);
        }

        Ok(Self { metadata, values, max_counter_id: (by_metadata - 1) as i32 })
    }

    #[inline]
    pub fn max_counter_id(&self) -> i32 {
        self.max_counter_id
    }

    #[inline]
    fn metadata(&self, counter_id: i32) -> &CounterMetadata {
        assert!((0..=self.max_counter_id).contains(&counter_id));
        unsafe { &*(self.metadata.offset(counter_id as usize * METADATA_LENGTH) as *const CounterMetadata) }
    }

    #[inline]
    fn metadata_ptr(&self, counter_id: i32) -> *mut CounterMetadata {
        assert!((0..=self.max_counter_id).contains(&counter_id));
        self.metadata.offset(counter_id as usize * METADATA_LENGTH) as *mut CounterMetadata
    }

    #[inline]
    fn value(&self, counter_id: i32) -> &CounterValue {
        assert!((0..=self.max_counter_id).contains(&counter_id));
        unsafe { &*(self.values.offset(counter_id as usize * VALUE_LENGTH) as *const CounterValue) }
    }

    #[inline]
    fn value_ptr(&self, counter_id: i32) -> *mut CounterValue {
        assert!((0..=self.max_counter_id).contains(&counter_id));
        self.values.offset(counter_id as usize * VALUE_LENGTH) as *mut CounterValue
    }

    /// The shared atomic for a counter's value. Valid for the lifetime of
    /// the backing mapping.
    #[inline]
    pub fn counter_addr(&self, counter_id: i32) -> &AtomicI64 {
        &self.value(counter_id).counter_value
    }

    #[inline]
    pub fn counter_value(&self, counter_id: i32) -> i64 {
        self.value(counter_id).counter_value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn counter_registration_id(&self, counter_id: i32) -> i64 {
        self.value(counter_id).registration_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn counter_state(&self, counter_id: i32) -> i32 {
        self.metadata(counter_id).state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn counter_type_id(&self, counter_id: i32) -> i32 {
        self.metadata(counter_id).type_id
    }

    pub fn counter_label(&self, counter_id: i32) -> String {
        let metadata = self.metadata(counter_id);
        let length = metadata.label_length.load(Ordering::Acquire).clamp(0, MAX_LABEL_LENGTH as i32);
        String::from_utf8_lossy(&metadata.label[..length as usize]).into_owned()
    }

    pub fn counter_key(&self, counter_id: i32) -> &[u8] {
        &self.metadata(counter_id).key
    }

    /// Visit every allocated counter in id order. Iteration stops at the
    /// first unused slot, which bounds the scan to the high-water mark.
    pub fn foreach(&self, mut func: impl FnMut(i32, i32, i64, &str)) {
        for counter_id in 0..=self.max_counter_id {
            let metadata = self.metadata(counter_id);
            let state = metadata.state.load(Ordering::Acquire);

            if state == RECORD_UNUSED {
                break;
            }

            if state == RECORD_ALLOCATED {
                let label = self.counter_label(counter_id);
                func(
                    counter_id,
                    metadata.type_id,
                    self.counter_registration_id(counter_id),
                    &label,
                );
            }
        }
    }
}

/// Propose a new maximum for a shared position counter.
pub fn propose_max_ordered(addr: &AtomicI64, proposed: i64) -> bool {
    let current = addr.load(Ordering::Relaxed);
    if proposed > current {
        addr.store(proposed, Ordering::Release);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn make(num_counters: usize) -> (HeapRegion, HeapRegion, CountersManager) {
        let metadata = HeapRegion::new_zeroed(num_counters * METADATA_LENGTH);
        let values = HeapRegion::new_zeroed(num_counters * VALUE_LENGTH);
        let manager = CountersManager::new(metadata.region(), values.region(), 1_000).unwrap();
        (metadata, values, manager)
    }

    #[test]
    fn allocate_assigns_increasing_ids() {
        let (_m, _v, mut manager) = make(8);
        let a = manager.allocate(0, type_ids::PUBLISHER_LIMIT, b"", "pub-lmt", 10, -1).unwrap();
        let b = manager.allocate(0, type_ids::SUBSCRIBER_POSITION, b"", "sub-pos", 11, -1).unwrap();
        assert_eq!((a, b), (0, 1));

        let reader = manager.reader();
        assert_eq!(reader.counter_state(a), RECORD_ALLOCATED);
        assert_eq!(reader.counter_type_id(b), type_ids::SUBSCRIBER_POSITION);
        assert_eq!(reader.counter_registration_id(b), 11);
        assert_eq!(reader.counter_label(a), "pub-lmt");
    }

    #[test]
    fn freed_slot_not_reused_before_deadline() {
        let (_m, _v, mut manager) = make(8);
        let a = manager.allocate(0, 1, b"", "a", 1, -1).unwrap();
        manager.free(100, a);

        // Deadline is 100 + 1000; a fresh slot must be used before then.
        let b = manager.allocate(500, 1, b"", "b", 2, -1).unwrap();
        assert_ne!(b, a);

        // After the deadline the reclaimed slot comes back, zeroed.
        manager.set_value(b, 99);
        let c = manager.allocate(1_200, 1, b"", "c", 3, -1).unwrap();
        assert_eq!(c, a);
        assert_eq!(manager.get_value(c), 0);
    }

    #[test]
    fn exhaustion_is_reported() {
        let (_m, _v, mut manager) = make(2);
        manager.allocate(0, 1, b"", "a", 1, -1).unwrap();
        manager.allocate(0, 1, b"", "b", 2, -1).unwrap();
        assert_eq!(
            manager.allocate(0, 1, b"", "c", 3, -1).err(),
            Some(CountersError::Exhausted)
        );
    }

    #[test]
    fn foreach_skips_reclaimed_and_stops_at_unused() {
        let (_m, _v, mut manager) = make(8);
        let a = manager.allocate(0, 1, b"", "a", 1, -1).unwrap();
        let b = manager.allocate(0, 2, b"", "b", 2, -1).unwrap();
        manager.free(0, a);

        let mut seen = Vec::new();
        manager.reader().foreach(|id, type_id, _, label| seen.push((id, type_id, label.to_string())));
        assert_eq!(seen, vec![(b, 2, "b".to_string())]);
    }

    #[test]
    fn propose_max_only_moves_forward() {
        let (_m, _v, mut manager) = make(2);
        let id = manager.allocate(0, 1, b"", "pos", 1, -1).unwrap();
        let addr = manager.reader().counter_addr(id);

        assert!(propose_max_ordered(addr, 100));
        assert!(!propose_max_ordered(addr, 50));
        assert_eq!(addr.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn long_label_is_truncated() {
        let (_m, _v, mut manager) = make(2);
        let long = "x".repeat(MAX_LABEL_LENGTH + 50);
        let id = manager.allocate(0, 1, b"", &long, 1, -1).unwrap();
        assert_eq!(manager.reader().counter_label(id).len(), MAX_LABEL_LENGTH);
    }
}
