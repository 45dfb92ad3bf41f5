//! Shared-memory primitives for the tern transport.
//!
//! Everything in this crate operates over [`region::Region`] views of
//! memory that is usually a `MAP_SHARED` file mapping: the command ring
//! clients write to, the broadcast buffer the driver answers on, and the
//! counters both sides observe. Synchronisation is done entirely with
//! atomics embedded in the shared layouts; nothing here blocks.

pub mod broadcast;
pub mod clock;
pub mod counters;
pub mod idle;
pub mod mmap;
pub mod rb;
pub mod region;

pub use broadcast::{BroadcastLoss, BroadcastReceiver, BroadcastTransmitter, BROADCAST_TRAILER_LENGTH};
pub use clock::{epoch_time_ms, nano_time, CachedClock};
pub use counters::{CountersManager, CountersReader};
pub use idle::{IdleStrategy, Idler};
pub use mmap::MmapRegion;
pub use rb::{RingBuffer, RingWriteError, RB_TRAILER_LENGTH};
pub use region::{align_up, HeapRegion, Region, CACHE_LINE_LENGTH};
