//! Log buffers and term appenders for the tern transport.
//!
//! A log buffer is a memory-mapped file of three equal term buffers plus a
//! metadata page. Producers append framed messages to the active term with
//! a single atomic tail reservation (shared publications) or a plain store
//! (exclusive publications); consumers scan published frames bounded by
//! position counters. Rotation hands the append point to the next term
//! when a reservation trips over the end of the active one.

pub mod appender;
pub mod descriptor;
pub mod exclusive;
pub mod frame;
pub mod log;
pub mod reader;

pub use appender::{BufferClaim, TermAppender, TERM_APPENDER_FAILED, TERM_APPENDER_TRIPPED};
pub use descriptor::{LogMetadata, LOG_META_DATA_LENGTH, PARTITION_COUNT};
pub use exclusive::ExclusiveTermAppender;
pub use frame::{Header, FRAME_ALIGNMENT, HEADER_LENGTH};
pub use log::{LogError, LogParams, MappedRawLog};
pub use reader::{read_term, scan_for_availability, ReadOutcome};
