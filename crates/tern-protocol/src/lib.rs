//! Control protocol between tern clients and the tern driver.
//!
//! Commands travel client → driver over the shared command ring; responses
//! travel driver → clients over the broadcast buffer. Both sides find those
//! buffers through the CnC file this crate also describes.

pub mod cnc;
pub mod codec;
pub mod command;
pub mod error_log;
pub mod response;

pub use cnc::{CncError, CncFile, CncLengths, CncMetadata, CNC_FILE, CNC_VERSION};
pub use codec::DecodeError;
pub use error_log::{read_error_log, DistinctErrorLog, ErrorObservation};
pub use response::ErrorCode;
