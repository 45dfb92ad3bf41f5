//! Responses: driver → clients, over the broadcast buffer.
//!
//! Every response names the correlation id of the command that caused it
//! (or, for unsolicited events such as image availability, the correlation
//! id of the resource it describes).

use crate::codec::{DecodeError, Reader, Writer};

/// Response type ids (broadcast record `msg_type_id`).
pub mod type_id {
    pub const ON_ERROR: i32 = 0x0F01;
    pub const ON_AVAILABLE_IMAGE: i32 = 0x0F02;
    pub const ON_PUBLICATION_READY: i32 = 0x0F03;
    pub const ON_OPERATION_SUCCESS: i32 = 0x0F04;
    pub const ON_UNAVAILABLE_IMAGE: i32 = 0x0F05;
    pub const ON_EXCLUSIVE_PUBLICATION_READY: i32 = 0x0F06;
    pub const ON_SUBSCRIPTION_READY: i32 = 0x0F07;
    pub const ON_COUNTER_READY: i32 = 0x0F08;
    pub const ON_UNAVAILABLE_COUNTER: i32 = 0x0F09;
    pub const ON_CLIENT_TIMEOUT: i32 = 0x0F0A;
}

/// Control-plane error codes carried in [`ErrorResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    GenericError = 0,
    InvalidChannel = 1,
    UnknownSubscription = 2,
    UnknownPublication = 3,
    ChannelEndpointError = 4,
    UnknownCounter = 5,
    UnknownCommandTypeId = 6,
    MalformedCommand = 7,
    NotSupported = 8,
}

impl ErrorCode {
    pub fn from_i32(v: i32) -> ErrorCode {
        match v {
            1 => ErrorCode::InvalidChannel,
            2 => ErrorCode::UnknownSubscription,
            3 => ErrorCode::UnknownPublication,
            4 => ErrorCode::ChannelEndpointError,
            5 => ErrorCode::UnknownCounter,
            6 => ErrorCode::UnknownCommandTypeId,
            7 => ErrorCode::MalformedCommand,
            8 => ErrorCode::NotSupported,
            _ => ErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::GenericError => "generic error",
            ErrorCode::InvalidChannel => "invalid channel",
            ErrorCode::UnknownSubscription => "unknown subscription",
            ErrorCode::UnknownPublication => "unknown publication",
            ErrorCode::ChannelEndpointError => "channel endpoint error",
            ErrorCode::UnknownCounter => "unknown counter",
            ErrorCode::UnknownCommandTypeId => "unknown command type id",
            ErrorCode::MalformedCommand => "malformed command",
            ErrorCode::NotSupported => "not supported",
        };
        f.write_str(s)
    }
}

/// `ON_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub offending_command_correlation_id: i64,
    pub error_code: ErrorCode,
    pub error_message: String,
}

impl ErrorResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.offending_command_correlation_id)
            .i32(self.error_code as i32)
            .string(&self.error_message);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            offending_command_correlation_id: r.i64()?,
            error_code: ErrorCode::from_i32(r.i32()?),
            error_message: r.string()?,
        })
    }
}

/// `ON_PUBLICATION_READY` / `ON_EXCLUSIVE_PUBLICATION_READY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationReady {
    pub correlation_id: i64,
    /// Registration id of the (possibly shared) underlying publication.
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub position_limit_counter_id: i32,
    pub channel_status_indicator_id: i32,
    pub log_file: String,
}

impl PublicationReady {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlation_id)
            .i64(self.registration_id)
            .i32(self.session_id)
            .i32(self.stream_id)
            .i32(self.position_limit_counter_id)
            .i32(self.channel_status_indicator_id)
            .string(&self.log_file);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlation_id: r.i64()?,
            registration_id: r.i64()?,
            session_id: r.i32()?,
            stream_id: r.i32()?,
            position_limit_counter_id: r.i32()?,
            channel_status_indicator_id: r.i32()?,
            log_file: r.string()?,
        })
    }
}

/// `ON_SUBSCRIPTION_READY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionReady {
    pub correlation_id: i64,
    pub channel_status_indicator_id: i32,
}

impl SubscriptionReady {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlation_id).i32(self.channel_status_indicator_id);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlation_id: r.i64()?,
            channel_status_indicator_id: r.i32()?,
        })
    }
}

/// `ON_OPERATION_SUCCESS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSucceeded {
    pub correlation_id: i64,
}

impl OperationSucceeded {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlation_id);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self { correlation_id: r.i64()? })
    }
}

/// `ON_AVAILABLE_IMAGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReady {
    /// Correlation id identifying the image itself.
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    /// The subscription this availability event is addressed to.
    pub subscriber_registration_id: i64,
    /// Counter the subscriber advances as it consumes.
    pub subscriber_position_id: i32,
    pub log_file: String,
    pub source_identity: String,
}

impl ImageReady {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlation_id)
            .i32(self.session_id)
            .i32(self.stream_id)
            .i64(self.subscriber_registration_id)
            .i32(self.subscriber_position_id)
            .string(&self.log_file)
            .string(&self.source_identity);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlation_id: r.i64()?,
            session_id: r.i32()?,
            stream_id: r.i32()?,
            subscriber_registration_id: r.i64()?,
            subscriber_position_id: r.i32()?,
            log_file: r.string()?,
            source_identity: r.string()?,
        })
    }
}

/// `ON_UNAVAILABLE_IMAGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMessage {
    pub correlation_id: i64,
    pub subscription_registration_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl ImageMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlation_id)
            .i64(self.subscription_registration_id)
            .i32(self.stream_id)
            .string(&self.channel);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlation_id: r.i64()?,
            subscription_registration_id: r.i64()?,
            stream_id: r.i32()?,
            channel: r.string()?,
        })
    }
}

/// `ON_COUNTER_READY` / `ON_UNAVAILABLE_COUNTER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    pub correlation_id: i64,
    pub counter_id: i32,
}

impl CounterUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlation_id).i32(self.counter_id);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlation_id: r.i64()?,
            counter_id: r.i32()?,
        })
    }
}

/// `ON_CLIENT_TIMEOUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeout {
    pub client_id: i64,
}

impl ClientTimeout {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.client_id);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self { client_id: r.i64()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_round_trip() {
        let rsp = ErrorResponse {
            offending_command_correlation_id: 42,
            error_code: ErrorCode::InvalidChannel,
            error_message: "could not resolve endpoint".to_string(),
        };
        assert_eq!(ErrorResponse::decode(&rsp.encode()).unwrap(), rsp);
    }

    #[test]
    fn publication_ready_round_trip() {
        let rsp = PublicationReady {
            correlation_id: 1,
            registration_id: 2,
            session_id: -559038737,
            stream_id: 1001,
            position_limit_counter_id: 4,
            channel_status_indicator_id: 5,
            log_file: "/dev/shm/tern/publications/2.logbuffer".to_string(),
        };
        assert_eq!(PublicationReady::decode(&rsp.encode()).unwrap(), rsp);
    }

    #[test]
    fn image_ready_round_trip() {
        let rsp = ImageReady {
            correlation_id: 10,
            session_id: 20,
            stream_id: 30,
            subscriber_registration_id: 40,
            subscriber_position_id: 50,
            log_file: "images/10.logbuffer".to_string(),
            source_identity: "127.0.0.1:40123".to_string(),
        };
        assert_eq!(ImageReady::decode(&rsp.encode()).unwrap(), rsp);
    }

    #[test]
    fn unknown_error_code_maps_to_generic() {
        assert_eq!(ErrorCode::from_i32(999), ErrorCode::GenericError);
    }
}
