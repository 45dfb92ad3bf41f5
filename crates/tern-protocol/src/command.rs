//! Commands: client → driver, over the many-to-one ring.
//!
//! Every command begins with `{ client_id, correlation_id }`. The driver
//! answers each command with at least one response carrying the same
//! correlation id.

use crate::codec::{DecodeError, Reader, Writer};

/// Command type ids (ring record `msg_type_id`).
pub mod type_id {
    pub const ADD_PUBLICATION: i32 = 0x01;
    pub const REMOVE_PUBLICATION: i32 = 0x02;
    pub const ADD_EXCLUSIVE_PUBLICATION: i32 = 0x03;
    pub const ADD_SUBSCRIPTION: i32 = 0x04;
    pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
    pub const CLIENT_KEEPALIVE: i32 = 0x06;
    pub const ADD_DESTINATION: i32 = 0x07;
    pub const REMOVE_DESTINATION: i32 = 0x08;
    pub const ADD_COUNTER: i32 = 0x09;
    pub const REMOVE_COUNTER: i32 = 0x0A;
    pub const CLIENT_CLOSE: i32 = 0x0B;
    pub const TERMINATE_DRIVER: i32 = 0x0E;
}

/// Prefix common to every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatedCommand {
    pub client_id: i64,
    pub correlation_id: i64,
}

impl CorrelatedCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.client_id).i64(self.correlation_id);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Self::read(&mut r)
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { client_id: r.i64()?, correlation_id: r.i64()? })
    }
}

/// `ADD_PUBLICATION` / `ADD_EXCLUSIVE_PUBLICATION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationCommand {
    pub correlated: CorrelatedCommand,
    pub stream_id: i32,
    pub channel: String,
}

impl PublicationCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .i32(self.stream_id)
            .string(&self.channel);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlated: CorrelatedCommand::read(&mut r)?,
            stream_id: r.i32()?,
            channel: r.string()?,
        })
    }
}

/// `REMOVE_PUBLICATION` / `REMOVE_SUBSCRIPTION` / `REMOVE_COUNTER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveCommand {
    pub correlated: CorrelatedCommand,
    pub registration_id: i64,
}

impl RemoveCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .i64(self.registration_id);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlated: CorrelatedCommand::read(&mut r)?,
            registration_id: r.i64()?,
        })
    }
}

/// `ADD_SUBSCRIPTION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionCommand {
    pub correlated: CorrelatedCommand,
    /// Correlation id of a prior command this subscription pairs with, or
    /// -1 when standalone.
    pub registration_correlation_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl SubscriptionCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .i64(self.registration_correlation_id)
            .i32(self.stream_id)
            .string(&self.channel);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlated: CorrelatedCommand::read(&mut r)?,
            registration_correlation_id: r.i64()?,
            stream_id: r.i32()?,
            channel: r.string()?,
        })
    }
}

/// `ADD_DESTINATION` / `REMOVE_DESTINATION` on a manual-control publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCommand {
    pub correlated: CorrelatedCommand,
    /// Registration id of the publication the destination applies to.
    pub registration_id: i64,
    pub channel: String,
}

impl DestinationCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .i64(self.registration_id)
            .string(&self.channel);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlated: CorrelatedCommand::read(&mut r)?,
            registration_id: r.i64()?,
            channel: r.string()?,
        })
    }
}

/// `ADD_COUNTER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCommand {
    pub correlated: CorrelatedCommand,
    pub type_id: i32,
    pub key: Vec<u8>,
    pub label: String,
}

impl CounterCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .i32(self.type_id)
            .bytes(&self.key)
            .string(&self.label);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlated: CorrelatedCommand::read(&mut r)?,
            type_id: r.i32()?,
            key: r.bytes()?,
            label: r.string()?,
        })
    }
}

/// `TERMINATE_DRIVER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateDriverCommand {
    pub correlated: CorrelatedCommand,
    pub token: Vec<u8>,
}

impl TerminateDriverCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .bytes(&self.token);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            correlated: CorrelatedCommand::read(&mut r)?,
            token: r.bytes()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlated() -> CorrelatedCommand {
        CorrelatedCommand { client_id: 3, correlation_id: 99 }
    }

    #[test]
    fn publication_command_round_trip() {
        let cmd = PublicationCommand {
            correlated: correlated(),
            stream_id: 1001,
            channel: "aeron:udp?endpoint=127.0.0.1:40123".to_string(),
        };
        assert_eq!(PublicationCommand::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn subscription_command_round_trip() {
        let cmd = SubscriptionCommand {
            correlated: correlated(),
            registration_correlation_id: -1,
            stream_id: 7,
            channel: "aeron:ipc".to_string(),
        };
        assert_eq!(SubscriptionCommand::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn counter_command_round_trip() {
        let cmd = CounterCommand {
            correlated: correlated(),
            type_id: 1001,
            key: vec![1, 2, 3],
            label: "app counter".to_string(),
        };
        assert_eq!(CounterCommand::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn truncated_command_is_rejected() {
        let cmd = RemoveCommand { correlated: correlated(), registration_id: 5 };
        let bytes = cmd.encode();
        assert_eq!(RemoveCommand::decode(&bytes[..bytes.len() - 1]), Err(DecodeError::Truncated));
    }

    #[test]
    fn bad_utf8_channel_is_rejected() {
        let mut bytes = Writer::new();
        bytes.i64(1).i64(2).i32(3);
        let mut bytes = bytes.finish();
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(PublicationCommand::decode(&bytes), Err(DecodeError::BadString));
    }
}
