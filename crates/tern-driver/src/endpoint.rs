//! Send and receive channel endpoints.
//!
//! An endpoint is the driver-side identity of one underlying transport.
//! Endpoints are reference-counted by the publications or subscriptions
//! using them and deduplicated by canonical form or channel tag; the
//! conductor is the only mutator.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::udp_channel::UdpChannel;

/// Values of a channel status counter.
pub mod channel_status {
    pub const INITIALIZING: i64 = 0;
    pub const ERRORED: i64 = -1;
    pub const ACTIVE: i64 = 1;
    pub const CLOSING: i64 = 2;
}

/// Driver-side state for one sending transport.
pub struct SendChannelEndpoint {
    pub registration_id: i64,
    pub channel: UdpChannel,
    pub status_counter_id: i32,
    /// Publications referencing this endpoint.
    pub refcount: i32,
    /// Destinations added by ADD_DESTINATION (manual control mode only).
    pub destinations: Vec<SocketAddr>,
}

impl SendChannelEndpoint {
    pub fn new(registration_id: i64, channel: UdpChannel, status_counter_id: i32) -> Self {
        Self { registration_id, channel, status_counter_id, refcount: 0, destinations: Vec::new() }
    }

    pub fn incref(&mut self) {
        self.refcount += 1;
    }

    /// Returns true when the endpoint has no remaining references.
    pub fn decref(&mut self) -> bool {
        self.refcount -= 1;
        self.refcount <= 0
    }

    pub fn add_destination(&mut self, addr: SocketAddr) {
        if !self.destinations.contains(&addr) {
            self.destinations.push(addr);
        }
    }

    /// Returns true when the destination was known and removed.
    pub fn remove_destination(&mut self, addr: &SocketAddr) -> bool {
        match self.destinations.iter().position(|d| d == addr) {
            Some(index) => {
                self.destinations.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

/// Driver-side state for one receiving transport.
pub struct ReceiveChannelEndpoint {
    pub registration_id: i64,
    pub channel: UdpChannel,
    pub status_counter_id: i32,
    /// Subscription interest per stream id.
    stream_refcounts: HashMap<i32, i32>,
}

impl ReceiveChannelEndpoint {
    pub fn new(registration_id: i64, channel: UdpChannel, status_counter_id: i32) -> Self {
        Self { registration_id, channel, status_counter_id, stream_refcounts: HashMap::new() }
    }

    /// Register subscriber interest in a stream. Returns true when this is
    /// the first interest in that stream.
    pub fn incref_to_stream(&mut self, stream_id: i32) -> bool {
        let count = self.stream_refcounts.entry(stream_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop subscriber interest. Returns true when the stream has no
    /// remaining interest.
    pub fn decref_to_stream(&mut self, stream_id: i32) -> bool {
        if let Some(count) = self.stream_refcounts.get_mut(&stream_id) {
            *count -= 1;
            if *count <= 0 {
                self.stream_refcounts.remove(&stream_id);
                return true;
            }
        }
        false
    }

    pub fn has_subscription_interest(&self, stream_id: i32) -> bool {
        self.stream_refcounts.contains_key(&stream_id)
    }

    pub fn stream_count(&self) -> usize {
        self.stream_refcounts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> UdpChannel {
        UdpChannel::parse("aeron:udp?endpoint=127.0.0.1:40123").unwrap()
    }

    #[test]
    fn send_endpoint_refcounting() {
        let mut endpoint = SendChannelEndpoint::new(1, channel(), 0);
        endpoint.incref();
        endpoint.incref();
        assert!(!endpoint.decref());
        assert!(endpoint.decref());
    }

    #[test]
    fn send_endpoint_destinations_deduplicate() {
        let mut endpoint = SendChannelEndpoint::new(1, channel(), 0);
        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();

        endpoint.add_destination(addr);
        endpoint.add_destination(addr);
        assert_eq!(endpoint.destinations.len(), 1);

        assert!(endpoint.remove_destination(&addr));
        assert!(!endpoint.remove_destination(&addr));
    }

    #[test]
    fn receive_endpoint_stream_interest() {
        let mut endpoint = ReceiveChannelEndpoint::new(1, channel(), 0);

        assert!(endpoint.incref_to_stream(1001));
        assert!(!endpoint.incref_to_stream(1001));
        assert!(endpoint.has_subscription_interest(1001));

        assert!(!endpoint.decref_to_stream(1001));
        assert!(endpoint.decref_to_stream(1001));
        assert!(!endpoint.has_subscription_interest(1001));
        assert_eq!(endpoint.stream_count(), 0);
    }
}
