//! UDP channel resolution and canonicalisation.
//!
//! A channel URI resolves to a set of local/remote data and control
//! addresses plus a canonical form. Two URIs share one underlying channel
//! endpoint iff their canonical forms match, or a `tags=` channel tag
//! equates them by identity.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::uri::{
    parse_tag, ChannelUri, UriError, CONTROL_KEY, CONTROL_MODE_DYNAMIC, CONTROL_MODE_KEY,
    CONTROL_MODE_MANUAL, ENDPOINT_KEY, INTERFACE_KEY, TAGS_KEY, TTL_KEY,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    Uri(UriError),
    /// Channel URI is not `aeron:udp`.
    NotUdp,
    /// UDP URIs need an endpoint, control, tags, or control-mode=manual.
    NoDistinguishingCharacteristic,
    /// control-mode=dynamic without a control address.
    DynamicControlRequiresControl,
    /// Multicast data addresses must have an odd final octet.
    MulticastAddressMustBeOdd(IpAddr),
    /// Name did not resolve to an address.
    Unresolved(String),
    /// Channel tag is not a valid tag value.
    InvalidTag(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uri(e) => write!(f, "{e}"),
            Self::NotUdp => write!(f, "UDP channels must use UDP URIs"),
            Self::NoDistinguishingCharacteristic => {
                write!(f, "URIs for UDP must specify endpoint, control, tags, or control-mode=manual")
            }
            Self::DynamicControlRequiresControl => {
                write!(f, "explicit control expected with dynamic control mode")
            }
            Self::MulticastAddressMustBeOdd(addr) => {
                write!(f, "multicast data address must be odd: {addr}")
            }
            Self::Unresolved(name) => write!(f, "could not resolve address: {name}"),
            Self::InvalidTag(tag) => write!(f, "could not parse channel tag: {tag}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<UriError> for ChannelError {
    fn from(e: UriError) -> Self {
        ChannelError::Uri(e)
    }
}

/// A resolved UDP channel.
#[derive(Debug, Clone)]
pub struct UdpChannel {
    pub uri: ChannelUri,
    pub canonical_form: String,
    pub local_data: SocketAddr,
    pub remote_data: SocketAddr,
    pub local_control: SocketAddr,
    pub remote_control: SocketAddr,
    pub is_multicast: bool,
    pub is_manual_control_mode: bool,
    pub is_dynamic_control_mode: bool,
    pub has_explicit_control: bool,
    pub multicast_ttl: u8,
    pub tag_id: Option<i64>,
}

static UNIQUE_CANONICAL_FORM_VALUE: AtomicI32 = AtomicI32::new(0);

impl UdpChannel {
    pub fn parse(uri_str: &str) -> Result<UdpChannel, ChannelError> {
        let uri = ChannelUri::parse(uri_str)?;
        Self::from_uri(uri)
    }

    pub fn from_uri(uri: ChannelUri) -> Result<UdpChannel, ChannelError> {
        if !uri.is_udp() {
            return Err(ChannelError::NotUdp);
        }

        let control_mode = uri.get(CONTROL_MODE_KEY);
        let is_manual_control_mode = control_mode == Some(CONTROL_MODE_MANUAL);
        let is_dynamic_control_mode = control_mode == Some(CONTROL_MODE_DYNAMIC);

        let endpoint = uri.get(ENDPOINT_KEY);
        let control = uri.get(CONTROL_KEY);
        let channel_tag = uri.channel_tag();

        if is_dynamic_control_mode && control.is_none() {
            return Err(ChannelError::DynamicControlRequiresControl);
        }

        let has_no_distinguishing_characteristic =
            endpoint.is_none() && control.is_none() && channel_tag.is_none();

        if has_no_distinguishing_characteristic && !is_manual_control_mode {
            return Err(ChannelError::NoDistinguishingCharacteristic);
        }

        let tag_id = match channel_tag {
            Some(tag) => {
                Some(parse_tag(tag).ok_or_else(|| ChannelError::InvalidTag(tag.to_string()))?)
            }
            None => None,
        };

        let endpoint_addr = match endpoint {
            Some(value) => resolve_host_and_port(value)?,
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        };

        let explicit_control_addr = match control {
            Some(value) => Some(resolve_host_and_port(value)?),
            None => None,
        };

        let multicast_ttl = uri
            .get(TTL_KEY)
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.min(255) as u8)
            .unwrap_or(0);

        let channel = if endpoint_addr.ip().is_multicast() {
            let remote_control = multicast_control_address(&endpoint_addr)?;
            let interface_addr = interface_address(&endpoint_addr, uri.get(INTERFACE_KEY));
            let canonical_form = canonicalise(&interface_addr, &endpoint_addr, false);

            UdpChannel {
                uri,
                canonical_form,
                local_data: interface_addr,
                remote_data: endpoint_addr,
                local_control: interface_addr,
                remote_control,
                is_multicast: true,
                is_manual_control_mode,
                is_dynamic_control_mode,
                has_explicit_control: false,
                multicast_ttl,
                tag_id,
            }
        } else if let Some(control_addr) = explicit_control_addr {
            let canonical_form = canonicalise(&control_addr, &endpoint_addr, false);

            UdpChannel {
                uri,
                canonical_form,
                local_data: control_addr,
                remote_data: endpoint_addr,
                local_control: control_addr,
                remote_control: endpoint_addr,
                is_multicast: false,
                is_manual_control_mode,
                is_dynamic_control_mode,
                has_explicit_control: true,
                multicast_ttl: 0,
                tag_id,
            }
        } else {
            let interface_addr = interface_address(&endpoint_addr, uri.get(INTERFACE_KEY));
            let canonical_form =
                canonicalise(&interface_addr, &endpoint_addr, has_no_distinguishing_characteristic);

            UdpChannel {
                uri,
                canonical_form,
                local_data: interface_addr,
                remote_data: endpoint_addr,
                local_control: interface_addr,
                remote_control: endpoint_addr,
                is_multicast: false,
                is_manual_control_mode,
                is_dynamic_control_mode,
                has_explicit_control: false,
                multicast_ttl: 0,
                tag_id,
            }
        };

        Ok(channel)
    }

    pub fn original(&self) -> &str {
        self.uri.original()
    }

    /// True when the channel has only a wildcard endpoint (manual control
    /// mode with destinations added later).
    pub fn is_wildcard(&self) -> bool {
        self.remote_data.ip().is_unspecified() && self.remote_data.port() == 0
    }
}

fn resolve_host_and_port(value: &str) -> Result<SocketAddr, ChannelError> {
    // A literal address avoids the resolver entirely.
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    value
        .to_socket_addrs()
        .map_err(|_| ChannelError::Unresolved(value.to_string()))?
        .next()
        .ok_or_else(|| ChannelError::Unresolved(value.to_string()))
}

/// Derive the control address of a multicast data address: the final octet
/// must be odd on the data side, control is data + 1.
fn multicast_control_address(data: &SocketAddr) -> Result<SocketAddr, ChannelError> {
    match data.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            if octets[3] & 0x1 == 0 {
                return Err(ChannelError::MulticastAddressMustBeOdd(data.ip()));
            }
            octets[3] += 1;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), data.port()))
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            if octets[15] & 0x1 == 0 {
                return Err(ChannelError::MulticastAddressMustBeOdd(data.ip()));
            }
            octets[15] += 1;
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), data.port()))
        }
    }
}

/// Choose the local interface address for outgoing traffic. An explicit
/// `interface=` wins; otherwise the family wildcard.
fn interface_address(endpoint: &SocketAddr, interface: Option<&str>) -> SocketAddr {
    if let Some(value) = interface {
        // Accept "addr", "addr:port", and "addr/prefix" spellings.
        let trimmed = value.split('/').next().unwrap_or(value);
        if let Ok(addr) = trimmed.parse::<SocketAddr>() {
            return addr;
        }
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return SocketAddr::new(ip, 0);
        }
    }

    match endpoint {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn hex_of(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => ip.octets().iter().map(|b| format!("{b:02x}")).collect(),
        IpAddr::V6(ip) => ip.octets().iter().map(|b| format!("{b:02x}")).collect(),
    }
}

/// Canonical endpoint identity:
/// `UDP-<hexLocal>-<localPort>-<hexRemote>-<remotePort>[-<unique>]`.
fn canonicalise(local_data: &SocketAddr, remote_data: &SocketAddr, make_unique: bool) -> String {
    let mut canonical = format!(
        "UDP-{}-{}-{}-{}",
        hex_of(local_data),
        local_data.port(),
        hex_of(remote_data),
        remote_data.port(),
    );

    if make_unique {
        let unique = UNIQUE_CANONICAL_FORM_VALUE.fetch_add(1, Ordering::AcqRel);
        canonical.push_str(&format!("-{unique}"));
    }

    canonical
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_endpoint_resolves_and_canonicalises() {
        let channel = UdpChannel::parse("aeron:udp?endpoint=127.0.0.1:40123").unwrap();
        assert!(!channel.is_multicast);
        assert_eq!(channel.remote_data, "127.0.0.1:40123".parse::<SocketAddr>().unwrap());
        assert_eq!(channel.canonical_form, "UDP-00000000-0-7f000001-40123");
    }

    #[test]
    fn same_endpoint_same_canonical_form() {
        let a = UdpChannel::parse("aeron:udp?endpoint=127.0.0.1:40123").unwrap();
        let b = UdpChannel::parse("aeron:udp?endpoint=127.0.0.1:40123|mtu=8k").unwrap();
        assert_eq!(a.canonical_form, b.canonical_form);

        let c = UdpChannel::parse("aeron:udp?endpoint=127.0.0.1:40124").unwrap();
        assert_ne!(a.canonical_form, c.canonical_form);
    }

    #[test]
    fn requires_distinguishing_characteristic() {
        assert_eq!(
            UdpChannel::parse("aeron:udp?mtu=8k").unwrap_err(),
            ChannelError::NoDistinguishingCharacteristic
        );
        assert!(UdpChannel::parse("aeron:udp?control-mode=manual").is_ok());
        assert!(UdpChannel::parse("aeron:udp?tags=77").is_ok());
    }

    #[test]
    fn dynamic_control_mode_requires_control() {
        assert_eq!(
            UdpChannel::parse("aeron:udp?endpoint=127.0.0.1:1|control-mode=dynamic").unwrap_err(),
            ChannelError::DynamicControlRequiresControl
        );
        assert!(
            UdpChannel::parse("aeron:udp?control=127.0.0.1:2|control-mode=dynamic").is_ok()
        );
    }

    #[test]
    fn multicast_derives_control_address() {
        let channel = UdpChannel::parse("aeron:udp?endpoint=224.0.1.1:40456").unwrap();
        assert!(channel.is_multicast);
        assert_eq!(channel.remote_data.ip(), "224.0.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(channel.remote_control.ip(), "224.0.1.2".parse::<IpAddr>().unwrap());
        assert_eq!(channel.remote_control.port(), 40456);
    }

    #[test]
    fn even_multicast_address_rejected() {
        assert!(matches!(
            UdpChannel::parse("aeron:udp?endpoint=224.0.1.2:40456"),
            Err(ChannelError::MulticastAddressMustBeOdd(_))
        ));
    }

    #[test]
    fn explicit_control_becomes_local_address() {
        let channel =
            UdpChannel::parse("aeron:udp?endpoint=192.168.0.10:4000|control=192.168.0.1:4001").unwrap();
        assert!(channel.has_explicit_control);
        assert_eq!(channel.local_data, "192.168.0.1:4001".parse::<SocketAddr>().unwrap());
        assert_eq!(channel.canonical_form, "UDP-c0a80001-4001-c0a8000a-4000");
    }

    #[test]
    fn tag_is_parsed() {
        let channel = UdpChannel::parse("aeron:udp?endpoint=127.0.0.1:1|tags=1001").unwrap();
        assert_eq!(channel.tag_id, Some(1001));

        assert!(matches!(
            UdpChannel::parse("aeron:udp?tags=notanumber"),
            Err(ChannelError::InvalidTag(_))
        ));
    }

    #[test]
    fn manual_mode_without_endpoint_is_wildcard() {
        let channel = UdpChannel::parse("aeron:udp?control-mode=manual").unwrap();
        assert!(channel.is_manual_control_mode);
        assert!(channel.is_wildcard());
        // Wildcard channels get a unique canonical form.
        let other = UdpChannel::parse("aeron:udp?control-mode=manual").unwrap();
        assert_ne!(channel.canonical_form, other.canonical_form);
    }
}
