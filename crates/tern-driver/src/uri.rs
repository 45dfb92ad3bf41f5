//! Channel URIs.
//!
//! Grammar: `aeron:(udp|ipc)[?key=value(|key=value)*]`. Parsing keeps
//! every key; recognised keys drive publication and subscription
//! parameters, unrecognised keys are preserved and ignored semantically.

use crate::context::DriverContext;
use tern_logbuffer::descriptor::check_term_length;
use tern_logbuffer::frame::FRAME_ALIGNMENT;

/// URI scheme prefix.
pub const URI_SCHEME: &str = "aeron:";

/// Recognised param keys.
pub const ENDPOINT_KEY: &str = "endpoint";
pub const INTERFACE_KEY: &str = "interface";
pub const CONTROL_KEY: &str = "control";
pub const CONTROL_MODE_KEY: &str = "control-mode";
pub const CONTROL_MODE_MANUAL: &str = "manual";
pub const CONTROL_MODE_DYNAMIC: &str = "dynamic";
pub const TTL_KEY: &str = "ttl";
pub const RELIABLE_KEY: &str = "reliable";
pub const TAGS_KEY: &str = "tags";
pub const SESSION_ID_KEY: &str = "session-id";
pub const MTU_LENGTH_KEY: &str = "mtu";
pub const TERM_LENGTH_KEY: &str = "term-length";
pub const INITIAL_TERM_ID_KEY: &str = "init-term-id";
pub const TERM_ID_KEY: &str = "term-id";
pub const TERM_OFFSET_KEY: &str = "term-offset";
pub const LINGER_TIMEOUT_KEY: &str = "linger";
pub const SPARSE_TERM_KEY: &str = "sparse";
pub const EOS_KEY: &str = "eos";
pub const TETHER_KEY: &str = "tether";
pub const REJOIN_KEY: &str = "rejoin";
pub const GROUP_KEY: &str = "group";
pub const FLOW_CONTROL_KEY: &str = "fc";
pub const GROUP_TAG_KEY: &str = "gtag";
pub const CONGESTION_CONTROL_KEY: &str = "cc";
pub const SPIES_SIMULATE_CONNECTION_KEY: &str = "ssc";
pub const ALIGNMENT_KEY: &str = "ats";

/// Prefix for session ids that reference another publication by tag.
pub const SESSION_ID_TAG_PREFIX: &str = "tag:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Udp,
    Ipc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    /// Not `aeron:udp?...` or `aeron:ipc[?...]`.
    InvalidScheme(String),
    /// `=` with nothing before it, or a key cut short by `|`.
    EmptyKey,
    /// `|` with nothing after the `=`.
    EmptyValue,
    /// A recognised key carries an unparseable value.
    InvalidValue { key: &'static str, value: String },
    /// init-term-id/term-id/term-offset on a shared publication.
    PositionParamsRequireExclusive,
    /// init-term-id/term-id/term-offset must come as a complete set.
    IncompletePositionTriple,
    /// term-offset beyond the term or not frame aligned.
    TermOffsetInvalid { term_offset: i32 },
    /// term id distance exceeds what positions can express.
    TermIdRangeExceeded,
}

impl std::fmt::Display for UriError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidScheme(uri) => write!(f, "invalid URI scheme or media: {uri}"),
            Self::EmptyKey => write!(f, "empty key not allowed in URI params"),
            Self::EmptyValue => write!(f, "empty value not allowed in URI params"),
            Self::InvalidValue { key, value } => write!(f, "could not parse {key}={value} in URI"),
            Self::PositionParamsRequireExclusive => {
                write!(f, "init-term-id, term-id, term-offset are not supported for shared publications")
            }
            Self::IncompletePositionTriple => {
                write!(f, "init-term-id, term-id, term-offset must be used as a complete set")
            }
            Self::TermOffsetInvalid { term_offset } => {
                write!(f, "term-offset={term_offset} must be frame aligned and within the term")
            }
            Self::TermIdRangeExceeded => write!(f, "term-id distance exceeds 2^31 - 1"),
        }
    }
}

impl std::error::Error for UriError {}

/// A parsed channel URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    media: Media,
    params: Vec<(String, String)>,
    original: String,
}

impl ChannelUri {
    pub fn parse(uri: &str) -> Result<ChannelUri, UriError> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| UriError::InvalidScheme(uri.to_string()))?;

        let (media, params_str) = if let Some(params) = rest.strip_prefix("udp?") {
            (Media::Udp, params)
        } else if rest == "ipc" {
            (Media::Ipc, "")
        } else if let Some(params) = rest.strip_prefix("ipc?") {
            (Media::Ipc, params)
        } else {
            return Err(UriError::InvalidScheme(uri.to_string()));
        };

        let params = parse_params(params_str)?;
        Ok(ChannelUri { media, params, original: uri.to_string() })
    }

    #[inline]
    pub fn media(&self) -> Media {
        self.media
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        self.media == Media::Udp
    }

    #[inline]
    pub fn is_ipc(&self) -> bool {
        self.media == Media::Ipc
    }

    #[inline]
    pub fn original(&self) -> &str {
        &self.original
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// The channel tag: first component of `tags=`.
    pub fn channel_tag(&self) -> Option<&str> {
        self.get(TAGS_KEY).map(|tags| tags.split(',').next().unwrap_or("")).filter(|t| !t.is_empty())
    }

    /// The entity tag: second component of `tags=`.
    pub fn entity_tag(&self) -> Option<&str> {
        self.get(TAGS_KEY).and_then(|tags| tags.split(',').nth(1)).filter(|t| !t.is_empty())
    }
}

fn parse_params(params_str: &str) -> Result<Vec<(String, String)>, UriError> {
    let mut params = Vec::new();

    if params_str.is_empty() {
        return Ok(params);
    }

    for pair in params_str.split('|') {
        let mut split = pair.splitn(2, '=');
        let key = split.next().unwrap_or("");
        let value = split.next().ok_or(UriError::EmptyKey)?;

        if key.is_empty() {
            return Err(UriError::EmptyKey);
        }
        if value.is_empty() {
            return Err(UriError::EmptyValue);
        }

        params.push((key.to_string(), value.to_string()));
    }

    Ok(params)
}

/// Parse a size value with an optional k/m/g suffix.
pub fn parse_size(key: &'static str, value: &str) -> Result<u64, UriError> {
    let invalid = || UriError::InvalidValue { key, value: value.to_string() };

    let (digits, multiplier) = match value.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&value[..value.len() - 1], 1024u64),
        Some(b'm') | Some(b'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some(b'g') | Some(b'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };

    let base: u64 = digits.parse().map_err(|_| invalid())?;
    base.checked_mul(multiplier).ok_or_else(invalid)
}

/// Parse a duration with an optional ns/us/ms/s suffix (default ns).
pub fn parse_duration_ns(key: &'static str, value: &str) -> Result<i64, UriError> {
    let invalid = || UriError::InvalidValue { key, value: value.to_string() };

    let (digits, multiplier) = if let Some(d) = value.strip_suffix("ns") {
        (d, 1i64)
    } else if let Some(d) = value.strip_suffix("us") {
        (d, 1_000)
    } else if let Some(d) = value.strip_suffix("ms") {
        (d, 1_000_000)
    } else if let Some(d) = value.strip_suffix('s') {
        (d, 1_000_000_000)
    } else {
        (value, 1)
    };

    let base: i64 = digits.parse().map_err(|_| invalid())?;
    base.checked_mul(multiplier).ok_or_else(invalid)
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, UriError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(UriError::InvalidValue { key, value: value.to_string() }),
    }
}

fn parse_i32(key: &'static str, value: &str) -> Result<i32, UriError> {
    value.parse().map_err(|_| UriError::InvalidValue { key, value: value.to_string() })
}

/// Parse a tag value (decimal, non-negative).
pub fn parse_tag(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().filter(|v| *v >= 0)
}

/// How a publication URI pins its session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdParam {
    /// Driver chooses.
    None,
    /// Pinned to a literal value.
    Value(i32),
    /// Borrow the session id (and buffer geometry) of the publication
    /// carrying this entity tag.
    Tag(i64),
}

/// Publication parameters extracted from a URI against context defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationParams {
    pub linger_timeout_ns: i64,
    pub term_length: usize,
    pub mtu_length: usize,
    pub initial_term_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub has_position: bool,
    pub is_sparse: bool,
    pub signal_eos: bool,
    pub session_id: SessionIdParam,
    pub entity_tag: Option<i64>,
}

pub fn publication_params(
    uri: &ChannelUri,
    ctx: &DriverContext,
    is_exclusive: bool,
) -> Result<PublicationParams, UriError> {
    let mut params = PublicationParams {
        linger_timeout_ns: ctx.publication_linger_timeout_ns,
        term_length: if uri.is_ipc() { ctx.ipc_term_buffer_length } else { ctx.term_buffer_length },
        mtu_length: if uri.is_ipc() { ctx.ipc_mtu_length } else { ctx.mtu_length },
        initial_term_id: 0,
        term_id: 0,
        term_offset: 0,
        has_position: false,
        is_sparse: ctx.term_buffer_sparse_file,
        signal_eos: true,
        session_id: SessionIdParam::None,
        entity_tag: None,
    };

    if let Some(value) = uri.get(SESSION_ID_KEY) {
        if let Some(tag_str) = value.strip_prefix(SESSION_ID_TAG_PREFIX) {
            let tag = tag_str
                .parse::<i64>()
                .map_err(|_| UriError::InvalidValue { key: SESSION_ID_KEY, value: value.to_string() })?;
            params.session_id = SessionIdParam::Tag(tag);
        } else {
            params.session_id = SessionIdParam::Value(parse_i32(SESSION_ID_KEY, value)?);
        }
    }

    if let Some(value) = uri.entity_tag() {
        params.entity_tag =
            Some(parse_tag(value).ok_or_else(|| UriError::InvalidValue { key: TAGS_KEY, value: value.to_string() })?);
    }

    if let Some(value) = uri.get(LINGER_TIMEOUT_KEY) {
        params.linger_timeout_ns = parse_duration_ns(LINGER_TIMEOUT_KEY, value)?;
    }

    if let Some(value) = uri.get(TERM_LENGTH_KEY) {
        let length = parse_size(TERM_LENGTH_KEY, value)? as usize;
        check_term_length(length)
            .map_err(|_| UriError::InvalidValue { key: TERM_LENGTH_KEY, value: value.to_string() })?;
        params.term_length = length;
    }

    if let Some(value) = uri.get(MTU_LENGTH_KEY) {
        params.mtu_length = parse_size(MTU_LENGTH_KEY, value)? as usize;
    }

    let initial_term_id = uri.get(INITIAL_TERM_ID_KEY);
    let term_id = uri.get(TERM_ID_KEY);
    let term_offset = uri.get(TERM_OFFSET_KEY);
    let count = [initial_term_id, term_id, term_offset].iter().filter(|v| v.is_some()).count();

    if count > 0 {
        if !is_exclusive {
            return Err(UriError::PositionParamsRequireExclusive);
        }
        if count < 3 {
            return Err(UriError::IncompletePositionTriple);
        }

        let initial_term_id = parse_i32(INITIAL_TERM_ID_KEY, initial_term_id.unwrap())?;
        let term_id = parse_i32(TERM_ID_KEY, term_id.unwrap())?;
        let term_offset = parse_i32(TERM_OFFSET_KEY, term_offset.unwrap())?;

        if term_id.wrapping_sub(initial_term_id) < 0 {
            return Err(UriError::TermIdRangeExceeded);
        }
        if term_offset < 0 || term_offset as usize > params.term_length {
            return Err(UriError::TermOffsetInvalid { term_offset });
        }
        if term_offset as usize & (FRAME_ALIGNMENT - 1) != 0 {
            return Err(UriError::TermOffsetInvalid { term_offset });
        }

        params.initial_term_id = initial_term_id;
        params.term_id = term_id;
        params.term_offset = term_offset;
        params.has_position = true;
    }

    if let Some(value) = uri.get(SPARSE_TERM_KEY) {
        params.is_sparse = parse_bool(SPARSE_TERM_KEY, value)?;
    }
    if let Some(value) = uri.get(EOS_KEY) {
        params.signal_eos = parse_bool(EOS_KEY, value)?;
    }

    Ok(params)
}

/// Group membership is tri-state: inferred from the address by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferableBoolean {
    ForceTrue,
    ForceFalse,
    Infer,
}

/// Subscription parameters extracted from a URI against context defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionParams {
    pub is_reliable: bool,
    pub is_sparse: bool,
    pub is_tether: bool,
    pub is_rejoin: bool,
    pub group: InferableBoolean,
    pub has_session_id: bool,
    pub session_id: i32,
}

pub fn subscription_params(uri: &ChannelUri, ctx: &DriverContext) -> Result<SubscriptionParams, UriError> {
    let mut params = SubscriptionParams {
        is_reliable: ctx.reliable_stream,
        is_sparse: ctx.term_buffer_sparse_file,
        is_tether: ctx.tether_subscriptions,
        is_rejoin: ctx.rejoin_stream,
        group: InferableBoolean::Infer,
        has_session_id: false,
        session_id: 0,
    };

    if let Some(value) = uri.get(RELIABLE_KEY) {
        params.is_reliable = parse_bool(RELIABLE_KEY, value)?;
    }
    if let Some(value) = uri.get(SPARSE_TERM_KEY) {
        params.is_sparse = parse_bool(SPARSE_TERM_KEY, value)?;
    }
    if let Some(value) = uri.get(TETHER_KEY) {
        params.is_tether = parse_bool(TETHER_KEY, value)?;
    }
    if let Some(value) = uri.get(REJOIN_KEY) {
        params.is_rejoin = parse_bool(REJOIN_KEY, value)?;
    }
    if let Some(value) = uri.get(GROUP_KEY) {
        params.group = match value {
            "true" => InferableBoolean::ForceTrue,
            "false" => InferableBoolean::ForceFalse,
            _ => return Err(UriError::InvalidValue { key: GROUP_KEY, value: value.to_string() }),
        };
    }
    if let Some(value) = uri.get(SESSION_ID_KEY) {
        params.session_id = parse_i32(SESSION_ID_KEY, value)?;
        params.has_session_id = true;
    }

    Ok(params)
}
