//! Driver configuration.
//!
//! A `DriverContext` carries every tunable with sensible defaults, takes
//! environment overrides, and validates itself before the driver maps any
//! shared state. There are no ambient singletons: the concluded context is
//! threaded explicitly into the conductor.

use std::path::PathBuf;
use std::time::Duration;

use tern_logbuffer::descriptor::{check_page_size, check_term_length, LengthError};
use tern_primitives::IdleStrategy;

/// Env var names honoured by [`DriverContext::from_env`].
pub const DIR_ENV: &str = "TERN_DIR";
pub const TERM_LENGTH_ENV: &str = "TERN_TERM_LENGTH";
pub const IPC_TERM_LENGTH_ENV: &str = "TERN_IPC_TERM_LENGTH";
pub const MTU_LENGTH_ENV: &str = "TERN_MTU_LENGTH";
pub const CLIENT_LIVENESS_TIMEOUT_ENV: &str = "TERN_CLIENT_LIVENESS_TIMEOUT_NS";
pub const PUBLICATION_LINGER_TIMEOUT_ENV: &str = "TERN_PUBLICATION_LINGER_TIMEOUT_NS";
pub const IMAGE_LIVENESS_TIMEOUT_ENV: &str = "TERN_IMAGE_LIVENESS_TIMEOUT_NS";

#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Directory holding the CnC file and log buffers.
    pub dir: PathBuf,
    /// Remove a pre-existing driver directory at launch.
    pub dir_delete_on_start: bool,

    pub term_buffer_length: usize,
    pub ipc_term_buffer_length: usize,
    pub mtu_length: usize,
    pub ipc_mtu_length: usize,
    pub page_size: usize,
    pub term_buffer_sparse_file: bool,
    /// Fault every log page at creation instead of first append.
    pub pre_touch_mapped_memory: bool,

    pub to_driver_buffer_length: usize,
    pub to_clients_buffer_length: usize,
    pub counter_metadata_buffer_length: usize,
    pub counter_values_buffer_length: usize,
    pub error_log_buffer_length: usize,

    pub client_liveness_timeout_ns: i64,
    pub publication_linger_timeout_ns: i64,
    pub image_liveness_timeout_ns: i64,
    pub counter_free_to_reuse_timeout_ns: i64,
    /// How often the conductor walks its timer wheel.
    pub timer_interval_ns: i64,

    /// Session ids in this closed range are never auto-assigned.
    pub publication_reserved_session_id_low: i32,
    pub publication_reserved_session_id_high: i32,

    /// Producer window: how far a publisher may run ahead of consumers.
    pub publication_window_length: usize,
    pub ipc_publication_window_length: usize,

    pub reliable_stream: bool,
    pub tether_subscriptions: bool,
    pub rejoin_stream: bool,

    /// Token a TERMINATE_DRIVER command must present, when set.
    pub termination_token: Option<Vec<u8>>,

    pub conductor_idle_strategy: IdleStrategy,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            dir_delete_on_start: false,
            term_buffer_length: 16 * 1024 * 1024,
            ipc_term_buffer_length: 16 * 1024 * 1024,
            mtu_length: 1408,
            ipc_mtu_length: 4096,
            page_size: 4096,
            term_buffer_sparse_file: true,
            pre_touch_mapped_memory: false,
            to_driver_buffer_length: 1024 * 1024 + tern_primitives::RB_TRAILER_LENGTH,
            to_clients_buffer_length: 1024 * 1024 + tern_primitives::BROADCAST_TRAILER_LENGTH,
            counter_metadata_buffer_length: 1024 * tern_primitives::counters::METADATA_LENGTH,
            counter_values_buffer_length: 1024 * tern_primitives::counters::VALUE_LENGTH,
            error_log_buffer_length: 1024 * 1024,
            client_liveness_timeout_ns: 10_000_000_000,
            publication_linger_timeout_ns: 5_000_000_000,
            image_liveness_timeout_ns: 10_000_000_000,
            counter_free_to_reuse_timeout_ns: 1_000_000_000,
            timer_interval_ns: 1_000_000,
            publication_reserved_session_id_low: -1,
            publication_reserved_session_id_high: 1000,
            publication_window_length: 0,
            ipc_publication_window_length: 0,
            reliable_stream: true,
            tether_subscriptions: true,
            rejoin_stream: true,
            termination_token: None,
            conductor_idle_strategy: IdleStrategy::default(),
        }
    }
}

fn default_dir() -> PathBuf {
    let base = if cfg!(target_os = "linux") && std::path::Path::new("/dev/shm").is_dir() {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir()
    };

    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    base.join(format!("tern-{user}"))
}

#[derive(Debug)]
pub enum ContextError {
    Length(LengthError),
    /// MTU must be frame aligned and hold at least one header.
    InvalidMtu(usize),
    /// A timeout is zero or negative.
    InvalidTimeout(&'static str),
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Length(e) => write!(f, "{e}"),
            Self::InvalidMtu(mtu) => write!(f, "invalid mtu length: {mtu}"),
            Self::InvalidTimeout(name) => write!(f, "timeout {name} must be positive"),
        }
    }
}

impl std::error::Error for ContextError {}

impl From<LengthError> for ContextError {
    fn from(e: LengthError) -> Self {
        ContextError::Length(e)
    }
}

impl DriverContext {
    /// Defaults overridden from the environment.
    pub fn from_env() -> Self {
        let mut ctx = Self::default();

        if let Ok(dir) = std::env::var(DIR_ENV) {
            ctx.dir = PathBuf::from(dir);
        }
        if let Some(v) = env_usize(TERM_LENGTH_ENV) {
            ctx.term_buffer_length = v;
        }
        if let Some(v) = env_usize(IPC_TERM_LENGTH_ENV) {
            ctx.ipc_term_buffer_length = v;
        }
        if let Some(v) = env_usize(MTU_LENGTH_ENV) {
            ctx.mtu_length = v;
        }
        if let Some(v) = env_i64(CLIENT_LIVENESS_TIMEOUT_ENV) {
            ctx.client_liveness_timeout_ns = v;
        }
        if let Some(v) = env_i64(PUBLICATION_LINGER_TIMEOUT_ENV) {
            ctx.publication_linger_timeout_ns = v;
        }
        if let Some(v) = env_i64(IMAGE_LIVENESS_TIMEOUT_ENV) {
            ctx.image_liveness_timeout_ns = v;
        }

        ctx
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        check_term_length(self.term_buffer_length)?;
        check_term_length(self.ipc_term_buffer_length)?;
        check_page_size(self.page_size)?;

        for mtu in [self.mtu_length, self.ipc_mtu_length] {
            if mtu < tern_logbuffer::HEADER_LENGTH * 2
                || mtu % tern_logbuffer::FRAME_ALIGNMENT != 0
                || mtu > self.term_buffer_length / 8
            {
                return Err(ContextError::InvalidMtu(mtu));
            }
        }

        for (value, name) in [
            (self.client_liveness_timeout_ns, "client liveness"),
            (self.publication_linger_timeout_ns, "publication linger"),
            (self.image_liveness_timeout_ns, "image liveness"),
            (self.timer_interval_ns, "timer interval"),
        ] {
            if value <= 0 {
                return Err(ContextError::InvalidTimeout(name));
            }
        }

        Ok(())
    }

    /// Effective producer window for a network publication.
    pub fn window_length(&self, term_length: usize) -> usize {
        if self.publication_window_length != 0 {
            self.publication_window_length.min(term_length / 2)
        } else {
            term_length / 2
        }
    }

    /// Effective producer window for an IPC publication.
    pub fn ipc_window_length(&self, term_length: usize) -> usize {
        if self.ipc_publication_window_length != 0 {
            self.ipc_publication_window_length.min(term_length / 2)
        } else {
            term_length / 2
        }
    }

    pub fn client_liveness_timeout(&self) -> Duration {
        Duration::from_nanos(self.client_liveness_timeout_ns as u64)
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok()?.parse().ok()
}
