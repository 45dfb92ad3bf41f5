//! The driver conductor: single-threaded owner of all control-plane state.
//!
//! One thread runs the duty cycle: drain client commands from the ring,
//! drain receiver events from the proxy queue, walk the timer wheel, emit
//! responses on the broadcast. Every mutation of clients, publications,
//! subscriptions, images, endpoints, and counters happens here; external
//! threads only exchange data through shared atomics and queues.

use tern_logbuffer::descriptor::{
    compute_position, index_by_term, pack_tail, position_bits_to_shift,
};
use tern_logbuffer::log::{LogParams, MappedRawLog};
use tern_primitives::broadcast::BroadcastError;
use tern_primitives::counters::{type_ids, CountersError};
use tern_primitives::rb::RingBufferError;
use tern_primitives::{
    epoch_time_ms, nano_time, BroadcastTransmitter, CachedClock, CountersManager, CountersReader,
    RingBuffer,
};
use tern_protocol::cnc::{CncError, CncFile, CncLengths};
use tern_protocol::command::{
    type_id as cmd, CorrelatedCommand, CounterCommand, DestinationCommand, PublicationCommand,
    RemoveCommand, SubscriptionCommand, TerminateDriverCommand,
};
use tern_protocol::response::{
    type_id as rsp, ClientTimeout, CounterUpdate, ErrorCode, ErrorResponse, ImageMessage,
    ImageReady, OperationSucceeded, PublicationReady, SubscriptionReady,
};
use tern_protocol::DistinctErrorLog;

use crate::context::{ContextError, DriverContext};
use crate::endpoint::{channel_status, ReceiveChannelEndpoint, SendChannelEndpoint};
use crate::image::{ImageState, PublicationImage, SubscriberPosition};
use crate::proxy::{conductor_proxy, ConductorEvent, ConductorEventQueue, ConductorProxy};
use crate::publication::{IpcPublication, NetworkPublication, PublicationState};
use crate::udp_channel::UdpChannel;
use crate::uri::{
    publication_params, subscription_params, ChannelUri, PublicationParams, SessionIdParam,
    SubscriptionParams,
};

/// Counter id used when a response has no status indicator to reference.
pub const NO_COUNTER_ID: i32 = -1;

/// Source identity reported for in-process images.
const IPC_SOURCE_IDENTITY: &str = "aeron:ipc";

#[derive(Debug)]
pub enum DriverError {
    Context(ContextError),
    Cnc(CncError),
    Ring(RingBufferError),
    Broadcast(BroadcastError),
    Counters(CountersError),
    Io(std::io::Error),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Context(e) => write!(f, "context: {e}"),
            Self::Cnc(e) => write!(f, "cnc: {e}"),
            Self::Ring(e) => write!(f, "command ring: {e}"),
            Self::Broadcast(e) => write!(f, "broadcast: {e}"),
            Self::Counters(e) => write!(f, "counters: {e}"),
            Self::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<ContextError> for DriverError {
    fn from(e: ContextError) -> Self {
        Self::Context(e)
    }
}
impl From<CncError> for DriverError {
    fn from(e: CncError) -> Self {
        Self::Cnc(e)
    }
}
impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A control-plane failure answered with ON_ERROR.
struct ControlError {
    code: ErrorCode,
    message: String,
}

impl ControlError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<crate::uri::UriError> for ControlError {
    fn from(e: crate::uri::UriError) -> Self {
        Self::new(ErrorCode::InvalidChannel, e.to_string())
    }
}

impl From<crate::udp_channel::ChannelError> for ControlError {
    fn from(e: crate::udp_channel::ChannelError) -> Self {
        Self::new(ErrorCode::InvalidChannel, e.to_string())
    }
}

impl From<CountersError> for ControlError {
    fn from(e: CountersError) -> Self {
        Self::new(ErrorCode::GenericError, e.to_string())
    }
}

impl From<tern_logbuffer::LogError> for ControlError {
    fn from(e: tern_logbuffer::LogError) -> Self {
        Self::new(ErrorCode::GenericError, e.to_string())
    }
}

impl From<tern_protocol::DecodeError> for ControlError {
    fn from(e: tern_protocol::DecodeError) -> Self {
        Self::new(ErrorCode::MalformedCommand, e.to_string())
    }
}

enum PublicationResource {
    Network(i64),
    Ipc(i64),
}

struct PublicationLink {
    registration_id: i64,
    resource: PublicationResource,
}

struct CounterLink {
    registration_id: i64,
    counter_id: i32,
}

struct ClientEntry {
    client_id: i64,
    heartbeat_counter_id: i32,
    closed_by_command: bool,
    reached_end_of_life: bool,
    publication_links: Vec<PublicationLink>,
    counter_links: Vec<CounterLink>,
}

struct LinkPosition {
    /// Registration id of the image or IPC publication being consumed.
    source_correlation_id: i64,
    counter_id: i32,
}

struct SubscriptionLink {
    registration_id: i64,
    client_id: i64,
    stream_id: i32,
    channel: String,
    /// None for IPC subscriptions.
    endpoint_registration_id: Option<i64>,
    params: SubscriptionParams,
    positions: Vec<LinkPosition>,
}

impl SubscriptionLink {
    fn matches_session(&self, session_id: i32) -> bool {
        !self.params.has_session_id || self.params.session_id == session_id
    }
}

pub struct DriverConductor {
    ctx: DriverContext,
    #[allow(dead_code)]
    cnc: CncFile,
    to_driver: RingBuffer,
    to_clients: BroadcastTransmitter,
    counters: CountersManager,
    error_log: DistinctErrorLog,
    clock: CachedClock,
    event_queue: ConductorEventQueue,
    proxy: ConductorProxy,

    clients: Vec<ClientEntry>,
    network_publications: Vec<NetworkPublication>,
    ipc_publications: Vec<IpcPublication>,
    send_endpoints: Vec<SendChannelEndpoint>,
    receive_endpoints: Vec<ReceiveChannelEndpoint>,
    subscription_links: Vec<SubscriptionLink>,
    images: Vec<PublicationImage>,

    next_session_id: i32,
    last_timer_check_ns: i64,
    last_consumer_position: i64,
    consumer_position_change_ns: i64,
    terminating: bool,
}

impl DriverConductor {
    /// Validate the context, build the driver directory and CnC file, and
    /// stand up all control-plane structures.
    pub fn launch(ctx: DriverContext) -> Result<Self, DriverError> {
        ctx.validate()?;

        if ctx.dir.exists() && ctx.dir_delete_on_start {
            std::fs::remove_dir_all(&ctx.dir)?;
        }
        std::fs::create_dir_all(ctx.dir.join("publications"))?;
        std::fs::create_dir_all(ctx.dir.join("images"))?;

        let lengths = CncLengths {
            to_driver: ctx.to_driver_buffer_length,
            to_clients: ctx.to_clients_buffer_length,
            counter_metadata: ctx.counter_metadata_buffer_length,
            counter_values: ctx.counter_values_buffer_length,
            error_log: ctx.error_log_buffer_length,
        };

        let start_ms = epoch_time_ms();
        let cnc = CncFile::create(&ctx.dir, lengths, ctx.client_liveness_timeout_ns, start_ms)?;

        let to_driver = RingBuffer::new(cnc.to_driver_region()).map_err(DriverError::Ring)?;
        let to_clients =
            BroadcastTransmitter::new(cnc.to_clients_region()).map_err(DriverError::Broadcast)?;
        let counters = CountersManager::new(
            cnc.counter_metadata_region(),
            cnc.counter_values_region(),
            (ctx.counter_free_to_reuse_timeout_ns / 1_000_000).max(1),
        )
        .map_err(DriverError::Counters)?;
        let error_log = DistinctErrorLog::new(cnc.error_log_region());

        let (proxy, event_queue) = conductor_proxy();
        let now_ns = nano_time();

        info!("driver launched at {:?}", ctx.dir);

        Ok(Self {
            next_session_id: (now_ns ^ (start_ms << 16)) as i32,
            ctx,
            cnc,
            to_driver,
            to_clients,
            counters,
            error_log,
            clock: CachedClock::new(),
            event_queue,
            proxy,
            clients: Vec::new(),
            network_publications: Vec::new(),
            ipc_publications: Vec::new(),
            send_endpoints: Vec::new(),
            receive_endpoints: Vec::new(),
            subscription_links: Vec::new(),
            images: Vec::new(),
            last_timer_check_ns: now_ns,
            last_consumer_position: 0,
            consumer_position_change_ns: now_ns,
            terminating: false,
        })
    }

    /// Handle for external receive workers to inject events.
    pub fn proxy(&self) -> ConductorProxy {
        self.proxy.clone()
    }

    pub fn context(&self) -> &DriverContext {
        &self.ctx
    }

    pub fn counters_reader(&self) -> &CountersReader {
        self.counters.reader()
    }

    /// True once a validated TERMINATE_DRIVER command has been accepted.
    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn network_publication_count(&self) -> usize {
        self.network_publications.len()
    }

    pub fn ipc_publication_count(&self) -> usize {
        self.ipc_publications.len()
    }

    pub fn send_endpoint_count(&self) -> usize {
        self.send_endpoints.len()
    }

    pub fn receive_endpoint_count(&self) -> usize {
        self.receive_endpoints.len()
    }

    /// Registration ids of the live receive endpoints, for external
    /// receivers wiring themselves to the conductor.
    pub fn receive_endpoint_registration_ids(&self) -> Vec<i64> {
        self.receive_endpoints.iter().map(|e| e.registration_id).collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscription_links.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Refcount of the network publication with the given registration id.
    pub fn network_publication_refcount(&self, registration_id: i64) -> Option<i32> {
        self.network_publications
            .iter()
            .find(|p| p.registration_id == registration_id)
            .map(|p| p.refcount)
    }

    pub fn ipc_publication_refcount(&self, registration_id: i64) -> Option<i32> {
        self.ipc_publications
            .iter()
            .find(|p| p.registration_id == registration_id)
            .map(|p| p.refcount)
    }

    /// One duty cycle: commands, receiver events, timers.
    pub fn do_work(&mut self) -> usize {
        let now_ns = nano_time();
        let now_ms = epoch_time_ms();
        self.clock.update(now_ns, now_ms);

        let mut work_count = 0usize;

        let mut commands: Vec<(i32, Vec<u8>)> = Vec::new();
        self.to_driver.read(|msg_type_id, payload| commands.push((msg_type_id, payload.to_vec())), 16);
        work_count += commands.len();
        for (msg_type_id, payload) in commands {
            self.on_command(msg_type_id, &payload, now_ns, now_ms);
        }
        self.to_driver.set_consumer_heartbeat_time_ms(now_ms);

        while let Some(event) = self.event_queue.try_next() {
            self.on_event(event, now_ns);
            work_count += 1;
        }

        if now_ns > self.last_timer_check_ns + self.ctx.timer_interval_ns {
            self.last_timer_check_ns = now_ns;
            work_count += self.on_timer(now_ns, now_ms);
        }

        work_count
    }

    // ── command dispatch ─────────────────────────────────────────────────

    fn on_command(&mut self, msg_type_id: i32, payload: &[u8], now_ns: i64, now_ms: i64) {
        // The correlated prefix is shared by every command, so an error
        // response can name the offender even when the body is bad.
        let correlated = match CorrelatedCommand::decode(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!("unparseable command type={}: {}", msg_type_id, e);
                self.record_error(now_ms, &format!("malformed command: {e}"));
                return;
            }
        };

        let result = match msg_type_id {
            cmd::ADD_PUBLICATION => self.on_add_publication(payload, false, now_ns, now_ms),
            cmd::ADD_EXCLUSIVE_PUBLICATION => self.on_add_publication(payload, true, now_ns, now_ms),
            cmd::REMOVE_PUBLICATION => self.on_remove_publication(payload, now_ns, now_ms),
            cmd::ADD_SUBSCRIPTION => self.on_add_subscription(payload, now_ms),
            cmd::REMOVE_SUBSCRIPTION => self.on_remove_subscription(payload, now_ms),
            cmd::CLIENT_KEEPALIVE => {
                self.ensure_client(correlated.client_id, now_ms);
                Ok(())
            }
            cmd::CLIENT_CLOSE => self.on_client_close(correlated.client_id),
            cmd::ADD_DESTINATION => self.on_add_destination(payload, now_ms),
            cmd::REMOVE_DESTINATION => self.on_remove_destination(payload, now_ms),
            cmd::ADD_COUNTER => self.on_add_counter(payload, now_ms),
            cmd::REMOVE_COUNTER => self.on_remove_counter(payload, now_ms),
            cmd::TERMINATE_DRIVER => self.on_terminate_driver(payload),
            _ => Err(ControlError::new(
                ErrorCode::UnknownCommandTypeId,
                format!("unknown command type id: {msg_type_id}"),
            )),
        };

        if let Err(e) = result {
            debug!("command {} failed: {}", correlated.correlation_id, e.message);
            self.record_error(now_ms, &e.message);
            self.on_error_response(correlated.correlation_id, e.code, &e.message);
        }
    }

    fn on_add_publication(
        &mut self,
        payload: &[u8],
        is_exclusive: bool,
        now_ns: i64,
        now_ms: i64,
    ) -> Result<(), ControlError> {
        let command = PublicationCommand::decode(payload)?;
        self.ensure_client(command.correlated.client_id, now_ms);

        let uri = ChannelUri::parse(&command.channel)?;
        let params = publication_params(&uri, &self.ctx, is_exclusive)?;

        if uri.is_ipc() {
            self.add_ipc_publication(&command, params, is_exclusive, now_ns)
        } else {
            self.add_network_publication(&command, uri, params, is_exclusive, now_ns)
        }
    }

    fn add_network_publication(
        &mut self,
        command: &PublicationCommand,
        uri: ChannelUri,
        mut params: PublicationParams,
        is_exclusive: bool,
        now_ns: i64,
    ) -> Result<(), ControlError> {
        let channel = UdpChannel::from_uri(uri)?;
        let correlation_id = command.correlated.correlation_id;
        let stream_id = command.stream_id;

        // session-id=tag:N borrows the geometry of the tagged publication.
        if let SessionIdParam::Tag(tag) = params.session_id {
            let tagged = self
                .network_publications
                .iter()
                .find(|p| p.entity_tag == Some(tag))
                .ok_or_else(|| {
                    ControlError::new(
                        ErrorCode::GenericError,
                        format!("session-id=tag:{tag} must reference a network publication"),
                    )
                })?;
            params.session_id = SessionIdParam::Value(tagged.session_id);
            params.mtu_length = tagged.log.metadata().mtu_length as usize;
            params.term_length = tagged.log.term_length();
        }

        let endpoint_id = self.get_or_add_send_channel_endpoint(channel)?;
        let endpoint_status_id = self
            .send_endpoints
            .iter()
            .find(|e| e.registration_id == endpoint_id)
            .map(|e| e.status_counter_id)
            .unwrap_or(NO_COUNTER_ID);

        // Shared publications coalesce onto an existing match.
        if !is_exclusive {
            if let Some(index) = self.network_publications.iter().position(|p| {
                p.endpoint_registration_id == endpoint_id
                    && p.stream_id == stream_id
                    && !p.is_exclusive
                    && p.state == PublicationState::Active
            }) {
                confirm_publication_match(
                    &params,
                    self.network_publications[index].session_id,
                    self.network_publications[index].log.metadata().mtu_length as usize,
                    self.network_publications[index].log.term_length(),
                )?;

                self.network_publications[index].incref();
                let existing = &self.network_publications[index];
                let ready = PublicationReady {
                    correlation_id,
                    registration_id: existing.registration_id,
                    session_id: existing.session_id,
                    stream_id,
                    position_limit_counter_id: existing.pub_lmt_counter_id,
                    channel_status_indicator_id: endpoint_status_id,
                    log_file: existing.log.path().to_string_lossy().into_owned(),
                };
                let resource = PublicationResource::Network(existing.registration_id);
                self.link_publication(command.correlated.client_id, correlation_id, resource);
                self.transmit(rsp::ON_PUBLICATION_READY, &ready.encode());
                return Ok(());
            }
        }

        let session_id = self.resolve_session_id(&params, Some(endpoint_id), stream_id, is_exclusive, &command.channel)?;

        let registration_id = correlation_id;
        let now_ms = self.clock.epoch_time_ms();
        let label_suffix = format!("{registration_id} {session_id} {stream_id} {}", command.channel);
        let pub_pos_counter_id = self.counters.allocate(
            now_ms,
            type_ids::PUBLISHER_POSITION,
            &[],
            &format!("pub-pos: {label_suffix}"),
            registration_id,
            -1,
        )?;
        let pub_lmt_counter_id = self.counters.allocate(
            now_ms,
            type_ids::PUBLISHER_LIMIT,
            &[],
            &format!("pub-lmt: {label_suffix}"),
            registration_id,
            -1,
        )?;
        let snd_pos_counter_id = self.counters.allocate(
            now_ms,
            type_ids::SENDER_POSITION,
            &[],
            &format!("snd-pos: {label_suffix}"),
            registration_id,
            -1,
        )?;
        let snd_lmt_counter_id = self.counters.allocate(
            now_ms,
            type_ids::SENDER_LIMIT,
            &[],
            &format!("snd-lmt: {label_suffix}"),
            registration_id,
            -1,
        )?;

        let initial_term_id = if params.has_position {
            params.initial_term_id
        } else {
            randomised_term_id(registration_id)
        };

        let path = self.ctx.dir.join("publications").join(format!("{registration_id}.logbuffer"));
        let log = MappedRawLog::create(
            &path,
            LogParams {
                correlation_id: registration_id,
                initial_term_id,
                term_length: params.term_length,
                mtu_length: params.mtu_length,
                page_size: self.ctx.page_size,
                pre_touch: self.ctx.pre_touch_mapped_memory,
            },
        )?;

        if params.has_position {
            let position = seed_log_position(&log, initial_term_id, params.term_id, params.term_offset);
            self.counters.set_value(pub_pos_counter_id, position);
            self.counters.set_value(pub_lmt_counter_id, position);
        }

        if let Some(endpoint) = self.send_endpoints.iter_mut().find(|e| e.registration_id == endpoint_id) {
            endpoint.incref();
        }

        let publication = NetworkPublication {
            registration_id,
            session_id,
            stream_id,
            endpoint_registration_id: endpoint_id,
            log,
            channel: command.channel.clone(),
            pub_pos_counter_id,
            pub_lmt_counter_id,
            snd_pos_counter_id,
            snd_lmt_counter_id,
            initial_term_id,
            window_length: self.ctx.window_length(params.term_length),
            is_exclusive,
            signal_eos: params.signal_eos,
            entity_tag: params.entity_tag,
            linger_timeout_ns: params.linger_timeout_ns,
            refcount: 1,
            state: PublicationState::Active,
            time_of_last_state_change_ns: now_ns,
        };

        let ready = PublicationReady {
            correlation_id,
            registration_id,
            session_id,
            stream_id,
            position_limit_counter_id: pub_lmt_counter_id,
            channel_status_indicator_id: endpoint_status_id,
            log_file: publication.log.path().to_string_lossy().into_owned(),
        };

        debug!("publication {} session={} stream={} on {}", registration_id, session_id, stream_id, command.channel);

        self.network_publications.push(publication);
        self.link_publication(
            command.correlated.client_id,
            correlation_id,
            PublicationResource::Network(registration_id),
        );

        let type_id = if is_exclusive { rsp::ON_EXCLUSIVE_PUBLICATION_READY } else { rsp::ON_PUBLICATION_READY };
        self.transmit(type_id, &ready.encode());
        Ok(())
    }

    fn add_ipc_publication(
        &mut self,
        command: &PublicationCommand,
        params: PublicationParams,
        is_exclusive: bool,
        now_ns: i64,
    ) -> Result<(), ControlError> {
        let correlation_id = command.correlated.correlation_id;
        let stream_id = command.stream_id;

        if !is_exclusive {
            if let Some(index) = self.ipc_publications.iter().position(|p| {
                p.stream_id == stream_id && !p.is_exclusive && p.state == PublicationState::Active
            }) {
                confirm_publication_match(
                    &params,
                    self.ipc_publications[index].session_id,
                    self.ipc_publications[index].log.metadata().mtu_length as usize,
                    self.ipc_publications[index].log.term_length(),
                )?;

                self.ipc_publications[index].incref();
                let existing = &self.ipc_publications[index];
                let ready = PublicationReady {
                    correlation_id,
                    registration_id: existing.registration_id,
                    session_id: existing.session_id,
                    stream_id,
                    position_limit_counter_id: existing.pub_lmt_counter_id,
                    channel_status_indicator_id: NO_COUNTER_ID,
                    log_file: existing.log.path().to_string_lossy().into_owned(),
                };
                let resource = PublicationResource::Ipc(existing.registration_id);
                self.link_publication(command.correlated.client_id, correlation_id, resource);
                self.transmit(rsp::ON_PUBLICATION_READY, &ready.encode());
                return Ok(());
            }
        }

        let session_id = self.resolve_session_id(&params, None, stream_id, is_exclusive, &command.channel)?;

        let registration_id = correlation_id;
        let now_ms = self.clock.epoch_time_ms();
        let label_suffix = format!("{registration_id} {session_id} {stream_id} {}", command.channel);
        let pub_pos_counter_id = self.counters.allocate(
            now_ms,
            type_ids::PUBLISHER_POSITION,
            &[],
            &format!("pub-pos: {label_suffix}"),
            registration_id,
            -1,
        )?;
        let pub_lmt_counter_id = self.counters.allocate(
            now_ms,
            type_ids::PUBLISHER_LIMIT,
            &[],
            &format!("pub-lmt: {label_suffix}"),
            registration_id,
            -1,
        )?;

        let initial_term_id = if params.has_position {
            params.initial_term_id
        } else {
            randomised_term_id(registration_id)
        };

        let path = self.ctx.dir.join("publications").join(format!("{registration_id}.logbuffer"));
        let log = MappedRawLog::create(
            &path,
            LogParams {
                correlation_id: registration_id,
                initial_term_id,
                term_length: params.term_length,
                mtu_length: params.mtu_length,
                page_size: self.ctx.page_size,
                pre_touch: self.ctx.pre_touch_mapped_memory,
            },
        )?;

        if params.has_position {
            let position = seed_log_position(&log, initial_term_id, params.term_id, params.term_offset);
            self.counters.set_value(pub_pos_counter_id, position);
            self.counters.set_value(pub_lmt_counter_id, position);
        }

        let mut publication = IpcPublication {
            registration_id,
            session_id,
            stream_id,
            log,
            channel: command.channel.clone(),
            pub_pos_counter_id,
            pub_lmt_counter_id,
            initial_term_id,
            window_length: self.ctx.ipc_window_length(params.term_length),
            is_exclusive,
            signal_eos: params.signal_eos,
            entity_tag: params.entity_tag,
            linger_timeout_ns: params.linger_timeout_ns,
            refcount: 1,
            state: PublicationState::Active,
            time_of_last_state_change_ns: now_ns,
            subscriber_position_ids: Vec::new(),
        };

        // Wire up any IPC subscriptions already listening on this stream.
        let join_position = publication.producer_position();
        let mut image_events = Vec::new();
        for link in self
            .subscription_links
            .iter_mut()
            .filter(|l| l.endpoint_registration_id.is_none() && l.stream_id == stream_id)
        {
            if !link.matches_session(session_id) {
                continue;
            }
            let counter_id = self.counters.allocate(
                now_ms,
                type_ids::SUBSCRIBER_POSITION,
                &[],
                &format!("sub-pos: {} {} {} {}", link.registration_id, session_id, stream_id, link.channel),
                link.registration_id,
                link.client_id,
            )?;
            self.counters.set_value(counter_id, join_position);
            link.positions.push(LinkPosition { source_correlation_id: registration_id, counter_id });
            publication.subscriber_position_ids.push((link.registration_id, counter_id));
            image_events.push(ImageReady {
                correlation_id: registration_id,
                session_id,
                stream_id,
                subscriber_registration_id: link.registration_id,
                subscriber_position_id: counter_id,
                log_file: publication.log.path().to_string_lossy().into_owned(),
                source_identity: IPC_SOURCE_IDENTITY.to_string(),
            });
        }

        if !publication.subscriber_position_ids.is_empty() {
            publication.log.metadata().set_is_connected(true);
            publication.update_pub_lmt(&self.counters);
        }

        let ready = PublicationReady {
            correlation_id,
            registration_id,
            session_id,
            stream_id,
            position_limit_counter_id: pub_lmt_counter_id,
            channel_status_indicator_id: NO_COUNTER_ID,
            log_file: publication.log.path().to_string_lossy().into_owned(),
        };

        self.ipc_publications.push(publication);
        self.link_publication(
            command.correlated.client_id,
            correlation_id,
            PublicationResource::Ipc(registration_id),
        );

        let type_id = if is_exclusive { rsp::ON_EXCLUSIVE_PUBLICATION_READY } else { rsp::ON_PUBLICATION_READY };
        self.transmit(type_id, &ready.encode());
        for event in image_events {
            self.transmit(rsp::ON_AVAILABLE_IMAGE, &event.encode());
        }
        Ok(())
    }

    fn on_remove_publication(&mut self, payload: &[u8], now_ns: i64, now_ms: i64) -> Result<(), ControlError> {
        let command = RemoveCommand::decode(payload)?;
        self.ensure_client(command.correlated.client_id, now_ms);

        let client_index = self
            .clients
            .iter()
            .position(|c| c.client_id == command.correlated.client_id)
            .ok_or_else(|| ControlError::new(ErrorCode::UnknownPublication, "unknown client"))?;

        let link_index = self.clients[client_index]
            .publication_links
            .iter()
            .position(|l| l.registration_id == command.registration_id)
            .ok_or_else(|| {
                ControlError::new(
                    ErrorCode::UnknownPublication,
                    format!("unknown publication: {}", command.registration_id),
                )
            })?;

        let link = self.clients[client_index].publication_links.swap_remove(link_index);
        self.decref_publication(&link.resource, now_ns);

        self.transmit(
            rsp::ON_OPERATION_SUCCESS,
            &OperationSucceeded { correlation_id: command.correlated.correlation_id }.encode(),
        );
        Ok(())
    }

    fn on_add_subscription(&mut self, payload: &[u8], now_ms: i64) -> Result<(), ControlError> {
        let command = SubscriptionCommand::decode(payload)?;
        self.ensure_client(command.correlated.client_id, now_ms);

        let uri = ChannelUri::parse(&command.channel)?;
        let params = subscription_params(&uri, &self.ctx)?;
        let correlation_id = command.correlated.correlation_id;

        if uri.is_ipc() {
            let mut link = SubscriptionLink {
                registration_id: correlation_id,
                client_id: command.correlated.client_id,
                stream_id: command.stream_id,
                channel: command.channel.clone(),
                endpoint_registration_id: None,
                params,
                positions: Vec::new(),
            };

            self.transmit(
                rsp::ON_SUBSCRIPTION_READY,
                &SubscriptionReady { correlation_id, channel_status_indicator_id: NO_COUNTER_ID }.encode(),
            );

            // Attach to every active IPC publication on the stream.
            let mut image_events = Vec::new();
            for publication in self
                .ipc_publications
                .iter_mut()
                .filter(|p| p.stream_id == command.stream_id && p.state == PublicationState::Active)
            {
                if !link.matches_session(publication.session_id) {
                    continue;
                }
                let join_position = publication.producer_position();
                let counter_id = self.counters.allocate(
                    now_ms,
                    type_ids::SUBSCRIBER_POSITION,
                    &[],
                    &format!(
                        "sub-pos: {} {} {} {}",
                        link.registration_id, publication.session_id, publication.stream_id, link.channel
                    ),
                    link.registration_id,
                    link.client_id,
                )?;
                self.counters.set_value(counter_id, join_position);
                link.positions.push(LinkPosition {
                    source_correlation_id: publication.registration_id,
                    counter_id,
                });
                publication.subscriber_position_ids.push((link.registration_id, counter_id));
                publication.log.metadata().set_is_connected(true);
                publication.update_pub_lmt(&self.counters);
                image_events.push(ImageReady {
                    correlation_id: publication.registration_id,
                    session_id: publication.session_id,
                    stream_id: publication.stream_id,
                    subscriber_registration_id: link.registration_id,
                    subscriber_position_id: counter_id,
                    log_file: publication.log.path().to_string_lossy().into_owned(),
                    source_identity: IPC_SOURCE_IDENTITY.to_string(),
                });
            }

            self.subscription_links.push(link);
            for event in image_events {
                self.transmit(rsp::ON_AVAILABLE_IMAGE, &event.encode());
            }
            return Ok(());
        }

        let channel = UdpChannel::from_uri(uri)?;
        let endpoint_id = self.get_or_add_receive_channel_endpoint(channel)?;
        let endpoint_status_id = self
            .receive_endpoints
            .iter_mut()
            .find(|e| e.registration_id == endpoint_id)
            .map(|e| {
                e.incref_to_stream(command.stream_id);
                e.status_counter_id
            })
            .unwrap_or(NO_COUNTER_ID);

        let mut link = SubscriptionLink {
            registration_id: correlation_id,
            client_id: command.correlated.client_id,
            stream_id: command.stream_id,
            channel: command.channel.clone(),
            endpoint_registration_id: Some(endpoint_id),
            params,
            positions: Vec::new(),
        };

        self.transmit(
            rsp::ON_SUBSCRIPTION_READY,
            &SubscriptionReady { correlation_id, channel_status_indicator_id: endpoint_status_id }.encode(),
        );

        // Join any live images this endpoint already tracks on the stream.
        let mut image_events = Vec::new();
        for image in self.images.iter_mut().filter(|i| {
            i.endpoint_registration_id == endpoint_id
                && i.stream_id == command.stream_id
                && i.state == ImageState::Active
        }) {
            if !link.matches_session(image.session_id) {
                continue;
            }
            let join_position = self.counters.get_value(image.rcv_pos_counter_id);
            let counter_id = self.counters.allocate(
                now_ms,
                type_ids::SUBSCRIBER_POSITION,
                &[],
                &format!("sub-pos: {} {} {} {}", link.registration_id, image.session_id, image.stream_id, link.channel),
                link.registration_id,
                link.client_id,
            )?;
            self.counters.set_value(counter_id, join_position);
            link.positions.push(LinkPosition { source_correlation_id: image.correlation_id, counter_id });
            image.subscriber_positions.push(SubscriberPosition {
                subscription_registration_id: link.registration_id,
                counter_id,
            });
            image_events.push(ImageReady {
                correlation_id: image.correlation_id,
                session_id: image.session_id,
                stream_id: image.stream_id,
                subscriber_registration_id: link.registration_id,
                subscriber_position_id: counter_id,
                log_file: image.log.path().to_string_lossy().into_owned(),
                source_identity: image.source_identity.clone(),
            });
        }

        self.subscription_links.push(link);
        for event in image_events {
            self.transmit(rsp::ON_AVAILABLE_IMAGE, &event.encode());
        }
        Ok(())
    }

    fn on_remove_subscription(&mut self, payload: &[u8], now_ms: i64) -> Result<(), ControlError> {
        let command = RemoveCommand::decode(payload)?;
        self.ensure_client(command.correlated.client_id, now_ms);

        let index = self
            .subscription_links
            .iter()
            .position(|l| l.registration_id == command.registration_id)
            .ok_or_else(|| {
                ControlError::new(
                    ErrorCode::UnknownSubscription,
                    format!("unknown subscription: {}", command.registration_id),
                )
            })?;

        let link = self.subscription_links.swap_remove(index);
        self.unlink_subscription(link, now_ms, false);

        self.transmit(
            rsp::ON_OPERATION_SUCCESS,
            &OperationSucceeded { correlation_id: command.correlated.correlation_id }.encode(),
        );
        Ok(())
    }

    fn on_client_close(&mut self, client_id: i64) -> Result<(), ControlError> {
        if let Some(client) = self.clients.iter_mut().find(|c| c.client_id == client_id) {
            client.closed_by_command = true;
            client.reached_end_of_life = true;
        }
        Ok(())
    }

    fn on_add_destination(&mut self, payload: &[u8], now_ms: i64) -> Result<(), ControlError> {
        let command = DestinationCommand::decode(payload)?;
        self.ensure_client(command.correlated.client_id, now_ms);

        let destination = UdpChannel::parse(&command.channel)?;
        let endpoint_id = self.manual_mdc_endpoint_id(command.registration_id)?;

        if let Some(endpoint) = self.send_endpoints.iter_mut().find(|e| e.registration_id == endpoint_id) {
            endpoint.add_destination(destination.remote_data);
        }

        self.transmit(
            rsp::ON_OPERATION_SUCCESS,
            &OperationSucceeded { correlation_id: command.correlated.correlation_id }.encode(),
        );
        Ok(())
    }

    fn on_remove_destination(&mut self, payload: &[u8], now_ms: i64) -> Result<(), ControlError> {
        let command = DestinationCommand::decode(payload)?;
        self.ensure_client(command.correlated.client_id, now_ms);

        let destination = UdpChannel::parse(&command.channel)?;
        let endpoint_id = self.manual_mdc_endpoint_id(command.registration_id)?;

        let removed = self
            .send_endpoints
            .iter_mut()
            .find(|e| e.registration_id == endpoint_id)
            .map(|e| e.remove_destination(&destination.remote_data))
            .unwrap_or(false);

        if !removed {
            return Err(ControlError::new(
                ErrorCode::GenericError,
                format!("unknown destination: {}", command.channel),
            ));
        }

        self.transmit(
            rsp::ON_OPERATION_SUCCESS,
            &OperationSucceeded { correlation_id: command.correlated.correlation_id }.encode(),
        );
        Ok(())
    }

    /// Destinations only apply to publications on manual-control channels.
    fn manual_mdc_endpoint_id(&self, publication_registration_id: i64) -> Result<i64, ControlError> {
        let publication = self
            .network_publications
            .iter()
            .find(|p| p.registration_id == publication_registration_id)
            .ok_or_else(|| {
                ControlError::new(
                    ErrorCode::UnknownPublication,
                    format!("unknown publication: {publication_registration_id}"),
                )
            })?;

        let endpoint = self
            .send_endpoints
            .iter()
            .find(|e| e.registration_id == publication.endpoint_registration_id)
            .ok_or_else(|| ControlError::new(ErrorCode::ChannelEndpointError, "endpoint missing"))?;

        if !endpoint.channel.is_manual_control_mode {
            return Err(ControlError::new(
                ErrorCode::GenericError,
                "destinations require control-mode=manual",
            ));
        }

        Ok(endpoint.registration_id)
    }

    fn on_add_counter(&mut self, payload: &[u8], now_ms: i64) -> Result<(), ControlError> {
        let command = CounterCommand::decode(payload)?;
        self.ensure_client(command.correlated.client_id, now_ms);
        let correlation_id = command.correlated.correlation_id;

        let counter_id = self.counters.allocate(
            now_ms,
            command.type_id,
            &command.key,
            &command.label,
            correlation_id,
            command.correlated.client_id,
        )?;

        if let Some(client) = self.clients.iter_mut().find(|c| c.client_id == command.correlated.client_id) {
            client.counter_links.push(CounterLink { registration_id: correlation_id, counter_id });
        }

        self.transmit(rsp::ON_COUNTER_READY, &CounterUpdate { correlation_id, counter_id }.encode());
        Ok(())
    }

    fn on_remove_counter(&mut self, payload: &[u8], now_ms: i64) -> Result<(), ControlError> {
        let command = RemoveCommand::decode(payload)?;
        self.ensure_client(command.correlated.client_id, now_ms);

        let client = self
            .clients
            .iter_mut()
            .find(|c| c.client_id == command.correlated.client_id)
            .ok_or_else(|| ControlError::new(ErrorCode::UnknownCounter, "unknown client"))?;

        let link_index = client
            .counter_links
            .iter()
            .position(|l| l.registration_id == command.registration_id)
            .ok_or_else(|| {
                ControlError::new(
                    ErrorCode::UnknownCounter,
                    format!("unknown counter: {}", command.registration_id),
                )
            })?;

        let link = client.counter_links.swap_remove(link_index);
        self.counters.free(now_ms, link.counter_id);

        self.transmit(
            rsp::ON_OPERATION_SUCCESS,
            &OperationSucceeded { correlation_id: command.correlated.correlation_id }.encode(),
        );
        self.transmit(
            rsp::ON_UNAVAILABLE_COUNTER,
            &CounterUpdate { correlation_id: link.registration_id, counter_id: link.counter_id }.encode(),
        );
        Ok(())
    }

    fn on_terminate_driver(&mut self, payload: &[u8]) -> Result<(), ControlError> {
        let command = TerminateDriverCommand::decode(payload)?;

        if let Some(expected) = &self.ctx.termination_token {
            if &command.token != expected {
                return Err(ControlError::new(ErrorCode::GenericError, "invalid termination token"));
            }
        }

        info!("driver termination requested");
        self.terminating = true;
        Ok(())
    }

    // ── receiver events ─────────────────────────────────────────────────

    fn on_event(&mut self, event: ConductorEvent, now_ns: i64) {
        match event {
            ConductorEvent::CreatePublicationImage {
                endpoint_registration_id,
                session_id,
                stream_id,
                initial_term_id,
                active_term_id,
                term_offset,
                term_length,
                mtu_length,
                source_identity,
            } => {
                if let Err(e) = self.on_create_publication_image(
                    endpoint_registration_id,
                    session_id,
                    stream_id,
                    initial_term_id,
                    active_term_id,
                    term_offset,
                    term_length,
                    mtu_length,
                    &source_identity,
                    now_ns,
                ) {
                    let now_ms = self.clock.epoch_time_ms();
                    self.record_error(now_ms, &e.message);
                }
            }
            ConductorEvent::ImageEndOfStream { image_correlation_id } => {
                if let Some(image) = self.images.iter_mut().find(|i| i.correlation_id == image_correlation_id) {
                    image.is_end_of_stream = true;
                }
            }
            ConductorEvent::ImageActivity { image_correlation_id } => {
                if let Some(image) = self.images.iter_mut().find(|i| i.correlation_id == image_correlation_id) {
                    image.time_of_last_activity_ns = now_ns;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_create_publication_image(
        &mut self,
        endpoint_registration_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        active_term_id: i32,
        term_offset: i32,
        term_length: usize,
        mtu_length: usize,
        source_identity: &str,
        now_ns: i64,
    ) -> Result<(), ControlError> {
        let has_interest = self
            .receive_endpoints
            .iter()
            .find(|e| e.registration_id == endpoint_registration_id)
            .map(|e| e.has_subscription_interest(stream_id))
            .unwrap_or(false);
        if !has_interest {
            return Ok(());
        }

        // One image per (endpoint, session, stream).
        if self.images.iter().any(|i| {
            i.endpoint_registration_id == endpoint_registration_id
                && i.session_id == session_id
                && i.stream_id == stream_id
                && i.state == ImageState::Active
        }) {
            return Ok(());
        }

        let correlation_id = self.to_driver.next_correlation_id();
        let now_ms = self.clock.epoch_time_ms();

        let path = self.ctx.dir.join("images").join(format!("{correlation_id}.logbuffer"));
        let log = MappedRawLog::create(
            &path,
            LogParams {
                correlation_id,
                initial_term_id,
                term_length,
                mtu_length,
                page_size: self.ctx.page_size,
                pre_touch: self.ctx.pre_touch_mapped_memory,
            },
        )?;

        let join_position = seed_log_position(&log, initial_term_id, active_term_id, term_offset);

        let label_suffix = format!("{correlation_id} {session_id} {stream_id}");
        let rcv_hwm_counter_id = self.counters.allocate(
            now_ms,
            type_ids::RECEIVER_HWM,
            &[],
            &format!("rcv-hwm: {label_suffix}"),
            correlation_id,
            -1,
        )?;
        let rcv_pos_counter_id = self.counters.allocate(
            now_ms,
            type_ids::RECEIVER_POSITION,
            &[],
            &format!("rcv-pos: {label_suffix}"),
            correlation_id,
            -1,
        )?;
        self.counters.set_value(rcv_hwm_counter_id, join_position);
        self.counters.set_value(rcv_pos_counter_id, join_position);

        let mut image = PublicationImage {
            correlation_id,
            session_id,
            stream_id,
            endpoint_registration_id,
            log,
            initial_term_id,
            rcv_hwm_counter_id,
            rcv_pos_counter_id,
            source_identity: source_identity.to_string(),
            subscriber_positions: Vec::new(),
            state: ImageState::Active,
            time_of_last_state_change_ns: now_ns,
            time_of_last_activity_ns: now_ns,
            liveness_timeout_ns: self.ctx.image_liveness_timeout_ns,
            is_end_of_stream: false,
        };

        let mut image_events = Vec::new();
        for link in self.subscription_links.iter_mut().filter(|l| {
            l.endpoint_registration_id == Some(endpoint_registration_id) && l.stream_id == stream_id
        }) {
            if !link.matches_session(session_id) {
                continue;
            }
            let counter_id = self.counters.allocate(
                now_ms,
                type_ids::SUBSCRIBER_POSITION,
                &[],
                &format!("sub-pos: {} {} {} {}", link.registration_id, session_id, stream_id, link.channel),
                link.registration_id,
                link.client_id,
            )?;
            self.counters.set_value(counter_id, join_position);
            link.positions.push(LinkPosition { source_correlation_id: correlation_id, counter_id });
            image.subscriber_positions.push(SubscriberPosition {
                subscription_registration_id: link.registration_id,
                counter_id,
            });
            image_events.push(ImageReady {
                correlation_id,
                session_id,
                stream_id,
                subscriber_registration_id: link.registration_id,
                subscriber_position_id: counter_id,
                log_file: image.log.path().to_string_lossy().into_owned(),
                source_identity: image.source_identity.clone(),
            });
        }

        if image.subscriber_positions.is_empty() {
            // No live interest after the session filter; drop the image.
            let now_ms = self.clock.epoch_time_ms();
            self.counters.free(now_ms, rcv_hwm_counter_id);
            self.counters.free(now_ms, rcv_pos_counter_id);
            return Ok(());
        }

        debug!("image {} session={} stream={} from {}", correlation_id, session_id, stream_id, source_identity);

        self.images.push(image);
        for event in image_events {
            self.transmit(rsp::ON_AVAILABLE_IMAGE, &event.encode());
        }
        Ok(())
    }

    // ── timers ──────────────────────────────────────────────────────────

    fn on_timer(&mut self, now_ns: i64, now_ms: i64) -> usize {
        let mut work_count = 0;
        work_count += self.check_clients(now_ns, now_ms);
        work_count += self.check_network_publications(now_ns, now_ms);
        work_count += self.check_ipc_publications(now_ns, now_ms);
        work_count += self.check_images(now_ns, now_ms);
        self.check_for_blocked_commands(now_ns);
        work_count
    }

    fn check_clients(&mut self, now_ns: i64, now_ms: i64) -> usize {
        let timeout_ms = (self.ctx.client_liveness_timeout_ns / 1_000_000).max(1);

        let mut timed_out = Vec::new();
        for client in self.clients.iter_mut() {
            if client.reached_end_of_life {
                continue;
            }
            let heartbeat_ms = self.counters.get_value(client.heartbeat_counter_id);
            if now_ms > heartbeat_ms + timeout_ms {
                client.reached_end_of_life = true;
                if !client.closed_by_command {
                    timed_out.push(client.client_id);
                }
            }
        }

        for client_id in &timed_out {
            info!("client {} timed out", client_id);
            self.transmit(rsp::ON_CLIENT_TIMEOUT, &ClientTimeout { client_id: *client_id }.encode());
        }

        let mut reaped = 0;
        while let Some(index) = self.clients.iter().position(|c| c.reached_end_of_life) {
            let client = self.clients.swap_remove(index);
            self.delete_client(client, now_ns, now_ms);
            reaped += 1;
        }
        reaped
    }

    fn delete_client(&mut self, client: ClientEntry, now_ns: i64, now_ms: i64) {
        for link in &client.counter_links {
            self.counters.free(now_ms, link.counter_id);
            self.transmit(
                rsp::ON_UNAVAILABLE_COUNTER,
                &CounterUpdate { correlation_id: link.registration_id, counter_id: link.counter_id }.encode(),
            );
        }

        for link in &client.publication_links {
            self.decref_publication(&link.resource, now_ns);
        }

        while let Some(index) = self
            .subscription_links
            .iter()
            .position(|l| l.client_id == client.client_id)
        {
            let link = self.subscription_links.swap_remove(index);
            self.unlink_subscription(link, now_ms, true);
        }

        self.counters.free(now_ms, client.heartbeat_counter_id);
    }

    /// Detach a subscription from everything it consumes. When `announce`
    /// is set an unavailable-image event is broadcast per attached source
    /// (used for timeout teardown; a client-requested remove is silent).
    fn unlink_subscription(&mut self, link: SubscriptionLink, now_ms: i64, announce: bool) {
        for position in &link.positions {
            for publication in self.ipc_publications.iter_mut() {
                publication
                    .subscriber_position_ids
                    .retain(|(sub_id, _)| *sub_id != link.registration_id);
            }
            for image in self.images.iter_mut() {
                image.remove_subscriber(link.registration_id);
            }
            self.counters.free(now_ms, position.counter_id);

            if announce {
                self.transmit(
                    rsp::ON_UNAVAILABLE_IMAGE,
                    &ImageMessage {
                        correlation_id: position.source_correlation_id,
                        subscription_registration_id: link.registration_id,
                        stream_id: link.stream_id,
                        channel: link.channel.clone(),
                    }
                    .encode(),
                );
            }
        }

        if let Some(endpoint_id) = link.endpoint_registration_id {
            let remove = self
                .receive_endpoints
                .iter_mut()
                .find(|e| e.registration_id == endpoint_id)
                .map(|e| {
                    e.decref_to_stream(link.stream_id);
                    e.stream_count() == 0
                })
                .unwrap_or(false);

            if remove {
                self.remove_receive_endpoint(endpoint_id, now_ms);
            }
        }
    }

    fn remove_receive_endpoint(&mut self, endpoint_id: i64, now_ms: i64) {
        if let Some(index) = self.receive_endpoints.iter().position(|e| e.registration_id == endpoint_id) {
            let endpoint = self.receive_endpoints.swap_remove(index);
            self.counters.set_value(endpoint.status_counter_id, channel_status::CLOSING);
            self.counters.free(now_ms, endpoint.status_counter_id);
        }
    }

    fn decref_publication(&mut self, resource: &PublicationResource, now_ns: i64) {
        match resource {
            PublicationResource::Network(registration_id) => {
                if let Some(publication) = self
                    .network_publications
                    .iter_mut()
                    .find(|p| p.registration_id == *registration_id)
                {
                    publication.decref(now_ns);
                }
            }
            PublicationResource::Ipc(registration_id) => {
                if let Some(publication) = self
                    .ipc_publications
                    .iter_mut()
                    .find(|p| p.registration_id == *registration_id)
                {
                    publication.decref(now_ns);
                }
            }
        }
    }

    fn check_network_publications(&mut self, now_ns: i64, now_ms: i64) -> usize {
        for publication in self.network_publications.iter_mut() {
            publication.on_time_event(now_ns, &self.counters);
            if publication.state == PublicationState::Active {
                publication.update_pub_lmt(&self.counters);
            }
        }

        let mut reaped = 0;
        while let Some(index) = self
            .network_publications
            .iter()
            .position(|p| p.state == PublicationState::Done)
        {
            let publication = self.network_publications.swap_remove(index);
            self.cleanup_network_publication(publication, now_ms);
            reaped += 1;
        }
        reaped
    }

    fn cleanup_network_publication(&mut self, publication: NetworkPublication, now_ms: i64) {
        for counter_id in [
            publication.pub_pos_counter_id,
            publication.pub_lmt_counter_id,
            publication.snd_pos_counter_id,
            publication.snd_lmt_counter_id,
        ] {
            self.counters.free(now_ms, counter_id);
        }

        let endpoint_id = publication.endpoint_registration_id;
        let remove = self
            .send_endpoints
            .iter_mut()
            .find(|e| e.registration_id == endpoint_id)
            .map(|e| e.decref())
            .unwrap_or(false);

        if remove {
            if let Some(index) = self.send_endpoints.iter().position(|e| e.registration_id == endpoint_id) {
                let endpoint = self.send_endpoints.swap_remove(index);
                self.counters.set_value(endpoint.status_counter_id, channel_status::CLOSING);
                self.counters.free(now_ms, endpoint.status_counter_id);
            }
        }

        debug!("network publication {} freed", publication.registration_id);
        // The log mapping owns its file and unlinks it on drop.
    }

    fn check_ipc_publications(&mut self, now_ns: i64, now_ms: i64) -> usize {
        for publication in self.ipc_publications.iter_mut() {
            publication.on_time_event(now_ns, &self.counters);
        }

        let mut reaped = 0;
        while let Some(index) = self
            .ipc_publications
            .iter()
            .position(|p| p.state == PublicationState::Done)
        {
            let publication = self.ipc_publications.swap_remove(index);
            self.cleanup_ipc_publication(publication, now_ms);
            reaped += 1;
        }
        reaped
    }

    fn cleanup_ipc_publication(&mut self, publication: IpcPublication, now_ms: i64) {
        self.counters.free(now_ms, publication.pub_pos_counter_id);
        self.counters.free(now_ms, publication.pub_lmt_counter_id);

        // Detach consuming subscriptions and tell them the image is gone.
        let mut events = Vec::new();
        for link in self.subscription_links.iter_mut() {
            link.positions.retain(|p| {
                if p.source_correlation_id == publication.registration_id {
                    events.push((p.counter_id, link.registration_id, link.stream_id, link.channel.clone()));
                    false
                } else {
                    true
                }
            });
        }

        for (counter_id, subscription_registration_id, stream_id, channel) in events {
            self.counters.free(now_ms, counter_id);
            self.transmit(
                rsp::ON_UNAVAILABLE_IMAGE,
                &ImageMessage {
                    correlation_id: publication.registration_id,
                    subscription_registration_id,
                    stream_id,
                    channel,
                }
                .encode(),
            );
        }
    }

    fn check_images(&mut self, now_ns: i64, now_ms: i64) -> usize {
        let mut to_announce = Vec::new();
        for image in self.images.iter_mut() {
            if image.on_time_event(now_ns, &self.counters) == Some(true) {
                for sp in &image.subscriber_positions {
                    to_announce.push((image.correlation_id, sp.subscription_registration_id, image.stream_id));
                }
            }
        }

        for (image_id, subscription_registration_id, stream_id) in to_announce {
            let channel = self
                .subscription_links
                .iter()
                .find(|l| l.registration_id == subscription_registration_id)
                .map(|l| l.channel.clone())
                .unwrap_or_default();
            self.transmit(
                rsp::ON_UNAVAILABLE_IMAGE,
                &ImageMessage {
                    correlation_id: image_id,
                    subscription_registration_id,
                    stream_id,
                    channel,
                }
                .encode(),
            );
        }

        let mut reaped = 0;
        while let Some(index) = self.images.iter().position(|i| i.state == ImageState::Done) {
            let image = self.images.swap_remove(index);
            self.cleanup_image(image, now_ms);
            reaped += 1;
        }
        reaped
    }

    fn cleanup_image(&mut self, image: PublicationImage, now_ms: i64) {
        self.counters.free(now_ms, image.rcv_hwm_counter_id);
        self.counters.free(now_ms, image.rcv_pos_counter_id);

        for sp in &image.subscriber_positions {
            self.counters.free(now_ms, sp.counter_id);
        }
        for link in self.subscription_links.iter_mut() {
            link.positions.retain(|p| p.source_correlation_id != image.correlation_id);
        }

        debug!("image {} freed", image.correlation_id);
    }

    /// A producer that died mid-claim wedges the command ring for every
    /// client; detect the stall and force padding through.
    fn check_for_blocked_commands(&mut self, now_ns: i64) {
        let consumer_position = self.to_driver.consumer_position();

        if consumer_position != self.last_consumer_position {
            self.last_consumer_position = consumer_position;
            self.consumer_position_change_ns = now_ns;
            return;
        }

        if self.to_driver.producer_position() > consumer_position
            && now_ns - self.consumer_position_change_ns > self.ctx.client_liveness_timeout_ns
        {
            if self.to_driver.unblock() {
                warn!("unblocked stalled command ring at {}", consumer_position);
                self.consumer_position_change_ns = now_ns;
            }
        }
    }

    // ── endpoints ───────────────────────────────────────────────────────

    fn get_or_add_send_channel_endpoint(&mut self, channel: UdpChannel) -> Result<i64, ControlError> {
        if let Some(tag) = channel.tag_id {
            if let Some(endpoint) = self.send_endpoints.iter().find(|e| e.channel.tag_id == Some(tag)) {
                return Ok(endpoint.registration_id);
            }
        }

        if let Some(endpoint) = self
            .send_endpoints
            .iter()
            .find(|e| e.channel.canonical_form == channel.canonical_form)
        {
            return Ok(endpoint.registration_id);
        }

        let registration_id = self.to_driver.next_correlation_id();
        let now_ms = self.clock.epoch_time_ms();
        let status_counter_id = self.counters.allocate(
            now_ms,
            type_ids::SEND_CHANNEL_STATUS,
            &[],
            &format!("snd-channel: {}", channel.canonical_form),
            registration_id,
            -1,
        )?;
        self.counters.set_value(status_counter_id, channel_status::ACTIVE);

        debug!("send endpoint {} for {}", registration_id, channel.canonical_form);
        self.send_endpoints.push(SendChannelEndpoint::new(registration_id, channel, status_counter_id));
        Ok(registration_id)
    }

    fn get_or_add_receive_channel_endpoint(&mut self, channel: UdpChannel) -> Result<i64, ControlError> {
        if let Some(tag) = channel.tag_id {
            if let Some(endpoint) = self.receive_endpoints.iter().find(|e| e.channel.tag_id == Some(tag)) {
                return Ok(endpoint.registration_id);
            }
        }

        if let Some(endpoint) = self
            .receive_endpoints
            .iter()
            .find(|e| e.channel.canonical_form == channel.canonical_form)
        {
            return Ok(endpoint.registration_id);
        }

        let registration_id = self.to_driver.next_correlation_id();
        let now_ms = self.clock.epoch_time_ms();
        let status_counter_id = self.counters.allocate(
            now_ms,
            type_ids::RECEIVE_CHANNEL_STATUS,
            &[],
            &format!("rcv-channel: {}", channel.canonical_form),
            registration_id,
            -1,
        )?;
        self.counters.set_value(status_counter_id, channel_status::ACTIVE);

        debug!("receive endpoint {} for {}", registration_id, channel.canonical_form);
        self.receive_endpoints
            .push(ReceiveChannelEndpoint::new(registration_id, channel, status_counter_id));
        Ok(registration_id)
    }

    // ── clients and session ids ─────────────────────────────────────────

    fn ensure_client(&mut self, client_id: i64, now_ms: i64) {
        if let Some(client) = self.clients.iter().find(|c| c.client_id == client_id) {
            // A timed-out client is not revived by a late keepalive.
            if !client.reached_end_of_life {
                self.counters.set_value(client.heartbeat_counter_id, now_ms);
            }
            return;
        }

        match self.counters.allocate(
            now_ms,
            type_ids::CLIENT_HEARTBEAT,
            &[],
            &format!("client-heartbeat: {client_id}"),
            client_id,
            client_id,
        ) {
            Ok(heartbeat_counter_id) => {
                self.counters.set_value(heartbeat_counter_id, now_ms);
                debug!("client {} attached", client_id);
                self.clients.push(ClientEntry {
                    client_id,
                    heartbeat_counter_id,
                    closed_by_command: false,
                    reached_end_of_life: false,
                    publication_links: Vec::new(),
                    counter_links: Vec::new(),
                });
            }
            Err(e) => {
                let msg = format!("could not allocate client heartbeat: {e}");
                self.record_error(now_ms, &msg);
            }
        }
    }

    fn link_publication(&mut self, client_id: i64, registration_id: i64, resource: PublicationResource) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.client_id == client_id) {
            client.publication_links.push(PublicationLink { registration_id, resource });
        }
    }

    fn resolve_session_id(
        &mut self,
        params: &PublicationParams,
        endpoint_id: Option<i64>,
        stream_id: i32,
        is_exclusive: bool,
        channel: &str,
    ) -> Result<i32, ControlError> {
        let _ = is_exclusive;
        match params.session_id {
            SessionIdParam::Value(session_id) => {
                if self.session_id_in_use(endpoint_id, stream_id, session_id) {
                    return Err(ControlError::new(
                        ErrorCode::GenericError,
                        format!(
                            "specified session-id is already in exclusive use for channel: {channel}, stream-id: {stream_id}"
                        ),
                    ));
                }
                Ok(session_id)
            }
            SessionIdParam::None => Ok(self.next_available_session_id(endpoint_id, stream_id)),
            SessionIdParam::Tag(_) => unreachable!("tag resolved before session id selection"),
        }
    }

    fn session_id_in_use(&self, endpoint_id: Option<i64>, stream_id: i32, session_id: i32) -> bool {
        match endpoint_id {
            Some(endpoint_id) => self.network_publications.iter().any(|p| {
                p.endpoint_registration_id == endpoint_id
                    && p.stream_id == stream_id
                    && p.session_id == session_id
                    && p.state == PublicationState::Active
            }),
            None => self.ipc_publications.iter().any(|p| {
                p.stream_id == stream_id && p.session_id == session_id && p.state == PublicationState::Active
            }),
        }
    }

    /// Next dynamically assigned session id: skip the reserved range and
    /// any id live on the same (endpoint, stream); wrap at i32::MAX.
    fn next_available_session_id(&mut self, endpoint_id: Option<i64>, stream_id: i32) -> i32 {
        loop {
            let mut candidate = self.next_session_id;

            let low = self.ctx.publication_reserved_session_id_low;
            let high = self.ctx.publication_reserved_session_id_high;
            if low <= candidate && candidate <= high {
                candidate = high.wrapping_add(1);
            }

            self.next_session_id = candidate.wrapping_add(1);

            if !self.session_id_in_use(endpoint_id, stream_id, candidate) {
                return candidate;
            }
        }
    }

    // ── responses ───────────────────────────────────────────────────────

    fn transmit(&mut self, msg_type_id: i32, payload: &[u8]) {
        if let Err(e) = self.to_clients.transmit(msg_type_id, payload) {
            let now_ms = self.clock.epoch_time_ms();
            self.record_error(now_ms, &format!("broadcast transmit failed: {e}"));
        }
    }

    fn on_error_response(&mut self, offending_correlation_id: i64, code: ErrorCode, message: &str) {
        let response = ErrorResponse {
            offending_command_correlation_id: offending_correlation_id,
            error_code: code,
            error_message: message.to_string(),
        };
        self.transmit(rsp::ON_ERROR, &response.encode());
    }

    fn record_error(&mut self, now_ms: i64, message: &str) {
        self.error_log.record(now_ms, message);
    }
}

/// Shared publications must agree on session id, MTU, and term length.
fn confirm_publication_match(
    params: &PublicationParams,
    existing_session_id: i32,
    existing_mtu: usize,
    existing_term_length: usize,
) -> Result<(), ControlError> {
    if let SessionIdParam::Value(session_id) = params.session_id {
        if session_id != existing_session_id {
            return Err(ControlError::new(
                ErrorCode::GenericError,
                format!(
                    "existing publication has different session id: existing={existing_session_id} requested={session_id}"
                ),
            ));
        }
    }

    if params.mtu_length != existing_mtu {
        return Err(ControlError::new(
            ErrorCode::GenericError,
            format!(
                "existing publication has different MTU length: existing={existing_mtu} requested={}",
                params.mtu_length
            ),
        ));
    }

    if params.term_length != existing_term_length {
        return Err(ControlError::new(
            ErrorCode::GenericError,
            format!(
                "existing publication has different term length: existing={existing_term_length} requested={}",
                params.term_length
            ),
        ));
    }

    Ok(())
}

/// Seed a fresh log so appends continue from `(term_id, term_offset)`.
fn seed_log_position(log: &MappedRawLog, initial_term_id: i32, term_id: i32, term_offset: i32) -> i64 {
    let metadata = log.metadata();
    let term_count = term_id.wrapping_sub(initial_term_id);
    let index = index_by_term(initial_term_id, term_id);

    metadata.term_tail_counters[index]
        .store(pack_tail(term_id, term_offset), std::sync::atomic::Ordering::Release);
    metadata
        .active_term_count
        .store(term_count, std::sync::atomic::Ordering::Release);

    compute_position(
        term_id,
        term_offset,
        position_bits_to_shift(log.term_length() as i32),
        initial_term_id,
    )
}

/// Initial term ids are randomised per publication; derived, not clocked,
/// so tests are stable within a run.
fn randomised_term_id(seed: i64) -> i32 {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15u64 as i64) ^ nano_time();
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCDu64 as i64);
    x ^= x >> 33;
    x as i32
}
