//! The client instance.
//!
//! `Client::connect` maps the driver's CnC file, validates its version,
//! and allocates a client id. Registration is asynchronous by correlation
//! id, as the control protocol is: `async_add_*` enqueues the command and
//! returns the registration id, `find_*` polls for the resolved resource.
//!
//! The client is single-threaded: resources it returns share state with
//! its conductor and are polled from the owning thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tern_logbuffer::{LogError, MappedRawLog};
use tern_primitives::broadcast::BroadcastError;
use tern_primitives::counters::CountersError;
use tern_primitives::rb::{RingBufferError, RingWriteError};
use tern_primitives::{nano_time, BroadcastReceiver, CountersReader, RingBuffer};
use tern_protocol::cnc::{CncError, CncFile};
use tern_protocol::command::{
    type_id as cmd, CorrelatedCommand, CounterCommand, PublicationCommand, RemoveCommand,
    SubscriptionCommand,
};
use tern_protocol::response::ErrorCode;

use crate::conductor::{ClientConductor, Registration};
use crate::publication::{ExclusivePublication, Publication};
use crate::subscription::{Subscription, SubscriptionState};

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Driver directory holding the CnC file.
    pub dir: PathBuf,
    /// How often a keepalive is sent while the client does work.
    pub keepalive_interval_ns: i64,
}

impl Default for ClientContext {
    fn default() -> Self {
        Self {
            dir: crate::default_driver_dir(),
            keepalive_interval_ns: 500_000_000,
        }
    }
}

impl ClientContext {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), ..Self::default() }
    }
}

#[derive(Debug)]
pub enum ClientError {
    Cnc(CncError),
    Ring(RingBufferError),
    Broadcast(BroadcastError),
    Counters(CountersError),
    /// The command ring rejected the write (full or oversized).
    CommandRejected(RingWriteError),
    /// The driver answered with ON_ERROR.
    Driver { code: ErrorCode, message: String },
    /// A log buffer named in a response could not be mapped.
    Log(LogError),
    /// The registration id is not one this client issued.
    UnknownRegistration(i64),
    /// The registration resolved to a different resource type.
    WrongResourceType(i64),
    /// The driver timed this client out.
    ClientTimedOut,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cnc(e) => write!(f, "cnc: {e}"),
            Self::Ring(e) => write!(f, "command ring: {e}"),
            Self::Broadcast(e) => write!(f, "broadcast: {e}"),
            Self::Counters(e) => write!(f, "counters: {e}"),
            Self::CommandRejected(e) => write!(f, "command rejected: {e}"),
            Self::Driver { code, message } => write!(f, "driver error ({code}): {message}"),
            Self::Log(e) => write!(f, "log buffer: {e}"),
            Self::UnknownRegistration(id) => write!(f, "unknown registration id: {id}"),
            Self::WrongResourceType(id) => write!(f, "registration {id} is a different resource type"),
            Self::ClientTimedOut => write!(f, "client timed out by driver"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<CncError> for ClientError {
    fn from(e: CncError) -> Self {
        Self::Cnc(e)
    }
}
impl From<RingWriteError> for ClientError {
    fn from(e: RingWriteError) -> Self {
        Self::CommandRejected(e)
    }
}
impl From<LogError> for ClientError {
    fn from(e: LogError) -> Self {
        Self::Log(e)
    }
}

/// A user-allocated counter.
pub struct Counter {
    pub registration_id: i64,
    pub counter_id: i32,
    counters: Rc<CountersReader>,
}

impl Counter {
    pub fn value(&self) -> i64 {
        self.counters.counter_value(self.counter_id)
    }

    pub fn set_ordered(&self, value: i64) {
        self.counters
            .counter_addr(self.counter_id)
            .store(value, std::sync::atomic::Ordering::Release);
    }
}

pub struct Client {
    #[allow(dead_code)]
    cnc: CncFile,
    ring: RingBuffer,
    conductor: ClientConductor,
    counters: Rc<CountersReader>,
    /// Channel strings by registration id, until the registration resolves.
    pending_channels: HashMap<i64, String>,
    client_id: i64,
    keepalive_interval_ns: i64,
    last_keepalive_ns: i64,
    is_closed: bool,
}

impl Client {
    /// Attach to a running driver.
    pub fn connect(ctx: ClientContext) -> Result<Client, ClientError> {
        let cnc = CncFile::map_existing(&ctx.dir)?;

        let ring = RingBuffer::new(cnc.to_driver_region()).map_err(ClientError::Ring)?;
        let rx = BroadcastReceiver::new(cnc.to_clients_region()).map_err(ClientError::Broadcast)?;
        let counters = Rc::new(
            CountersReader::new(cnc.counter_metadata_region(), cnc.counter_values_region())
                .map_err(ClientError::Counters)?,
        );

        let client_id = ring.next_correlation_id();
        let conductor = ClientConductor::new(rx, counters.clone(), client_id);

        info!("client {} connected to {:?}", client_id, ctx.dir);

        Ok(Client {
            cnc,
            ring,
            conductor,
            counters,
            pending_channels: HashMap::new(),
            client_id,
            keepalive_interval_ns: ctx.keepalive_interval_ns,
            last_keepalive_ns: nano_time(),
            is_closed: false,
        })
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn counters_reader(&self) -> &CountersReader {
        &self.counters
    }

    /// Process responses and keep the client alive. Call regularly from
    /// the owning thread.
    pub fn do_work(&mut self) -> usize {
        let mut work_count = self.conductor.process();

        let now_ns = nano_time();
        if now_ns - self.last_keepalive_ns > self.keepalive_interval_ns {
            self.last_keepalive_ns = now_ns;
            let correlated = CorrelatedCommand {
                client_id: self.client_id,
                correlation_id: self.ring.next_correlation_id(),
            };
            if self.ring.write(cmd::CLIENT_KEEPALIVE, &correlated.encode()).is_ok() {
                work_count += 1;
            }
        }

        work_count
    }

    fn command_prefix(&self) -> (CorrelatedCommand, i64) {
        let correlation_id = self.ring.next_correlation_id();
        (CorrelatedCommand { client_id: self.client_id, correlation_id }, correlation_id)
    }

    fn check_liveness(&self) -> Result<(), ClientError> {
        if self.conductor.timed_out {
            return Err(ClientError::ClientTimedOut);
        }
        Ok(())
    }

    /// Enqueue an ADD_PUBLICATION; resolve with
    /// [`Client::find_publication`].
    pub fn async_add_publication(&mut self, channel: &str, stream_id: i32) -> Result<i64, ClientError> {
        let (correlated, correlation_id) = self.command_prefix();
        let command = PublicationCommand { correlated, stream_id, channel: channel.to_string() };
        self.ring.write(cmd::ADD_PUBLICATION, &command.encode())?;
        self.pending_channels.insert(correlation_id, channel.to_string());
        Ok(correlation_id)
    }

    pub fn async_add_exclusive_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<i64, ClientError> {
        let (correlated, correlation_id) = self.command_prefix();
        let command = PublicationCommand { correlated, stream_id, channel: channel.to_string() };
        self.ring.write(cmd::ADD_EXCLUSIVE_PUBLICATION, &command.encode())?;
        self.pending_channels.insert(correlation_id, channel.to_string());
        Ok(correlation_id)
    }

    /// Poll a pending publication registration. `Ok(None)` until the
    /// driver answers.
    pub fn find_publication(&mut self, registration_id: i64) -> Result<Option<Publication>, ClientError> {
        self.do_work();
        self.check_liveness()?;

        match self.conductor.pending.get(&registration_id) {
            None => Ok(None),
            Some(Registration::Error { .. }) => Err(self.take_error(registration_id)),
            Some(Registration::Publication(_)) => {
                let Some(Registration::Publication(ready)) =
                    self.conductor.pending.remove(&registration_id)
                else {
                    unreachable!()
                };
                let log = MappedRawLog::map_existing(Path::new(&ready.log_file))?;
                let channel = self.pending_channels.remove(&registration_id).unwrap_or_default();
                Ok(Some(Publication {
                    registration_id,
                    original_registration_id: ready.registration_id,
                    channel,
                    stream_id: ready.stream_id,
                    session_id: ready.session_id,
                    log,
                    counters: self.counters.clone(),
                    position_limit_counter_id: ready.position_limit_counter_id,
                    is_closed: false,
                }))
            }
            Some(_) => Err(ClientError::WrongResourceType(registration_id)),
        }
    }

    pub fn find_exclusive_publication(
        &mut self,
        registration_id: i64,
    ) -> Result<Option<ExclusivePublication>, ClientError> {
        self.do_work();
        self.check_liveness()?;

        match self.conductor.pending.get(&registration_id) {
            None => Ok(None),
            Some(Registration::Error { .. }) => Err(self.take_error(registration_id)),
            Some(Registration::ExclusivePublication(_)) => {
                let Some(Registration::ExclusivePublication(ready)) =
                    self.conductor.pending.remove(&registration_id)
                else {
                    unreachable!()
                };
                let log = MappedRawLog::map_existing(Path::new(&ready.log_file))?;
                let channel = self.pending_channels.remove(&registration_id).unwrap_or_default();
                Ok(Some(ExclusivePublication::new(
                    registration_id,
                    channel,
                    ready.stream_id,
                    ready.session_id,
                    log,
                    self.counters.clone(),
                    ready.position_limit_counter_id,
                )))
            }
            Some(_) => Err(ClientError::WrongResourceType(registration_id)),
        }
    }

    /// Enqueue an ADD_SUBSCRIPTION; images arrive as the driver matches
    /// producer sessions, even before `find_subscription` resolves.
    pub fn async_add_subscription(&mut self, channel: &str, stream_id: i32) -> Result<i64, ClientError> {
        let (correlated, correlation_id) = self.command_prefix();
        let command = SubscriptionCommand {
            correlated,
            registration_correlation_id: -1,
            stream_id,
            channel: channel.to_string(),
        };
        self.ring.write(cmd::ADD_SUBSCRIPTION, &command.encode())?;

        let state = Rc::new(RefCell::new(SubscriptionState {
            registration_id: correlation_id,
            channel: channel.to_string(),
            stream_id,
            channel_status_indicator_id: -1,
            images: Vec::new(),
            round_robin_index: 0,
            is_closed: false,
        }));
        self.conductor.subscriptions.insert(correlation_id, state);

        Ok(correlation_id)
    }

    pub fn find_subscription(&mut self, registration_id: i64) -> Result<Option<Subscription>, ClientError> {
        self.do_work();
        self.check_liveness()?;

        match self.conductor.pending.get(&registration_id) {
            None => Ok(None),
            Some(Registration::Error { .. }) => Err(self.take_error(registration_id)),
            Some(Registration::Subscription { .. }) => {
                self.conductor.pending.remove(&registration_id);
                let state = self
                    .conductor
                    .subscriptions
                    .get(&registration_id)
                    .cloned()
                    .ok_or(ClientError::UnknownRegistration(registration_id))?;
                Ok(Some(Subscription { state }))
            }
            Some(_) => Err(ClientError::WrongResourceType(registration_id)),
        }
    }

    pub fn async_add_counter(
        &mut self,
        type_id: i32,
        key: &[u8],
        label: &str,
    ) -> Result<i64, ClientError> {
        let (correlated, correlation_id) = self.command_prefix();
        let command = CounterCommand {
            correlated,
            type_id,
            key: key.to_vec(),
            label: label.to_string(),
        };
        self.ring.write(cmd::ADD_COUNTER, &command.encode())?;
        Ok(correlation_id)
    }

    pub fn find_counter(&mut self, registration_id: i64) -> Result<Option<Counter>, ClientError> {
        self.do_work();
        self.check_liveness()?;

        match self.conductor.pending.get(&registration_id) {
            None => Ok(None),
            Some(Registration::Error { .. }) => Err(self.take_error(registration_id)),
            Some(Registration::Counter { counter_id }) => {
                let counter_id = *counter_id;
                self.conductor.pending.remove(&registration_id);
                Ok(Some(Counter {
                    registration_id,
                    counter_id,
                    counters: self.counters.clone(),
                }))
            }
            Some(_) => Err(ClientError::WrongResourceType(registration_id)),
        }
    }

    /// Release a publication; the driver lingers the log for any late
    /// consumers before freeing it.
    pub fn close_publication(&mut self, publication: &mut Publication) -> Result<i64, ClientError> {
        publication.close();
        self.send_remove(cmd::REMOVE_PUBLICATION, publication.registration_id())
    }

    pub fn close_exclusive_publication(
        &mut self,
        publication: &mut ExclusivePublication,
    ) -> Result<i64, ClientError> {
        publication.close();
        self.send_remove(cmd::REMOVE_PUBLICATION, publication.registration_id())
    }

    pub fn close_subscription(&mut self, subscription: &Subscription) -> Result<i64, ClientError> {
        let registration_id = subscription.registration_id();
        subscription.state.borrow_mut().is_closed = true;
        self.conductor.subscriptions.remove(&registration_id);
        self.send_remove(cmd::REMOVE_SUBSCRIPTION, registration_id)
    }

    pub fn remove_counter(&mut self, counter: &Counter) -> Result<i64, ClientError> {
        self.send_remove(cmd::REMOVE_COUNTER, counter.registration_id)
    }

    /// Poll whether a remove command has been acknowledged.
    pub fn find_operation_succeeded(&mut self, correlation_id: i64) -> Result<bool, ClientError> {
        self.do_work();
        match self.conductor.pending.get(&correlation_id) {
            None => Ok(false),
            Some(Registration::Error { .. }) => Err(self.take_error(correlation_id)),
            Some(Registration::OperationSucceeded) => {
                self.conductor.pending.remove(&correlation_id);
                Ok(true)
            }
            Some(_) => Err(ClientError::WrongResourceType(correlation_id)),
        }
    }

    fn send_remove(&mut self, msg_type_id: i32, registration_id: i64) -> Result<i64, ClientError> {
        let (correlated, correlation_id) = self.command_prefix();
        let command = RemoveCommand { correlated, registration_id };
        self.ring.write(msg_type_id, &command.encode())?;
        Ok(correlation_id)
    }

    fn take_error(&mut self, registration_id: i64) -> ClientError {
        match self.conductor.pending.remove(&registration_id) {
            Some(Registration::Error { code, message }) => ClientError::Driver { code, message },
            _ => ClientError::UnknownRegistration(registration_id),
        }
    }

    /// Tell the driver this client is going away; its resources are then
    /// reaped on the driver side without a timeout broadcast.
    pub fn close(&mut self) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;

        let (correlated, _) = self.command_prefix();
        let _ = self.ring.write(cmd::CLIENT_CLOSE, &correlated.encode());
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
