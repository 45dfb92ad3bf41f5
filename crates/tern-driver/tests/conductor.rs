//! Control-plane scenarios driven through the shared-memory protocol, the
//! way a real client process would: commands into the ring, responses out
//! of the broadcast.

use std::path::Path;
use std::time::Duration;

use tern_driver::{DriverConductor, DriverContext};
use tern_logbuffer::frame::{BEGIN_FRAG_FLAG, END_FRAG_FLAG};
use tern_logbuffer::{read_term, MappedRawLog, TermAppender};
use tern_primitives::{BroadcastReceiver, RingBuffer};
use tern_protocol::cnc::CncFile;
use tern_protocol::command::{
    type_id as cmd, CorrelatedCommand, CounterCommand, DestinationCommand, PublicationCommand,
    RemoveCommand, SubscriptionCommand, TerminateDriverCommand,
};
use tern_protocol::response::{
    type_id as rsp, CounterUpdate, ErrorResponse, ImageMessage, ImageReady, OperationSucceeded,
    PublicationReady,
};

fn test_context(dir: &Path) -> DriverContext {
    let mut ctx = DriverContext::default();
    ctx.dir = dir.to_path_buf();
    ctx.dir_delete_on_start = true;
    ctx.term_buffer_length = 64 * 1024;
    ctx.ipc_term_buffer_length = 64 * 1024;
    ctx.mtu_length = 1408;
    ctx.ipc_mtu_length = 1024;
    ctx.to_driver_buffer_length = 64 * 1024 + tern_primitives::RB_TRAILER_LENGTH;
    ctx.to_clients_buffer_length = 64 * 1024 + tern_primitives::BROADCAST_TRAILER_LENGTH;
    ctx.counter_metadata_buffer_length = 256 * tern_primitives::counters::METADATA_LENGTH;
    ctx.counter_values_buffer_length = 256 * tern_primitives::counters::VALUE_LENGTH;
    ctx.error_log_buffer_length = 64 * 1024;
    ctx.timer_interval_ns = 1_000_000;
    ctx.publication_linger_timeout_ns = 10_000_000;
    ctx
}

/// An in-process stand-in for a client: writes the same bytes into the
/// same ring a remote process would.
struct TestClient {
    #[allow(dead_code)]
    cnc: CncFile,
    ring: RingBuffer,
    rx: BroadcastReceiver,
    client_id: i64,
}

impl TestClient {
    fn connect(dir: &Path) -> TestClient {
        let cnc = CncFile::map_existing(dir).expect("cnc should map");
        let ring = RingBuffer::new(cnc.to_driver_region()).expect("ring should attach");
        let rx = BroadcastReceiver::new(cnc.to_clients_region()).expect("broadcast should attach");
        let client_id = ring.next_correlation_id();
        TestClient { cnc, ring, rx, client_id }
    }

    fn correlated(&self) -> (CorrelatedCommand, i64) {
        let correlation_id = self.ring.next_correlation_id();
        (CorrelatedCommand { client_id: self.client_id, correlation_id }, correlation_id)
    }

    fn add_publication(&mut self, channel: &str, stream_id: i32) -> i64 {
        let (correlated, correlation_id) = self.correlated();
        let command = PublicationCommand { correlated, stream_id, channel: channel.to_string() };
        self.ring.write(cmd::ADD_PUBLICATION, &command.encode()).unwrap();
        correlation_id
    }

    fn add_exclusive_publication(&mut self, channel: &str, stream_id: i32) -> i64 {
        let (correlated, correlation_id) = self.correlated();
        let command = PublicationCommand { correlated, stream_id, channel: channel.to_string() };
        self.ring.write(cmd::ADD_EXCLUSIVE_PUBLICATION, &command.encode()).unwrap();
        correlation_id
    }

    fn remove_publication(&mut self, registration_id: i64) -> i64 {
        let (correlated, correlation_id) = self.correlated();
        let command = RemoveCommand { correlated, registration_id };
        self.ring.write(cmd::REMOVE_PUBLICATION, &command.encode()).unwrap();
        correlation_id
    }

    fn add_subscription(&mut self, channel: &str, stream_id: i32) -> i64 {
        let (correlated, correlation_id) = self.correlated();
        let command = SubscriptionCommand {
            correlated,
            registration_correlation_id: -1,
            stream_id,
            channel: channel.to_string(),
        };
        self.ring.write(cmd::ADD_SUBSCRIPTION, &command.encode()).unwrap();
        correlation_id
    }

    fn add_counter(&mut self, type_id: i32, label: &str) -> i64 {
        let (correlated, correlation_id) = self.correlated();
        let command = CounterCommand {
            correlated,
            type_id,
            key: Vec::new(),
            label: label.to_string(),
        };
        self.ring.write(cmd::ADD_COUNTER, &command.encode()).unwrap();
        correlation_id
    }

    fn add_destination(&mut self, registration_id: i64, channel: &str) -> i64 {
        let (correlated, correlation_id) = self.correlated();
        let command =
            DestinationCommand { correlated, registration_id, channel: channel.to_string() };
        self.ring.write(cmd::ADD_DESTINATION, &command.encode()).unwrap();
        correlation_id
    }

    fn terminate_driver(&mut self) {
        let (correlated, _) = self.correlated();
        let command = TerminateDriverCommand { correlated, token: Vec::new() };
        self.ring.write(cmd::TERMINATE_DRIVER, &command.encode()).unwrap();
    }

    fn drain(&mut self) -> Vec<(i32, Vec<u8>)> {
        let mut responses = Vec::new();
        loop {
            match self.rx.receive(|msg_type_id, payload| responses.push((msg_type_id, payload.to_vec()))) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(loss) => panic!("test receiver lapped: {loss}"),
            }
        }
        responses
    }
}

fn duty(conductor: &mut DriverConductor, cycles: usize) {
    for _ in 0..cycles {
        conductor.do_work();
    }
    // One more after the timer interval has definitely elapsed.
    std::thread::sleep(Duration::from_millis(2));
    conductor.do_work();
}

fn find<T>(responses: &[(i32, Vec<u8>)], wanted: i32, decode: impl Fn(&[u8]) -> T) -> Vec<T> {
    responses.iter().filter(|(t, _)| *t == wanted).map(|(_, p)| decode(p)).collect()
}

#[test]
fn add_and_remove_network_publication() {
    let dir = tempfile::tempdir().unwrap();
    let mut conductor = DriverConductor::launch(test_context(dir.path())).unwrap();
    let mut client = TestClient::connect(dir.path());

    let add_id = client.add_publication("aeron:udp?endpoint=127.0.0.1:40123", 1001);
    duty(&mut conductor, 2);

    let responses = client.drain();
    let ready = find(&responses, rsp::ON_PUBLICATION_READY, |p| PublicationReady::decode(p).unwrap());
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].correlation_id, add_id);
    assert_eq!(ready[0].stream_id, 1001);
    assert!(!ready[0].log_file.is_empty());
    assert!(Path::new(&ready[0].log_file).exists());

    let remove_id = client.remove_publication(add_id);
    duty(&mut conductor, 2);

    let responses = client.drain();
    let success = find(&responses, rsp::ON_OPERATION_SUCCESS, |p| OperationSucceeded::decode(p).unwrap());
    assert_eq!(success.len(), 1);
    assert_eq!(success[0].correlation_id, remove_id);
}

#[test]
fn exclusive_session_id_collision_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut conductor = DriverConductor::launch(test_context(dir.path())).unwrap();
    let mut client = TestClient::connect(dir.path());

    let channel = "aeron:udp?endpoint=127.0.0.1:40123|session-id=7";
    let first_id = client.add_exclusive_publication(channel, 1001);
    let second_id = client.add_exclusive_publication(channel, 1001);
    duty(&mut conductor, 2);

    let responses = client.drain();
    let ready = find(&responses, rsp::ON_EXCLUSIVE_PUBLICATION_READY, |p| {
        PublicationReady::decode(p).unwrap()
    });
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].correlation_id, first_id);
    assert_eq!(ready[0].session_id, 7);

    let errors = find(&responses, rsp::ON_ERROR, |p| ErrorResponse::decode(p).unwrap());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].offending_command_correlation_id, second_id);
}

#[test]
fn client_timeout_reaps_owned_resources() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = test_context(dir.path());
    ctx.client_liveness_timeout_ns = 50_000_000; // 50ms
    let mut conductor = DriverConductor::launch(ctx).unwrap();
    let mut client = TestClient::connect(dir.path());

    let sub_id = client.add_subscription("aeron:udp?endpoint=127.0.0.1:40125", 10);
    let counter_id = client.add_counter(1001, "app-counter");
    duty(&mut conductor, 2);
    client.drain();
    assert_eq!(conductor.client_count(), 1);
    assert_eq!(conductor.subscription_count(), 1);

    // Twice the liveness timeout with no keepalive.
    std::thread::sleep(Duration::from_millis(120));
    duty(&mut conductor, 2);

    let responses = client.drain();
    assert_eq!(responses.iter().filter(|(t, _)| *t == rsp::ON_CLIENT_TIMEOUT).count(), 1);
    let unavailable =
        find(&responses, rsp::ON_UNAVAILABLE_COUNTER, |p| CounterUpdate::decode(p).unwrap());
    assert!(unavailable.iter().any(|c| c.correlation_id == counter_id));

    assert_eq!(conductor.client_count(), 0);
    assert_eq!(conductor.subscription_count(), 0);
    let _ = sub_id;
}

#[test]
fn late_keepalive_does_not_revive_client() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = test_context(dir.path());
    ctx.client_liveness_timeout_ns = 50_000_000;
    let mut conductor = DriverConductor::launch(ctx).unwrap();
    let mut client = TestClient::connect(dir.path());

    client.add_subscription("aeron:udp?endpoint=127.0.0.1:40126", 10);
    duty(&mut conductor, 2);
    assert_eq!(conductor.client_count(), 1);

    std::thread::sleep(Duration::from_millis(120));
    duty(&mut conductor, 2);
    assert_eq!(conductor.client_count(), 0);

    // The keepalive arrives after the reaper ran: it registers a fresh
    // client rather than resurrecting the dead one's resources.
    let (correlated, _) = client.correlated();
    client.ring.write(cmd::CLIENT_KEEPALIVE, &correlated.encode()).unwrap();
    duty(&mut conductor, 2);
    assert_eq!(conductor.subscription_count(), 0);
}

#[test]
fn shared_publication_refcounting() {
    let dir = tempfile::tempdir().unwrap();
    let mut conductor = DriverConductor::launch(test_context(dir.path())).unwrap();
    let mut client = TestClient::connect(dir.path());

    let channel = "aeron:udp?endpoint=127.0.0.1:40123";
    let first = client.add_publication(channel, 1001);
    for _ in 0..3 {
        client.add_publication(channel, 1001);
    }
    duty(&mut conductor, 4);

    let responses = client.drain();
    let ready = find(&responses, rsp::ON_PUBLICATION_READY, |p| PublicationReady::decode(p).unwrap());
    assert_eq!(ready.len(), 4);
    // All four share one underlying registration and session.
    assert!(ready.iter().all(|r| r.registration_id == first));
    assert!(ready.iter().all(|r| r.session_id == ready[0].session_id));

    assert_eq!(conductor.network_publication_count(), 1);
    assert_eq!(conductor.network_publication_refcount(first), Some(4));

    let remove_id = client.remove_publication(first);
    duty(&mut conductor, 2);

    let responses = client.drain();
    let success = find(&responses, rsp::ON_OPERATION_SUCCESS, |p| OperationSucceeded::decode(p).unwrap());
    assert_eq!(success.len(), 1);
    assert_eq!(success[0].correlation_id, remove_id);
    assert_eq!(conductor.network_publication_refcount(first), Some(3));
    assert!(!responses.iter().any(|(t, _)| *t == rsp::ON_UNAVAILABLE_IMAGE));
}

#[test]
fn tag_reuse_shares_one_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut conductor = DriverConductor::launch(test_context(dir.path())).unwrap();
    let mut client = TestClient::connect(dir.path());

    let first = client.add_publication("aeron:udp?endpoint=127.0.0.1:40123|tags=1001", 1);
    let second = client.add_publication("aeron:udp?tags=1001", 1);
    duty(&mut conductor, 2);

    let responses = client.drain();
    let ready = find(&responses, rsp::ON_PUBLICATION_READY, |p| PublicationReady::decode(p).unwrap());
    assert_eq!(ready.len(), 2);
    assert_eq!(conductor.send_endpoint_count(), 1);
    // Same stream over the tagged channel: one shared publication.
    assert_eq!(conductor.network_publication_count(), 1);
    assert_eq!(conductor.network_publication_refcount(first), Some(2));
    let _ = second;

    // A different stream over the same tag: second publication, still one
    // endpoint.
    client.add_publication("aeron:udp?tags=1001", 2);
    duty(&mut conductor, 2);
    client.drain();
    assert_eq!(conductor.send_endpoint_count(), 1);
    assert_eq!(conductor.network_publication_count(), 2);
}

#[test]
fn ipc_fragmentation_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut conductor = DriverConductor::launch(test_context(dir.path())).unwrap();
    let mut client = TestClient::connect(dir.path());

    client.add_subscription("aeron:ipc", 77);
    let pub_id = client.add_publication("aeron:ipc", 77);
    duty(&mut conductor, 2);

    let responses = client.drain();
    let ready = find(&responses, rsp::ON_PUBLICATION_READY, |p| PublicationReady::decode(p).unwrap());
    assert_eq!(ready.len(), 1);
    let images = find(&responses, rsp::ON_AVAILABLE_IMAGE, |p| ImageReady::decode(p).unwrap());
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].correlation_id, pub_id);
    assert_eq!(images[0].log_file, ready[0].log_file);

    // Publish a message spanning two MTUs straight into the mapped log,
    // exactly as the client-side publication would.
    let log = MappedRawLog::map_existing(Path::new(&ready[0].log_file)).unwrap();
    let metadata = log.metadata();
    let mtu = metadata.mtu_length as usize;
    let max_payload = mtu - tern_logbuffer::HEADER_LENGTH;
    let message: Vec<u8> = (0..2 * mtu).map(|i| (i % 251) as u8).collect();

    let appender = TermAppender::new(log.term(0), &metadata.term_tail_counters[0]);
    let result = appender.append_fragmented(
        &message,
        max_payload,
        None,
        ready[0].session_id,
        77,
    );
    assert!(result > 0);

    // Read the image side: BEGIN..END run, same term id, payload intact.
    let bits = 16; // log2(64 KiB)
    let mut flags = Vec::new();
    let mut term_ids = Vec::new();
    let mut assembled = Vec::new();
    read_term(log.term(0), 0, usize::MAX, bits, metadata.initial_term_id, &mut |payload, header| {
        flags.push(header.flags);
        term_ids.push(header.term_id);
        assembled.extend_from_slice(payload);
    });

    assert_eq!(flags.len(), 3); // 2*mtu of payload in max_payload fragments
    assert_eq!(flags[0] & BEGIN_FRAG_FLAG, BEGIN_FRAG_FLAG);
    assert_eq!(*flags.last().unwrap() & END_FRAG_FLAG, END_FRAG_FLAG);
    assert!(term_ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(assembled, message);
}

#[test]
fn destination_commands_require_manual_control_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut conductor = DriverConductor::launch(test_context(dir.path())).unwrap();
    let mut client = TestClient::connect(dir.path());

    let plain = client.add_publication("aeron:udp?endpoint=127.0.0.1:40123", 5);
    let manual = client.add_publication("aeron:udp?control-mode=manual", 5);
    duty(&mut conductor, 2);
    client.drain();

    let bad = client.add_destination(plain, "aeron:udp?endpoint=10.0.0.1:9999");
    let good = client.add_destination(manual, "aeron:udp?endpoint=10.0.0.1:9999");
    duty(&mut conductor, 2);

    let responses = client.drain();
    let errors = find(&responses, rsp::ON_ERROR, |p| ErrorResponse::decode(p).unwrap());
    assert!(errors.iter().any(|e| e.offending_command_correlation_id == bad));
    let success = find(&responses, rsp::ON_OPERATION_SUCCESS, |p| OperationSucceeded::decode(p).unwrap());
    assert!(success.iter().any(|s| s.correlation_id == good));
}

#[test]
fn unknown_registration_ids_produce_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut conductor = DriverConductor::launch(test_context(dir.path())).unwrap();
    let mut client = TestClient::connect(dir.path());

    let remove_id = client.remove_publication(987654);
    duty(&mut conductor, 2);

    let responses = client.drain();
    let errors = find(&responses, rsp::ON_ERROR, |p| ErrorResponse::decode(p).unwrap());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].offending_command_correlation_id, remove_id);
}

#[test]
fn invalid_uri_produces_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut conductor = DriverConductor::launch(test_context(dir.path())).unwrap();
    let mut client = TestClient::connect(dir.path());

    let add_id = client.add_publication("aeron:udp?mtu=8k", 1); // nothing distinguishing
    duty(&mut conductor, 2);

    let responses = client.drain();
    let errors = find(&responses, rsp::ON_ERROR, |p| ErrorResponse::decode(p).unwrap());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].offending_command_correlation_id, add_id);
}

#[test]
fn image_lifecycle_from_receiver_event() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = test_context(dir.path());
    ctx.image_liveness_timeout_ns = 30_000_000; // 30ms
    let mut conductor = DriverConductor::launch(ctx).unwrap();
    let mut client = TestClient::connect(dir.path());

    let sub_id = client.add_subscription("aeron:udp?endpoint=127.0.0.1:40321", 9);
    duty(&mut conductor, 2);
    client.drain();
    assert_eq!(conductor.receive_endpoint_count(), 1);

    // The receiver observed a new session on the endpoint.
    let proxy = conductor.proxy();
    let endpoint_id = conductor.receive_endpoint_registration_ids()[0];
    proxy.on_create_publication_image(
        endpoint_id,
        555,
        9,
        100,
        100,
        0,
        64 * 1024,
        1408,
        "127.0.0.1:54321",
    );
    duty(&mut conductor, 2);

    let responses = client.drain();
    let images = find(&responses, rsp::ON_AVAILABLE_IMAGE, |p| ImageReady::decode(p).unwrap());
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].session_id, 555);
    assert_eq!(images[0].subscriber_registration_id, sub_id);
    assert_eq!(images[0].source_identity, "127.0.0.1:54321");
    assert_eq!(conductor.image_count(), 1);

    // No activity: the image goes inactive, lingers, and is reaped.
    std::thread::sleep(Duration::from_millis(120));
    duty(&mut conductor, 4);
    std::thread::sleep(Duration::from_millis(60));
    duty(&mut conductor, 4);

    let responses = client.drain();
    let unavailable = find(&responses, rsp::ON_UNAVAILABLE_IMAGE, |p| ImageMessage::decode(p).unwrap());
    assert_eq!(unavailable.len(), 1);
    assert_eq!(unavailable[0].subscription_registration_id, sub_id);
    assert_eq!(conductor.image_count(), 0);
}

#[test]
fn terminate_driver_flips_flag() {
    let dir = tempfile::tempdir().unwrap();
    let mut conductor = DriverConductor::launch(test_context(dir.path())).unwrap();
    let mut client = TestClient::connect(dir.path());

    assert!(!conductor.is_terminating());
    client.terminate_driver();
    duty(&mut conductor, 2);
    assert!(conductor.is_terminating());
}
