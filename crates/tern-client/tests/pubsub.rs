//! End-to-end pub/sub over an in-process driver on IPC channels.
//!
//! The driver conductor and the client run on the test thread, alternated
//! the way two processes would interleave through shared memory.

use std::time::{Duration, Instant};

use tern_client::{Client, ClientContext, FragmentAssembler, BACK_PRESSURED, NOT_CONNECTED};
use tern_driver::{DriverConductor, DriverContext};

fn driver_context(dir: &std::path::Path) -> DriverContext {
    let mut ctx = DriverContext::default();
    ctx.dir = dir.to_path_buf();
    ctx.dir_delete_on_start = true;
    ctx.term_buffer_length = 64 * 1024;
    ctx.ipc_term_buffer_length = 64 * 1024;
    ctx.ipc_mtu_length = 1024;
    ctx.to_driver_buffer_length = 64 * 1024 + tern_primitives::RB_TRAILER_LENGTH;
    ctx.to_clients_buffer_length = 64 * 1024 + tern_primitives::BROADCAST_TRAILER_LENGTH;
    ctx.counter_metadata_buffer_length = 256 * tern_primitives::counters::METADATA_LENGTH;
    ctx.counter_values_buffer_length = 256 * tern_primitives::counters::VALUE_LENGTH;
    ctx.error_log_buffer_length = 64 * 1024;
    ctx.timer_interval_ns = 1_000_000;
    ctx
}

/// Pump both sides until `condition` holds or the deadline passes.
fn pump_until(
    driver: &mut DriverConductor,
    client: &mut Client,
    mut condition: impl FnMut(&mut Client) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        driver.do_work();
        client.do_work();
        if condition(client) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn ipc_publish_subscribe_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = DriverConductor::launch(driver_context(dir.path())).unwrap();
    let mut client = Client::connect(ClientContext::with_dir(dir.path())).unwrap();

    let sub_reg = client.async_add_subscription("aeron:ipc", 1001).unwrap();
    let pub_reg = client.async_add_publication("aeron:ipc", 1001).unwrap();

    let mut subscription = None;
    pump_until(&mut driver, &mut client, |c| {
        if subscription.is_none() {
            subscription = c.find_subscription(sub_reg).unwrap();
        }
        subscription.is_some()
    });
    let subscription = subscription.unwrap();

    let mut publication = None;
    pump_until(&mut driver, &mut client, |c| {
        if publication.is_none() {
            publication = c.find_publication(pub_reg).unwrap();
        }
        publication.is_some()
    });
    let publication = publication.unwrap();

    // The subscription joined before the publication existed, so the
    // image arrives with the publication.
    pump_until(&mut driver, &mut client, |_| subscription.image_count() == 1);
    assert!(publication.is_connected());

    // Offer until flow control opens the window.
    let message = b"hello from the producer side";
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        driver.do_work();
        client.do_work();
        let position = publication.offer(message);
        if position > 0 {
            break;
        }
        assert!(
            position == BACK_PRESSURED || position == NOT_CONNECTED,
            "unexpected offer result: {position}"
        );
        assert!(Instant::now() < deadline, "offer never succeeded");
    }

    let mut received = Vec::new();
    pump_until(&mut driver, &mut client, |_| {
        let mut handler = |payload: &[u8], _header: &tern_logbuffer::Header| {
            received.push(payload.to_vec());
        };
        subscription.poll(&mut handler, 16);
        !received.is_empty()
    });

    assert_eq!(received, vec![message.to_vec()]);
}

#[test]
fn positions_increase_by_aligned_frame_lengths() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = DriverConductor::launch(driver_context(dir.path())).unwrap();
    let mut client = Client::connect(ClientContext::with_dir(dir.path())).unwrap();

    let sub_reg = client.async_add_subscription("aeron:ipc", 7).unwrap();
    let pub_reg = client.async_add_publication("aeron:ipc", 7).unwrap();

    let mut publication = None;
    pump_until(&mut driver, &mut client, |c| {
        c.find_subscription(sub_reg).unwrap();
        if publication.is_none() {
            publication = c.find_publication(pub_reg).unwrap();
        }
        publication.is_some()
    });
    let publication = publication.unwrap();

    pump_until(&mut driver, &mut client, |_| publication.position_limit() > 0);

    // 20 byte payload -> 52 byte frame -> aligned 64.
    let mut last = publication.position();
    for _ in 0..10 {
        let position = publication.offer(&[0u8; 20]);
        assert!(position > 0);
        assert_eq!(position - last, 64, "positions advance by the aligned frame length");
        last = position;
    }
}

#[test]
fn fragmented_message_reassembles_via_assembler() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = DriverConductor::launch(driver_context(dir.path())).unwrap();
    let mut client = Client::connect(ClientContext::with_dir(dir.path())).unwrap();

    let sub_reg = client.async_add_subscription("aeron:ipc", 42).unwrap();
    let pub_reg = client.async_add_publication("aeron:ipc", 42).unwrap();

    let mut subscription = None;
    let mut publication = None;
    pump_until(&mut driver, &mut client, |c| {
        if subscription.is_none() {
            subscription = c.find_subscription(sub_reg).unwrap();
        }
        if publication.is_none() {
            publication = c.find_publication(pub_reg).unwrap();
        }
        subscription.is_some() && publication.is_some()
    });
    let subscription = subscription.unwrap();
    let publication = publication.unwrap();

    pump_until(&mut driver, &mut client, |_| publication.position_limit() > 0);

    // Two MTUs of payload forces BEGIN..END fragmentation.
    let message: Vec<u8> = (0..2 * publication.max_payload_length() + 100)
        .map(|i| (i % 253) as u8)
        .collect();
    assert!(message.len() > publication.max_payload_length());
    assert!(message.len() <= publication.max_message_length());

    let deadline = Instant::now() + Duration::from_secs(5);
    while publication.offer(&message) <= 0 {
        driver.do_work();
        client.do_work();
        assert!(Instant::now() < deadline, "offer never succeeded");
    }

    let mut assembled: Vec<Vec<u8>> = Vec::new();
    let mut assembler = FragmentAssembler::new();
    pump_until(&mut driver, &mut client, |_| {
        let mut delegate = |payload: &[u8], _header: &tern_logbuffer::Header| {
            assembled.push(payload.to_vec());
        };
        let mut handler = assembler.handler(&mut delegate);
        subscription.poll(&mut handler, 16);
        drop(handler);
        !assembled.is_empty()
    });

    assert_eq!(assembled.len(), 1);
    assert_eq!(assembled[0], message);
}

#[test]
fn shared_publication_offers_interleave_without_loss() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = DriverConductor::launch(driver_context(dir.path())).unwrap();
    let mut client = Client::connect(ClientContext::with_dir(dir.path())).unwrap();

    let sub_reg = client.async_add_subscription("aeron:ipc", 5).unwrap();
    let pub_a_reg = client.async_add_publication("aeron:ipc", 5).unwrap();
    let pub_b_reg = client.async_add_publication("aeron:ipc", 5).unwrap();

    let mut subscription = None;
    let mut pub_a = None;
    let mut pub_b = None;
    pump_until(&mut driver, &mut client, |c| {
        if subscription.is_none() {
            subscription = c.find_subscription(sub_reg).unwrap();
        }
        if pub_a.is_none() {
            pub_a = c.find_publication(pub_a_reg).unwrap();
        }
        if pub_b.is_none() {
            pub_b = c.find_publication(pub_b_reg).unwrap();
        }
        subscription.is_some() && pub_a.is_some() && pub_b.is_some()
    });
    let subscription = subscription.unwrap();
    let pub_a = pub_a.unwrap();
    let pub_b = pub_b.unwrap();

    // Shared handles: same session, same underlying log.
    assert_eq!(pub_a.session_id(), pub_b.session_id());
    assert_eq!(pub_a.original_registration_id(), pub_b.original_registration_id());

    pump_until(&mut driver, &mut client, |_| pub_a.position_limit() > 0);

    for i in 0..20u32 {
        let bytes = i.to_le_bytes();
        let publication = if i % 2 == 0 { &pub_a } else { &pub_b };
        assert!(publication.offer(&bytes) > 0);
    }

    let mut received = Vec::new();
    pump_until(&mut driver, &mut client, |_| {
        let mut handler = |payload: &[u8], _header: &tern_logbuffer::Header| {
            received.push(u32::from_le_bytes(payload.try_into().unwrap()));
        };
        subscription.poll(&mut handler, 64);
        received.len() == 20
    });

    // One session: everything arrives, in offer order.
    assert_eq!(received, (0..20).collect::<Vec<_>>());
}

#[test]
fn connect_fails_without_driver() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Client::connect(ClientContext::with_dir(dir.path())).is_err());
}
