//! Integration tests for the device link
//!
//! These tests drive a [`Link`] end to end:
//! - Listener reference counting under concurrent registration
//! - Command/reply correlation and close semantics
//! - Boot wait against a simulated device
//! - Stream connections over in-memory duplex pipes
//! - Codec totality for the built-in protocols

use pinlink_core::protocol::{strip_delimiter, BINARY_PROTOCOL_NAME, TEXT_PROTOCOL_NAME};
use pinlink_core::scanner::FrameBuffer;
use pinlink_core::test_utils::{DeviceSimulator, MockConnection};
use pinlink_core::{
    BinaryProtocol, Command, ConnectionState, DeviceMessage, Framing, KeyPress, Link, LinkConfig,
    LinkError, Pin, PinEvent, PinValue, Protocol, ProtocolRegistry, ReadyMode, StreamConnection,
    TextProtocol, Tone,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("pinlink_core=debug")
        .try_init();
}

fn text_link() -> (Arc<MockConnection>, Arc<Link>) {
    let connection = Arc::new(MockConnection::new());
    let link = Link::new(connection.clone(), Arc::new(TextProtocol::new()));
    (connection, Arc::new(link))
}

/// Protocol that reports every frame as an analog pin with a digital value
struct MismatchedProtocol;

impl Protocol for MismatchedProtocol {
    fn name(&self) -> &str {
        "mismatched"
    }

    fn framing(&self) -> Framing {
        Framing::newline()
    }

    fn encode(&self, command: &Command, id: Option<u64>) -> pinlink_core::Result<Vec<u8>> {
        TextProtocol::new().encode(command, id)
    }

    fn decode(&self, frame: &[u8]) -> pinlink_core::Result<DeviceMessage> {
        if frame == b"good" {
            return Ok(DeviceMessage::PinStateChanged {
                pin: Pin::analog(1),
                value: PinValue::Analog(10),
            });
        }
        Ok(DeviceMessage::PinStateChanged {
            pin: Pin::analog(1),
            value: PinValue::Digital(true),
        })
    }

    fn encode_message(&self, message: &DeviceMessage) -> pinlink_core::Result<Vec<u8>> {
        TextProtocol::new().encode_message(message)
    }

    fn decode_command(&self, frame: &[u8]) -> pinlink_core::Result<(Command, Option<u64>)> {
        TextProtocol::new().decode_command(frame)
    }
}

// ============================================================================
// Listener Reference Counting
// ============================================================================

#[tokio::test]
async fn test_many_filtered_listeners_one_start_one_stop() {
    init_tracing();
    let (connection, link) = text_link();
    let pin = Pin::digital(7);

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(link.add_event_listener(Some(pin), |_| Ok(())).await.unwrap());
    }
    assert_eq!(connection.count_written("srld/7"), 1);

    let last = ids.pop().unwrap();
    for id in ids {
        link.remove_listener(id).await.unwrap();
    }
    assert_eq!(connection.count_written("spld/7"), 0);

    link.remove_listener(last).await.unwrap();
    assert_eq!(connection.count_written("spld/7"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_sends_single_start() {
    let (connection, link) = text_link();
    let pin = Pin::analog(4);

    let adds = (0..16).map(|_| {
        let link = link.clone();
        tokio::spawn(async move { link.add_event_listener(Some(pin), |_| Ok(())).await })
    });
    let ids: Vec<_> = futures::future::join_all(adds)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert_eq!(connection.count_written("srla/4"), 1);

    let removes = ids.into_iter().map(|id| {
        let link = link.clone();
        tokio::spawn(async move { link.remove_listener(id).await })
    });
    for removed in futures::future::join_all(removes).await {
        assert!(removed.unwrap().unwrap());
    }
    assert_eq!(connection.count_written("spla/4"), 1);
    assert!(link.listening_pins().await.is_empty());
}

#[tokio::test]
async fn test_unfiltered_listener_sends_nothing() {
    let (connection, link) = text_link();
    let id = link.add_event_listener(None, |_| Ok(())).await.unwrap();
    link.remove_listener(id).await.unwrap();
    assert!(connection.written().is_empty());
}

// ============================================================================
// Correlation
// ============================================================================

#[tokio::test]
async fn test_each_reply_invokes_one_callback_once() {
    let (connection, link) = text_link();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for pin in 0..3 {
        let calls = calls.clone();
        let id = link
            .send_with_reply(Command::StartListening(Pin::analog(pin)), move |reply| {
                calls.lock().push(reply.id);
            })
            .await
            .unwrap();
        ids.push(id);
    }
    assert_eq!(ids, vec![1, 2, 3]);

    connection.inject(b"alp://rply/ok?id=2");
    connection.inject(b"alp://rply/ok?id=2");
    connection.inject(b"alp://rply/ko?id=1");
    connection.inject(b"alp://rply/ok?id=17");

    assert_eq!(*calls.lock(), vec![2, 1]);
    assert_eq!(link.pending_replies(), 1);
}

#[tokio::test]
async fn test_fast_reply_during_write_is_correlated() {
    let (connection, link) = text_link();
    connection.set_responder(DeviceSimulator::text());

    let replies = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let replies = replies.clone();
        link.send_with_reply(Command::NoTone(Pin::analog(0)), move |reply| {
            assert!(reply.ok);
            replies.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    }
    assert_eq!(replies.load(Ordering::SeqCst), 10);
    assert_eq!(link.pending_replies(), 0);
}

#[tokio::test]
async fn test_panicking_reply_callback_does_not_starve_reply_listeners() {
    init_tracing();
    let (connection, link) = text_link();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    link.add_reply_listener(move |_reply| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let id = link
        .send_with_reply(Command::NoTone(Pin::analog(0)), |_| panic!("callback bug"))
        .await
        .unwrap();
    assert_eq!(id, 1);
    connection.inject(b"alp://rply/ok?id=1");

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(link.pending_replies(), 0);

    // dispatch keeps working for later frames
    connection.inject(b"alp://rply/ko?id=7");
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_command_reply() {
    let (connection, link) = text_link();
    connection.set_responder(
        DeviceSimulator::new(Arc::new(TextProtocol::new()))
            .rejecting()
            .into_responder(),
    );

    let reply = link
        .request(Command::Custom(vec!["reset".to_string()]))
        .await
        .unwrap()
        .await
        .unwrap();
    assert!(!reply.ok);
}

#[tokio::test]
async fn test_failed_send_leaves_nothing_pending() {
    let (connection, link) = text_link();
    connection.fail_writes(true);

    let result = link
        .send_with_reply(Command::NoTone(Pin::analog(0)), |_| {
            panic!("never called");
        })
        .await;
    assert!(matches!(result, Err(LinkError::WriteError(_))));
    assert_eq!(link.pending_replies(), 0);
}

#[tokio::test]
async fn test_binary_protocol_rejects_replies() {
    let connection = Arc::new(MockConnection::new());
    let link = Link::new(connection.clone(), Arc::new(BinaryProtocol::new()));

    let result = link
        .request(Command::SwitchAnalog {
            pin: Pin::analog(3),
            value: 200,
        })
        .await;
    assert!(matches!(result, Err(LinkError::ReplyNotSupported(_))));

    link.switch_analog_pin(Pin::analog(3), 200).await.unwrap();
    assert_eq!(connection.written(), vec![vec![11, 3, 200]]);
    assert!(matches!(
        link.send_no_tone(Pin::analog(1)).await,
        Err(LinkError::UnsupportedCommand { .. })
    ));
}

// ============================================================================
// Close
// ============================================================================

#[tokio::test]
async fn test_close_abandons_pending_replies() {
    let (connection, link) = text_link();
    let called = Arc::new(AtomicUsize::new(0));

    let counter = called.clone();
    let id = link
        .send_with_reply(Command::NoTone(Pin::analog(0)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    let receiver = link
        .request(Command::StartListening(Pin::digital(1)))
        .await
        .unwrap();
    assert_eq!(link.pending_replies(), 2);

    link.close().await.unwrap();
    assert_eq!(link.pending_replies(), 0);
    assert!(receiver.await.is_err());

    connection.inject(format!("alp://rply/ok?id={}", id).as_bytes());
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_close_with_failing_transport_still_closes() {
    let (connection, link) = text_link();
    link.add_event_listener(Some(Pin::analog(0)), |_| Ok(()))
        .await
        .unwrap();
    connection.fail_writes(true);

    link.close().await.unwrap();
    assert!(link.is_closed());
    assert_eq!(connection.close_calls(), 1);
    assert!(matches!(
        link.add_event_listener(None, |_| Ok(())).await,
        Err(LinkError::Closed)
    ));
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_decode_errors_do_not_break_the_stream() {
    init_tracing();
    let (connection, link) = text_link();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    link.add_event_listener(None, move |event: &PinEvent| {
        sink.lock().push(*event);
        Ok(())
    })
    .await
    .unwrap();

    connection.inject(b"alp://ared/1/100");
    connection.inject(b"alp://bogus/1/1");
    connection.inject(b"\xff\xfe\xfd");
    connection.inject(b"alp://rply/ok");
    connection.inject(b"alp://ared/1/101");

    let values: Vec<_> = events.lock().iter().map(|e| e.value).collect();
    assert_eq!(values, vec![PinValue::Analog(100), PinValue::Analog(101)]);
}

#[tokio::test]
async fn test_pin_kind_mismatch_is_dropped() {
    let connection = Arc::new(MockConnection::new());
    let link = Link::new(connection.clone(), Arc::new(MismatchedProtocol));
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    link.add_event_listener(None, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .await
    .unwrap();

    connection.inject(b"bad");
    connection.inject(b"good");
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_registry_resolves_custom_protocol() {
    ProtocolRegistry::global().register(Arc::new(MismatchedProtocol));
    let connection = Arc::new(MockConnection::new());

    let link = Link::from_config(connection, LinkConfig::with_protocol("mismatched")).unwrap();
    assert_eq!(link.protocol().name(), "mismatched");

    let names = ProtocolRegistry::global().names();
    assert!(names.contains(&TEXT_PROTOCOL_NAME.to_string()));
    assert!(names.contains(&BINARY_PROTOCOL_NAME.to_string()));
}

// ============================================================================
// Boot Wait
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_wait_for_ready_with_late_device() {
    let (connection, link) = text_link();

    let waiting = link.clone();
    let handle = tokio::spawn(async move {
        waiting
            .wait_for_ready(Duration::from_secs(3), ReadyMode::ReadyOnly)
            .await
    });

    tokio::time::sleep(Duration::from_millis(2100)).await;
    connection.inject(b"alp://ready/");
    assert!(handle.await.unwrap());
    assert!(connection.count_written("notn/0") >= 4);
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_ready_uses_config() {
    let connection = Arc::new(MockConnection::new());
    let config: LinkConfig = serde_json::from_str(
        r#"{"protocol": "ardulink2", "probe_interval": "100ms", "ready_timeout": "1s"}"#,
    )
    .unwrap();
    let link = Link::from_config(connection.clone(), config).unwrap();

    assert!(!link.wait_until_ready().await);
    assert_eq!(connection.count_written("notn/0"), 10);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_ready_bounded_by_stalled_transport() {
    init_tracing();
    // the device never reads, so the first ready check fills the pipe and blocks
    let (_device, host) = tokio::io::duplex(4);
    let connection = Arc::new(StreamConnection::from_stream("stalled", host, Framing::newline()));
    let link = Link::new(connection, Arc::new(TextProtocol::new()));

    let started = tokio::time::Instant::now();
    let ready = tokio::time::timeout(
        Duration::from_secs(3),
        link.wait_for_ready(Duration::from_millis(500), ReadyMode::AnyMessage),
    )
    .await;
    assert_eq!(ready.ok(), Some(false));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_ready_after_close_is_false() {
    let (_connection, link) = text_link();
    link.close().await.unwrap();
    assert!(!link.wait_for_ready(Duration::from_secs(1), ReadyMode::AnyMessage).await);
}

// ============================================================================
// Stream Connection
// ============================================================================

#[tokio::test]
async fn test_link_over_duplex_stream() {
    init_tracing();
    let (device, host) = tokio::io::duplex(256);
    let connection = Arc::new(StreamConnection::from_stream("duplex", host, Framing::newline()));
    let link = Link::new(connection.clone(), Arc::new(TextProtocol::new()));

    let (device_read, mut device_write) = tokio::io::split(device);
    let mut device_lines = BufReader::new(device_read).lines();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    link.add_event_listener(Some(Pin::digital(2)), move |event| {
        tx.send(*event)?;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(
        device_lines.next_line().await.unwrap().as_deref(),
        Some("alp://srld/2")
    );

    device_write
        .write_all(b"alp://dred/2/1\nalp://dred/2/")
        .await
        .unwrap();
    device_write.write_all(b"0\n").await.unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.value, PinValue::Digital(true));
    assert_eq!(second.value, PinValue::Digital(false));

    link.send_tone(Tone {
        pin: Pin::analog(2),
        hertz: 440,
        duration: Some(Duration::from_millis(250)),
    })
    .await
    .unwrap();
    assert_eq!(
        device_lines.next_line().await.unwrap().as_deref(),
        Some("alp://tone/2/440/250")
    );

    link.close().await.unwrap();
    assert_eq!(
        device_lines.next_line().await.unwrap().as_deref(),
        Some("alp://spld/2")
    );
}

#[tokio::test]
async fn test_device_hangup_reaches_connection_listener() {
    let (device, host) = tokio::io::duplex(64);
    let connection = Arc::new(StreamConnection::from_stream("duplex", host, Framing::newline()));
    let link = Link::new(connection, Arc::new(TextProtocol::new()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    link.add_connection_listener(move |state| {
        tx.send(state)?;
        Ok(())
    });

    drop(device);
    assert_eq!(rx.recv().await, Some(ConnectionState::Lost));
}

// ============================================================================
// Framing and Codec Totality
// ============================================================================

#[test]
fn test_scanner_round_trip_in_order() {
    let protocol = TextProtocol::new();
    let messages = vec![
        DeviceMessage::Ready,
        DeviceMessage::PinStateChanged {
            pin: Pin::analog(0),
            value: PinValue::Analog(1023),
        },
        DeviceMessage::PinStateChanged {
            pin: Pin::digital(12),
            value: PinValue::Digital(false),
        },
        DeviceMessage::Custom(vec!["a".to_string(), "b".to_string()]),
    ];

    let stream: Vec<u8> = messages
        .iter()
        .flat_map(|m| protocol.encode_message(m).unwrap())
        .collect();

    let mut buffer = FrameBuffer::new(protocol.framing());
    let mut decoded = Vec::new();
    for byte in stream {
        buffer.push(&[byte]);
        while let Some(frame) = buffer.next_frame() {
            decoded.push(protocol.decode(&frame).unwrap());
        }
    }
    assert_eq!(decoded, messages);
}

#[test]
fn test_byte_by_byte_reports_nothing_before_delimiter() {
    let mut buffer = FrameBuffer::new(Framing::newline());
    for byte in b"alp://ready/" {
        buffer.push(&[*byte]);
        assert!(buffer.next_frame().is_none());
    }
    buffer.push(b"\n");
    assert_eq!(buffer.next_frame().as_deref(), Some(&b"alp://ready/"[..]));
}

#[test]
fn test_text_protocol_commands_round_trip() {
    let protocol = TextProtocol::new();
    let commands = vec![
        Command::KeyPress(KeyPress {
            key_char: 'x',
            key_code: 88,
            key_location: 1,
            modifiers: 0,
            modifiers_ex: 64,
        }),
        Command::SwitchAnalog {
            pin: Pin::analog(9),
            value: 255,
        },
        Command::SwitchDigital {
            pin: Pin::digital(13),
            value: false,
        },
        Command::StartListening(Pin::analog(1)),
        Command::StopListening(Pin::digital(2)),
        Command::Tone(Tone {
            pin: Pin::analog(3),
            hertz: 1000,
            duration: None,
        }),
        Command::NoTone(Pin::analog(3)),
        Command::Custom(vec!["led".to_string(), "blink".to_string()]),
    ];

    for (index, command) in commands.into_iter().enumerate() {
        let id = (index % 2 == 0).then_some(index as u64 + 1);
        let bytes = protocol.encode(&command, id).unwrap();
        let frame = strip_delimiter(&protocol.framing(), &bytes);
        assert_eq!(protocol.decode_command(frame).unwrap(), (command, id));
    }
}

#[test]
fn test_binary_protocol_supported_and_unsupported() {
    let protocol = BinaryProtocol::new();
    let supported = vec![
        Command::SwitchAnalog {
            pin: Pin::analog(5),
            value: 77,
        },
        Command::SwitchDigital {
            pin: Pin::digital(8),
            value: true,
        },
    ];
    for command in supported {
        let bytes = protocol.encode(&command, None).unwrap();
        assert_eq!(bytes.len(), 3);
        assert_eq!(protocol.decode_command(&bytes).unwrap(), (command, None));
    }

    let unsupported = vec![
        Command::StartListening(Pin::analog(1)),
        Command::NoTone(Pin::analog(1)),
        Command::Custom(vec![]),
    ];
    for command in unsupported {
        let err = protocol.encode(&command, None).unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED_COMMAND");
    }
}
