use super::*;
use crate::event::FifoQueue;
use crate::function::{handler, FUNC_HANDLERS_MAX, FUNC_READ_HOLDING_REGISTER};
use crate::port::mock::{call_log, CallLog, MockMasterTimer, MockSerial, MockTimer};
use crate::transport::mock::MockTransport;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing_test::traced_test;

struct Fixture {
    engine: Engine,
    queue: Arc<FifoQueue>,
    log: CallLog,
}

fn fixture_with(config: EngineConfig, transport: impl FnOnce(CallLog) -> MockTransport) -> Fixture {
    let log = call_log();
    let queue = Arc::new(FifoQueue::default());
    let mut engine = Engine::new(config, queue.clone(), MockMasterTimer::new(log.clone())).unwrap();
    engine
        .init_with_transport(Mode::Rtu, Box::new(transport(log.clone())))
        .unwrap();
    Fixture { engine, queue, log }
}

fn enabled(transport: impl FnOnce(CallLog) -> MockTransport) -> Fixture {
    let mut fixture = fixture_with(EngineConfig::default(), transport);
    fixture.engine.enable().unwrap();
    fixture.log.lock().clear();
    fixture
}

fn response(pdu: &[u8]) -> impl FnOnce(CallLog) -> MockTransport {
    let adu = Adu {
        address: 0x11,
        pdu: pdu.to_vec(),
    };
    move |log| MockTransport::with_response(log, adu)
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().clone()
}

#[test]
fn test_lifecycle_transitions() {
    let log = call_log();
    let queue = Arc::new(FifoQueue::default());
    let mut engine =
        Engine::new(EngineConfig::default(), queue, MockMasterTimer::new(log.clone())).unwrap();
    assert_eq!(engine.state(), State::NotInitialized);
    assert_eq!(engine.mode(), None);
    assert!(engine.port_handle().is_none());

    engine
        .init(
            Mode::Rtu,
            0x01,
            0,
            9600,
            Parity::Even,
            PortIo::new(MockSerial::new(), MockTimer::new()),
        )
        .unwrap();
    assert_eq!(engine.state(), State::Disabled);
    assert_eq!(engine.mode(), Some(Mode::Rtu));

    engine.enable().unwrap();
    assert_eq!(engine.state(), State::Enabled);
    assert_eq!(engine.poll(), Ok(()));
}

#[test]
fn test_operations_before_init() {
    let queue = Arc::new(FifoQueue::default());
    let mut engine =
        Engine::new(EngineConfig::default(), queue, MockMasterTimer::new(call_log())).unwrap();

    assert_eq!(engine.enable(), Err(ModbusError::IllegalState));
    assert_eq!(engine.disable(), Err(ModbusError::IllegalState));
    assert_eq!(engine.close(), Err(ModbusError::IllegalState));
    assert_eq!(engine.poll(), Err(ModbusError::IllegalState));
    assert_eq!(
        engine.send_frame(&[0x11, 0x03]),
        Err(ModbusError::IllegalState)
    );
}

#[test]
fn test_invalid_config_rejected() {
    let config = EngineConfig {
        response_timeout_ms: 0,
        ..Default::default()
    };
    let result = Engine::new(config, Arc::new(FifoQueue::default()), MockMasterTimer::new(call_log()));
    assert!(matches!(result, Err(ModbusError::InvalidArgument)));
}

#[test]
fn test_enable_twice_is_illegal() {
    let mut f = enabled(|log| MockTransport::new(log, None, None));
    assert_eq!(f.engine.enable(), Err(ModbusError::IllegalState));
    assert_eq!(f.engine.state(), State::Enabled);
}

#[test]
fn test_enable_starts_and_disable_stops_transport() {
    let mut f = fixture_with(EngineConfig::default(), |log| MockTransport::new(log, None, None));
    f.engine.enable().unwrap();
    f.engine.disable().unwrap();
    assert_eq!(f.engine.state(), State::Disabled);
    assert_eq!(calls(&f.log), vec!["start", "stop", "timer.disable"]);
}

#[test]
fn test_disable_is_idempotent() {
    let mut f = fixture_with(EngineConfig::default(), |log| MockTransport::new(log, None, None));
    assert_eq!(f.engine.disable(), Ok(()));
    assert_eq!(f.engine.disable(), Ok(()));
    assert_eq!(f.engine.state(), State::Disabled);
    assert!(calls(&f.log).is_empty());
}

#[test]
fn test_close_only_from_disabled() {
    let mut f = enabled(|log| MockTransport::new(log, None, None).with_close());
    assert_eq!(f.engine.close(), Err(ModbusError::IllegalState));

    f.engine.disable().unwrap();
    f.log.lock().clear();
    assert_eq!(f.engine.close(), Ok(()));
    assert_eq!(f.engine.state(), State::Disabled);
    assert_eq!(calls(&f.log), vec!["close"]);
}

#[test]
fn test_close_without_close_operation() {
    let mut f = fixture_with(EngineConfig::default(), |log| MockTransport::new(log, None, None));
    assert_eq!(f.engine.close(), Ok(()));
    assert!(calls(&f.log).is_empty());
}

#[test]
fn test_reinit_rejected() {
    let mut f = fixture_with(EngineConfig::default(), |log| MockTransport::new(log, None, None));
    let again = MockTransport::new(f.log.clone(), None, None);
    assert_eq!(
        f.engine.init_with_transport(Mode::Ascii, Box::new(again)),
        Err(ModbusError::IllegalState)
    );
    assert_eq!(f.engine.mode(), Some(Mode::Rtu));
}

#[test]
fn test_unsupported_mode_rejected() {
    let config = EngineConfig {
        modes: ModeSupport::RTU,
        ..Default::default()
    };
    let mut engine = Engine::new(
        config,
        Arc::new(FifoQueue::default()),
        MockMasterTimer::new(call_log()),
    )
    .unwrap();

    let result = engine.init(
        Mode::Ascii,
        0x01,
        0,
        9600,
        Parity::Even,
        PortIo::new(MockSerial::new(), MockTimer::new()),
    );
    assert_eq!(result, Err(ModbusError::InvalidArgument));
    assert_eq!(
        engine.init_tcp(502, PortIo::new(MockSerial::new(), MockTimer::new())),
        Err(ModbusError::InvalidArgument)
    );
    assert_eq!(engine.state(), State::NotInitialized);
}

#[test]
fn test_queue_init_failure_is_port_error() {
    let mut engine = Engine::new(
        EngineConfig::default(),
        Arc::new(FifoQueue::new(0)),
        MockMasterTimer::new(call_log()),
    )
    .unwrap();

    let result = engine.init_with_transport(Mode::Rtu, Box::new(MockTransport::new(call_log(), None, None)));
    assert!(matches!(result, Err(ModbusError::PortError(_))));
    assert_eq!(engine.state(), State::NotInitialized);
}

#[test]
fn test_port_init_failure_propagates() {
    let mut engine = Engine::new(
        EngineConfig::default(),
        Arc::new(FifoQueue::default()),
        MockMasterTimer::new(call_log()),
    )
    .unwrap();

    let result = engine.init(
        Mode::Rtu,
        0x01,
        0,
        9600,
        Parity::Even,
        PortIo::new(MockSerial::new_error(), MockTimer::new()),
    );
    assert!(matches!(result, Err(ModbusError::PortError(_))));
    assert_eq!(engine.state(), State::NotInitialized);
}

#[test]
fn test_init_rejects_broadcast_station_address() {
    let mut engine = Engine::new(
        EngineConfig::default(),
        Arc::new(FifoQueue::default()),
        MockMasterTimer::new(call_log()),
    )
    .unwrap();

    let result = engine.init(
        Mode::Rtu,
        crate::types::ADDRESS_BROADCAST,
        0,
        9600,
        Parity::Even,
        PortIo::new(MockSerial::new(), MockTimer::new()),
    );
    assert_eq!(result, Err(ModbusError::InvalidArgument));
    assert_eq!(engine.state(), State::NotInitialized);
}

#[test]
fn test_tcp_init_ignores_serial_parameters() {
    let serial = MockSerial::new();
    let mut engine = Engine::new(
        EngineConfig::default(),
        Arc::new(FifoQueue::default()),
        MockMasterTimer::new(call_log()),
    )
    .unwrap();

    engine
        .init(
            Mode::Tcp,
            0x22,
            7,
            0,
            Parity::None,
            PortIo::new(serial.clone(), MockTimer::new()),
        )
        .unwrap();
    assert_eq!(engine.mode(), Some(Mode::Tcp));
    assert_eq!(
        serial.settings(),
        Some(crate::types::LineSettings::Tcp {
            port: TCP_DEFAULT_PORT
        })
    );
}

#[test]
fn test_poll_when_disabled_keeps_event() {
    let mut f = fixture_with(EngineConfig::default(), |log| MockTransport::new(log, None, None));
    f.queue.post(Event::FrameSent);

    assert_eq!(f.engine.poll(), Err(ModbusError::IllegalState));
    assert_eq!(f.queue.len(), 1);
}

#[test]
fn test_poll_handles_one_event_per_call() {
    let mut f = enabled(|log| MockTransport::new(log, None, None));
    f.queue.post(Event::Ready);
    f.queue.post(Event::FrameSent);

    f.engine.poll().unwrap();
    assert_eq!(f.queue.len(), 1);
    assert!(calls(&f.log).is_empty());

    f.engine.poll().unwrap();
    assert!(f.queue.is_empty());
    assert_eq!(calls(&f.log), vec!["timer.enable(5000)"]);
}

#[test]
fn test_frame_received_disarms_timer_then_defers_execute() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut f = enabled(response(&[0x03, 0x02, 0x12, 0x34]));
    let counter = hits.clone();
    f.engine
        .register_handler(
            FUNC_READ_HOLDING_REGISTER,
            Some(handler(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Exception::None
            })),
        )
        .unwrap();

    f.queue.post(Event::FrameReceived);
    f.engine.poll().unwrap();

    assert_eq!(calls(&f.log), vec!["timer.disable", "receive"]);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(f.queue.try_get(), Some(Event::Execute));

    let transaction = f.engine.transaction().unwrap();
    assert_eq!(transaction.address, 0x11);
    assert_eq!(transaction.length, 4);
    assert_eq!(transaction.exception, None);
}

#[test]
fn test_execute_dispatches_to_registered_handler() {
    let mut f = enabled(response(&[0x03, 0x02, 0x12, 0x34]));
    f.engine
        .register_handler(
            FUNC_READ_HOLDING_REGISTER,
            Some(handler(|pdu, len| {
                assert_eq!(*len, 4);
                assert_eq!(&pdu[..*len], &[0x03, 0x02, 0x12, 0x34]);
                Exception::IllegalDataValue
            })),
        )
        .unwrap();

    f.queue.post(Event::FrameReceived);
    f.engine.poll().unwrap();
    assert_eq!(f.engine.last_exception(), None);

    f.engine.poll().unwrap();
    assert_eq!(f.engine.last_exception(), Some(Exception::IllegalDataValue));
    assert!(f.queue.is_empty());
}

#[test]
fn test_exception_response_goes_to_illegal_handler() {
    let mut f = enabled(response(&[0x83, 0x02]));
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    f.engine
        .register_handler(FUNC_READ_HOLDING_REGISTER, Some(handler(|_, _| Exception::None)))
        .unwrap();
    f.engine
        .register_illegal_handler(handler(move |pdu, _| {
            counter.store(pdu[0] as usize, Ordering::SeqCst);
            Exception::IllegalFunction
        }))
        .unwrap();

    f.queue.post(Event::FrameReceived);
    f.engine.poll().unwrap();
    f.engine.poll().unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 0x83);
    assert_eq!(
        f.engine.transaction().unwrap().exception,
        Some(Exception::IllegalDataAddress)
    );
    assert_eq!(f.engine.last_exception(), Some(Exception::IllegalFunction));
}

#[test]
fn test_execute_without_frame_is_ignored() {
    let mut f = enabled(|log| MockTransport::new(log, None, None));
    f.queue.post(Event::Execute);
    assert_eq!(f.engine.poll(), Ok(()));
    assert_eq!(f.engine.last_exception(), None);
}

#[test]
#[traced_test]
fn test_decode_error_abandons_transaction() {
    let mut f = enabled(|log| {
        MockTransport::new(
            log,
            Some(Box::new(|| -> Result<Adu> {
                Err(ModbusError::Checksum {
                    expected: 0x1234,
                    actual: 0x4321,
                })
            })),
            None,
        )
    });

    f.queue.post(Event::FrameReceived);
    let result = f.engine.poll();
    assert!(matches!(result, Err(ModbusError::Checksum { .. })));
    assert!(f.queue.is_empty());
    assert!(f.engine.transaction().is_none());
    assert!(matches!(
        f.engine.last_error(),
        Some(ModbusError::Checksum { .. })
    ));
    assert!(logs_contain("Rx error"));

    // The loop keeps running
    assert_eq!(f.engine.poll(), Ok(()));
}

#[test]
fn test_frame_sent_arms_response_timer() {
    let mut f = enabled(|log| MockTransport::new(log, None, None));
    f.queue.post(Event::FrameSent);
    f.engine.poll().unwrap();
    assert_eq!(calls(&f.log), vec!["timer.enable(5000)"]);
}

#[test]
fn test_response_timeout_reported_once() {
    let mut f = enabled(|log| MockTransport::new(log, None, None));
    f.queue.post(Event::FrameSent);
    f.queue.post(Event::Timeout);
    f.queue.post(Event::Timeout);

    f.engine.poll().unwrap();
    assert_eq!(f.engine.poll(), Err(ModbusError::Timeout));
    assert_eq!(f.engine.last_error(), Some(&ModbusError::Timeout));
    // Second expiry has no outstanding request
    assert_eq!(f.engine.poll(), Ok(()));
}

#[test]
fn test_response_clears_pending_timeout() {
    let mut f = enabled(response(&[0x03, 0x02, 0x00, 0x01]));
    f.queue.post(Event::FrameSent);
    f.queue.post(Event::FrameReceived);
    f.queue.post(Event::Timeout);

    f.engine.poll().unwrap();
    f.engine.poll().unwrap();
    // Timeout raced the response: ignored
    assert_eq!(f.engine.poll(), Ok(()));
    assert_eq!(f.engine.last_error(), None);
}

#[test]
fn test_send_frame_splits_address_and_pdu() {
    let mut f = enabled(|log| MockTransport::new(log, None, None));
    f.engine
        .send_frame(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03])
        .unwrap();
    assert_eq!(
        calls(&f.log),
        vec!["send(0x11, [03, 00, 6B, 00, 03])".to_string()]
    );
}

#[test]
fn test_send_frame_rejects_short_frames() {
    let mut f = enabled(|log| MockTransport::new(log, None, None));
    assert_eq!(f.engine.send_frame(&[]), Err(ModbusError::InvalidArgument));
    assert_eq!(f.engine.send_frame(&[0x11]), Err(ModbusError::InvalidArgument));
    assert!(calls(&f.log).is_empty());
}

#[test]
fn test_send_frame_retries_until_accepted() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut f = enabled(move |log| {
        MockTransport::new(
            log,
            None,
            Some(Box::new(move |_: u8, _: &[u8]| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ModbusError::Io("busy".into()))
                } else {
                    Ok(())
                }
            })),
        )
    });

    assert_eq!(f.engine.send_frame(&[0x11, 0x03]), Ok(()));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

fn failing_send(on_exhausted: Exhausted) -> (Fixture, RetryPolicy) {
    let retry = RetryPolicy {
        attempts: 10,
        delay: Duration::from_millis(5),
        on_exhausted,
    };
    let config = EngineConfig {
        send_retry: retry.clone(),
        ..Default::default()
    };
    let mut f = fixture_with(config, MockTransport::new_send_error);
    f.engine.enable().unwrap();
    f.log.lock().clear();
    (f, retry)
}

#[test]
fn test_send_frame_exhausts_retry_budget() {
    let (mut f, retry) = failing_send(Exhausted::Fail);

    let start = Instant::now();
    let result = f.engine.send_frame(&[0x11, 0x03, 0x00, 0x00, 0x00, 0x01]);
    let elapsed = start.elapsed();

    assert_eq!(result, Err(ModbusError::Timeout));
    assert_eq!(calls(&f.log).len(), retry.attempts as usize);
    assert!(elapsed >= retry.delay * (retry.attempts - 1));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(f.engine.last_error(), Some(&ModbusError::Timeout));
}

#[test]
fn test_send_frame_can_mask_exhaustion() {
    let (mut f, retry) = failing_send(Exhausted::Ignore);

    let start = Instant::now();
    assert_eq!(f.engine.send_frame(&[0x11, 0x03]), Ok(()));
    assert!(start.elapsed() >= retry.delay * (retry.attempts - 1));
    assert_eq!(f.engine.last_error(), None);
}

#[test]
fn test_register_overflow_keeps_prior_entries() {
    let f = fixture_with(EngineConfig::default(), |log| MockTransport::new(log, None, None));
    for code in 1..=FUNC_HANDLERS_MAX as u8 {
        f.engine
            .register_handler(code, Some(handler(|_, _| Exception::None)))
            .unwrap();
    }

    assert_eq!(
        f.engine
            .register_handler(100, Some(handler(|_, _| Exception::None))),
        Err(ModbusError::ResourceExhausted)
    );
    let expected: Vec<u8> = (1..=FUNC_HANDLERS_MAX as u8).collect();
    assert_eq!(f.engine.handlers().codes(), expected);
}

#[test]
fn test_register_invalid_code() {
    let f = fixture_with(EngineConfig::default(), |log| MockTransport::new(log, None, None));
    assert_eq!(
        f.engine
            .register_handler(200, Some(handler(|_, _| Exception::None))),
        Err(ModbusError::InvalidArgument)
    );
}

#[test]
fn test_port_handle_drives_binding() {
    let f = fixture_with(EngineConfig::default(), |log| MockTransport::new(log, None, None));
    let handle = f.engine.port_handle().unwrap();
    assert_eq!(handle.mode(), Mode::Rtu);

    handle.byte_received();
    handle.clone().transmitter_empty();
    handle.timer_expired();
    assert_eq!(
        calls(&f.log),
        vec!["byte_received", "transmitter_empty", "timer_expired"]
    );
}
