//! End-to-end runs of the event-to-publish pipeline against fake collaborators.

use std::collections::VecDeque;

use embassy_futures::block_on;
use embedded_hal_async::delay::DelayNs;
use lora_mqtt_gateway::bridge::{
    BridgeEvent, BridgeRunner, BridgeSlot, PubSubSession, Publisher, QoS, SessionEvent,
    SessionState,
};
use lora_mqtt_gateway::config::{GatewayConfig, Topics};
use lora_mqtt_gateway::connectivity::{
    ConnectionState, Connectivity, ConnectivityStatus, LinkSignal, NetworkLink,
};
use lora_mqtt_gateway::error::{ClientError, GatewayError};
use lora_mqtt_gateway::frame::FRAME_CAPACITY;
use lora_mqtt_gateway::gpio::{GpioDrain, GpioEvent, GpioEventQueue, LevelReader};
use lora_mqtt_gateway::radio::{Radio, RadioTask, Receiver};
use lora_mqtt_gateway::supervisor::{BootStage, Bootstrap};

struct NoDelay;

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}

#[derive(Default)]
struct RecordingSession {
    published: Vec<(String, Vec<u8>, QoS)>,
    inbound: VecDeque<SessionEvent>,
}

impl PubSubSession for RecordingSession {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        _retain: bool,
    ) -> Result<(), ClientError> {
        self.published.push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }

    async fn subscribe(&mut self, _topic: &str, _qos: QoS) -> Result<(), ClientError> {
        Ok(())
    }

    async fn unsubscribe(&mut self, _topic: &str) -> Result<(), ClientError> {
        Ok(())
    }

    async fn wait_inbound(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn next_event(&mut self) -> Result<SessionEvent, ClientError> {
        // The session drops once the script is spent, which ends `serve`.
        self.inbound
            .pop_front()
            .ok_or(ClientError::socket(104))
    }
}

impl RecordingSession {
    fn on_topic(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.clone())
            .collect()
    }
}

struct StationLink {
    signals: VecDeque<LinkSignal>,
    connects: usize,
}

impl NetworkLink for StationLink {
    async fn next_signal(&mut self) -> LinkSignal {
        self.signals.pop_front().unwrap_or(LinkSignal::Disconnected)
    }

    async fn connect(&mut self) -> Result<(), GatewayError> {
        self.connects += 1;
        Ok(())
    }
}

struct ButtonReleased;

impl LevelReader for ButtonReleased {
    fn level(&self, _line: u8) -> bool {
        true
    }
}

#[derive(Debug)]
struct SpiFault;

struct OnePacketRadio {
    packet: Option<Vec<u8>>,
}

impl Radio for OnePacketRadio {
    type Error = SpiFault;

    async fn init(&mut self) -> Result<(), SpiFault> {
        Ok(())
    }

    async fn set_frequency(&mut self, _hz: u32) -> Result<(), SpiFault> {
        Ok(())
    }

    async fn enable_crc(&mut self) -> Result<(), SpiFault> {
        Ok(())
    }

    async fn begin_receive(&mut self) -> Result<(), SpiFault> {
        Ok(())
    }

    async fn packet_ready(&mut self) -> bool {
        self.packet.is_some()
    }

    async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize, SpiFault> {
        let packet = self.packet.take().ok_or(SpiFault)?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(packet.len())
    }

    fn last_rssi(&self) -> i16 {
        -98
    }

    fn last_snr(&self) -> f32 {
        -3.5
    }

    async fn send_packet(&mut self, _data: &[u8]) -> Result<(), SpiFault> {
        Ok(())
    }
}

#[test]
fn test_first_attempt_connect_lets_bridge_come_up() {
    let status = ConnectivityStatus::new();
    let slot = BridgeSlot::new();
    let mut boot = Bootstrap::new();
    boot.complete(BootStage::Storage, Ok::<(), ()>(())).unwrap();
    boot.complete(BootStage::NetworkStack, Ok::<(), ()>(())).unwrap();

    let mut connectivity = Connectivity::new(2, &status);
    let mut link = StationLink {
        signals: VecDeque::from([LinkSignal::StationStarted, LinkSignal::IpAcquired]),
        connects: 0,
    };
    for _ in 0..2 {
        let signal = block_on(link.next_signal());
        block_on(connectivity.step(&mut link, signal)).unwrap();
    }
    assert_eq!(status.state(), ConnectionState::Connected);
    assert_eq!(status.retries(), 0);
    assert_eq!(link.connects, 1);

    let settled = block_on(status.wait_settled(&mut NoDelay, 100));
    let connected = if settled == ConnectionState::Connected {
        Ok(())
    } else {
        Err(settled)
    };
    boot.complete(BootStage::Connectivity, connected).unwrap();
    let bridge = boot
        .complete(BootStage::PublishBridge, slot.install())
        .unwrap();
    assert_eq!(bridge.state(), SessionState::Idle);
    assert_eq!(boot.next_stage(), Some(BootStage::Radio));
}

#[test]
fn test_exhausted_connectivity_blocks_boot() {
    let status = ConnectivityStatus::new();
    let mut connectivity = Connectivity::new(2, &status);
    let mut link = StationLink {
        signals: VecDeque::from([LinkSignal::StationStarted]),
        connects: 0,
    };

    let err = block_on(connectivity.run(&mut link));
    assert_eq!(err, GatewayError::ConnectivityExhausted { attempts: 2 });
    assert_eq!(block_on(status.wait_settled(&mut NoDelay, 100)), ConnectionState::Failed);

    let mut boot = Bootstrap::new();
    boot.complete(BootStage::Storage, Ok::<(), ()>(())).unwrap();
    boot.complete(BootStage::NetworkStack, Ok::<(), ()>(())).unwrap();
    assert_eq!(
        boot.complete(BootStage::Connectivity, Err::<(), _>(err)),
        Err(GatewayError::InitializationFailure(BootStage::Connectivity))
    );
}

#[test]
fn test_edge_before_bridge_never_reaches_the_session() {
    let queue = GpioEventQueue::new();
    let slot = BridgeSlot::new();
    let topics = Topics::DEFAULT;
    let mut drain = GpioDrain::new(&queue, ButtonReleased, Publisher::new(&slot), topics.status);

    assert!(queue.push_from_isr(GpioEvent { line: 0, level: false }));
    let early = queue.try_next().unwrap();
    assert_eq!(drain.handle(early), Err(GatewayError::BridgeUnavailable));

    let bridge = slot.install().unwrap();
    let mut runner = BridgeRunner::new(bridge, topics);
    let mut session = RecordingSession::default();
    block_on(runner.serve(&mut session));

    // Only the session announcement went out.
    assert_eq!(
        session.on_topic("ttgo/pub"),
        vec![b"hop".to_vec(), b"oke".to_vec()]
    );
}

#[test]
fn test_button_presses_arrive_in_order() {
    let queue = GpioEventQueue::new();
    let slot = BridgeSlot::new();
    let bridge = slot.install().unwrap();
    let mut drain = GpioDrain::new(&queue, ButtonReleased, Publisher::new(&slot), "ttgo/pub");

    for line in [0u8, 4, 7] {
        queue.push_from_isr(GpioEvent { line, level: false });
    }
    let mut ids = Vec::new();
    while let Some(event) = queue.try_next() {
        ids.push(drain.handle(event).unwrap());
    }

    let mut runner = BridgeRunner::new(bridge, Topics::DEFAULT);
    let mut session = RecordingSession::default();
    block_on(runner.serve(&mut session));

    let presses: Vec<Vec<u8>> = session
        .published
        .iter()
        .filter(|(_, _, qos)| *qos == QoS::AtLeastOnce)
        .map(|(_, p, _)| p.clone())
        .filter(|p| p.starts_with(b"{"))
        .collect();
    assert_eq!(
        presses,
        vec![
            br#"{"line":0,"level":true,"edge_level":false}"#.to_vec(),
            br#"{"line":4,"level":true,"edge_level":false}"#.to_vec(),
            br#"{"line":7,"level":true,"edge_level":false}"#.to_vec(),
        ]
    );
    let events: Vec<BridgeEvent> = std::iter::from_fn(|| bridge.try_next_event()).collect();
    for id in ids {
        assert!(events.contains(&BridgeEvent::Published(id)));
    }
}

#[test]
fn test_largest_packet_is_published_with_link_quality() {
    let slot = BridgeSlot::new();
    let bridge = slot.install().unwrap();
    let payload = vec![b'k'; FRAME_CAPACITY - 1];
    let mut task = RadioTask::new(
        OnePacketRadio {
            packet: Some(payload),
        },
        Receiver::new("ttgo/receiver"),
        NoDelay,
        Publisher::new(&slot),
    );
    block_on(task.bring_up(868_000_000)).unwrap();
    block_on(task.step()).unwrap();
    assert_eq!(task.role().received(), 1);
    assert_eq!(task.role().rejected(), 0);

    let mut runner = BridgeRunner::new(bridge, Topics::DEFAULT);
    let mut session = RecordingSession::default();
    block_on(runner.serve(&mut session));

    let received = session.on_topic("ttgo/receiver");
    assert_eq!(received.len(), 2);
    assert_eq!(received[0], b"got pkt".to_vec());
    let expected = format!(
        r#"{{"text":"{}","len":32,"rssi":-98,"snr":-3.5}}"#,
        "k".repeat(32)
    );
    assert_eq!(String::from_utf8(received[1].clone()).unwrap(), expected);
}

#[test]
fn test_oversized_packet_is_never_published() {
    let slot = BridgeSlot::new();
    let bridge = slot.install().unwrap();
    let mut task = RadioTask::new(
        OnePacketRadio {
            packet: Some(vec![b'k'; FRAME_CAPACITY]),
        },
        Receiver::new("ttgo/receiver"),
        NoDelay,
        Publisher::new(&slot),
    );
    block_on(task.step()).unwrap();
    assert_eq!(task.role().rejected(), 1);
    assert_eq!(bridge.queued(), 0);
}

#[test]
fn test_default_config_routes_topics() {
    let config = GatewayConfig::from_lookup(|name| match name {
        "GATEWAY_WIFI_SSID" => Some("azv"),
        "GATEWAY_BROKER_URI" => Some("mqtt://192.168.8.111"),
        _ => None,
    });
    config.validate().unwrap();
    let broker = config.broker().unwrap();
    assert_eq!((broker.host, broker.port), ("192.168.8.111", 1883));
    assert_eq!(config.topics.receiver, "ttgo/receiver");
    assert_eq!(config.topics.sender, "ttgo/sender");
}
