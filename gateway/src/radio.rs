//! Radio poll loop.
//!
//! The role of the radio is fixed at configuration time: a [`Receiver`]
//! forwards every packet it hears, a [`Transmitter`] sends a test packet on a
//! fixed interval. Both implement [`Role`] and are driven by the same
//! [`RadioTask`], which the firmware monomorphizes once per role.

use core::fmt::Debug;

use embedded_hal_async::delay::DelayNs;
use log::{error, info, warn};

use crate::bridge::{Publisher, QoS};
use crate::error::{GatewayError, Result};
use crate::frame::{PacketFrame, REPORT_CAPACITY, RadioPacket};

/// Fixed test payload of the transmitter, terminator included.
pub const TEST_PAYLOAD: &[u8] = b"plop\0";
pub const TRANSMIT_INTERVAL_MS: u32 = 5000;
/// Pause between two receive polls once every ready packet is drained.
pub const RECEIVE_POLL_MS: u32 = 10;
const ERROR_BACKOFF_MS: u32 = 1000;

/// Transceiver driver.
#[allow(async_fn_in_trait)]
pub trait Radio {
    type Error: Debug;

    async fn init(&mut self) -> core::result::Result<(), Self::Error>;

    async fn set_frequency(&mut self, hz: u32) -> core::result::Result<(), Self::Error>;

    async fn enable_crc(&mut self) -> core::result::Result<(), Self::Error>;

    /// Puts the radio in receive mode.
    async fn begin_receive(&mut self) -> core::result::Result<(), Self::Error>;

    /// Whether a received packet is waiting to be read.
    async fn packet_ready(&mut self) -> bool;

    /// Copies the waiting packet into `buf`.
    ///
    /// Returns the length the radio reports, which may be larger than `buf`.
    async fn read_packet(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error>;

    fn last_rssi(&self) -> i16;

    fn last_snr(&self) -> f32;

    async fn send_packet(&mut self, data: &[u8]) -> core::result::Result<(), Self::Error>;
}

fn radio_error<E: Debug>(e: E) -> GatewayError {
    error!("LoRa driver error: {:?}", e);
    GatewayError::Radio
}

/// Publishes without failing the cycle; the radio keeps going either way.
fn submit(publisher: &Publisher<'_>, topic: &str, payload: &[u8]) {
    if let Err(e) = publisher.publish(topic, payload, QoS::AtMostOnce, false) {
        warn!("Publish on {} failed: {}", topic, e);
    }
}

/// One iteration of a radio role.
#[allow(async_fn_in_trait)]
pub trait Role {
    const NAME: &'static str;

    async fn cycle<R: Radio, D: DelayNs>(
        &mut self,
        radio: &mut R,
        delay: &mut D,
        publisher: &Publisher<'_>,
    ) -> Result<()>;
}

/// Forwards received packets to the receiver topic.
pub struct Receiver {
    topic: &'static str,
    poll_ms: u32,
    frame: PacketFrame,
    received: u32,
    rejected: u32,
}

impl Receiver {
    pub fn new(topic: &'static str) -> Self {
        Self::with_poll_interval(topic, RECEIVE_POLL_MS)
    }

    pub fn with_poll_interval(topic: &'static str, poll_ms: u32) -> Self {
        Self {
            topic,
            poll_ms,
            frame: PacketFrame::new(),
            received: 0,
            rejected: 0,
        }
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    async fn receive_one<R: Radio>(&mut self, radio: &mut R, publisher: &Publisher<'_>) -> Result<()> {
        let reported = radio
            .read_packet(self.frame.writable())
            .await
            .map_err(radio_error)?;
        self.frame.commit(reported)?;

        let packet = RadioPacket::new(&self.frame, radio.last_rssi(), radio.last_snr());
        info!(
            "LoRa packet received: {}",
            packet.text.unwrap_or("<binary>")
        );
        info!("LoRa RSSI: {}, SNR: {}", packet.rssi, packet.snr);

        let mut report = [0u8; REPORT_CAPACITY];
        let len = packet.render(&mut report)?;
        submit(publisher, self.topic, b"got pkt");
        submit(publisher, self.topic, &report[..len]);
        self.received += 1;
        Ok(())
    }
}

impl Role for Receiver {
    const NAME: &'static str = "receiver";

    /// Drains every ready packet, then sleeps one poll interval.
    async fn cycle<R: Radio, D: DelayNs>(
        &mut self,
        radio: &mut R,
        delay: &mut D,
        publisher: &Publisher<'_>,
    ) -> Result<()> {
        radio.begin_receive().await.map_err(radio_error)?;
        while radio.packet_ready().await {
            if let Err(e) = self.receive_one(radio, publisher).await {
                self.rejected += 1;
                warn!("LoRa packet rejected: {}", e);
            }
            radio.begin_receive().await.map_err(radio_error)?;
        }
        delay.delay_ms(self.poll_ms).await;
        Ok(())
    }
}

/// Sends [`TEST_PAYLOAD`] every [`TRANSMIT_INTERVAL_MS`].
pub struct Transmitter {
    topic: &'static str,
    interval_ms: u32,
    sent: u32,
}

impl Transmitter {
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            interval_ms: TRANSMIT_INTERVAL_MS,
            sent: 0,
        }
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }
}

impl Role for Transmitter {
    const NAME: &'static str = "transmitter";

    async fn cycle<R: Radio, D: DelayNs>(
        &mut self,
        radio: &mut R,
        delay: &mut D,
        publisher: &Publisher<'_>,
    ) -> Result<()> {
        delay.delay_ms(self.interval_ms).await;
        radio
            .send_packet(TEST_PAYLOAD)
            .await
            .map_err(radio_error)?;
        self.sent += 1;
        info!("LoRa packet sent");
        info!("LoRa RSSI: {}, SNR: {}", radio.last_rssi(), radio.last_snr());
        submit(publisher, self.topic, b"sent pkt");
        Ok(())
    }
}

/// The radio task: one driver, one role.
pub struct RadioTask<'a, R, P, D> {
    radio: R,
    role: P,
    delay: D,
    publisher: Publisher<'a>,
}

impl<'a, R: Radio, P: Role, D: DelayNs> RadioTask<'a, R, P, D> {
    pub fn new(radio: R, role: P, delay: D, publisher: Publisher<'a>) -> Self {
        Self {
            radio,
            role,
            delay,
            publisher,
        }
    }

    /// Initializes the transceiver. Boot treats a failure here as fatal.
    pub async fn bring_up(&mut self, frequency_hz: u32) -> Result<()> {
        info!("Initializing LoRa radio");
        self.radio.init().await.map_err(radio_error)?;
        self.radio
            .set_frequency(frequency_hz)
            .await
            .map_err(radio_error)?;
        self.radio.enable_crc().await.map_err(radio_error)?;
        info!(
            "LoRa radio ready as {} on {} Hz ({:.2} MHz)",
            P::NAME,
            frequency_hz,
            frequency_hz as f32 / 1_000_000.0
        );
        Ok(())
    }

    pub fn role(&self) -> &P {
        &self.role
    }

    pub async fn step(&mut self) -> Result<()> {
        self.role
            .cycle(&mut self.radio, &mut self.delay, &self.publisher)
            .await
    }

    /// Runs the role forever. Errors are logged and the loop goes on.
    pub async fn run(&mut self) -> ! {
        loop {
            if let Err(e) = self.step().await {
                error!("LoRa {} cycle failed: {}", P::NAME, e);
                self.delay.delay_ms(ERROR_BACKOFF_MS).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeSlot;
    use crate::frame::MAX_PACKET_LEN;
    use embassy_futures::block_on;
    use std::collections::VecDeque;
    use std::vec::Vec;

    #[derive(Debug)]
    struct FakeError;

    #[derive(Default)]
    struct FakeRadio {
        packets: VecDeque<(Vec<u8>, usize)>,
        rearms: usize,
        sent: Vec<Vec<u8>>,
        fail_init: bool,
        frequency: u32,
        crc: bool,
    }

    impl FakeRadio {
        fn with_packets(packets: &[&[u8]]) -> Self {
            Self {
                packets: packets.iter().map(|p| (p.to_vec(), p.len())).collect(),
                ..Self::default()
            }
        }
    }

    impl Radio for FakeRadio {
        type Error = FakeError;

        async fn init(&mut self) -> core::result::Result<(), FakeError> {
            if self.fail_init { Err(FakeError) } else { Ok(()) }
        }

        async fn set_frequency(&mut self, hz: u32) -> core::result::Result<(), FakeError> {
            self.frequency = hz;
            Ok(())
        }

        async fn enable_crc(&mut self) -> core::result::Result<(), FakeError> {
            self.crc = true;
            Ok(())
        }

        async fn begin_receive(&mut self) -> core::result::Result<(), FakeError> {
            self.rearms += 1;
            Ok(())
        }

        async fn packet_ready(&mut self) -> bool {
            !self.packets.is_empty()
        }

        async fn read_packet(&mut self, buf: &mut [u8]) -> core::result::Result<usize, FakeError> {
            let (data, reported) = self.packets.pop_front().ok_or(FakeError)?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(reported)
        }

        fn last_rssi(&self) -> i16 {
            -57
        }

        fn last_snr(&self) -> f32 {
            7.75
        }

        async fn send_packet(&mut self, data: &[u8]) -> core::result::Result<(), FakeError> {
            self.sent.push(data.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingDelay {
        calls: Vec<u32>,
    }

    impl DelayNs for CountingDelay {
        async fn delay_ns(&mut self, _ns: u32) {}

        async fn delay_ms(&mut self, ms: u32) {
            self.calls.push(ms);
        }
    }

    fn outbox(slot: &BridgeSlot) -> Vec<(String, Vec<u8>)> {
        let bridge = slot.get().unwrap();
        core::iter::from_fn(|| bridge.take_queued())
            .map(|r| (r.topic.as_str().to_string(), r.payload.to_vec()))
            .collect()
    }

    #[test]
    fn test_receiver_drains_all_before_sleeping() {
        let slot = BridgeSlot::new();
        slot.install().unwrap();
        let mut radio = FakeRadio::with_packets(&[b"one", b"two"]);
        let mut delay = CountingDelay::default();
        let mut receiver = Receiver::new("ttgo/receiver");

        block_on(receiver.cycle(&mut radio, &mut delay, &Publisher::new(&slot))).unwrap();

        assert_eq!(receiver.received(), 2);
        // Initial arm plus one re-arm per packet.
        assert_eq!(radio.rearms, 3);
        assert_eq!(delay.calls, [RECEIVE_POLL_MS]);
        let sent = outbox(&slot);
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0], ("ttgo/receiver".into(), b"got pkt".to_vec()));
        assert_eq!(
            sent[1].1,
            br#"{"text":"one","len":3,"rssi":-57,"snr":7.75}"#.to_vec()
        );
    }

    #[test]
    fn test_overrun_is_rejected_and_next_packet_still_processed() {
        let slot = BridgeSlot::new();
        slot.install().unwrap();
        let mut radio = FakeRadio::with_packets(&[]);
        radio.packets.push_back((vec![b'x'; 40], 40));
        radio.packets.push_back((b"ok".to_vec(), 2));
        let mut delay = CountingDelay::default();
        let mut receiver = Receiver::new("ttgo/receiver");

        block_on(receiver.cycle(&mut radio, &mut delay, &Publisher::new(&slot))).unwrap();

        assert_eq!(receiver.rejected(), 1);
        assert_eq!(receiver.received(), 1);
        assert_eq!(radio.rearms, 3);
        assert_eq!(outbox(&slot).len(), 2);
    }

    #[test]
    fn test_receiver_keeps_running_without_bridge() {
        let slot = BridgeSlot::new();
        let mut radio = FakeRadio::with_packets(&[b"early"]);
        let mut delay = CountingDelay::default();
        let mut receiver = Receiver::new("ttgo/receiver");

        block_on(receiver.cycle(&mut radio, &mut delay, &Publisher::new(&slot))).unwrap();
        assert_eq!(receiver.received(), 1);
    }

    #[test]
    fn test_transmitter_sends_test_payload_then_confirms() {
        let slot = BridgeSlot::new();
        slot.install().unwrap();
        let mut radio = FakeRadio::default();
        let mut delay = CountingDelay::default();
        let mut transmitter = Transmitter::new("ttgo/sender");

        block_on(transmitter.cycle(&mut radio, &mut delay, &Publisher::new(&slot))).unwrap();

        assert_eq!(delay.calls, [5000]);
        assert_eq!(radio.sent, [b"plop\0".to_vec()]);
        assert_eq!(transmitter.sent(), 1);
        assert_eq!(
            outbox(&slot),
            [("ttgo/sender".to_string(), b"sent pkt".to_vec())]
        );
    }

    #[test]
    fn test_bring_up_configures_radio() {
        let slot = BridgeSlot::new();
        let mut task = RadioTask::new(
            FakeRadio::default(),
            Receiver::new("ttgo/receiver"),
            CountingDelay::default(),
            Publisher::new(&slot),
        );
        block_on(task.bring_up(868_000_000)).unwrap();
        assert_eq!(task.radio.frequency, 868_000_000);
        assert!(task.radio.crc);
    }

    #[test]
    fn test_bring_up_failure_is_reported() {
        let slot = BridgeSlot::new();
        let radio = FakeRadio {
            fail_init: true,
            ..FakeRadio::default()
        };
        let mut task = RadioTask::new(
            radio,
            Transmitter::new("ttgo/sender"),
            CountingDelay::default(),
            Publisher::new(&slot),
        );
        assert_eq!(block_on(task.bring_up(868_000_000)), Err(GatewayError::Radio));
    }

    #[test]
    fn test_full_size_packet_fits() {
        let slot = BridgeSlot::new();
        slot.install().unwrap();
        let full = [b'z'; MAX_PACKET_LEN];
        let mut radio = FakeRadio::with_packets(&[&full]);
        let mut delay = CountingDelay::default();
        let mut receiver = Receiver::new("ttgo/receiver");

        block_on(receiver.cycle(&mut radio, &mut delay, &Publisher::new(&slot))).unwrap();
        assert_eq!(receiver.rejected(), 0);
        assert_eq!(receiver.received(), 1);
    }
}
