//! Interrupt-to-task handoff for the button line.
//!
//! The interrupt handler only ever calls [`GpioEventQueue::push_from_isr`]:
//! a non-blocking enqueue into a fixed queue that drops the event when full.
//! Everything else (reading the line, formatting, publishing, logging)
//! happens in [`GpioDrain`] on an ordinary task.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{info, warn};
use portable_atomic::{AtomicU32, Ordering};
use serde::Serialize;

use crate::bridge::{MessageId, Publisher, QoS};
use crate::error::{GatewayError, Result};

pub const GPIO_QUEUE_CAPACITY: usize = 10;

const EDGE_REPORT_CAPACITY: usize = 64;

/// One falling edge seen by the interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioEvent {
    pub line: u8,
    /// Level sampled inside the interrupt.
    pub level: bool,
}

/// Fixed-capacity queue between the interrupt handler and the drain task.
pub struct GpioEventQueue {
    events: Channel<CriticalSectionRawMutex, GpioEvent, GPIO_QUEUE_CAPACITY>,
    dropped: AtomicU32,
}

impl Default for GpioEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioEventQueue {
    pub const fn new() -> Self {
        Self {
            events: Channel::new(),
            dropped: AtomicU32::new(0),
        }
    }

    /// Interrupt-safe enqueue. Never blocks, never logs.
    ///
    /// Returns `false` when the event was dropped because the queue is full.
    pub fn push_from_isr(&self, event: GpioEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Events dropped since boot.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn next(&self) -> GpioEvent {
        self.events.receive().await
    }

    pub fn try_next(&self) -> Option<GpioEvent> {
        self.events.try_receive().ok()
    }
}

/// Current level of an input line.
pub trait LevelReader {
    fn level(&self, line: u8) -> bool;
}

#[derive(Serialize)]
struct EdgeReport {
    line: u8,
    level: bool,
    edge_level: bool,
}

/// Drains the queue and turns every edge into a QoS 1 publish.
pub struct GpioDrain<'a, L> {
    queue: &'a GpioEventQueue,
    reader: L,
    publisher: Publisher<'a>,
    topic: &'static str,
    reported_drops: u32,
}

impl<'a, L: LevelReader> GpioDrain<'a, L> {
    pub fn new(
        queue: &'a GpioEventQueue,
        reader: L,
        publisher: Publisher<'a>,
        topic: &'static str,
    ) -> Self {
        Self {
            queue,
            reader,
            publisher,
            topic,
            reported_drops: 0,
        }
    }

    /// Publishes one event.
    ///
    /// The level is read again here and may differ from the one seen by the
    /// interrupt (bounce, slow task wake-up). Events arriving before the
    /// bridge is installed fail with `BridgeUnavailable` and are not kept.
    pub fn handle(&mut self, event: GpioEvent) -> Result<MessageId> {
        if let Err(e) = self.check_saturation() {
            warn!("{}, publishing the edges that made it", e);
        }

        let report = EdgeReport {
            line: event.line,
            level: self.reader.level(event.line),
            edge_level: event.level,
        };
        let mut payload = [0u8; EDGE_REPORT_CAPACITY];
        let len = serde_json_core::to_slice(&report, &mut payload).map_err(|_| {
            GatewayError::PayloadTooLarge {
                len: EDGE_REPORT_CAPACITY + 1,
                capacity: EDGE_REPORT_CAPACITY,
            }
        })?;

        info!("GPIO[{}] intr, val: {}", event.line, report.level);
        self.publisher
            .publish(self.topic, &payload[..len], QoS::AtLeastOnce, false)
    }

    /// Fails with [`GatewayError::QueueSaturation`] once per burst of drops.
    fn check_saturation(&mut self) -> Result<()> {
        let dropped = self.queue.dropped();
        if dropped == self.reported_drops {
            return Ok(());
        }
        warn!(
            "{} GPIO events dropped ({} total)",
            dropped.wrapping_sub(self.reported_drops),
            dropped
        );
        self.reported_drops = dropped;
        Err(GatewayError::QueueSaturation)
    }

    /// Drain loop. Never returns.
    pub async fn run(&mut self) -> ! {
        loop {
            let event = self.queue.next().await;
            match self.handle(event) {
                Ok(id) => info!("sent publish successful, msg_id={}", id.0),
                Err(GatewayError::BridgeUnavailable) => {
                    warn!("Publish bridge not ready, GPIO[{}] event dropped", event.line)
                }
                Err(e) => warn!("GPIO[{}] publish failed: {}", event.line, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeSlot, OutboundRequest, PublishBridge};
    use core::cell::Cell;

    struct FixedLevel(Cell<bool>);

    impl LevelReader for FixedLevel {
        fn level(&self, _line: u8) -> bool {
            self.0.get()
        }
    }

    fn edge(line: u8) -> GpioEvent {
        GpioEvent { line, level: false }
    }

    fn take_outbox(bridge: &PublishBridge) -> std::vec::Vec<OutboundRequest> {
        core::iter::from_fn(|| bridge.take_queued()).collect()
    }

    #[test]
    fn test_events_drain_in_fifo_order() {
        let queue = GpioEventQueue::new();
        for line in 0..5 {
            assert!(queue.push_from_isr(edge(line)));
        }
        let order: std::vec::Vec<u8> =
            core::iter::from_fn(|| queue.try_next()).map(|e| e.line).collect();
        assert_eq!(order, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_saturated_queue_drops_and_recovers() {
        let queue = GpioEventQueue::new();
        for line in 0..15 {
            queue.push_from_isr(edge(line));
        }
        assert_eq!(queue.dropped(), 5);

        let first: std::vec::Vec<u8> =
            core::iter::from_fn(|| queue.try_next()).map(|e| e.line).collect();
        assert_eq!(first, (0..10).collect::<std::vec::Vec<u8>>());

        // Space frees up once drained.
        assert!(queue.push_from_isr(edge(42)));
        assert_eq!(queue.try_next(), Some(edge(42)));
        assert_eq!(queue.dropped(), 5);
    }

    #[test]
    fn test_edge_before_bridge_is_dropped() {
        let queue = GpioEventQueue::new();
        let slot = BridgeSlot::new();
        let mut drain = GpioDrain::new(
            &queue,
            FixedLevel(Cell::new(false)),
            Publisher::new(&slot),
            "ttgo/pub",
        );

        assert_eq!(drain.handle(edge(0)), Err(GatewayError::BridgeUnavailable));

        // Installing the bridge later does not resurrect the event.
        let bridge = slot.install().unwrap();
        assert_eq!(bridge.queued(), 0);
    }

    #[test]
    fn test_edge_publishes_current_level_with_qos1() {
        let queue = GpioEventQueue::new();
        let slot = BridgeSlot::new();
        let bridge = slot.install().unwrap();
        let mut drain = GpioDrain::new(
            &queue,
            FixedLevel(Cell::new(true)),
            Publisher::new(&slot),
            "ttgo/pub",
        );

        let id = drain.handle(edge(0)).unwrap();
        let sent = take_outbox(bridge);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, id);
        assert_eq!(sent[0].topic.as_str(), "ttgo/pub");
        assert_eq!(sent[0].qos, QoS::AtLeastOnce);
        assert_eq!(
            sent[0].payload.as_slice(),
            br#"{"line":0,"level":true,"edge_level":false}"#
        );
    }

    #[test]
    fn test_drops_are_reported_once() {
        let queue = GpioEventQueue::new();
        let slot = BridgeSlot::new();
        let bridge = slot.install().unwrap();
        let mut drain = GpioDrain::new(
            &queue,
            FixedLevel(Cell::new(false)),
            Publisher::new(&slot),
            "ttgo/pub",
        );
        for line in 0..12 {
            queue.push_from_isr(edge(line));
        }
        assert_eq!(drain.check_saturation(), Err(GatewayError::QueueSaturation));
        assert_eq!(drain.check_saturation(), Ok(()));

        queue.push_from_isr(edge(12));
        assert_eq!(drain.check_saturation(), Err(GatewayError::QueueSaturation));

        // Saturation does not hold back the queued edges.
        let mut published = 0;
        while let Some(event) = queue.try_next() {
            drain.handle(event).unwrap();
            published += take_outbox(bridge).len();
        }
        assert_eq!(published, 10);
        assert_eq!(drain.reported_drops, 3);
    }
}
