//! WiFi association state machine with a bounded retry budget.
//!
//! The machine only reacts to signals from the network stack and answers
//! with commands; it never touches the stack itself. [`Connectivity::run`]
//! is the task-side driver that feeds it and executes the commands.

use embedded_hal_async::delay::DelayNs;
use log::{info, warn};
use portable_atomic::{AtomicU8, Ordering};

use crate::error::GatewayError;

/// Association status of the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl ConnectionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Lifecycle signals emitted by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    StationStarted,
    IpAcquired,
    Disconnected,
}

/// Command the machine asks the network stack to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    Connect,
}

/// Count of failed association attempts, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter {
    count: u8,
    max: u8,
}

impl RetryCounter {
    pub const fn new(max: u8) -> Self {
        Self { count: 0, max }
    }

    pub const fn count(&self) -> u8 {
        self.count
    }

    pub const fn max(&self) -> u8 {
        self.max
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Records one failure. Returns `false` once the budget is spent.
    pub fn record_failure(&mut self) -> bool {
        if self.count < self.max {
            self.count += 1;
        }
        self.count < self.max
    }
}

/// The association state machine.
#[derive(Debug, Clone, Copy)]
pub struct ConnectivityMachine {
    state: ConnectionState,
    retries: RetryCounter,
}

impl ConnectivityMachine {
    pub const fn new(max_retries: u8) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retries: RetryCounter::new(max_retries),
        }
    }

    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    pub const fn retries(&self) -> RetryCounter {
        self.retries
    }

    /// Applies one signal.
    ///
    /// Returns the command to issue, or `ConnectivityExhausted` on the
    /// transition into [`ConnectionState::Failed`]. Signals received while
    /// failed are ignored: recovery needs [`ConnectivityMachine::rearm`].
    pub fn handle(
        &mut self,
        signal: LinkSignal,
    ) -> Result<Option<LinkCommand>, GatewayError> {
        if self.state == ConnectionState::Failed {
            warn!("Ignoring {:?}: connectivity retries exhausted", signal);
            return Ok(None);
        }
        match signal {
            LinkSignal::StationStarted => {
                self.state = ConnectionState::Connecting;
                Ok(Some(LinkCommand::Connect))
            }
            LinkSignal::IpAcquired => {
                self.retries.reset();
                self.state = ConnectionState::Connected;
                Ok(None)
            }
            LinkSignal::Disconnected => {
                if self.retries.record_failure() {
                    info!(
                        "retry to connect to the AP ({}/{})",
                        self.retries.count(),
                        self.retries.max()
                    );
                    self.state = ConnectionState::Connecting;
                    Ok(Some(LinkCommand::Connect))
                } else {
                    warn!("connect to the AP fail");
                    self.state = ConnectionState::Failed;
                    Err(GatewayError::ConnectivityExhausted {
                        attempts: self.retries.count(),
                    })
                }
            }
        }
    }

    /// Leaves the failed state with a fresh retry budget.
    pub fn rearm(&mut self) {
        self.retries.reset();
        self.state = ConnectionState::Disconnected;
    }
}

/// Read-only view of the connection state for other tasks.
///
/// Only [`Connectivity`] writes it.
pub struct ConnectivityStatus {
    state: AtomicU8,
    retries: AtomicU8,
}

impl Default for ConnectivityStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityStatus {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            retries: AtomicU8::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn retries(&self) -> u8 {
        self.retries.load(Ordering::Relaxed)
    }

    fn mirror(&self, machine: &ConnectivityMachine) {
        self.retries
            .store(machine.retries().count(), Ordering::Relaxed);
        self.state.store(machine.state() as u8, Ordering::Release);
    }

    /// Polls until the link is either connected or has given up.
    pub async fn wait_settled<D: DelayNs>(&self, delay: &mut D, poll_ms: u32) -> ConnectionState {
        loop {
            match self.state() {
                state @ (ConnectionState::Connected | ConnectionState::Failed) => return state,
                _ => delay.delay_ms(poll_ms).await,
            }
        }
    }
}

/// Network stack collaborator.
#[allow(async_fn_in_trait)]
pub trait NetworkLink {
    /// Waits for the next lifecycle signal.
    async fn next_signal(&mut self) -> LinkSignal;

    /// Starts an association attempt.
    async fn connect(&mut self) -> Result<(), GatewayError>;
}

/// Drives a [`ConnectivityMachine`] from a [`NetworkLink`].
pub struct Connectivity<'a> {
    machine: ConnectivityMachine,
    status: &'a ConnectivityStatus,
}

impl<'a> Connectivity<'a> {
    pub fn new(max_retries: u8, status: &'a ConnectivityStatus) -> Self {
        let machine = ConnectivityMachine::new(max_retries);
        status.mirror(&machine);
        Self { machine, status }
    }

    pub fn machine(&self) -> &ConnectivityMachine {
        &self.machine
    }

    /// Feeds one signal and carries out the resulting command.
    ///
    /// A connect request the stack rejects outright counts as a
    /// disconnection, so it consumes retry budget like a failed association.
    pub async fn step<L: NetworkLink>(
        &mut self,
        link: &mut L,
        signal: LinkSignal,
    ) -> Result<ConnectionState, GatewayError> {
        let mut signal = signal;
        loop {
            let outcome = self.machine.handle(signal);
            self.status.mirror(&self.machine);
            match outcome? {
                Some(LinkCommand::Connect) => match link.connect().await {
                    Ok(()) => return Ok(self.machine.state()),
                    Err(e) => {
                        warn!("Connect request rejected: {}", e);
                        signal = LinkSignal::Disconnected;
                    }
                },
                None => {
                    if signal == LinkSignal::IpAcquired {
                        info!("Station got an IP address");
                    }
                    return Ok(self.machine.state());
                }
            }
        }
    }

    /// Runs until the retry budget is spent, then returns the terminal error.
    pub async fn run<L: NetworkLink>(&mut self, link: &mut L) -> GatewayError {
        loop {
            let signal = link.next_signal().await;
            if let Err(e) = self.step(link, signal).await {
                return e;
            }
        }
    }
}
