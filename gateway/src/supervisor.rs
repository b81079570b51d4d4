//! Boot ordering, fault escalation and the restart contract.
//!
//! Collaborators come up in a fixed order and any failure on the way is
//! fatal. Once running, the process has exactly one way out: an explicit
//! restart, requested either by the scheduled countdown or by a fault that
//! has no local recovery.

use core::fmt;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embedded_hal_async::delay::DelayNs;
use log::{error, info, warn};

use crate::error::{GatewayError, Result};

/// Boot stages in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootStage {
    Storage,
    NetworkStack,
    Connectivity,
    PublishBridge,
    Radio,
    Gpio,
}

impl BootStage {
    pub const ORDER: [BootStage; 6] = [
        BootStage::Storage,
        BootStage::NetworkStack,
        BootStage::Connectivity,
        BootStage::PublishBridge,
        BootStage::Radio,
        BootStage::Gpio,
    ];
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootStage::Storage => "storage",
            BootStage::NetworkStack => "network stack",
            BootStage::Connectivity => "connectivity",
            BootStage::PublishBridge => "publish bridge",
            BootStage::Radio => "radio",
            BootStage::Gpio => "gpio",
        })
    }
}

/// Tracks boot progress and turns collaborator failures into fatal errors.
#[derive(Debug, Default)]
pub struct Bootstrap {
    completed: usize,
}

impl Bootstrap {
    pub const fn new() -> Self {
        Self { completed: 0 }
    }

    /// Stage that must complete next, `None` once boot is done.
    pub fn next_stage(&self) -> Option<BootStage> {
        BootStage::ORDER.get(self.completed).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.completed == BootStage::ORDER.len()
    }

    /// Records the outcome of `stage`.
    ///
    /// Stages out of order and collaborator errors both come back as
    /// `InitializationFailure(stage)`; the caller is expected to abort.
    pub fn complete<T, E: fmt::Debug>(
        &mut self,
        stage: BootStage,
        outcome: core::result::Result<T, E>,
    ) -> Result<T> {
        if self.next_stage() != Some(stage) {
            error!(
                "{} brought up out of order (expected {:?})",
                stage,
                self.next_stage()
            );
            return Err(GatewayError::InitializationFailure(stage));
        }
        match outcome {
            Ok(value) => {
                self.completed += 1;
                info!("++ {} ready", stage);
                Ok(value)
            }
            Err(e) => {
                error!("{} failed to initialize: {:?}", stage, e);
                Err(GatewayError::InitializationFailure(stage))
            }
        }
    }
}

/// Why the process is about to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The scheduled countdown ran out.
    Countdown,
    /// A fault without local recovery was reported.
    Fault(GatewayError),
}

/// Process control provided by the platform.
pub trait SystemControl {
    /// Resets the chip. Never returns.
    fn restart(&mut self, reason: ShutdownReason) -> !;
}

/// Collects faults from the tasks and decides when to restart.
pub struct Supervisor {
    faults: Signal<CriticalSectionRawMutex, GatewayError>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub const fn new() -> Self {
        Self {
            faults: Signal::new(),
        }
    }

    /// Reports a fault that the reporting task cannot recover from.
    pub fn report(&self, fault: GatewayError) {
        error!("Fault reported to supervisor: {}", fault);
        self.faults.signal(fault);
    }

    /// Waits for the first reason to restart.
    ///
    /// With `countdown_secs` set the restart is scheduled unconditionally,
    /// logging every remaining second; a reported fault cuts it short.
    pub async fn watch<D: DelayNs>(
        &self,
        delay: &mut D,
        countdown_secs: Option<u32>,
    ) -> ShutdownReason {
        let reason = match countdown_secs {
            Some(secs) => match select(self.faults.wait(), countdown(delay, secs)).await {
                Either::First(fault) => ShutdownReason::Fault(fault),
                Either::Second(()) => ShutdownReason::Countdown,
            },
            None => ShutdownReason::Fault(self.faults.wait().await),
        };
        warn!("Restarting now ({:?})", reason);
        reason
    }
}

async fn countdown<D: DelayNs>(delay: &mut D, secs: u32) {
    for remaining in (0..=secs).rev() {
        info!("Restarting in {}...", remaining);
        delay.delay_ms(1000).await;
    }
}

/// Logs a fatal boot error and hands control to the platform reset.
pub fn abort_boot<S: SystemControl>(system: &mut S, err: GatewayError) -> ! {
    error!("Boot aborted: {}", err);
    system.restart(ShutdownReason::Fault(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    struct CountingDelay {
        ms: u32,
    }

    impl DelayNs for CountingDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.ms += ns / 1_000_000;
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.ms += ms;
        }
    }

    #[test]
    fn test_stages_complete_in_order() {
        let mut boot = Bootstrap::new();
        for stage in BootStage::ORDER {
            assert_eq!(boot.next_stage(), Some(stage));
            assert_eq!(boot.complete(stage, Ok::<_, ()>(stage)), Ok(stage));
        }
        assert!(boot.is_complete());
        assert_eq!(boot.next_stage(), None);
    }

    #[test]
    fn test_out_of_order_stage_is_fatal() {
        let mut boot = Bootstrap::new();
        let err = boot.complete(BootStage::Radio, Ok::<(), ()>(())).unwrap_err();
        assert_eq!(err, GatewayError::InitializationFailure(BootStage::Radio));
        assert!(err.is_fatal());
        assert_eq!(boot.next_stage(), Some(BootStage::Storage));
    }

    #[test]
    fn test_collaborator_failure_stops_boot() {
        let mut boot = Bootstrap::new();
        boot.complete(BootStage::Storage, Ok::<(), &str>(())).unwrap();
        let err = boot
            .complete(BootStage::NetworkStack, Err::<(), _>("no radio"))
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::InitializationFailure(BootStage::NetworkStack)
        );
        // The failed stage stays pending.
        assert_eq!(boot.next_stage(), Some(BootStage::NetworkStack));
    }

    #[test]
    fn test_countdown_ends_in_restart() {
        let supervisor = Supervisor::new();
        let mut delay = CountingDelay { ms: 0 };
        let reason = block_on(supervisor.watch(&mut delay, Some(3)));
        assert_eq!(reason, ShutdownReason::Countdown);
        assert_eq!(delay.ms, 4000);
    }

    #[test]
    fn test_reported_fault_preempts_countdown() {
        let supervisor = Supervisor::new();
        let fault = GatewayError::ConnectivityExhausted { attempts: 2 };
        supervisor.report(fault);
        let mut delay = CountingDelay { ms: 0 };
        let reason = block_on(supervisor.watch(&mut delay, Some(60)));
        assert_eq!(reason, ShutdownReason::Fault(fault));
        assert_eq!(delay.ms, 0);
    }

    #[test]
    fn test_without_countdown_only_faults_restart() {
        let supervisor = Supervisor::new();
        supervisor.report(GatewayError::Radio);
        let mut delay = CountingDelay { ms: 0 };
        let reason = block_on(supervisor.watch(&mut delay, None));
        assert_eq!(reason, ShutdownReason::Fault(GatewayError::Radio));
    }
}
