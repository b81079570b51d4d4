use alloc::string::String;

use embassy_futures::select::{Either, select};
use embassy_net::{Config as NetConfig, DhcpConfig, Runner, Stack, StackResources};
use embassy_time::Timer;
use esp_hal::peripherals::WIFI;
use esp_hal::rng::Rng;
use esp_radio::wifi::{
    ClientConfig, ModeConfig, WifiController, WifiDevice, WifiError, WifiEvent,
};
use log::{info, warn};
use lora_mqtt_gateway::connectivity::{Connectivity, ConnectivityStatus, LinkSignal, NetworkLink};
use lora_mqtt_gateway::error::GatewayError;
use lora_mqtt_gateway::supervisor::Supervisor;
use static_cell::StaticCell;

/// Pause before retrying a station start that failed.
const START_RETRY_MS: u64 = 1000;
/// Sockets: the MQTT session plus DHCP and DNS.
const SOCKET_COUNT: usize = 4;

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<SOCKET_COUNT>> = StaticCell::new();

#[derive(Debug)]
pub enum NetworkInitError {
    Radio(esp_radio::InitializationError),
    Wifi(WifiError),
    Spawn(embassy_executor::SpawnError),
}

/// Brings up the radio controller and a DHCP network stack on the station
/// interface. The runner still has to be spawned with [`net_task`].
pub fn bring_up(
    wifi: WIFI<'static>,
) -> Result<
    (
        WifiController<'static>,
        Stack<'static>,
        Runner<'static, WifiDevice<'static>>,
    ),
    NetworkInitError,
> {
    let radio = RADIO.init(esp_radio::init().map_err(NetworkInitError::Radio)?);
    let (controller, interfaces) =
        esp_radio::wifi::new(radio, wifi, Default::default()).map_err(NetworkInitError::Wifi)?;

    let rng = Rng::new();
    let seed = u64::from(rng.random()) << 32 | u64::from(rng.random());
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        NetConfig::dhcpv4(DhcpConfig::default()),
        NET_RESOURCES.init(StackResources::new()),
        seed,
    );
    Ok((controller, stack, runner))
}

/// Where the station is in its bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Started,
    Associated,
    Up,
}

/// Station-mode WiFi as seen by the connectivity state machine.
pub struct WifiLink {
    controller: WifiController<'static>,
    stack: Stack<'static>,
    phase: Phase,
}

impl WifiLink {
    pub fn new(
        mut controller: WifiController<'static>,
        stack: Stack<'static>,
        ssid: &str,
        password: &str,
    ) -> Result<Self, GatewayError> {
        let client = ClientConfig::default()
            .with_ssid(String::from(ssid))
            .with_password(String::from(password));
        controller
            .set_config(&ModeConfig::Client(client))
            .map_err(|e| {
                warn!("Failed to set WiFi configuration: {:?}", e);
                GatewayError::InvalidConfig("WiFi station configuration rejected")
            })?;
        info!("WiFi station configured for SSID {}", ssid);
        Ok(Self {
            controller,
            stack,
            phase: Phase::Stopped,
        })
    }
}

impl NetworkLink for WifiLink {
    async fn next_signal(&mut self) -> LinkSignal {
        match self.phase {
            Phase::Stopped => match self.controller.start_async().await {
                Ok(()) => {
                    info!("WiFi station started");
                    self.phase = Phase::Started;
                    LinkSignal::StationStarted
                }
                Err(e) => {
                    warn!("WiFi start failed: {:?}", e);
                    Timer::after_millis(START_RETRY_MS).await;
                    LinkSignal::Disconnected
                }
            },
            Phase::Associated => {
                match select(
                    self.stack.wait_config_up(),
                    self.controller.wait_for_event(WifiEvent::StaDisconnected),
                )
                .await
                {
                    Either::First(()) => {
                        if let Some(config) = self.stack.config_v4() {
                            info!("got ip:{}", config.address.address());
                        }
                        self.phase = Phase::Up;
                        LinkSignal::IpAcquired
                    }
                    Either::Second(()) => {
                        self.phase = Phase::Started;
                        LinkSignal::Disconnected
                    }
                }
            }
            Phase::Started | Phase::Up => {
                self.controller
                    .wait_for_event(WifiEvent::StaDisconnected)
                    .await;
                warn!("WiFi station disconnected");
                self.phase = Phase::Started;
                LinkSignal::Disconnected
            }
        }
    }

    async fn connect(&mut self) -> Result<(), GatewayError> {
        match self.controller.connect_async().await {
            Ok(()) => {
                info!("WiFi associated");
                self.phase = Phase::Associated;
                Ok(())
            }
            Err(e) => {
                warn!("WiFi connect failed: {:?}", e);
                Err(GatewayError::Transport { code: -1 })
            }
        }
    }
}

#[embassy_executor::task]
pub async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await;
}

/// Drives the station until the retry budget is spent, then hands the
/// fault to the supervisor.
#[embassy_executor::task]
pub async fn connectivity_task(
    mut link: WifiLink,
    max_retries: u8,
    status: &'static ConnectivityStatus,
    supervisor: &'static Supervisor,
) {
    let mut connectivity = Connectivity::new(max_retries, status);
    let fault = connectivity.run(&mut link).await;
    supervisor.report(fault);
}
