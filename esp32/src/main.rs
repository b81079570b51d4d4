#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

extern crate alloc;

mod button;
mod lora;
mod mqtt;
mod wifi;

use core::fmt::Debug;

use embassy_executor::Spawner;
use embassy_time::Delay;
use esp_backtrace as _;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{AnyPin, Io, Level, Output, OutputConfig, Pin};
use esp_hal::timer::timg::TimerGroup;
use log::{error, info, warn};
use lora_mqtt_gateway::bridge::{BridgeEvent, BridgeRunner, BridgeSlot, PublishBridge, Publisher};
use lora_mqtt_gateway::config::{GatewayConfig, RadioRole};
use lora_mqtt_gateway::connectivity::{ConnectionState, ConnectivityStatus};
use lora_mqtt_gateway::error::GatewayError;
use lora_mqtt_gateway::gpio::{GpioDrain, GpioEventQueue};
use lora_mqtt_gateway::radio::{RadioTask, Receiver, Transmitter};
use lora_mqtt_gateway::supervisor::{
    BootStage, Bootstrap, ShutdownReason, Supervisor, SystemControl, abort_boot,
};

use crate::button::ButtonLevel;
use crate::lora::{LoraGpios, SxRadio};
use crate::mqtt::MqttSessions;
use crate::wifi::WifiLink;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

/// Poll interval of the boot gate waiting for the station to settle.
const LINK_POLL_MS: u32 = 100;

static SUPERVISOR: Supervisor = Supervisor::new();
static BRIDGE: BridgeSlot = BridgeSlot::new();
static STATUS: ConnectivityStatus = ConnectivityStatus::new();
pub static GPIO_EVENTS: GpioEventQueue = GpioEventQueue::new();

struct Chip;

impl SystemControl for Chip {
    fn restart(&mut self, reason: ShutdownReason) -> ! {
        warn!("Restarting now ({:?}).", reason);
        esp_hal::system::software_reset()
    }
}

/// Completes a boot stage or restarts the chip.
fn ready<T, E: Debug>(boot: &mut Bootstrap, stage: BootStage, outcome: Result<T, E>) -> T {
    match boot.complete(stage, outcome) {
        Ok(value) => value,
        Err(e) => abort_boot(&mut Chip, e),
    }
}

/// Pins that can be assigned to the button or the LED at build time.
struct Pins {
    gpio0: Option<AnyPin<'static>>,
    gpio2: Option<AnyPin<'static>>,
    gpio4: Option<AnyPin<'static>>,
    gpio12: Option<AnyPin<'static>>,
    gpio13: Option<AnyPin<'static>>,
    gpio25: Option<AnyPin<'static>>,
    gpio34: Option<AnyPin<'static>>,
    gpio35: Option<AnyPin<'static>>,
    gpio36: Option<AnyPin<'static>>,
    gpio39: Option<AnyPin<'static>>,
}

/// Button lines the firmware can arm. Input-only pins are fine here.
fn button_pin(pins: &mut Pins, line: u8) -> Option<AnyPin<'static>> {
    match line {
        0 => pins.gpio0.take(),
        34 => pins.gpio34.take(),
        35 => pins.gpio35.take(),
        36 => pins.gpio36.take(),
        39 => pins.gpio39.take(),
        _ => None,
    }
}

/// LED lines the firmware can drive.
fn led_pin(pins: &mut Pins, line: u8) -> Option<AnyPin<'static>> {
    match line {
        2 => pins.gpio2.take(),
        4 => pins.gpio4.take(),
        12 => pins.gpio12.take(),
        13 => pins.gpio13.take(),
        25 => pins.gpio25.take(),
        _ => None,
    }
}

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    esp_println::logger::init_logger_from_env();
    info!("[APP] Startup..");

    let config = GatewayConfig::from_env();
    if let Err(e) = config.validate() {
        abort_boot(&mut Chip, e);
    }

    let peripherals = esp_hal::init(esp_hal::Config::default().with_cpu_clock(CpuClock::max()));
    let mut boot = Bootstrap::new();

    esp_alloc::heap_allocator!(#[unsafe(link_section = ".dram2_uninit")] size: 98_767);
    ready(&mut boot, BootStage::Storage, Ok::<(), ()>(()));

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    let network = wifi::bring_up(peripherals.WIFI).and_then(|(controller, stack, runner)| {
        spawner
            .spawn(wifi::net_task(runner))
            .map_err(wifi::NetworkInitError::Spawn)?;
        Ok((controller, stack))
    });
    let (controller, stack) = ready(&mut boot, BootStage::NetworkStack, network);

    // Connectivity: the gate only opens once the station holds an address.
    let link = match WifiLink::new(controller, stack, config.wifi_ssid, config.wifi_password) {
        Ok(link) => link,
        Err(e) => abort_boot(&mut Chip, e),
    };
    let settled = match spawner.spawn(wifi::connectivity_task(
        link,
        config.max_retries,
        &STATUS,
        &SUPERVISOR,
    )) {
        Ok(()) => STATUS.wait_settled(&mut Delay, LINK_POLL_MS).await,
        Err(e) => {
            error!("Failed to spawn connectivity task: {:?}", e);
            ConnectionState::Failed
        }
    };
    let settled = match settled {
        ConnectionState::Connected => Ok(()),
        other => Err(other),
    };
    ready(&mut boot, BootStage::Connectivity, settled);

    // Publish bridge.
    let broker = match config.broker() {
        Ok(broker) if broker.secure => Err(GatewayError::InvalidConfig(
            "mqtts:// is not supported by this firmware",
        )),
        other => other,
    };
    let bridge = broker.and_then(|broker| {
        let bridge = BRIDGE.install()?;
        let sessions = MqttSessions::new(stack, broker, config.radio_role.tag());
        spawner
            .spawn(mqtt::mqtt_task(
                BridgeRunner::new(bridge, config.topics),
                sessions,
                &STATUS,
            ))
            .map_err(|_| GatewayError::InitializationFailure(BootStage::PublishBridge))?;
        Ok(bridge)
    });
    let bridge = ready(&mut boot, BootStage::PublishBridge, bridge);
    let publisher = Publisher::new(&BRIDGE);

    // Radio. Pins are fixed by the TTGO LoRa32 board.
    let gpios = LoraGpios {
        cs: peripherals.GPIO18.degrade(),
        reset: peripherals.GPIO14.degrade(),
        dio0: peripherals.GPIO26.degrade(),
        sck: peripherals.GPIO5.degrade(),
        miso: peripherals.GPIO19.degrade(),
        mosi: peripherals.GPIO27.degrade(),
    };
    let radio = SxRadio::new(peripherals.SPI2, gpios, config.lora_tx_power_dbm)
        .await
        .map_err(|e| {
            error!("Failed to create LoRa radio: {:?}", e);
            GatewayError::Radio
        });
    let radio_up = match radio {
        Ok(radio) => start_radio(&spawner, radio, &config, publisher).await,
        Err(e) => Err(e),
    };
    ready(&mut boot, BootStage::Radio, radio_up);

    // GPIO: LED off, button armed, drain running.
    let mut pins = Pins {
        gpio0: Some(peripherals.GPIO0.degrade()),
        gpio2: Some(peripherals.GPIO2.degrade()),
        gpio4: Some(peripherals.GPIO4.degrade()),
        gpio12: Some(peripherals.GPIO12.degrade()),
        gpio13: Some(peripherals.GPIO13.degrade()),
        gpio25: Some(peripherals.GPIO25.degrade()),
        gpio34: Some(peripherals.GPIO34.degrade()),
        gpio35: Some(peripherals.GPIO35.degrade()),
        gpio36: Some(peripherals.GPIO36.degrade()),
        gpio39: Some(peripherals.GPIO39.degrade()),
    };
    let gpio_up = match (
        led_pin(&mut pins, config.led_line),
        button_pin(&mut pins, config.button_line),
    ) {
        (Some(led), Some(button)) => {
            let led = Output::new(led, Level::Low, OutputConfig::default());
            let mut io = Io::new(peripherals.IO_MUX);
            button::arm(&mut io, button, config.button_line);
            let drain = GpioDrain::new(&GPIO_EVENTS, ButtonLevel, publisher, config.topics.status);
            spawner
                .spawn(gpio_task(drain))
                .and_then(|()| spawner.spawn(status_task(led, bridge)))
                .map_err(|_| GatewayError::InitializationFailure(BootStage::Gpio))
        }
        _ => Err(GatewayError::InvalidConfig("LED or button line has no usable pin")),
    };
    ready(&mut boot, BootStage::Gpio, gpio_up);
    info!("++ esp WiFi, MQTT & LoRa connected");

    let reason = SUPERVISOR
        .watch(&mut Delay, config.restart_after_secs)
        .await;
    Chip.restart(reason)
}

/// Brings the radio up and spawns the task of the configured role.
async fn start_radio(
    spawner: &Spawner,
    radio: SxRadio,
    config: &GatewayConfig,
    publisher: Publisher<'static>,
) -> Result<(), GatewayError> {
    let spawned = match config.radio_role {
        RadioRole::Receiver => {
            let mut task = RadioTask::new(
                radio,
                Receiver::new(config.topics.receiver),
                Delay,
                publisher,
            );
            task.bring_up(config.lora_frequency_hz).await?;
            spawner.spawn(receiver_task(task))
        }
        RadioRole::Transmitter => {
            let mut task = RadioTask::new(
                radio,
                Transmitter::new(config.topics.sender),
                Delay,
                publisher,
            );
            task.bring_up(config.lora_frequency_hz).await?;
            spawner.spawn(transmitter_task(task))
        }
    };
    spawned.map_err(|_| GatewayError::InitializationFailure(BootStage::Radio))
}

#[embassy_executor::task]
async fn receiver_task(mut task: RadioTask<'static, SxRadio, Receiver, Delay>) {
    task.run().await
}

#[embassy_executor::task]
async fn transmitter_task(mut task: RadioTask<'static, SxRadio, Transmitter, Delay>) {
    task.run().await
}

#[embassy_executor::task]
async fn gpio_task(mut drain: GpioDrain<'static, ButtonLevel>) {
    drain.run().await
}

/// Follows the bridge events; the LED shows whether a session is up.
#[embassy_executor::task]
async fn status_task(mut led: Output<'static>, bridge: &'static PublishBridge) {
    loop {
        match bridge.next_event().await {
            BridgeEvent::Connected => led.set_high(),
            BridgeEvent::Disconnected => led.set_low(),
            BridgeEvent::Subscribed(id) => info!("MQTT_EVENT_SUBSCRIBED, msg_id={}", id.0),
            BridgeEvent::Unsubscribed(id) => info!("MQTT_EVENT_UNSUBSCRIBED, msg_id={}", id.0),
            BridgeEvent::Published(id) => info!("MQTT_EVENT_PUBLISHED, msg_id={}", id.0),
            BridgeEvent::Data { topic, payload } => {
                info!("MQTT_EVENT_DATA");
                info!("TOPIC={}", topic);
                info!("DATA={}", core::str::from_utf8(&payload).unwrap_or("<binary>"));
            }
            BridgeEvent::Error(e) => warn!("MQTT_EVENT_ERROR: {}", e),
        }
    }
}
