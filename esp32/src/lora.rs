use embassy_embedded_hal::shared_bus::asynch::spi::SpiDevice;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use embassy_time::{Delay, Duration, with_timeout};
use esp_hal::{
    Async,
    gpio::{AnyPin, Input, InputConfig, Level, Output, OutputConfig},
    spi::master::{Config as SpiConfig, Spi},
    time::Rate,
};
use log::{info, warn};
use lora_mqtt_gateway::radio::Radio;
use lora_phy::mod_params::*;
use lora_phy::{
    LoRa, RxMode,
    iv::GenericSx127xInterfaceVariant,
    sx127x::{Config, Sx127x, Sx1276},
};
use static_cell::StaticCell;

/// Preamble length in symbols.
const PREAMBLE_LEN: u16 = 8;
/// Largest payload the SX1276 FIFO can hand back.
const FIFO_LEN: usize = 255;
/// How long one readiness check listens before giving up.
const RX_WINDOW_MS: u64 = 50;

/// SPI and control lines of the TTGO LoRa32 module.
pub struct LoraGpios<'a> {
    pub cs: AnyPin<'a>,
    pub reset: AnyPin<'a>,
    pub dio0: AnyPin<'a>,
    pub sck: AnyPin<'a>,
    pub miso: AnyPin<'a>,
    pub mosi: AnyPin<'a>,
}

pub type LoraRadio = LoRa<
    Sx127x<
        SpiDevice<'static, CriticalSectionRawMutex, Spi<'static, Async>, Output<'static>>,
        GenericSx127xInterfaceVariant<Output<'static>, Input<'static>>,
        Sx1276,
    >,
    Delay,
>;

static SPI_BUS: StaticCell<Mutex<CriticalSectionRawMutex, Spi<'static, Async>>> =
    StaticCell::new();

#[derive(Debug)]
pub enum LoraError {
    Spi(esp_hal::spi::master::ConfigError),
    Driver(RadioError),
    /// Modulation has not been configured yet.
    NotConfigured,
    /// Read without a received packet waiting.
    NoPacket,
}

impl From<RadioError> for LoraError {
    fn from(e: RadioError) -> Self {
        LoraError::Driver(e)
    }
}

/// Link parameters derived from frequency and CRC setting.
struct Params {
    modulation: ModulationParams,
    tx: PacketParams,
    rx: PacketParams,
}

/// SX1276 behind the `Radio` seam.
pub struct SxRadio {
    lora: LoraRadio,
    frequency_hz: u32,
    crc: bool,
    tx_power_dbm: i32,
    params: Option<Params>,
    receiving: bool,
    fifo: [u8; FIFO_LEN],
    /// Length of the packet waiting in `fifo`.
    ready: Option<usize>,
    rssi: i16,
    snr: f32,
}

impl SxRadio {
    /// Wires the SPI bus and control lines and creates the driver.
    pub async fn new(
        spi_peripheral: esp_hal::peripherals::SPI2<'static>,
        gpios: LoraGpios<'static>,
        tx_power_dbm: i32,
    ) -> Result<Self, LoraError> {
        let spi = Spi::new(
            spi_peripheral,
            SpiConfig::default().with_frequency(Rate::from_mhz(1)),
        )
        .map_err(LoraError::Spi)?
        .with_sck(gpios.sck)
        .with_mosi(gpios.mosi)
        .with_miso(gpios.miso)
        .into_async();

        let spi_bus = SPI_BUS.init(Mutex::new(spi));
        let cs = Output::new(gpios.cs, Level::High, OutputConfig::default());
        let spi_device = SpiDevice::new(spi_bus, cs);

        let reset = Output::new(gpios.reset, Level::High, OutputConfig::default());
        let dio0 = Input::new(gpios.dio0, InputConfig::default());
        let iv = GenericSx127xInterfaceVariant::new(reset, dio0, None, None)?;

        let config = Config {
            chip: Sx1276,
            tcxo_used: false,
            tx_boost: false,
            rx_boost: false,
        };
        // Private network sync word, the SX127x power-on default.
        let lora = LoRa::new(Sx127x::new(spi_device, iv, config), false, Delay).await?;

        Ok(Self {
            lora,
            frequency_hz: 0,
            crc: false,
            tx_power_dbm,
            params: None,
            receiving: false,
            fifo: [0; FIFO_LEN],
            ready: None,
            rssi: 0,
            snr: 0.0,
        })
    }

    fn configure(&mut self) -> Result<(), LoraError> {
        let modulation = self.lora.create_modulation_params(
            SpreadingFactor::_7,
            Bandwidth::_125KHz,
            CodingRate::_4_5,
            self.frequency_hz,
        )?;
        let tx = self
            .lora
            .create_tx_packet_params(PREAMBLE_LEN, false, self.crc, false, &modulation)?;
        let rx = self.lora.create_rx_packet_params(
            PREAMBLE_LEN,
            false,
            FIFO_LEN as u8,
            self.crc,
            false,
            &modulation,
        )?;
        self.params = Some(Params { modulation, tx, rx });
        self.receiving = false;
        Ok(())
    }
}

impl Radio for SxRadio {
    type Error = LoraError;

    async fn init(&mut self) -> Result<(), LoraError> {
        self.lora.init().await?;
        self.params = None;
        self.receiving = false;
        Ok(())
    }

    async fn set_frequency(&mut self, hz: u32) -> Result<(), LoraError> {
        self.frequency_hz = hz;
        self.configure()
    }

    async fn enable_crc(&mut self) -> Result<(), LoraError> {
        self.crc = true;
        self.configure()
    }

    async fn begin_receive(&mut self) -> Result<(), LoraError> {
        if self.receiving {
            return Ok(());
        }
        let params = self.params.as_ref().ok_or(LoraError::NotConfigured)?;
        self.lora
            .prepare_for_rx(RxMode::Continuous, &params.modulation, &params.rx)
            .await?;
        self.receiving = true;
        Ok(())
    }

    async fn packet_ready(&mut self) -> bool {
        if self.ready.is_some() {
            return true;
        }
        let Some(params) = self.params.as_ref() else {
            return false;
        };
        let window = Duration::from_millis(RX_WINDOW_MS);
        match with_timeout(window, self.lora.rx(&params.rx, &mut self.fifo)).await {
            Ok(Ok((len, status))) => {
                self.ready = Some(len as usize);
                self.rssi = status.rssi;
                self.snr = status.snr as f32;
                true
            }
            Ok(Err(e)) => {
                warn!("LoRa RX error: {:?}", e);
                self.receiving = false;
                false
            }
            Err(_) => false,
        }
    }

    async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize, LoraError> {
        let len = self.ready.take().ok_or(LoraError::NoPacket)?;
        let n = len.min(buf.len());
        buf[..n].copy_from_slice(&self.fifo[..n]);
        Ok(len)
    }

    fn last_rssi(&self) -> i16 {
        self.rssi
    }

    fn last_snr(&self) -> f32 {
        self.snr
    }

    async fn send_packet(&mut self, data: &[u8]) -> Result<(), LoraError> {
        let params = self.params.as_mut().ok_or(LoraError::NotConfigured)?;
        self.receiving = false;
        self.lora
            .prepare_for_tx(&params.modulation, &mut params.tx, self.tx_power_dbm, data)
            .await?;
        self.lora.tx().await?;
        info!("LoRa TX of {} bytes at {} dBm", data.len(), self.tx_power_dbm);
        Ok(())
    }
}
