//! Compile-time configuration.
//!
//! Every setting is baked into the image through environment variables set in
//! `.cargo/config.toml` (`[env]`). Missing or malformed values fall back to a
//! default with a warning; [`GatewayConfig::validate`] rejects the values the
//! firmware cannot run with.

use core::str::FromStr;

use log::{info, warn};

use crate::error::{GatewayError, Result};

/// Static role of the radio task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioRole {
    Receiver,
    Transmitter,
}

impl RadioRole {
    /// Name used as MQTT client id and station hostname.
    pub const fn tag(self) -> &'static str {
        match self {
            RadioRole::Receiver => "ttgo_receiver",
            RadioRole::Transmitter => "ttgo_sender",
        }
    }
}

impl FromStr for RadioRole {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("receiver") || s.eq_ignore_ascii_case("rx") {
            Ok(RadioRole::Receiver)
        } else if s.eq_ignore_ascii_case("transmitter") || s.eq_ignore_ascii_case("tx") {
            Ok(RadioRole::Transmitter)
        } else {
            Err(GatewayError::InvalidConfig("unknown radio role"))
        }
    }
}

/// MQTT topics the gateway talks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topics {
    /// Button presses, bridge announcements and command echoes.
    pub status: &'static str,
    /// Subscribed at session start; payloads are echoed to `status`.
    pub command: &'static str,
    /// Packets heard by the receiver role.
    pub receiver: &'static str,
    /// Confirmations of the transmitter role.
    pub sender: &'static str,
}

impl Topics {
    pub const DEFAULT: Topics = Topics {
        status: "ttgo/pub",
        command: "ttgo/sub",
        receiver: "ttgo/receiver",
        sender: "ttgo/sender",
    };
}

const DEFAULT_BROKER_URI: &str = "mqtt://192.168.1.10:1883";
const DEFAULT_MAX_RETRIES: u8 = 2;
const DEFAULT_LED_LINE: u8 = 2;
const DEFAULT_BUTTON_LINE: u8 = 0;
const DEFAULT_FREQUENCY_HZ: u32 = 868_000_000;
const DEFAULT_TX_POWER_DBM: i32 = 14;
const DEFAULT_RESTART_AFTER_SECS: u32 = 60;

const MAX_SSID_LEN: usize = 32;
const MAX_PASSWORD_LEN: usize = 64;

/// Everything the firmware needs to know at boot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewayConfig {
    pub broker_uri: &'static str,
    pub wifi_ssid: &'static str,
    pub wifi_password: &'static str,
    /// Failed association attempts tolerated before giving up.
    pub max_retries: u8,
    pub led_line: u8,
    pub button_line: u8,
    pub radio_role: RadioRole,
    pub lora_frequency_hz: u32,
    pub lora_tx_power_dbm: i32,
    /// `None` disables the scheduled restart.
    pub restart_after_secs: Option<u32>,
    pub topics: Topics,
}

fn compiled_env(name: &str) -> Option<&'static str> {
    match name {
        "GATEWAY_BROKER_URI" => option_env!("GATEWAY_BROKER_URI"),
        "GATEWAY_WIFI_SSID" => option_env!("GATEWAY_WIFI_SSID"),
        "GATEWAY_WIFI_PASSWORD" => option_env!("GATEWAY_WIFI_PASSWORD"),
        "GATEWAY_MAX_RETRIES" => option_env!("GATEWAY_MAX_RETRIES"),
        "GATEWAY_LED_LINE" => option_env!("GATEWAY_LED_LINE"),
        "GATEWAY_BUTTON_LINE" => option_env!("GATEWAY_BUTTON_LINE"),
        "GATEWAY_RADIO_ROLE" => option_env!("GATEWAY_RADIO_ROLE"),
        "LORA_FREQUENCY_HZ" => option_env!("LORA_FREQUENCY_HZ"),
        "LORA_TX_POWER_DBM" => option_env!("LORA_TX_POWER_DBM"),
        "GATEWAY_RESTART_AFTER_SECS" => option_env!("GATEWAY_RESTART_AFTER_SECS"),
        _ => None,
    }
}

impl GatewayConfig {
    /// Reads the values compiled into the image.
    pub fn from_env() -> Self {
        Self::from_lookup(compiled_env)
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<&'static str>) -> Self {
        let broker_uri = lookup("GATEWAY_BROKER_URI").unwrap_or_else(|| {
            info!("Broker URI not configured, using {}", DEFAULT_BROKER_URI);
            DEFAULT_BROKER_URI
        });
        let wifi_ssid = lookup("GATEWAY_WIFI_SSID").unwrap_or("");
        let wifi_password = lookup("GATEWAY_WIFI_PASSWORD").unwrap_or("");

        let max_retries = parse_setting(
            "GATEWAY_MAX_RETRIES",
            lookup("GATEWAY_MAX_RETRIES"),
            DEFAULT_MAX_RETRIES,
            |v| *v >= 1,
        );
        let led_line = parse_setting(
            "GATEWAY_LED_LINE",
            lookup("GATEWAY_LED_LINE"),
            DEFAULT_LED_LINE,
            is_gpio_line,
        );
        let button_line = parse_setting(
            "GATEWAY_BUTTON_LINE",
            lookup("GATEWAY_BUTTON_LINE"),
            DEFAULT_BUTTON_LINE,
            is_gpio_line,
        );
        let radio_role = parse_setting(
            "GATEWAY_RADIO_ROLE",
            lookup("GATEWAY_RADIO_ROLE"),
            RadioRole::Receiver,
            |_| true,
        );

        // Valid ISM bands: 433.05-434.79 MHz (worldwide), 863-870 MHz (EU), 902-928 MHz (US)
        let lora_frequency_hz = parse_setting(
            "LORA_FREQUENCY_HZ",
            lookup("LORA_FREQUENCY_HZ"),
            DEFAULT_FREQUENCY_HZ,
            |v| {
                (433_050_000..=434_790_000).contains(v)
                    || (863_000_000..=870_000_000).contains(v)
                    || (902_000_000..=928_000_000).contains(v)
            },
        );
        // SX1276 supports -4 dBm to +20 dBm on PA_BOOST pin
        let lora_tx_power_dbm = parse_setting(
            "LORA_TX_POWER_DBM",
            lookup("LORA_TX_POWER_DBM"),
            DEFAULT_TX_POWER_DBM,
            |v| (-4..=20).contains(v),
        );

        let restart_after_secs = match parse_setting(
            "GATEWAY_RESTART_AFTER_SECS",
            lookup("GATEWAY_RESTART_AFTER_SECS"),
            DEFAULT_RESTART_AFTER_SECS,
            |_| true,
        ) {
            0 => None,
            secs => Some(secs),
        };

        Self {
            broker_uri,
            wifi_ssid,
            wifi_password,
            max_retries,
            led_line,
            button_line,
            radio_role,
            lora_frequency_hz,
            lora_tx_power_dbm,
            restart_after_secs,
            topics: Topics::DEFAULT,
        }
    }

    /// Rejects configurations the firmware cannot boot with.
    pub fn validate(&self) -> Result<()> {
        if self.wifi_ssid.is_empty() {
            return Err(GatewayError::InvalidConfig("GATEWAY_WIFI_SSID is empty"));
        }
        if self.wifi_ssid.len() > MAX_SSID_LEN {
            return Err(GatewayError::InvalidConfig("GATEWAY_WIFI_SSID is too long"));
        }
        if self.wifi_password.len() > MAX_PASSWORD_LEN {
            return Err(GatewayError::InvalidConfig(
                "GATEWAY_WIFI_PASSWORD is too long",
            ));
        }
        if self.led_line == self.button_line {
            return Err(GatewayError::InvalidConfig(
                "LED and button share the same line",
            ));
        }
        BrokerUri::parse(self.broker_uri)?;
        Ok(())
    }

    pub fn broker(&self) -> Result<BrokerUri<'static>> {
        BrokerUri::parse(self.broker_uri)
    }
}

fn is_gpio_line(line: &u8) -> bool {
    *line <= 39
}

/// Parses one setting, logging which value ends up being used.
fn parse_setting<T>(
    name: &str,
    raw: Option<&str>,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T
where
    T: FromStr + core::fmt::Debug,
{
    let Some(raw) = raw else {
        info!("{} not configured, using default {:?}", name, default);
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) if valid(&v) => {
            info!("Using {} from config: {:?}", name, v);
            v
        }
        Ok(v) => {
            warn!("{} value {:?} out of range, using default {:?}", name, v, default);
            default
        }
        Err(_) => {
            warn!("Invalid {} value '{}', using default {:?}", name, raw, default);
            default
        }
    }
}

/// Parsed form of `mqtt[s]://[user[:password]@]host[:port]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerUri<'a> {
    /// `mqtts://` asks for a secure channel.
    pub secure: bool,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub host: &'a str,
    pub port: u16,
}

impl<'a> BrokerUri<'a> {
    pub fn parse(uri: &'a str) -> Result<Self> {
        let (secure, rest) = if let Some(rest) = uri.strip_prefix("mqtt://") {
            (false, rest)
        } else if let Some(rest) = uri.strip_prefix("mqtts://") {
            (true, rest)
        } else {
            return Err(GatewayError::InvalidConfig(
                "broker URI must start with mqtt:// or mqtts://",
            ));
        };
        let rest = rest.trim_end_matches('/');

        let (credentials, authority) = match rest.rsplit_once('@') {
            Some((credentials, authority)) => (Some(credentials), authority),
            None => (None, rest),
        };
        let (username, password) = match credentials {
            Some(credentials) => match credentials.split_once(':') {
                Some((user, pass)) => (Some(user), Some(pass)),
                None => (Some(credentials), None),
            },
            None => (None, None),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| GatewayError::InvalidConfig("broker port is not a number"))?;
                (host, port)
            }
            None => (authority, if secure { 8883 } else { 1883 }),
        };
        if host.is_empty() {
            return Err(GatewayError::InvalidConfig("broker host is empty"));
        }
        if port == 0 {
            return Err(GatewayError::InvalidConfig("broker port is zero"));
        }

        Ok(Self {
            secure,
            username: username.filter(|u| !u.is_empty()),
            password,
            host,
            port,
        })
    }
}
