use core::net::Ipv4Addr;

use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::{ConnectError, Error as TcpError, TcpSocket};
use embassy_net::{IpAddress, Stack};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Delay, Duration, with_timeout};
use embedded_io_async::{ErrorType, Read, Write};
use log::{info, warn};
use lora_mqtt_gateway::bridge::{
    BridgeRunner, Payload, PubSubSession, QoS, SessionEvent, SessionFactory, Topic,
};
use lora_mqtt_gateway::config::BrokerUri;
use lora_mqtt_gateway::connectivity::ConnectivityStatus;
use lora_mqtt_gateway::error::ClientError;
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;
use static_cell::StaticCell;

const SOCKET_BUFFER_LEN: usize = 1024;
const PACKET_BUFFER_LEN: usize = 512;
const MAX_PROPERTIES: usize = 5;
const KEEPALIVE_SECS: u16 = 60;
const SOCKET_TIMEOUT_SECS: u64 = 10;
/// Pause between two session attempts.
const RECONNECT_BACKOFF_MS: u32 = 5000;

const ECONNRESET: i32 = 104;
const ETIMEDOUT: i32 = 110;
const EHOSTUNREACH: i32 = 113;
const EIO: i32 = 5;

static SOCKET_BUFFERS: StaticCell<([u8; SOCKET_BUFFER_LEN], [u8; SOCKET_BUFFER_LEN])> =
    StaticCell::new();

type SharedTcp = Mutex<NoopRawMutex, TcpSocket<'static>>;
type Client<'a> = MqttClient<'a, SharedSocket<'a>, MAX_PROPERTIES, CountingRng>;

/// The client's handle on the broker socket.
///
/// The session keeps a second handle to wait for readability without
/// starting a read, so a wait can be dropped without tearing a packet.
struct SharedSocket<'a>(&'a SharedTcp);

impl ErrorType for SharedSocket<'_> {
    type Error = TcpError;
}

impl Read for SharedSocket<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TcpError> {
        self.0.lock().await.read(buf).await
    }
}

impl Write for SharedSocket<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TcpError> {
        self.0.lock().await.write(buf).await
    }

    async fn flush(&mut self) -> Result<(), TcpError> {
        self.0.lock().await.flush().await
    }
}

fn qos(qos: QoS) -> QualityOfService {
    match qos {
        QoS::AtMostOnce => QualityOfService::QoS0,
        QoS::AtLeastOnce => QualityOfService::QoS1,
        QoS::ExactlyOnce => QualityOfService::QoS2,
    }
}

/// Maps a client reason code onto the layered error report.
fn classify(code: ReasonCode, connecting: bool) -> ClientError {
    match code {
        ReasonCode::NetworkError => ClientError::socket(ECONNRESET),
        ReasonCode::MalformedPacket | ReasonCode::ProtocolError | ReasonCode::BuffError => {
            ClientError::protocol()
        }
        other if connecting => ClientError::refused(other.into()),
        other => {
            warn!("MQTT client error: {:?}", other);
            ClientError::transport(-1)
        }
    }
}

fn connect_errno(e: ConnectError) -> i32 {
    match e {
        ConnectError::ConnectionReset => ECONNRESET,
        ConnectError::TimedOut => ETIMEDOUT,
        ConnectError::NoRoute => EHOSTUNREACH,
        _ => EIO,
    }
}

/// Opens MQTT v5 sessions over plain TCP. Every session reuses one socket.
pub struct MqttSessions {
    stack: Stack<'static>,
    broker: BrokerUri<'static>,
    client_id: &'static str,
    socket: SharedTcp,
    write_buf: [u8; PACKET_BUFFER_LEN],
    recv_buf: [u8; PACKET_BUFFER_LEN],
}

impl MqttSessions {
    pub fn new(stack: Stack<'static>, broker: BrokerUri<'static>, client_id: &'static str) -> Self {
        let (rx, tx) = SOCKET_BUFFERS.init(([0; SOCKET_BUFFER_LEN], [0; SOCKET_BUFFER_LEN]));
        let mut socket = TcpSocket::new(stack, rx, tx);
        socket.set_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)));
        Self {
            stack,
            broker,
            client_id,
            socket: Mutex::new(socket),
            write_buf: [0; PACKET_BUFFER_LEN],
            recv_buf: [0; PACKET_BUFFER_LEN],
        }
    }

    async fn resolve(&self) -> Result<IpAddress, ClientError> {
        if let Ok(ip) = self.broker.host.parse::<Ipv4Addr>() {
            return Ok(IpAddress::Ipv4(ip));
        }
        let addrs = self
            .stack
            .dns_query(self.broker.host, DnsQueryType::A)
            .await
            .map_err(|e| {
                warn!("DNS lookup of {} failed: {:?}", self.broker.host, e);
                ClientError::socket(EHOSTUNREACH)
            })?;
        addrs.first().copied().ok_or(ClientError::socket(EHOSTUNREACH))
    }
}

impl SessionFactory for MqttSessions {
    type Session<'s>
        = MqttSession<'s>
    where
        Self: 's;

    async fn open(&mut self) -> Result<MqttSession<'_>, ClientError> {
        let addr = self.resolve().await?;
        {
            let mut socket = self.socket.lock().await;
            // Drop whatever the previous session left behind.
            socket.abort();
            if let Err(e) = socket.flush().await {
                warn!("Flushing previous connection failed: {:?}", e);
            }
            info!("Connecting to broker {}:{}", self.broker.host, self.broker.port);
            socket
                .connect((addr, self.broker.port))
                .await
                .map_err(|e| {
                    warn!("TCP connect failed: {:?}", e);
                    ClientError::socket(connect_errno(e))
                })?;
        }

        let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20000));
        config.add_max_subscribe_qos(QualityOfService::QoS1);
        config.add_client_id(self.client_id);
        config.max_packet_size = PACKET_BUFFER_LEN as u32;
        config.keep_alive = KEEPALIVE_SECS;
        if let Some(username) = self.broker.username {
            config.add_username(username);
        }
        if let Some(password) = self.broker.password {
            config.add_password(password);
        }

        let mut client = MqttClient::new(
            SharedSocket(&self.socket),
            &mut self.write_buf,
            PACKET_BUFFER_LEN,
            &mut self.recv_buf,
            PACKET_BUFFER_LEN,
            config,
        );
        client
            .connect_to_broker()
            .await
            .map_err(|code| classify(code, true))?;
        info!("MQTT_EVENT_CONNECTED");
        Ok(MqttSession {
            client,
            socket: &self.socket,
        })
    }
}

/// One connected client.
pub struct MqttSession<'a> {
    client: Client<'a>,
    socket: &'a SharedTcp,
}

impl PubSubSession for MqttSession<'_> {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        level: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        self.client
            .send_message(topic, payload, qos(level), retain)
            .await
            .map_err(|code| classify(code, false))
    }

    async fn subscribe(&mut self, topic: &str, _level: QoS) -> Result<(), ClientError> {
        self.client
            .subscribe_to_topic(topic)
            .await
            .map_err(|code| classify(code, false))
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        self.client
            .unsubscribe_from_topic(topic)
            .await
            .map_err(|code| classify(code, false))
    }

    async fn wait_inbound(&mut self) -> Result<(), ClientError> {
        let window = Duration::from_secs(u64::from(KEEPALIVE_SECS / 2));
        let socket = self.socket.lock().await;
        // Nothing is read here. A timeout means the keep-alive is due.
        let _ = with_timeout(window, socket.wait_read_ready()).await;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<SessionEvent, ClientError> {
        let pending = self.socket.lock().await.can_recv();
        if !pending {
            self.client
                .send_ping()
                .await
                .map_err(|code| classify(code, false))?;
            return Ok(SessionEvent::Idle);
        }
        let (topic, payload) = self
            .client
            .receive_message()
            .await
            .map_err(|code| classify(code, false))?;
        let mut owned_topic = Topic::new();
        owned_topic
            .push_str(topic)
            .map_err(|_| ClientError::protocol())?;
        let owned_payload = Payload::from_slice(payload).map_err(|_| ClientError::protocol())?;
        Ok(SessionEvent::Message {
            topic: owned_topic,
            payload: owned_payload,
        })
    }
}

#[embassy_executor::task]
pub async fn mqtt_task(
    mut runner: BridgeRunner<'static>,
    mut sessions: MqttSessions,
    link: &'static ConnectivityStatus,
) {
    runner
        .run(&mut sessions, link, &mut Delay, RECONNECT_BACKOFF_MS)
        .await
}
