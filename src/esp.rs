//! ESP32-C3 bindings for the collaborator traits
//!
//! The state machines call these adapters synchronously. Work that needs the
//! async network stack runs in the bridge tasks at the bottom of this file,
//! which report back through the machines' event channels.
//!
//! Radio, access point and network stack adapters borrow one
//! [`WifiController`] through a `RefCell`, so they must live in the same task.

use crate::credentials::{AuthMode, WifiCredentials};
use crate::hal::{
    AccessPoint, AccessPointConfig, AlarmMask, CpuPowerMode, CryptoElement, DriverStatus,
    InboundMessage, InterruptSource, MqttClient, MqttEvent, MqttEvents, NetStack,
    PowerController, QoS, Rtcc, RtccTime, StackStatus, SystemControl, TcpServer, UsbDevice,
    WifiDriver, WifiEvent, WifiEvents,
};
use crate::status::{Flag, Shared, StatusRegisters};
use crate::flash_block::FlashBlock;
use crate::volume::FlashBackedVolume;
use crate::{BoardError, config, sntp};
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use embassy_futures::select::{Either, select};
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{
    ConfigV4, DhcpConfig, IpAddress, IpEndpoint, IpListenEndpoint, Ipv4Address, Ipv4Cidr, Stack,
    StaticConfigV4,
};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::pipe::Pipe;
use embassy_time::{Duration, Instant, Timer, with_timeout};
use esp_hal::rtc_cntl::Rtc;
use esp_hal::rtc_cntl::sleep::TimerWakeupSource;
use esp_storage::FlashStorage;
use esp_wifi::config::PowerSaveMode;
use esp_wifi::wifi::{
    self, AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, ScanConfig,
    WifiController, WifiError, WifiState,
};
use log::{debug, error, info, warn};
use rust_mqtt::client::client::MqttClient as RustMqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;

pub type Radio<'d> = RefCell<WifiController<'d>>;

const LINK_POLL_MS: u64 = 250;
const CONNECT_TIMEOUT_MS: u64 = 15_000;
const RSSI_MAX_AGE_MS: u64 = 30_000;

fn wifi_error(e: WifiError) -> BoardError {
    warn!("[WIFI] Driver error: {:?}", e);
    BoardError::WiFiError
}

fn auth_method(auth: AuthMode) -> AuthMethod {
    match auth {
        AuthMode::Open => AuthMethod::None,
        AuthMode::WpaWpa2Mixed => AuthMethod::WPAWPA2Personal,
        AuthMode::Wep => AuthMethod::WEP,
        AuthMode::Wpa2Wpa3Mixed => AuthMethod::WPA2WPA3Personal,
    }
}

/// State shared between the radio adapters and the link watcher
pub struct RadioLink {
    /// Stack notifications are only forwarded while handlers are registered
    forwarding: Flag,
    stop_requested: Flag,
    connect_started: Shared<Option<Instant>>,
    unix_time: Shared<Option<(u32, Instant)>>,
}

impl RadioLink {
    pub const fn new() -> Self {
        Self {
            forwarding: Flag::new(false),
            stop_requested: Flag::new(false),
            connect_started: Shared::new(None),
            unix_time: Shared::new(None),
        }
    }

    /// Set by the power controller; served by the task owning the radio
    pub fn take_stop_request(&self) -> bool {
        self.stop_requested.take()
    }

    pub fn set_unix_time(&self, seconds: u32) {
        self.unix_time.set(Some((seconds, Instant::now())));
    }

    fn unix_time(&self) -> Option<u32> {
        self.unix_time
            .get()
            .map(|(seconds, at)| seconds.saturating_add(at.elapsed().as_secs() as u32))
    }
}

impl Default for RadioLink {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Station, access point and stack
// ---------------------------------------------------------------------------

pub struct Station<'r, 'd> {
    radio: &'r Radio<'d>,
    link: &'r RadioLink,
    ssid: heapless::String<32>,
    rssi: Option<(i8, Instant)>,
}

impl<'r, 'd> Station<'r, 'd> {
    pub fn new(radio: &'r Radio<'d>, link: &'r RadioLink) -> Self {
        Self {
            radio,
            link,
            ssid: heapless::String::new(),
            rssi: None,
        }
    }
}

impl WifiDriver for Station<'_, '_> {
    fn initialize(&mut self) -> Result<(), BoardError> {
        let mut controller = self.radio.borrow_mut();
        controller
            .set_configuration(&Configuration::Client(ClientConfiguration::default()))
            .map_err(wifi_error)?;
        controller.start().map_err(wifi_error)?;
        info!("[WIFI] Radio started");
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.link.connect_started.set(None);
        if let Err(e) = self.radio.borrow_mut().stop() {
            warn!("[WIFI] Radio stop failed: {:?}", e);
        }
    }

    fn status(&self) -> DriverStatus {
        match self.radio.borrow().is_started() {
            Ok(true) => DriverStatus::Ready,
            Ok(false) => DriverStatus::Busy,
            Err(_) => DriverStatus::Failed,
        }
    }

    fn open(&mut self) -> Result<(), BoardError> {
        Ok(())
    }

    fn close(&mut self) {
        self.link.connect_started.set(None);
        self.rssi = None;
        let mut controller = self.radio.borrow_mut();
        if matches!(controller.is_connected(), Ok(true)) {
            if let Err(e) = controller.disconnect() {
                warn!("[WIFI] Disconnect failed: {:?}", e);
            }
        }
    }

    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), BoardError> {
        let client = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| BoardError::ConfigError)?,
            password: credentials
                .key
                .as_str()
                .try_into()
                .map_err(|_| BoardError::ConfigError)?,
            auth_method: auth_method(credentials.auth),
            ..Default::default()
        };

        let mut controller = self.radio.borrow_mut();
        controller
            .set_configuration(&Configuration::Client(client))
            .map_err(wifi_error)?;
        controller.connect().map_err(wifi_error)?;

        self.ssid = credentials.ssid.clone();
        self.link.connect_started.set(Some(Instant::now()));
        Ok(())
    }

    fn set_power_save(&mut self, enabled: bool) -> Result<(), BoardError> {
        let mode = if enabled {
            PowerSaveMode::Minimum
        } else {
            PowerSaveMode::None
        };
        self.radio
            .borrow_mut()
            .set_power_saving(mode)
            .map_err(wifi_error)
    }

    /// Scans for the associated network at most every 30 s
    fn rssi(&mut self) -> Option<i8> {
        if let Some((dbm, at)) = self.rssi {
            if at.elapsed() < Duration::from_millis(RSSI_MAX_AGE_MS) {
                return Some(dbm);
            }
        }

        let scan = ScanConfig {
            ssid: Some(self.ssid.as_str()),
            ..Default::default()
        };
        let found = match self.radio.borrow_mut().scan_with_config_sync(scan) {
            Ok(found) => found,
            Err(e) => {
                debug!("[WIFI] RSSI scan failed: {:?}", e);
                return self.rssi.map(|(dbm, _)| dbm);
            }
        };
        let dbm = found.iter().map(|ap| ap.signal_strength).max()?;
        self.rssi = Some((dbm, Instant::now()));
        Some(dbm)
    }
}

pub struct SoftAp<'r, 'd> {
    radio: &'r Radio<'d>,
    mac: [u8; 6],
}

impl<'r, 'd> SoftAp<'r, 'd> {
    pub fn new(radio: &'r Radio<'d>, mac: [u8; 6]) -> Self {
        Self { radio, mac }
    }
}

impl AccessPoint for SoftAp<'_, '_> {
    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn start(&mut self, ap: &AccessPointConfig) -> Result<(), BoardError> {
        let password = if ap.auth == AuthMode::Open { "" } else { ap.psk };
        let configuration = Configuration::AccessPoint(AccessPointConfiguration {
            ssid: ap
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| BoardError::ConfigError)?,
            password: password.try_into().map_err(|_| BoardError::ConfigError)?,
            auth_method: auth_method(ap.auth),
            channel: ap.channel,
            ..Default::default()
        });

        let mut controller = self.radio.borrow_mut();
        controller
            .set_configuration(&configuration)
            .map_err(wifi_error)?;
        if !matches!(controller.is_started(), Ok(true)) {
            controller.start().map_err(wifi_error)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BoardError> {
        self.radio.borrow_mut().stop().map_err(wifi_error)
    }
}

/// Fixed address of the provisioning access point
pub fn access_point_address() -> StaticConfigV4 {
    let [a, b, c, d] = config::AP_ADDRESS;
    let address = Ipv4Address::new(a, b, c, d);
    StaticConfigV4 {
        address: Ipv4Cidr::new(address, 24),
        gateway: Some(address),
        dns_servers: Default::default(),
    }
}

/// Station and access point interfaces of embassy-net
///
/// The station runs a DHCP client. The access point serves no leases; the
/// "server" switch only assigns or drops its fixed address.
pub struct NetStacks<'r> {
    station: Stack<'static>,
    access_point: Stack<'static>,
    link: &'r RadioLink,
}

impl<'r> NetStacks<'r> {
    pub fn new(station: Stack<'static>, access_point: Stack<'static>, link: &'r RadioLink) -> Self {
        Self {
            station,
            access_point,
            link,
        }
    }
}

impl NetStack for NetStacks<'_> {
    fn status(&self) -> StackStatus {
        StackStatus::Ready
    }

    fn register_handlers(&mut self) -> Result<(), BoardError> {
        self.link.forwarding.set(true);
        Ok(())
    }

    fn deregister_handlers(&mut self) {
        self.link.forwarding.set(false);
    }

    fn start_dhcp_client(&mut self) {
        self.station
            .set_config_v4(ConfigV4::Dhcp(DhcpConfig::default()));
    }

    fn stop_dhcp_client(&mut self) {
        self.station.set_config_v4(ConfigV4::None);
    }

    fn start_dhcp_server(&mut self) {
        self.access_point
            .set_config_v4(ConfigV4::Static(access_point_address()));
    }

    fn stop_dhcp_server(&mut self) {
        self.access_point.set_config_v4(ConfigV4::None);
    }

    fn sntp_time(&self) -> Option<u32> {
        self.link.unix_time()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LinkSnapshot {
    associated: bool,
    station_link: bool,
    address: Option<[u8; 4]>,
    ap_started: bool,
}

impl LinkSnapshot {
    fn capture(station: Stack<'_>) -> Self {
        Self {
            associated: matches!(wifi::sta_state(), WifiState::StaConnected),
            station_link: station.is_link_up(),
            address: station
                .config_v4()
                .map(|config| config.address.address().octets()),
            ap_started: matches!(wifi::ap_state(), WifiState::ApStarted),
        }
    }
}

/// Turn radio and stack state changes into [`WifiEvent`]s
#[embassy_executor::task]
pub async fn link_watch_task(
    station: Stack<'static>,
    link: &'static RadioLink,
    events: &'static WifiEvents,
) {
    let mut seen = LinkSnapshot::default();

    loop {
        let now = LinkSnapshot::capture(station);
        let mut pending: heapless::Vec<WifiEvent, 6> = heapless::Vec::new();

        if now.associated != seen.associated {
            link.connect_started.set(None);
            let _ = pending.push(if now.associated {
                WifiEvent::Connected
            } else {
                WifiEvent::Disconnected
            });
        } else if !now.associated {
            let timed_out = link.connect_started.with(|started| match *started {
                Some(at) if at.elapsed() > Duration::from_millis(CONNECT_TIMEOUT_MS) => {
                    *started = None;
                    true
                }
                _ => false,
            });
            if timed_out {
                let _ = pending.push(WifiEvent::ConnectFailed);
            }
        }

        if now.station_link != seen.station_link {
            let _ = pending.push(if now.station_link {
                WifiEvent::LinkUp
            } else {
                WifiEvent::LinkDown
            });
        }

        if now.address != seen.address {
            let _ = pending.push(match now.address {
                Some(address) => WifiEvent::DhcpBound(address),
                None => WifiEvent::DhcpLost,
            });
        }

        if now.ap_started != seen.ap_started {
            let _ = pending.push(if now.ap_started {
                WifiEvent::LinkUp
            } else {
                WifiEvent::LinkDown
            });
        }

        if link.forwarding.get() {
            for event in pending {
                debug!("[WIFI] Event {:?}", event);
                if events.try_send(event).is_err() {
                    warn!("[WIFI] Event queue full, dropping {:?}", event);
                }
            }
        }
        seen = now;

        Timer::after(Duration::from_millis(LINK_POLL_MS)).await;
    }
}

/// Periodic SNTP query over the station interface
#[embassy_executor::task]
pub async fn sntp_task(stack: Stack<'static>, link: &'static RadioLink) {
    let mut rx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut rx_buffer = [0u8; 128];
    let mut tx_buffer = [0u8; 128];

    loop {
        stack.wait_config_up().await;

        let mut socket = UdpSocket::new(
            stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        );
        let delay = match socket.bind(0) {
            Ok(()) => match query_time(&mut socket).await {
                Ok(seconds) => {
                    info!("[SNTP] Unix time {}", seconds);
                    link.set_unix_time(seconds);
                    config::SNTP_RESYNC_SECS
                }
                Err(e) => {
                    warn!("[SNTP] Query failed: {:?}", e);
                    config::SNTP_RETRY_SECS
                }
            },
            Err(e) => {
                warn!("[SNTP] Bind failed: {:?}", e);
                config::SNTP_RETRY_SECS
            }
        };
        drop(socket);

        Timer::after(Duration::from_secs(delay)).await;
    }
}

async fn query_time(socket: &mut UdpSocket<'_>) -> Result<u32, BoardError> {
    let [a, b, c, d] = config::SNTP_SERVER;
    let server = IpEndpoint::new(IpAddress::v4(a, b, c, d), sntp::NTP_PORT);

    socket
        .send_to(&sntp::build_request(), server)
        .await
        .map_err(|_| BoardError::SocketError)?;

    let mut reply = [0u8; sntp::PACKET_LEN];
    let (len, _) = with_timeout(Duration::from_secs(5), socket.recv_from(&mut reply))
        .await
        .map_err(|_| BoardError::TcpIpError)?
        .map_err(|_| BoardError::SocketError)?;
    sntp::parse_reply(&reply[..len])
}

// ---------------------------------------------------------------------------
// Provisioning socket
// ---------------------------------------------------------------------------

/// Hand-off between [`ProvisioningSocket`] and [`provisioning_socket_task`]
pub struct SocketBridge {
    listen: Flag,
    connected: Flag,
    port: Shared<u16>,
    inbound: Pipe<CriticalSectionRawMutex, { config::PROV_BUFFER_SIZE }>,
}

impl SocketBridge {
    pub const fn new() -> Self {
        Self {
            listen: Flag::new(false),
            connected: Flag::new(false),
            port: Shared::new(config::PROV_SERVER_PORT),
            inbound: Pipe::new(),
        }
    }

    async fn closed(&self) {
        while self.listen.get() {
            Timer::after(Duration::from_millis(100)).await;
        }
    }
}

impl Default for SocketBridge {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProvisioningSocket {
    bridge: &'static SocketBridge,
}

impl ProvisioningSocket {
    pub fn new(bridge: &'static SocketBridge) -> Self {
        Self { bridge }
    }
}

impl TcpServer for ProvisioningSocket {
    fn open(&mut self, port: u16) -> Result<(), BoardError> {
        self.bridge.port.set(port);
        self.bridge.inbound.clear();
        self.bridge.listen.set(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.bridge.connected.get()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.bridge.inbound.try_read(buf).unwrap_or(0)
    }

    fn close(&mut self) -> Result<(), BoardError> {
        self.bridge.listen.set(false);
        self.bridge.inbound.clear();
        Ok(())
    }
}

/// Accepts one client at a time on the access point interface
#[embassy_executor::task]
pub async fn provisioning_socket_task(stack: Stack<'static>, bridge: &'static SocketBridge) {
    let mut rx_buffer = [0u8; 1024];
    let mut tx_buffer = [0u8; 256];
    let mut chunk = [0u8; config::PROV_BUFFER_SIZE];

    loop {
        if !bridge.listen.get() {
            Timer::after(Duration::from_millis(100)).await;
            continue;
        }

        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(Duration::from_secs(120)));
        let endpoint = IpListenEndpoint {
            addr: None,
            port: bridge.port.get(),
        };

        match select(socket.accept(endpoint), bridge.closed()).await {
            Either::First(Ok(())) => {}
            Either::First(Err(e)) => {
                warn!("[PROV] Accept failed: {:?}", e);
                continue;
            }
            Either::Second(()) => {
                socket.abort();
                continue;
            }
        }

        info!("[PROV] Client {:?}", socket.remote_endpoint());
        bridge.connected.set(true);
        loop {
            match select(socket.read(&mut chunk), bridge.closed()).await {
                Either::First(Ok(0)) | Either::Second(()) => break,
                Either::First(Ok(n)) => bridge.inbound.write_all(&chunk[..n]).await,
                Either::First(Err(e)) => {
                    warn!("[PROV] Read failed: {:?}", e);
                    break;
                }
            }
        }
        bridge.connected.set(false);

        socket.close();
        let _ = socket.flush().await;
        socket.abort();
    }
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

pub enum MqttRequest {
    Connect { endpoint: String, client_id: String },
    Subscribe { filter: String, qos: QoS },
    Publish { topic: String, payload: Vec<u8>, qos: QoS },
}

pub type MqttRequests = Channel<CriticalSectionRawMutex, MqttRequest, 4>;

/// Queues requests for [`mqtt_task`]
pub struct MqttBridge {
    requests: &'static MqttRequests,
}

impl MqttBridge {
    pub fn new(requests: &'static MqttRequests) -> Self {
        Self { requests }
    }

    fn queue(&self, request: MqttRequest) -> Result<(), BoardError> {
        self.requests.try_send(request).map_err(|_| {
            warn!("[MQTT] Request queue full");
            BoardError::MqttError
        })
    }
}

impl MqttClient for MqttBridge {
    fn connect(&mut self, endpoint: &str, client_id: &str) -> Result<(), BoardError> {
        self.queue(MqttRequest::Connect {
            endpoint: endpoint.into(),
            client_id: client_id.into(),
        })
    }

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), BoardError> {
        self.queue(MqttRequest::Subscribe {
            filter: filter.into(),
            qos,
        })
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), BoardError> {
        self.queue(MqttRequest::Publish {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        })
    }
}

const MQTT_BUFFER: usize = 512;
const MQTT_MAX_PROPERTIES: usize = 5;

type Session<'a> = RustMqttClient<'a, TcpSocket<'a>, MQTT_MAX_PROPERTIES, CountingRng>;

fn quality(qos: QoS) -> QualityOfService {
    match qos {
        QoS::AtMostOnce => QualityOfService::QoS0,
        QoS::AtLeastOnce => QualityOfService::QoS1,
    }
}

fn mqtt_error(code: ReasonCode) -> BoardError {
    warn!("[MQTT] Broker returned {:?}", code);
    BoardError::MqttError
}

/// Owns the broker connection; one session per `Connect` request
#[embassy_executor::task]
pub async fn mqtt_task(
    stack: Stack<'static>,
    requests: &'static MqttRequests,
    events: &'static MqttEvents,
) {
    let mut rx_buffer = [0u8; 2048];
    let mut tx_buffer = [0u8; 2048];
    let mut write_buffer = [0u8; MQTT_BUFFER];
    let mut recv_buffer = [0u8; MQTT_BUFFER];

    loop {
        let (endpoint, client_id) = match requests.receive().await {
            MqttRequest::Connect {
                endpoint,
                client_id,
            } => (endpoint, client_id),
            MqttRequest::Subscribe { .. } => {
                events.send(MqttEvent::SubscribeDone(Err(BoardError::MqttError))).await;
                continue;
            }
            MqttRequest::Publish { .. } => {
                events.send(MqttEvent::PublishDone(Err(BoardError::MqttError))).await;
                continue;
            }
        };

        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(Duration::from_secs(30)));
        if let Err(e) = open_socket(stack, &mut socket, &endpoint).await {
            events.send(MqttEvent::ConnectDone(Err(e))).await;
            continue;
        }

        let mut mqtt_config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20_000));
        mqtt_config.add_max_subscribe_qos(QualityOfService::QoS1);
        mqtt_config.add_client_id(&client_id);
        mqtt_config.keep_alive = config::MQTT_KEEP_ALIVE_SECS;
        mqtt_config.max_packet_size = MQTT_BUFFER as u32;

        let mut session: Session<'_> = RustMqttClient::new(
            socket,
            &mut write_buffer,
            MQTT_BUFFER,
            &mut recv_buffer,
            MQTT_BUFFER,
            mqtt_config,
        );
        if let Err(code) = session.connect_to_broker().await {
            events.send(MqttEvent::ConnectDone(Err(mqtt_error(code)))).await;
            continue;
        }
        info!("[MQTT] Connected to {} as {}", endpoint, client_id);
        events.send(MqttEvent::ConnectDone(Ok(()))).await;

        serve(&mut session, requests, events).await;
        warn!("[MQTT] Session closed");
        events.send(MqttEvent::Disconnected).await;
    }
}

async fn open_socket(
    stack: Stack<'_>,
    socket: &mut TcpSocket<'_>,
    endpoint: &str,
) -> Result<(), BoardError> {
    let address = match endpoint.parse::<Ipv4Address>() {
        Ok(address) => IpAddress::Ipv4(address),
        Err(_) => {
            let found = stack
                .dns_query(endpoint, DnsQueryType::A)
                .await
                .map_err(|e| {
                    warn!("[MQTT] Cannot resolve {}: {:?}", endpoint, e);
                    BoardError::TcpIpError
                })?;
            *found.first().ok_or(BoardError::TcpIpError)?
        }
    };

    socket
        .connect((address, config::MQTT_PORT))
        .await
        .map_err(|e| {
            warn!("[MQTT] TCP connect to {} failed: {:?}", endpoint, e);
            BoardError::SocketError
        })
}

enum Step {
    Request(MqttRequest),
    Message(Option<InboundMessage>),
    Failed(ReasonCode),
    Ping,
}

fn inbound(topic: &str, payload: &[u8]) -> Option<InboundMessage> {
    Some(InboundMessage {
        topic: heapless::String::try_from(topic).ok()?,
        payload: heapless::Vec::from_slice(payload).ok()?,
    })
}

async fn serve(session: &mut Session<'_>, requests: &MqttRequests, events: &MqttEvents) {
    let idle = Duration::from_secs(u64::from(config::MQTT_KEEP_ALIVE_SECS) / 2);

    loop {
        let step = match select(requests.receive(), with_timeout(idle, session.receive_message()))
            .await
        {
            Either::First(request) => Step::Request(request),
            Either::Second(Ok(Ok((topic, payload)))) => Step::Message(inbound(topic, payload)),
            Either::Second(Ok(Err(code))) => Step::Failed(code),
            Either::Second(Err(_)) => Step::Ping,
        };

        match step {
            Step::Request(MqttRequest::Connect { .. }) => {
                debug!("[MQTT] Already connected");
                events.send(MqttEvent::ConnectDone(Ok(()))).await;
            }
            Step::Request(MqttRequest::Subscribe { filter, qos }) => {
                debug!("[MQTT] Subscribe {} {:?}", filter, qos);
                let result = session.subscribe_to_topic(&filter).await;
                let failed = result.is_err();
                events
                    .send(MqttEvent::SubscribeDone(result.map_err(mqtt_error)))
                    .await;
                if failed {
                    return;
                }
            }
            Step::Request(MqttRequest::Publish {
                topic,
                payload,
                qos,
            }) => {
                let result = session
                    .send_message(&topic, &payload, quality(qos), false)
                    .await;
                let failed = result.is_err();
                events
                    .send(MqttEvent::PublishDone(result.map_err(mqtt_error)))
                    .await;
                if failed {
                    return;
                }
            }
            Step::Message(Some(message)) => events.send(MqttEvent::Message(message)).await,
            Step::Message(None) => warn!("[MQTT] Inbound message too large, dropped"),
            Step::Failed(code) => {
                mqtt_error(code);
                return;
            }
            Step::Ping => {
                if let Err(code) = session.send_ping().await {
                    mqtt_error(code);
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RTCC
// ---------------------------------------------------------------------------

/// Calendar clock kept on the embassy time base
pub struct SoftRtcc {
    base: u64,
    set_at: Instant,
    alarm: &'static Shared<AlarmMask>,
}

impl SoftRtcc {
    pub fn new(alarm: &'static Shared<AlarmMask>) -> Self {
        Self {
            base: 0,
            set_at: Instant::now(),
            alarm,
        }
    }
}

impl Rtcc for SoftRtcc {
    fn set_time(&mut self, time: RtccTime) -> Result<(), BoardError> {
        self.base = time.unix_seconds()?;
        self.set_at = Instant::now();
        Ok(())
    }

    fn time(&self) -> RtccTime {
        RtccTime::from_unix_seconds(self.base + self.set_at.elapsed().as_secs())
            .unwrap_or_default()
    }

    fn set_alarm(&mut self, mask: AlarmMask) -> Result<(), BoardError> {
        self.alarm.set(mask);
        Ok(())
    }
}

/// Raises the RTCC alarm flag at the programmed repeat interval
#[embassy_executor::task]
pub async fn rtcc_alarm_task(alarm: &'static Shared<AlarmMask>, status: &'static StatusRegisters) {
    loop {
        let mask = alarm.get();
        match mask.period_ms() {
            Some(period) => {
                Timer::after(Duration::from_millis(period)).await;
                if alarm.get() == mask {
                    status.rtcc_alarm.set(true);
                }
            }
            None => Timer::after(Duration::from_millis(100)).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage, USB and secure element
// ---------------------------------------------------------------------------

/// Volume kept in RAM with the credential file mirrored to on-chip flash
pub type PersistentVolume = FlashBackedVolume<FlashStorage>;

pub fn persistent_volume() -> Result<PersistentVolume, BoardError> {
    let block = FlashBlock::new(FlashStorage::new(), config::WIFI_CONFIG_FLASH_OFFSET)?;
    Ok(FlashBackedVolume::new(block, config::WIFI_CONFIG_FILE))
}

/// The ESP32-C3 has no USB device controller; the volume stays internal
pub struct NoUsb;

impl UsbDevice for NoUsb {
    fn attach(&mut self) -> Result<(), BoardError> {
        info!("[MSD] No USB mass-storage function on this target");
        Ok(())
    }

    fn detach(&mut self) {}
}

/// Identity derived from the factory MAC; there is no certificate store
pub struct EfuseIdentity {
    mac: [u8; 6],
}

impl EfuseIdentity {
    pub fn new(mac: [u8; 6]) -> Self {
        Self { mac }
    }
}

impl CryptoElement for EfuseIdentity {
    fn init(&mut self) -> Result<(), BoardError> {
        Ok(())
    }

    fn serial_number(&mut self) -> Result<[u8; 9], BoardError> {
        let mut serial = [0x01, 0x23, 0, 0, 0, 0, 0, 0, 0xEE];
        serial[2..8].copy_from_slice(&self.mac);
        Ok(serial)
    }

    fn device_certificate_pem(&mut self) -> Result<String, BoardError> {
        Err(BoardError::CryptoError)
    }

    fn subject_key_id(&mut self) -> Result<[u8; 20], BoardError> {
        Err(BoardError::CryptoError)
    }
}

// ---------------------------------------------------------------------------
// Power and system control
// ---------------------------------------------------------------------------

/// Light and deep sleep through the RTC controller
///
/// Interrupt gating is bookkeeping only; light sleep already holds the
/// peripheral clocks.
pub struct RtcPower<'d> {
    rtc: Rtc<'d>,
    link: &'static RadioLink,
    wake_after: Option<u32>,
    enabled: u16,
}

impl<'d> RtcPower<'d> {
    pub fn new(rtc: Rtc<'d>, link: &'static RadioLink) -> Self {
        Self {
            rtc,
            link,
            wake_after: None,
            enabled: u16::MAX,
        }
    }

    fn bit(source: InterruptSource) -> u16 {
        let index = InterruptSource::ALL
            .iter()
            .position(|s| *s == source)
            .unwrap_or(0);
        1 << index
    }
}

impl PowerController for RtcPower<'_> {
    fn arm_wake_alarm(&mut self, seconds: u32) -> Result<(), BoardError> {
        if seconds == 0 {
            return Err(BoardError::PowerError);
        }
        self.wake_after = Some(seconds);
        Ok(())
    }

    fn interrupt_enabled(&self, source: InterruptSource) -> bool {
        self.enabled & Self::bit(source) != 0
    }

    fn disable_interrupt(&mut self, source: InterruptSource) {
        self.enabled &= !Self::bit(source);
    }

    fn enable_interrupt(&mut self, source: InterruptSource) {
        self.enabled |= Self::bit(source);
    }

    fn enter(&mut self, mode: CpuPowerMode) {
        let Some(seconds) = self.wake_after.take() else {
            error!("[PM] No wake alarm armed, staying awake");
            return;
        };
        let timer = TimerWakeupSource::new(core::time::Duration::from_secs(u64::from(seconds)));

        match mode {
            CpuPowerMode::Idle | CpuPowerMode::Sleep => self.rtc.sleep_light(&[&timer]),
            CpuPowerMode::DeepSleep => self.rtc.sleep_deep(&[&timer]),
        }
    }

    fn power_down_radio(&mut self) {
        self.link.stop_requested.set(true);
    }
}

pub struct ChipReset;

impl SystemControl for ChipReset {
    fn soft_reset(&mut self) {
        info!("[SYS] Software reset");
        esp_hal::system::software_reset();
    }
}
