//! Provisioning access point and TCP credential server
//!
//! Two coupled machines stepped together: the access point side brings up a
//! MAC-derived SSID, the server side accepts one client on a fixed port and
//! reads `apply,<ssid>,<auth>,<key>` lines until `finish`.

use crate::config;
use crate::credentials::{AuthMode, CredentialError, FINISH_TOKEN, WifiCredentials};
use crate::hal::{AccessPoint, AccessPointConfig, TcpServer};
use crate::led_control::{BlinkMode, LedColor, LedMode, Ticker};
use crate::mailbox::Mailbox;
use crate::status::{Shared, StatusRegisters};
use crate::storage::StorageRequests;
use core::fmt::Write;
use log::{debug, error, info, warn};

/// Requests from the Wi-Fi lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningCommand {
    EnterAccessPoint,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApState {
    Init,
    Pending,
    ApEnable,
    WaitApEnabled,
    ApEnabled,
    ApDisable,
    WaitApDisabled,
    Idle,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Init,
    Pending,
    OpenSocket,
    WaitConnection,
    ParseSocketData,
    CloseSocket,
    Idle,
    Error,
}

/// What one received line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningLine {
    Apply(WifiCredentials),
    Finish,
}

/// Parse one line of the provisioning protocol
pub fn parse_line(line: &str) -> Result<ProvisioningLine, CredentialError> {
    let trimmed = line.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if trimmed == FINISH_TOKEN {
        return Ok(ProvisioningLine::Finish);
    }
    WifiCredentials::parse_line(trimmed).map(ProvisioningLine::Apply)
}

/// `IoT-Board_` followed by the MAC address in upper-case hex
pub fn access_point_ssid(mac: &[u8; 6]) -> heapless::String<32> {
    let mut ssid = heapless::String::new();
    let _ = ssid.push_str(config::AP_SSID_PREFIX);
    for byte in mac {
        let _ = write!(ssid, "{:02X}", byte);
    }
    ssid
}

pub struct ProvisioningContext<'a> {
    pub status: &'a StatusRegisters,
    pub ticker: &'a Ticker,
    pub commands: &'a Mailbox<ProvisioningCommand>,
    pub credentials: &'a Shared<WifiCredentials>,
    pub storage: &'a StorageRequests,
}

pub struct Provisioning<'a, A, T> {
    ap_state: ApState,
    tcp_state: TcpState,
    access_point: A,
    server: T,
    ctx: ProvisioningContext<'a>,
    buffer: [u8; config::PROV_BUFFER_SIZE],
}

impl<'a, A, T> Provisioning<'a, A, T>
where
    A: AccessPoint,
    T: TcpServer,
{
    pub fn new(access_point: A, server: T, ctx: ProvisioningContext<'a>) -> Self {
        Self {
            ap_state: ApState::Init,
            tcp_state: TcpState::Init,
            access_point,
            server,
            ctx,
            buffer: [0; config::PROV_BUFFER_SIZE],
        }
    }

    pub fn ap_state(&self) -> ApState {
        self.ap_state
    }

    pub fn tcp_state(&self) -> TcpState {
        self.tcp_state
    }

    /// Run one pass of both machines
    pub fn step(&mut self) {
        if let Some(command) = self.ctx.commands.take() {
            self.handle_command(command);
        }
        self.step_access_point();
        self.step_server();
    }

    fn handle_command(&mut self, command: ProvisioningCommand) {
        debug!("[PROV] {:?}", command);
        match command {
            ProvisioningCommand::EnterAccessPoint => {
                self.ap_state = ApState::ApEnable;
                self.tcp_state = TcpState::Pending;
            }
            ProvisioningCommand::Stop => {
                if self.access_point_active() {
                    self.ap_state = ApState::ApDisable;
                } else {
                    self.ap_state = ApState::Idle;
                    self.tcp_state = TcpState::Idle;
                }
            }
        }
    }

    fn access_point_active(&self) -> bool {
        matches!(
            self.ap_state,
            ApState::ApEnable | ApState::WaitApEnabled | ApState::ApEnabled
        )
    }

    fn step_access_point(&mut self) {
        let status = self.ctx.status;

        self.ap_state = match self.ap_state {
            ApState::Init => ApState::Pending,
            ApState::Pending => ApState::Pending,
            ApState::ApEnable => {
                let ap_config = AccessPointConfig {
                    ssid: access_point_ssid(&self.access_point.mac_address()),
                    auth: AuthMode::Open,
                    psk: config::AP_PSK,
                    channel: config::AP_CHANNEL,
                };
                info!("[PROV] Starting access point {}", ap_config.ssid);
                match self.access_point.start(&ap_config) {
                    Ok(()) => ApState::WaitApEnabled,
                    Err(e) => {
                        error!("[PROV] Access point start failed: {:?}", e);
                        ApState::Error
                    }
                }
            }
            ApState::WaitApEnabled => {
                if status.ap_ready.get() {
                    self.ctx.ticker.set_led(
                        LedColor::Blue,
                        LedMode::SlowBlinkStartOn,
                        BlinkMode::Periodic,
                    );
                    self.tcp_state = TcpState::OpenSocket;
                    ApState::ApEnabled
                } else {
                    ApState::WaitApEnabled
                }
            }
            ApState::ApEnabled => ApState::ApEnabled,
            ApState::ApDisable => {
                if let Err(e) = self.access_point.stop() {
                    warn!("[PROV] Access point stop failed: {:?}", e);
                }
                self.ctx
                    .ticker
                    .set_led(LedColor::Blue, LedMode::Off, BlinkMode::Single);
                self.tcp_state = TcpState::CloseSocket;
                ApState::WaitApDisabled
            }
            ApState::WaitApDisabled => {
                if status.ap_ready.get() {
                    ApState::WaitApDisabled
                } else {
                    info!("[PROV] Access point down");
                    ApState::Idle
                }
            }
            ApState::Idle => ApState::Idle,
            ApState::Error => ApState::Idle,
        };
    }

    fn step_server(&mut self) {
        self.tcp_state = match self.tcp_state {
            TcpState::Init => TcpState::Pending,
            TcpState::Pending => TcpState::Pending,
            TcpState::OpenSocket => match self.server.open(config::PROV_SERVER_PORT) {
                Ok(()) => {
                    info!("[PROV] Listening on port {}", config::PROV_SERVER_PORT);
                    TcpState::WaitConnection
                }
                Err(e) => {
                    warn!("[PROV] Socket open failed, retrying: {:?}", e);
                    TcpState::OpenSocket
                }
            },
            TcpState::WaitConnection => {
                if self.server.is_connected() {
                    info!("[PROV] Client connected");
                    TcpState::ParseSocketData
                } else {
                    TcpState::WaitConnection
                }
            }
            TcpState::ParseSocketData => self.parse_socket_data(),
            TcpState::CloseSocket => match self.server.close() {
                Ok(()) => TcpState::Idle,
                Err(e) => {
                    warn!("[PROV] Socket close failed: {:?}", e);
                    TcpState::CloseSocket
                }
            },
            TcpState::Idle => TcpState::Idle,
            TcpState::Error => TcpState::Idle,
        };
    }

    fn parse_socket_data(&mut self) -> TcpState {
        if !self.server.is_connected() {
            info!("[PROV] Client left, listening again");
            if let Err(e) = self.server.close() {
                warn!("[PROV] Socket close failed: {:?}", e);
            }
            return TcpState::OpenSocket;
        }

        let len = self.server.read(&mut self.buffer);
        if len == 0 {
            return TcpState::ParseSocketData;
        }

        let Ok(text) = core::str::from_utf8(&self.buffer[..len]) else {
            warn!("[PROV] Dropping {} bytes of non-text data", len);
            return TcpState::ParseSocketData;
        };

        for line in text.split('\n') {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(ProvisioningLine::Apply(credentials)) => {
                    info!("[PROV] Received credentials for {}", credentials.ssid);
                    self.ctx.credentials.set(credentials);
                }
                Ok(ProvisioningLine::Finish) => {
                    info!("[PROV] Provisioning finished");
                    self.ctx.storage.request_rewrite();
                    self.ap_state = ApState::ApDisable;
                    return TcpState::CloseSocket;
                }
                Err(e) => warn!("[PROV] Ignoring malformed line: {:?}", e),
            }
        }
        TcpState::ParseSocketData
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAccessPoint, MockTcpServer};

    struct Rig {
        status: StatusRegisters,
        ticker: Ticker,
        commands: Mailbox<ProvisioningCommand>,
        credentials: Shared<WifiCredentials>,
        storage: StorageRequests,
        access_point: MockAccessPoint,
        server: MockTcpServer,
    }

    impl Rig {
        fn new() -> Self {
            let access_point = MockAccessPoint::new();
            access_point.state().mac = [0x00, 0x04, 0xA3, 0x12, 0x34, 0x56];
            Self {
                status: StatusRegisters::new(),
                ticker: Ticker::new(),
                commands: Mailbox::new(),
                credentials: Shared::new(WifiCredentials::defaults()),
                storage: StorageRequests::new(),
                access_point,
                server: MockTcpServer::new(),
            }
        }

        fn machine(&self) -> Provisioning<'_, MockAccessPoint, MockTcpServer> {
            Provisioning::new(
                self.access_point.clone(),
                self.server.clone(),
                ProvisioningContext {
                    status: &self.status,
                    ticker: &self.ticker,
                    commands: &self.commands,
                    credentials: &self.credentials,
                    storage: &self.storage,
                },
            )
        }

        fn client_sends(&self, text: &str) {
            let mut server = self.server.state();
            server.connected = true;
            server.inbound.push_back(text.as_bytes().to_vec());
        }
    }

    /// Enter AP mode and get a client connected
    fn serving(rig: &Rig) -> Provisioning<'_, MockAccessPoint, MockTcpServer> {
        let mut prov = rig.machine();
        prov.step();
        rig.commands.post(ProvisioningCommand::EnterAccessPoint);
        prov.step();
        rig.status.ap_ready.set(true);
        prov.step();
        assert_eq!(prov.tcp_state(), TcpState::WaitConnection);
        rig.server.state().connected = true;
        prov.step();
        assert_eq!(prov.tcp_state(), TcpState::ParseSocketData);
        prov
    }

    #[test]
    fn ssid_is_derived_from_mac() {
        let ssid = access_point_ssid(&[0x00, 0x04, 0xA3, 0xab, 0xcd, 0xef]);
        assert_eq!(ssid.as_str(), "IoT-Board_0004A3ABCDEF");
    }

    #[test]
    fn parses_protocol_lines() {
        assert_eq!(parse_line("finish\r\n"), Ok(ProvisioningLine::Finish));
        assert!(matches!(
            parse_line("apply,Lab,4,pw"),
            Ok(ProvisioningLine::Apply(_))
        ));
        assert_eq!(parse_line("hello"), Err(CredentialError::NotApply));
    }

    #[test]
    fn enter_access_point_opens_socket_once_ready() {
        let rig = Rig::new();
        let mut prov = rig.machine();
        prov.step();
        assert_eq!(prov.ap_state(), ApState::Pending);

        rig.commands.post(ProvisioningCommand::EnterAccessPoint);
        prov.step();
        assert_eq!(prov.ap_state(), ApState::WaitApEnabled);
        let started = rig.access_point.state().started.clone();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].ssid.as_str(), "IoT-Board_0004A3123456");
        assert_eq!(started[0].auth, AuthMode::Open);
        assert_eq!(started[0].channel, 1);

        // Nothing listens before the AP reports ready
        prov.step();
        assert_eq!(prov.tcp_state(), TcpState::Pending);

        rig.status.ap_ready.set(true);
        prov.step();
        assert_eq!(prov.ap_state(), ApState::ApEnabled);
        assert_eq!(prov.tcp_state(), TcpState::WaitConnection);
        assert_eq!(rig.server.state().opened_ports, vec![80]);
        let blue = rig.ticker.block(LedColor::Blue);
        assert!(blue.is_active() && blue.periodic);
        assert!(rig.ticker.is_on(LedColor::Blue));
    }

    #[test]
    fn socket_open_failure_retries() {
        let rig = Rig::new();
        rig.server.state().open_fails = true;
        let mut prov = rig.machine();
        rig.commands.post(ProvisioningCommand::EnterAccessPoint);
        prov.step();
        rig.status.ap_ready.set(true);
        prov.step();
        assert_eq!(prov.tcp_state(), TcpState::OpenSocket);
        prov.step();
        assert_eq!(prov.tcp_state(), TcpState::OpenSocket);

        rig.server.state().open_fails = false;
        prov.step();
        assert_eq!(prov.tcp_state(), TcpState::WaitConnection);
    }

    #[test]
    fn apply_updates_credentials_and_bad_lines_are_ignored() {
        let rig = Rig::new();
        let mut prov = serving(&rig);

        rig.client_sends("apply,Lab,9,pw\r\n");
        prov.step();
        assert_eq!(prov.tcp_state(), TcpState::ParseSocketData);
        assert_eq!(rig.credentials.get(), WifiCredentials::defaults());

        rig.client_sends("apply,Lab,4,pa55word\r\n");
        prov.step();
        let creds = rig.credentials.get();
        assert_eq!(creds.ssid.as_str(), "Lab");
        assert_eq!(creds.auth, AuthMode::Wpa2Wpa3Mixed);
        assert!(!rig.storage.rewrite.get());
    }

    #[test]
    fn finish_requests_rewrite_and_tears_down() {
        let rig = Rig::new();
        let mut prov = serving(&rig);

        rig.client_sends("apply,Lab,2,pw\nfinish\n");
        prov.step();
        assert_eq!(rig.credentials.get().ssid.as_str(), "Lab");
        assert!(rig.storage.rewrite.get());
        assert_eq!(prov.tcp_state(), TcpState::CloseSocket);
        assert_eq!(prov.ap_state(), ApState::ApDisable);

        prov.step();
        assert_eq!(rig.access_point.state().stops, 1);
        assert!(!rig.ticker.is_on(LedColor::Blue));
        assert_eq!(prov.ap_state(), ApState::WaitApDisabled);
        assert_eq!(prov.tcp_state(), TcpState::Idle);
        assert!(rig.server.state().closes >= 1);

        prov.step();
        assert_eq!(prov.ap_state(), ApState::WaitApDisabled);
        rig.status.ap_ready.set(false);
        prov.step();
        assert_eq!(prov.ap_state(), ApState::Idle);
    }

    #[test]
    fn client_leaving_reopens_listener() {
        let rig = Rig::new();
        let mut prov = serving(&rig);
        rig.server.state().connected = false;
        prov.step();
        assert_eq!(prov.tcp_state(), TcpState::OpenSocket);
        prov.step();
        assert_eq!(prov.tcp_state(), TcpState::WaitConnection);
    }

    #[test]
    fn start_failure_goes_idle_through_error() {
        let rig = Rig::new();
        rig.access_point.state().start_fails = true;
        let mut prov = rig.machine();
        rig.commands.post(ProvisioningCommand::EnterAccessPoint);
        prov.step();
        assert_eq!(prov.ap_state(), ApState::Error);
        prov.step();
        assert_eq!(prov.ap_state(), ApState::Idle);
    }

    #[test]
    fn stop_without_access_point_idles_both() {
        let rig = Rig::new();
        let mut prov = rig.machine();
        prov.step();
        rig.commands.post(ProvisioningCommand::Stop);
        prov.step();
        assert_eq!(prov.ap_state(), ApState::Idle);
        assert_eq!(prov.tcp_state(), TcpState::Idle);
        assert!(rig.access_point.state().started.is_empty());
    }

    #[test]
    fn stop_while_serving_disables_access_point() {
        let rig = Rig::new();
        let mut prov = serving(&rig);
        rig.commands.post(ProvisioningCommand::Stop);
        prov.step();
        assert_eq!(prov.ap_state(), ApState::WaitApDisabled);
        assert_eq!(rig.access_point.state().stops, 1);
        assert!(!rig.storage.rewrite.get());
    }
}
