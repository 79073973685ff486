//! Wi-Fi lifecycle
//!
//! Brings the radio up, picks station or provisioning mode from the stored
//! credentials and the boot buttons, connects, waits for SNTP and funnels
//! every loss of connectivity through `Reconnect`.

use crate::credentials::{AuthMode, WifiCredentials};
use crate::hal::{DriverStatus, NetStack, StackStatus, WifiDriver, WifiEvent, WifiEvents};
use crate::led_control::{BlinkMode, LedColor, LedMode, Ticker};
use crate::mailbox::Mailbox;
use crate::provisioning::ProvisioningCommand;
use crate::status::{CredentialValidity, Shared, StatusRegisters};
use log::{debug, error, info, warn};

/// LEDs walked by the start-up pattern, one per pass
const STARTUP_PATTERN: [LedColor; 4] = [
    LedColor::Blue,
    LedColor::Green,
    LedColor::Yellow,
    LedColor::Red,
];
const STARTUP_ROUNDS: usize = 2;

/// Idle passes between two RSSI samples
const RSSI_REFRESH_PASSES: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiState {
    LedStartupPattern,
    Init,
    DriverReady,
    WaitTcpipInit,
    CheckCredentials,
    Configure,
    WaitSntp,
    Idle,
    Reconnect,
    /// Driver torn down after a power-off request
    Deinit,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Station,
    AccessPoint,
}

/// Link facts for the console
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub address: Option<[u8; 4]>,
    pub unix_time: Option<u32>,
    pub rssi: Option<i8>,
}

impl NetworkInfo {
    pub const fn new() -> Self {
        Self {
            address: None,
            unix_time: None,
            rssi: None,
        }
    }
}

/// Everything the lifecycle shares with other tasks
pub struct WifiContext<'a> {
    pub status: &'a StatusRegisters,
    pub ticker: &'a Ticker,
    pub events: &'a WifiEvents,
    pub credentials: &'a Shared<WifiCredentials>,
    pub provisioning: &'a Mailbox<ProvisioningCommand>,
    pub info: &'a Shared<NetworkInfo>,
}

pub struct WifiLifecycle<'a, D, S> {
    state: WifiState,
    mode: AppMode,
    driver: D,
    stack: S,
    ctx: WifiContext<'a>,
    startup_step: usize,
    serving_power_on: bool,
    idle_passes: u8,
}

impl<'a, D, S> WifiLifecycle<'a, D, S>
where
    D: WifiDriver,
    S: NetStack,
{
    pub fn new(driver: D, stack: S, ctx: WifiContext<'a>) -> Self {
        Self {
            state: WifiState::LedStartupPattern,
            mode: AppMode::Station,
            driver,
            stack,
            ctx,
            startup_step: 0,
            serving_power_on: false,
            idle_passes: 0,
        }
    }

    pub fn state(&self) -> WifiState {
        self.state
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// Signal strength of the current association
    pub fn rssi(&mut self) -> Option<i8> {
        if self.ctx.status.wifi_connected.get() {
            self.driver.rssi()
        } else {
            None
        }
    }

    /// Run one pass of the machine
    pub fn step(&mut self) {
        self.drain_events();
        self.serve_power_requests();

        let next = match self.state {
            WifiState::LedStartupPattern => self.startup_pattern(),
            WifiState::Init => self.init(),
            WifiState::DriverReady => match self.driver.open() {
                Ok(()) => WifiState::WaitTcpipInit,
                Err(e) => {
                    error!("[WIFI] Driver open failed: {:?}", e);
                    WifiState::Error
                }
            },
            WifiState::WaitTcpipInit => self.wait_tcpip(),
            WifiState::CheckCredentials => self.check_credentials(),
            WifiState::Configure => self.configure(),
            WifiState::WaitSntp => match self.stack.sntp_time() {
                Some(unix_time) => {
                    info!("[WIFI] SNTP synchronized, unix time {}", unix_time);
                    self.ctx.status.ntp_done.set(true);
                    self.ctx.info.with(|info| info.unix_time = Some(unix_time));
                    WifiState::Idle
                }
                None => WifiState::WaitSntp,
            },
            WifiState::Idle => {
                self.refresh_info();
                WifiState::Idle
            }
            WifiState::Reconnect => self.reconnect(),
            WifiState::Deinit => WifiState::Deinit,
            WifiState::Error => WifiState::Error,
        };

        if next != self.state {
            debug!("[WIFI] {:?} -> {:?}", self.state, next);
            if next == WifiState::Error {
                error!("[WIFI] Entering error state from {:?}", self.state);
            }
        }
        self.state = next;
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.ctx.events.try_receive() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: WifiEvent) {
        let status = self.ctx.status;
        let station = self.mode == AppMode::Station;

        match event {
            WifiEvent::Connected => {
                info!("[WIFI] Associated");
                status.wifi_connected.set(true);
                if let Err(e) = self.driver.set_power_save(true) {
                    warn!("[WIFI] Power save not enabled: {:?}", e);
                }
            }
            WifiEvent::Disconnected | WifiEvent::ConnectFailed => {
                warn!("[WIFI] {:?}", event);
                status.wifi_connected.set(false);
                self.enter_reconnect();
            }
            WifiEvent::LinkUp if station => {
                self.ctx.ticker.set_led(LedColor::Blue, LedMode::On, BlinkMode::Single);
                self.stack.start_dhcp_client();
            }
            WifiEvent::LinkUp => {
                info!("[WIFI] Access point up");
                status.ap_ready.set(true);
                self.stack.start_dhcp_server();
            }
            WifiEvent::LinkDown => {
                self.ctx.ticker.set_led(LedColor::Blue, LedMode::Off, BlinkMode::Single);
                if station {
                    self.stack.stop_dhcp_client();
                    self.enter_reconnect();
                } else {
                    info!("[WIFI] Access point down");
                    self.stack.stop_dhcp_server();
                    status.ap_ready.set(false);
                }
            }
            WifiEvent::DhcpBound(address) => {
                info!(
                    "[WIFI] IP address {}.{}.{}.{}",
                    address[0], address[1], address[2], address[3]
                );
                status.ip_obtained.set(true);
                self.ctx.info.with(|info| info.address = Some(address));
            }
            WifiEvent::DhcpLost => {
                warn!("[WIFI] DHCP lease lost");
                status.ip_obtained.set(false);
                self.ctx.info.with(|info| info.address = None);
                if station {
                    self.enter_reconnect();
                }
            }
        }
    }

    fn enter_reconnect(&mut self) {
        if !matches!(self.state, WifiState::Deinit | WifiState::Reconnect) {
            self.state = WifiState::Reconnect;
        }
    }

    /// Power-off wins unless the driver is already down
    fn serve_power_requests(&mut self) {
        let status = self.ctx.status;

        if status.wifi_off_requested.get() {
            if self.state != WifiState::Deinit {
                self.enter_reconnect();
                return;
            }
            info!("[WIFI] Wi-Fi already off");
            status.wifi_off_requested.set(false);
        }

        if status.wifi_on_requested.take() {
            if self.state == WifiState::Deinit {
                info!("[WIFI] Power-on requested");
                self.serving_power_on = true;
                self.state = WifiState::Init;
            } else {
                info!("[WIFI] Wi-Fi already on");
            }
        }
    }

    fn startup_pattern(&mut self) -> WifiState {
        let color = STARTUP_PATTERN[self.startup_step % STARTUP_PATTERN.len()];
        self.ctx
            .ticker
            .set_led(color, LedMode::FastBlink, BlinkMode::Single);
        self.startup_step += 1;

        if self.startup_step >= STARTUP_PATTERN.len() * STARTUP_ROUNDS {
            WifiState::Init
        } else {
            WifiState::LedStartupPattern
        }
    }

    fn init(&mut self) -> WifiState {
        if self.serving_power_on {
            self.serving_power_on = false;
            if let Err(e) = self.driver.initialize() {
                error!("[WIFI] Driver initialization failed: {:?}", e);
                return WifiState::Error;
            }
        }
        match self.driver.status() {
            DriverStatus::Ready => WifiState::DriverReady,
            DriverStatus::Busy => WifiState::Init,
            DriverStatus::Failed => WifiState::Error,
        }
    }

    fn wait_tcpip(&mut self) -> WifiState {
        match self.stack.status() {
            StackStatus::Initializing => WifiState::WaitTcpipInit,
            StackStatus::Failed => WifiState::Error,
            StackStatus::Ready => match self.stack.register_handlers() {
                Ok(()) => WifiState::CheckCredentials,
                Err(e) => {
                    error!("[WIFI] Event handler registration failed: {:?}", e);
                    WifiState::Error
                }
            },
        }
    }

    fn check_credentials(&mut self) -> WifiState {
        let status = self.ctx.status;
        let validity = status.credential_validity();
        let button_held = status.sw1_pressed.get() && !status.sw2_pressed.get();

        if button_held || validity == CredentialValidity::Invalid {
            status.sw1_pressed.set(false);
            info!("[WIFI] Starting provisioning access point");
            self.mode = AppMode::AccessPoint;
            self.ctx.provisioning.post(ProvisioningCommand::EnterAccessPoint);
            return WifiState::Idle;
        }

        if validity == CredentialValidity::Valid {
            self.mode = AppMode::Station;
            self.ctx.provisioning.post(ProvisioningCommand::Stop);
            return WifiState::Configure;
        }

        WifiState::CheckCredentials
    }

    fn configure(&mut self) -> WifiState {
        self.ctx
            .ticker
            .set_led(LedColor::Blue, LedMode::FastBlink, BlinkMode::Periodic);

        let credentials = self.ctx.credentials.get();
        if credentials.auth == AuthMode::Wep {
            error!("[WIFI] WEP is not supported");
            return WifiState::Error;
        }

        info!("[WIFI] Connecting to {}", credentials.ssid);
        match self.driver.connect(&credentials) {
            Ok(()) => WifiState::WaitSntp,
            Err(e) => {
                error!("[WIFI] Connect request failed: {:?}", e);
                WifiState::Error
            }
        }
    }

    fn reconnect(&mut self) -> WifiState {
        let status = self.ctx.status;

        self.stack.deregister_handlers();
        self.driver.close();
        status.wifi_connected.set(false);
        status.ip_obtained.set(false);
        if self.mode == AppMode::AccessPoint {
            status.ap_ready.set(false);
        }
        self.ctx.info.set(NetworkInfo::new());
        self.ctx
            .ticker
            .set_led(LedColor::Blue, LedMode::Off, BlinkMode::Single);

        if status.wifi_off_requested.take() {
            info!("[WIFI] Powering radio down");
            self.driver.deinitialize();
            WifiState::Deinit
        } else {
            WifiState::Init
        }
    }

    fn refresh_info(&mut self) {
        if self.mode != AppMode::Station {
            return;
        }
        self.idle_passes = self.idle_passes.wrapping_add(1);
        if self.idle_passes % RSSI_REFRESH_PASSES != 0 {
            return;
        }

        let unix_time = self.stack.sntp_time();
        let rssi = self.rssi();
        self.ctx.info.with(|info| {
            if unix_time.is_some() {
                info.unix_time = unix_time;
            }
            info.rssi = rssi;
        });
    }
}
