//! Recording fakes for the collaborator traits, host tests only
//!
//! Every fake is a cheap clone of a shared log so a test can keep one handle
//! while the machine under test owns the other.

use crate::BoardError;
use crate::credentials::WifiCredentials;
use crate::hal::*;
use crate::volume::RamVolume;
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

macro_rules! shared_fake {
    ($name:ident, $state:ident) => {
        #[derive(Clone, Default)]
        pub struct $name(pub Rc<RefCell<$state>>);

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn state(&self) -> std::cell::RefMut<'_, $state> {
                self.0.borrow_mut()
            }
        }
    };
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum I2cSubmission {
    Write(u8, Vec<u8>),
    ReadRegister(u8, u8),
}

#[derive(Default)]
pub struct I2cState {
    pub open_fails: bool,
    pub submit_fails: bool,
    pub submissions: Vec<I2cSubmission>,
}

shared_fake!(MockI2c, I2cState);

impl I2cBus for MockI2c {
    fn open(&mut self) -> Result<(), BoardError> {
        if self.state().open_fails {
            Err(BoardError::I2cError)
        } else {
            Ok(())
        }
    }

    fn submit_write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BoardError> {
        let mut s = self.state();
        if s.submit_fails {
            return Err(BoardError::I2cError);
        }
        s.submissions.push(I2cSubmission::Write(address, bytes.to_vec()));
        Ok(())
    }

    fn submit_read_register(&mut self, address: u8, register: u8) -> Result<(), BoardError> {
        let mut s = self.state();
        if s.submit_fails {
            return Err(BoardError::I2cError);
        }
        s.submissions.push(I2cSubmission::ReadRegister(address, register));
        Ok(())
    }
}

// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RtccState {
    pub now: RtccTime,
    pub alarms: Vec<AlarmMask>,
    pub alarm_fails: bool,
}

shared_fake!(MockRtcc, RtccState);

impl Rtcc for MockRtcc {
    fn set_time(&mut self, time: RtccTime) -> Result<(), BoardError> {
        self.state().now = time;
        Ok(())
    }

    fn time(&self) -> RtccTime {
        self.0.borrow().now
    }

    fn set_alarm(&mut self, mask: AlarmMask) -> Result<(), BoardError> {
        let mut s = self.state();
        if s.alarm_fails {
            return Err(BoardError::PowerError);
        }
        s.alarms.push(mask);
        Ok(())
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiCall {
    Initialize,
    Deinitialize,
    Open,
    Close,
    Connect(WifiCredentials),
    PowerSave(bool),
}

pub struct WifiState {
    pub status: DriverStatus,
    pub open_fails: bool,
    pub connect_fails: bool,
    pub rssi: Option<i8>,
    pub calls: Vec<WifiCall>,
}

impl Default for WifiState {
    fn default() -> Self {
        Self {
            status: DriverStatus::Ready,
            open_fails: false,
            connect_fails: false,
            rssi: Some(-52),
            calls: Vec::new(),
        }
    }
}

shared_fake!(MockWifi, WifiState);

impl MockWifi {
    pub fn connects(&self) -> Vec<WifiCredentials> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                WifiCall::Connect(creds) => Some(creds.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &WifiCall) -> usize {
        self.state().calls.iter().filter(|c| *c == call).count()
    }
}

impl WifiDriver for MockWifi {
    fn initialize(&mut self) -> Result<(), BoardError> {
        self.state().calls.push(WifiCall::Initialize);
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.state().calls.push(WifiCall::Deinitialize);
    }

    fn status(&self) -> DriverStatus {
        self.0.borrow().status
    }

    fn open(&mut self) -> Result<(), BoardError> {
        let mut s = self.state();
        s.calls.push(WifiCall::Open);
        if s.open_fails {
            Err(BoardError::WiFiError)
        } else {
            Ok(())
        }
    }

    fn close(&mut self) {
        self.state().calls.push(WifiCall::Close);
    }

    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), BoardError> {
        let mut s = self.state();
        s.calls.push(WifiCall::Connect(credentials.clone()));
        if s.connect_fails {
            Err(BoardError::WiFiError)
        } else {
            Ok(())
        }
    }

    fn set_power_save(&mut self, enabled: bool) -> Result<(), BoardError> {
        self.state().calls.push(WifiCall::PowerSave(enabled));
        Ok(())
    }

    fn rssi(&mut self) -> Option<i8> {
        self.state().rssi
    }
}

// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ApState {
    pub mac: [u8; 6],
    pub start_fails: bool,
    pub stop_fails: bool,
    pub started: Vec<AccessPointConfig>,
    pub stops: usize,
}

shared_fake!(MockAccessPoint, ApState);

impl AccessPoint for MockAccessPoint {
    fn mac_address(&self) -> [u8; 6] {
        self.0.borrow().mac
    }

    fn start(&mut self, config: &AccessPointConfig) -> Result<(), BoardError> {
        let mut s = self.state();
        if s.start_fails {
            return Err(BoardError::WiFiError);
        }
        s.started.push(config.clone());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BoardError> {
        let mut s = self.state();
        s.stops += 1;
        if s.stop_fails {
            Err(BoardError::WiFiError)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------

pub struct StackState {
    pub status: StackStatus,
    pub sntp: Option<u32>,
    pub calls: Vec<&'static str>,
}

impl Default for StackState {
    fn default() -> Self {
        Self {
            status: StackStatus::Ready,
            sntp: None,
            calls: Vec::new(),
        }
    }
}

shared_fake!(MockNetStack, StackState);

impl MockNetStack {
    pub fn called(&self, name: &str) -> bool {
        self.state().calls.iter().any(|c| *c == name)
    }
}

impl NetStack for MockNetStack {
    fn status(&self) -> StackStatus {
        self.0.borrow().status
    }

    fn register_handlers(&mut self) -> Result<(), BoardError> {
        self.state().calls.push("register_handlers");
        Ok(())
    }

    fn deregister_handlers(&mut self) {
        self.state().calls.push("deregister_handlers");
    }

    fn start_dhcp_client(&mut self) {
        self.state().calls.push("start_dhcp_client");
    }

    fn stop_dhcp_client(&mut self) {
        self.state().calls.push("stop_dhcp_client");
    }

    fn start_dhcp_server(&mut self) {
        self.state().calls.push("start_dhcp_server");
    }

    fn stop_dhcp_server(&mut self) {
        self.state().calls.push("stop_dhcp_server");
    }

    fn sntp_time(&self) -> Option<u32> {
        self.0.borrow().sntp
    }
}

// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TcpState {
    pub open_fails: bool,
    pub opened_ports: Vec<u16>,
    pub is_open: bool,
    pub connected: bool,
    pub inbound: VecDeque<Vec<u8>>,
    pub closes: usize,
}

shared_fake!(MockTcpServer, TcpState);

impl TcpServer for MockTcpServer {
    fn open(&mut self, port: u16) -> Result<(), BoardError> {
        let mut s = self.state();
        if s.open_fails {
            return Err(BoardError::SocketError);
        }
        s.opened_ports.push(port);
        s.is_open = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let s = self.0.borrow();
        s.is_open && s.connected
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut s = self.state();
        match s.inbound.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                n
            }
            None => 0,
        }
    }

    fn close(&mut self) -> Result<(), BoardError> {
        let mut s = self.state();
        s.closes += 1;
        s.is_open = false;
        Ok(())
    }
}

// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MqttState {
    pub connect_fails: bool,
    pub publish_fails: bool,
    pub connects: Vec<(String, String)>,
    pub subscriptions: Vec<(String, QoS)>,
    pub publishes: Vec<(String, Vec<u8>)>,
}

shared_fake!(MockMqtt, MqttState);

impl MqttClient for MockMqtt {
    fn connect(&mut self, endpoint: &str, client_id: &str) -> Result<(), BoardError> {
        let mut s = self.state();
        if s.connect_fails {
            return Err(BoardError::MqttError);
        }
        s.connects.push((endpoint.into(), client_id.into()));
        Ok(())
    }

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), BoardError> {
        self.state().subscriptions.push((filter.into(), qos));
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], _qos: QoS) -> Result<(), BoardError> {
        let mut s = self.state();
        if s.publish_fails {
            return Err(BoardError::MqttError);
        }
        s.publishes.push((topic.into(), payload.to_vec()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Volume shared between a storage machine and the test, survives "reboots"
#[derive(Clone, Default)]
pub struct SharedVolume(pub Rc<RefCell<RamVolume>>);

impl SharedVolume {
    pub fn new(volume: RamVolume) -> Self {
        Self(Rc::new(RefCell::new(volume)))
    }

    pub fn volume(&self) -> std::cell::RefMut<'_, RamVolume> {
        self.0.borrow_mut()
    }
}

impl FileSystem for SharedVolume {
    fn poll_mount(&mut self) -> MountStatus {
        self.volume().poll_mount()
    }

    fn format(&mut self) -> Result<(), BoardError> {
        self.volume().format()
    }

    fn set_label(&mut self, label: &str) -> Result<(), BoardError> {
        self.volume().set_label(label)
    }

    fn exists(&self, path: &str) -> bool {
        self.0.borrow().exists(path)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), BoardError> {
        self.volume().write(path, data)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, BoardError> {
        self.0.borrow().read(path)
    }

    fn remove(&mut self, path: &str) -> Result<(), BoardError> {
        self.volume().remove(path)
    }

    fn unmount(&mut self) -> Result<(), BoardError> {
        self.volume().unmount()
    }
}

// ---------------------------------------------------------------------------

/// Two 4 KiB erase blocks; writes can only clear bits, like real NOR
pub struct FlashState {
    pub memory: Vec<u8>,
    pub erases: usize,
    pub write_fails: bool,
}

impl Default for FlashState {
    fn default() -> Self {
        Self {
            memory: vec![0xFF; 2 * 4096],
            erases: 0,
            write_fails: false,
        }
    }
}

shared_fake!(MockFlash, FlashState);

impl ErrorType for MockFlash {
    type Error = NorFlashErrorKind;
}

fn flash_range(
    memory: &[u8],
    offset: u32,
    len: usize,
) -> Result<core::ops::Range<usize>, NorFlashErrorKind> {
    let start = offset as usize;
    let end = start + len;
    if end > memory.len() {
        return Err(NorFlashErrorKind::OutOfBounds);
    }
    Ok(start..end)
}

impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = 4;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let s = self.state();
        let range = flash_range(&s.memory, offset, bytes.len())?;
        bytes.copy_from_slice(&s.memory[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.0.borrow().memory.len()
    }
}

impl NorFlash for MockFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = 4096;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let mut s = self.state();
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = flash_range(&s.memory, from, (to - from) as usize)?;
        s.memory[range].fill(0xFF);
        s.erases += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let mut s = self.state();
        if s.write_fails {
            return Err(NorFlashErrorKind::Other);
        }
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = flash_range(&s.memory, offset, bytes.len())?;
        for (cell, byte) in s.memory[range].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct UsbState {
    pub attached: bool,
    pub attach_fails: bool,
    pub detaches: usize,
}

shared_fake!(MockUsb, UsbState);

impl UsbDevice for MockUsb {
    fn attach(&mut self) -> Result<(), BoardError> {
        let mut s = self.state();
        if s.attach_fails {
            return Err(BoardError::UsbError);
        }
        s.attached = true;
        Ok(())
    }

    fn detach(&mut self) {
        let mut s = self.state();
        s.attached = false;
        s.detaches += 1;
    }
}

// ---------------------------------------------------------------------------

pub struct CryptoState {
    pub init_fails: bool,
    pub certificate_fails: bool,
    pub serial: [u8; 9],
    pub key_id: [u8; 20],
    pub key_id_reads: usize,
}

impl Default for CryptoState {
    fn default() -> Self {
        Self {
            init_fails: false,
            certificate_fails: false,
            serial: [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x01],
            key_id: [0xA5; 20],
            key_id_reads: 0,
        }
    }
}

shared_fake!(MockCrypto, CryptoState);

impl CryptoElement for MockCrypto {
    fn init(&mut self) -> Result<(), BoardError> {
        if self.state().init_fails {
            Err(BoardError::CryptoError)
        } else {
            Ok(())
        }
    }

    fn serial_number(&mut self) -> Result<[u8; 9], BoardError> {
        Ok(self.state().serial)
    }

    fn device_certificate_pem(&mut self) -> Result<String, BoardError> {
        if self.state().certificate_fails {
            return Err(BoardError::CryptoError);
        }
        Ok("-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n".into())
    }

    fn subject_key_id(&mut self) -> Result<[u8; 20], BoardError> {
        let mut s = self.state();
        s.key_id_reads += 1;
        Ok(s.key_id)
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCall {
    ArmAlarm(u32),
    Disable(InterruptSource),
    Enable(InterruptSource),
    Enter(CpuPowerMode),
    RadioDown,
}

#[derive(Default)]
pub struct PowerState {
    pub alarm_fails: bool,
    pub enabled: Vec<InterruptSource>,
    pub calls: Vec<PowerCall>,
}

shared_fake!(MockPower, PowerState);

impl PowerController for MockPower {
    fn arm_wake_alarm(&mut self, seconds: u32) -> Result<(), BoardError> {
        let mut s = self.state();
        if s.alarm_fails {
            return Err(BoardError::PowerError);
        }
        s.calls.push(PowerCall::ArmAlarm(seconds));
        Ok(())
    }

    fn interrupt_enabled(&self, source: InterruptSource) -> bool {
        self.0.borrow().enabled.contains(&source)
    }

    fn disable_interrupt(&mut self, source: InterruptSource) {
        let mut s = self.state();
        s.enabled.retain(|e| *e != source);
        s.calls.push(PowerCall::Disable(source));
    }

    fn enable_interrupt(&mut self, source: InterruptSource) {
        let mut s = self.state();
        if !s.enabled.contains(&source) {
            s.enabled.push(source);
        }
        s.calls.push(PowerCall::Enable(source));
    }

    fn enter(&mut self, mode: CpuPowerMode) {
        self.state().calls.push(PowerCall::Enter(mode));
    }

    fn power_down_radio(&mut self) {
        self.state().calls.push(PowerCall::RadioDown);
    }
}

// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SystemState {
    pub resets: usize,
}

shared_fake!(MockSystem, SystemState);

impl SystemControl for MockSystem {
    fn soft_reset(&mut self) {
        self.state().resets += 1;
    }
}
