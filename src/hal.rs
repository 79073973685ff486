//! Collaborator interfaces
//!
//! The state machines reach peripherals, the radio, the network stack and the
//! storage stack only through these traits. Submissions return immediately;
//! completions arrive later through a [`Mailbox`] or an event [`Channel`] that
//! the owning machine drains at the start of its next pass.

use crate::BoardError;
use crate::credentials::{AuthMode, WifiCredentials};
use crate::mailbox::Mailbox;
use alloc::string::String as AllocString;
use alloc::vec::Vec;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::debug;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

// ---------------------------------------------------------------------------
// I2C
// ---------------------------------------------------------------------------

/// Outcome of one I2C transaction; reads carry the two received bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    Success([u8; 2]),
    Error,
}

/// Asynchronous I2C master
///
/// At most one transaction is queued at a time. The driver posts the result
/// to the completion mailbox it was created with.
pub trait I2cBus {
    fn open(&mut self) -> Result<(), BoardError>;

    /// Queue a plain write
    fn submit_write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BoardError>;

    /// Queue a register pointer write followed by a two byte read
    fn submit_read_register(&mut self, address: u8, register: u8) -> Result<(), BoardError>;
}

/// Runs each submission to completion on a blocking `embedded-hal` bus and
/// posts the result immediately
pub struct BlockingI2c<'a, B> {
    bus: B,
    completion: &'a Mailbox<TransferResult>,
    opened: bool,
}

impl<'a, B> BlockingI2c<'a, B>
where
    B: embedded_hal::i2c::I2c,
{
    pub fn new(bus: B, completion: &'a Mailbox<TransferResult>) -> Self {
        Self {
            bus,
            completion,
            opened: false,
        }
    }

    pub fn release(self) -> B {
        self.bus
    }
}

impl<B> I2cBus for BlockingI2c<'_, B>
where
    B: embedded_hal::i2c::I2c,
{
    fn open(&mut self) -> Result<(), BoardError> {
        self.opened = true;
        Ok(())
    }

    fn submit_write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BoardError> {
        if !self.opened {
            return Err(BoardError::I2cError);
        }
        let result = match self.bus.write(address, bytes) {
            Ok(()) => TransferResult::Success([0; 2]),
            Err(_) => TransferResult::Error,
        };
        debug!("[I2C] write 0x{:02X} {:02X?} -> {:?}", address, bytes, result);
        self.completion.post(result);
        Ok(())
    }

    fn submit_read_register(&mut self, address: u8, register: u8) -> Result<(), BoardError> {
        if !self.opened {
            return Err(BoardError::I2cError);
        }
        let mut rx = [0u8; 2];
        let result = match self.bus.write_read(address, &[register], &mut rx) {
            Ok(()) => TransferResult::Success(rx),
            Err(_) => TransferResult::Error,
        };
        debug!("[I2C] read 0x{:02X}/0x{:02X} -> {:?}", address, register, result);
        self.completion.post(result);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RTCC
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtccTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl RtccTime {
    /// Calendar time of `seconds` since 1970-01-01 00:00:00 UTC
    pub fn from_unix_seconds(seconds: u64) -> Result<Self, BoardError> {
        let seconds = i64::try_from(seconds).map_err(|_| BoardError::ConfigError)?;
        let dt = OffsetDateTime::from_unix_timestamp(seconds).map_err(|_| BoardError::ConfigError)?;
        Ok(Self {
            year: u16::try_from(dt.year()).map_err(|_| BoardError::ConfigError)?,
            month: u8::from(dt.month()),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        })
    }

    /// Seconds since the Unix epoch; fails for fields that name no calendar
    /// instant or fall before 1970
    pub fn unix_seconds(&self) -> Result<u64, BoardError> {
        let month = Month::try_from(self.month).map_err(|_| BoardError::ConfigError)?;
        let date = Date::from_calendar_date(i32::from(self.year), month, self.day)
            .map_err(|_| BoardError::ConfigError)?;
        let time = Time::from_hms(self.hour, self.minute, self.second)
            .map_err(|_| BoardError::ConfigError)?;
        let timestamp = PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp();
        u64::try_from(timestamp).map_err(|_| BoardError::ConfigError)
    }
}

/// Alarm repeat interval, numbered as accepted by the `rtcc_freq` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlarmMask {
    HalfSecond = 0,
    Second = 1,
    TenSeconds = 2,
    Minute = 3,
    TenMinutes = 4,
    Hour = 5,
    Day = 6,
    Week = 7,
    Month = 8,
    Year = 9,
    Off = 255,
}

impl AlarmMask {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::HalfSecond,
            1 => Self::Second,
            2 => Self::TenSeconds,
            3 => Self::Minute,
            4 => Self::TenMinutes,
            5 => Self::Hour,
            6 => Self::Day,
            7 => Self::Week,
            8 => Self::Month,
            9 => Self::Year,
            255 => Self::Off,
            _ => return None,
        })
    }

    /// Repeat period for timer-emulated alarms; months and years are nominal
    pub fn period_ms(self) -> Option<u64> {
        const DAY: u64 = 86_400_000;
        Some(match self {
            Self::HalfSecond => 500,
            Self::Second => 1000,
            Self::TenSeconds => 10_000,
            Self::Minute => 60_000,
            Self::TenMinutes => 600_000,
            Self::Hour => 3_600_000,
            Self::Day => DAY,
            Self::Week => 7 * DAY,
            Self::Month => 30 * DAY,
            Self::Year => 365 * DAY,
            Self::Off => return None,
        })
    }
}

pub trait Rtcc {
    fn set_time(&mut self, time: RtccTime) -> Result<(), BoardError>;
    fn time(&self) -> RtccTime;
    fn set_alarm(&mut self, mask: AlarmMask) -> Result<(), BoardError>;
}

// ---------------------------------------------------------------------------
// Wi-Fi radio and TCP/IP stack
// ---------------------------------------------------------------------------

/// Radio driver readiness after `initialize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Busy,
    Ready,
    Failed,
}

/// Asynchronous radio and stack notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiEvent {
    Connected,
    Disconnected,
    ConnectFailed,
    LinkUp,
    LinkDown,
    DhcpBound([u8; 4]),
    DhcpLost,
}

pub type WifiEvents = Channel<CriticalSectionRawMutex, WifiEvent, 8>;

/// Station side of the radio
pub trait WifiDriver {
    /// Create the driver instance and power the radio up
    fn initialize(&mut self) -> Result<(), BoardError>;
    /// Destroy the driver instance
    fn deinitialize(&mut self);
    fn status(&self) -> DriverStatus;
    fn open(&mut self) -> Result<(), BoardError>;
    fn close(&mut self);
    /// Start association; the outcome arrives as a [`WifiEvent`]
    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), BoardError>;
    fn set_power_save(&mut self, enabled: bool) -> Result<(), BoardError>;
    fn rssi(&mut self) -> Option<i8>;
}

/// Parameters of the provisioning access point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub ssid: heapless::String<32>,
    pub auth: AuthMode,
    /// Only used when `auth` is not open
    pub psk: &'static str,
    pub channel: u8,
}

/// Access point side of the radio
pub trait AccessPoint {
    fn mac_address(&self) -> [u8; 6];
    /// Start the AP; link-up arrives as a [`WifiEvent`]
    fn start(&mut self, config: &AccessPointConfig) -> Result<(), BoardError>;
    fn stop(&mut self) -> Result<(), BoardError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
    Initializing,
    Ready,
    Failed,
}

pub trait NetStack {
    fn status(&self) -> StackStatus;
    fn register_handlers(&mut self) -> Result<(), BoardError>;
    fn deregister_handlers(&mut self);
    fn start_dhcp_client(&mut self);
    fn stop_dhcp_client(&mut self);
    fn start_dhcp_server(&mut self);
    fn stop_dhcp_server(&mut self);
    /// Unix seconds once the SNTP client has synchronized
    fn sntp_time(&self) -> Option<u32>;
}

/// Single-client listening socket
pub trait TcpServer {
    fn open(&mut self, port: u16) -> Result<(), BoardError>;
    fn is_connected(&self) -> bool;
    /// Move received bytes into `buf`, returning the count (0 when idle)
    fn read(&mut self, buf: &mut [u8]) -> usize;
    fn close(&mut self) -> Result<(), BoardError>;
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: heapless::String<{ crate::config::MQTT_TOPIC_MAX }>,
    pub payload: heapless::Vec<u8, { crate::config::MQTT_PAYLOAD_MAX }>,
}

/// Completions and unsolicited notifications from the MQTT client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    ConnectDone(Result<(), BoardError>),
    SubscribeDone(Result<(), BoardError>),
    PublishDone(Result<(), BoardError>),
    Disconnected,
    Message(InboundMessage),
}

pub type MqttEvents = Channel<CriticalSectionRawMutex, MqttEvent, 4>;

pub trait MqttClient {
    fn connect(&mut self, endpoint: &str, client_id: &str) -> Result<(), BoardError>;
    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), BoardError>;
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), BoardError>;
}

// ---------------------------------------------------------------------------
// Storage, USB and secure element
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Pending,
    Mounted,
    NoFilesystem,
}

pub trait FileSystem {
    fn poll_mount(&mut self) -> MountStatus;
    fn format(&mut self) -> Result<(), BoardError>;
    fn set_label(&mut self, label: &str) -> Result<(), BoardError>;
    fn exists(&self, path: &str) -> bool;
    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), BoardError>;
    fn read(&self, path: &str) -> Result<Vec<u8>, BoardError>;
    fn remove(&mut self, path: &str) -> Result<(), BoardError>;
    fn unmount(&mut self) -> Result<(), BoardError>;
}

/// USB mass-storage function exposing the volume to a host
pub trait UsbDevice {
    fn attach(&mut self) -> Result<(), BoardError>;
    fn detach(&mut self);
}

/// Secure element holding the device certificate
pub trait CryptoElement {
    fn init(&mut self) -> Result<(), BoardError>;
    fn serial_number(&mut self) -> Result<[u8; 9], BoardError>;
    fn device_certificate_pem(&mut self) -> Result<AllocString, BoardError>;
    /// Subject key identifier of the device certificate
    fn subject_key_id(&mut self) -> Result<[u8; 20], BoardError>;
}

// ---------------------------------------------------------------------------
// Power and system control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuPowerMode {
    Idle,
    Sleep,
    DeepSleep,
}

/// Peripheral interrupt sources gated around idle and sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    Usb,
    CoreTimer,
    I2c2,
    Spi1,
    Spi2,
    Timer1,
    Timer3,
    Uart1,
    Uart3,
    I2c1,
    RfMac,
    RfSmc,
    RfTm0,
    Crypto,
    Flash,
}

impl InterruptSource {
    pub const ALL: [InterruptSource; 15] = [
        Self::Usb,
        Self::CoreTimer,
        Self::I2c2,
        Self::Spi1,
        Self::Spi2,
        Self::Timer1,
        Self::Timer3,
        Self::Uart1,
        Self::Uart3,
        Self::I2c1,
        Self::RfMac,
        Self::RfSmc,
        Self::RfTm0,
        Self::Crypto,
        Self::Flash,
    ];
}

pub trait PowerController {
    /// Arm the RTCC wake alarm `seconds` from now
    fn arm_wake_alarm(&mut self, seconds: u32) -> Result<(), BoardError>;
    fn interrupt_enabled(&self, source: InterruptSource) -> bool;
    /// Disable the source and clear its pending flag
    fn disable_interrupt(&mut self, source: InterruptSource);
    fn enable_interrupt(&mut self, source: InterruptSource);
    /// Returns on wake; deep sleep only returns on targets that cannot reset
    fn enter(&mut self, mode: CpuPowerMode);
    fn power_down_radio(&mut self);
}

pub trait SystemControl {
    fn soft_reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorType, Operation, SevenBitAddress};

    struct FixedBus {
        reply: [u8; 2],
        fail: bool,
        writes: Vec<(u8, Vec<u8>)>,
    }

    #[derive(Debug)]
    struct Nack;

    impl embedded_hal::i2c::Error for Nack {
        fn kind(&self) -> embedded_hal::i2c::ErrorKind {
            embedded_hal::i2c::ErrorKind::NoAcknowledge(
                embedded_hal::i2c::NoAcknowledgeSource::Address,
            )
        }
    }

    impl ErrorType for FixedBus {
        type Error = Nack;
    }

    impl embedded_hal::i2c::I2c<SevenBitAddress> for FixedBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            if self.fail {
                return Err(Nack);
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => self.writes.push((address, bytes.to_vec())),
                    Operation::Read(buf) => buf.copy_from_slice(&self.reply[..buf.len()]),
                }
            }
            Ok(())
        }
    }

    #[test]
    fn blocking_adapter_posts_read_bytes() {
        let done = Mailbox::new();
        let bus = FixedBus {
            reply: [0xC1, 0x90],
            fail: false,
            writes: Vec::new(),
        };
        let mut i2c = BlockingI2c::new(bus, &done);
        i2c.open().unwrap();
        i2c.submit_read_register(0x18, 0x05).unwrap();
        assert_eq!(done.take(), Some(TransferResult::Success([0xC1, 0x90])));

        let bus = i2c.release();
        assert_eq!(bus.writes, vec![(0x18, vec![0x05])]);
    }

    #[test]
    fn blocking_adapter_reports_nack() {
        let done = Mailbox::new();
        let bus = FixedBus {
            reply: [0; 2],
            fail: true,
            writes: Vec::new(),
        };
        let mut i2c = BlockingI2c::new(bus, &done);
        i2c.open().unwrap();
        i2c.submit_write(0x44, &[0x01, 0xCE, 0x10]).unwrap();
        assert_eq!(done.take(), Some(TransferResult::Error));
    }

    #[test]
    fn blocking_adapter_refuses_before_open() {
        let done = Mailbox::new();
        let bus = FixedBus {
            reply: [0; 2],
            fail: false,
            writes: Vec::new(),
        };
        let mut i2c = BlockingI2c::new(bus, &done);
        assert_eq!(i2c.submit_write(0x44, &[0]), Err(BoardError::I2cError));
        assert!(done.is_empty());
    }

    #[test]
    fn calendar_conversion() {
        let epoch = RtccTime {
            year: 2020,
            month: 1,
            day: 1,
            ..RtccTime::default()
        };
        assert_eq!(epoch.unix_seconds(), Ok(1_577_836_800));
        assert_eq!(RtccTime::from_unix_seconds(1_577_836_800), Ok(epoch));

        let leap = RtccTime::from_unix_seconds(1_582_977_599).unwrap();
        assert_eq!(
            leap,
            RtccTime {
                year: 2020,
                month: 2,
                day: 29,
                hour: 11,
                minute: 59,
                second: 59,
            }
        );
        assert_eq!(leap.unix_seconds(), Ok(1_582_977_599));

        assert_eq!(
            RtccTime::default().unix_seconds(),
            Err(BoardError::ConfigError)
        );
        let feb_30 = RtccTime {
            day: 30,
            month: 2,
            ..epoch
        };
        assert_eq!(feb_30.unix_seconds(), Err(BoardError::ConfigError));
        let before_epoch = RtccTime {
            year: 1969,
            ..epoch
        };
        assert_eq!(before_epoch.unix_seconds(), Err(BoardError::ConfigError));
    }

    #[test]
    fn alarm_codes_match_console_range() {
        assert_eq!(AlarmMask::Minute.period_ms(), Some(60_000));
        assert_eq!(AlarmMask::Off.period_ms(), None);
        assert_eq!(AlarmMask::from_code(1), Some(AlarmMask::Second));
        assert_eq!(AlarmMask::from_code(255), Some(AlarmMask::Off));
        assert_eq!(AlarmMask::from_code(10), None);
    }
}
