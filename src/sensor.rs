//! I2C sensor control
//!
//! Drives an MCP9808 temperature sensor and an OPT3001 light sensor over a
//! shared bus with at most one transfer outstanding. Each pass either issues
//! one transfer, polls the completion of the outstanding one, or dispatches
//! from `Check`.

use crate::hal::{AlarmMask, I2cBus, Rtcc, RtccTime, TransferResult};
use crate::led_control::Ticker;
use crate::mailbox::Mailbox;
use crate::status::{SensorReadings, Shared, StatusRegisters};
use crate::BoardError;
use log::{debug, error, info, warn};

pub const MCP9808_ADDRESS: u8 = 0x18;
pub const MCP9808_REG_CONFIG: u8 = 0x01;
pub const MCP9808_REG_AMBIENT: u8 = 0x05;
pub const MCP9808_REG_DEVICE_ID: u8 = 0x07;
pub const MCP9808_CONFIG_ON: u16 = 0x0000;
pub const MCP9808_CONFIG_SHUTDOWN: u16 = 0x0100;

pub const OPT3001_ADDRESS: u8 = 0x44;
pub const OPT3001_REG_RESULT: u8 = 0x00;
pub const OPT3001_REG_CONFIG: u8 = 0x01;
pub const OPT3001_REG_DEVICE_ID: u8 = 0x7F;
pub const OPT3001_CONFIG_CONTINUOUS: u16 = 0xCE10;
pub const OPT3001_CONFIG_SHUTDOWN: u16 = 0x0000;

/// Time programmed into the RTCC at start-up
const RTCC_EPOCH: RtccTime = RtccTime {
    year: 2020,
    month: 1,
    day: 1,
    hour: 0,
    minute: 0,
    second: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorState {
    Init,
    Check,
    TurnOnMcp,
    WaitTurnOnMcp,
    TurnOnOpt,
    WaitTurnOnOpt,
    ShutdownMcp,
    WaitShutdownMcp,
    ShutdownOpt,
    WaitShutdownOpt,
    ReadTemp,
    WaitReadTemp,
    ReadLight,
    WaitReadLight,
    ReadMcpDevId,
    WaitMcpDevId,
    ReadOptDevId,
    WaitOptDevId,
    /// Bus could not be opened
    Error,
}

/// Driver-side progress of the single outstanding transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Idle,
    InProgress,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy)]
struct SensorInfo {
    device_id: u16,
    shutdown: bool,
}

impl SensorInfo {
    const fn new() -> Self {
        Self {
            device_id: 0,
            shutdown: true,
        }
    }
}

/// RTCC values exchanged with the console
///
/// Sensor control owns the RTCC; the console only sees this mirror.
pub struct RtccMirror {
    time: Shared<RtccTime>,
    alarm_request: Mailbox<AlarmMask>,
}

impl RtccMirror {
    pub const fn new() -> Self {
        Self {
            time: Shared::new(RtccTime {
                year: 0,
                month: 0,
                day: 0,
                hour: 0,
                minute: 0,
                second: 0,
            }),
            alarm_request: Mailbox::new(),
        }
    }

    /// Time captured at the last alarm refresh
    pub fn time(&self) -> RtccTime {
        self.time.get()
    }

    /// Ask sensor control to reprogram the alarm on its next pass
    pub fn request_alarm(&self, mask: AlarmMask) {
        self.alarm_request.post(mask);
    }
}

impl Default for RtccMirror {
    fn default() -> Self {
        Self::new()
    }
}

/// MCP9808 ambient register to whole degrees Celsius
///
/// Uses the datasheet conversion: the three alert flag bits are dropped and
/// `upper * 16 + lower / 16` is taken over the remaining bits. With the sign
/// bit (0x10 of the upper byte) set, the sign bit is cleared and the result
/// is `256 - (upper * 16 + lower / 16)`, so the value is never negative.
pub fn decode_temperature(register: u16) -> i16 {
    let [upper, lower] = register.to_be_bytes();
    let upper = upper & 0x1F;
    if upper & 0x10 != 0 {
        256 - (i16::from(upper & 0x0F) * 16 + i16::from(lower / 16))
    } else {
        i16::from(upper) * 16 + i16::from(lower / 16)
    }
}

/// OPT3001 result register to lux
pub fn decode_light(register: u16) -> u32 {
    let mantissa = (register & 0x0FFF) as u32;
    let exponent = (register >> 12) as u32;
    (mantissa << exponent) / 100
}

enum Transfer {
    Write(u8, u8, u16),
    Read(u8, u8),
}

pub struct SensorControl<'a, B, R> {
    state: SensorState,
    bus: B,
    rtcc: R,
    status: &'a StatusRegisters,
    ticker: &'a Ticker,
    readings: &'a SensorReadings,
    completion: &'a Mailbox<TransferResult>,
    mirror: &'a RtccMirror,
    transfer: TransferStatus,
    mcp9808: SensorInfo,
    opt3001: SensorInfo,
}

impl<'a, B, R> SensorControl<'a, B, R>
where
    B: I2cBus,
    R: Rtcc,
{
    pub fn new(
        bus: B,
        rtcc: R,
        status: &'a StatusRegisters,
        ticker: &'a Ticker,
        readings: &'a SensorReadings,
        completion: &'a Mailbox<TransferResult>,
        mirror: &'a RtccMirror,
    ) -> Self {
        Self {
            state: SensorState::Init,
            bus,
            rtcc,
            status,
            ticker,
            readings,
            completion,
            mirror,
            transfer: TransferStatus::Idle,
            mcp9808: SensorInfo::new(),
            opt3001: SensorInfo::new(),
        }
    }

    pub fn state(&self) -> SensorState {
        self.state
    }

    pub fn transfer_status(&self) -> TransferStatus {
        self.transfer
    }

    pub fn read_temperature(&self) -> i16 {
        self.readings.temperature()
    }

    pub fn read_light(&self) -> u32 {
        self.readings.light()
    }

    /// Run one pass of the machine
    pub fn step(&mut self) {
        use SensorState::*;

        self.state = match self.state {
            Init => self.init(),
            Check => self.check(),

            TurnOnMcp => self.issue(
                Transfer::Write(MCP9808_ADDRESS, MCP9808_REG_CONFIG, MCP9808_CONFIG_ON),
                WaitTurnOnMcp,
                TurnOnOpt,
            ),
            WaitTurnOnMcp => self.await_transfer(TurnOnOpt, |s, _| {
                s.mcp9808.shutdown = false;
                info!("[CTRL] MCP9808 on");
            }),
            TurnOnOpt => self.issue(
                Transfer::Write(
                    OPT3001_ADDRESS,
                    OPT3001_REG_CONFIG,
                    OPT3001_CONFIG_CONTINUOUS,
                ),
                WaitTurnOnOpt,
                ReadTemp,
            ),
            WaitTurnOnOpt => self.await_transfer(ReadTemp, |s, _| {
                s.opt3001.shutdown = false;
                info!("[CTRL] OPT3001 on");
            }),

            ShutdownMcp => self.issue(
                Transfer::Write(MCP9808_ADDRESS, MCP9808_REG_CONFIG, MCP9808_CONFIG_SHUTDOWN),
                WaitShutdownMcp,
                ShutdownOpt,
            ),
            WaitShutdownMcp => self.await_transfer(ShutdownOpt, |s, _| {
                s.mcp9808.shutdown = true;
                info!("[CTRL] MCP9808 shut down");
            }),
            ShutdownOpt => self.issue(
                Transfer::Write(OPT3001_ADDRESS, OPT3001_REG_CONFIG, OPT3001_CONFIG_SHUTDOWN),
                WaitShutdownOpt,
                ReadTemp,
            ),
            WaitShutdownOpt => self.await_transfer(ReadTemp, |s, _| {
                s.opt3001.shutdown = true;
                info!("[CTRL] OPT3001 shut down");
            }),

            ReadTemp => self.issue(
                Transfer::Read(MCP9808_ADDRESS, MCP9808_REG_AMBIENT),
                WaitReadTemp,
                ReadLight,
            ),
            WaitReadTemp => self.await_transfer(ReadLight, |s, register| {
                let celsius = decode_temperature(register);
                s.readings.store_temperature(celsius);
                debug!("[CTRL] Temperature {} C", celsius);
            }),
            ReadLight => self.issue(
                Transfer::Read(OPT3001_ADDRESS, OPT3001_REG_RESULT),
                WaitReadLight,
                Check,
            ),
            WaitReadLight => self.await_transfer(Check, |s, register| {
                let lux = decode_light(register);
                s.readings.store_light(lux);
                debug!("[CTRL] Light {} lux", lux);
            }),

            ReadMcpDevId => self.issue(
                Transfer::Read(MCP9808_ADDRESS, MCP9808_REG_DEVICE_ID),
                WaitMcpDevId,
                Check,
            ),
            WaitMcpDevId => self.await_transfer(Check, |s, register| {
                s.mcp9808.device_id = register;
                s.publish_device_ids();
                info!("[CTRL] MCP9808 device ID 0x{:04X}", register);
            }),
            ReadOptDevId => self.issue(
                Transfer::Read(OPT3001_ADDRESS, OPT3001_REG_DEVICE_ID),
                WaitOptDevId,
                Check,
            ),
            WaitOptDevId => self.await_transfer(Check, |s, register| {
                s.opt3001.device_id = register;
                s.publish_device_ids();
                info!("[CTRL] OPT3001 device ID 0x{:04X}", register);
            }),

            Error => Error,
        };
    }

    fn init(&mut self) -> SensorState {
        if let Err(e) = self.bus.open() {
            error!("[CTRL] Failed to open I2C bus: {:?}", e);
            return SensorState::Error;
        }
        if let Err(e) = self.rtcc.set_time(RTCC_EPOCH) {
            warn!("[CTRL] RTCC set time failed: {:?}", e);
        }
        if let Err(e) = self.rtcc.set_alarm(AlarmMask::Second) {
            warn!("[CTRL] RTCC alarm setup failed: {:?}", e);
        }
        SensorState::Check
    }

    fn check(&mut self) -> SensorState {
        if let Some(mask) = self.mirror.alarm_request.take() {
            match self.rtcc.set_alarm(mask) {
                Ok(()) => info!("[CTRL] RTCC alarm set to {:?}", mask),
                Err(e) => warn!("[CTRL] RTCC alarm change failed: {:?}", e),
            }
        }

        if self.status.rtcc_alarm.take() {
            self.mirror.time.set(self.rtcc.time());
        }

        if self.ticker.take_turn_on_request() {
            return SensorState::TurnOnMcp;
        }
        if self.ticker.take_shutdown_request() {
            return SensorState::ShutdownMcp;
        }
        if self.mcp9808.device_id == 0 && !self.mcp9808.shutdown {
            return SensorState::ReadMcpDevId;
        }
        if self.opt3001.device_id == 0 && !self.opt3001.shutdown {
            return SensorState::ReadOptDevId;
        }
        if self.ticker.read_due() && !self.mcp9808.shutdown && !self.opt3001.shutdown {
            self.ticker.take_read_due();
            return SensorState::ReadTemp;
        }
        SensorState::Check
    }

    /// Queue `transfer`; a refused submission skips its wait state
    fn issue(
        &mut self,
        transfer: Transfer,
        wait: SensorState,
        skip: SensorState,
    ) -> SensorState {
        match self.submit(transfer) {
            Ok(()) => wait,
            Err(e) => {
                warn!("[CTRL] I2C submit failed in {:?}: {:?}", self.state, e);
                skip
            }
        }
    }

    fn submit(&mut self, transfer: Transfer) -> Result<(), BoardError> {
        if self.transfer == TransferStatus::InProgress {
            return Err(BoardError::I2cBusy);
        }
        self.completion.clear();
        self.transfer = TransferStatus::InProgress;

        let result = match transfer {
            Transfer::Write(address, register, value) => {
                let [hi, lo] = value.to_be_bytes();
                self.bus.submit_write(address, &[register, hi, lo])
            }
            Transfer::Read(address, register) => self.bus.submit_read_register(address, register),
        };
        if result.is_err() {
            self.transfer = TransferStatus::Idle;
        }
        result
    }

    /// Poll the outstanding transfer; on success run `on_success` with the
    /// big-endian register word. Errors keep the last readings.
    fn await_transfer(
        &mut self,
        next: SensorState,
        on_success: impl FnOnce(&mut Self, u16),
    ) -> SensorState {
        let Some(result) = self.completion.take() else {
            return self.state;
        };

        match result {
            TransferResult::Success(rx) => {
                self.transfer = TransferStatus::Success;
                on_success(self, u16::from_be_bytes(rx));
            }
            TransferResult::Error => {
                self.transfer = TransferStatus::Error;
                error!("[CTRL] I2C transfer failed in {:?}", self.state);
            }
        }
        next
    }

    fn publish_device_ids(&self) {
        self.readings
            .store_device_ids(self.mcp9808.device_id, self.opt3001.device_id);
    }
}
