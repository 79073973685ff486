//! Line commands for the debug console
//!
//! Each command is a thin wrapper over one core operation; output goes to
//! any `core::fmt::Write` sink.

use crate::hal::{AlarmMask, PowerController, SystemControl};
use crate::power::PowerManager;
use crate::sensor::RtccMirror;
use crate::status::{SensorReadings, Shared, StatusRegisters};
use crate::storage::DeviceInfo;
use crate::wifi::NetworkInfo;
use core::fmt::{self, Write};
use log::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    UnixTime,
    Rssi,
    Rtcc,
    RtccFreq(AlarmMask),
    PowerMode(u8),
    SelfTest,
    Debug(LevelFilter),
    Reboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleError {
    Empty,
    Unknown,
    /// Bad or missing argument; carries the usage line
    Usage(&'static str),
}

const RTCC_FREQ_USAGE: &str = "rtcc_freq <0-9|255>";
const POWER_MODE_USAGE: &str = "power_mode <0-5>";
const DEBUG_USAGE: &str = "debug <0-5>";

fn level_from_code(code: u8) -> Option<LevelFilter> {
    Some(match code {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        _ => return None,
    })
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ConsoleError> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(ConsoleError::Empty)?;
        let arg = words.next().and_then(|w| w.parse::<u8>().ok());

        match name {
            "unixtime" => Ok(Self::UnixTime),
            "rssi" => Ok(Self::Rssi),
            "rtcc" => Ok(Self::Rtcc),
            "rtcc_freq" => arg
                .and_then(AlarmMask::from_code)
                .map(Self::RtccFreq)
                .ok_or(ConsoleError::Usage(RTCC_FREQ_USAGE)),
            "power_mode" => arg
                .map(Self::PowerMode)
                .ok_or(ConsoleError::Usage(POWER_MODE_USAGE)),
            "self_tester" => Ok(Self::SelfTest),
            "debug" => arg
                .and_then(level_from_code)
                .map(Self::Debug)
                .ok_or(ConsoleError::Usage(DEBUG_USAGE)),
            "reboot" => Ok(Self::Reboot),
            _ => Err(ConsoleError::Unknown),
        }
    }
}

pub struct ConsoleContext<'a> {
    pub status: &'a StatusRegisters,
    pub readings: &'a SensorReadings,
    pub network: &'a Shared<NetworkInfo>,
    pub rtcc: &'a RtccMirror,
    pub device: &'a Shared<DeviceInfo>,
}

pub struct Console<'a, P, S> {
    power: PowerManager<'a, P>,
    system: S,
    ctx: ConsoleContext<'a>,
}

impl<'a, P, S> Console<'a, P, S>
where
    P: PowerController,
    S: SystemControl,
{
    pub fn new(power: PowerManager<'a, P>, system: S, ctx: ConsoleContext<'a>) -> Self {
        Self { power, system, ctx }
    }

    /// Parse and run one input line
    pub fn execute(&mut self, line: &str, out: &mut impl Write) -> fmt::Result {
        match Command::parse(line) {
            Ok(command) => self.run(command, out),
            Err(ConsoleError::Empty) => Ok(()),
            Err(ConsoleError::Usage(usage)) => writeln!(out, "usage: {}", usage),
            Err(ConsoleError::Unknown) => writeln!(
                out,
                "commands: unixtime rssi rtcc rtcc_freq power_mode self_tester debug reboot"
            ),
        }
    }

    pub fn run(&mut self, command: Command, out: &mut impl Write) -> fmt::Result {
        match command {
            Command::UnixTime => match self.ctx.network.get().unix_time {
                Some(seconds) => writeln!(out, "Unix time: {}", seconds),
                None => writeln!(out, "Unix time: not synchronized"),
            },
            Command::Rssi => {
                let rssi = self.ctx.network.get().rssi;
                match rssi.filter(|_| self.ctx.status.wifi_connected.get()) {
                    Some(dbm) => writeln!(out, "RSSI: {} dBm", dbm),
                    None => writeln!(out, "RSSI: not connected"),
                }
            }
            Command::Rtcc => {
                let t = self.ctx.rtcc.time();
                writeln!(
                    out,
                    "RTCC: {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    t.year, t.month, t.day, t.hour, t.minute, t.second
                )
            }
            Command::RtccFreq(mask) => {
                self.ctx.rtcc.request_alarm(mask);
                writeln!(out, "RTCC alarm: {:?}", mask)
            }
            Command::PowerMode(code) => match self.power.set_power_mode(code) {
                Ok(mode) => writeln!(out, "Power mode: {:?}", mode),
                Err(e) => writeln!(out, "Power mode {} rejected: {:?}", code, e),
            },
            Command::SelfTest => self.self_test(out),
            Command::Debug(level) => {
                log::set_max_level(level);
                writeln!(out, "Debug level: {}", level)
            }
            Command::Reboot => {
                writeln!(out, "Rebooting")?;
                self.system.soft_reset();
                Ok(())
            }
        }
    }

    fn self_test(&self, out: &mut impl Write) -> fmt::Result {
        let device = self.ctx.device.get();
        let checks = [
            ("secure element", device.serial.is_some()),
            ("mass storage", device.mounted),
            ("temperature sensor", self.ctx.readings.temperature_device_id() != 0),
            ("light sensor", self.ctx.readings.light_device_id() != 0),
        ];

        let mut passed = true;
        for (name, ok) in checks {
            writeln!(out, "{} {}", if ok { "PASS" } else { "FAIL" }, name)?;
            passed &= ok;
        }
        writeln!(out, "Self test {}", if passed { "passed" } else { "failed" })
    }
}
