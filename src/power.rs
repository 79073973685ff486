//! Power-mode control
//!
//! | code | CPU        | Wi-Fi         |
//! |------|------------|---------------|
//! | 0    | idle       | power save on |
//! | 1    | idle       | off           |
//! | 2    | sleep      | power save on |
//! | 3    | sleep      | off           |
//! | 4    | deep sleep | radio down    |
//! | 5    | running    | resume        |
//!
//! Every mode is refused while an MQTT session is open. All modes except
//! resume arm the RTCC wake alarm first.

use crate::config;
use crate::hal::{CpuPowerMode, InterruptSource, PowerController};
use crate::status::StatusRegisters;
use crate::BoardError;
use heapless::Vec;
use log::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    IdleWifiLowPower,
    IdleWifiOff,
    SleepWifiLowPower,
    SleepWifiOff,
    DeepSleep,
    WifiResume,
}

impl PowerMode {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::IdleWifiLowPower,
            1 => Self::IdleWifiOff,
            2 => Self::SleepWifiLowPower,
            3 => Self::SleepWifiOff,
            4 => Self::DeepSleep,
            5 => Self::WifiResume,
            _ => return None,
        })
    }

    fn cpu_mode(self) -> Option<CpuPowerMode> {
        match self {
            Self::IdleWifiLowPower | Self::IdleWifiOff => Some(CpuPowerMode::Idle),
            Self::SleepWifiLowPower | Self::SleepWifiOff => Some(CpuPowerMode::Sleep),
            Self::DeepSleep => Some(CpuPowerMode::DeepSleep),
            Self::WifiResume => None,
        }
    }

    fn wifi_off(self) -> bool {
        matches!(self, Self::IdleWifiOff | Self::SleepWifiOff)
    }
}

pub struct PowerManager<'a, P> {
    controller: P,
    status: &'a StatusRegisters,
}

impl<'a, P> PowerManager<'a, P>
where
    P: PowerController,
{
    pub fn new(controller: P, status: &'a StatusRegisters) -> Self {
        Self { controller, status }
    }

    /// Apply power mode `code`; returns after wake for idle and sleep
    pub fn set_power_mode(&mut self, code: u8) -> Result<PowerMode, BoardError> {
        let Some(mode) = PowerMode::from_code(code) else {
            error!("[PM] Invalid power mode {}", code);
            return Err(BoardError::ConfigError);
        };

        if self.status.mqtt_connected.get() {
            error!("[PM] Refusing {:?} while the MQTT session is open", mode);
            return Err(BoardError::PowerError);
        }

        let Some(cpu_mode) = mode.cpu_mode() else {
            info!("[PM] Wi-Fi resume requested");
            self.status.wifi_on_requested.set(true);
            return Ok(mode);
        };

        if let Err(e) = self.controller.arm_wake_alarm(config::WAKE_ALARM_SECONDS) {
            error!("[PM] Wake alarm not armed: {:?}", e);
            return Err(e);
        }

        info!("[PM] Entering {:?}", mode);
        if cpu_mode == CpuPowerMode::DeepSleep {
            self.controller.power_down_radio();
            self.controller.enter(CpuPowerMode::DeepSleep);
            return Ok(mode);
        }

        if mode.wifi_off() {
            self.controller.power_down_radio();
        }

        let mut restore: Vec<InterruptSource, { InterruptSource::ALL.len() }> = Vec::new();
        for source in InterruptSource::ALL {
            if self.controller.interrupt_enabled(source) {
                let _ = restore.push(source);
            }
            self.controller.disable_interrupt(source);
        }

        self.controller.enter(cpu_mode);

        for source in restore {
            self.controller.enable_interrupt(source);
        }
        info!("[PM] Woke from {:?}", mode);

        if mode.wifi_off() {
            self.status.wifi_off_requested.set(true);
        }
        Ok(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPower, PowerCall};

    fn manager(status: &StatusRegisters) -> (PowerManager<'_, MockPower>, MockPower) {
        let power = MockPower::new();
        power.state().enabled = vec![
            InterruptSource::Usb,
            InterruptSource::I2c1,
            InterruptSource::RfMac,
        ];
        (PowerManager::new(power.clone(), status), power)
    }

    #[test]
    fn invalid_code_is_rejected() {
        let status = StatusRegisters::new();
        let (mut pm, power) = manager(&status);
        assert_eq!(pm.set_power_mode(6), Err(BoardError::ConfigError));
        assert!(power.state().calls.is_empty());
    }

    #[test]
    fn refused_while_mqtt_connected() {
        let status = StatusRegisters::new();
        status.mqtt_connected.set(true);
        let (mut pm, power) = manager(&status);
        for code in 0..=5 {
            assert_eq!(pm.set_power_mode(code), Err(BoardError::PowerError));
        }
        assert!(power.state().calls.is_empty());
        assert!(!status.wifi_on_requested.get());
        assert!(!status.wifi_off_requested.get());
    }

    #[test]
    fn idle_restores_exactly_the_enabled_sources() {
        let status = StatusRegisters::new();
        let (mut pm, power) = manager(&status);
        assert_eq!(pm.set_power_mode(0), Ok(PowerMode::IdleWifiLowPower));

        let calls = power.state().calls.clone();
        assert_eq!(calls[0], PowerCall::ArmAlarm(10));
        let enter = calls
            .iter()
            .position(|c| *c == PowerCall::Enter(CpuPowerMode::Idle))
            .unwrap();
        assert_eq!(enter, 1 + InterruptSource::ALL.len());
        assert!(calls[1..enter]
            .iter()
            .all(|c| matches!(c, PowerCall::Disable(_))));
        assert_eq!(
            &calls[enter + 1..],
            &[
                PowerCall::Enable(InterruptSource::Usb),
                PowerCall::Enable(InterruptSource::I2c1),
                PowerCall::Enable(InterruptSource::RfMac),
            ]
        );
        assert!(!calls.contains(&PowerCall::RadioDown));
        assert!(!status.wifi_off_requested.get());
    }

    #[test]
    fn sleep_with_wifi_off_raises_power_off_request() {
        let status = StatusRegisters::new();
        let (mut pm, power) = manager(&status);
        assert_eq!(pm.set_power_mode(3), Ok(PowerMode::SleepWifiOff));
        let calls = power.state().calls.clone();
        assert_eq!(calls[1], PowerCall::RadioDown);
        assert!(calls.contains(&PowerCall::Enter(CpuPowerMode::Sleep)));
        assert!(status.wifi_off_requested.get());
    }

    #[test]
    fn deep_sleep_does_not_restore() {
        let status = StatusRegisters::new();
        let (mut pm, power) = manager(&status);
        pm.set_power_mode(4).unwrap();
        assert_eq!(
            power.state().calls,
            vec![
                PowerCall::ArmAlarm(10),
                PowerCall::RadioDown,
                PowerCall::Enter(CpuPowerMode::DeepSleep),
            ]
        );
    }

    #[test]
    fn resume_only_requests_power_on() {
        let status = StatusRegisters::new();
        let (mut pm, power) = manager(&status);
        assert_eq!(pm.set_power_mode(5), Ok(PowerMode::WifiResume));
        assert!(status.wifi_on_requested.get());
        assert!(power.state().calls.is_empty());
    }

    #[test]
    fn alarm_failure_aborts() {
        let status = StatusRegisters::new();
        let (mut pm, power) = manager(&status);
        power.state().alarm_fails = true;
        assert_eq!(pm.set_power_mode(1), Err(BoardError::PowerError));
        assert!(power.state().calls.is_empty());
        assert!(!status.wifi_off_requested.get());
    }
}
