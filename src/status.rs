//! Shared status registers
//!
//! Every field has exactly one writing machine and any number of readers.
//! Fields are plain atomics used with `load`/`store` only, so they work on
//! single-core targets without compare-and-swap.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU16, AtomicU32, Ordering};
use critical_section::Mutex;

/// Boolean register with a single owning writer
#[derive(Debug, Default)]
pub struct Flag(AtomicBool);

impl Flag {
    pub const fn new(value: bool) -> Self {
        Self(AtomicBool::new(value))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }

    /// Read and clear; only the consuming side of a handoff may call this
    pub fn take(&self) -> bool {
        let value = self.get();
        if value {
            self.set(false);
        }
        value
    }
}

/// Validity of the persisted Wi-Fi credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CredentialValidity {
    Uninitialized = 0,
    Valid = 1,
    Invalid = 2,
}

impl CredentialValidity {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Valid,
            2 => Self::Invalid,
            _ => Self::Uninitialized,
        }
    }
}

/// Process-wide status registers
///
/// Owners are noted per field; nothing else writes them.
#[derive(Debug)]
pub struct StatusRegisters {
    /// Owner: Wi-Fi lifecycle
    pub wifi_connected: Flag,
    /// Owner: Wi-Fi lifecycle
    pub ip_obtained: Flag,
    /// Owner: Wi-Fi lifecycle
    pub ntp_done: Flag,
    /// Owner: Wi-Fi lifecycle
    pub ap_ready: Flag,
    /// Owner: cloud session
    pub mqtt_connected: Flag,
    /// Sampled at boot, cleared by the machine that consumes the press
    pub sw1_pressed: Flag,
    /// Sampled at boot, cleared by the machine that consumes the press
    pub sw2_pressed: Flag,
    /// Set by the power controller, cleared by the Wi-Fi lifecycle
    pub wifi_on_requested: Flag,
    /// Set by the power controller, cleared by the Wi-Fi lifecycle
    pub wifi_off_requested: Flag,
    /// Set by the RTCC alarm interrupt, cleared by sensor control
    pub rtcc_alarm: Flag,
    /// Owner: credential storage
    credentials: AtomicU8,
}

impl StatusRegisters {
    pub const fn new() -> Self {
        Self {
            wifi_connected: Flag::new(false),
            ip_obtained: Flag::new(false),
            ntp_done: Flag::new(false),
            ap_ready: Flag::new(false),
            mqtt_connected: Flag::new(false),
            sw1_pressed: Flag::new(false),
            sw2_pressed: Flag::new(false),
            wifi_on_requested: Flag::new(false),
            wifi_off_requested: Flag::new(false),
            rtcc_alarm: Flag::new(false),
            credentials: AtomicU8::new(CredentialValidity::Uninitialized as u8),
        }
    }

    pub fn credential_validity(&self) -> CredentialValidity {
        CredentialValidity::from_raw(self.credentials.load(Ordering::Acquire))
    }

    pub fn set_credential_validity(&self, validity: CredentialValidity) {
        self.credentials.store(validity as u8, Ordering::Release);
    }

    /// Wi-Fi associated, address leased and wall clock synchronized
    pub fn network_ready(&self) -> bool {
        self.wifi_connected.get() && self.ip_obtained.get() && self.ntp_done.get()
    }
}

impl Default for StatusRegisters {
    fn default() -> Self {
        Self::new()
    }
}

/// Last sensor values, written by sensor control only
#[derive(Debug, Default)]
pub struct SensorReadings {
    temperature: AtomicI32,
    light: AtomicU32,
    temperature_id: AtomicU16,
    light_id: AtomicU16,
}

impl SensorReadings {
    pub const fn new() -> Self {
        Self {
            temperature: AtomicI32::new(0),
            light: AtomicU32::new(0),
            temperature_id: AtomicU16::new(0),
            light_id: AtomicU16::new(0),
        }
    }

    /// Ambient temperature in degrees Celsius
    pub fn temperature(&self) -> i16 {
        self.temperature.load(Ordering::Acquire) as i16
    }

    /// Ambient light in lux
    pub fn light(&self) -> u32 {
        self.light.load(Ordering::Acquire)
    }

    pub fn temperature_device_id(&self) -> u16 {
        self.temperature_id.load(Ordering::Acquire)
    }

    pub fn light_device_id(&self) -> u16 {
        self.light_id.load(Ordering::Acquire)
    }

    pub(crate) fn store_temperature(&self, celsius: i16) {
        self.temperature.store(celsius as i32, Ordering::Release);
    }

    pub(crate) fn store_light(&self, lux: u32) {
        self.light.store(lux, Ordering::Release);
    }

    pub(crate) fn store_device_ids(&self, temperature: u16, light: u16) {
        self.temperature_id.store(temperature, Ordering::Release);
        self.light_id.store(light, Ordering::Release);
    }
}

/// Critical-section protected value shared between tasks
pub struct Shared<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with exclusive access to the value
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    pub fn set(&self, value: T) {
        self.with(|slot| *slot = value);
    }
}

impl<T: Clone> Shared<T> {
    pub fn get(&self) -> T {
        self.with(|value| value.clone())
    }
}
