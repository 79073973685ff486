#![cfg_attr(not(test), no_std)]

//! Cloud-connected sensor board library
//!
//! This library provides the cooperatively stepped state machines of an IoT
//! sensor board: Wi-Fi lifecycle, access-point provisioning, MQTT cloud
//! session, I2C sensor control, credential persistence on mass storage and
//! power-mode control. Hardware is reached only through the traits in [`hal`].

extern crate alloc;

pub mod cloud;
pub mod console;
pub mod credentials;
pub mod flash_block;
pub mod hal;
pub mod led_control;
pub mod mailbox;
pub mod power;
pub mod provisioning;
pub mod sensor;
pub mod sntp;
pub mod status;
pub mod storage;
pub mod volume;
pub mod wifi;

#[cfg(feature = "esp32c3")]
pub mod esp;

#[cfg(test)]
mod mock;

/// Project version information
pub const VERSION: &str = "0.1.0-dev";

/// Default configuration constants
pub mod config {
    /// Tick engine period in milliseconds
    pub const TIMER_RESOLUTION_MS: u32 = 50;

    /// LED blink periods
    pub const LED_FAST_BLINK_PERIOD_MS: u32 = 300;
    pub const LED_SLOW_BLINK_PERIOD_MS: u32 = 2000;

    /// Sensor poll cadence
    pub const SENSORS_READ_PERIOD_MS: u32 = 2000;

    /// Cloud telemetry publish cadence
    pub const PUBLISH_PERIOD_MS: u32 = 1000;

    /// Back-off between two failed MQTT connect attempts
    pub const MQTT_RETRY_MS: u32 = 1000;

    /// Task polling intervals ("step, then sleep")
    pub const WIFI_TASK_PERIOD_MS: u64 = 100;
    pub const PROV_TASK_PERIOD_MS: u64 = 50;
    pub const CLOUD_TASK_PERIOD_MS: u64 = 50;
    pub const CTRL_TASK_PERIOD_MS: u64 = 10;
    pub const MSD_TASK_PERIOD_MS: u64 = 50;

    /// Provisioning TCP server
    pub const PROV_SERVER_PORT: u16 = 80;
    pub const PROV_BUFFER_SIZE: usize = 256;

    /// Access point used while provisioning
    pub const AP_SSID_PREFIX: &str = "IoT-Board_";
    pub const AP_PSK: &str = "1234567890";
    pub const AP_CHANNEL: u8 = 1;
    pub const AP_ADDRESS: [u8; 4] = [192, 168, 1, 1];

    /// Station defaults, read from environment variables at compile time
    pub const WIFI_SSID: &str = env!("WIFI_SSID");
    pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");
    pub const WIFI_AUTH: &str = env!("WIFI_AUTH");

    /// MQTT broker host name written to a fresh cloud.json
    pub const CLOUD_ENDPOINT: &str = env!("CLOUD_ENDPOINT");
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_TOPIC_MAX: usize = 128;
    pub const MQTT_PAYLOAD_MAX: usize = 256;
    pub const MQTT_KEEP_ALIVE_SECS: u16 = 60;

    /// RTCC dead-man's switch armed before any low-power mode
    pub const WAKE_ALARM_SECONDS: u32 = 10;

    /// Mass storage layout
    pub const DRIVE_LABEL: &str = "CURIOSITY";
    pub const WIFI_CONFIG_FILE: &str = "WIFI.CFG";
    pub const CLOUD_CONFIG_FILE: &str = "cloud.json";
    pub const CLICKME_FILE: &str = "clickme.html";
    pub const VOICE_FILE: &str = "voice.html";
    pub const KIT_INFO_FILE: &str = "kit-info.html";
    pub const LEGACY_FILE: &str = "FILE.txt";

    /// Flash erase block holding the credential file; the `nvs` partition
    /// of the default partition table, which nothing else on the board uses
    pub const WIFI_CONFIG_FLASH_OFFSET: u32 = 0x9000;

    /// SNTP server queried by the firmware
    pub const SNTP_SERVER: [u8; 4] = [216, 239, 35, 0];
    pub const SNTP_RESYNC_SECS: u64 = 3600;
    pub const SNTP_RETRY_SECS: u64 = 10;
}

/// Error types for the cloud board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardError {
    /// I2C transfer could not be queued or failed
    I2cError,
    /// A transfer is already outstanding on the bus
    I2cBusy,
    /// WiFi driver error
    WiFiError,
    /// TCP/IP stack error
    TcpIpError,
    /// Socket error
    SocketError,
    /// MQTT client error
    MqttError,
    /// Filesystem error
    StorageError,
    /// USB device error
    UsbError,
    /// Secure element error
    CryptoError,
    /// Power controller error
    PowerError,
    /// Missing or malformed configuration
    ConfigError,
    /// Protocol parsing error
    ProtocolError,
}
