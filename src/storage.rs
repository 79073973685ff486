//! Mass storage and credential persistence
//!
//! Mounts the drive, formats it on request or when it carries no
//! filesystem, seeds the cloud files from the secure element, reads the
//! Wi-Fi credential file back and exposes the drive over USB. A credential
//! rewrite detaches USB, replaces the file and resets the device.

use crate::cloud::CloudConfig;
use crate::config;
use crate::credentials::WifiCredentials;
use crate::hal::{CryptoElement, FileSystem, MountStatus, SystemControl, UsbDevice};
use crate::status::{CredentialValidity, Flag, Shared, StatusRegisters};
use alloc::format;
use alloc::string::String;
use core::fmt::Write;
use log::{debug, error, info, warn};

/// Requests posted to the storage machine by other tasks
pub struct StorageRequests {
    pub rewrite: Flag,
    pub unmount: Flag,
}

impl StorageRequests {
    pub const fn new() -> Self {
        Self {
            rewrite: Flag::new(false),
            unmount: Flag::new(false),
        }
    }

    /// Persist the current credential record and reboot
    pub fn request_rewrite(&self) {
        self.rewrite.set(true);
    }

    pub fn request_unmount(&self) {
        self.unmount.set(true);
    }
}

impl Default for StorageRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Facts reported by the self-test
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub mounted: bool,
    pub serial: Option<String>,
}

impl DeviceInfo {
    pub const fn new() -> Self {
        Self {
            mounted: false,
            serial: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    Init,
    /// Reset requested; nothing left to do
    Pending,
    WaitFsMount,
    ClearDrive,
    TouchCloudFiles,
    TouchWifiConfigFile,
    Connect,
    FsUnmount,
    Deinit,
    Idle,
    Error,
}

fn hex(bytes: &[u8], upper: bool) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = if upper {
            write!(out, "{:02X}", byte)
        } else {
            write!(out, "{:02x}", byte)
        };
    }
    out
}

fn redirect_page(url: &str) -> String {
    format!(
        "<html><body><script type=\"text/javascript\">window.location.href =\"{}\";</script></body></html>",
        url
    )
}

fn clickme_page(client_id: &str) -> String {
    redirect_page(&format!(
        "https://console.aws.amazon.com/iot/home#/thing/{}",
        client_id
    ))
}

fn voice_page(client_id: &str) -> String {
    redirect_page(&format!(
        "https://console.aws.amazon.com/iot/home#/thing/{}/namedShadow/Classic%20Shadow",
        client_id
    ))
}

fn kit_info_page(serial: &str) -> String {
    redirect_page(&format!(
        "https://github.com/search?q=cloud-board-rs&serial={}",
        serial
    ))
}

pub struct StorageContext<'a> {
    pub status: &'a StatusRegisters,
    pub credentials: &'a Shared<WifiCredentials>,
    pub cloud: &'a Shared<CloudConfig>,
    pub requests: &'a StorageRequests,
    pub device: &'a Shared<DeviceInfo>,
}

pub struct MassStorage<'a, F, U, C, S> {
    state: StorageState,
    fs: F,
    usb: U,
    crypto: C,
    system: S,
    ctx: StorageContext<'a>,
    rewrite: bool,
}

impl<'a, F, U, C, S> MassStorage<'a, F, U, C, S>
where
    F: FileSystem,
    U: UsbDevice,
    C: CryptoElement,
    S: SystemControl,
{
    pub fn new(fs: F, usb: U, crypto: C, system: S, ctx: StorageContext<'a>) -> Self {
        Self {
            state: StorageState::Init,
            fs,
            usb,
            crypto,
            system,
            ctx,
            rewrite: false,
        }
    }

    pub fn state(&self) -> StorageState {
        self.state
    }

    /// Run one pass of the machine
    pub fn step(&mut self) {
        if self.ctx.requests.rewrite.take() {
            info!("[MSD] Credential rewrite requested");
            self.rewrite = true;
            self.state = StorageState::Deinit;
        } else if self.ctx.requests.unmount.take() {
            self.state = StorageState::FsUnmount;
        }

        let next = match self.state {
            StorageState::Init => StorageState::WaitFsMount,
            StorageState::Pending => StorageState::Pending,
            StorageState::WaitFsMount => self.wait_mount(),
            StorageState::ClearDrive => match self.fs.format() {
                Ok(()) => {
                    info!("[MSD] Drive formatted");
                    StorageState::TouchCloudFiles
                }
                Err(e) => {
                    error!("[MSD] Format failed: {:?}", e);
                    StorageState::Error
                }
            },
            StorageState::TouchCloudFiles => {
                self.touch_cloud_files();
                StorageState::TouchWifiConfigFile
            }
            StorageState::TouchWifiConfigFile => self.touch_wifi_config(),
            StorageState::Connect => match self.usb.attach() {
                Ok(()) => {
                    info!("[MSD] Drive exposed over USB");
                    StorageState::Idle
                }
                Err(e) => {
                    error!("[MSD] USB attach failed: {:?}", e);
                    StorageState::Error
                }
            },
            StorageState::FsUnmount => match self.fs.unmount() {
                Ok(()) => {
                    self.ctx.device.with(|d| d.mounted = false);
                    StorageState::Deinit
                }
                Err(e) => {
                    error!("[MSD] Unmount failed: {:?}", e);
                    StorageState::Error
                }
            },
            StorageState::Deinit => self.deinit(),
            StorageState::Idle => StorageState::Idle,
            StorageState::Error => {
                // Wi-Fi waits on a verdict; never leave it undecided
                self.ctx
                    .status
                    .set_credential_validity(CredentialValidity::Invalid);
                StorageState::Idle
            }
        };

        if next != self.state {
            debug!("[MSD] {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    fn wait_mount(&mut self) -> StorageState {
        let status = self.ctx.status;

        match self.fs.poll_mount() {
            MountStatus::Pending => StorageState::WaitFsMount,
            MountStatus::NoFilesystem => {
                info!("[MSD] No filesystem, formatting");
                StorageState::ClearDrive
            }
            MountStatus::Mounted => {
                info!("[MSD] Filesystem mounted");
                self.ctx.device.with(|d| d.mounted = true);
                if self.fs.exists(config::LEGACY_FILE) {
                    if let Err(e) = self.fs.remove(config::LEGACY_FILE) {
                        warn!("[MSD] Could not remove {}: {:?}", config::LEGACY_FILE, e);
                    }
                }
                if status.sw1_pressed.get() && status.sw2_pressed.get() {
                    info!("[MSD] Factory reset requested");
                    status.sw1_pressed.set(false);
                    status.sw2_pressed.set(false);
                    StorageState::ClearDrive
                } else {
                    StorageState::TouchCloudFiles
                }
            }
        }
    }

    fn write_if_absent(&mut self, path: &str, contents: impl FnOnce() -> String) {
        if self.fs.exists(path) {
            return;
        }
        match self.fs.write(path, contents().as_bytes()) {
            Ok(()) => info!("[MSD] Wrote {}", path),
            Err(e) => error!("[MSD] Failed to write {}: {:?}", path, e),
        }
    }

    /// Best effort; every failure is logged and skipped
    fn touch_cloud_files(&mut self) {
        if let Err(e) = self.fs.set_label(config::DRIVE_LABEL) {
            warn!("[MSD] Drive label not set: {:?}", e);
        }

        if let Err(e) = self.crypto.init() {
            error!("[MSD] Secure element init failed: {:?}", e);
            return;
        }

        let serial = match self.crypto.serial_number() {
            Ok(serial) => hex(&serial, true),
            Err(e) => {
                error!("[MSD] Serial number read failed: {:?}", e);
                return;
            }
        };
        self.ctx.device.with(|d| d.serial = Some(serial.clone()));

        let certificate_file = format!("{}.cer", serial);
        if !self.fs.exists(&certificate_file) {
            match self.crypto.device_certificate_pem() {
                Ok(pem) => self.write_if_absent(&certificate_file, || pem),
                Err(e) => error!("[MSD] Device certificate read failed: {:?}", e),
            }
        }

        let missing = [
            config::CLICKME_FILE,
            config::VOICE_FILE,
            config::CLOUD_CONFIG_FILE,
        ]
        .iter()
        .any(|path| !self.fs.exists(path));

        if missing {
            match self.crypto.subject_key_id() {
                Ok(key_id) => {
                    let client_id = hex(&key_id, false);
                    info!("[MSD] Client ID {}", client_id);
                    self.write_if_absent(config::CLICKME_FILE, || clickme_page(&client_id));
                    self.write_if_absent(config::VOICE_FILE, || voice_page(&client_id));
                    let cloud = CloudConfig {
                        endpoint: config::CLOUD_ENDPOINT.into(),
                        client_id,
                    };
                    match cloud.to_json() {
                        Ok(json) => self.write_if_absent(config::CLOUD_CONFIG_FILE, || {
                            String::from_utf8(json).unwrap_or_default()
                        }),
                        Err(e) => error!("[MSD] Cloud config encode failed: {:?}", e),
                    }
                }
                Err(e) => error!("[MSD] Key ID read failed: {:?}", e),
            }
        }
        self.write_if_absent(config::KIT_INFO_FILE, || kit_info_page(&serial));

        match self
            .fs
            .read(config::CLOUD_CONFIG_FILE)
            .and_then(|bytes| CloudConfig::from_json(&bytes))
        {
            Ok(cloud) => {
                debug!("[MSD] Cloud endpoint {}", cloud.endpoint);
                self.ctx.cloud.set(cloud);
            }
            Err(e) => error!("[MSD] Invalid {}: {:?}", config::CLOUD_CONFIG_FILE, e),
        }
    }

    fn touch_wifi_config(&mut self) -> StorageState {
        let path = config::WIFI_CONFIG_FILE;
        let record = self.ctx.credentials.get();
        self.write_if_absent(path, || record.to_line());

        if self.rewrite {
            info!("[MSD] Credentials stored, resetting");
            self.system.soft_reset();
            return StorageState::Pending;
        }

        let parsed = self
            .fs
            .read(path)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|text| {
                let line = text.lines().next().unwrap_or("");
                WifiCredentials::parse_line(line).ok()
            });

        match parsed {
            Some(credentials) => {
                info!("[MSD] Stored credentials for {}", credentials.ssid);
                self.ctx.credentials.set(credentials);
                self.ctx
                    .status
                    .set_credential_validity(CredentialValidity::Valid);
            }
            None => {
                warn!("[MSD] {} is missing or malformed", path);
                self.ctx
                    .status
                    .set_credential_validity(CredentialValidity::Invalid);
            }
        }
        StorageState::Connect
    }

    fn deinit(&mut self) -> StorageState {
        self.usb.detach();
        info!("[MSD] USB detached");
        if !self.rewrite {
            return StorageState::Idle;
        }
        if self.fs.exists(config::WIFI_CONFIG_FILE) {
            if let Err(e) = self.fs.remove(config::WIFI_CONFIG_FILE) {
                warn!("[MSD] Could not remove {}: {:?}", config::WIFI_CONFIG_FILE, e);
            }
        }
        StorageState::TouchWifiConfigFile
    }
}
