//! Wi-Fi credential record and its one-line text form
//!
//! The same `apply,<ssid>,<auth-code>,<key>` line is used by the provisioning
//! TCP protocol and by the persisted credential file.

use crate::config;
use alloc::format;
use alloc::string::String as AllocString;
use heapless::String;
use log::warn;

pub const SSID_MAX_LEN: usize = 32;
pub const KEY_MAX_LEN: usize = 64;

/// Leading token of a credential line
pub const APPLY_TOKEN: &str = "apply";
/// Provisioning session terminator
pub const FINISH_TOKEN: &str = "finish";

/// Authentication modes, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMode {
    Open = 1,
    WpaWpa2Mixed = 2,
    /// Reserved; accepted in files but never configured on the radio
    Wep = 3,
    Wpa2Wpa3Mixed = 4,
}

impl AuthMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Open),
            2 => Some(Self::WpaWpa2Mixed),
            3 => Some(Self::Wep),
            4 => Some(Self::Wpa2Wpa3Mixed),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn needs_key(self) -> bool {
        self != Self::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialError {
    /// Line does not start with `apply`
    NotApply,
    MissingSsid,
    SsidTooLong,
    BadAuth,
    MissingKey,
    KeyTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String<SSID_MAX_LEN>,
    pub auth: AuthMode,
    pub key: String<KEY_MAX_LEN>,
}

impl WifiCredentials {
    pub fn new(ssid: &str, auth: AuthMode, key: &str) -> Result<Self, CredentialError> {
        if ssid.is_empty() {
            return Err(CredentialError::MissingSsid);
        }
        let ssid = String::try_from(ssid).map_err(|_| CredentialError::SsidTooLong)?;

        let key = if auth.needs_key() {
            if key.is_empty() {
                return Err(CredentialError::MissingKey);
            }
            String::try_from(key).map_err(|_| CredentialError::KeyTooLong)?
        } else {
            String::new()
        };

        Ok(Self { ssid, auth, key })
    }

    /// Compiled-in station credentials
    pub fn defaults() -> Self {
        let auth = config::WIFI_AUTH
            .parse::<u8>()
            .ok()
            .and_then(AuthMode::from_code)
            .unwrap_or(AuthMode::WpaWpa2Mixed);

        match Self::new(config::WIFI_SSID, auth, config::WIFI_PASSWORD) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("[CRED] Compiled-in credentials rejected: {:?}", e);
                Self {
                    ssid: String::new(),
                    auth: AuthMode::Open,
                    key: String::new(),
                }
            }
        }
    }

    /// Parse `apply,<ssid>,<auth-code>,<key>`
    ///
    /// Surrounding whitespace and NUL padding are ignored. The key is taken
    /// verbatim after the third comma and is dropped for open networks.
    pub fn parse_line(line: &str) -> Result<Self, CredentialError> {
        let line = line.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        let mut fields = line.splitn(4, ',');

        if fields.next() != Some(APPLY_TOKEN) {
            return Err(CredentialError::NotApply);
        }
        let ssid = fields.next().ok_or(CredentialError::MissingSsid)?;
        let auth = fields
            .next()
            .and_then(|code| code.trim().parse::<u8>().ok())
            .and_then(AuthMode::from_code)
            .ok_or(CredentialError::BadAuth)?;
        let key = fields.next().unwrap_or("");

        Self::new(ssid, auth, key)
    }

    /// Text form written to the credential file
    pub fn to_line(&self) -> AllocString {
        format!(
            "{},{},{},{}",
            APPLY_TOKEN,
            self.ssid,
            self.auth.code(),
            self.key
        )
    }
}
