//! Cloud MQTT session
//!
//! Gated on network readiness. Connects with the endpoint and client ID
//! from `cloud.json`, subscribes to the device shadow delta and publishes
//! telemetry and shadow reports on the tick engine's publish cadence.

use crate::config;
use crate::hal::{MqttClient, MqttEvent, MqttEvents, QoS};
use crate::led_control::{BlinkMode, LedColor, LedMode, Ticker};
use crate::status::{SensorReadings, Shared, StatusRegisters};
use crate::BoardError;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

/// Topic segment identifying shadow delta notifications
const DELTA_SUFFIX: &str = "/shadow/update/delta";

/// Passes to wait after a failed connect
const RETRY_PASSES: u32 = config::MQTT_RETRY_MS / config::CLOUD_TASK_PERIOD_MS as u32;

/// Contents of `cloud.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(rename = "Endpoint")]
    pub endpoint: String,
    #[serde(rename = "ClientID")]
    pub client_id: String,
}

impl CloudConfig {
    pub const fn empty() -> Self {
        Self {
            endpoint: String::new(),
            client_id: String::new(),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, BoardError> {
        serde_json::from_slice(bytes).map_err(|_| BoardError::ConfigError)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BoardError> {
        serde_json::to_vec_pretty(self).map_err(|_| BoardError::ConfigError)
    }

    pub fn is_complete(&self) -> bool {
        !self.endpoint.is_empty() && !self.client_id.is_empty()
    }
}

#[derive(Serialize)]
struct Telemetry {
    #[serde(rename = "Temperature (C)")]
    temperature: i16,
    #[serde(rename = "Light (lux)")]
    light: u32,
}

#[derive(Serialize)]
struct ShadowReport {
    state: ReportedState,
}

#[derive(Serialize)]
struct ReportedState {
    reported: Toggle,
}

#[derive(Serialize)]
struct Toggle {
    toggle: bool,
}

pub fn telemetry_topic(client_id: &str) -> String {
    format!("{}/sensors", client_id)
}

pub fn shadow_update_topic(client_id: &str) -> String {
    format!("$aws/things/{}/shadow/update", client_id)
}

pub fn shadow_delta_topic(client_id: &str) -> String {
    format!("$aws/things/{}{}", client_id, DELTA_SUFFIX)
}

pub fn telemetry_payload(temperature: i16, light: u32) -> Result<Vec<u8>, BoardError> {
    serde_json::to_vec(&Telemetry { temperature, light }).map_err(|_| BoardError::ProtocolError)
}

pub fn shadow_payload(toggle: bool) -> Result<Vec<u8>, BoardError> {
    let report = ShadowReport {
        state: ReportedState {
            reported: Toggle { toggle },
        },
    };
    serde_json::to_vec(&report).map_err(|_| BoardError::ProtocolError)
}

/// Desired toggle value from a shadow delta document
///
/// Accepts a boolean or a number; anything else yields `None`.
pub fn parse_delta(payload: &[u8]) -> Option<bool> {
    let document: serde_json::Value = serde_json::from_slice(payload).ok()?;
    let toggle = document.get("state")?.get("toggle")?;
    match toggle {
        serde_json::Value::Bool(value) => Some(*value),
        serde_json::Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudState {
    SdkInit,
    Pending,
    MqttConnect,
    Subscribe,
    Publish,
    Idle,
    Error,
}

/// Progress of the asynchronous request issued from the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    None,
    Connecting,
    Subscribing,
}

pub struct CloudContext<'a> {
    pub status: &'a StatusRegisters,
    pub ticker: &'a Ticker,
    pub readings: &'a SensorReadings,
    pub events: &'a MqttEvents,
    pub config: &'a Shared<CloudConfig>,
}

pub struct CloudSession<'a, M> {
    state: CloudState,
    client: M,
    ctx: CloudContext<'a>,
    request: Request,
    subscribe_result: Option<Result<(), BoardError>>,
    retry_passes: u32,
    pending_messages: u32,
    shadow_update: bool,
    client_id: String,
}

impl<'a, M> CloudSession<'a, M>
where
    M: MqttClient,
{
    pub fn new(client: M, ctx: CloudContext<'a>) -> Self {
        Self {
            state: CloudState::SdkInit,
            client,
            ctx,
            request: Request::None,
            subscribe_result: None,
            retry_passes: 0,
            pending_messages: 0,
            shadow_update: true,
            client_id: String::new(),
        }
    }

    pub fn state(&self) -> CloudState {
        self.state
    }

    /// Publishes submitted but not yet completed
    pub fn pending_messages(&self) -> u32 {
        self.pending_messages
    }

    /// Run one pass of the machine
    pub fn step(&mut self) {
        self.drain_events();

        let next = match self.state {
            CloudState::SdkInit => CloudState::Pending,
            CloudState::Pending => {
                if self.ctx.status.network_ready() {
                    CloudState::MqttConnect
                } else {
                    CloudState::Pending
                }
            }
            CloudState::MqttConnect => self.connect(),
            CloudState::Subscribe => self.subscribe(),
            CloudState::Publish => self.publish(),
            CloudState::Idle => {
                if self.ctx.status.network_ready() {
                    CloudState::Idle
                } else {
                    CloudState::Pending
                }
            }
            CloudState::Error => {
                error!("[CLOUD] Session stopped, waiting for the network to cycle");
                CloudState::Idle
            }
        };

        if next != self.state {
            debug!("[CLOUD] {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.ctx.events.try_receive() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: MqttEvent) {
        let status = self.ctx.status;
        let ticker = self.ctx.ticker;

        match event {
            MqttEvent::ConnectDone(result) if self.request == Request::Connecting => {
                self.request = Request::None;
                match result {
                    Ok(()) => {
                        info!("[CLOUD] MQTT connected");
                        ticker.set_led(LedColor::Green, LedMode::On, BlinkMode::Single);
                        status.mqtt_connected.set(true);
                    }
                    Err(e) => {
                        warn!("[CLOUD] MQTT connect failed: {:?}", e);
                        ticker.set_led(LedColor::Green, LedMode::Off, BlinkMode::Single);
                        self.retry_passes = RETRY_PASSES;
                    }
                }
            }
            MqttEvent::SubscribeDone(result) if self.request == Request::Subscribing => {
                self.request = Request::None;
                self.subscribe_result = Some(result);
            }
            MqttEvent::ConnectDone(_) | MqttEvent::SubscribeDone(_) => {
                debug!("[CLOUD] Stale completion ignored");
            }
            MqttEvent::PublishDone(result) => {
                self.pending_messages = self.pending_messages.saturating_sub(1);
                match result {
                    Ok(()) => {
                        ticker.set_led(LedColor::Yellow, LedMode::FastBlink, BlinkMode::Single)
                    }
                    Err(e) => warn!("[CLOUD] Publish failed: {:?}", e),
                }
            }
            MqttEvent::Disconnected => {
                warn!("[CLOUD] MQTT disconnected");
                status.mqtt_connected.set(false);
                ticker.set_led(LedColor::Green, LedMode::Off, BlinkMode::Single);
            }
            MqttEvent::Message(message) => {
                if !message.topic.contains(DELTA_SUFFIX) {
                    debug!("[CLOUD] Ignoring message on {}", message.topic);
                    return;
                }
                let Some(toggle) = parse_delta(&message.payload) else {
                    return;
                };
                info!("[CLOUD] Shadow delta toggle={}", toggle);
                let mode = if toggle {
                    LedMode::SlowBlinkStartOn
                } else {
                    LedMode::SlowBlinkStartOff
                };
                ticker.set_led(LedColor::Yellow, mode, BlinkMode::Single);
                self.shadow_update = true;
                ticker.request_publish();
            }
        }
    }

    fn connect(&mut self) -> CloudState {
        if !self.ctx.status.network_ready() {
            self.request = Request::None;
            return CloudState::Pending;
        }
        if self.ctx.status.mqtt_connected.get() {
            return CloudState::Subscribe;
        }
        if self.request == Request::Connecting {
            return CloudState::MqttConnect;
        }
        if self.retry_passes > 0 {
            self.retry_passes -= 1;
            return CloudState::MqttConnect;
        }

        let cloud = self.ctx.config.get();
        if !cloud.is_complete() {
            error!("[CLOUD] Missing endpoint or client ID in {}", config::CLOUD_CONFIG_FILE);
            return CloudState::Error;
        }

        self.ctx
            .ticker
            .set_led(LedColor::Green, LedMode::FastBlink, BlinkMode::Periodic);
        info!("[CLOUD] Connecting to {} as {}", cloud.endpoint, cloud.client_id);
        match self.client.connect(&cloud.endpoint, &cloud.client_id) {
            Ok(()) => {
                self.client_id = cloud.client_id;
                self.request = Request::Connecting;
            }
            Err(e) => {
                warn!("[CLOUD] Connect submit failed: {:?}", e);
                self.ctx
                    .ticker
                    .set_led(LedColor::Green, LedMode::Off, BlinkMode::Single);
                self.retry_passes = RETRY_PASSES;
            }
        }
        CloudState::MqttConnect
    }

    fn subscribe(&mut self) -> CloudState {
        if !self.ctx.status.mqtt_connected.get() {
            self.request = Request::None;
            self.subscribe_result = None;
            return CloudState::Pending;
        }
        match self.subscribe_result.take() {
            Some(Ok(())) => {
                info!("[CLOUD] Subscribed to shadow delta");
                return CloudState::Publish;
            }
            Some(Err(e)) => {
                error!("[CLOUD] Subscribe failed: {:?}", e);
                return CloudState::Error;
            }
            None => {}
        }
        if self.request == Request::Subscribing {
            return CloudState::Subscribe;
        }

        let filter = shadow_delta_topic(&self.client_id);
        match self.client.subscribe(&filter, QoS::AtLeastOnce) {
            Ok(()) => {
                self.request = Request::Subscribing;
                CloudState::Subscribe
            }
            Err(e) => {
                error!("[CLOUD] Subscribe submit failed: {:?}", e);
                CloudState::Error
            }
        }
    }

    fn publish(&mut self) -> CloudState {
        let status = self.ctx.status;
        let ticker = self.ctx.ticker;
        ticker.start_publish_timer();

        let connected = status.mqtt_connected.get();
        if connected && status.network_ready() {
            if !ticker.take_publish_due() {
                return CloudState::Publish;
            }
            return match self.publish_next() {
                Ok(()) => {
                    self.pending_messages += 1;
                    CloudState::Publish
                }
                Err(e) => {
                    error!("[CLOUD] Publish submit failed: {:?}", e);
                    CloudState::Error
                }
            };
        }

        if connected {
            status.mqtt_connected.set(false);
            ticker.set_led(LedColor::Green, LedMode::Off, BlinkMode::Single);
        }
        if self.pending_messages > 0 {
            debug!("[CLOUD] Waiting for {} publish completions", self.pending_messages);
            return CloudState::Publish;
        }
        ticker.stop_publish_timer();
        CloudState::Pending
    }

    /// Shadow report if one is owed, telemetry otherwise
    fn publish_next(&mut self) -> Result<(), BoardError> {
        if self.shadow_update {
            let toggle = self.ctx.ticker.is_on(LedColor::Yellow);
            let payload = shadow_payload(toggle)?;
            self.client.publish(
                &shadow_update_topic(&self.client_id),
                &payload,
                QoS::AtMostOnce,
            )?;
            self.shadow_update = false;
            return Ok(());
        }

        let payload =
            telemetry_payload(self.ctx.readings.temperature(), self.ctx.readings.light())?;
        self.client
            .publish(&telemetry_topic(&self.client_id), &payload, QoS::AtMostOnce)
    }
}
