//! LED, sensor-cadence and publish-cadence tick engine
//!
//! A single periodic tick (see [`config::TIMER_RESOLUTION_MS`]) advances one
//! countdown block per LED plus the sensor poll and cloud publish cadences.
//! The engine only produces LED levels and "due" flags; the firmware mirrors
//! the levels onto GPIO through [`LedBank`].

use crate::config;
use crate::status::Shared;
use embedded_hal::digital::OutputPin;
use log::error;

const FAST_BLINK_TICKS: u16 = (config::LED_FAST_BLINK_PERIOD_MS / config::TIMER_RESOLUTION_MS) as u16;
const SLOW_BLINK_TICKS: u16 = (config::LED_SLOW_BLINK_PERIOD_MS / config::TIMER_RESOLUTION_MS) as u16;
const SENSOR_READ_TICKS: u16 = (config::SENSORS_READ_PERIOD_MS / config::TIMER_RESOLUTION_MS) as u16;
const PUBLISH_TICKS: u16 = (config::PUBLISH_PERIOD_MS / config::TIMER_RESOLUTION_MS) as u16;

pub const NUM_LEDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    Red = 0,
    Green = 1,
    Yellow = 2,
    Blue = 3,
}

impl LedColor {
    pub const ALL: [LedColor; NUM_LEDS] = [Self::Red, Self::Green, Self::Yellow, Self::Blue];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    On,
    Off,
    Toggle,
    FastBlink,
    SlowBlinkStartOn,
    SlowBlinkStartOff,
}

/// Repeat behaviour of a blink; `Invalid` is only meaningful for the
/// non-blinking modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlinkMode {
    Single,
    Periodic,
    Invalid,
}

/// Countdown block; `reload == 0` means inactive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlinkBlock {
    pub counter: u16,
    pub reload: u16,
    pub periodic: bool,
}

impl BlinkBlock {
    pub const fn idle() -> Self {
        Self {
            counter: 0,
            reload: 0,
            periodic: false,
        }
    }

    pub const fn armed(reload: u16, periodic: bool) -> Self {
        Self {
            counter: 0,
            reload,
            periodic,
        }
    }

    pub fn is_active(&self) -> bool {
        self.reload > 0
    }

    /// Advance one tick, returning true when the block fires
    fn advance(&mut self) -> bool {
        if self.reload == 0 {
            return false;
        }
        self.counter += 1;
        if self.counter < self.reload {
            return false;
        }
        if self.periodic {
            self.counter = 0;
        } else {
            self.counter = 0;
            self.reload = 0;
        }
        true
    }
}

/// Tick engine state; lives inside a [`Ticker`]
#[derive(Debug)]
pub struct TickEngine {
    blocks: [BlinkBlock; NUM_LEDS],
    levels: [bool; NUM_LEDS],
    sensor_block: BlinkBlock,
    publish_block: BlinkBlock,
    read_due: bool,
    publish_due: bool,
    turn_on_requested: bool,
    shutdown_requested: bool,
}

impl TickEngine {
    /// LEDs off, sensors requested on with the periodic read armed
    pub const fn new() -> Self {
        Self {
            blocks: [BlinkBlock::idle(); NUM_LEDS],
            levels: [false; NUM_LEDS],
            sensor_block: BlinkBlock::armed(SENSOR_READ_TICKS, true),
            publish_block: BlinkBlock::idle(),
            read_due: false,
            publish_due: false,
            turn_on_requested: true,
            shutdown_requested: false,
        }
    }

    pub fn tick(&mut self) {
        for (block, level) in self.blocks.iter_mut().zip(self.levels.iter_mut()) {
            if block.advance() {
                *level = !*level;
            }
        }
        if self.sensor_block.advance() {
            self.read_due = true;
        }
        if self.publish_block.advance() {
            self.publish_due = true;
        }
    }

    pub fn set_led(&mut self, color: LedColor, mode: LedMode, blink: BlinkMode) {
        let blinking = matches!(
            mode,
            LedMode::FastBlink | LedMode::SlowBlinkStartOn | LedMode::SlowBlinkStartOff
        );
        if blinking && blink == BlinkMode::Invalid {
            error!("[LED] Invalid blink mode for {:?} on {:?}", mode, color);
            return;
        }

        let i = color.index();
        let periodic = blink == BlinkMode::Periodic;
        match mode {
            LedMode::On => {
                self.blocks[i] = BlinkBlock::idle();
                self.levels[i] = true;
            }
            LedMode::Off => {
                self.blocks[i] = BlinkBlock::idle();
                self.levels[i] = false;
            }
            LedMode::Toggle => {
                self.levels[i] = !self.levels[i];
            }
            LedMode::FastBlink => {
                // Restarting an active blink would only reset its phase
                if self.blocks[i].is_active() {
                    return;
                }
                self.blocks[i] = BlinkBlock::armed(FAST_BLINK_TICKS, periodic);
                self.levels[i] = true;
            }
            LedMode::SlowBlinkStartOn | LedMode::SlowBlinkStartOff => {
                self.blocks[i] = BlinkBlock::armed(SLOW_BLINK_TICKS, periodic);
                self.levels[i] = mode == LedMode::SlowBlinkStartOn;
            }
        }
    }

    pub fn levels(&self) -> [bool; NUM_LEDS] {
        self.levels
    }

    pub fn block(&self, color: LedColor) -> BlinkBlock {
        self.blocks[color.index()]
    }

    pub fn sensors_on(&mut self) {
        self.turn_on_requested = true;
        self.sensor_block = BlinkBlock::armed(SENSOR_READ_TICKS, true);
    }

    pub fn sensors_off(&mut self) {
        self.shutdown_requested = true;
        self.sensor_block = BlinkBlock::idle();
    }

    pub fn start_publish_timer(&mut self) {
        if !self.publish_block.is_active() {
            self.publish_block = BlinkBlock::armed(PUBLISH_TICKS, true);
        }
    }

    pub fn stop_publish_timer(&mut self) {
        self.publish_block = BlinkBlock::idle();
        self.publish_due = false;
    }
}

impl Default for TickEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle shared by the tick source and every machine that drives LEDs
pub struct Ticker {
    engine: Shared<TickEngine>,
}

impl Ticker {
    pub const fn new() -> Self {
        Self {
            engine: Shared::new(TickEngine::new()),
        }
    }

    /// Called from the periodic timer context
    pub fn tick(&self) {
        self.engine.with(|e| e.tick());
    }

    /// LED manager
    pub fn set_led(&self, color: LedColor, mode: LedMode, blink: BlinkMode) {
        self.engine.with(|e| e.set_led(color, mode, blink));
    }

    pub fn levels(&self) -> [bool; NUM_LEDS] {
        self.engine.with(|e| e.levels())
    }

    pub fn is_on(&self, color: LedColor) -> bool {
        self.levels()[color.index()]
    }

    pub fn block(&self, color: LedColor) -> BlinkBlock {
        self.engine.with(|e| e.block(color))
    }

    pub fn sensors_on(&self) {
        self.engine.with(|e| e.sensors_on());
    }

    pub fn sensors_off(&self) {
        self.engine.with(|e| e.sensors_off());
    }

    pub fn take_read_due(&self) -> bool {
        self.engine.with(|e| core::mem::take(&mut e.read_due))
    }

    /// Leave the read-due flag raised for the next check pass
    pub(crate) fn read_due(&self) -> bool {
        self.engine.with(|e| e.read_due)
    }

    pub fn take_turn_on_request(&self) -> bool {
        self.engine.with(|e| core::mem::take(&mut e.turn_on_requested))
    }

    pub fn take_shutdown_request(&self) -> bool {
        self.engine.with(|e| core::mem::take(&mut e.shutdown_requested))
    }

    pub fn start_publish_timer(&self) {
        self.engine.with(|e| e.start_publish_timer());
    }

    pub fn stop_publish_timer(&self) {
        self.engine.with(|e| e.stop_publish_timer());
    }

    pub fn take_publish_due(&self) -> bool {
        self.engine.with(|e| core::mem::take(&mut e.publish_due))
    }

    /// Make the next publish check fire without waiting for the cadence
    pub fn request_publish(&self) {
        self.engine.with(|e| e.publish_due = true);
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

/// Four GPIO outputs, ordered red, green, yellow, blue
pub struct LedBank<P> {
    pins: [P; NUM_LEDS],
    shown: Option<[bool; NUM_LEDS]>,
}

impl<P: OutputPin> LedBank<P> {
    pub fn new(pins: [P; NUM_LEDS]) -> Self {
        Self { pins, shown: None }
    }

    /// Drive the pins whose level changed since the last call
    pub fn show(&mut self, levels: [bool; NUM_LEDS]) {
        for (i, (pin, &level)) in self.pins.iter_mut().zip(levels.iter()).enumerate() {
            if self.shown.map(|shown| shown[i]) == Some(level) {
                continue;
            }
            let result = if level { pin.set_high() } else { pin.set_low() };
            if result.is_err() {
                error!("[LED] Failed to drive {:?}", LedColor::ALL[i]);
            }
        }
        self.shown = Some(levels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    fn ticks(engine: &mut TickEngine, n: usize) {
        for _ in 0..n {
            engine.tick();
        }
    }

    #[test]
    fn inactive_block_never_toggles() {
        let mut engine = TickEngine::new();
        engine.set_led(LedColor::Red, LedMode::On, BlinkMode::Invalid);
        ticks(&mut engine, 500);
        assert!(engine.levels()[0]);
        assert_eq!(engine.block(LedColor::Red).reload, 0);
    }

    #[test]
    fn single_blink_toggles_once_then_disarms() {
        let mut engine = TickEngine::new();
        engine.set_led(LedColor::Yellow, LedMode::FastBlink, BlinkMode::Single);
        assert!(engine.levels()[2]);

        ticks(&mut engine, FAST_BLINK_TICKS as usize - 1);
        assert!(engine.levels()[2]);

        engine.tick();
        assert!(!engine.levels()[2]);
        assert_eq!(engine.block(LedColor::Yellow).reload, 0);

        ticks(&mut engine, 100);
        assert!(!engine.levels()[2]);
    }

    #[test]
    fn periodic_blink_keeps_toggling() {
        let mut engine = TickEngine::new();
        engine.set_led(LedColor::Blue, LedMode::SlowBlinkStartOff, BlinkMode::Periodic);
        assert!(!engine.levels()[3]);

        ticks(&mut engine, SLOW_BLINK_TICKS as usize);
        assert!(engine.levels()[3]);
        ticks(&mut engine, SLOW_BLINK_TICKS as usize);
        assert!(!engine.levels()[3]);
        assert!(engine.block(LedColor::Blue).is_active());
    }

    #[test]
    fn fast_blink_does_not_restart_active_blink() {
        let mut engine = TickEngine::new();
        engine.set_led(LedColor::Green, LedMode::FastBlink, BlinkMode::Periodic);
        ticks(&mut engine, 3);
        engine.set_led(LedColor::Green, LedMode::FastBlink, BlinkMode::Periodic);
        assert_eq!(engine.block(LedColor::Green).counter, 3);
    }

    #[test]
    fn blink_with_invalid_repeat_is_rejected() {
        let mut engine = TickEngine::new();
        engine.set_led(LedColor::Red, LedMode::SlowBlinkStartOn, BlinkMode::Invalid);
        assert_eq!(engine.block(LedColor::Red), BlinkBlock::idle());
        assert!(!engine.levels()[0]);
    }

    #[test]
    fn off_stops_blinking() {
        let mut engine = TickEngine::new();
        engine.set_led(LedColor::Green, LedMode::FastBlink, BlinkMode::Periodic);
        engine.set_led(LedColor::Green, LedMode::Off, BlinkMode::Invalid);
        ticks(&mut engine, 50);
        assert!(!engine.levels()[1]);
    }

    #[test]
    fn sensor_cadence_raises_read_due() {
        let ticker = Ticker::new();
        for _ in 0..SENSOR_READ_TICKS - 1 {
            ticker.tick();
        }
        assert!(!ticker.take_read_due());
        ticker.tick();
        assert!(ticker.take_read_due());
        assert!(!ticker.take_read_due());
    }

    #[test]
    fn sensors_off_disarms_cadence() {
        let ticker = Ticker::new();
        assert!(ticker.take_turn_on_request());
        ticker.sensors_off();
        assert!(ticker.take_shutdown_request());
        for _ in 0..200 {
            ticker.tick();
        }
        assert!(!ticker.take_read_due());

        ticker.sensors_on();
        assert!(ticker.take_turn_on_request());
    }

    #[test]
    fn publish_cadence_only_while_started() {
        let ticker = Ticker::new();
        for _ in 0..PUBLISH_TICKS {
            ticker.tick();
        }
        assert!(!ticker.take_publish_due());

        ticker.start_publish_timer();
        for _ in 0..PUBLISH_TICKS {
            ticker.tick();
        }
        assert!(ticker.take_publish_due());

        ticker.stop_publish_timer();
        for _ in 0..PUBLISH_TICKS {
            ticker.tick();
        }
        assert!(!ticker.take_publish_due());
    }

    #[derive(Default)]
    struct Pin {
        high: bool,
        writes: usize,
    }

    impl embedded_hal::digital::ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.high = false;
            self.writes += 1;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.high = true;
            self.writes += 1;
            Ok(())
        }
    }

    #[test]
    fn led_bank_only_drives_changed_pins() {
        let mut bank = LedBank::new([Pin::default(), Pin::default(), Pin::default(), Pin::default()]);
        bank.show([true, false, false, false]);
        bank.show([true, false, false, true]);

        assert!(bank.pins[0].high);
        assert_eq!(bank.pins[0].writes, 1);
        assert!(bank.pins[3].high);
        assert_eq!(bank.pins[3].writes, 2);
    }
}
