//! High-level finger manager
//!
//! The manager is the user-facing surface of the driver. It filters every
//! call before it reaches the [`Controller`]: a joint can only be commanded
//! while the hand is connected, the joint is calibrated and the target lies
//! between the soft stops discovered during calibration.
//!
//! # Calibration
//!
//! The hand has no absolute encoders. [`FingerManager::reset_channel`] finds
//! the coordinate frame of a joint by driving it into its mechanical hard
//! stop at reduced speed until the motor current saturates, then anchoring
//! the soft stops and the idle position as fixed tick offsets from the stop
//! position. Joint positions in radians are linear in encoder ticks with the
//! per-channel factor
//! `ticks_to_rad = range_rad / (maximum_offset - minimum_offset) * -direction`,
//! with signs arranged so that a target of zero radians places the joint at
//! the homed reference end of its travel.
//!
//! # Telemetry
//!
//! A periodic worker polls all-channel feedback (default every 100 ms); the
//! position and current getters read the cached snapshots. The worker holds
//! only a weak reference back to the controller and is stopped and joined
//! before the manager lets go of anything it borrows.

pub mod defaults;

pub use self::defaults::HomeSettings;

use crate::config::DriverConfig;
use crate::controller::types::{
    Channel, ControllerFeedback, CurrentSettings, PositionSettings, CHANNEL_COUNT,
};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::transport::{SerialTransport, Transport, DEFAULT_BAUD_RATE};
use crate::worker::PeriodicWorker;
use self::defaults::{
    DEFAULT_RESET_SPEED_FACTOR, HARD_STOP_HIT_TARGET, HOME_TOLERANCE_TICKS, RANGE_RAD,
    RESET_ATTEMPTS, RESET_CURRENT_FACTOR, RESET_ORDER,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Sleep slice of the connect-time liveness poll.
const CONNECT_POLL_SLICE: Duration = Duration::from_millis(50);

/// Pacing of the homing drive loops.
const DRIVE_LOOP_PAUSE: Duration = Duration::from_millis(1);

/// Driver for the nine-channel hand.
pub struct FingerManager {
    controller: Arc<Controller>,
    config: DriverConfig,
    connected: Arc<AtomicBool>,
    connection_logged: AtomicBool,
    feedback_worker: Option<PeriodicWorker>,
    home_settings: [HomeSettings; CHANNEL_COUNT],
    range_rad: [f32; CHANNEL_COUNT],
    ticks_to_rad: [f32; CHANNEL_COUNT],
    position_min: [i32; CHANNEL_COUNT],
    position_max: [i32; CHANNEL_COUNT],
    position_home: [i32; CHANNEL_COUNT],
    homed: [bool; CHANNEL_COUNT],
    position_overrides: [Option<PositionSettings>; CHANNEL_COUNT],
    current_overrides: [Option<CurrentSettings>; CHANNEL_COUNT],
    reset_speed_factor: f32,
}

impl FingerManager {
    pub fn new() -> Self {
        Self::with_config(DriverConfig::default())
    }

    pub fn with_config(config: DriverConfig) -> Self {
        let home_settings = defaults::default_home_settings();
        let mut ticks_to_rad = [0.0f32; CHANNEL_COUNT];
        for (factor, (home, range)) in ticks_to_rad
            .iter_mut()
            .zip(home_settings.iter().zip(RANGE_RAD))
        {
            *factor = conversion_factor(home, range);
        }

        let reset_speed_factor = if config.reset_speed_factor > 0.0 {
            config.reset_speed_factor
        } else {
            DEFAULT_RESET_SPEED_FACTOR
        };

        FingerManager {
            controller: Controller::new(),
            config,
            connected: Arc::new(AtomicBool::new(false)),
            connection_logged: AtomicBool::new(false),
            feedback_worker: None,
            home_settings,
            range_rad: RANGE_RAD,
            ticks_to_rad,
            position_min: [0; CHANNEL_COUNT],
            position_max: [0; CHANNEL_COUNT],
            position_home: [0; CHANNEL_COUNT],
            homed: [false; CHANNEL_COUNT],
            position_overrides: [None; CHANNEL_COUNT],
            current_overrides: [None; CHANNEL_COUNT],
            reset_speed_factor,
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Open the serial device configured or given and establish the
    /// connection.
    pub fn connect(&mut self, path: &str) -> Result<()> {
        let device = SerialTransport::open(path, DEFAULT_BAUD_RATE)?;
        self.connect_transport(Box::new(device))
    }

    /// Establish the connection over an already opened byte device.
    ///
    /// Pushes the startup settings to every channel, broadcasts a disable and
    /// then waits until the hardware has echoed every request, up to the
    /// connect timeout. On timeout everything is torn down again.
    pub fn connect_transport(&mut self, device: Box<dyn Transport>) -> Result<()> {
        self.disconnect();

        log::debug!("Finger manager is trying to connect to the hardware");
        self.controller
            .connect(device, self.config.receive_interval())?;
        self.controller.reset_packet_counts();
        self.start_feedback_worker()?;

        let position_settings = self.active_position_settings(false);
        let current_settings = self.active_current_settings();
        for channel in Channel::ALL {
            self.controller
                .set_position_settings(channel, &position_settings[channel.index()])?;
            self.controller
                .set_current_settings(channel, &current_settings[channel.index()])?;
        }
        self.controller.disable_all()?;
        for channel in Channel::ALL {
            self.controller.request_feedback(channel)?;
        }

        // The hardware answers every request exactly once, so matching counts
        // mean the link is alive. Unsolicited frames would inflate the
        // received count; the hand does not send any on its own.
        let deadline = Instant::now() + self.config.connect_timeout();
        loop {
            let sent = self.controller.sent_count();
            let received = self.controller.received_count();
            if sent == received {
                self.connected.store(true, Ordering::Relaxed);
                self.connection_logged.store(false, Ordering::Relaxed);
                log::info!(
                    "Successfully established connection to the hand: sent packets = {}, received packets = {}",
                    sent,
                    received
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::error!(
                    "Connection timeout: sent packets = {}, received packets = {}",
                    sent,
                    received
                );
                self.disconnect();
                return Err(Error::ConnectTimeout);
            }
            log::debug!(
                "Waiting for the hand: sent packets = {}, received packets = {}",
                sent,
                received
            );
            thread::sleep(CONNECT_POLL_SLICE);
        }
    }

    /// Disconnect from the hardware. Safe to call at any time.
    pub fn disconnect(&mut self) {
        self.connected.store(false, Ordering::Relaxed);

        if let Some(mut worker) = self.feedback_worker.take() {
            worker.stop();
            if worker.join().is_ok() {
                log::debug!("Feedback worker terminated");
            }
        }

        if self.controller.is_connected() {
            // Leaving motors energised after the link is gone is not an option
            if let Err(e) = self.controller.disable_all() {
                log::debug!("Disable on disconnect failed: {}", e);
            }
            self.controller.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn start_feedback_worker(&mut self) -> Result<()> {
        let controller = Arc::downgrade(&self.controller);
        let connected = Arc::clone(&self.connected);
        let worker = PeriodicWorker::spawn(
            "hasta-feedback-poll",
            self.config.feedback_interval(),
            move || {
                if !connected.load(Ordering::Relaxed) {
                    log::warn!("Feedback poll: the hand is not connected");
                } else if let Some(controller) = controller.upgrade() {
                    if let Err(e) = controller.request_feedback_all() {
                        log::warn!("Feedback request failed: {}", e);
                    }
                }
                false
            },
        )?;
        self.feedback_worker = Some(worker);
        log::debug!("Feedback worker started");
        Ok(())
    }

    // ========================================================================
    // Calibration
    // ========================================================================

    /// Home one joint by driving it into its hard stop.
    ///
    /// The joint is driven at reduced speed towards the hard stop of its
    /// homing direction until the motor current has crossed 75% of a current
    /// limit for ten iterations in a row. The stop position anchors the soft
    /// stops and the idle position; the joint is then driven to idle and
    /// disabled. A joint that stands still for longer than the homing
    /// timeout aborts the procedure with every channel disabled.
    pub fn reset_channel(&mut self, channel: Channel) -> Result<()> {
        if !self.is_connected() {
            log::error!("Could not reset channel {}: no connection to the hand", channel);
            return Err(Error::NotConnected);
        }

        let idx = channel.index();
        log::debug!("Start homing channel {}", channel);
        self.homed[idx] = false;

        // Reduced speed while hunting for the stop
        let reset_settings = self.active_position_settings(true);
        self.controller
            .set_position_settings(channel, &reset_settings[idx])?;

        let home = self.home_settings[idx];
        let pos_set = reset_settings[idx];
        let cur_set = self.controller.get_current_settings(channel)?;

        self.controller.disable_all()?;
        let seek_target = if home.direction > 0 {
            pos_set.wmx as i32
        } else {
            pos_set.wmn as i32
        };
        log::info!(
            "Driving channel {} to hard stop. Detection thresholds: {:.0} mA / {:.0} mA",
            channel,
            RESET_CURRENT_FACTOR * cur_set.wmn,
            RESET_CURRENT_FACTOR * cur_set.wmx
        );
        self.controller.set_target(channel, seek_target)?;
        self.controller.enable_channel(channel)?;

        let mut previous = ControllerFeedback::default();
        let mut feedback = ControllerFeedback::default();
        let mut hit_count = 0u32;
        let mut stall_timer = Instant::now();
        while hit_count < HARD_STOP_HIT_TARGET {
            self.controller.set_target(channel, seek_target)?;
            feedback = self.controller.get_controller_feedback(channel)?;

            let current = feedback.current as f32;
            if current <= RESET_CURRENT_FACTOR * cur_set.wmn
                || current >= RESET_CURRENT_FACTOR * cur_set.wmx
            {
                hit_count += 1;
            } else if hit_count > 0 {
                hit_count -= 1;
            }

            if feedback.position != previous.position {
                stall_timer = Instant::now();
            } else if stall_timer.elapsed() > self.config.homing_timeout() {
                self.controller.disable_all()?;
                log::error!("Timeout: aborted finding home position for channel {}", channel);
                return Err(Error::HomingTimeout(channel));
            }

            previous = feedback;
            thread::sleep(DRIVE_LOOP_PAUSE);
        }
        log::debug!(
            "Hard stop of channel {} found at {} ticks ({} mA)",
            channel,
            feedback.position,
            feedback.current
        );

        self.controller.disable_all()?;
        let stop = feedback.position;
        self.position_min[idx] = stop + home.minimum_offset as i32;
        self.position_max[idx] = stop + home.maximum_offset as i32;
        self.position_home[idx] = stop + home.idle_offset as i32;
        log::debug!(
            "Soft stops for channel {}: min = {}, max = {}, home = {}",
            channel,
            self.position_min[idx],
            self.position_max[idx],
            self.position_home[idx]
        );

        // Release the motor from the stop and settle at the idle position
        let home_target = self.position_home[idx];
        self.controller.set_target(channel, home_target)?;
        self.controller.enable_channel(channel)?;
        let start = Instant::now();
        loop {
            self.controller.set_target(channel, home_target)?;
            feedback = self.controller.get_controller_feedback(channel)?;
            if (home_target - feedback.position).abs() < HOME_TOLERANCE_TICKS {
                break;
            }
            if start.elapsed() > self.config.homing_timeout() {
                self.controller.disable_all()?;
                self.restore_position_settings(channel)?;
                log::error!(
                    "Channel {} did not reach its idle position, there could be a hardware problem",
                    channel
                );
                return Err(Error::HomingTimeout(channel));
            }
            thread::sleep(DRIVE_LOOP_PAUSE);
        }

        self.controller.disable_all()?;
        self.restore_position_settings(channel)?;
        self.homed[idx] = true;
        log::info!("Successfully homed channel {}", channel);
        Ok(())
    }

    /// Home every joint, in an order that keeps fingers from jamming each
    /// other, with three attempts per joint.
    pub fn reset_all(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut first_error = None;
        for channel in RESET_ORDER {
            let mut result = self.reset_channel(channel);
            let mut attempts_left = RESET_ATTEMPTS - 1;
            while result.is_err() && attempts_left > 0 {
                log::warn!(
                    "Homing of channel {} failed, retrying ({} attempts left)",
                    channel,
                    attempts_left
                );
                result = self.reset_channel(channel);
                attempts_left -= 1;
            }
            if let Err(e) = result {
                log::error!("Homing of channel {} failed for good: {}", channel, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    pub fn is_homed(&self, channel: Channel) -> bool {
        self.homed[channel.index()]
    }

    fn restore_position_settings(&self, channel: Channel) -> Result<()> {
        let settings = self.active_position_settings(false);
        self.controller
            .set_position_settings(channel, &settings[channel.index()])
    }

    // ========================================================================
    // Joint commands
    // ========================================================================

    /// Command a joint to an angle in radians.
    ///
    /// The current limit argument is accepted for interface compatibility but
    /// not forwarded; the hardware does not support per-command limits.
    pub fn set_target_position(
        &self,
        channel: Channel,
        position_rad: f64,
        _current_limit: f64,
    ) -> Result<()> {
        if !self.is_connected() {
            // Warn exactly once, a control loop calling this would spam the log
            if !self.connection_logged.swap(true, Ordering::Relaxed) {
                log::error!(
                    "Could not set target for channel {}: no connection to the hand",
                    channel
                );
            }
            return Err(Error::NotConnected);
        }
        if !self.is_homed(channel) {
            log::error!("Could not set target for channel {}: reset it first", channel);
            return Err(Error::NotHomed(channel));
        }

        let idx = channel.index();
        let target = self.rad_to_ticks(channel, position_rad);
        if target < self.position_min[idx] || target > self.position_max[idx] {
            log::warn!(
                "Channel {} target {} ticks ({:.3} rad) is out of bounds [{}, {}]",
                channel,
                target,
                position_rad,
                self.position_min[idx],
                self.position_max[idx]
            );
            return Err(Error::OutOfBounds {
                channel,
                target,
                min: self.position_min[idx],
                max: self.position_max[idx],
            });
        }

        if !self.is_enabled(channel) {
            self.enable_channel(channel)?;
        }
        self.controller.set_target(channel, target)
    }

    /// Latest joint angle in radians. Requires the channel to be homed.
    pub fn get_position(&self, channel: Channel) -> Result<f64> {
        if !self.is_homed(channel) {
            log::warn!("Could not get position for channel {}", channel);
            return Err(Error::NotHomed(channel));
        }
        let feedback = self.controller.get_controller_feedback(channel)?;
        let position = self.ticks_to_rad_value(channel, feedback.position);
        // Readings past the homed reference cannot be commanded back out, so
        // they are reported as the reference itself.
        Ok(position.max(0.0))
    }

    /// Latest motor current in mA. Requires the channel to be homed.
    pub fn get_current(&self, channel: Channel) -> Result<f64> {
        if !self.is_homed(channel) {
            log::warn!("Could not get current for channel {}", channel);
            return Err(Error::NotHomed(channel));
        }
        let feedback = self.controller.get_controller_feedback(channel)?;
        Ok(feedback.current as f64)
    }

    /// Enable the control loops of a homed joint.
    pub fn enable_channel(&self, channel: Channel) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if !self.is_homed(channel) {
            log::warn!("Channel {} must be homed before it can be enabled", channel);
            return Err(Error::NotHomed(channel));
        }
        self.controller.enable_channel(channel)
    }

    /// Enable every homed joint, in homing order.
    pub fn enable_all(&self) -> Result<()> {
        for channel in RESET_ORDER {
            self.enable_channel(channel)?;
        }
        Ok(())
    }

    /// Disable the control loops of a joint. Works in any state.
    pub fn disable_channel(&self, channel: Channel) -> Result<()> {
        self.controller.disable_channel(channel)
    }

    /// Disable every joint.
    pub fn disable_all(&self) -> Result<()> {
        self.controller.disable_all()
    }

    pub fn is_enabled(&self, channel: Channel) -> bool {
        self.controller.is_enabled(channel)
    }

    // ========================================================================
    // Parameters
    // ========================================================================

    /// Override the position controller parameters of a channel. Takes
    /// effect immediately when connected, and at every later connect.
    pub fn set_position_controller_params(
        &mut self,
        channel: Channel,
        settings: &PositionSettings,
    ) -> Result<()> {
        self.position_overrides[channel.index()] = Some(*settings);
        if self.is_connected() {
            self.controller.set_position_settings(channel, settings)?;
        }
        Ok(())
    }

    /// Override the current controller parameters of a channel.
    pub fn set_current_controller_params(
        &mut self,
        channel: Channel,
        settings: &CurrentSettings,
    ) -> Result<()> {
        self.current_overrides[channel.index()] = Some(*settings);
        if self.is_connected() {
            self.controller.set_current_settings(channel, settings)?;
        }
        Ok(())
    }

    /// Replace the homing parameters of a channel and recompute its tick to
    /// radian conversion.
    pub fn set_home_settings(&mut self, channel: Channel, settings: &HomeSettings) {
        let idx = channel.index();
        self.home_settings[idx] = *settings;
        self.ticks_to_rad[idx] = conversion_factor(settings, self.range_rad[idx]);
        log::debug!(
            "Channel {} new home settings: direction {} min offset {} max offset {} idle offset {}",
            channel,
            settings.direction,
            settings.minimum_offset,
            settings.maximum_offset,
            settings.idle_offset
        );
    }

    pub fn home_settings(&self, channel: Channel) -> HomeSettings {
        self.home_settings[channel.index()]
    }

    /// Set the velocity factor used while homing. Valid range (0.0, 1.0].
    pub fn set_reset_speed(&mut self, factor: f32) {
        if factor > 0.0 && factor <= 1.0 {
            self.reset_speed_factor = factor;
        } else {
            log::error!(
                "Reset speed factor {} is not valid, provide a value in (0.0, 1.0]",
                factor
            );
        }
    }

    pub fn set_homing_timeout(&mut self, timeout: Duration) {
        self.config.homing_timeout_ms = timeout.as_millis() as u64;
    }

    // ========================================================================
    // Conversion helpers
    // ========================================================================

    fn anchor(&self, channel: Channel) -> i32 {
        let idx = channel.index();
        if self.home_settings[idx].direction > 0 {
            self.position_max[idx]
        } else {
            self.position_min[idx]
        }
    }

    fn rad_to_ticks(&self, channel: Channel, position_rad: f64) -> i32 {
        let factor = self.ticks_to_rad[channel.index()] as f64;
        (position_rad / factor) as i32 + self.anchor(channel)
    }

    fn ticks_to_rad_value(&self, channel: Channel, ticks: i32) -> f64 {
        let factor = self.ticks_to_rad[channel.index()] as f64;
        ((ticks - self.anchor(channel)) as f64) * factor
    }

    fn active_position_settings(&self, reset: bool) -> [PositionSettings; CHANNEL_COUNT] {
        let mut settings = defaults::default_position_settings();
        for (slot, user) in settings.iter_mut().zip(&self.position_overrides) {
            if let Some(user) = user {
                *slot = *user;
            }
        }
        if reset {
            for entry in &mut settings {
                entry.dwmx *= self.reset_speed_factor;
            }
        }
        settings
    }

    fn active_current_settings(&self) -> [CurrentSettings; CHANNEL_COUNT] {
        let mut settings = defaults::default_current_settings();
        for (slot, user) in settings.iter_mut().zip(&self.current_overrides) {
            if let Some(user) = user {
                *slot = *user;
            }
        }
        settings
    }
}

impl Default for FingerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FingerManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn conversion_factor(home: &HomeSettings, range_rad: f32) -> f32 {
    let range_ticks = home.maximum_offset - home.minimum_offset;
    range_rad / range_ticks * -(home.direction as f32)
}
