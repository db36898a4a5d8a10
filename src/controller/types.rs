//! Typed request/response payloads of the motor controller
//!
//! Every record here has a fixed wire layout built from little-endian
//! scalars; the in-memory shape is whatever reads best in Rust. The one
//! place the two differ is [`AllChannelFeedback`], which travels as a
//! structure of arrays (all positions, then all currents) but is stored as
//! an array of per-channel records.

use crate::codec::{ByteBuffer, Decode, Encode};
use std::fmt;

/// Number of actuated joints.
pub const CHANNEL_COUNT: usize = 9;

/// One actuated joint of the hand.
///
/// The order is the hardware channel mapping and must not be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ThumbFlexion,
    ThumbOpposition,
    IndexDistal,
    IndexProximal,
    MiddleDistal,
    MiddleProximal,
    Ring,
    Pinky,
    FingerSpread,
}

impl Channel {
    /// All channels in hardware order.
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::ThumbFlexion,
        Channel::ThumbOpposition,
        Channel::IndexDistal,
        Channel::IndexProximal,
        Channel::MiddleDistal,
        Channel::MiddleProximal,
        Channel::Ring,
        Channel::Pinky,
        Channel::FingerSpread,
    ];

    /// Hardware channel index (0-8).
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Channel> {
        Channel::ALL.get(index).copied()
    }

    /// Joint description, used in log output.
    pub fn name(self) -> &'static str {
        match self {
            Channel::ThumbFlexion => "Thumb Flexion",
            Channel::ThumbOpposition => "Thumb Opposition",
            Channel::IndexDistal => "Index Finger Distal",
            Channel::IndexProximal => "Index Finger Proximal",
            Channel::MiddleDistal => "Middle Finger Distal",
            Channel::MiddleProximal => "Middle Finger Proximal",
            Channel::Ring => "Ring Finger",
            Channel::Pinky => "Pinky",
            Channel::FingerSpread => "Finger Spread",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.index(), self.name())
    }
}

/// Position controller parameters of a single motor.
///
/// `wmn`/`wmx` bound the reference signal, `dwmx` caps its rate of change
/// (the effective velocity limit), `ky`/`dt` are measurement scaling and
/// controller time base, `imn`/`imx` clamp the integrator, `kp`/`ki`/`kd`
/// are the PID gains.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionSettings {
    pub wmn: f32,
    pub wmx: f32,
    pub dwmx: f32,
    pub ky: f32,
    pub dt: f32,
    pub imn: f32,
    pub imx: f32,
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl PositionSettings {
    pub const WIRE_SIZE: usize = 40;
}

impl Encode for PositionSettings {
    fn encode(&self, buf: &mut ByteBuffer) {
        buf.put(self.wmn);
        buf.put(self.wmx);
        buf.put(self.dwmx);
        buf.put(self.ky);
        buf.put(self.dt);
        buf.put(self.imn);
        buf.put(self.imx);
        buf.put(self.kp);
        buf.put(self.ki);
        buf.put(self.kd);
    }
}

impl Decode for PositionSettings {
    fn decode(buf: &mut ByteBuffer) -> Self {
        let wmn = buf.take();
        let wmx = buf.take();
        let dwmx = buf.take();
        let ky = buf.take();
        let dt = buf.take();
        let imn = buf.take();
        let imx = buf.take();
        let kp = buf.take();
        let ki = buf.take();
        let kd = buf.take();
        PositionSettings {
            wmn,
            wmx,
            dwmx,
            ky,
            dt,
            imn,
            imx,
            kp,
            ki,
            kd,
        }
    }
}

/// Current controller parameters of a single motor.
///
/// Same shape as [`PositionSettings`] except that the last pair (`umn`/`umx`)
/// clamps the controller output instead of a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CurrentSettings {
    pub wmn: f32,
    pub wmx: f32,
    pub ky: f32,
    pub dt: f32,
    pub imn: f32,
    pub imx: f32,
    pub kp: f32,
    pub ki: f32,
    pub umn: f32,
    pub umx: f32,
}

impl CurrentSettings {
    pub const WIRE_SIZE: usize = 40;
}

impl Encode for CurrentSettings {
    fn encode(&self, buf: &mut ByteBuffer) {
        buf.put(self.wmn);
        buf.put(self.wmx);
        buf.put(self.ky);
        buf.put(self.dt);
        buf.put(self.imn);
        buf.put(self.imx);
        buf.put(self.kp);
        buf.put(self.ki);
        buf.put(self.umn);
        buf.put(self.umx);
    }
}

impl Decode for CurrentSettings {
    fn decode(buf: &mut ByteBuffer) -> Self {
        let wmn = buf.take();
        let wmx = buf.take();
        let ky = buf.take();
        let dt = buf.take();
        let imn = buf.take();
        let imx = buf.take();
        let kp = buf.take();
        let ki = buf.take();
        let umn = buf.take();
        let umx = buf.take();
        CurrentSettings {
            wmn,
            wmx,
            ky,
            dt,
            imn,
            imx,
            kp,
            ki,
            umn,
            umx,
        }
    }
}

/// Target position command, in encoder ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlCommand {
    pub position: i32,
}

impl ControlCommand {
    pub const WIRE_SIZE: usize = 4;
}

impl Encode for ControlCommand {
    fn encode(&self, buf: &mut ByteBuffer) {
        buf.put(self.position);
    }
}

impl Decode for ControlCommand {
    fn decode(buf: &mut ByteBuffer) -> Self {
        ControlCommand {
            position: buf.take(),
        }
    }
}

/// Feedback of a single motor: encoder position [ticks] and current [mA].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerFeedback {
    pub position: i32,
    pub current: i16,
}

impl ControllerFeedback {
    pub const WIRE_SIZE: usize = 6;
}

impl Encode for ControllerFeedback {
    fn encode(&self, buf: &mut ByteBuffer) {
        buf.put(self.position);
        buf.put(self.current);
    }
}

impl Decode for ControllerFeedback {
    fn decode(buf: &mut ByteBuffer) -> Self {
        let position = buf.take();
        let current = buf.take();
        ControllerFeedback { position, current }
    }
}

/// Feedback of all nine motors.
///
/// The wire layout is not channel by channel: all positions travel first,
/// then all currents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllChannelFeedback {
    pub feedbacks: [ControllerFeedback; CHANNEL_COUNT],
}

impl AllChannelFeedback {
    pub const WIRE_SIZE: usize = ControllerFeedback::WIRE_SIZE * CHANNEL_COUNT;

    pub fn new(feedbacks: [ControllerFeedback; CHANNEL_COUNT]) -> Self {
        AllChannelFeedback { feedbacks }
    }
}

impl Encode for AllChannelFeedback {
    fn encode(&self, buf: &mut ByteBuffer) {
        for feedback in &self.feedbacks {
            buf.put(feedback.position);
        }
        for feedback in &self.feedbacks {
            buf.put(feedback.current);
        }
    }
}

impl Decode for AllChannelFeedback {
    fn decode(buf: &mut ByteBuffer) -> Self {
        let mut feedbacks = [ControllerFeedback::default(); CHANNEL_COUNT];
        for feedback in &mut feedbacks {
            feedback.position = buf.take();
        }
        for feedback in &mut feedbacks {
            feedback.current = buf.take();
        }
        AllChannelFeedback { feedbacks }
    }
}

/// State record of the hardware controller IC.
///
/// `pwm_fault` and `pwm_otw` report faults and over-temperature warnings;
/// writing the high bits resets the software state. `pwm_reset` and
/// `pwm_active` carry a low-active channel bitmask where bit 9 (0x0200)
/// additionally powers the 12 V DC-DC converter for the small motors.
/// `pos_ctrl`/`cur_ctrl` switch the position and current control loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    pub pwm_fault: u16,
    pub pwm_otw: u16,
    pub pwm_reset: u16,
    pub pwm_active: u16,
    pub pos_ctrl: u16,
    pub cur_ctrl: u16,
}

impl ControllerState {
    pub const WIRE_SIZE: usize = 12;
}

impl Encode for ControllerState {
    fn encode(&self, buf: &mut ByteBuffer) {
        buf.put(self.pwm_fault);
        buf.put(self.pwm_otw);
        buf.put(self.pwm_reset);
        buf.put(self.pwm_active);
        buf.put(self.pos_ctrl);
        buf.put(self.cur_ctrl);
    }
}

impl Decode for ControllerState {
    fn decode(buf: &mut ByteBuffer) -> Self {
        let pwm_fault = buf.take();
        let pwm_otw = buf.take();
        let pwm_reset = buf.take();
        let pwm_active = buf.take();
        let pos_ctrl = buf.take();
        let cur_ctrl = buf.take();
        ControllerState {
            pwm_fault,
            pwm_otw,
            pwm_reset,
            pwm_active,
            pos_ctrl,
            cur_ctrl,
        }
    }
}

/// Encoder scaling values, one per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderSettings {
    pub scalings: [i32; CHANNEL_COUNT],
}

impl EncoderSettings {
    pub const WIRE_SIZE: usize = 4 * CHANNEL_COUNT;
}

impl Encode for EncoderSettings {
    fn encode(&self, buf: &mut ByteBuffer) {
        for scaling in &self.scalings {
            buf.put(*scaling);
        }
    }
}

impl Decode for EncoderSettings {
    fn decode(buf: &mut ByteBuffer) -> Self {
        let mut scalings = [0i32; CHANNEL_COUNT];
        for scaling in &mut scalings {
            *scaling = buf.take();
        }
        EncoderSettings { scalings }
    }
}
