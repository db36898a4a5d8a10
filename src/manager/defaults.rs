//! Factory settings of the hand
//!
//! All values are based on the hardware description for maximum ticks and the
//! allowable range of movement of each joint. BEWARE: wrong current limits
//! can damage the hardware.

use crate::controller::types::{Channel, CurrentSettings, PositionSettings, CHANNEL_COUNT};

/// Homing parameters of one joint.
///
/// Offsets are in ticks, measured from the hard-stop position found during
/// calibration. The offsets already carry the sign that matches the homing
/// direction, so the soft stops and the idle position are plain additions to
/// the stop position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomeSettings {
    /// Homing direction: +1 drives towards the positive hard stop, -1 towards
    /// the negative one.
    pub direction: i8,
    /// Soft-stop minimum, as an offset from the hard stop.
    pub minimum_offset: f32,
    /// Soft-stop maximum, as an offset from the hard stop.
    pub maximum_offset: f32,
    /// Idle position to move to after calibration; lies between the two
    /// soft stops.
    pub idle_offset: f32,
}

impl HomeSettings {
    pub fn new(direction: i8, minimum_offset: f32, maximum_offset: f32, idle_offset: f32) -> Self {
        HomeSettings {
            direction: if direction < 0 { -1 } else { 1 },
            minimum_offset,
            maximum_offset,
            idle_offset,
        }
    }
}

/// Fraction of the current limit that counts as "pushing against the stop".
pub(crate) const RESET_CURRENT_FACTOR: f32 = 0.75;

/// Consecutive current-threshold crossings that declare the hard stop found.
pub(crate) const HARD_STOP_HIT_TARGET: u32 = 10;

/// A joint within this many ticks of its idle position counts as arrived.
pub(crate) const HOME_TOLERANCE_TICKS: i32 = 1000;

/// Velocity-limit factor applied while driving into the hard stop.
pub(crate) const DEFAULT_RESET_SPEED_FACTOR: f32 = 0.2;

/// Homing attempts per channel when resetting the whole hand.
pub(crate) const RESET_ATTEMPTS: u32 = 3;

/// Radians of travel between the soft stops, per channel.
pub(crate) const RANGE_RAD: [f32; CHANNEL_COUNT] =
    [0.97, 0.99, 1.33, 0.80, 1.33, 0.80, 0.98, 0.98, 0.58];

/// Homing order for a full reset. Proximal joints and the thumb first so the
/// distal joints cannot jam against a curled finger.
pub(crate) const RESET_ORDER: [Channel; CHANNEL_COUNT] = [
    Channel::IndexProximal,
    Channel::MiddleProximal,
    Channel::ThumbOpposition,
    Channel::ThumbFlexion,
    Channel::FingerSpread,
    Channel::MiddleDistal,
    Channel::IndexDistal,
    Channel::Ring,
    Channel::Pinky,
];

/// Default homing parameters per channel.
pub fn default_home_settings() -> [HomeSettings; CHANNEL_COUNT] {
    let distal = HomeSettings::new(1, -47.0e3, -2.0e3, -8.0e3);
    let proximal = HomeSettings::new(-1, 2.0e3, 42.0e3, 8.0e3);
    [
        HomeSettings::new(1, -175.0e3, -5.0e3, -15.0e3), // thumb flexion
        HomeSettings::new(1, -105.0e3, -5.0e3, -15.0e3), // thumb opposition
        distal,                                          // index finger distal
        proximal,                                        // index finger proximal
        distal,                                          // middle finger distal
        proximal,                                        // middle finger proximal
        distal,                                          // ring finger
        distal,                                          // pinky
        HomeSettings::new(1, -27.0e3, -2.0e3, -8.0e3),   // finger spread
    ]
}

fn position_settings(dwmx: f32, kp: f32, ki: f32, kd: f32) -> PositionSettings {
    PositionSettings {
        wmn: -1.0e6,
        wmx: 1.0e6,
        dwmx,
        ky: 1.00,
        dt: 1e-3,
        imn: -500.0,
        imx: 500.0,
        kp,
        ki,
        kd,
    }
}

/// Default position controller parameters per channel.
///
/// The velocity limits close the full range of each finger in about one
/// second, except the thumb which takes four.
pub fn default_position_settings() -> [PositionSettings; CHANNEL_COUNT] {
    [
        position_settings(65.0e3, 0.5, 0.0, 400.0),  // thumb flexion
        position_settings(50.0e3, 0.5, 0.1, 100.0),  // thumb opposition
        position_settings(45.0e3, 0.5, 0.0, 40.0),   // index finger distal
        position_settings(40.0e3, 0.8, 0.0, 1000.0), // index finger proximal
        position_settings(45.0e3, 0.5, 0.0, 10.0),   // middle finger distal
        position_settings(40.0e3, 0.8, 0.0, 1000.0), // middle finger proximal
        position_settings(45.0e3, 0.5, 0.0, 100.0),  // ring finger
        position_settings(45.0e3, 0.5, 0.0, 100.0),  // pinky
        position_settings(25.0e3, 0.5, 0.0, 100.0),  // finger spread
    ]
}

fn current_settings(limit: f32, windup: f32, kp: f32, ki: f32) -> CurrentSettings {
    CurrentSettings {
        wmn: -limit,
        wmx: limit,
        ky: 0.405,
        dt: 4e-6,
        imn: -windup,
        imx: windup,
        kp,
        ki,
        umn: -255.0,
        umx: 255.0,
    }
}

/// Default current controller parameters per channel.
pub fn default_current_settings() -> [CurrentSettings; CHANNEL_COUNT] {
    [
        current_settings(500.0, 25.0, 0.6, 10.0), // thumb flexion
        current_settings(500.0, 25.0, 1.0, 10.0), // thumb opposition
        current_settings(300.0, 25.0, 1.0, 10.0), // index finger distal
        current_settings(350.0, 25.0, 1.0, 10.0), // index finger proximal
        current_settings(300.0, 25.0, 1.0, 10.0), // middle finger distal
        current_settings(350.0, 25.0, 1.0, 10.0), // middle finger proximal
        current_settings(300.0, 10.0, 1.0, 25.0), // ring finger
        current_settings(300.0, 10.0, 1.0, 25.0), // pinky
        current_settings(500.0, 4.0, 0.7, 60.0),  // finger spread
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_bracket_the_idle_position() {
        for (channel, home) in Channel::ALL.iter().zip(default_home_settings()) {
            assert!(
                home.minimum_offset < home.maximum_offset,
                "channel {channel}"
            );
            assert!(
                home.minimum_offset <= home.idle_offset && home.idle_offset <= home.maximum_offset,
                "channel {channel}"
            );
        }
    }

    #[test]
    fn test_direction_is_normalised() {
        let home = HomeSettings::new(-5, 0.0, 1.0, 0.5);
        assert_eq!(home.direction, -1);
        let home = HomeSettings::new(0, 0.0, 1.0, 0.5);
        assert_eq!(home.direction, 1);
    }

    #[test]
    fn test_every_channel_appears_once_in_the_reset_order() {
        for channel in Channel::ALL {
            assert_eq!(
                RESET_ORDER.iter().filter(|&&c| c == channel).count(),
                1,
                "channel {channel}"
            );
        }
    }
}
