//! Error types for HastaIO
//!
//! # Error Recovery Strategies
//!
//! ## Fatal Errors (Require Restart)
//!
//! - **`ThreadPanic`**: A worker thread panicked unexpectedly. The driver must
//!   be reconnected; the receive and feedback-poll workers will not recover on
//!   their own.
//!
//! - **`MutexPoisoned`**: A mutex was poisoned by a panicking thread. The
//!   affected component (serial interface, controller cache) will refuse
//!   further work. Reconnect the driver.
//!
//! ## Transient Errors (Retry Recommended)
//!
//! - **`Serial`** / **`Io`**: Serial port communication error. Often caused by
//!   cable disconnection (unrecoverable without hardware intervention) or
//!   temporary I/O congestion (retryable after a brief delay).
//!
//! - **`TransportClosed`**: The byte device is closed or unreadable.
//!   Recoverable via a fresh `connect`.
//!
//! ## Operation Errors (Caller Mistakes)
//!
//! - **`NotConnected`**: The operation requires a live transport.
//! - **`NotHomed`**: The channel has not been calibrated. Run the homing
//!   procedure first.
//! - **`OutOfBounds`**: The commanded target lies outside the channel's
//!   calibrated soft stops. Nothing was sent.
//!
//! ## Timeouts
//!
//! - **`ConnectTimeout`**: The hardware did not echo every request within the
//!   connect window. Check cabling and power, then retry.
//! - **`HomingTimeout`**: A joint stopped moving before the hard stop was
//!   detected. This can indicate a mechanical blockage or wrong controller
//!   settings; all channels are disabled when this is raised.
//!
//! ## Configuration Errors (Fix and Restart)
//!
//! - **`Config`**: The configuration file is invalid.
//!
//! Checksum failures on the wire are deliberately *not* an error variant: the
//! packet receiver logs them, discards the frame and resynchronises on the
//! next header. The driver never aborts the process on a protocol error.

use crate::controller::types::Channel;
use thiserror::Error;

/// Errors that can occur in HastaIO
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected to the hand")]
    NotConnected,

    #[error("Channel {0} has not been homed")]
    NotHomed(Channel),

    #[error("Target {target} ticks for channel {channel} is outside [{min}, {max}]")]
    OutOfBounds {
        channel: Channel,
        target: i32,
        min: i32,
        max: i32,
    },

    #[error("Connection timeout: hardware did not answer all requests")]
    ConnectTimeout,

    #[error("Homing of channel {0} timed out")]
    HomingTimeout(Channel),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Thread panic")]
    ThreadPanic,

    #[error("Mutex poisoned")]
    MutexPoisoned,

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
