//! This module defines the error type for the register decoding logic.
//!
//! Communication errors are a separate concern and are handled by the
//! [`crate::connection::Error`] enum.

/// Represents errors that can occur while decoding device data.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The number of words received from the device is incorrect for the
    /// requested register.
    #[error("Expected {expected} words, got {got}")]
    WordCount { expected: usize, got: usize },

    /// The device clock block does not describe a valid calendar time.
    #[error("Invalid device clock: {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")]
    InvalidClock {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    },
}
