// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Controller error type.
//!
//! Every fallible operation in this crate returns a variant of [`Error`].
//! The set is closed: protocol, transport and lifecycle failures all map into
//! it at the module boundary. Unwinding across the AR state machine is not
//! allowed; a panic mid-transition would leave an AR half-committed.

use std::fmt;

/// Errors returned by controller operations.
#[derive(Debug)]
pub enum Error {
    /// A caller-supplied argument is out of range or malformed.
    InvalidParam(String),
    /// A buffer or allocation limit was exceeded.
    NoMemory,
    /// Underlying socket or file I/O failed.
    Io(std::io::Error),
    /// A bounded wait elapsed without a response.
    Timeout,
    /// A received frame or PDU violates the wire format.
    Protocol(String),
    /// The named device, AR or slot does not exist.
    NotFound,
    /// A device with the same station name is already registered.
    AlreadyExists,
    /// The controller has not been started (or failed to start).
    NotInitialized,
    /// The operation needs an AR in RUN state and there is none.
    NotConnected,
    /// A bounded container (cache, queue) is at capacity.
    Full,
    /// Connection establishment failed after exhausting recovery options.
    ConnectionFailed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParam(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::NoMemory => write!(f, "Buffer capacity exceeded"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            Error::NotFound => write!(f, "Not found"),
            Error::AlreadyExists => write!(f, "Station name already registered"),
            Error::NotInitialized => write!(f, "Controller not initialized"),
            Error::NotConnected => write!(f, "No running application relationship"),
            Error::Full => write!(f, "Capacity exhausted"),
            Error::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
            Error::Timeout
        } else {
            Error::Io(e)
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
