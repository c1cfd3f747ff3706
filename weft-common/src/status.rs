// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Weft status/error types.

use std::fmt;

/// Status codes carried by [`WeftError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    KeyError,
    Invalid,
    IOError,
    TimedOut,
    NotFound,
    Disconnected,
    AlreadyExists,
    ObjectNotFound,
    ObjectUnknownOwner,
    ChannelError,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyError => "KeyError",
            Self::Invalid => "Invalid",
            Self::IOError => "IOError",
            Self::TimedOut => "TimedOut",
            Self::NotFound => "NotFound",
            Self::Disconnected => "Disconnected",
            Self::AlreadyExists => "AlreadyExists",
            Self::ObjectNotFound => "ObjectNotFound",
            Self::ObjectUnknownOwner => "ObjectUnknownOwner",
            Self::ChannelError => "ChannelError",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The primary error type for Weft operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct WeftError {
    pub code: StatusCode,
    pub message: String,
}

impl WeftError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn key_error(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::KeyError, msg)
    }
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Invalid, msg)
    }
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::IOError, msg)
    }
    pub fn timed_out(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::TimedOut, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, msg)
    }
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Disconnected, msg)
    }
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::AlreadyExists, msg)
    }
    pub fn object_not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::ObjectNotFound, msg)
    }
    pub fn object_unknown_owner(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::ObjectUnknownOwner, msg)
    }
    pub fn channel_error(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::ChannelError, msg)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == StatusCode::NotFound
    }
    pub fn is_disconnected(&self) -> bool {
        self.code == StatusCode::Disconnected
    }
    pub fn is_timed_out(&self) -> bool {
        self.code == StatusCode::TimedOut
    }
}

/// Convenience type alias: `Result<T, WeftError>`.
pub type WeftResult<T> = Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WeftError::io_error("disk full");
        assert_eq!(err.to_string(), "IOError: disk full");
    }

    #[test]
    fn test_predicates() {
        assert!(WeftError::disconnected("gone").is_disconnected());
        assert!(WeftError::not_found("x").is_not_found());
        assert!(!WeftError::not_found("x").is_timed_out());
    }
}
