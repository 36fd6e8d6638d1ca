// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Status values for error propagation at layer boundaries above the allocators.
//!
//! A [`Status`] is a `{code, message}` pair. Code 0 means success. Accessors are
//! explicit; there is no implicit conversion to `bool` or integer.

use std::fmt;

use crate::error::AllocError;

/// Status codes shared across the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    FunctionUnImplement = 1,
    PathNotValid = 2,
    ModelParseError = 3,
    InternalError = 5,
    KeyValueHasExist = 6,
    InvalidArgument = 7,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Result value carrying a status code and a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    /// Raw integer code.
    pub fn code(&self) -> i32 {
        self.code.as_i32()
    }

    pub fn status_code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    /// Convert into a `Result`, keeping the status as the error on failure.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        error::success("")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Status {}

impl From<AllocError> for Status {
    fn from(err: AllocError) -> Self {
        let message = err.to_string();
        match err {
            AllocError::ZeroSize
            | AllocError::NullPointer(_)
            | AllocError::UnknownMemcpyKind(_)
            | AllocError::InvalidDevice { .. }
            | AllocError::UnknownPointer { .. }
            | AllocError::DoubleRelease { .. }
            | AllocError::Config(_) => error::invalid_argument(message),
            AllocError::UnsupportedDevice(_) | AllocError::NoRuntime(_) => {
                error::function_not_implement(message)
            }
            AllocError::OutOfMemory { .. } | AllocError::Device(_) => error::internal_error(message),
        }
    }
}

/// Named constructors for each status code.
pub mod error {
    use super::{Status, StatusCode};

    pub fn success(message: impl Into<String>) -> Status {
        Status::new(StatusCode::Success, message)
    }

    pub fn function_not_implement(message: impl Into<String>) -> Status {
        Status::new(StatusCode::FunctionUnImplement, message)
    }

    pub fn path_not_valid(message: impl Into<String>) -> Status {
        Status::new(StatusCode::PathNotValid, message)
    }

    pub fn model_parse_error(message: impl Into<String>) -> Status {
        Status::new(StatusCode::ModelParseError, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Status {
        Status::new(StatusCode::InternalError, message)
    }

    pub fn key_has_exists(message: impl Into<String>) -> Status {
        Status::new(StatusCode::KeyValueHasExist, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(StatusCode::InvalidArgument, message)
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
