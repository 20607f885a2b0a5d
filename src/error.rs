// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Errors

use thiserror::Error;

/// OptSearch error type
#[derive(Debug, Error)]
pub enum OptError {
    /// Problem with the configuration file or command line
    #[error("Configuration error: {text}")]
    Config {
        /// Text
        text: String,
    },

    /// Indicates an invalid parameter
    #[error("Invalid parameter: {text}")]
    InvalidParameter {
        /// Text
        text: String,
    },

    /// Failure in the persistent store
    #[error("Store error: {text}")]
    Store {
        /// Text
        text: String,
    },

    /// Unexpected or undecodable message on the task farm wire
    #[error("Protocol error: {text}")]
    Protocol {
        /// Text
        text: String,
    },

    /// A worker process could not be spawned or driven
    #[error("Task farm error: {text}")]
    TaskFarm {
        /// Text
        text: String,
    },

    /// Wrapped SQLite error
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Wrapped I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OptError {
    /// Construct a [`OptError::Config`] from anything string-like.
    pub fn config(text: impl Into<String>) -> Self {
        OptError::Config { text: text.into() }
    }

    /// Construct a [`OptError::InvalidParameter`] from anything string-like.
    pub fn invalid_parameter(text: impl Into<String>) -> Self {
        OptError::InvalidParameter { text: text.into() }
    }

    /// Construct a [`OptError::Store`] from anything string-like.
    pub fn store(text: impl Into<String>) -> Self {
        OptError::Store { text: text.into() }
    }

    /// Construct a [`OptError::Protocol`] from anything string-like.
    pub fn protocol(text: impl Into<String>) -> Self {
        OptError::Protocol { text: text.into() }
    }

    /// Construct a [`OptError::TaskFarm`] from anything string-like.
    pub fn task_farm(text: impl Into<String>) -> Self {
        OptError::TaskFarm { text: text.into() }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, OptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_their_text() {
        let err = OptError::config("unknown key 'quux'");
        assert_eq!(err.to_string(), "Configuration error: unknown key 'quux'");

        let err = OptError::protocol("unexpected message type 7");
        assert_eq!(err.to_string(), "Protocol error: unexpected message type 7");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: OptError = io.into();
        assert!(matches!(err, OptError::Io(_)));
    }
}
