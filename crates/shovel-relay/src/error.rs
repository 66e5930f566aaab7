//! Relay errors
//!
//! Transport failures never surface here: a relay whose endpoint breaks simply
//! stops. These variants only report misuse of the one-shot lifecycle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay '{label}' already started")]
    AlreadyStarted { label: String },

    #[error("Relay '{label}' was stopped before it started")]
    AlreadyStopped { label: String },
}
