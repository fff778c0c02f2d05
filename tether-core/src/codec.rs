//! Canonical encoding and the result-or-error payload.
//!
//! Every value that crosses the engine (method arguments, results, wire
//! messages) is encoded with MessagePack. The encoded bytes double as the
//! canonical form used for change detection and for cache keys, so values
//! must serialize deterministically: prefer ordered maps (`BTreeMap`,
//! `IndexMap`) over `HashMap` in argument and result types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ReactiveError, Result};

/// Encode a value into its canonical bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Decode a value from bytes produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Why a summary has no value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Failure {
    /// The computation itself failed.
    Computation(String),
    /// The computation was torn down. Only the engine produces this.
    Stopped,
}

/// The authoritative result of one summary execution: a value or a failure.
///
/// Failures are first-class results. They are stored, compared and pushed
/// exactly like values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Value(Vec<u8>),
    Failed(Failure),
}

impl Outcome {
    /// Encode `value` and wrap it.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Outcome::Value(encode(value)?))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Outcome::Failed(Failure::Computation(message.into()))
    }

    pub fn stopped() -> Self {
        Outcome::Failed(Failure::Stopped)
    }

    /// Turn the result of running a computation into an outcome.
    ///
    /// Every error is a computation failure, including a `Stopped` returned
    /// by user code: a stored result must never end its consumers.
    pub fn from_result(result: Result<Vec<u8>>) -> Self {
        match result {
            Ok(bytes) => Outcome::Value(bytes),
            Err(ReactiveError::Computation(message)) => Outcome::failed(message),
            Err(other) => Outcome::failed(other.to_string()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Outcome::Failed(Failure::Stopped))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Canonical bytes of the whole tagged union.
    pub fn canonical(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    /// Decode the carried value, or turn the failure back into an error.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Outcome::Value(bytes) => decode(bytes),
            Outcome::Failed(Failure::Computation(message)) => {
                Err(ReactiveError::Computation(message.clone()))
            }
            Outcome::Failed(Failure::Stopped) => Err(ReactiveError::Stopped),
        }
    }
}
