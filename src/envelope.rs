//! Uniform response envelope
//!
//! Every broker operation answers with one of these instead of an error, so
//! the dispatch layer never has to handle a failure path of its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T = serde_json::Value> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn fail(error: impl ToString) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

impl Envelope {
    /// Serialize a manager result into the JSON envelope
    pub fn from_result<T: Serialize>(result: Result<T, BrokerError>) -> Self {
        match result {
            Ok(data) => match serde_json::to_value(data) {
                Ok(value) => Envelope::ok(value),
                Err(e) => Envelope::fail(format!("Failed to serialize response: {}", e)),
            },
            Err(e) => Envelope::fail(e),
        }
    }
}
