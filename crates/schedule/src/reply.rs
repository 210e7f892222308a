use serde::Serialize;
use serde_json::Value;

use crate::{MoveOutcome, ScheduleError};

/// Transport-neutral response: an HTTP-style status and a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    pub fn ok(outcome: &MoveOutcome) -> Self {
        match serde_json::to_value(outcome) {
            Ok(body) => Self { status: 200, body },
            Err(err) => Self::error(&ScheduleError::storage(err)),
        }
    }

    pub fn error(err: &ScheduleError) -> Self {
        let body = serde_json::to_value(err.payload()).unwrap_or_else(|_| {
            serde_json::json!({ "error": err.to_string(), "code": err.code() })
        });
        Self {
            status: err.status(),
            body,
        }
    }

    pub fn from_result(result: Result<MoveOutcome, ScheduleError>) -> Self {
        match result {
            Ok(outcome) => Self::ok(&outcome),
            Err(err) => Self::error(&err),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
