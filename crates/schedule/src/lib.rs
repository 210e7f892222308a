use serde::Serialize;
use thiserror::Error;

pub mod duration;
mod model;
pub use model::*;
mod request;
pub use request::*;
mod cascade;
pub use cascade::*;
mod validate;
pub use validate::*;
mod plan;
pub use plan::*;
mod repository;
pub use repository::*;
mod engine;
pub use engine::*;
mod memory;
pub use memory::*;
mod reply;
pub use reply::*;

use duration::{DurationError, Hms, Millis};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid request ({field}): {message}")]
    InvalidRequest {
        field: RequestField,
        message: String,
    },
    #[error("run not found ({field}): {id}")]
    RunNotFound { field: RequestField, id: RunId },
    #[error("event not found: {0}")]
    EventNotFound(EventId),
    #[error("run {other} ({field}) belongs to event {other_event}, not {event}")]
    CrossEvent {
        field: RequestField,
        other: RunId,
        event: EventId,
        other_event: EventId,
    },
    #[error("run {id} ({field}) is not on the timeline")]
    UnorderedReference { field: RequestField, id: RunId },
    #[error("run is already at the requested position ({field})")]
    NoChange { field: RequestField },
    #[error(
        "run {run} would need a setup time of {} to meet the anchor of run {anchored}",
        Hms(*.setup_time)
    )]
    AnchorConflict {
        run: RunId,
        anchored: RunId,
        setup_time: Millis,
    },
    #[error("run {run} still anchors {} interstitial(s)", .interstitials.len())]
    DanglingInterstitial {
        run: RunId,
        interstitials: Vec<InterstitialId>,
    },
    #[error(transparent)]
    InvalidDuration(#[from] DurationError),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("timed out waiting for row locks")]
    LockTimeout,
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ScheduleError {
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Box::new(err))
    }

    pub(crate) fn invalid(field: RequestField, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field,
            message: message.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::RunNotFound { .. } => "run_not_found",
            Self::EventNotFound(_) => "event_not_found",
            Self::CrossEvent { .. } => "cross_event",
            Self::UnorderedReference { .. } => "unordered_reference",
            Self::NoChange { .. } => "no_change",
            Self::AnchorConflict { .. } => "anchor_conflict",
            Self::DanglingInterstitial { .. } => "dangling_interstitial",
            Self::InvalidDuration(_) => "invalid_duration",
            Self::Constraint(_) => "constraint",
            Self::LockTimeout => "lock_timeout",
            Self::Storage(_) => "storage",
        }
    }

    /// HTTP-style status for callers that speak HTTP.
    pub fn status(&self) -> u16 {
        match self {
            Self::RunNotFound { .. } | Self::EventNotFound(_) => 404,
            Self::LockTimeout | Self::Constraint(_) => 409,
            Self::Storage(_) => 500,
            _ => 400,
        }
    }

    /// The request field a UI should highlight, when there is one.
    pub fn field(&self) -> Option<RequestField> {
        match self {
            Self::InvalidRequest { field, .. }
            | Self::RunNotFound { field, .. }
            | Self::CrossEvent { field, .. }
            | Self::UnorderedReference { field, .. }
            | Self::NoChange { field } => Some(*field),
            _ => None,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            error: self.to_string(),
            code: self.code(),
            field: self.field(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<RequestField>,
}
