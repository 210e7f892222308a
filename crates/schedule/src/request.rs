use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::duration::{self, Millis};
use crate::{Order, RunId, ScheduleError};

/// Request fields that can be blamed for a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestField {
    Moving,
    Before,
    After,
    Order,
    Unorder,
    /// No positioning directive at all.
    Directive,
    Run,
    RunTime,
    SetupTime,
    AnchorTime,
}

impl fmt::Display for RequestField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Moving => "moving",
            Self::Before => "before",
            Self::After => "after",
            Self::Order => "order",
            Self::Unorder => "unorder",
            Self::Directive => "directive",
            Self::Run => "run",
            Self::RunTime => "run_time",
            Self::SetupTime => "setup_time",
            Self::AnchorTime => "anchor_time",
        };
        f.write_str(name)
    }
}

/// Where the moving run should end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirective {
    Before(RunId),
    After(RunId),
    ToOrder(Order),
    ToLast,
    Unorder,
}

impl MoveDirective {
    /// The other run this directive positions against.
    pub fn reference(&self) -> Option<RunId> {
        match self {
            Self::Before(id) | Self::After(id) => Some(*id),
            Self::ToOrder(_) | Self::ToLast | Self::Unorder => None,
        }
    }

    pub fn field(&self) -> RequestField {
        match self {
            Self::Before(_) => RequestField::Before,
            Self::After(_) => RequestField::After,
            Self::ToOrder(_) | Self::ToLast => RequestField::Order,
            Self::Unorder => RequestField::Unorder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub moving: RunId,
    pub directive: MoveDirective,
}

impl MoveRequest {
    pub fn new(moving: RunId, directive: MoveDirective) -> Self {
        Self { moving, directive }
    }

    pub fn before(moving: RunId, other: RunId) -> Self {
        Self::new(moving, MoveDirective::Before(other))
    }

    pub fn after(moving: RunId, other: RunId) -> Self {
        Self::new(moving, MoveDirective::After(other))
    }

    pub fn to_order(moving: RunId, order: Order) -> Self {
        Self::new(moving, MoveDirective::ToOrder(order))
    }

    pub fn to_last(moving: RunId) -> Self {
        Self::new(moving, MoveDirective::ToLast)
    }

    pub fn unorder(moving: RunId) -> Self {
        Self::new(moving, MoveDirective::Unorder)
    }
}

/// Wire shape of a move request: mutually exclusive optional keys.
///
/// `order` is either a positive integer or the string `"last"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveRequestBody {
    #[serde(default)]
    pub moving: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Value>,
    #[serde(default)]
    pub unorder: bool,
}

impl MoveRequestBody {
    pub fn into_request(self) -> Result<MoveRequest, ScheduleError> {
        let moving = self
            .moving
            .ok_or_else(|| ScheduleError::invalid(RequestField::Moving, "moving run is required"))?;

        let mut directives = Vec::with_capacity(1);
        if let Some(id) = self.before {
            directives.push(MoveDirective::Before(id));
        }
        if let Some(id) = self.after {
            directives.push(MoveDirective::After(id));
        }
        if let Some(order) = self.order {
            directives.push(parse_order(order)?);
        }
        if self.unorder {
            directives.push(MoveDirective::Unorder);
        }

        match directives.as_slice() {
            [] => Err(ScheduleError::invalid(
                RequestField::Directive,
                "one of before, after, order or unorder is required",
            )),
            [directive] => Ok(MoveRequest::new(moving, *directive)),
            [_, extra, ..] => Err(ScheduleError::invalid(
                extra.field(),
                "only one of before, after, order or unorder may be supplied",
            )),
        }
    }
}

fn parse_order(value: Value) -> Result<MoveDirective, ScheduleError> {
    let invalid = || {
        ScheduleError::invalid(
            RequestField::Order,
            "order must be a positive integer or \"last\"",
        )
    };
    match value {
        Value::String(s) if s == "last" => Ok(MoveDirective::ToLast),
        Value::Number(n) => n
            .as_u64()
            .filter(|k| *k >= 1)
            .and_then(|k| Order::try_from(k).ok())
            .map(MoveDirective::ToOrder)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// What to do with a run's anchor when retiming it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorChange {
    #[default]
    Keep,
    Set(DateTime<Utc>),
    Clear,
}

/// Change a run's durations or anchor and cascade from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetimeRequest {
    pub run: RunId,
    #[serde(default)]
    pub run_time: Option<Millis>,
    #[serde(default)]
    pub setup_time: Option<Millis>,
    #[serde(default)]
    pub anchor: AnchorChange,
}

impl RetimeRequest {
    pub fn new(run: RunId) -> Self {
        Self {
            run,
            run_time: None,
            setup_time: None,
            anchor: AnchorChange::Keep,
        }
    }

    pub fn run_time(mut self, value: Millis) -> Self {
        self.run_time = Some(value);
        self
    }

    pub fn setup_time(mut self, value: Millis) -> Self {
        self.setup_time = Some(value);
        self
    }

    pub fn anchor(mut self, anchor: AnchorChange) -> Self {
        self.anchor = anchor;
        self
    }
}

/// Wire shape of a retime request, with durations as human text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetimeRequestBody {
    pub run: Option<RunId>,
    #[serde(default)]
    pub run_time: Option<String>,
    #[serde(default)]
    pub setup_time: Option<String>,
    #[serde(default)]
    pub anchor_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clear_anchor: bool,
}

impl RetimeRequestBody {
    pub fn into_request(self) -> Result<RetimeRequest, ScheduleError> {
        let run = self
            .run
            .ok_or_else(|| ScheduleError::invalid(RequestField::Run, "run is required"))?;

        let parse = |field: RequestField, text: Option<String>| -> Result<Option<Millis>, ScheduleError> {
            text.map(|t| duration::parse(&t).map_err(|e| ScheduleError::invalid(field, e.to_string())))
                .transpose()
        };

        let anchor = match (self.anchor_time, self.clear_anchor) {
            (Some(_), true) => {
                return Err(ScheduleError::invalid(
                    RequestField::AnchorTime,
                    "anchor_time and clear_anchor are mutually exclusive",
                ))
            }
            (Some(at), false) => AnchorChange::Set(at),
            (None, true) => AnchorChange::Clear,
            (None, false) => AnchorChange::Keep,
        };

        Ok(RetimeRequest {
            run,
            run_time: parse(RequestField::RunTime, self.run_time)?,
            setup_time: parse(RequestField::SetupTime, self.setup_time)?,
            anchor,
        })
    }
}
