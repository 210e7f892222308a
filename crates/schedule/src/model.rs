use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::duration::{self, Millis};

macro_rules! row_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

row_id!(EventId);
row_id!(RunId);
row_id!(InterstitialId);

/// 1-based position of a run on its event's timeline.
pub type Order = u32;

/// A broadcast. Read-only as far as scheduling is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub start_datetime: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, start_datetime: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            start_datetime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub event: EventId,
    pub name: String,
    #[serde(default)]
    pub order: Option<Order>,
    #[serde(with = "duration::hours")]
    pub run_time: Millis,
    #[serde(with = "duration::hours")]
    pub setup_time: Millis,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub anchor_time: Option<DateTime<Utc>>,
}

impl Run {
    /// New runs start off the timeline.
    pub fn new(event: EventId, name: impl Into<String>, run_time: Millis, setup_time: Millis) -> Self {
        Self {
            id: RunId::new(),
            event,
            name: name.into(),
            order: None,
            run_time,
            setup_time,
            start_time: None,
            end_time: None,
            anchor_time: None,
        }
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_anchor(mut self, anchor_time: DateTime<Utc>) -> Self {
        self.anchor_time = Some(anchor_time);
        self
    }

    pub fn is_ordered(&self) -> bool {
        self.order.is_some()
    }

    /// Run time plus setup time.
    pub fn total(&self) -> Duration {
        Duration::milliseconds(self.run_time + self.setup_time)
    }

    /// Take the run off the timeline.
    pub(crate) fn clear_schedule(&mut self) {
        self.order = None;
        self.start_time = None;
        self.end_time = None;
        self.anchor_time = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterstitialKind {
    Ad {
        sponsor_name: String,
        ad_name: String,
        #[serde(default)]
        ad_type: AdType,
    },
    Interview {
        interviewers: String,
        #[serde(default)]
        topic: String,
        #[serde(default = "default_public")]
        public: bool,
    },
}

fn default_public() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdType {
    #[default]
    Video,
    Image,
}

/// Timeline content that airs right after its anchor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interstitial {
    pub id: InterstitialId,
    pub event: EventId,
    pub anchor: RunId,
    /// Mirrors the anchor run's order.
    #[serde(default)]
    pub order: Option<Order>,
    pub suborder: u32,
    #[serde(with = "duration::minutes")]
    pub length: Millis,
    #[serde(flatten)]
    pub kind: InterstitialKind,
}

impl Interstitial {
    pub fn new(anchor: &Run, suborder: u32, length: Millis, kind: InterstitialKind) -> Self {
        Self {
            id: InterstitialId::new(),
            event: anchor.event,
            anchor: anchor.id,
            order: anchor.order,
            suborder,
            length,
            kind,
        }
    }
}

/// Count and maximum of the non-null orders of one event. A gap exists
/// whenever the two disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStats {
    pub count: u32,
    pub max: Option<Order>,
}

impl OrderStats {
    pub fn from_orders(orders: impl IntoIterator<Item = Order>) -> Self {
        orders.into_iter().fold(Self::default(), |acc, order| Self {
            count: acc.count + 1,
            max: Some(acc.max.map_or(order, |m| m.max(order))),
        })
    }

    pub fn has_holes(&self) -> bool {
        self.max.unwrap_or(0) != self.count
    }
}

/// Inclusive span of orders. `max == None` is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpan {
    pub min: Order,
    pub max: Option<Order>,
}

impl OrderSpan {
    pub fn new(min: Order, max: Order) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub fn starting_at(min: Order) -> Self {
        Self { min, max: None }
    }

    pub fn contains(&self, order: Order) -> bool {
        order >= self.min && self.max.map_or(true, |max| order <= max)
    }
}
