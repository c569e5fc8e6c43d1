use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::{DataType, Symbol};
use crate::provider::ProviderId;
use crate::ValidationError;

/// Unique work item identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for WorkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Admission tier. Declaration order is the serving order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Self; 3] = [Self::High, Self::Medium, Self::Low];

    /// Lane index; lower is served first.
    pub const fn rank(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(ValidationError::InvalidPriority {
                value: value.to_owned(),
            }),
        }
    }
}

/// Lifecycle of a work item.
///
/// `Pending -> Queued -> Processing -> Completed | Failed | Cancelled`. A failed
/// attempt that is retried goes back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Role of an already-authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Analyst,
    Trader,
    Viewer,
}

/// Identity resolved by the authentication layer in front of the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Identity used for work the gateway schedules on its own (prefetch, warm-up).
    pub fn system() -> Self {
        Self::new("system", Role::Admin)
    }

    pub const fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }
}

pub const DEFAULT_REGION: &str = "US";

/// One admitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    pub id: WorkId,
    pub symbol: Symbol,
    pub data_type: DataType,
    pub priority: Priority,
    /// Region code used for provider coverage scoring.
    pub region: String,
    pub provider: Option<ProviderId>,
    pub state: WorkState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub caller: Caller,
}

impl WorkItem {
    pub fn new(symbol: Symbol, data_type: DataType, priority: Priority, caller: Caller) -> Self {
        Self {
            id: WorkId::new(),
            symbol,
            data_type,
            priority,
            region: String::from(DEFAULT_REGION),
            provider: None,
            state: WorkState::Pending,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
            retry_count: 0,
            last_error: None,
            caller,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into().trim().to_ascii_uppercase();
        self
    }

    pub(crate) fn finish(&mut self, state: WorkState) {
        self.state = state;
        self.completed_at = Some(OffsetDateTime::now_utc());
    }
}
