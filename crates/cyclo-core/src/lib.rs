use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub const DEFAULT_PHASE: &str = "planning";
pub const DEFAULT_TASK_PRIORITY: &str = "medium";
pub const DEFAULT_TASK_STATUS: &str = "pending";

pub const STAGE_MIN: i64 = 1;
pub const STAGE_MAX: i64 = 4;
pub const PROGRESS_MAX: i64 = 100;

/// Request-level failure taxonomy shared by every endpoint.
///
/// `NotFound` deliberately covers both "record absent" and "record owned by
/// someone else" so callers cannot probe for rows they do not own.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Persistence { message: String, details: String },
}

impl ApiError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    #[must_use]
    pub fn persistence(message: impl Into<String>, details: impl Display) -> Self {
        Self::Persistence { message: message.into(), details: details.to_string() }
    }

    /// HTTP status code this error maps to in the JSON envelope.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Persistence { .. } => 500,
        }
    }

    /// Underlying driver message, surfaced only for persistence failures.
    #[must_use]
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Persistence { details, .. } => Some(details),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SystemId(pub Ulid);

impl SystemId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SystemId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SystemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub Ulid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct KnowledgeItemId(pub Ulid);

impl KnowledgeItemId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for KnowledgeItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for KnowledgeItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReflectionId(pub Ulid);

impl ReflectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReflectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReflectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActivityId(pub Ulid);

impl ActivityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ActivityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user-defined goal framework with phases and progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrowthSystem {
    pub id: SystemId,
    pub user_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub domain: String,
    pub current_phase: String,
    pub progress: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl GrowthSystem {
    /// Validate the row before it is persisted.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when required fields are blank or
    /// `progress` leaves the [0, 100] interval.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.title.trim().is_empty() || self.domain.trim().is_empty() {
            return Err(ApiError::validation("Title and domain are required"));
        }
        if self.current_phase.trim().is_empty() {
            return Err(ApiError::validation("Phase must not be empty"));
        }
        if i64::from(self.progress) > PROGRESS_MAX {
            return Err(ApiError::validation("Progress must be between 0 and 100"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrowthTask {
    pub id: TaskId,
    pub system_id: SystemId,
    pub title: String,
    pub description: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    pub priority: String,
    pub status: String,
    pub cycle_phase: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl GrowthTask {
    /// # Errors
    /// Returns [`ApiError::Validation`] when the title is blank.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.title.trim().is_empty() {
            return Err(ApiError::validation("System ID and title are required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeItem {
    pub id: KnowledgeItemId,
    pub user_id: UserId,
    pub title: String,
    pub content: String,
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Directed edges to other knowledge items owned by the same user.
    #[serde(default)]
    pub connections: Vec<KnowledgeItemId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl KnowledgeItem {
    /// # Errors
    /// Returns [`ApiError::Validation`] when title or content is blank.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.title.trim().is_empty() || self.content.trim().is_empty() {
            return Err(ApiError::validation("Title and content are required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reflection {
    pub id: ReflectionId,
    pub user_id: UserId,
    pub system_id: Option<SystemId>,
    pub title: String,
    pub content: String,
    pub cycle_phase: Option<String>,
    pub domain: Option<String>,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Reflection {
    /// # Errors
    /// Returns [`ApiError::Validation`] when title or content is blank.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.title.trim().is_empty() || self.content.trim().is_empty() {
            return Err(ApiError::validation("Title and content are required"));
        }
        Ok(())
    }
}

/// The single per-user assistant evolution row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycloEvolution {
    pub user_id: UserId,
    pub current_stage: u8,
    pub interactions_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl CycloEvolution {
    /// The shape returned when a user has never updated their stage.
    /// Reading never creates a row.
    #[must_use]
    pub fn initial(user_id: UserId, now: OffsetDateTime) -> Self {
        Self { user_id, current_stage: 1, interactions_count: 0, updated_at: now }
    }
}

/// Append-only feed row describing one user action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Activity {
    pub id: ActivityId,
    pub user_id: UserId,
    pub action: String,
    pub item: String,
    pub system_id: Option<SystemId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Activity {
    /// # Errors
    /// Returns [`ApiError::Validation`] when action or item label is blank.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.action.trim().is_empty() || self.item.trim().is_empty() {
            return Err(ApiError::validation("Activity action and item are required"));
        }
        Ok(())
    }
}

/// Validate an assistant stage value from a request body.
///
/// # Errors
/// Returns [`ApiError::Validation`] with the canonical message when the
/// stage is missing or outside the closed interval [1, 4].
pub fn validate_stage(stage: Option<i64>) -> Result<u8, ApiError> {
    match stage {
        Some(value) if (STAGE_MIN..=STAGE_MAX).contains(&value) => {
            u8::try_from(value).map_err(|_| stage_error())
        }
        _ => Err(stage_error()),
    }
}

fn stage_error() -> ApiError {
    ApiError::validation("Valid stage (1-4) is required")
}

/// Validate a progress percentage from a request body.
///
/// # Errors
/// Returns [`ApiError::Validation`] when the value leaves [0, 100].
pub fn validate_progress(progress: i64) -> Result<u8, ApiError> {
    if !(0..=PROGRESS_MAX).contains(&progress) {
        return Err(ApiError::validation("Progress must be between 0 and 100"));
    }
    u8::try_from(progress)
        .map_err(|_| ApiError::validation("Progress must be between 0 and 100"))
}
