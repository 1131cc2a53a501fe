//! One operation per HTTP endpoint, each following the same shape: validate
//! the typed request body, check parent ownership where the operation
//! references a parent record, perform the primary write, then fire the
//! best-effort secondary writes (tags, insights, connections, activity log).
//!
//! Secondary-write failures are logged at `warn` and swallowed; the primary
//! result still reports success. Primary-write failures surface as
//! [`ApiError::Persistence`].

use std::path::PathBuf;

use anyhow::Result;
use cyclo_core::{
    validate_progress, validate_stage, Activity, ActivityId, ApiError, CycloEvolution,
    GrowthSystem, GrowthTask, KnowledgeItem, KnowledgeItemId, Reflection, ReflectionId,
    SystemId, TaskId, UserId, DEFAULT_PHASE, DEFAULT_TASK_PRIORITY, DEFAULT_TASK_STATUS,
};
use cyclo_store_sqlite::{SchemaStatus, SqliteStore, TableOwnership};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

pub const DEFAULT_ACTIVITY_LIMIT: i64 = 20;
pub const MAX_ACTIVITY_LIMIT: i64 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateGrowthSystemRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub current_phase: Option<String>,
    pub progress: Option<i64>,
}

/// Partial update: only fields present in the body are written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateGrowthSystemRequest {
    pub system_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub current_phase: Option<String>,
    pub progress: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateGrowthTaskRequest {
    pub system_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub cycle_phase: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateKnowledgeItemRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub connections: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateReflectionRequest {
    pub system_id: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub cycle_phase: Option<String>,
    pub domain: Option<String>,
    pub insights: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateCycloStageRequest {
    pub stage: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListGrowthTasksRequest {
    pub system_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListActivitiesRequest {
    pub limit: Option<i64>,
}

/// Store-level facts surfaced by the diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StoreDiagnostics {
    pub schema: SchemaStatus,
    pub ownership: Vec<TableOwnership>,
}

/// Stateless entry point; every operation opens its own store handle against
/// `db_path` and runs migrations before touching data.
#[derive(Debug, Clone)]
pub struct CycloApi {
    db_path: PathBuf,
}

impl CycloApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Maps a presented bearer token to its user, or `None` when unknown.
    ///
    /// # Errors
    /// Returns [`ApiError::Persistence`] when the store cannot be read.
    pub fn resolve_token(&self, token: &str) -> Result<Option<UserId>, ApiError> {
        let store = self
            .open_store()
            .map_err(|err| persistence("Failed to resolve token", &err))?;
        store
            .resolve_token(token)
            .map_err(|err| persistence("Failed to resolve token", &err))
    }

    /// Mints a new bearer token for `user_id`. The clear-text token is
    /// returned exactly once; only its digest is stored.
    ///
    /// # Errors
    /// Returns [`ApiError::Persistence`] when the store cannot be written.
    pub fn issue_token(&self, user_id: UserId, label: &str) -> Result<String, ApiError> {
        let mut store = self
            .open_store()
            .map_err(|err| persistence("Failed to issue token", &err))?;
        store
            .issue_token(user_id, label)
            .map_err(|err| persistence("Failed to issue token", &err))
    }

    /// Creates a growth system for the caller.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when title or domain is missing and
    /// [`ApiError::Persistence`] when the primary write fails.
    pub fn create_growth_system(
        &self,
        user_id: UserId,
        request: CreateGrowthSystemRequest,
    ) -> Result<GrowthSystem, ApiError> {
        let title = required_text(request.title, "Title and domain are required")?;
        let domain = required_text(request.domain, "Title and domain are required")?;
        let progress = match request.progress {
            Some(value) => validate_progress(value)?,
            None => 0,
        };
        let now = OffsetDateTime::now_utc();
        let system = GrowthSystem {
            id: SystemId::new(),
            user_id,
            title,
            description: optional_text(request.description),
            domain,
            current_phase: request
                .current_phase
                .unwrap_or_else(|| DEFAULT_PHASE.to_string()),
            progress,
            start_date: now,
            updated_at: now,
        };
        system.validate()?;

        let mut store = self
            .open_store()
            .map_err(|err| persistence("Failed to create growth system", &err))?;
        store
            .insert_growth_system(&system)
            .map_err(|err| persistence("Failed to create growth system", &err))?;
        log_activity(
            &mut store,
            &Activity {
                id: ActivityId::new(),
                user_id,
                action: "Created new system".to_string(),
                item: system.title.clone(),
                system_id: Some(system.id),
                created_at: now,
            },
        );
        Ok(system)
    }

    /// Applies a partial update to an owned growth system. `updated_at` is
    /// always refreshed; a phase change is logged as its own activity.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when `system_id` is missing or a
    /// provided field is invalid, [`ApiError::NotFound`] when the system is
    /// absent or owned by someone else, and [`ApiError::Persistence`] when
    /// the write fails.
    pub fn update_growth_system(
        &self,
        user_id: UserId,
        request: UpdateGrowthSystemRequest,
    ) -> Result<GrowthSystem, ApiError> {
        let raw_id = required_text(request.system_id, "System ID is required")?;
        let system_id = parse_system_id(&raw_id)?;

        let mut store = self
            .open_store()
            .map_err(|err| persistence("Failed to update growth system", &err))?;
        let mut system = store
            .get_growth_system(user_id, system_id)
            .map_err(|err| persistence("Failed to update growth system", &err))?
            .ok_or_else(|| ApiError::not_found("System not found"))?;

        let previous_phase = system.current_phase.clone();
        if let Some(title) = request.title {
            system.title = title;
        }
        if let Some(description) = request.description {
            system.description = optional_text(Some(description));
        }
        if let Some(domain) = request.domain {
            system.domain = domain;
        }
        if let Some(phase) = request.current_phase {
            system.current_phase = phase;
        }
        if let Some(progress) = request.progress {
            system.progress = validate_progress(progress)?;
        }
        let now = OffsetDateTime::now_utc();
        system.updated_at = now;
        system.validate()?;

        store
            .update_growth_system(&system)
            .map_err(|err| persistence("Failed to update growth system", &err))?;

        let action = if system.current_phase == previous_phase {
            "Updated system".to_string()
        } else {
            format!("Moved to {} phase", system.current_phase)
        };
        log_activity(
            &mut store,
            &Activity {
                id: ActivityId::new(),
                user_id,
                action,
                item: system.title.clone(),
                system_id: Some(system.id),
                created_at: now,
            },
        );
        Ok(system)
    }

    /// Creates a task under a growth system the caller owns. Tags are
    /// best-effort; the returned row carries the tags that actually wrote.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when `system_id` or `title` is
    /// missing, [`ApiError::NotFound`] when the parent system is absent or
    /// foreign, and [`ApiError::Persistence`] when the primary write fails.
    pub fn create_growth_task(
        &self,
        user_id: UserId,
        request: CreateGrowthTaskRequest,
    ) -> Result<GrowthTask, ApiError> {
        let raw_id = required_text(request.system_id, "System ID and title are required")?;
        let title = required_text(request.title, "System ID and title are required")?;
        let system_id = parse_system_id(&raw_id)?;
        let due_date = parse_due_date(request.due_date)?;

        let mut store = self
            .open_store()
            .map_err(|err| persistence("Failed to create growth task", &err))?;
        let owned = store
            .system_owned(user_id, system_id)
            .map_err(|err| persistence("Failed to create growth task", &err))?;
        if !owned {
            return Err(ApiError::not_found("System not found"));
        }

        let now = OffsetDateTime::now_utc();
        let mut task = GrowthTask {
            id: TaskId::new(),
            system_id,
            title,
            description: optional_text(request.description),
            due_date,
            priority: request
                .priority
                .unwrap_or_else(|| DEFAULT_TASK_PRIORITY.to_string()),
            status: request
                .status
                .unwrap_or_else(|| DEFAULT_TASK_STATUS.to_string()),
            cycle_phase: optional_text(request.cycle_phase),
            tags: Vec::new(),
            created_at: now,
        };
        task.validate()?;
        store
            .insert_growth_task(&task)
            .map_err(|err| persistence("Failed to create growth task", &err))?;

        for tag in request.tags {
            match store.insert_task_tag(task.id, &tag) {
                Ok(()) => task.tags.push(tag),
                Err(err) => {
                    tracing::warn!(task_id = %task.id, tag = %tag, "task tag write failed: {err:#}");
                }
            }
        }
        log_activity(
            &mut store,
            &Activity {
                id: ActivityId::new(),
                user_id,
                action: "Added new task".to_string(),
                item: task.title.clone(),
                system_id: Some(system_id),
                created_at: now,
            },
        );
        Ok(task)
    }

    /// Creates a knowledge item for the caller. Tags and connections are
    /// best-effort; the returned row carries the ones that actually wrote.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when `title` or `content` is missing
    /// and [`ApiError::Persistence`] when the primary write fails.
    pub fn create_knowledge_item(
        &self,
        user_id: UserId,
        request: CreateKnowledgeItemRequest,
    ) -> Result<KnowledgeItem, ApiError> {
        let title = required_text(request.title, "Title and content are required")?;
        let content = required_text(request.content, "Title and content are required")?;

        let mut store = self
            .open_store()
            .map_err(|err| persistence("Failed to create knowledge item", &err))?;
        let now = OffsetDateTime::now_utc();
        let mut item = KnowledgeItem {
            id: KnowledgeItemId::new(),
            user_id,
            title,
            content,
            source: optional_text(request.source),
            tags: Vec::new(),
            connections: Vec::new(),
            created_at: now,
        };
        item.validate()?;
        store
            .insert_knowledge_item(&item)
            .map_err(|err| persistence("Failed to create knowledge item", &err))?;

        for tag in request.tags {
            match store.insert_knowledge_tag(item.id, &tag) {
                Ok(()) => item.tags.push(tag),
                Err(err) => {
                    tracing::warn!(item_id = %item.id, tag = %tag, "knowledge tag write failed: {err:#}");
                }
            }
        }
        for raw in request.connections {
            match connect_knowledge(&mut store, item.id, &raw) {
                Ok(target) => item.connections.push(target),
                Err(err) => {
                    tracing::warn!(
                        item_id = %item.id,
                        target = %raw,
                        "knowledge connection write failed: {err:#}"
                    );
                }
            }
        }
        log_activity(
            &mut store,
            &Activity {
                id: ActivityId::new(),
                user_id,
                action: "Added knowledge item".to_string(),
                item: item.title.clone(),
                system_id: None,
                created_at: now,
            },
        );
        Ok(item)
    }

    /// Creates a reflection, optionally attached to a growth system the
    /// caller owns. Insights and tags are best-effort.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when `title` or `content` is missing,
    /// [`ApiError::NotFound`] when a referenced system is absent or foreign,
    /// and [`ApiError::Persistence`] when the primary write fails.
    pub fn create_reflection(
        &self,
        user_id: UserId,
        request: CreateReflectionRequest,
    ) -> Result<Reflection, ApiError> {
        let title = required_text(request.title, "Title and content are required")?;
        let content = required_text(request.content, "Title and content are required")?;

        let mut store = self
            .open_store()
            .map_err(|err| persistence("Failed to create reflection", &err))?;
        let system_id = match optional_text(request.system_id) {
            Some(raw) => {
                let system_id = parse_system_id(&raw)?;
                let owned = store
                    .system_owned(user_id, system_id)
                    .map_err(|err| persistence("Failed to create reflection", &err))?;
                if !owned {
                    return Err(ApiError::not_found("System not found"));
                }
                Some(system_id)
            }
            None => None,
        };

        let now = OffsetDateTime::now_utc();
        let mut reflection = Reflection {
            id: ReflectionId::new(),
            user_id,
            system_id,
            title,
            content,
            cycle_phase: optional_text(request.cycle_phase),
            domain: optional_text(request.domain),
            insights: Vec::new(),
            tags: Vec::new(),
            created_at: now,
        };
        reflection.validate()?;
        store
            .insert_reflection(&reflection)
            .map_err(|err| persistence("Failed to create reflection", &err))?;

        for (position, insight) in request.insights.into_iter().enumerate() {
            let position = position_index(position);
            match store.insert_reflection_insight(reflection.id, position, &insight) {
                Ok(()) => reflection.insights.push(insight),
                Err(err) => {
                    tracing::warn!(
                        reflection_id = %reflection.id,
                        position,
                        "reflection insight write failed: {err:#}"
                    );
                }
            }
        }
        for tag in request.tags {
            match store.insert_reflection_tag(reflection.id, &tag) {
                Ok(()) => reflection.tags.push(tag),
                Err(err) => {
                    tracing::warn!(
                        reflection_id = %reflection.id,
                        tag = %tag,
                        "reflection tag write failed: {err:#}"
                    );
                }
            }
        }
        log_activity(
            &mut store,
            &Activity {
                id: ActivityId::new(),
                user_id,
                action: "Added new reflection".to_string(),
                item: reflection.title.clone(),
                system_id,
                created_at: now,
            },
        );
        Ok(reflection)
    }

    /// Records an assistant stage update: first call inserts the per-user
    /// row with one interaction, every later call increments the counter.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when the stage is missing or outside
    /// [1, 4] and [`ApiError::Persistence`] when the write fails.
    pub fn update_cyclo_stage(
        &self,
        user_id: UserId,
        request: UpdateCycloStageRequest,
    ) -> Result<CycloEvolution, ApiError> {
        let stage = validate_stage(request.stage)?;
        let mut store = self
            .open_store()
            .map_err(|err| persistence("Failed to update Cyclo stage", &err))?;
        let now = OffsetDateTime::now_utc();
        let evolution = store
            .upsert_cyclo_stage(user_id, stage, now)
            .map_err(|err| persistence("Failed to update Cyclo stage", &err))?;
        log_activity(
            &mut store,
            &Activity {
                id: ActivityId::new(),
                user_id,
                action: "Cyclo evolved".to_string(),
                item: format!("Stage {stage}"),
                system_id: None,
                created_at: now,
            },
        );
        Ok(evolution)
    }

    /// Fetches the caller's evolution row. A user who has never updated
    /// their stage gets the initial shape; no row is created by reading.
    ///
    /// # Errors
    /// Returns [`ApiError::Persistence`] when the store cannot be read.
    pub fn get_cyclo_evolution(&self, user_id: UserId) -> Result<CycloEvolution, ApiError> {
        let store = self
            .open_store()
            .map_err(|err| persistence("Failed to load Cyclo evolution", &err))?;
        let evolution = store
            .get_cyclo_evolution(user_id)
            .map_err(|err| persistence("Failed to load Cyclo evolution", &err))?;
        Ok(evolution.unwrap_or_else(|| CycloEvolution::initial(user_id, OffsetDateTime::now_utc())))
    }

    /// Lists the caller's growth systems, most recently updated first.
    ///
    /// # Errors
    /// Returns [`ApiError::Persistence`] when the store cannot be read.
    pub fn list_growth_systems(&self, user_id: UserId) -> Result<Vec<GrowthSystem>, ApiError> {
        let store = self
            .open_store()
            .map_err(|err| persistence("Failed to load growth systems", &err))?;
        store
            .list_growth_systems(user_id)
            .map_err(|err| persistence("Failed to load growth systems", &err))
    }

    /// Lists the tasks of one growth system the caller owns, newest first.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when `system_id` is missing,
    /// [`ApiError::NotFound`] when the system is absent or foreign, and
    /// [`ApiError::Persistence`] when the store cannot be read.
    pub fn list_growth_tasks(
        &self,
        user_id: UserId,
        request: ListGrowthTasksRequest,
    ) -> Result<Vec<GrowthTask>, ApiError> {
        let raw_id = required_text(request.system_id, "System ID is required")?;
        let system_id = parse_system_id(&raw_id)?;
        let store = self
            .open_store()
            .map_err(|err| persistence("Failed to load growth tasks", &err))?;
        let owned = store
            .system_owned(user_id, system_id)
            .map_err(|err| persistence("Failed to load growth tasks", &err))?;
        if !owned {
            return Err(ApiError::not_found("System not found"));
        }
        store
            .list_growth_tasks(system_id)
            .map_err(|err| persistence("Failed to load growth tasks", &err))
    }

    /// Lists the caller's knowledge items, newest first.
    ///
    /// # Errors
    /// Returns [`ApiError::Persistence`] when the store cannot be read.
    pub fn list_knowledge_items(&self, user_id: UserId) -> Result<Vec<KnowledgeItem>, ApiError> {
        let store = self
            .open_store()
            .map_err(|err| persistence("Failed to load knowledge items", &err))?;
        store
            .list_knowledge_items(user_id)
            .map_err(|err| persistence("Failed to load knowledge items", &err))
    }

    /// Lists the caller's reflections, newest first.
    ///
    /// # Errors
    /// Returns [`ApiError::Persistence`] when the store cannot be read.
    pub fn list_reflections(&self, user_id: UserId) -> Result<Vec<Reflection>, ApiError> {
        let store = self
            .open_store()
            .map_err(|err| persistence("Failed to load reflections", &err))?;
        store
            .list_reflections(user_id)
            .map_err(|err| persistence("Failed to load reflections", &err))
    }

    /// Lists the caller's most recent activities, newest first.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] when the limit leaves [1, 100] and
    /// [`ApiError::Persistence`] when the store cannot be read.
    pub fn list_activities(
        &self,
        user_id: UserId,
        request: ListActivitiesRequest,
    ) -> Result<Vec<Activity>, ApiError> {
        let limit = match request.limit {
            Some(value) if (1..=MAX_ACTIVITY_LIMIT).contains(&value) => value,
            Some(_) => {
                return Err(ApiError::validation(format!(
                    "Limit must be between 1 and {MAX_ACTIVITY_LIMIT}"
                )))
            }
            None => DEFAULT_ACTIVITY_LIMIT,
        };
        let limit = u32::try_from(limit)
            .map_err(|_| ApiError::validation("Limit must be between 1 and 100"))?;
        let store = self
            .open_store()
            .map_err(|err| persistence("Failed to load activities", &err))?;
        store
            .list_activities(user_id, limit)
            .map_err(|err| persistence("Failed to load activities", &err))
    }

    /// Store-level diagnostics: schema status plus the per-table ownership
    /// probe. Informational only, mutates nothing beyond migrations.
    ///
    /// # Errors
    /// Returns [`ApiError::Persistence`] when introspection fails.
    pub fn diagnostics(&self) -> Result<StoreDiagnostics, ApiError> {
        let store = self
            .open_store()
            .map_err(|err| persistence("Failed to collect diagnostics", &err))?;
        let schema = store
            .schema_status()
            .map_err(|err| persistence("Failed to collect diagnostics", &err))?;
        let ownership = store
            .ownership_status()
            .map_err(|err| persistence("Failed to collect diagnostics", &err))?;
        Ok(StoreDiagnostics { schema, ownership })
    }

    /// Copies the database to `destination` via the SQLite backup API.
    ///
    /// # Errors
    /// Returns an error if the backup fails.
    pub fn backup(&self, destination: &std::path::Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(destination)
    }

    /// Replaces the database with the contents of `source`.
    ///
    /// # Errors
    /// Returns an error if the restore fails.
    pub fn restore(&self, source: &std::path::Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(source)
    }

    /// Runs the store integrity check.
    ///
    /// # Errors
    /// Returns an error if a check cannot be executed.
    pub fn integrity_check(&self) -> Result<cyclo_store_sqlite::IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Reports the schema migration state.
    ///
    /// # Errors
    /// Returns an error if introspection fails.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Applies pending schema migrations.
    ///
    /// # Errors
    /// Returns an error if a migration fails.
    pub fn migrate(&self) -> Result<SchemaStatus> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        store.schema_status()
    }
}

fn connect_knowledge(
    store: &mut SqliteStore,
    from: KnowledgeItemId,
    raw_target: &str,
) -> Result<KnowledgeItemId> {
    let target = KnowledgeItemId(Ulid::from_string(raw_target.trim())?);
    store.insert_knowledge_connection(from, target)?;
    Ok(target)
}

fn log_activity(store: &mut SqliteStore, activity: &Activity) {
    if let Err(err) = store.insert_activity(activity) {
        tracing::warn!(action = %activity.action, "activity log write failed: {err:#}");
    }
}

fn persistence(message: &str, err: &anyhow::Error) -> ApiError {
    ApiError::persistence(message, format!("{err:#}"))
}

fn required_text(value: Option<String>, message: &str) -> Result<String, ApiError> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(ApiError::validation(message)),
    }
}

fn optional_text(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

fn parse_system_id(raw: &str) -> Result<SystemId, ApiError> {
    // A malformed id cannot match any row; report it exactly like a row the
    // caller does not own.
    Ulid::from_string(raw.trim())
        .map(SystemId)
        .map_err(|_| ApiError::not_found("System not found"))
}

fn parse_due_date(value: Option<String>) -> Result<Option<OffsetDateTime>, ApiError> {
    match optional_text(value) {
        Some(raw) => OffsetDateTime::parse(&raw, &Rfc3339)
            .map(Some)
            .map_err(|_| ApiError::validation("Due date must be an RFC 3339 timestamp")),
        None => Ok(None),
    }
}

fn position_index(position: usize) -> i64 {
    i64::try_from(position).unwrap_or(i64::MAX)
}
