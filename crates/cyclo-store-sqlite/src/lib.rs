//! SQLite persistence for the growth system.
//!
//! One database file holds every user's rows. Each user-facing table carries
//! an ownership column (`user_id` directly, or the parent id for child
//! tables) and every query is scoped by it; a row that belongs to another
//! user is indistinguishable from a row that does not exist.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use cyclo_core::{
    Activity, ActivityId, CycloEvolution, GrowthSystem, GrowthTask, KnowledgeItem,
    KnowledgeItemId, Reflection, ReflectionId, SystemId, TaskId, UserId,
};
use rand::RngCore;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

/// Latest schema version this build knows how to migrate to.
pub const LATEST_SCHEMA_VERSION: i64 = 2;

/// Prefix for issued API tokens. The part after the prefix is random.
pub const TOKEN_PREFIX: &str = "cyt_";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
";

// Version 1: the growth domain. Tag and insight tables reject empty strings
// at the schema level so a bad secondary write fails in the database rather
// than silently storing blanks.
const MIGRATION_001_SQL: &str = "
CREATE TABLE IF NOT EXISTS growth_systems (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL CHECK (title <> ''),
    description TEXT,
    domain TEXT NOT NULL CHECK (domain <> ''),
    current_phase TEXT NOT NULL,
    progress INTEGER NOT NULL CHECK (progress BETWEEN 0 AND 100),
    start_date TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_growth_systems_user
ON growth_systems(user_id, updated_at);

CREATE TABLE IF NOT EXISTS growth_tasks (
    id TEXT PRIMARY KEY,
    system_id TEXT NOT NULL,
    title TEXT NOT NULL CHECK (title <> ''),
    description TEXT,
    due_date TEXT,
    priority TEXT NOT NULL,
    status TEXT NOT NULL,
    cycle_phase TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (system_id) REFERENCES growth_systems(id)
);

CREATE INDEX IF NOT EXISTS idx_growth_tasks_system
ON growth_tasks(system_id, created_at);

CREATE TABLE IF NOT EXISTS task_tags (
    task_id TEXT NOT NULL,
    tag TEXT NOT NULL CHECK (tag <> ''),
    PRIMARY KEY (task_id, tag),
    FOREIGN KEY (task_id) REFERENCES growth_tasks(id)
);

CREATE TABLE IF NOT EXISTS knowledge_items (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL CHECK (title <> ''),
    content TEXT NOT NULL CHECK (content <> ''),
    source TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_knowledge_items_user
ON knowledge_items(user_id, created_at);

CREATE TABLE IF NOT EXISTS knowledge_tags (
    item_id TEXT NOT NULL,
    tag TEXT NOT NULL CHECK (tag <> ''),
    PRIMARY KEY (item_id, tag),
    FOREIGN KEY (item_id) REFERENCES knowledge_items(id)
);

CREATE TABLE IF NOT EXISTS knowledge_connections (
    from_item_id TEXT NOT NULL,
    to_item_id TEXT NOT NULL,
    PRIMARY KEY (from_item_id, to_item_id),
    FOREIGN KEY (from_item_id) REFERENCES knowledge_items(id),
    FOREIGN KEY (to_item_id) REFERENCES knowledge_items(id)
);

CREATE TABLE IF NOT EXISTS reflections (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    system_id TEXT,
    title TEXT NOT NULL CHECK (title <> ''),
    content TEXT NOT NULL CHECK (content <> ''),
    cycle_phase TEXT,
    domain TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (system_id) REFERENCES growth_systems(id)
);

CREATE INDEX IF NOT EXISTS idx_reflections_user
ON reflections(user_id, created_at);

CREATE TABLE IF NOT EXISTS reflection_insights (
    reflection_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    content TEXT NOT NULL CHECK (content <> ''),
    PRIMARY KEY (reflection_id, position),
    FOREIGN KEY (reflection_id) REFERENCES reflections(id)
);

CREATE TABLE IF NOT EXISTS reflection_tags (
    reflection_id TEXT NOT NULL,
    tag TEXT NOT NULL CHECK (tag <> ''),
    PRIMARY KEY (reflection_id, tag),
    FOREIGN KEY (reflection_id) REFERENCES reflections(id)
);

CREATE TABLE IF NOT EXISTS cyclo_evolution (
    user_id TEXT PRIMARY KEY,
    current_stage INTEGER NOT NULL CHECK (current_stage BETWEEN 1 AND 4),
    interactions_count INTEGER NOT NULL CHECK (interactions_count >= 1),
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activities (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    action TEXT NOT NULL CHECK (action <> ''),
    item TEXT NOT NULL,
    system_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_activities_user
ON activities(user_id, created_at);
";

// Version 2: API tokens. Only a SHA-256 digest of the token is stored, so a
// leaked database does not leak usable credentials.
const MIGRATION_002_SQL: &str = "
CREATE TABLE IF NOT EXISTS api_tokens (
    token_hash TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    label TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_api_tokens_user
ON api_tokens(user_id);
";

/// Ownership scope for every user-facing table, used by diagnostics.
/// Child tables are scoped through their parent id rather than `user_id`.
const OWNERSHIP_SCOPES: &[(&str, &str)] = &[
    ("growth_systems", "user_id"),
    ("growth_tasks", "system_id"),
    ("task_tags", "task_id"),
    ("knowledge_items", "user_id"),
    ("knowledge_tags", "item_id"),
    ("knowledge_connections", "from_item_id"),
    ("reflections", "user_id"),
    ("reflection_insights", "reflection_id"),
    ("reflection_tags", "reflection_id"),
    ("cyclo_evolution", "user_id"),
    ("activities", "user_id"),
    ("api_tokens", "user_id"),
];

/// Migration state of an opened database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    /// True when the version was inferred from table shape because the
    /// database predates migration tracking.
    pub inferred_from_legacy: bool,
}

impl SchemaStatus {
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.current_version == self.target_version && self.pending_versions.is_empty()
    }
}

/// One row of the per-table ownership probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableOwnership {
    pub table: String,
    pub scope_column: String,
    pub enforced: bool,
}

/// Result of an on-demand database integrity check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fk_index: i64,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the
    /// connection pragmas. Does not run migrations.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or a pragma fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to set journal_mode=WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("failed to set busy_timeout")?;
        Ok(Self { conn })
    }

    /// Reports the migration state without changing anything.
    ///
    /// # Errors
    /// Returns an error if schema introspection fails.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to ensure schema_migrations table")?;

        let recorded: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .context("failed to read recorded schema version")?;

        let (current_version, inferred_from_legacy) = if recorded > 0 {
            (recorded, false)
        } else {
            (self.detect_legacy_version()?, true)
        };

        let pending_versions = ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect();
        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy: inferred_from_legacy && current_version > 0,
        })
    }

    /// Brings the schema up to `LATEST_SCHEMA_VERSION`, recording each
    /// applied version. Safe to call on every open.
    ///
    /// # Errors
    /// Returns an error if a migration statement fails or the final version
    /// does not match the target.
    pub fn migrate(&mut self) -> Result<()> {
        let status = self.schema_status()?;

        // A database created before migration tracking gets its inferred
        // version recorded so later runs take the normal path.
        if status.inferred_from_legacy {
            for version in 1..=status.current_version {
                self.record_migration(version)?;
            }
        }

        for version in status.pending_versions {
            let tx = self
                .conn
                .transaction()
                .context("failed to start migration transaction")?;
            let sql = match version {
                1 => MIGRATION_001_SQL,
                2 => MIGRATION_002_SQL,
                other => return Err(anyhow!("unknown schema migration version {other}")),
            };
            tx.execute_batch(sql)
                .with_context(|| format!("failed to apply schema migration {version}"))?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, now_rfc3339()?],
            )
            .with_context(|| format!("failed to record schema migration {version}"))?;
            tx.commit()
                .with_context(|| format!("failed to commit schema migration {version}"))?;
        }

        let status = self.schema_status()?;
        if !status.is_up_to_date() {
            return Err(anyhow!(
                "schema migration finished at version {} but target is {}",
                status.current_version,
                status.target_version
            ));
        }
        Ok(())
    }

    fn detect_legacy_version(&self) -> Result<i64> {
        if !self.table_exists("growth_systems")? {
            return Ok(0);
        }
        if self.table_exists("api_tokens")? {
            return Ok(2);
        }
        Ok(1)
    }

    fn record_migration(&self, version: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, now_rfc3339()?],
            )
            .with_context(|| format!("failed to record schema migration {version}"))?;
        Ok(())
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to check existence of table {table}"))?;
        Ok(count > 0)
    }

    fn table_has_column(&self, table: &str, column: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .with_context(|| format!("failed to inspect columns of table {table}"))?;
        let mut rows = stmt
            .query([])
            .with_context(|| format!("failed to query columns of table {table}"))?;
        while let Some(row) = rows
            .next()
            .with_context(|| format!("failed to iterate columns of table {table}"))?
        {
            let name: String = row.get(1)?;
            if name == column {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // API tokens

    /// Mints a new opaque bearer token for `user_id` and stores its digest.
    /// The returned clear-text token is shown exactly once.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn issue_token(&mut self, user_id: UserId, label: &str) -> Result<String> {
        let mut material = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut material);
        let token = format!("{TOKEN_PREFIX}{}", hex::encode(material));
        self.conn
            .execute(
                "INSERT INTO api_tokens (token_hash, user_id, label, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![token_digest(&token), user_id.to_string(), label, now_rfc3339()?],
            )
            .context("failed to insert api token")?;
        Ok(token)
    }

    /// Looks up the user a presented token belongs to, or `None` when the
    /// token is unknown.
    ///
    /// # Errors
    /// Returns an error if the lookup fails or the stored user id is invalid.
    pub fn resolve_token(&self, token: &str) -> Result<Option<UserId>> {
        let raw = self
            .conn
            .query_row(
                "SELECT user_id FROM api_tokens WHERE token_hash = ?1",
                params![token_digest(token)],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to resolve api token")?;
        match raw {
            Some(raw) => Ok(Some(UserId(parse_ulid(&raw)?))),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Growth systems

    /// Inserts a validated growth system.
    ///
    /// # Errors
    /// Returns an error if validation or the insert fails.
    pub fn insert_growth_system(&mut self, system: &GrowthSystem) -> Result<()> {
        system
            .validate()
            .map_err(|err| anyhow!("growth system validation failed: {err}"))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO growth_systems
             (id, user_id, title, description, domain, current_phase, progress, start_date, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                system.id.to_string(),
                system.user_id.to_string(),
                system.title,
                system.description,
                system.domain,
                system.current_phase,
                i64::from(system.progress),
                rfc3339(system.start_date)?,
                rfc3339(system.updated_at)?,
            ],
        )
        .context("failed to insert growth system")?;
        tx.commit().context("failed to commit growth system insert")
    }

    /// Fetches one growth system scoped to its owner. A system owned by a
    /// different user comes back as `None`.
    ///
    /// # Errors
    /// Returns an error if the query or row decoding fails.
    pub fn get_growth_system(
        &self,
        user_id: UserId,
        system_id: SystemId,
    ) -> Result<Option<GrowthSystem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, title, description, domain, current_phase, progress,
                        start_date, updated_at
                 FROM growth_systems
                 WHERE id = ?1 AND user_id = ?2",
            )
            .context("failed to prepare growth system query")?;
        let system = stmt
            .query_row(
                params![system_id.to_string(), user_id.to_string()],
                row_to_growth_system,
            )
            .optional()
            .context("failed to fetch growth system")?;
        Ok(system)
    }

    /// Checks whether `system_id` exists and belongs to `user_id`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn system_owned(&self, user_id: UserId, system_id: SystemId) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM growth_systems WHERE id = ?1 AND user_id = ?2",
                params![system_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to check growth system ownership")?;
        Ok(count > 0)
    }

    /// Writes back a full growth system row, scoped to its owner.
    ///
    /// # Errors
    /// Returns an error if validation fails, the update fails, or no owned
    /// row matched.
    pub fn update_growth_system(&mut self, system: &GrowthSystem) -> Result<()> {
        system
            .validate()
            .map_err(|err| anyhow!("growth system validation failed: {err}"))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;
        let changed = tx
            .execute(
                "UPDATE growth_systems
                 SET title = ?3, description = ?4, domain = ?5, current_phase = ?6,
                     progress = ?7, updated_at = ?8
                 WHERE id = ?1 AND user_id = ?2",
                params![
                    system.id.to_string(),
                    system.user_id.to_string(),
                    system.title,
                    system.description,
                    system.domain,
                    system.current_phase,
                    i64::from(system.progress),
                    rfc3339(system.updated_at)?,
                ],
            )
            .context("failed to update growth system")?;
        if changed == 0 {
            return Err(anyhow!(
                "growth system {} not found for update",
                system.id
            ));
        }
        tx.commit().context("failed to commit growth system update")
    }

    /// Lists a user's growth systems, most recently updated first.
    ///
    /// # Errors
    /// Returns an error if the query or row decoding fails.
    pub fn list_growth_systems(&self, user_id: UserId) -> Result<Vec<GrowthSystem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, title, description, domain, current_phase, progress,
                        start_date, updated_at
                 FROM growth_systems
                 WHERE user_id = ?1
                 ORDER BY updated_at DESC, id ASC",
            )
            .context("failed to prepare growth system list query")?;
        let rows = stmt
            .query_map(params![user_id.to_string()], row_to_growth_system)
            .context("failed to list growth systems")?;
        let mut systems = Vec::new();
        for row in rows {
            systems.push(row.context("failed to decode growth system row")?);
        }
        Ok(systems)
    }

    // ------------------------------------------------------------------
    // Growth tasks

    /// Inserts a validated growth task row. Tags are written separately so
    /// a bad tag cannot take the task down with it.
    ///
    /// # Errors
    /// Returns an error if validation or the insert fails.
    pub fn insert_growth_task(&mut self, task: &GrowthTask) -> Result<()> {
        task.validate()
            .map_err(|err| anyhow!("growth task validation failed: {err}"))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO growth_tasks
             (id, system_id, title, description, due_date, priority, status, cycle_phase, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id.to_string(),
                task.system_id.to_string(),
                task.title,
                task.description,
                task.due_date.map(rfc3339).transpose()?,
                task.priority,
                task.status,
                task.cycle_phase,
                rfc3339(task.created_at)?,
            ],
        )
        .context("failed to insert growth task")?;
        tx.commit().context("failed to commit growth task insert")
    }

    /// Inserts one task tag. The schema rejects empty tags.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn insert_task_tag(&mut self, task_id: TaskId, tag: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO task_tags (task_id, tag) VALUES (?1, ?2)",
                params![task_id.to_string(), tag],
            )
            .context("failed to insert task tag")?;
        Ok(())
    }

    /// Lists the tasks of one growth system, newest first, with tags loaded.
    ///
    /// # Errors
    /// Returns an error if the query or row decoding fails.
    pub fn list_growth_tasks(&self, system_id: SystemId) -> Result<Vec<GrowthTask>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, system_id, title, description, due_date, priority, status,
                        cycle_phase, created_at
                 FROM growth_tasks
                 WHERE system_id = ?1
                 ORDER BY created_at DESC, id ASC",
            )
            .context("failed to prepare growth task list query")?;
        let rows = stmt
            .query_map(params![system_id.to_string()], row_to_growth_task)
            .context("failed to list growth tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            let mut task = row.context("failed to decode growth task row")?;
            task.tags = self.load_tags("task_tags", "task_id", &task.id.to_string())?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    // ------------------------------------------------------------------
    // Knowledge items

    /// Inserts a validated knowledge item row. Tags and connections are
    /// written separately.
    ///
    /// # Errors
    /// Returns an error if validation or the insert fails.
    pub fn insert_knowledge_item(&mut self, item: &KnowledgeItem) -> Result<()> {
        item.validate()
            .map_err(|err| anyhow!("knowledge item validation failed: {err}"))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO knowledge_items (id, user_id, title, content, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.id.to_string(),
                item.user_id.to_string(),
                item.title,
                item.content,
                item.source,
                rfc3339(item.created_at)?,
            ],
        )
        .context("failed to insert knowledge item")?;
        tx.commit().context("failed to commit knowledge item insert")
    }

    /// Inserts one knowledge tag. The schema rejects empty tags.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn insert_knowledge_tag(&mut self, item_id: KnowledgeItemId, tag: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO knowledge_tags (item_id, tag) VALUES (?1, ?2)",
                params![item_id.to_string(), tag],
            )
            .context("failed to insert knowledge tag")?;
        Ok(())
    }

    /// Links one knowledge item to another. The target must exist.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn insert_knowledge_connection(
        &mut self,
        from: KnowledgeItemId,
        to: KnowledgeItemId,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO knowledge_connections (from_item_id, to_item_id) VALUES (?1, ?2)",
                params![from.to_string(), to.to_string()],
            )
            .context("failed to insert knowledge connection")?;
        Ok(())
    }

    /// Lists a user's knowledge items, newest first, with tags and
    /// connections loaded.
    ///
    /// # Errors
    /// Returns an error if the query or row decoding fails.
    pub fn list_knowledge_items(&self, user_id: UserId) -> Result<Vec<KnowledgeItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, title, content, source, created_at
                 FROM knowledge_items
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, id ASC",
            )
            .context("failed to prepare knowledge item list query")?;
        let rows = stmt
            .query_map(params![user_id.to_string()], row_to_knowledge_item)
            .context("failed to list knowledge items")?;
        let mut items = Vec::new();
        for row in rows {
            let mut item = row.context("failed to decode knowledge item row")?;
            let key = item.id.to_string();
            item.tags = self.load_tags("knowledge_tags", "item_id", &key)?;
            item.connections = self.load_connections(&key)?;
            items.push(item);
        }
        Ok(items)
    }

    fn load_connections(&self, from_item_id: &str) -> Result<Vec<KnowledgeItemId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT to_item_id FROM knowledge_connections
                 WHERE from_item_id = ?1
                 ORDER BY to_item_id ASC",
            )
            .context("failed to prepare knowledge connection query")?;
        let rows = stmt
            .query_map(params![from_item_id], |row| row.get::<_, String>(0))
            .context("failed to load knowledge connections")?;
        let mut connections = Vec::new();
        for row in rows {
            let raw = row.context("failed to decode knowledge connection row")?;
            connections.push(KnowledgeItemId(parse_ulid(&raw)?));
        }
        Ok(connections)
    }

    // ------------------------------------------------------------------
    // Reflections

    /// Inserts a validated reflection row. Insights and tags are written
    /// separately.
    ///
    /// # Errors
    /// Returns an error if validation or the insert fails.
    pub fn insert_reflection(&mut self, reflection: &Reflection) -> Result<()> {
        reflection
            .validate()
            .map_err(|err| anyhow!("reflection validation failed: {err}"))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO reflections
             (id, user_id, system_id, title, content, cycle_phase, domain, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reflection.id.to_string(),
                reflection.user_id.to_string(),
                reflection.system_id.map(|id| id.to_string()),
                reflection.title,
                reflection.content,
                reflection.cycle_phase,
                reflection.domain,
                rfc3339(reflection.created_at)?,
            ],
        )
        .context("failed to insert reflection")?;
        tx.commit().context("failed to commit reflection insert")
    }

    /// Inserts one reflection insight at `position`. The schema rejects
    /// empty insight text.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn insert_reflection_insight(
        &mut self,
        reflection_id: ReflectionId,
        position: i64,
        content: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO reflection_insights (reflection_id, position, content)
                 VALUES (?1, ?2, ?3)",
                params![reflection_id.to_string(), position, content],
            )
            .context("failed to insert reflection insight")?;
        Ok(())
    }

    /// Inserts one reflection tag. The schema rejects empty tags.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn insert_reflection_tag(&mut self, reflection_id: ReflectionId, tag: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO reflection_tags (reflection_id, tag) VALUES (?1, ?2)",
                params![reflection_id.to_string(), tag],
            )
            .context("failed to insert reflection tag")?;
        Ok(())
    }

    /// Lists a user's reflections, newest first, with insights (in order)
    /// and tags loaded.
    ///
    /// # Errors
    /// Returns an error if the query or row decoding fails.
    pub fn list_reflections(&self, user_id: UserId) -> Result<Vec<Reflection>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, system_id, title, content, cycle_phase, domain, created_at
                 FROM reflections
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, id ASC",
            )
            .context("failed to prepare reflection list query")?;
        let rows = stmt
            .query_map(params![user_id.to_string()], row_to_reflection)
            .context("failed to list reflections")?;
        let mut reflections = Vec::new();
        for row in rows {
            let mut reflection = row.context("failed to decode reflection row")?;
            let key = reflection.id.to_string();
            reflection.insights = self.load_insights(&key)?;
            reflection.tags = self.load_tags("reflection_tags", "reflection_id", &key)?;
            reflections.push(reflection);
        }
        Ok(reflections)
    }

    fn load_insights(&self, reflection_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT content FROM reflection_insights
                 WHERE reflection_id = ?1
                 ORDER BY position ASC",
            )
            .context("failed to prepare reflection insight query")?;
        let rows = stmt
            .query_map(params![reflection_id], |row| row.get::<_, String>(0))
            .context("failed to load reflection insights")?;
        let mut insights = Vec::new();
        for row in rows {
            insights.push(row.context("failed to decode reflection insight row")?);
        }
        Ok(insights)
    }

    // ------------------------------------------------------------------
    // Cyclo evolution

    /// Fetches a user's assistant evolution row, or `None` before the first
    /// stage update.
    ///
    /// # Errors
    /// Returns an error if the query or row decoding fails.
    pub fn get_cyclo_evolution(&self, user_id: UserId) -> Result<Option<CycloEvolution>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT user_id, current_stage, interactions_count, updated_at
                 FROM cyclo_evolution
                 WHERE user_id = ?1",
            )
            .context("failed to prepare cyclo evolution query")?;
        let evolution = stmt
            .query_row(params![user_id.to_string()], row_to_cyclo_evolution)
            .optional()
            .context("failed to fetch cyclo evolution")?;
        Ok(evolution)
    }

    /// Records a stage update. The first update for a user inserts a row
    /// with an interaction count of one; every later update overwrites the
    /// stage and increments the count, even when the stage is unchanged.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn upsert_cyclo_stage(
        &mut self,
        user_id: UserId,
        stage: u8,
        now: OffsetDateTime,
    ) -> Result<CycloEvolution> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;
        let existing = tx
            .query_row(
                "SELECT interactions_count FROM cyclo_evolution WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to read cyclo evolution")?;
        let interactions_count = match existing {
            Some(count) => {
                tx.execute(
                    "UPDATE cyclo_evolution
                     SET current_stage = ?2, interactions_count = ?3, updated_at = ?4
                     WHERE user_id = ?1",
                    params![
                        user_id.to_string(),
                        i64::from(stage),
                        count + 1,
                        rfc3339(now)?
                    ],
                )
                .context("failed to update cyclo evolution")?;
                count + 1
            }
            None => {
                tx.execute(
                    "INSERT INTO cyclo_evolution (user_id, current_stage, interactions_count, updated_at)
                     VALUES (?1, ?2, 1, ?3)",
                    params![user_id.to_string(), i64::from(stage), rfc3339(now)?],
                )
                .context("failed to insert cyclo evolution")?;
                1
            }
        };
        tx.commit().context("failed to commit cyclo evolution write")?;
        Ok(CycloEvolution {
            user_id,
            current_stage: stage,
            interactions_count,
            updated_at: now,
        })
    }

    // ------------------------------------------------------------------
    // Activities

    /// Appends one activity feed entry.
    ///
    /// # Errors
    /// Returns an error if validation or the insert fails.
    pub fn insert_activity(&mut self, activity: &Activity) -> Result<()> {
        activity
            .validate()
            .map_err(|err| anyhow!("activity validation failed: {err}"))?;
        self.conn
            .execute(
                "INSERT INTO activities (id, user_id, action, item, system_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    activity.id.to_string(),
                    activity.user_id.to_string(),
                    activity.action,
                    activity.item,
                    activity.system_id.map(|id| id.to_string()),
                    rfc3339(activity.created_at)?,
                ],
            )
            .context("failed to insert activity")?;
        Ok(())
    }

    /// Lists a user's most recent activities, newest first.
    ///
    /// # Errors
    /// Returns an error if the query or row decoding fails.
    pub fn list_activities(&self, user_id: UserId, limit: u32) -> Result<Vec<Activity>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, action, item, system_id, created_at
                 FROM activities
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, id ASC
                 LIMIT ?2",
            )
            .context("failed to prepare activity list query")?;
        let rows = stmt
            .query_map(params![user_id.to_string(), limit], row_to_activity)
            .context("failed to list activities")?;
        let mut activities = Vec::new();
        for row in rows {
            activities.push(row.context("failed to decode activity row")?);
        }
        Ok(activities)
    }

    // ------------------------------------------------------------------
    // Diagnostics and maintenance

    /// Probes every user-facing table for its ownership scope column.
    ///
    /// # Errors
    /// Returns an error if schema introspection fails.
    pub fn ownership_status(&self) -> Result<Vec<TableOwnership>> {
        let mut report = Vec::with_capacity(OWNERSHIP_SCOPES.len());
        for (table, scope_column) in OWNERSHIP_SCOPES {
            let enforced =
                self.table_exists(table)? && self.table_has_column(table, scope_column)?;
            report.push(TableOwnership {
                table: (*table).to_string(),
                scope_column: (*scope_column).to_string(),
                enforced,
            });
        }
        Ok(report)
    }

    /// Runs `PRAGMA quick_check` and `PRAGMA foreign_key_check` and reports
    /// the results together with the schema status.
    ///
    /// # Errors
    /// Returns an error if a pragma cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run quick_check")?;
        let quick_check_ok = quick_check_message == "ok";

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare foreign_key_check")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .context("failed to run foreign_key_check")?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row.context("failed to decode foreign_key_check row")?);
        }

        Ok(IntegrityReport {
            quick_check_ok,
            quick_check_message,
            foreign_key_violations,
            schema_status: self.schema_status()?,
        })
    }

    /// Copies the live database to `destination` using the SQLite backup
    /// API, safe against concurrent writers.
    ///
    /// # Errors
    /// Returns an error if the backup fails.
    pub fn backup_database(&self, destination: &Path) -> Result<()> {
        self.conn
            .backup(DatabaseName::Main, destination, None)
            .with_context(|| format!("failed to back up database to {}", destination.display()))
    }

    /// Replaces the live database with the contents of `source`.
    ///
    /// # Errors
    /// Returns an error if the restore fails.
    pub fn restore_database(&mut self, source: &Path) -> Result<()> {
        self.conn
            .restore(
                DatabaseName::Main,
                source,
                None::<fn(rusqlite::backup::Progress)>,
            )
            .with_context(|| format!("failed to restore database from {}", source.display()))
    }

    fn load_tags(&self, table: &str, key_column: &str, key: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT tag FROM {table} WHERE {key_column} = ?1 ORDER BY tag ASC"
            ))
            .with_context(|| format!("failed to prepare tag query on {table}"))?;
        let rows = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .with_context(|| format!("failed to load tags from {table}"))?;
        let mut tags = Vec::new();
        for row in rows {
            tags.push(row.with_context(|| format!("failed to decode tag row from {table}"))?);
        }
        Ok(tags)
    }
}

fn row_to_growth_system(row: &rusqlite::Row<'_>) -> rusqlite::Result<GrowthSystem> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let start_date: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(GrowthSystem {
        id: SystemId(decode_ulid(0, &id)?),
        user_id: UserId(decode_ulid(1, &user_id)?),
        title: row.get(2)?,
        description: row.get(3)?,
        domain: row.get(4)?,
        current_phase: row.get(5)?,
        progress: row.get(6)?,
        start_date: decode_rfc3339(7, &start_date)?,
        updated_at: decode_rfc3339(8, &updated_at)?,
    })
}

fn row_to_growth_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<GrowthTask> {
    let id: String = row.get(0)?;
    let system_id: String = row.get(1)?;
    let due_date: Option<String> = row.get(4)?;
    let created_at: String = row.get(8)?;
    Ok(GrowthTask {
        id: TaskId(decode_ulid(0, &id)?),
        system_id: SystemId(decode_ulid(1, &system_id)?),
        title: row.get(2)?,
        description: row.get(3)?,
        due_date: match due_date {
            Some(raw) => Some(decode_rfc3339(4, &raw)?),
            None => None,
        },
        priority: row.get(5)?,
        status: row.get(6)?,
        cycle_phase: row.get(7)?,
        tags: Vec::new(),
        created_at: decode_rfc3339(8, &created_at)?,
    })
}

fn row_to_knowledge_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeItem> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let created_at: String = row.get(5)?;
    Ok(KnowledgeItem {
        id: KnowledgeItemId(decode_ulid(0, &id)?),
        user_id: UserId(decode_ulid(1, &user_id)?),
        title: row.get(2)?,
        content: row.get(3)?,
        source: row.get(4)?,
        tags: Vec::new(),
        connections: Vec::new(),
        created_at: decode_rfc3339(5, &created_at)?,
    })
}

fn row_to_reflection(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reflection> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let system_id: Option<String> = row.get(2)?;
    let created_at: String = row.get(7)?;
    Ok(Reflection {
        id: ReflectionId(decode_ulid(0, &id)?),
        user_id: UserId(decode_ulid(1, &user_id)?),
        system_id: match system_id {
            Some(raw) => Some(SystemId(decode_ulid(2, &raw)?)),
            None => None,
        },
        title: row.get(3)?,
        content: row.get(4)?,
        cycle_phase: row.get(5)?,
        domain: row.get(6)?,
        insights: Vec::new(),
        tags: Vec::new(),
        created_at: decode_rfc3339(7, &created_at)?,
    })
}

fn row_to_cyclo_evolution(row: &rusqlite::Row<'_>) -> rusqlite::Result<CycloEvolution> {
    let user_id: String = row.get(0)?;
    let updated_at: String = row.get(3)?;
    Ok(CycloEvolution {
        user_id: UserId(decode_ulid(0, &user_id)?),
        current_stage: row.get(1)?,
        interactions_count: row.get(2)?,
        updated_at: decode_rfc3339(3, &updated_at)?,
    })
}

fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let system_id: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(Activity {
        id: ActivityId(decode_ulid(0, &id)?),
        user_id: UserId(decode_ulid(1, &user_id)?),
        action: row.get(2)?,
        item: row.get(3)?,
        system_id: match system_id {
            Some(raw) => Some(SystemId(decode_ulid(4, &raw)?)),
            None => None,
        },
        created_at: decode_rfc3339(5, &created_at)?,
    })
}

// Decoding helpers that surface bad stored text as rusqlite column errors
// so they propagate through query_map like any other row failure.

fn decode_ulid(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn decode_rfc3339(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ulid in database: {raw}"))
}

fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&Rfc3339)
        .context("failed to format timestamp as RFC 3339")
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn open_store() -> SqliteStore {
        let mut store = SqliteStore::open(Path::new(":memory:"))
            .unwrap_or_else(|err| panic!("failed to open store: {err}"));
        store
            .migrate()
            .unwrap_or_else(|err| panic!("failed to migrate store: {err}"));
        store
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_system(user_id: UserId) -> GrowthSystem {
        GrowthSystem {
            id: SystemId::new(),
            user_id,
            title: "Morning routine".to_string(),
            description: Some("Wake, write, run".to_string()),
            domain: "health".to_string(),
            current_phase: cyclo_core::DEFAULT_PHASE.to_string(),
            progress: 0,
            start_date: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let mut store = open_store();
        store.migrate()?;
        let status = store.schema_status()?;
        assert!(status.is_up_to_date());
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn legacy_database_is_adopted_at_inferred_version() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))
            .unwrap_or_else(|err| panic!("failed to open store: {err}"));
        // Simulate a database created before migration tracking: domain
        // tables present, no recorded versions.
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.inferred_from_legacy);
        assert_eq!(status.pending_versions, vec![2]);

        store.migrate()?;
        let status = store.schema_status()?;
        assert!(status.is_up_to_date());
        assert!(!status.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn growth_system_round_trips_and_is_owner_scoped() -> Result<()> {
        let mut store = open_store();
        let owner = UserId::new();
        let stranger = UserId::new();
        let system = fixture_system(owner);
        store.insert_growth_system(&system)?;

        let fetched = store
            .get_growth_system(owner, system.id)?
            .unwrap_or_else(|| panic!("expected system for owner"));
        assert_eq!(fetched, system);

        assert!(store.get_growth_system(stranger, system.id)?.is_none());
        assert!(store.system_owned(owner, system.id)?);
        assert!(!store.system_owned(stranger, system.id)?);
        Ok(())
    }

    #[test]
    fn growth_system_lists_most_recently_updated_first() -> Result<()> {
        let mut store = open_store();
        let owner = UserId::new();
        let mut older = fixture_system(owner);
        older.title = "Older".to_string();
        let mut newer = fixture_system(owner);
        newer.title = "Newer".to_string();
        newer.updated_at = fixture_time() + Duration::hours(1);
        store.insert_growth_system(&older)?;
        store.insert_growth_system(&newer)?;

        let systems = store.list_growth_systems(owner)?;
        let titles: Vec<&str> = systems.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Newer", "Older"]);
        Ok(())
    }

    #[test]
    fn growth_system_update_rewrites_owned_row() -> Result<()> {
        let mut store = open_store();
        let owner = UserId::new();
        let mut system = fixture_system(owner);
        store.insert_growth_system(&system)?;

        system.title = "Evening routine".to_string();
        system.progress = 40;
        system.current_phase = "execution".to_string();
        system.updated_at = fixture_time() + Duration::minutes(5);
        store.update_growth_system(&system)?;

        let fetched = store
            .get_growth_system(owner, system.id)?
            .unwrap_or_else(|| panic!("expected updated system"));
        assert_eq!(fetched.title, "Evening routine");
        assert_eq!(fetched.progress, 40);
        assert_eq!(fetched.current_phase, "execution");
        Ok(())
    }

    #[test]
    fn growth_system_update_fails_for_foreign_row() {
        let mut store = open_store();
        let owner = UserId::new();
        let mut system = fixture_system(owner);
        store
            .insert_growth_system(&system)
            .unwrap_or_else(|err| panic!("insert failed: {err}"));

        system.user_id = UserId::new();
        let result = store.update_growth_system(&system);
        assert!(result.is_err());
    }

    #[test]
    fn progress_out_of_range_is_rejected_by_schema() {
        let store = open_store();
        let result = store.conn.execute(
            "INSERT INTO growth_systems
             (id, user_id, title, description, domain, current_phase, progress, start_date, updated_at)
             VALUES (?1, ?2, 'x', NULL, 'y', 'planning', 150, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            params![SystemId::new().to_string(), UserId::new().to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn task_tags_load_with_tasks_and_reject_empty_tags() -> Result<()> {
        let mut store = open_store();
        let owner = UserId::new();
        let system = fixture_system(owner);
        store.insert_growth_system(&system)?;

        let task = GrowthTask {
            id: TaskId::new(),
            system_id: system.id,
            title: "Draft outline".to_string(),
            description: None,
            due_date: Some(fixture_time() + Duration::days(7)),
            priority: "high".to_string(),
            status: cyclo_core::DEFAULT_TASK_STATUS.to_string(),
            cycle_phase: Some("planning".to_string()),
            tags: Vec::new(),
            created_at: fixture_time(),
        };
        store.insert_growth_task(&task)?;
        store.insert_task_tag(task.id, "writing")?;
        store.insert_task_tag(task.id, "deep-work")?;
        assert!(store.insert_task_tag(task.id, "").is_err());

        let tasks = store.list_growth_tasks(system.id)?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].tags, vec!["deep-work", "writing"]);
        assert_eq!(tasks[0].due_date, task.due_date);
        Ok(())
    }

    #[test]
    fn task_insert_requires_existing_system() {
        let mut store = open_store();
        let task = GrowthTask {
            id: TaskId::new(),
            system_id: SystemId::new(),
            title: "Orphan".to_string(),
            description: None,
            due_date: None,
            priority: "medium".to_string(),
            status: "pending".to_string(),
            cycle_phase: None,
            tags: Vec::new(),
            created_at: fixture_time(),
        };
        assert!(store.insert_growth_task(&task).is_err());
    }

    #[test]
    fn knowledge_items_round_trip_with_tags_and_connections() -> Result<()> {
        let mut store = open_store();
        let owner = UserId::new();
        let first = KnowledgeItem {
            id: KnowledgeItemId::new(),
            user_id: owner,
            title: "Spaced repetition".to_string(),
            content: "Review at increasing intervals".to_string(),
            source: Some("book".to_string()),
            tags: Vec::new(),
            connections: Vec::new(),
            created_at: fixture_time(),
        };
        let second = KnowledgeItem {
            id: KnowledgeItemId::new(),
            user_id: owner,
            title: "Active recall".to_string(),
            content: "Test instead of reread".to_string(),
            source: None,
            tags: Vec::new(),
            connections: Vec::new(),
            created_at: fixture_time() + Duration::minutes(1),
        };
        store.insert_knowledge_item(&first)?;
        store.insert_knowledge_item(&second)?;
        store.insert_knowledge_tag(second.id, "memory")?;
        store.insert_knowledge_connection(second.id, first.id)?;

        let items = store.list_knowledge_items(owner)?;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Active recall");
        assert_eq!(items[0].tags, vec!["memory"]);
        assert_eq!(items[0].connections, vec![first.id]);
        assert!(items[1].connections.is_empty());
        Ok(())
    }

    #[test]
    fn knowledge_connection_requires_existing_target() -> Result<()> {
        let mut store = open_store();
        let item = KnowledgeItem {
            id: KnowledgeItemId::new(),
            user_id: UserId::new(),
            title: "Lone note".to_string(),
            content: "No links yet".to_string(),
            source: None,
            tags: Vec::new(),
            connections: Vec::new(),
            created_at: fixture_time(),
        };
        store.insert_knowledge_item(&item)?;
        assert!(store
            .insert_knowledge_connection(item.id, KnowledgeItemId::new())
            .is_err());
        Ok(())
    }

    #[test]
    fn reflections_keep_insight_order() -> Result<()> {
        let mut store = open_store();
        let owner = UserId::new();
        let reflection = Reflection {
            id: ReflectionId::new(),
            user_id: owner,
            system_id: None,
            title: "Week one".to_string(),
            content: "Slow start, strong finish".to_string(),
            cycle_phase: Some("review".to_string()),
            domain: Some("health".to_string()),
            insights: Vec::new(),
            tags: Vec::new(),
            created_at: fixture_time(),
        };
        store.insert_reflection(&reflection)?;
        store.insert_reflection_insight(reflection.id, 0, "Start earlier")?;
        store.insert_reflection_insight(reflection.id, 1, "Batch errands")?;
        store.insert_reflection_tag(reflection.id, "weekly")?;
        assert!(store.insert_reflection_insight(reflection.id, 2, "").is_err());

        let reflections = store.list_reflections(owner)?;
        assert_eq!(reflections.len(), 1);
        assert_eq!(
            reflections[0].insights,
            vec!["Start earlier", "Batch errands"]
        );
        assert_eq!(reflections[0].tags, vec!["weekly"]);
        Ok(())
    }

    #[test]
    fn cyclo_stage_upsert_starts_at_one_then_increments() -> Result<()> {
        let mut store = open_store();
        let user = UserId::new();
        assert!(store.get_cyclo_evolution(user)?.is_none());

        let first = store.upsert_cyclo_stage(user, 2, fixture_time())?;
        assert_eq!(first.current_stage, 2);
        assert_eq!(first.interactions_count, 1);

        let second = store.upsert_cyclo_stage(user, 2, fixture_time() + Duration::minutes(1))?;
        assert_eq!(second.current_stage, 2);
        assert_eq!(second.interactions_count, 2);

        let third = store.upsert_cyclo_stage(user, 4, fixture_time() + Duration::minutes(2))?;
        assert_eq!(third.current_stage, 4);
        assert_eq!(third.interactions_count, 3);

        let fetched = store
            .get_cyclo_evolution(user)?
            .unwrap_or_else(|| panic!("expected evolution row"));
        assert_eq!(fetched, third);
        Ok(())
    }

    #[test]
    fn stage_out_of_range_is_rejected_by_schema() {
        let store = open_store();
        let result = store.conn.execute(
            "INSERT INTO cyclo_evolution (user_id, current_stage, interactions_count, updated_at)
             VALUES (?1, 5, 1, '2024-01-01T00:00:00Z')",
            params![UserId::new().to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn activities_list_newest_first_with_limit() -> Result<()> {
        let mut store = open_store();
        let owner = UserId::new();
        for offset in 0..3_i64 {
            let activity = Activity {
                id: ActivityId::new(),
                user_id: owner,
                action: "Created new system".to_string(),
                item: format!("System {offset}"),
                system_id: None,
                created_at: fixture_time() + Duration::minutes(offset),
            };
            store.insert_activity(&activity)?;
        }

        let recent = store.list_activities(owner, 2)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].item, "System 2");
        assert_eq!(recent[1].item, "System 1");

        let other = store.list_activities(UserId::new(), 10)?;
        assert!(other.is_empty());
        Ok(())
    }

    #[test]
    fn tokens_resolve_to_their_user_and_store_only_digests() -> Result<()> {
        let mut store = open_store();
        let user = UserId::new();
        let token = store.issue_token(user, "integration tests")?;
        assert!(token.starts_with(TOKEN_PREFIX));

        let resolved = store.resolve_token(&token)?;
        assert_eq!(resolved, Some(user));
        assert!(store.resolve_token("cyt_not_a_real_token")?.is_none());

        let stored: String = store.conn.query_row(
            "SELECT token_hash FROM api_tokens WHERE user_id = ?1",
            params![user.to_string()],
            |row| row.get(0),
        )?;
        assert_ne!(stored, token);
        assert_eq!(stored, token_digest(&token));
        Ok(())
    }

    #[test]
    fn ownership_status_covers_every_table() -> Result<()> {
        let store = open_store();
        let report = store.ownership_status()?;
        assert_eq!(report.len(), OWNERSHIP_SCOPES.len());
        assert!(report.iter().all(|entry| entry.enforced));
        Ok(())
    }

    #[test]
    fn integrity_check_is_clean_on_fresh_database() -> Result<()> {
        let store = open_store();
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.schema_status.is_up_to_date());
        Ok(())
    }
}
