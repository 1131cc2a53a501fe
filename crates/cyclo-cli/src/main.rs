use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use cyclo_api::{
    CreateGrowthSystemRequest, CreateGrowthTaskRequest, CreateKnowledgeItemRequest,
    CreateReflectionRequest, CycloApi, ListActivitiesRequest, ListGrowthTasksRequest,
    UpdateCycloStageRequest, UpdateGrowthSystemRequest,
};
use cyclo_core::UserId;
use serde_json::Value;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "cyclo")]
#[command(about = "Cyclo growth tracker CLI")]
struct Cli {
    #[arg(long, default_value = "./cyclo.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Token {
        #[command(subcommand)]
        command: Box<TokenCommand>,
    },
    System {
        #[command(subcommand)]
        command: Box<SystemCommand>,
    },
    Task {
        #[command(subcommand)]
        command: Box<TaskCommand>,
    },
    Knowledge {
        #[command(subcommand)]
        command: Box<KnowledgeCommand>,
    },
    Reflection {
        #[command(subcommand)]
        command: Box<ReflectionCommand>,
    },
    Stage {
        #[command(subcommand)]
        command: Box<StageCommand>,
    },
    Activity {
        #[command(subcommand)]
        command: Box<ActivityCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    Issue(TokenIssueArgs),
    Resolve(TokenResolveArgs),
}

#[derive(Debug, Args)]
struct TokenIssueArgs {
    /// Existing user id (ULID); omit to mint a fresh user.
    #[arg(long)]
    user: Option<String>,
    #[arg(long, default_value = "cli")]
    label: String,
}

#[derive(Debug, Args)]
struct TokenResolveArgs {
    #[arg(long)]
    token: String,
}

#[derive(Debug, Subcommand)]
enum SystemCommand {
    Create(SystemCreateArgs),
    Update(SystemUpdateArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
struct SystemCreateArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    domain: String,
    #[arg(long)]
    phase: Option<String>,
    #[arg(long)]
    progress: Option<i64>,
}

#[derive(Debug, Args)]
struct SystemUpdateArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    phase: Option<String>,
    #[arg(long)]
    progress: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    Create(TaskCreateArgs),
    List(TaskListArgs),
}

#[derive(Debug, Args)]
struct TaskCreateArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    system_id: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    due_date: Option<String>,
    #[arg(long)]
    priority: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    cycle_phase: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Debug, Args)]
struct TaskListArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    system_id: String,
}

#[derive(Debug, Subcommand)]
enum KnowledgeCommand {
    Add(KnowledgeAddArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
struct KnowledgeAddArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    content: String,
    #[arg(long)]
    source: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long = "connect")]
    connections: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ReflectionCommand {
    Add(ReflectionAddArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
struct ReflectionAddArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    system_id: Option<String>,
    #[arg(long)]
    title: String,
    #[arg(long)]
    content: String,
    #[arg(long)]
    cycle_phase: Option<String>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long = "insight")]
    insights: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum StageCommand {
    Get(UserArgs),
    Set(StageSetArgs),
}

#[derive(Debug, Args)]
struct StageSetArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    stage: i64,
}

#[derive(Debug, Subcommand)]
enum ActivityCommand {
    List(ActivityListArgs),
}

#[derive(Debug, Args)]
struct ActivityListArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    limit: Option<i64>,
}

#[derive(Debug, Args)]
struct UserArgs {
    #[arg(long)]
    user: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = CycloApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Token { command } => run_token(*command, &api),
        Command::System { command } => run_system(*command, &api),
        Command::Task { command } => run_task(*command, &api),
        Command::Knowledge { command } => run_knowledge(*command, &api),
        Command::Reflection { command } => run_reflection(*command, &api),
        Command::Stage { command } => run_stage(*command, &api),
        Command::Activity { command } => run_activity(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &CycloApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.is_up_to_date(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let before = api.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions,
                    "inferred_from_legacy": before.inferred_from_legacy
                }));
            }

            let after = api.migrate()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.is_up_to_date()
            }))
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_token(command: TokenCommand, api: &CycloApi) -> Result<()> {
    match command {
        TokenCommand::Issue(args) => {
            let user_id = match args.user.as_deref() {
                Some(raw) => parse_user_id(raw)?,
                None => UserId::new(),
            };
            let token = api.issue_token(user_id, &args.label)?;
            emit_json(serde_json::json!({
                "user_id": user_id.to_string(),
                "label": args.label,
                "token": token
            }))
        }
        TokenCommand::Resolve(args) => {
            let Some(user_id) = api.resolve_token(&args.token)? else {
                return Err(anyhow!("token does not resolve to a user"));
            };
            emit_json(serde_json::json!({ "user_id": user_id.to_string() }))
        }
    }
}

fn run_system(command: SystemCommand, api: &CycloApi) -> Result<()> {
    match command {
        SystemCommand::Create(args) => {
            let user_id = parse_user_id(&args.user)?;
            let system = api.create_growth_system(
                user_id,
                CreateGrowthSystemRequest {
                    title: Some(args.title),
                    description: args.description,
                    domain: Some(args.domain),
                    current_phase: args.phase,
                    progress: args.progress,
                },
            )?;
            emit_json(serde_json::to_value(&system).context("failed to serialize growth system")?)
        }
        SystemCommand::Update(args) => {
            let user_id = parse_user_id(&args.user)?;
            let system = api.update_growth_system(
                user_id,
                UpdateGrowthSystemRequest {
                    system_id: Some(args.id),
                    title: args.title,
                    description: args.description,
                    domain: args.domain,
                    current_phase: args.phase,
                    progress: args.progress,
                },
            )?;
            emit_json(serde_json::to_value(&system).context("failed to serialize growth system")?)
        }
        SystemCommand::List(args) => {
            let user_id = parse_user_id(&args.user)?;
            let systems = api.list_growth_systems(user_id)?;
            emit_json(serde_json::json!({ "systems": systems }))
        }
    }
}

fn run_task(command: TaskCommand, api: &CycloApi) -> Result<()> {
    match command {
        TaskCommand::Create(args) => {
            let user_id = parse_user_id(&args.user)?;
            let task = api.create_growth_task(
                user_id,
                CreateGrowthTaskRequest {
                    system_id: Some(args.system_id),
                    title: Some(args.title),
                    description: args.description,
                    due_date: args.due_date,
                    priority: args.priority,
                    status: args.status,
                    cycle_phase: args.cycle_phase,
                    tags: args.tags,
                },
            )?;
            emit_json(serde_json::to_value(&task).context("failed to serialize growth task")?)
        }
        TaskCommand::List(args) => {
            let user_id = parse_user_id(&args.user)?;
            let tasks = api.list_growth_tasks(
                user_id,
                ListGrowthTasksRequest { system_id: Some(args.system_id) },
            )?;
            emit_json(serde_json::json!({ "tasks": tasks }))
        }
    }
}

fn run_knowledge(command: KnowledgeCommand, api: &CycloApi) -> Result<()> {
    match command {
        KnowledgeCommand::Add(args) => {
            let user_id = parse_user_id(&args.user)?;
            let item = api.create_knowledge_item(
                user_id,
                CreateKnowledgeItemRequest {
                    title: Some(args.title),
                    content: Some(args.content),
                    source: args.source,
                    tags: args.tags,
                    connections: args.connections,
                },
            )?;
            emit_json(serde_json::to_value(&item).context("failed to serialize knowledge item")?)
        }
        KnowledgeCommand::List(args) => {
            let user_id = parse_user_id(&args.user)?;
            let items = api.list_knowledge_items(user_id)?;
            emit_json(serde_json::json!({ "items": items }))
        }
    }
}

fn run_reflection(command: ReflectionCommand, api: &CycloApi) -> Result<()> {
    match command {
        ReflectionCommand::Add(args) => {
            let user_id = parse_user_id(&args.user)?;
            let reflection = api.create_reflection(
                user_id,
                CreateReflectionRequest {
                    system_id: args.system_id,
                    title: Some(args.title),
                    content: Some(args.content),
                    cycle_phase: args.cycle_phase,
                    domain: args.domain,
                    insights: args.insights,
                    tags: args.tags,
                },
            )?;
            emit_json(serde_json::to_value(&reflection).context("failed to serialize reflection")?)
        }
        ReflectionCommand::List(args) => {
            let user_id = parse_user_id(&args.user)?;
            let reflections = api.list_reflections(user_id)?;
            emit_json(serde_json::json!({ "reflections": reflections }))
        }
    }
}

fn run_stage(command: StageCommand, api: &CycloApi) -> Result<()> {
    match command {
        StageCommand::Get(args) => {
            let user_id = parse_user_id(&args.user)?;
            let evolution = api.get_cyclo_evolution(user_id)?;
            emit_json(
                serde_json::to_value(&evolution).context("failed to serialize evolution row")?,
            )
        }
        StageCommand::Set(args) => {
            let user_id = parse_user_id(&args.user)?;
            let evolution =
                api.update_cyclo_stage(user_id, UpdateCycloStageRequest { stage: Some(args.stage) })?;
            emit_json(
                serde_json::to_value(&evolution).context("failed to serialize evolution row")?,
            )
        }
    }
}

fn run_activity(command: ActivityCommand, api: &CycloApi) -> Result<()> {
    match command {
        ActivityCommand::List(args) => {
            let user_id = parse_user_id(&args.user)?;
            let activities =
                api.list_activities(user_id, ListActivitiesRequest { limit: args.limit })?;
            emit_json(serde_json::json!({ "activities": activities }))
        }
    }
}

fn parse_user_id(value: &str) -> Result<UserId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(UserId(parsed))
}
