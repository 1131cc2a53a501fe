use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_cyclo<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_cyclo"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute cyclo binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_cyclo(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "cyclo command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn db_commands_cover_schema_migrate_backup_restore_and_integrity() {
    let sandbox = unique_temp_dir("cyclo-cli-db");
    let db_a = sandbox.join("a.sqlite3");
    let db_b = sandbox.join("b.sqlite3");
    let backup_file = sandbox.join("backup.sqlite3");

    let schema_before = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);
    assert_eq!(as_str(&schema_before, "contract_version"), "cli.v1");

    let dry_run = run_json(["--db", path_str(&db_a), "db", "migrate", "--dry-run"]);
    assert_eq!(as_i64(&dry_run, "current_version"), 0);
    assert_eq!(as_array(&dry_run, "would_apply_versions").len(), 2);

    let schema_after_dry_run = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_after_dry_run, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db_a), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);

    let issued = run_json(["--db", path_str(&db_a), "token", "issue", "--label", "db test"]);
    let user = as_str(&issued, "user_id").to_string();
    let _system = run_json([
        "--db",
        path_str(&db_a),
        "system",
        "create",
        "--user",
        &user,
        "--title",
        "Learn Piano",
        "--domain",
        "skill",
    ]);

    let integrity = run_json(["--db", path_str(&db_a), "db", "integrity-check"]);
    assert!(integrity.get("quick_check_ok").and_then(Value::as_bool).unwrap_or(false));
    assert_eq!(as_array(&integrity, "foreign_key_violations").len(), 0);

    let backup =
        run_json(["--db", path_str(&db_a), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(Path::new(as_str(&backup, "backup_path")).exists());

    let restore =
        run_json(["--db", path_str(&db_b), "db", "restore", "--in", path_str(&backup_file)]);
    assert_eq!(as_i64(&restore, "current_version"), 2);

    let listed = run_json(["--db", path_str(&db_b), "system", "list", "--user", &user]);
    let systems = as_array(&listed, "systems");
    assert_eq!(systems.len(), 1);
    assert_eq!(as_str(&systems[0], "title"), "Learn Piano");

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn growth_flow_covers_tokens_systems_tasks_stage_and_activities() {
    let sandbox = unique_temp_dir("cyclo-cli-growth");
    let db = sandbox.join("cyclo.sqlite3");

    let issued = run_json(["--db", path_str(&db), "token", "issue"]);
    let user = as_str(&issued, "user_id").to_string();
    let token = as_str(&issued, "token").to_string();
    assert!(token.starts_with("cyt_"), "unexpected token shape: {token}");

    let resolved = run_json(["--db", path_str(&db), "token", "resolve", "--token", &token]);
    assert_eq!(as_str(&resolved, "user_id"), user);

    let system = run_json([
        "--db",
        path_str(&db),
        "system",
        "create",
        "--user",
        &user,
        "--title",
        "Learn Piano",
        "--domain",
        "skill",
    ]);
    assert_eq!(as_str(&system, "current_phase"), "planning");
    assert_eq!(as_i64(&system, "progress"), 0);
    let system_id = as_str(&system, "id").to_string();

    let task = run_json([
        "--db",
        path_str(&db),
        "task",
        "create",
        "--user",
        &user,
        "--system-id",
        &system_id,
        "--title",
        "Practice scales",
        "--tag",
        "daily",
        "--tag",
        "focus",
    ]);
    assert_eq!(as_str(&task, "priority"), "medium");
    assert_eq!(as_str(&task, "status"), "pending");
    let tags: Vec<&str> = as_array(&task, "tags").iter().filter_map(Value::as_str).collect();
    assert_eq!(tags, vec!["daily", "focus"]);

    let tasks =
        run_json(["--db", path_str(&db), "task", "list", "--user", &user, "--system-id", &system_id]);
    assert_eq!(as_array(&tasks, "tasks").len(), 1);

    let first = run_json(["--db", path_str(&db), "stage", "set", "--user", &user, "--stage", "2"]);
    assert_eq!(as_i64(&first, "current_stage"), 2);
    assert_eq!(as_i64(&first, "interactions_count"), 1);

    let second = run_json(["--db", path_str(&db), "stage", "set", "--user", &user, "--stage", "3"]);
    assert_eq!(as_i64(&second, "current_stage"), 3);
    assert_eq!(as_i64(&second, "interactions_count"), 2);

    let current = run_json(["--db", path_str(&db), "stage", "get", "--user", &user]);
    assert_eq!(as_i64(&current, "current_stage"), 3);

    let feed = run_json(["--db", path_str(&db), "activity", "list", "--user", &user]);
    let actions: Vec<&str> = as_array(&feed, "activities")
        .iter()
        .filter_map(|activity| activity.get("action").and_then(Value::as_str))
        .collect();
    assert!(actions.contains(&"Created new system"), "actions: {actions:?}");
    assert!(actions.contains(&"Added new task"), "actions: {actions:?}");
    assert!(actions.contains(&"Cyclo evolved"), "actions: {actions:?}");

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn knowledge_and_reflection_flows_attach_children() {
    let sandbox = unique_temp_dir("cyclo-cli-knowledge");
    let db = sandbox.join("cyclo.sqlite3");

    let issued = run_json(["--db", path_str(&db), "token", "issue"]);
    let user = as_str(&issued, "user_id").to_string();

    let first = run_json([
        "--db",
        path_str(&db),
        "knowledge",
        "add",
        "--user",
        &user,
        "--title",
        "Spaced repetition",
        "--content",
        "Review at increasing intervals",
    ]);
    let first_id = as_str(&first, "id").to_string();

    let second = run_json([
        "--db",
        path_str(&db),
        "knowledge",
        "add",
        "--user",
        &user,
        "--title",
        "Active recall",
        "--content",
        "Test instead of reread",
        "--tag",
        "memory",
        "--connect",
        &first_id,
    ]);
    let connections: Vec<&str> =
        as_array(&second, "connections").iter().filter_map(Value::as_str).collect();
    assert_eq!(connections, vec![first_id.as_str()]);

    let items = run_json(["--db", path_str(&db), "knowledge", "list", "--user", &user]);
    assert_eq!(as_array(&items, "items").len(), 2);

    let system = run_json([
        "--db",
        path_str(&db),
        "system",
        "create",
        "--user",
        &user,
        "--title",
        "Learn Piano",
        "--domain",
        "skill",
    ]);
    let system_id = as_str(&system, "id").to_string();

    let reflection = run_json([
        "--db",
        path_str(&db),
        "reflection",
        "add",
        "--user",
        &user,
        "--system-id",
        &system_id,
        "--title",
        "Week one",
        "--content",
        "Slow start, strong finish",
        "--insight",
        "Start earlier",
        "--insight",
        "Batch errands",
        "--tag",
        "weekly",
    ]);
    let insights: Vec<&str> =
        as_array(&reflection, "insights").iter().filter_map(Value::as_str).collect();
    assert_eq!(insights, vec!["Start earlier", "Batch errands"]);

    let reflections = run_json(["--db", path_str(&db), "reflection", "list", "--user", &user]);
    let listed = as_array(&reflections, "reflections");
    assert_eq!(listed.len(), 1);
    assert_eq!(as_str(&listed[0], "system_id"), system_id);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn invalid_inputs_fail_with_nonzero_status() {
    let sandbox = unique_temp_dir("cyclo-cli-invalid");
    let db = sandbox.join("cyclo.sqlite3");

    let bad_user = run_cyclo([
        "--db",
        path_str(&db),
        "system",
        "create",
        "--user",
        "not-a-ulid",
        "--title",
        "Learn Piano",
        "--domain",
        "skill",
    ]);
    assert!(!bad_user.status.success());
    let stderr = String::from_utf8_lossy(&bad_user.stderr);
    assert!(stderr.contains("invalid ULID"), "unexpected stderr: {stderr}");

    let issued = run_json(["--db", path_str(&db), "token", "issue"]);
    let user = as_str(&issued, "user_id").to_string();

    let bad_stage =
        run_cyclo(["--db", path_str(&db), "stage", "set", "--user", &user, "--stage", "9"]);
    assert!(!bad_stage.status.success());
    let stderr = String::from_utf8_lossy(&bad_stage.stderr);
    assert!(stderr.contains("Valid stage (1-4) is required"), "unexpected stderr: {stderr}");

    let foreign_parent = run_cyclo([
        "--db",
        path_str(&db),
        "task",
        "create",
        "--user",
        &user,
        "--system-id",
        "01HZZZZZZZZZZZZZZZZZZZZZZZ",
        "--title",
        "Practice scales",
    ]);
    assert!(!foreign_parent.status.success());
    let stderr = String::from_utf8_lossy(&foreign_parent.stderr);
    assert!(stderr.contains("System not found"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&sandbox);
}
