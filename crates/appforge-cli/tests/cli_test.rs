//! Integration tests for the `appforge` binary.
//!
//! The `create` test runs the bundled sample request against the starter
//! templates and resources in the repository root, using a fresh database
//! from `appforge-test-utils`.

use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use uuid::Uuid;

use appforge_db::models::CreationStatus;
use appforge_db::queries::{apps, creation_tasks};
use appforge_test_utils::{create_test_db, drop_test_db, pg_url};

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// A command for the built binary with config lookups confined to `home`.
fn appforge(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_appforge"));
    cmd.env("XDG_CONFIG_HOME", home)
        .env("RUST_LOG", "warn")
        .env_remove("APPFORGE_DATABASE_URL")
        .env_remove("APPFORGE_USER_PATH")
        .env_remove("APPFORGE_TEMPLATE_ROOT")
        .env_remove("APPFORGE_RESOURCE_ROOT");
    cmd
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout:\n{}\nstderr:\n{}",
        stdout(output),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[tokio::test]
async fn init_writes_config_and_refuses_to_overwrite() {
    let home = tempfile::TempDir::new().unwrap();

    let output = appforge(home.path())
        .args(["--user-path", "/srv/apps", "init", "--db-url", "postgresql://h:5432/x"])
        .output()
        .await
        .unwrap();
    assert_success(&output);

    let written = std::fs::read_to_string(home.path().join("appforge/config.toml")).unwrap();
    assert!(written.contains("postgresql://h:5432/x"));
    assert!(written.contains("/srv/apps"));
    assert!(written.contains("statement_timeout_secs"));

    let again = appforge(home.path())
        .arg("init")
        .output()
        .await
        .unwrap();
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("--force"));

    let forced = appforge(home.path())
        .args(["init", "--force"])
        .output()
        .await
        .unwrap();
    assert_success(&forced);
}

#[tokio::test]
async fn create_runs_the_sample_request_end_to_end() {
    let (pool, db_name) = create_test_db().await;
    let home = tempfile::TempDir::new().unwrap();
    let apps_root = home.path().join("apps");
    let db_url = format!("{}/{db_name}", pg_url().await);
    let root = repo_root();

    let output = appforge(home.path())
        .arg("--database-url")
        .arg(&db_url)
        .arg("--user-path")
        .arg(&apps_root)
        .arg("--template-root")
        .arg(root.join("templates"))
        .arg("--resource-root")
        .arg(root.join("resources"))
        .arg("create")
        .arg(root.join("demos/request.json"))
        .output()
        .await
        .unwrap();
    assert_success(&output);

    let out = stdout(&output);
    assert!(out.contains("task_committed"), "live log missing:\n{out}");
    assert!(out.contains("Created app for u1001/novel123"));

    let task_id: Uuid = out
        .lines()
        .find_map(|l| l.strip_prefix("Task: "))
        .and_then(|rest| rest.split_whitespace().next())
        .expect("task id line")
        .parse()
        .unwrap();

    let task = creation_tasks::get_creation_task(&pool, task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, CreationStatus::Committed);
    let app_id = task.app_id.expect("app id recorded");
    // app + ui + 2 pay types + 4 ad slots + common
    assert_eq!(apps::count_app_rows(&pool, app_id).await.unwrap(), 9);

    let target = apps_root.join("u1001/novel123");
    let app_js = std::fs::read_to_string(target.join("app.js")).unwrap();
    assert!(app_js.contains(&app_id.to_string()));
    assert!(!app_js.contains("{{APP_KEY}}"));
    let index = std::fs::read_to_string(target.join("pages/index/index.wxml")).unwrap();
    assert!(index.contains("{{ shelfTitle }}"), "page bindings are left alone");
    assert!(target.join("static/logo.svg").is_file());
    assert!(target.join("static/icons/shelf.svg").is_file());
    assert!(target.join("project.config.json").is_file());
    let app_config = std::fs::read_to_string(target.join("app-config.json")).unwrap();
    assert!(!app_config.contains("replace-with-upload-key"));

    // status and log read back what create recorded.
    let status = appforge(home.path())
        .arg("--database-url")
        .arg(&db_url)
        .args(["status", &task_id.to_string()])
        .output()
        .await
        .unwrap();
    assert_success(&status);
    assert!(stdout(&status).contains("Status: committed"));

    let log = appforge(home.path())
        .arg("--database-url")
        .arg(&db_url)
        .args(["log", &task_id.to_string(), "--after", "1"])
        .output()
        .await
        .unwrap();
    assert_success(&log);
    let log_out = stdout(&log);
    assert!(!log_out.contains("#1 "));
    assert!(log_out.contains("phase_succeeded"));

    // A second run for the same target is a duplicate and rolls back.
    let dup = appforge(home.path())
        .arg("--database-url")
        .arg(&db_url)
        .arg("--user-path")
        .arg(&apps_root)
        .arg("--template-root")
        .arg(root.join("templates"))
        .arg("create")
        .arg(root.join("demos/request.json"))
        .output()
        .await
        .unwrap();
    assert!(!dup.status.success());
    assert!(String::from_utf8_lossy(&dup.stderr).contains("rolled back"));
    assert!(target.join("app.js").is_file(), "the committed app is untouched");

    pool.close().await;
    drop_test_db(&db_name).await;
}
