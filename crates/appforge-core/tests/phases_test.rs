//! Phase-level tests: each phase driven directly, outside the orchestrator.

use std::time::Duration;

use uuid::Uuid;

use appforge_db::models::AdSlot;
use appforge_db::queries::apps;
use appforge_test_utils::{create_test_db, drop_test_db};

use appforge_core::{CreateNovelAppRequest, PhaseError};
use appforge_core::phases::{DatabasePhase, FileLayout, LocalFilePhase, ResourceFilePhase};
use appforge_core::progress::TaskLog;
use appforge_core::saga::{Artifacts, Compensation, DeleteAppRecords, Phase, PhaseContext};

fn request() -> CreateNovelAppRequest {
    serde_json::from_value(serde_json::json!({
        "userId": "u1001",
        "baseConfig": {
            "appName": "my:novel?",
            "appCode": "NOVEL",
            "platform": "baidu",
            "version": "2.1.0",
            "product": "novel",
            "customer": "acme",
            "appid": "bd-991"
        },
        "adConfig": {
            "banner": { "enabled": true, "adId": "banner-1" }
        },
        "commonConfig": { "buildCode": "b-7", "loginTypes": ["phone", "baidu"] },
        "uiConfig": {
            "payCardStyle": "card-b",
            "homeCardStyle": "list",
            "mainTheme": "#00AAFF",
            "secondTheme": "#FFFFFF"
        }
    }))
    .expect("request fixture should deserialize")
}

#[tokio::test]
async fn database_phase_writes_aggregate_and_compensation_is_idempotent() {
    let (pool, db_name) = create_test_db().await;
    let log = TaskLog::postgres(pool.clone());
    let req = request();
    let artifacts = Artifacts::default();
    let ctx = PhaseContext {
        task_id: Uuid::new_v4(),
        request: &req,
        artifacts: &artifacts,
        log: &log,
    };

    let phase = DatabasePhase::new(pool.clone(), Duration::from_secs(5));
    let output = phase.apply(&ctx).await.expect("database phase should succeed");
    assert_eq!(output.compensations.len(), 1);

    let app_id = output.artifacts.app_id.expect("app id artifact");
    let app = apps::get_app(&pool, app_id).await.unwrap().unwrap();
    assert_eq!(app.app_name, "my:novel?");
    assert_eq!(Some(app.app_key.as_str()), output.artifacts.app_key.as_deref());

    let ads = apps::list_ad_configs(&pool, app_id).await.unwrap();
    assert_eq!(ads.len(), 4);
    let banner = ads.iter().find(|a| a.slot == AdSlot::Banner).unwrap();
    assert!(banner.enabled);
    assert_eq!(banner.ad_id.as_deref(), Some("banner-1"));
    // app + ui + 4 ad slots + common; no pay types configured
    assert_eq!(apps::count_app_rows(&pool, app_id).await.unwrap(), 7);

    output.compensations[0].compensate().await.unwrap();
    assert_eq!(apps::count_app_rows(&pool, app_id).await.unwrap(), 0);
    output.compensations[0]
        .compensate()
        .await
        .expect("second delete is a no-op");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn database_phase_times_out_on_a_locked_table() {
    let (pool, db_name) = create_test_db().await;
    let log = TaskLog::postgres(pool.clone());
    let req = request();
    let artifacts = Artifacts::default();
    let ctx = PhaseContext {
        task_id: Uuid::new_v4(),
        request: &req,
        artifacts: &artifacts,
        log: &log,
    };

    // Another session holds the table, so even the conflict check waits.
    let mut holder = pool.begin().await.unwrap();
    sqlx::query("LOCK TABLE novel_apps IN ACCESS EXCLUSIVE MODE")
        .execute(&mut *holder)
        .await
        .unwrap();

    let phase = DatabasePhase::new(pool.clone(), Duration::from_millis(500));
    let outcome = tokio::time::timeout(Duration::from_secs(10), phase.apply(&ctx))
        .await
        .expect("database phase must give up on its own");
    match outcome {
        Err(failure) => {
            assert!(
                matches!(failure.error, PhaseError::Timeout { .. }),
                "expected timeout, got {:?}",
                failure.error
            );
            assert!(failure.compensations.is_empty(), "nothing was committed");
        }
        Ok(_) => panic!("phase succeeded against a locked table"),
    }

    holder.rollback().await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    assert!(
        apps::find_conflicting_app(&mut conn, "bd-991", "u1001", "my:novel?")
            .await
            .unwrap()
            .is_none(),
        "nothing was written"
    );
    drop(conn);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn delete_app_records_tolerates_unknown_app() {
    let (pool, db_name) = create_test_db().await;
    let undo = DeleteAppRecords {
        pool: pool.clone(),
        app_id: Uuid::new_v4(),
    };
    undo.compensate().await.unwrap();
    assert!(undo.describe().starts_with("delete database records"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn file_phases_build_a_baidu_tree_and_undo_narrowly() {
    let (pool, db_name) = create_test_db().await;
    let log = TaskLog::postgres(pool.clone());
    let tmp = tempfile::tempdir().unwrap();
    let layout = FileLayout::new(
        tmp.path().join("apps"),
        tmp.path().join("templates"),
        tmp.path().join("resources"),
    );
    let tpl = layout.template_root.join("baidu");
    std::fs::create_dir_all(&tpl).unwrap();
    std::fs::write(tpl.join("app.js"), "App({ key: '{{APP_KEY}}' })").unwrap();
    std::fs::create_dir_all(layout.resource_root.join("common")).unwrap();
    std::fs::write(layout.resource_root.join("common/bg.png"), [7u8; 4]).unwrap();

    let req = request();
    let mut artifacts = Artifacts {
        app_id: Some(Uuid::new_v4()),
        app_key: Some("feedface".into()),
        target_dir: None,
    };
    let task_id = Uuid::new_v4();

    let local = LocalFilePhase::new(layout.clone(), Duration::from_secs(5));
    let out = local
        .apply(&PhaseContext {
            task_id,
            request: &req,
            artifacts: &artifacts,
            log: &log,
        })
        .await
        .expect("local file phase should succeed");
    let dir_undo = out.compensations;
    artifacts.merge(out.artifacts);

    let target = artifacts.target_dir.clone().unwrap();
    assert_eq!(target, layout.target_dir("u1001", "my_novel_"));
    assert_eq!(
        std::fs::read_to_string(target.join("app.js")).unwrap(),
        "App({ key: 'feedface' })"
    );

    let resource = ResourceFilePhase::new(layout.clone(), Duration::from_secs(5));
    let out = resource
        .apply(&PhaseContext {
            task_id,
            request: &req,
            artifacts: &artifacts,
            log: &log,
        })
        .await
        .expect("resource phase should succeed");
    assert!(target.join("project.swan.json").is_file());
    assert!(!target.join("project.config.json").exists());
    assert!(target.join("static/bg.png").is_file());

    // The resource undo removes only what it created.
    out.compensations[0].compensate().await.unwrap();
    assert!(!target.join("static").exists());
    assert!(!target.join("project.swan.json").exists());
    assert!(!target.join("app-config.json").exists());
    assert!(target.join("app.js").is_file());

    // The directory undo removes the rest, and can run twice.
    dir_undo[0].compensate().await.unwrap();
    assert!(!target.exists());
    dir_undo[0].compensate().await.unwrap();

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[cfg(unix)]
#[tokio::test]
async fn failed_template_copy_hands_its_directory_to_rollback() {
    let (pool, db_name) = create_test_db().await;
    let log = TaskLog::postgres(pool.clone());
    let tmp = tempfile::tempdir().unwrap();
    let layout = FileLayout::new(
        tmp.path().join("apps"),
        tmp.path().join("templates"),
        tmp.path().join("resources"),
    );
    let tpl = layout.template_root.join("baidu");
    std::fs::create_dir_all(&tpl).unwrap();
    std::fs::write(tpl.join("app.js"), "App({})").unwrap();
    std::os::unix::fs::symlink(tmp.path().join("missing"), tpl.join("zz-broken.js")).unwrap();

    let req = request();
    let artifacts = Artifacts {
        app_id: Some(Uuid::new_v4()),
        app_key: Some("feedface".into()),
        target_dir: None,
    };
    let failure = LocalFilePhase::new(layout.clone(), Duration::from_secs(5))
        .apply(&PhaseContext {
            task_id: Uuid::new_v4(),
            request: &req,
            artifacts: &artifacts,
            log: &log,
        })
        .await
        .expect_err("broken template entry should fail the copy");

    assert!(matches!(failure.error, PhaseError::Io { .. }), "{:?}", failure.error);
    let target = layout.target_dir("u1001", "my_novel_");
    assert!(target.join("app.js").is_file(), "removal is left to the rollback");

    assert_eq!(failure.compensations.len(), 1);
    assert!(failure.compensations[0].describe().starts_with("remove directory"));
    failure.compensations[0].compensate().await.unwrap();
    assert!(!target.exists());
    assert!(layout.user_dir("u1001").is_dir(), "shared user dir is kept");

    pool.close().await;
    drop_test_db(&db_name).await;
}
