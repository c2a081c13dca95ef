//! Database query functions for the application aggregate: `novel_apps` and
//! its sub-config tables (`ui_configs`, `pay_configs`, `ad_configs`,
//! `common_configs`).
//!
//! Insert functions take a `&mut PgConnection` so callers can run them inside
//! a single transaction.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{AdConfig, AdSlot, CommonConfig, NovelApp, PayConfig, Platform, UiConfig};

/// Parameters for inserting a new application row.
#[derive(Debug, Clone)]
pub struct NewNovelApp {
    pub user_id: String,
    pub app_name: String,
    pub app_code: String,
    pub platform: Platform,
    pub version: String,
    pub product: String,
    pub customer: String,
    pub appid: String,
    pub token_id: Option<String>,
    pub cl: Option<String>,
    pub banner_id: Option<String>,
    pub deliver_id: Option<String>,
    pub app_key: String,
}

/// Parameters for the `ui_configs` row.
#[derive(Debug, Clone)]
pub struct NewUiConfig {
    pub pay_card_style: String,
    pub home_card_style: String,
    pub main_theme: String,
    pub second_theme: String,
}

/// Parameters for one `pay_configs` row.
#[derive(Debug, Clone)]
pub struct NewPayConfig {
    pub pay_type: String,
    pub enabled: bool,
    pub gateway_android: Option<String>,
    pub gateway_ios: Option<String>,
}

/// Parameters for one `ad_configs` row.
#[derive(Debug, Clone)]
pub struct NewAdConfig {
    pub slot: AdSlot,
    pub enabled: bool,
    pub ad_id: Option<String>,
    pub show_count: Option<i32>,
}

/// Parameters for the `common_configs` row.
#[derive(Debug, Clone)]
pub struct NewCommonConfig {
    pub build_code: String,
    pub contact: Option<String>,
    pub platform_tokens: Value,
    pub login_types: Vec<String>,
    pub iaa_enabled: bool,
    pub pay_entry_enabled: bool,
}

/// Insert the application row. Returns it with server-generated defaults
/// (id, created_at).
pub async fn insert_app(conn: &mut PgConnection, new: &NewNovelApp) -> Result<NovelApp> {
    let app = sqlx::query_as::<_, NovelApp>(
        "INSERT INTO novel_apps \
             (user_id, app_name, app_code, platform, version, product, customer, \
              appid, token_id, cl, banner_id, deliver_id, app_key) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING *",
    )
    .bind(&new.user_id)
    .bind(&new.app_name)
    .bind(&new.app_code)
    .bind(new.platform)
    .bind(&new.version)
    .bind(&new.product)
    .bind(&new.customer)
    .bind(&new.appid)
    .bind(&new.token_id)
    .bind(&new.cl)
    .bind(&new.banner_id)
    .bind(&new.deliver_id)
    .bind(&new.app_key)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("failed to insert app {:?}", new.app_name))?;

    Ok(app)
}

/// Insert the UI config row for an app.
pub async fn insert_ui_config(
    conn: &mut PgConnection,
    app_id: Uuid,
    new: &NewUiConfig,
) -> Result<UiConfig> {
    let row = sqlx::query_as::<_, UiConfig>(
        "INSERT INTO ui_configs (app_id, pay_card_style, home_card_style, main_theme, second_theme) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(app_id)
    .bind(&new.pay_card_style)
    .bind(&new.home_card_style)
    .bind(&new.main_theme)
    .bind(&new.second_theme)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("failed to insert ui config for app {app_id}"))?;

    Ok(row)
}

/// Insert one pay config row for an app.
pub async fn insert_pay_config(
    conn: &mut PgConnection,
    app_id: Uuid,
    new: &NewPayConfig,
) -> Result<PayConfig> {
    let row = sqlx::query_as::<_, PayConfig>(
        "INSERT INTO pay_configs (app_id, pay_type, enabled, gateway_android, gateway_ios) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(app_id)
    .bind(&new.pay_type)
    .bind(new.enabled)
    .bind(&new.gateway_android)
    .bind(&new.gateway_ios)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| {
        format!(
            "failed to insert pay config {} for app {app_id}",
            new.pay_type
        )
    })?;

    Ok(row)
}

/// Insert one ad config row for an app.
pub async fn insert_ad_config(
    conn: &mut PgConnection,
    app_id: Uuid,
    new: &NewAdConfig,
) -> Result<AdConfig> {
    let row = sqlx::query_as::<_, AdConfig>(
        "INSERT INTO ad_configs (app_id, slot, enabled, ad_id, show_count) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(app_id)
    .bind(new.slot)
    .bind(new.enabled)
    .bind(&new.ad_id)
    .bind(new.show_count)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("failed to insert {} ad config for app {app_id}", new.slot))?;

    Ok(row)
}

/// Insert the common config row for an app.
pub async fn insert_common_config(
    conn: &mut PgConnection,
    app_id: Uuid,
    new: &NewCommonConfig,
) -> Result<CommonConfig> {
    let row = sqlx::query_as::<_, CommonConfig>(
        "INSERT INTO common_configs \
             (app_id, build_code, contact, platform_tokens, login_types, iaa_enabled, pay_entry_enabled) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(app_id)
    .bind(&new.build_code)
    .bind(&new.contact)
    .bind(&new.platform_tokens)
    .bind(&new.login_types)
    .bind(new.iaa_enabled)
    .bind(new.pay_entry_enabled)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("failed to insert common config for app {app_id}"))?;

    Ok(row)
}

/// Find an existing app that would collide with a new one, either on the
/// platform appid or on the `(user_id, app_name)` pair.
pub async fn find_conflicting_app(
    conn: &mut PgConnection,
    appid: &str,
    user_id: &str,
    app_name: &str,
) -> Result<Option<NovelApp>> {
    let app = sqlx::query_as::<_, NovelApp>(
        "SELECT * FROM novel_apps \
         WHERE appid = $1 OR (user_id = $2 AND app_name = $3) \
         LIMIT 1",
    )
    .bind(appid)
    .bind(user_id)
    .bind(app_name)
    .fetch_optional(conn)
    .await
    .context("failed to check for conflicting apps")?;

    Ok(app)
}

/// Fetch a single app by ID.
pub async fn get_app(pool: &PgPool, id: Uuid) -> Result<Option<NovelApp>> {
    let app = sqlx::query_as::<_, NovelApp>("SELECT * FROM novel_apps WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch app")?;

    Ok(app)
}

/// Fetch apps owned by a user, ordered by creation time.
pub async fn list_apps_for_user(pool: &PgPool, user_id: &str) -> Result<Vec<NovelApp>> {
    let apps = sqlx::query_as::<_, NovelApp>(
        "SELECT * FROM novel_apps WHERE user_id = $1 ORDER BY created_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list apps for user {user_id}"))?;

    Ok(apps)
}

/// Fetch every ad config row for an app, ordered by slot.
pub async fn list_ad_configs(pool: &PgPool, app_id: Uuid) -> Result<Vec<AdConfig>> {
    let rows = sqlx::query_as::<_, AdConfig>(
        "SELECT * FROM ad_configs WHERE app_id = $1 ORDER BY slot ASC",
    )
    .bind(app_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list ad configs for app {app_id}"))?;

    Ok(rows)
}

/// Count every row belonging to an app across the aggregate's tables.
pub async fn count_app_rows(pool: &PgPool, app_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT \
             (SELECT COUNT(*) FROM novel_apps WHERE id = $1) \
           + (SELECT COUNT(*) FROM ui_configs WHERE app_id = $1) \
           + (SELECT COUNT(*) FROM pay_configs WHERE app_id = $1) \
           + (SELECT COUNT(*) FROM ad_configs WHERE app_id = $1) \
           + (SELECT COUNT(*) FROM common_configs WHERE app_id = $1)",
    )
    .bind(app_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to count rows for app {app_id}"))?;

    Ok(row.0)
}

/// Delete every row of the app aggregate in one transaction.
///
/// Returns the number of rows removed. Deleting an app that no longer exists
/// removes nothing and succeeds, so repeated calls are safe.
pub async fn delete_app_aggregate(pool: &PgPool, app_id: Uuid) -> Result<u64> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin app delete transaction")?;

    let mut removed = 0;
    for table in ["ui_configs", "pay_configs", "ad_configs", "common_configs"] {
        let stmt = format!("DELETE FROM {table} WHERE app_id = $1");
        let result = sqlx::query(&stmt)
            .bind(app_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to delete {table} rows for app {app_id}"))?;
        removed += result.rows_affected();
    }

    let result = sqlx::query("DELETE FROM novel_apps WHERE id = $1")
        .bind(app_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to delete app {app_id}"))?;
    removed += result.rows_affected();

    tx.commit()
        .await
        .context("failed to commit app delete transaction")?;

    Ok(removed)
}
