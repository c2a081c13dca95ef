//! Phase 1: write the app aggregate in one native transaction.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use appforge_db::queries::apps::{
    self, NewAdConfig, NewCommonConfig, NewNovelApp, NewPayConfig, NewUiConfig,
};

use crate::error::PhaseError;
use crate::request::CreateNovelAppRequest;
use crate::saga::{
    Artifacts, DeleteAppRecords, Phase, PhaseContext, PhaseFailure, PhaseKind, PhaseOutput,
};

/// SQLSTATE for `query_canceled`, raised when `statement_timeout` fires.
const QUERY_CANCELED: &str = "57014";

/// Generate a fresh app key: 16 random bytes, hex encoded.
pub fn generate_app_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Inserts the app row and its config rows. Registers one coarse
/// compensation that deletes everything keyed by the new app id.
#[derive(Debug, Clone)]
pub struct DatabasePhase {
    pool: PgPool,
    statement_timeout: Duration,
}

impl DatabasePhase {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    /// Budget for the whole transaction, enforced on the client. Every
    /// statement is also bounded server-side by `statement_timeout`.
    fn transaction_bound(&self) -> Duration {
        self.pool.options().get_acquire_timeout() + self.statement_timeout * 2
    }

    /// Reject requests that collide with an existing app.
    async fn check_conflicts(
        &self,
        conn: &mut PgConnection,
        request: &CreateNovelAppRequest,
    ) -> Result<(), PhaseError> {
        let base = &request.base_config;
        let existing =
            apps::find_conflicting_app(conn, &base.appid, &request.user_id, &base.app_name)
                .await
                .map_err(|e| self.classify("check for conflicting apps", e))?;

        match existing {
            Some(app) if app.appid == base.appid => Err(PhaseError::Validation(format!(
                "appid {} is already registered to app {}",
                base.appid, app.id
            ))),
            Some(app) => Err(PhaseError::Validation(format!(
                "user {} already has an app named {:?} ({})",
                request.user_id, base.app_name, app.id
            ))),
            None => Ok(()),
        }
    }

    /// Conflict check and inserts in one transaction under
    /// `SET LOCAL statement_timeout`.
    async fn write_aggregate(
        &self,
        request: &CreateNovelAppRequest,
        app_key: &str,
    ) -> Result<Uuid, PhaseError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin app transaction")
            .map_err(|e| self.classify("begin app transaction", e))?;

        // SET does not take bind parameters.
        let set_timeout = format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        );
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .context("failed to set statement timeout")
            .map_err(|e| self.classify("set statement timeout", e))?;

        self.check_conflicts(&mut *tx, request).await?;

        let app_id = self
            .insert_rows(&mut *tx, request, app_key)
            .await
            .map_err(|e| self.classify("insert app records", e))?;

        tx.commit()
            .await
            .context("failed to commit app transaction")
            .map_err(|e| self.classify("commit app transaction", e))?;

        Ok(app_id)
    }

    async fn insert_rows(
        &self,
        conn: &mut PgConnection,
        request: &CreateNovelAppRequest,
        app_key: &str,
    ) -> anyhow::Result<Uuid> {
        let base = &request.base_config;
        let app = apps::insert_app(
            &mut *conn,
            &NewNovelApp {
                user_id: request.user_id.clone(),
                app_name: base.app_name.clone(),
                app_code: base.app_code.clone(),
                platform: base.platform,
                version: base.version.clone(),
                product: base.product.clone(),
                customer: base.customer.clone(),
                appid: base.appid.clone(),
                token_id: base.token_id.clone(),
                cl: base.cl.clone(),
                banner_id: base.banner_id.clone(),
                deliver_id: base.deliver_id.clone(),
                app_key: app_key.to_string(),
            },
        )
        .await?;

        let ui = &request.ui_config;
        apps::insert_ui_config(
            &mut *conn,
            app.id,
            &NewUiConfig {
                pay_card_style: ui.pay_card_style.clone(),
                home_card_style: ui.home_card_style.clone(),
                main_theme: ui.main_theme.clone(),
                second_theme: ui.second_theme.clone(),
            },
        )
        .await?;

        for (pay_type, cfg) in &request.payment_config.pay_types {
            apps::insert_pay_config(
                &mut *conn,
                app.id,
                &NewPayConfig {
                    pay_type: pay_type.clone(),
                    enabled: cfg.enabled,
                    gateway_android: cfg.gateway_android.clone(),
                    gateway_ios: cfg.gateway_ios.clone(),
                },
            )
            .await?;
        }

        for (slot, cfg) in request.ad_config.slots() {
            apps::insert_ad_config(
                &mut *conn,
                app.id,
                &NewAdConfig {
                    slot,
                    enabled: cfg.enabled,
                    ad_id: cfg.ad_id.clone(),
                    show_count: cfg.count,
                },
            )
            .await?;
        }

        let common = &request.common_config;
        let platform_tokens: Value = common
            .platform_tokens
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>()
            .into();
        apps::insert_common_config(
            &mut *conn,
            app.id,
            &NewCommonConfig {
                build_code: common.build_code.clone(),
                contact: common.contact.clone(),
                platform_tokens,
                login_types: common.login_types.clone(),
                iaa_enabled: common.iaa_enabled,
                pay_entry_enabled: common.pay_entry_enabled,
            },
        )
        .await?;

        Ok(app.id)
    }

    fn classify(&self, operation: &str, err: anyhow::Error) -> PhaseError {
        classify_db_error(
            operation,
            err,
            self.statement_timeout,
            self.pool.options().get_acquire_timeout(),
        )
    }
}

#[async_trait]
impl Phase for DatabasePhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Database
    }

    async fn apply(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
        let app_key = generate_app_key();
        let bound = self.transaction_bound();
        let app_id = tokio::time::timeout(bound, self.write_aggregate(ctx.request, &app_key))
            .await
            .map_err(|_| PhaseError::Timeout {
                operation: "write app records".to_string(),
                after: bound,
            })??;

        tracing::info!(task_id = %ctx.task_id, app_id = %app_id, "app records committed");
        ctx.progress(
            PhaseKind::Database,
            format!("inserted app {app_id}"),
            json!({
                "app_id": app_id,
                "pay_configs": ctx.request.payment_config.pay_types.len(),
            }),
        )
        .await;

        let artifacts = Artifacts {
            app_id: Some(app_id),
            app_key: Some(app_key),
            target_dir: None,
        };
        Ok(PhaseOutput::new(artifacts).with_compensation(DeleteAppRecords {
            pool: self.pool.clone(),
            app_id,
        }))
    }
}

/// Map a query failure onto the phase error taxonomy.
///
/// Unique violations (a concurrent insert won the race) are validation
/// errors; a fired `statement_timeout` or an exhausted pool is a timeout;
/// everything else is transient I/O.
pub fn classify_db_error(
    operation: &str,
    err: anyhow::Error,
    statement_timeout: Duration,
    acquire_timeout: Duration,
) -> PhaseError {
    let sql_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<sqlx::Error>());

    let mapped = match sql_err {
        Some(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Some(PhaseError::Validation(format!(
                "{operation}: duplicate app ({})",
                db.constraint().unwrap_or("unique constraint")
            )))
        }
        Some(sqlx::Error::Database(db)) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            Some(PhaseError::Timeout {
                operation: operation.to_string(),
                after: statement_timeout,
            })
        }
        Some(sqlx::Error::PoolTimedOut) => Some(PhaseError::Timeout {
            operation: format!("{operation}: acquire database connection"),
            after: acquire_timeout,
        }),
        _ => None,
    };

    mapped.unwrap_or_else(|| PhaseError::Database {
        context: format!("failed to {operation}"),
        cause: err,
    })
}
