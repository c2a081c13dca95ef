//! Phase 3: provision assets, the platform manifest and the runtime config.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use appforge_db::models::Platform;

use super::fs::{self, WrittenPaths};
use super::local_file::FileLayout;
use crate::error::PhaseError;
use crate::request::CreateNovelAppRequest;
use crate::saga::{Artifacts, Phase, PhaseContext, PhaseFailure, PhaseKind, PhaseOutput};

/// Asset directory inside the generated app.
pub const RESOURCE_SUBDIR: &str = "static";

/// Runtime configuration read by the generated app at startup.
pub const APP_CONFIG_FILE: &str = "app-config.json";

/// Project manifest file name expected by the platform's developer tools.
pub fn manifest_file_name(platform: Platform) -> &'static str {
    match platform {
        Platform::Baidu => "project.swan.json",
        Platform::Weixin | Platform::Douyin | Platform::Kuaishou => "project.config.json",
    }
}

/// Platform project manifest.
pub fn build_manifest(request: &CreateNovelAppRequest) -> Value {
    let base = &request.base_config;
    match base.platform {
        Platform::Baidu => json!({
            "appid": base.appid,
            "projectname": base.app_name,
            "setting": { "urlCheck": true },
            "compilation-args": { "common": { "ignoreTransJs": false } },
        }),
        _ => json!({
            "appid": base.appid,
            "projectname": base.app_name,
            "compileType": "miniprogram",
            "setting": { "urlCheck": true, "es6": true, "minified": true },
        }),
    }
}

/// Runtime configuration for the generated app.
///
/// Upload tokens from `commonConfig.platformTokens` are not included: this
/// file ships inside the client bundle.
pub fn build_app_config(request: &CreateNovelAppRequest, app_id: Uuid, app_key: &str) -> Value {
    let base = &request.base_config;
    let ui = &request.ui_config;
    let common = &request.common_config;

    let pay: Map<String, Value> = request
        .payment_config
        .pay_types
        .iter()
        .map(|(name, cfg)| {
            (
                name.clone(),
                json!({
                    "enabled": cfg.enabled,
                    "gatewayAndroid": cfg.gateway_android,
                    "gatewayIos": cfg.gateway_ios,
                }),
            )
        })
        .collect();

    let ads: Map<String, Value> = request
        .ad_config
        .slots()
        .into_iter()
        .map(|(slot, cfg)| {
            (
                slot.to_string(),
                json!({ "enabled": cfg.enabled, "adId": cfg.ad_id, "count": cfg.count }),
            )
        })
        .collect();

    json!({
        "appId": app_id,
        "appKey": app_key,
        "appName": base.app_name,
        "appCode": base.app_code,
        "platform": base.platform,
        "platformAppid": base.appid,
        "version": base.version,
        "product": base.product,
        "customer": base.customer,
        "tokenId": base.token_id,
        "cl": base.cl,
        "bannerId": base.banner_id,
        "deliverId": base.deliver_id,
        "theme": { "main": ui.main_theme, "second": ui.second_theme },
        "ui": { "payCardStyle": ui.pay_card_style, "homeCardStyle": ui.home_card_style },
        "pay": pay,
        "ads": ads,
        "common": {
            "buildCode": common.build_code,
            "contact": common.contact,
            "loginTypes": common.login_types,
            "iaaEnabled": common.iaa_enabled,
            "payEntryEnabled": common.pay_entry_enabled,
        },
    })
}

fn encode(value: &Value) -> Result<Vec<u8>, PhaseError> {
    serde_json::to_vec_pretty(value)
        .map_err(|e| PhaseError::io("failed to encode json", std::io::Error::other(e)))
}

/// Copies common and platform assets into `{target}/static` and writes the
/// manifest and runtime config. Registers a compensation that removes only
/// what this phase created.
#[derive(Debug, Clone)]
pub struct ResourceFilePhase {
    layout: FileLayout,
    op_timeout: Duration,
}

impl ResourceFilePhase {
    pub fn new(layout: FileLayout, op_timeout: Duration) -> Self {
        Self { layout, op_timeout }
    }

    async fn provision(
        &self,
        ctx: &PhaseContext<'_>,
        target: &Path,
        written: &mut WrittenPaths,
    ) -> Result<usize, PhaseError> {
        let app_id = ctx.artifacts.require_app_id()?;
        let app_key = ctx.artifacts.require_app_key()?;
        let platform = ctx.request.base_config.platform;
        let static_dir = target.join(RESOURCE_SUBDIR);

        fs::create_dirs(self.op_timeout, &static_dir, written).await?;

        let mut assets = 0;
        for source in self.layout.resource_dirs(platform) {
            if !fs::exists(self.op_timeout, &source).await? {
                tracing::debug!(source = %source.display(), "no resources, skipping");
                continue;
            }
            assets += fs::copy_tree(self.op_timeout, &source, &static_dir, None, written).await?;
        }

        let manifest = target.join(manifest_file_name(platform));
        fs::write_file(
            self.op_timeout,
            &manifest,
            encode(&build_manifest(ctx.request))?,
            written,
        )
        .await?;

        let app_config = target.join(APP_CONFIG_FILE);
        fs::write_file(
            self.op_timeout,
            &app_config,
            encode(&build_app_config(ctx.request, app_id, app_key))?,
            written,
        )
        .await?;

        Ok(assets)
    }
}

#[async_trait]
impl Phase for ResourceFilePhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::ResourceFile
    }

    async fn apply(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
        let target = ctx.artifacts.require_target_dir()?;

        let mut written = WrittenPaths::default();
        let assets = match self.provision(ctx, target, &mut written).await {
            Ok(assets) => assets,
            Err(e) => {
                tracing::warn!(
                    task_id = %ctx.task_id,
                    written = written.len(),
                    error = %e,
                    "resource copy failed, handing partial output to rollback"
                );
                let failure = PhaseFailure::from(e);
                if written.is_empty() {
                    return Err(failure);
                }
                return Err(failure.with_compensation(written.into_compensation()));
            }
        };

        ctx.progress(
            PhaseKind::ResourceFile,
            format!("provisioned {assets} asset(s)"),
            json!({
                "assets": assets,
                "created_files": written.files.len(),
                "created_dirs": written.dirs.len(),
            }),
        )
        .await;

        Ok(PhaseOutput::new(Artifacts::default()).with_compensation(written.into_compensation()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::tests::sample_request;

    #[test]
    fn baidu_uses_swan_manifest() {
        assert_eq!(manifest_file_name(Platform::Baidu), "project.swan.json");
        assert_eq!(manifest_file_name(Platform::Weixin), "project.config.json");
        assert_eq!(manifest_file_name(Platform::Douyin), "project.config.json");
    }

    #[test]
    fn manifest_carries_platform_appid() {
        let req = sample_request();
        let manifest = build_manifest(&req);
        assert_eq!(manifest["appid"], "wx1234567890abcdef");
        assert_eq!(manifest["compileType"], "miniprogram");
    }

    #[test]
    fn app_config_omits_platform_tokens() {
        let req = sample_request();
        let config = build_app_config(&req, Uuid::nil(), "k");
        let text = serde_json::to_string(&config).unwrap();
        assert!(!text.contains("secret-upload-key"));
        assert_eq!(config["appKey"], "k");
        assert_eq!(config["platform"], "weixin");
        assert_eq!(config["pay"]["normalPay"]["gatewayIos"], "iap");
        assert_eq!(config["ads"]["reward"]["count"], 3);
        assert_eq!(config["ads"]["feed"]["enabled"], false);
        assert_eq!(config["theme"]["main"], "#FF5500");
    }
}
