//! The creation request: grouped configuration for a new application.
//!
//! The orchestrator treats a validated request as an immutable value. Its
//! JSON form (camelCase) is what callers submit and what is snapshotted into
//! the creation task row.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use appforge_db::models::{AdSlot, Platform};

/// Characters that cannot appear in a generated directory name.
const RESERVED_PATH_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Replace every filesystem-reserved character in an app name with `_`.
pub fn sanitize_app_name(name: &str) -> String {
    name.chars()
        .map(|c| if RESERVED_PATH_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Structural problems with a creation request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("user id {0:?} must not contain path separators or be a relative path component")]
    InvalidUserId(String),

    #[error("app name {0:?} does not produce a usable directory name")]
    InvalidAppName(String),

    #[error("{field} must be a #RRGGBB color, got {value:?}")]
    InvalidThemeColor { field: &'static str, value: String },

    #[error("{0} ads are enabled but no ad id is configured")]
    AdSlotWithoutId(AdSlot),

    #[error("pay type {0:?} is enabled but has no gateway")]
    PayTypeWithoutGateway(String),
}

/// Request to create one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNovelAppRequest {
    pub user_id: String,
    pub base_config: BaseConfig,
    #[serde(default)]
    pub payment_config: PaymentConfig,
    #[serde(default)]
    pub ad_config: AdConfig,
    pub common_config: CommonConfig,
    pub ui_config: UiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseConfig {
    pub app_name: String,
    pub app_code: String,
    pub platform: Platform,
    pub version: String,
    pub product: String,
    pub customer: String,
    /// Platform-issued application id.
    pub appid: String,
    #[serde(default)]
    pub token_id: Option<String>,
    /// Distribution channel.
    #[serde(default)]
    pub cl: Option<String>,
    #[serde(default)]
    pub banner_id: Option<String>,
    #[serde(default)]
    pub deliver_id: Option<String>,
}

/// Payment settings keyed by pay type (e.g. `normalPay`, `renewPay`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentConfig {
    #[serde(flatten)]
    pub pay_types: BTreeMap<String, PayTypeConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayTypeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub gateway_android: Option<String>,
    #[serde(default)]
    pub gateway_ios: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdConfig {
    pub reward: AdSlotConfig,
    pub interstitial: AdSlotConfig,
    pub banner: AdSlotConfig,
    pub feed: AdSlotConfig,
}

impl AdConfig {
    /// Every slot paired with its settings, in a fixed order.
    pub fn slots(&self) -> [(AdSlot, &AdSlotConfig); 4] {
        [
            (AdSlot::Reward, &self.reward),
            (AdSlot::Interstitial, &self.interstitial),
            (AdSlot::Banner, &self.banner),
            (AdSlot::Feed, &self.feed),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdSlotConfig {
    pub enabled: bool,
    pub ad_id: Option<String>,
    /// How many times the ad may be shown (per session or per day,
    /// depending on the slot).
    pub count: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    pub build_code: String,
    #[serde(default)]
    pub contact: Option<String>,
    /// Upload/publish tokens keyed by platform name. Never written into the
    /// generated client bundle.
    #[serde(default)]
    pub platform_tokens: BTreeMap<String, String>,
    #[serde(default)]
    pub login_types: Vec<String>,
    /// In-app advertising toggle.
    #[serde(default)]
    pub iaa_enabled: bool,
    #[serde(default)]
    pub pay_entry_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiConfig {
    pub pay_card_style: String,
    pub home_card_style: String,
    pub main_theme: String,
    pub second_theme: String,
}

impl CreateNovelAppRequest {
    /// The app name with reserved path characters replaced.
    pub fn sanitized_app_name(&self) -> String {
        sanitize_app_name(&self.base_config.app_name)
    }

    /// Check the structural invariants every phase relies on.
    ///
    /// This never touches the database or the filesystem; duplicate
    /// detection happens in the database phase.
    pub fn validate(&self) -> Result<(), RequestError> {
        let base = &self.base_config;
        let required = [
            ("userId", &self.user_id),
            ("baseConfig.appName", &base.app_name),
            ("baseConfig.appCode", &base.app_code),
            ("baseConfig.version", &base.version),
            ("baseConfig.product", &base.product),
            ("baseConfig.customer", &base.customer),
            ("baseConfig.appid", &base.appid),
            ("commonConfig.buildCode", &self.common_config.build_code),
            ("uiConfig.payCardStyle", &self.ui_config.pay_card_style),
            ("uiConfig.homeCardStyle", &self.ui_config.home_card_style),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(RequestError::MissingField(field));
            }
        }

        if !is_safe_path_component(&self.user_id) {
            return Err(RequestError::InvalidUserId(self.user_id.clone()));
        }

        let sanitized = self.sanitized_app_name();
        if !is_safe_path_component(&sanitized) {
            return Err(RequestError::InvalidAppName(base.app_name.clone()));
        }

        for (field, value) in [
            ("uiConfig.mainTheme", &self.ui_config.main_theme),
            ("uiConfig.secondTheme", &self.ui_config.second_theme),
        ] {
            if !is_hex_color(value) {
                return Err(RequestError::InvalidThemeColor {
                    field,
                    value: value.clone(),
                });
            }
        }

        for (slot, cfg) in self.ad_config.slots() {
            if cfg.enabled && cfg.ad_id.as_deref().is_none_or(|id| id.trim().is_empty()) {
                return Err(RequestError::AdSlotWithoutId(slot));
            }
        }

        for (pay_type, cfg) in &self.payment_config.pay_types {
            if cfg.enabled && cfg.gateway_android.is_none() && cfg.gateway_ios.is_none() {
                return Err(RequestError::PayTypeWithoutGateway(pay_type.clone()));
            }
        }

        Ok(())
    }
}

fn is_safe_path_component(s: &str) -> bool {
    let trimmed = s.trim();
    !trimmed.is_empty()
        && trimmed != "."
        && trimmed != ".."
        && !s.contains(['/', '\\'])
        && !s.contains('\0')
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A valid request for `novel123` on weixin.
    pub(crate) fn sample_request() -> CreateNovelAppRequest {
        serde_json::from_value(serde_json::json!({
            "userId": "u1001",
            "baseConfig": {
                "appName": "novel123",
                "appCode": "NOVEL123",
                "platform": "weixin",
                "version": "1.0.0",
                "product": "novel",
                "customer": "acme",
                "appid": "wx1234567890abcdef",
                "tokenId": "tok-1",
                "cl": "official"
            },
            "paymentConfig": {
                "normalPay": { "enabled": true, "gatewayAndroid": "wxpay", "gatewayIos": "iap" }
            },
            "adConfig": {
                "reward": { "enabled": true, "adId": "adunit-reward", "count": 3 }
            },
            "commonConfig": {
                "buildCode": "b-001",
                "loginTypes": ["wechat"],
                "platformTokens": { "weixin": "secret-upload-key" }
            },
            "uiConfig": {
                "payCardStyle": "card-a",
                "homeCardStyle": "grid",
                "mainTheme": "#FF5500",
                "secondTheme": "#222222"
            }
        }))
        .expect("sample request should deserialize")
    }

    #[test]
    fn sanitize_replaces_every_reserved_char() {
        assert_eq!(sanitize_app_name(r#"a<b>c:d"e/f\g|h?i*j"#), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_app_name("novel123"), "novel123");
        assert_eq!(sanitize_app_name("小说 app"), "小说 app");
    }

    #[test]
    fn sample_request_is_valid() {
        let req = sample_request();
        assert_eq!(req.validate(), Ok(()));
        assert_eq!(req.base_config.platform, Platform::Weixin);
        assert!(req.ad_config.feed == AdSlotConfig::default());
        assert_eq!(req.payment_config.pay_types.len(), 1);
    }

    #[test]
    fn missing_app_name_is_rejected() {
        let mut req = sample_request();
        req.base_config.app_name = "   ".into();
        assert_eq!(
            req.validate(),
            Err(RequestError::MissingField("baseConfig.appName"))
        );
    }

    #[test]
    fn traversal_names_are_rejected() {
        let mut req = sample_request();
        req.base_config.app_name = "..".into();
        assert!(matches!(req.validate(), Err(RequestError::InvalidAppName(_))));

        let mut req = sample_request();
        req.user_id = "../etc".into();
        assert!(matches!(req.validate(), Err(RequestError::InvalidUserId(_))));
    }

    #[test]
    fn slash_in_app_name_is_sanitized_not_rejected() {
        let mut req = sample_request();
        req.base_config.app_name = "a/b".into();
        assert_eq!(req.validate(), Ok(()));
        assert_eq!(req.sanitized_app_name(), "a_b");
    }

    #[test]
    fn theme_colors_must_be_hex() {
        let mut req = sample_request();
        req.ui_config.main_theme = "orange".into();
        assert_eq!(
            req.validate(),
            Err(RequestError::InvalidThemeColor {
                field: "uiConfig.mainTheme",
                value: "orange".into()
            })
        );
    }

    #[test]
    fn enabled_ad_slot_needs_an_id() {
        let mut req = sample_request();
        req.ad_config.banner.enabled = true;
        assert_eq!(
            req.validate(),
            Err(RequestError::AdSlotWithoutId(AdSlot::Banner))
        );
    }

    #[test]
    fn enabled_pay_type_needs_a_gateway() {
        let mut req = sample_request();
        req.payment_config
            .pay_types
            .insert("renewPay".into(), PayTypeConfig { enabled: true, ..Default::default() });
        assert_eq!(
            req.validate(),
            Err(RequestError::PayTypeWithoutGateway("renewPay".into()))
        );
    }

    #[test]
    fn json_uses_camel_case_keys() {
        let value = serde_json::to_value(sample_request()).unwrap();
        assert_eq!(value["baseConfig"]["appName"], "novel123");
        assert_eq!(value["paymentConfig"]["normalPay"]["gatewayAndroid"], "wxpay");
        assert_eq!(value["adConfig"]["reward"]["adId"], "adunit-reward");
        assert_eq!(value["uiConfig"]["mainTheme"], "#FF5500");
    }
}
