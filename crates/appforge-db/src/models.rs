use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Mini-program platform an application is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Weixin,
    Douyin,
    Kuaishou,
    Baidu,
}

impl Platform {
    /// Every supported platform, in display order.
    pub const ALL: [Platform; 4] = [
        Platform::Weixin,
        Platform::Douyin,
        Platform::Kuaishou,
        Platform::Baidu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weixin => "weixin",
            Self::Douyin => "douyin",
            Self::Kuaishou => "kuaishou",
            Self::Baidu => "baidu",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PlatformParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weixin" => Ok(Self::Weixin),
            "douyin" => Ok(Self::Douyin),
            "kuaishou" => Ok(Self::Kuaishou),
            "baidu" => Ok(Self::Baidu),
            other => Err(PlatformParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Platform`] string.
#[derive(Debug, Clone)]
pub struct PlatformParseError(pub String);

impl fmt::Display for PlatformParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid platform: {:?}", self.0)
    }
}

impl std::error::Error for PlatformParseError {}

// ---------------------------------------------------------------------------

/// Status of a creation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreationStatus {
    Pending,
    Running,
    Committed,
    RolledBack,
    Failed,
}

impl CreationStatus {
    /// Whether the status is one of the three terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for CreationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for CreationStatus {
    type Err = CreationStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "committed" => Ok(Self::Committed),
            "rolled_back" => Ok(Self::RolledBack),
            "failed" => Ok(Self::Failed),
            other => Err(CreationStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CreationStatus`] string.
#[derive(Debug, Clone)]
pub struct CreationStatusParseError(pub String);

impl fmt::Display for CreationStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid creation status: {:?}", self.0)
    }
}

impl std::error::Error for CreationStatusParseError {}

// ---------------------------------------------------------------------------

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Automatic recovery did not fully succeed; an operator must act.
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = LogLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(LogLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LogLevel`] string.
#[derive(Debug, Clone)]
pub struct LogLevelParseError(pub String);

impl fmt::Display for LogLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.0)
    }
}

impl std::error::Error for LogLevelParseError {}

// ---------------------------------------------------------------------------

/// Ad placement slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AdSlot {
    Reward,
    Interstitial,
    Banner,
    Feed,
}

impl fmt::Display for AdSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reward => "reward",
            Self::Interstitial => "interstitial",
            Self::Banner => "banner",
            Self::Feed => "feed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// The application row -- root of the app aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NovelApp {
    pub id: Uuid,
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
    pub created_at: DateTime<Utc>,
}

/// UI styling for an application.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UiConfig {
    pub id: Uuid,
    pub app_id: Uuid,
    pub pay_card_style: String,
    pub home_card_style: String,
    pub main_theme: String,
    pub second_theme: String,
}

/// Settings for one payment type.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PayConfig {
    pub id: Uuid,
    pub app_id: Uuid,
    pub pay_type: String,
    pub enabled: bool,
    pub gateway_android: Option<String>,
    pub gateway_ios: Option<String>,
}

/// Settings for one ad slot.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AdConfig {
    pub id: Uuid,
    pub app_id: Uuid,
    pub slot: AdSlot,
    pub enabled: bool,
    pub ad_id: Option<String>,
    pub show_count: Option<i32>,
}

/// Miscellaneous build/runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CommonConfig {
    pub id: Uuid,
    pub app_id: Uuid,
    pub build_code: String,
    pub contact: Option<String>,
    pub platform_tokens: serde_json::Value,
    pub login_types: Vec<String>,
    pub iaa_enabled: bool,
    pub pay_entry_enabled: bool,
}

/// One attempt at creating an application.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreationTask {
    pub id: Uuid,
    pub user_id: String,
    pub app_name: String,
    pub status: CreationStatus,
    pub current_phase: i32,
    pub request: serde_json::Value,
    pub app_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An entry in a task's append-only progress log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskLogEntry {
    pub id: i64,
    pub task_id: Uuid,
    pub seq: i64,
    pub level: LogLevel,
    pub message: String,
    pub payload: serde_json::Value,
    pub logged_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parse_accepts_every_variant() {
        for p in Platform::ALL {
            let parsed: Platform = p.as_str().parse().expect("should parse");
            assert_eq!(p, parsed);
        }
    }

    #[test]
    fn platform_invalid() {
        let err = "symbian".parse::<Platform>().unwrap_err();
        assert_eq!(err.to_string(), "invalid platform: \"symbian\"");
    }

    #[test]
    fn creation_status_terminal_states() {
        assert!(!CreationStatus::Pending.is_terminal());
        assert!(!CreationStatus::Running.is_terminal());
        assert!(CreationStatus::Committed.is_terminal());
        assert!(CreationStatus::RolledBack.is_terminal());
        assert!(CreationStatus::Failed.is_terminal());
    }

    #[test]
    fn creation_status_uses_snake_case() {
        assert_eq!(CreationStatus::RolledBack.to_string(), "rolled_back");
        assert_eq!(
            "rolled_back".parse::<CreationStatus>().unwrap(),
            CreationStatus::RolledBack
        );
        assert!("ROLLED_BACK".parse::<CreationStatus>().is_err());
    }

    #[test]
    fn log_level_orders_by_severity() {
        assert!(LogLevel::Critical > LogLevel::Error);
        assert!(LogLevel::Warn > LogLevel::Info);
        assert_eq!("critical".parse::<LogLevel>().unwrap(), LogLevel::Critical);
        assert!("fatal".parse::<LogLevel>().is_err());
    }

    #[test]
    fn task_log_entry_serializes_level_as_snake_case() {
        let entry = TaskLogEntry {
            id: 1,
            task_id: Uuid::nil(),
            seq: 1,
            level: LogLevel::Critical,
            message: "rollback incomplete".into(),
            payload: serde_json::json!({}),
            logged_at: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["level"], "critical");
    }
}
