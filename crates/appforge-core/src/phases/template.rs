//! `{{PLACEHOLDER}}` substitution for platform template files.

use std::collections::BTreeMap;
use std::path::Path;

use uuid::Uuid;

use crate::request::CreateNovelAppRequest;

/// Extensions treated as text and rendered. Everything else is copied
/// byte-for-byte.
const TEXT_EXTENSIONS: &[&str] = &[
    "js", "ts", "json", "wxml", "wxss", "wxs", "ttml", "ttss", "ksml", "kss", "swan", "css",
    "sjs", "less", "scss", "html", "vue", "md", "txt", "xml", "yaml", "yml", "svg", "env",
];

/// Whether a template file should have placeholders substituted.
pub fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            TEXT_EXTENSIONS
                .iter()
                .any(|t| t.eq_ignore_ascii_case(ext))
        })
}

/// How a substituted value is quoted for the file it lands in.
///
/// Placeholders sit inside string literals or text nodes, so a value
/// carrying quotes or markup must not end the surrounding construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escape {
    /// Inside a JSON string.
    Json,
    /// Inside a JS string, including template literals.
    Script,
    /// XML-style markup: text nodes and quoted attributes.
    Markup,
    /// Stylesheet values and strings.
    Style,
    Raw,
}

impl Escape {
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Self::Json,
            "js" | "ts" | "sjs" | "wxs" => Self::Script,
            "wxml" | "ttml" | "ksml" | "swan" | "html" | "vue" | "xml" | "svg" => Self::Markup,
            "wxss" | "ttss" | "kss" | "css" | "less" | "scss" => Self::Style,
            _ => Self::Raw,
        }
    }

    fn push(self, value: &str, out: &mut String) {
        match self {
            Self::Raw => out.push_str(value),
            Self::Json => {
                let quoted = serde_json::Value::String(value.to_string()).to_string();
                out.push_str(&quoted[1..quoted.len() - 1]);
            }
            Self::Script => {
                for c in value.chars() {
                    match c {
                        '\\' => out.push_str("\\\\"),
                        '\'' => out.push_str("\\'"),
                        '"' => out.push_str("\\\""),
                        '`' => out.push_str("\\`"),
                        '$' => out.push_str("\\$"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\u{2028}' | '\u{2029}' => out.push_str(&format!("\\u{:04x}", c as u32)),
                        c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
                        c => out.push(c),
                    }
                }
            }
            Self::Markup => {
                for c in value.chars() {
                    match c {
                        '&' => out.push_str("&amp;"),
                        '<' => out.push_str("&lt;"),
                        '>' => out.push_str("&gt;"),
                        '"' => out.push_str("&quot;"),
                        '\'' => out.push_str("&#39;"),
                        c => out.push(c),
                    }
                }
            }
            Self::Style => {
                for c in value.chars() {
                    match c {
                        '\\' | '"' | '\'' | ';' | '{' | '}' => {
                            out.push('\\');
                            out.push(c);
                        }
                        c if c.is_control() => out.push_str(&format!("\\{:x} ", c as u32)),
                        c => out.push(c),
                    }
                }
            }
        }
    }
}

/// Named values substituted into `{{NAME}}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// The identifiers every generated app carries.
    pub fn for_app(request: &CreateNovelAppRequest, app_id: Uuid, app_key: &str) -> Self {
        let base = &request.base_config;
        let ui = &request.ui_config;
        let optional = |v: &Option<String>| v.clone().unwrap_or_default();

        let mut vars = Self::new();
        vars.insert("APP_ID", app_id.to_string());
        vars.insert("APP_KEY", app_key);
        vars.insert("APP_NAME", &base.app_name);
        vars.insert("APP_CODE", &base.app_code);
        vars.insert("PLATFORM", base.platform.as_str());
        vars.insert("PLATFORM_APPID", &base.appid);
        vars.insert("VERSION", &base.version);
        vars.insert("PRODUCT", &base.product);
        vars.insert("CUSTOMER", &base.customer);
        vars.insert("TOKEN_ID", optional(&base.token_id));
        vars.insert("CL", optional(&base.cl));
        vars.insert("BANNER_ID", optional(&base.banner_id));
        vars.insert("DELIVER_ID", optional(&base.deliver_id));
        vars.insert("MAIN_THEME", &ui.main_theme);
        vars.insert("SECOND_THEME", &ui.second_theme);
        vars.insert("BUILD_CODE", &request.common_config.build_code);
        vars
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Replace every known `{{NAME}}` in `input`, quoting values with
    /// `escape`.
    ///
    /// Whitespace inside the braces is ignored. Unknown names and unclosed
    /// braces are left untouched.
    pub fn render(&self, input: &str, escape: Escape) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                out.push_str(&rest[open..]);
                return out;
            };

            let name = after_open[..close].trim();
            match self.get(name) {
                Some(value) => escape.push(value, &mut out),
                None => out.push_str(&rest[open..open + 2 + close + 2]),
            }
            rest = &after_open[close + 2..];
        }

        out.push_str(rest);
        out
    }
}
