//! The three concrete phases of a creation, in execution order.

pub mod database;
pub(crate) mod fs;
pub mod local_file;
pub mod resource_file;
pub mod template;

pub use database::DatabasePhase;
pub use local_file::{FileLayout, LocalFilePhase};
pub use resource_file::{APP_CONFIG_FILE, RESOURCE_SUBDIR, ResourceFilePhase, manifest_file_name};
pub use template::TemplateVars;
