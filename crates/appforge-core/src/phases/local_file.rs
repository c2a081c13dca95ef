//! Phase 2: materialize the app source tree from its platform template.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use appforge_db::models::Platform;

use super::fs::{self, WrittenPaths};
use super::template::TemplateVars;
use crate::error::PhaseError;
use crate::saga::{
    Artifacts, Phase, PhaseContext, PhaseFailure, PhaseKind, PhaseOutput, RemoveDirectory,
};

/// Where generated apps, templates and resources live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    /// Root of generated apps: `{user_path}/{user_id}/{app_name}`.
    pub user_path: PathBuf,
    /// One subdirectory per platform.
    pub template_root: PathBuf,
    /// `common/` plus one subdirectory per platform.
    pub resource_root: PathBuf,
}

impl FileLayout {
    pub fn new(
        user_path: impl Into<PathBuf>,
        template_root: impl Into<PathBuf>,
        resource_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            user_path: user_path.into(),
            template_root: template_root.into(),
            resource_root: resource_root.into(),
        }
    }

    pub fn user_dir(&self, user_id: &str) -> PathBuf {
        self.user_path.join(user_id)
    }

    /// `app_name` must already be sanitized.
    pub fn target_dir(&self, user_id: &str, app_name: &str) -> PathBuf {
        self.user_dir(user_id).join(app_name)
    }

    pub fn template_dir(&self, platform: Platform) -> PathBuf {
        self.template_root.join(platform.as_str())
    }

    /// Resource sources in copy order; platform assets override common ones.
    pub fn resource_dirs(&self, platform: Platform) -> [PathBuf; 2] {
        [
            self.resource_root.join("common"),
            self.resource_root.join(platform.as_str()),
        ]
    }
}

/// Copies `{template_root}/{platform}` into the app's target directory,
/// rendering placeholders in text files.
#[derive(Debug, Clone)]
pub struct LocalFilePhase {
    layout: FileLayout,
    op_timeout: Duration,
}

impl LocalFilePhase {
    pub fn new(layout: FileLayout, op_timeout: Duration) -> Self {
        Self { layout, op_timeout }
    }

    async fn materialize(
        &self,
        template: &Path,
        target: &Path,
        vars: &TemplateVars,
        written: &mut WrittenPaths,
    ) -> Result<usize, PhaseError> {
        if let Some(parent) = target.parent() {
            fs::ensure_shared_dir(self.op_timeout, parent).await?;
        }
        fs::copy_tree(self.op_timeout, template, target, Some(vars), written).await
    }
}

#[async_trait]
impl Phase for LocalFilePhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::LocalFile
    }

    async fn apply(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
        let app_id = ctx.artifacts.require_app_id()?;
        let app_key = ctx.artifacts.require_app_key()?;
        let platform = ctx.request.base_config.platform;

        let template = self.layout.template_dir(platform);
        if !fs::exists(self.op_timeout, &template).await? {
            return Err(PhaseError::Validation(format!(
                "no template for platform {platform} at {}",
                template.display()
            ))
            .into());
        }

        let target = self
            .layout
            .target_dir(&ctx.request.user_id, &ctx.request.sanitized_app_name());
        if fs::exists(self.op_timeout, &target).await? {
            return Err(PhaseError::Validation(format!(
                "target directory {} already exists",
                target.display()
            ))
            .into());
        }

        let vars = TemplateVars::for_app(ctx.request, app_id, app_key);
        let mut written = WrittenPaths::default();
        let copied = match self.materialize(&template, &target, &vars, &mut written).await {
            Ok(copied) => copied,
            Err(e) => {
                tracing::warn!(
                    task_id = %ctx.task_id,
                    target = %target.display(),
                    written = written.len(),
                    error = %e,
                    "template copy failed, handing partial output to rollback"
                );
                let failure = PhaseFailure::from(e);
                if !written.dirs.contains(&target) {
                    return Err(failure);
                }
                return Err(failure.with_compensation(RemoveDirectory { path: target }));
            }
        };

        ctx.progress(
            PhaseKind::LocalFile,
            format!("generated {copied} file(s) in {}", target.display()),
            json!({
                "target_dir": target.display().to_string(),
                "files": copied,
                "template": template.display().to_string(),
            }),
        )
        .await;

        let artifacts = Artifacts {
            target_dir: Some(target.clone()),
            ..Default::default()
        };
        Ok(PhaseOutput::new(artifacts).with_compensation(RemoveDirectory { path: target }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = FileLayout::new("/srv/apps", "/srv/templates", "/srv/resources");
        assert_eq!(
            layout.target_dir("u1001", "novel123"),
            PathBuf::from("/srv/apps/u1001/novel123")
        );
        assert_eq!(
            layout.template_dir(Platform::Baidu),
            PathBuf::from("/srv/templates/baidu")
        );
        assert_eq!(
            layout.resource_dirs(Platform::Weixin),
            [
                PathBuf::from("/srv/resources/common"),
                PathBuf::from("/srv/resources/weixin")
            ]
        );
    }
}
