//! # Build Migrator
//!
//! The pipeline facade. It holds global settings; every stage may be called
//! with per-call settings layered on top of them.

use crate::builder::{BuildOutput, Builder};
use crate::context::ParserContext;
use crate::generator::{CmakeGenerator, GeneratedProject};
use crate::model::BuildObjectModel;
use crate::optimizers::OptimizerChain;
use crate::parsers::parse_log;
use crate::settings::{Settings, Stage};
use crate::{MigratorError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the saved model inside the output directory.
pub const MODEL_FILE_NAME: &str = "bom.json";

/// Runs the build, parse, optimize and generate stages.
#[derive(Debug, Clone, Default)]
pub struct BuildMigrator {
    settings: Settings,
}

impl BuildMigrator {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    fn effective(&self, overrides: Option<&Settings>) -> Result<Settings> {
        match overrides {
            Some(overrides) => self.settings.overlay(overrides),
            None => Ok(self.settings.clone()),
        }
    }

    fn out_dir(settings: &Settings) -> Result<PathBuf> {
        settings
            .out_dir
            .clone()
            .ok_or_else(|| MigratorError::InvalidSetting("--out_dir is required".to_string()))
    }

    /// Path of the saved model for the configured output directory.
    pub fn model_path(&self) -> Result<PathBuf> {
        Ok(Self::out_dir(&self.settings)?.join(MODEL_FILE_NAME))
    }

    /// Run the build commands and point the global `logs`/`build_dirs`
    /// settings at what they produced.
    pub fn build(&mut self, overrides: Option<&Settings>) -> Result<BuildOutput> {
        let settings = self.effective(overrides)?;
        let builder = Builder::new(&settings, &Self::out_dir(&settings)?)?;
        let output = builder.build()?;
        output.apply(&mut self.settings);
        Ok(output)
    }

    /// Parse every configured log, appending to `existing` when given.
    pub fn parse(
        &self,
        existing: Option<BuildObjectModel>,
        overrides: Option<&Settings>,
    ) -> Result<BuildObjectModel> {
        let settings = self.effective(overrides)?;
        let cwd = std::env::current_dir().map_err(|e| MigratorError::io(".", e))?;
        let mut ctx = ParserContext::new(&settings, &cwd.to_string_lossy())?;
        ctx.prepare(existing, &settings)?;
        for log in ctx.logs().to_vec() {
            parse_log(&mut ctx, &settings, &log)?;
        }
        ctx.finalize()?;
        let model = ctx.into_model();
        info!(targets = model.len(), "logs parsed");
        Ok(model)
    }

    pub fn optimize(&self, model: BuildObjectModel, overrides: Option<&Settings>) -> Result<BuildObjectModel> {
        let settings = self.effective(overrides)?;
        Ok(OptimizerChain::new(&settings)?.run(model))
    }

    /// Write the CMake project into the output directory.
    pub fn generate(&self, model: &BuildObjectModel, overrides: Option<&Settings>) -> Result<GeneratedProject> {
        let settings = self.effective(overrides)?;
        CmakeGenerator::new(&settings, Self::out_dir(&settings)?)?.generate(model)
    }

    pub fn save_model(&self, model: &BuildObjectModel, path: &Path) -> Result<()> {
        model.save(path)
    }

    pub fn load_model(&self, path: &Path) -> Result<BuildObjectModel> {
        BuildObjectModel::load(path)
    }

    /// Run the requested stages in order. A model saved by an earlier run is
    /// picked up, and the resulting model is saved back.
    pub fn run(&mut self) -> Result<BuildObjectModel> {
        self.run_with(None, None)
    }

    /// [`run`](Self::run) with the model read from `load` and written to
    /// `save` instead of `<out_dir>/bom.json`.
    pub fn run_with(&mut self, load: Option<&Path>, save: Option<&Path>) -> Result<BuildObjectModel> {
        let out_dir = Self::out_dir(&self.settings)?;
        std::fs::create_dir_all(&out_dir).map_err(|e| MigratorError::io(&out_dir, e))?;
        let default_path = out_dir.join(MODEL_FILE_NAME);
        let load_path = match load {
            Some(path) => Some(path.to_path_buf()),
            None => default_path.is_file().then(|| default_path.clone()),
        };
        let mut model = match load_path {
            Some(path) => Some(self.load_model(&path)?),
            None => None,
        };

        for stage in self.settings.stages() {
            info!(stage = ?stage, "running stage");
            match stage {
                Stage::Build if self.settings.commands.is_empty() && self.settings.build_commands.is_empty() => {
                    debug!("no build commands, build stage skipped");
                }
                Stage::Build => {
                    self.build(None)?;
                }
                Stage::Parse => model = Some(self.parse(model.take(), None)?),
                Stage::Optimize => model = Some(self.optimize(model.take().unwrap_or_default(), None)?),
                Stage::Generate => {
                    let current = model.take().unwrap_or_default();
                    self.generate(&current, None)?;
                    model = Some(current);
                }
            }
        }

        let model = model.unwrap_or_default();
        let save_path = save.map_or(default_path, Path::to_path_buf);
        self.save_model(&model, &save_path)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;

    #[test]
    fn test_out_dir_is_required() {
        let migrator = BuildMigrator::default();
        assert!(migrator.model_path().is_err());
        assert!(migrator.generate(&BuildObjectModel::default(), None).is_err());
    }

    #[test]
    fn test_overrides_layer_on_global_settings() {
        let migrator = BuildMigrator::new(Settings {
            cmake_project_name: Some("global".to_string()),
            platform: Some(Platform::Linux),
            ..Settings::default()
        });
        let overrides = Settings {
            cmake_project_name: Some("local".to_string()),
            ..Settings::default()
        };
        let settings = migrator.effective(Some(&overrides)).unwrap();
        assert_eq!(settings.cmake_project_name.as_deref(), Some("local"));
        assert_eq!(settings.platform, Some(Platform::Linux));
    }

    #[test]
    fn test_run_generate_only_saves_empty_model() {
        let out = tempfile::tempdir().unwrap();
        let mut migrator = BuildMigrator::new(Settings {
            commands: vec![Stage::Generate],
            out_dir: Some(out.path().to_path_buf()),
            platform: Some(Platform::Linux),
            ..Settings::default()
        });
        let model = migrator.run().unwrap();
        assert!(model.is_empty());
        assert!(out.path().join(MODEL_FILE_NAME).is_file());
        assert!(out.path().join("CMakeLists.txt").is_file());
    }

    #[test]
    fn test_run_with_explicit_model_paths() {
        let out = tempfile::tempdir().unwrap();
        let saved = out.path().join("saved.json");
        let mut migrator = BuildMigrator::new(Settings {
            commands: vec![Stage::Optimize],
            out_dir: Some(out.path().to_path_buf()),
            ..Settings::default()
        });
        migrator.run_with(None, Some(&saved)).unwrap();
        assert!(saved.is_file());
        assert!(!out.path().join(MODEL_FILE_NAME).exists());

        let loaded = migrator.run_with(Some(&saved), None).unwrap();
        assert!(loaded.is_empty());
        assert!(out.path().join(MODEL_FILE_NAME).is_file());
        assert!(migrator.run_with(Some(&out.path().join("missing.json")), None).is_err());
    }
}
