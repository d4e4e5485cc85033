//! # Optimizers
//!
//! Model to model rewrites applied between parsing and generation.
//!
//! Optimizers never see a partially rewritten model: each one reads the
//! current model and returns a new one. A failing optimizer is logged and
//! skipped, and the next one runs on the unchanged model.

mod file_content;
mod filter_flags;
mod order_by_dependency;
mod pass_sources;
mod remove_unused;

pub use file_content::{FileTargetChangeEncoding, FileTargetGsub, PathMask, TextEncoding};
pub use filter_flags::FilterFlags;
pub use order_by_dependency::OrderByDependency;
pub use pass_sources::PassSources;
pub use remove_unused::RemoveUnusedFilesAndDirectories;

use crate::Result;
use crate::model::BuildObjectModel;
use crate::settings::Settings;
use tracing::{debug, error};

/// A single model rewrite.
pub trait Optimizer {
    fn name(&self) -> &'static str;

    fn optimize(&self, model: &BuildObjectModel) -> Result<BuildObjectModel>;
}

// =============================================================================
// OPTIMIZER CHAIN
// =============================================================================

/// The fixed sequence of optimizers selected by settings.
pub struct OptimizerChain {
    optimizers: Vec<Box<dyn Optimizer>>,
    enabled: bool,
}

impl OptimizerChain {
    pub fn new(settings: &Settings) -> Result<Self> {
        let optimizers: Vec<Box<dyn Optimizer>> = vec![
            Box::new(RemoveUnusedFilesAndDirectories),
            Box::new(FilterFlags::new(
                &settings.keep_flags,
                &settings.delete_flags,
                &settings.replace_flags,
            )?),
            Box::new(FileTargetChangeEncoding::new(&settings.file_target_change_encodings)?),
            Box::new(PassSources),
            Box::new(FileTargetGsub::new(&settings.file_target_gsubs)?),
            Box::new(OrderByDependency),
        ];
        Ok(Self {
            optimizers,
            enabled: !settings.dont_optimize,
        })
    }

    /// A chain running exactly the given optimizers.
    #[must_use]
    pub fn from_optimizers(optimizers: Vec<Box<dyn Optimizer>>) -> Self {
        Self {
            optimizers,
            enabled: true,
        }
    }

    pub fn run(&self, model: BuildObjectModel) -> BuildObjectModel {
        if !self.enabled {
            debug!("optimizations disabled");
            return model;
        }
        let mut model = model;
        for optimizer in &self.optimizers {
            match optimizer.optimize(&model) {
                Ok(optimized) => {
                    if optimized != model {
                        debug!(optimizer = optimizer.name(), targets = optimized.len(), "model optimized");
                    }
                    model = optimized;
                }
                Err(e) => error!(optimizer = optimizer.name(), error = %e, "optimizer failed"),
            }
        }
        model
    }
}
