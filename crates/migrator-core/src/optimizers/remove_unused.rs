use super::Optimizer;
use crate::Result;
use crate::model::{BuildObjectModel, Target, TargetKind};
use std::collections::BTreeSet;

/// Drops captured files and created directories nothing else needs.
pub struct RemoveUnusedFilesAndDirectories;

fn is_passive(target: &Target) -> bool {
    matches!(target.kind, TargetKind::File(_) | TargetKind::Directory(_))
}

impl Optimizer for RemoveUnusedFilesAndDirectories {
    fn name(&self) -> &'static str {
        "remove_unused_files_and_directories"
    }

    fn optimize(&self, model: &BuildObjectModel) -> Result<BuildObjectModel> {
        let roots: Vec<&str> = model
            .targets
            .iter()
            .filter(|t| !is_passive(t))
            .map(Target::output)
            .collect();
        let used: BTreeSet<usize> = model.dependency_closure(roots).into_iter().collect();
        let targets = model
            .targets
            .iter()
            .enumerate()
            .filter(|(idx, t)| !is_passive(t) || t.top_level || used.contains(idx))
            .map(|(_, t)| t.clone())
            .collect();
        Ok(BuildObjectModel::new(targets))
    }
}
