//! Folds object libraries into the binaries that link them.
//!
//! An object file compiled from `a.c` and linked into `app` becomes a
//! source of `app`, carrying the object's compile flags and include
//! directories as per-source properties. Object libraries that something
//! else still needs on their own (top-level ones, unlinked ones, inputs of
//! commands) are left alone.

use super::Optimizer;
use crate::model::{BuildObjectModel, Module, ModuleType, Target, TargetKind, output_index, unique_concat};
use crate::{MigratorError, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub struct PassSources;

fn is_object_lib(target: &Target) -> bool {
    target
        .as_module()
        .is_some_and(|m| m.module_type == ModuleType::ObjectLib)
}

struct Lookup<'a> {
    targets: &'a [Target],
    index: BTreeMap<String, usize>,
}

impl<'a> Lookup<'a> {
    fn new(targets: &'a [Target]) -> Self {
        Self {
            targets,
            index: output_index(targets),
        }
    }

    fn get(&self, output: &str) -> Option<&'a Target> {
        self.index.get(output).map(|&idx| &self.targets[idx])
    }

    /// Follow `module_copy` targets back to the module they copy.
    fn final_copy_source(&self, target: &'a Target) -> Option<&'a Target> {
        let mut current = target;
        for _ in 0..=self.targets.len() {
            let TargetKind::ModuleCopy(copy) = &current.kind else {
                return Some(current);
            };
            current = self.get(&copy.source)?;
        }
        None
    }

    /// Object libraries that must survive as targets of their own.
    fn kept_object_libs(&self) -> BTreeSet<String> {
        let referenced: BTreeSet<&str> = self
            .targets
            .iter()
            .flat_map(|t| t.dependencies().iter().map(String::as_str))
            .collect();

        let mut kept = BTreeSet::new();
        for target in self.targets {
            if is_object_lib(target) {
                let output = target.output();
                if target.top_level || !referenced.contains(output) {
                    kept.insert(output.to_string());
                }
                continue;
            }

            let (by_command, dependencies) = match &target.kind {
                TargetKind::Cmd(command) => (true, command.dependencies.clone()),
                _ => (false, vec![target.output().to_string()]),
            };
            for dep in &dependencies {
                let mut current = self.get(dep);
                let mut by_top_level_copy = false;
                let mut hops = 0;
                while let Some(link) = current {
                    let TargetKind::ModuleCopy(copy) = &link.kind else {
                        break;
                    };
                    by_top_level_copy |= link.top_level;
                    hops += 1;
                    current = if hops > self.targets.len() { None } else { self.get(&copy.source) };
                }
                let Some(object) = current.filter(|t| is_object_lib(t)) else {
                    continue;
                };
                if by_top_level_copy || by_command {
                    kept.insert(object.output().to_string());
                }
            }
        }
        kept
    }

    /// Module copies that must survive: top-level ones and command inputs.
    fn kept_module_copies(&self) -> BTreeSet<String> {
        let mut kept = BTreeSet::new();
        for target in self.targets {
            match &target.kind {
                TargetKind::ModuleCopy(copy) if target.top_level => {
                    kept.insert(copy.output.clone());
                }
                TargetKind::Cmd(command) => {
                    for dep in &command.dependencies {
                        if let Some(copy) = self.get(dep).filter(|t| matches!(t.kind, TargetKind::ModuleCopy(_))) {
                            kept.insert(copy.output().to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        kept
    }

    /// Merge the sources of every foldable object into `module`.
    fn merge_objects(&self, module: &mut Module, kept: &BTreeSet<String>) {
        let mut remaining = Vec::new();
        let mut own_flags_moved = false;
        for object in std::mem::take(&mut module.objects) {
            let Some(dep) = self.get(&object) else {
                remaining.push(object);
                continue;
            };
            if kept.contains(dep.output()) || matches!(dep.kind, TargetKind::File(_) | TargetKind::Cmd(_)) {
                remaining.push(object);
                continue;
            }
            let Some(child) = self
                .final_copy_source(dep)
                .filter(|t| is_object_lib(t))
                .and_then(Target::as_module)
            else {
                remaining.push(object);
                continue;
            };
            module.dependencies.retain(|d| *d != object);

            // the module's own flags now belong to its own sources only
            if !own_flags_moved {
                let flags = std::mem::take(&mut module.compile_flags);
                let dirs = std::mem::take(&mut module.include_dirs);
                for source in module.sources.iter_mut().filter(|s| s.language.is_some()) {
                    source.compile_flags = unique_concat(&flags, &source.compile_flags);
                    source.include_dirs = unique_concat(&dirs, &source.include_dirs);
                }
                own_flags_moved = true;
            }

            let command_deps: Vec<String> = child
                .dependencies
                .iter()
                .filter(|d| self.get(d).is_some_and(|t| matches!(t.kind, TargetKind::Cmd(_))))
                .cloned()
                .collect();
            for source in &child.sources {
                let mut source = child.inherited_source(source);
                source.dependencies = unique_concat(&command_deps, &source.dependencies);
                module.sources.push(source);
            }

            // object output directories go, include directories stay
            let dependencies: Vec<String> = child
                .dependencies
                .iter()
                .filter(|d| !command_deps.contains(d))
                .filter(|d| {
                    !self
                        .get(d)
                        .is_some_and(|t| t.is_directory() && !child.include_dirs.contains(d))
                })
                .cloned()
                .collect();
            module.dependencies = unique_concat(&module.dependencies, &dependencies);
            debug!(object = %object, module = %module.output, "object library merged");
        }
        module.objects = remaining;
    }

    /// Point libraries linked through module copies at the copied module.
    fn resolve_copied_libs(&self, module: &mut Module) {
        for lib in &mut module.libs {
            let Some(dep) = self.get(&lib.value) else {
                continue;
            };
            if !matches!(dep.kind, TargetKind::ModuleCopy(_)) {
                continue;
            }
            let Some(source) = self.final_copy_source(dep) else {
                continue;
            };
            let source_output = source.output().to_string();
            if source_output != lib.value {
                module.dependencies.retain(|d| *d != lib.value);
                module.dependencies.push(source_output.clone());
                lib.value = source_output;
            }
        }
    }
}

impl Optimizer for PassSources {
    fn name(&self) -> &'static str {
        "pass_sources"
    }

    fn optimize(&self, model: &BuildObjectModel) -> Result<BuildObjectModel> {
        let lookup = Lookup::new(&model.targets);
        let mut kept = lookup.kept_module_copies();
        kept.extend(lookup.kept_object_libs());

        let mut optimized = Vec::with_capacity(model.targets.len());
        for target in &model.targets {
            match &target.kind {
                TargetKind::ModuleCopy(copy) => {
                    if !kept.contains(&copy.output) {
                        continue;
                    }
                    let mut copy = copy.clone();
                    let source = lookup.final_copy_source(target).map(|t| t.output().to_string());
                    if let Some(source) = source.filter(|s| *s != copy.source) {
                        copy.dependencies.retain(|d| *d != copy.source);
                        copy.dependencies.push(source.clone());
                        copy.source = source;
                    }
                    optimized.push(Target {
                        kind: TargetKind::ModuleCopy(copy),
                        top_level: target.top_level,
                    });
                }
                TargetKind::Module(module) if module.module_type == ModuleType::ObjectLib => {
                    if kept.contains(&module.output) {
                        optimized.push(target.clone());
                    }
                }
                TargetKind::Module(module) => {
                    let mut module = module.clone();
                    lookup.merge_objects(&mut module, &kept);
                    lookup.resolve_copied_libs(&mut module);
                    optimized.push(Target {
                        kind: TargetKind::Module(module),
                        top_level: target.top_level,
                    });
                }
                _ => optimized.push(target.clone()),
            }
        }

        // module copies whose module was folded away go too
        let index = output_index(&optimized);
        let mut result = Vec::with_capacity(optimized.len());
        for target in optimized {
            let orphan = match &target.kind {
                TargetKind::ModuleCopy(copy) if !index.contains_key(&copy.source) => Some(copy),
                _ => None,
            };
            let Some(copy) = orphan else {
                result.push(target);
                continue;
            };
            if target.top_level {
                return Err(MigratorError::TargetNotFound(format!(
                    "{} (source of top-level copy {})",
                    copy.source, copy.output
                )));
            }
            debug!(output = %copy.output, "module copy without source removed");
        }
        Ok(BuildObjectModel::new(result))
    }
}
