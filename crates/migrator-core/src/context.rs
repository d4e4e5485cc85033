//! # Parser Context
//!
//! Shared state of a parse run: where the sources and build trees live, the
//! current working directory of the log, and every target registered so far.
//!
//! The context owns path relocation. Every path a parser sees is turned into
//! a relocatable path (`@build_dir@/obj/a.o`) here, and files referenced
//! under the source or build tree are captured as `file` targets on the way.

use crate::model::{
    BUILD_DIR_PLACEHOLDER, BuildObjectModel, CopyTarget, Directory, FileTarget, ModuleCopy,
    ModuleType, SOURCE_DIR_PLACEHOLDER, SourceFile, Target, TargetKind, Variable, output_index,
};
use crate::paths;
use crate::platform::Platform;
use crate::settings::Settings;
use crate::{MigratorError, Result};
use globset::{Glob, GlobBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

// =============================================================================
// LOG SPECS
// =============================================================================

/// Kind of build log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Make,
    Ninja,
}

impl FromStr for LogType {
    type Err = MigratorError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "make" => Ok(Self::Make),
            "ninja" => Ok(Self::Ninja),
            "msbuild" | "strace" => Err(MigratorError::InvalidSetting(format!(
                "log type '{value}' is not supported"
            ))),
            other => Err(MigratorError::InvalidSetting(format!(
                "unknown log type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Make => "make",
            Self::Ninja => "ninja",
        })
    }
}

/// A `[TYPE:]PATH` log argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSpec {
    pub path: String,
    pub log_type: LogType,
}

impl LogSpec {
    const KNOWN_TYPES: [&'static str; 4] = ["make", "ninja", "msbuild", "strace"];

    /// Parse `make:build.log` or `build.log` (with `default_type`).
    pub fn parse(value: &str, default_type: Option<&str>) -> Result<Self> {
        if let Some((prefix, path)) = value.split_once(':') {
            if Self::KNOWN_TYPES.contains(&prefix) {
                return Ok(Self {
                    path: path.to_string(),
                    log_type: prefix.parse()?,
                });
            }
        }
        let Some(default_type) = default_type else {
            return Err(MigratorError::InvalidSetting(format!(
                "log type is not specified for {value}"
            )));
        };
        Ok(Self {
            path: value.to_string(),
            log_type: default_type.parse()?,
        })
    }
}

// =============================================================================
// DEPENDENCIES
// =============================================================================

/// Dependencies collected while a parser resolves paths.
///
/// `outputs` are what the new target depends on. `inline` holds targets
/// discovered on the way (captured files, created directories) that are
/// registered together with the new target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    outputs: Vec<String>,
    inline: Vec<Target>,
}

impl Dependencies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Depend on an output, once.
    pub fn push(&mut self, output: impl Into<String>) {
        let output = output.into();
        if !self.outputs.contains(&output) {
            self.outputs.push(output);
        }
    }

    /// Depend on a target that still has to be registered.
    pub fn push_inline(&mut self, target: Target) {
        self.push(target.output().to_string());
        self.adopt(target);
    }

    /// Carry a target for registration without depending on it.
    fn adopt(&mut self, target: Target) {
        if !self.inline.iter().any(|t| t.output() == target.output()) {
            self.inline.push(target);
        }
    }

    pub fn extend(&mut self, other: Dependencies) {
        for output in other.outputs {
            self.push(output);
        }
        for target in other.inline {
            self.adopt(target);
        }
    }

    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.inline.is_empty()
    }

    /// Split into the dependency outputs and the targets to register.
    #[must_use]
    pub fn into_parts(self) -> (Vec<String>, Vec<Target>) {
        (self.outputs, self.inline)
    }
}

/// A target produced by a parser, with the inline targets it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTarget {
    pub target: Target,
    pub inline: Vec<Target>,
}

impl PendingTarget {
    /// Attach collected dependencies to `target`.
    #[must_use]
    pub fn new(mut target: Target, dependencies: Dependencies) -> Self {
        let (outputs, inline) = dependencies.into_parts();
        let own = target.output().to_string();
        let deps = target.dependencies_mut();
        for output in outputs {
            if !deps.contains(&output) && output != own {
                deps.push(output);
            }
        }
        Self { target, inline }
    }

    #[must_use]
    pub fn output(&self) -> &str {
        self.target.output()
    }
}

/// What to capture while relocating a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Nothing,
    ParentDir,
    Dir,
    File,
}

// =============================================================================
// CONTEXT
// =============================================================================

/// State shared by all log parsers during one parse run.
#[derive(Debug)]
pub struct ParserContext {
    platform: Platform,
    logs: Vec<LogSpec>,
    source_dir: String,
    build_dirs: Vec<String>,
    /// Absolute directory -> placeholder, source dir first.
    dir_mapping: Vec<(String, &'static str)>,
    working_dir: String,
    entry_working_dir: Option<String>,
    max_relpath_level: Option<usize>,
    path_aliases: Vec<(String, String)>,
    variables: BTreeSet<String>,
    force_target_name: BTreeMap<String, String>,
    required_targets: Vec<String>,
    capture_sources: bool,
    targets: Vec<Target>,
    index: BTreeMap<String, usize>,
}

impl ParserContext {
    /// Create a context from settings. Relative directories are resolved
    /// against `cwd`.
    pub fn new(settings: &Settings, cwd: &str) -> Result<Self> {
        let platform = settings.platform();
        if settings.logs.is_empty() {
            return Err(MigratorError::InvalidSetting(
                "specify at least one log (--logs)".to_string(),
            ));
        }
        if !settings.capture_sources.is_empty() && settings.dont_capture_sources {
            return Err(MigratorError::InvalidSetting(
                "--capture_sources cannot be combined with --dont_capture_sources".to_string(),
            ));
        }
        let Some(source_dir) = settings.source_dir.as_deref() else {
            return Err(MigratorError::InvalidSetting(
                "--source_dir is required for parsing".to_string(),
            ));
        };
        if settings.build_dirs.is_empty() {
            return Err(MigratorError::InvalidSetting(
                "--build_dirs is required for parsing".to_string(),
            ));
        }

        let absolute = |path: &str| platform.normalize_path(&platform.path_join(cwd, path));
        let logs = settings
            .logs
            .iter()
            .map(|log| LogSpec::parse(log, settings.log_type.as_deref()))
            .collect::<Result<Vec<_>>>()?;
        let source_dir = absolute(source_dir);
        let build_dirs: Vec<String> = settings.build_dirs.iter().map(|d| absolute(d)).collect();

        let mut dir_mapping = vec![(source_dir.clone(), SOURCE_DIR_PLACEHOLDER)];
        for build_dir in &build_dirs {
            if *build_dir == source_dir {
                return Err(MigratorError::InvalidSetting(
                    "source dir cannot be the same as build directory".to_string(),
                ));
            }
            dir_mapping.push((build_dir.clone(), BUILD_DIR_PLACEHOLDER));
        }

        let working_dir = match settings.working_dir.as_deref() {
            Some(dir) => absolute(dir),
            None => build_dirs[0].clone(),
        };

        Ok(Self {
            platform,
            logs,
            source_dir,
            build_dirs,
            dir_mapping,
            working_dir,
            entry_working_dir: None,
            max_relpath_level: settings.max_relpath_level(),
            path_aliases: Vec::new(),
            variables: BTreeSet::new(),
            force_target_name: settings.force_target_name.iter().cloned().collect(),
            required_targets: settings.targets.clone(),
            capture_sources: !settings.dont_capture_sources,
            targets: Vec::new(),
            index: BTreeMap::new(),
        })
    }

    /// Start from an existing model (parse appends to it) and apply the
    /// aliases and explicit source captures from settings.
    pub fn prepare(&mut self, existing: Option<BuildObjectModel>, settings: &Settings) -> Result<()> {
        if let Some(model) = existing {
            self.targets = model.targets;
            self.rebuild_index();
        }

        for (path, alias) in &settings.path_aliases {
            let alias = if is_variable_placeholder(alias) {
                if !self.index.contains_key(alias) {
                    let full = self.normalize_path(path);
                    let value = self.relocate(&full);
                    let variable = Variable {
                        name: alias.trim_matches('@').to_string(),
                        placeholder: alias.clone(),
                        value,
                        dependencies: Vec::new(),
                    };
                    self.register(PendingTarget::new(
                        Target::from(TargetKind::Variable(variable)),
                        Dependencies::new(),
                    ));
                }
                alias.clone()
            } else {
                self.platform.normalize_path(alias)
            };
            let path = self.normalize_path(path);
            self.path_aliases.push((path, alias));
        }

        if !settings.capture_sources.is_empty() {
            for pattern in &settings.capture_sources {
                let files = self.list_files(&self.source_dir.clone(), Some(pattern))?;
                if files.is_empty() {
                    return Err(MigratorError::InvalidSetting(format!(
                        "pattern did not match any source files: {pattern}"
                    )));
                }
                for file in files {
                    let relocatable = self.relocate(&file);
                    if !self.is_in_source_dir(&relocatable) {
                        return Err(MigratorError::InvalidSetting(format!(
                            "file is not in source directory: {file}"
                        )));
                    }
                    let mut deps = Dependencies::new();
                    self.capture_file(&file, &relocatable, Some(true), &mut deps);
                    let (_, inline) = deps.into_parts();
                    for target in inline {
                        self.register(PendingTarget::new(target, Dependencies::new()));
                    }
                }
            }
            self.capture_sources = false;
        }
        Ok(())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn platform(&self) -> Platform {
        self.platform
    }

    #[must_use]
    pub fn logs(&self) -> &[LogSpec] {
        &self.logs
    }

    #[must_use]
    pub fn source_dir(&self) -> &str {
        &self.source_dir
    }

    #[must_use]
    pub fn build_dirs(&self) -> &[String] {
        &self.build_dirs
    }

    /// Working directory of the entry being parsed.
    #[must_use]
    pub fn working_dir(&self) -> &str {
        self.entry_working_dir.as_deref().unwrap_or(&self.working_dir)
    }

    /// Change the log-level working directory (make's `Entering directory`).
    pub fn set_working_dir(&mut self, dir: &str) {
        self.working_dir = self.platform.normalize_path(dir);
    }

    /// Working directory carried by the entry currently in the parser chain.
    pub fn set_entry_working_dir(&mut self, dir: Option<&str>) {
        self.entry_working_dir = dir.map(|d| self.platform.normalize_path(d));
    }

    #[must_use]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    #[must_use]
    pub fn find_target(&self, output: &str) -> Option<&Target> {
        self.index.get(output).map(|&idx| &self.targets[idx])
    }

    /// Mutable access for parsers that build a target over several lines.
    pub fn find_target_mut(&mut self, output: &str) -> Option<&mut Target> {
        let idx = *self.index.get(output)?;
        self.targets.get_mut(idx)
    }

    /// Find a target by a log path (relative to the working directory).
    #[must_use]
    pub fn find_target_by_path(&self, path: &str) -> Option<&Target> {
        let full = self.normalize_path(path);
        self.find_target(&self.relocate(&full))
    }

    #[must_use]
    pub fn is_in_source_dir(&self, relocatable: &str) -> bool {
        relocatable.starts_with(SOURCE_DIR_PLACEHOLDER)
    }

    #[must_use]
    pub fn is_in_build_dir(&self, relocatable: &str) -> bool {
        relocatable.starts_with(BUILD_DIR_PLACEHOLDER)
    }

    /// Consume the context into a model.
    #[must_use]
    pub fn into_model(self) -> BuildObjectModel {
        BuildObjectModel::new(self.targets)
    }

    // =========================================================================
    // PATH RELOCATION
    // =========================================================================

    /// Absolute, normalized form of a log path.
    #[must_use]
    pub fn normalize_path(&self, path: &str) -> String {
        self.platform
            .normalize_path(&self.platform.path_join(self.working_dir(), path))
    }

    /// Relocatable form of an absolute path. Paths outside the source and
    /// build trees stay absolute.
    #[must_use]
    pub fn relocate(&self, full: &str) -> String {
        self.try_relocate(full).unwrap_or_else(|| full.to_string())
    }

    fn try_relocate(&self, full: &str) -> Option<String> {
        if let Some(aliased) = self.apply_path_aliases(full) {
            return Some(aliased);
        }
        let dirs = self.dir_mapping.iter().map(|(dir, _)| dir.as_str());
        let (dir, rel) = paths::closest_dir(full, dirs, self.max_relpath_level)?;
        let placeholder = self
            .dir_mapping
            .iter()
            .find(|(d, _)| d == dir)
            .map(|(_, p)| *p)?;
        if rel == "." {
            Some(placeholder.to_string())
        } else {
            Some(format!("{placeholder}/{rel}"))
        }
    }

    fn apply_path_aliases(&self, full: &str) -> Option<String> {
        self.path_aliases.iter().find_map(|(src, dest)| {
            let rest = full.strip_prefix(src.as_str())?;
            (rest.is_empty() || rest.starts_with('/')).then(|| format!("{dest}{rest}"))
        })
    }

    fn construct_path_arg(&self, path: &str, capture: Capture, deps: &mut Dependencies) -> String {
        let full = self.normalize_path(path);
        let Some(relocatable) = self.try_relocate(&full) else {
            warn!(path = %full, "path not under source or build directory");
            if self.index.contains_key(&full) {
                deps.push(full.clone());
            }
            return full;
        };

        for variable in &self.variables {
            if relocatable.contains(variable.as_str()) {
                deps.push(variable.clone());
            }
        }
        match capture {
            Capture::Nothing => {}
            Capture::ParentDir => {
                let parent_full = paths::dirname(&full).to_string();
                let parent = self.relocate(&parent_full);
                self.capture_directory(&parent, deps);
            }
            Capture::Dir => self.capture_directory(&relocatable, deps),
            Capture::File => self.capture_file(&full, &relocatable, None, deps),
        }
        relocatable
    }

    /// Relocate a file argument, capturing its content when it lives in
    /// the source or build tree.
    pub fn file_arg(&self, path: &str, deps: &mut Dependencies) -> String {
        self.construct_path_arg(path, Capture::File, deps)
    }

    /// Relocate a directory argument (include dirs, lib dirs).
    pub fn dir_arg(&self, path: &str, deps: &mut Dependencies) -> String {
        self.construct_path_arg(path, Capture::Dir, deps)
    }

    /// Relocate an output path; its parent directory becomes a dependency.
    pub fn output_arg(&self, path: &str, deps: &mut Dependencies) -> String {
        self.construct_path_arg(path, Capture::ParentDir, deps)
    }

    /// Relocate a path without capturing anything.
    pub fn path_arg(&self, path: &str) -> String {
        let mut ignored = Dependencies::new();
        self.construct_path_arg(path, Capture::Nothing, &mut ignored)
    }

    /// Resolve `-l<lib>` against registered targets, then the filesystem.
    /// Unresolved names are returned unchanged (system libraries).
    pub fn lib_arg(
        &self,
        lib: &str,
        lib_dirs: &[String],
        static_only: bool,
        deps: &mut Dependencies,
    ) -> String {
        let cwd = self.working_dir().to_string();
        let registered = |path: &str| self.find_target_by_path(path).is_some();
        let on_disk = |path: &str| std::path::Path::new(path).is_file();
        let resolved = self
            .platform
            .resolve_lib(lib, lib_dirs, &cwd, static_only, &registered)
            .or_else(|| {
                self.platform
                    .resolve_lib(lib, lib_dirs, &cwd, static_only, &on_disk)
            });
        let Some(full) = resolved else {
            return lib.to_string();
        };
        let argument = self.file_arg(&full, deps);
        match self.find_target(&argument) {
            // an import library resolves to the module that produced it
            Some(target) if target.output() != argument => target.output().to_string(),
            _ => argument,
        }
    }

    fn capture_directory(&self, relocatable: &str, deps: &mut Dependencies) {
        if self.index.contains_key(relocatable) {
            deps.push(relocatable);
            return;
        }
        if let Some(variable) = self.leading_variable(relocatable) {
            deps.push(variable);
            return;
        }
        if self.is_in_source_dir(relocatable) || relocatable == BUILD_DIR_PLACEHOLDER {
            return;
        }
        if !self.is_in_build_dir(relocatable) {
            debug!(path = relocatable, "directory not under build dir, ignoring");
            return;
        }
        deps.push_inline(Target::from(TargetKind::Directory(Directory {
            output: relocatable.to_string(),
            dependencies: Vec::new(),
        })));
    }

    fn leading_variable(&self, relocatable: &str) -> Option<String> {
        let rest = relocatable.strip_prefix('@')?;
        let end = rest.find('@')?;
        let placeholder = format!("@{}@", &rest[..end]);
        self.variables.contains(&placeholder).then_some(placeholder)
    }

    fn capture_file(
        &self,
        full: &str,
        relocatable: &str,
        capture_source: Option<bool>,
        deps: &mut Dependencies,
    ) {
        if self.index.contains_key(relocatable) {
            deps.push(relocatable);
            return;
        }
        if self.is_in_source_dir(relocatable) {
            if !capture_source.unwrap_or(self.capture_sources) {
                deps.push(relocatable);
                return;
            }
        } else if !self.is_in_build_dir(relocatable) {
            debug!(path = full, "file not under build or source dir, ignoring");
            return;
        }

        let content = match std::fs::read(full) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = full, error = %e, "file cannot be captured");
                deps.push(relocatable);
                return;
            }
        };

        let mut parent_deps = Dependencies::new();
        let parent = self.relocate(paths::dirname(full));
        self.capture_directory(&parent, &mut parent_deps);
        let (parent_outputs, parent_inline) = parent_deps.into_parts();
        for target in parent_inline {
            deps.adopt(target);
        }
        deps.push_inline(Target::from(TargetKind::File(FileTarget {
            output: relocatable.to_string(),
            content,
            dependencies: parent_outputs,
        })));
    }

    // =========================================================================
    // COPIES
    // =========================================================================

    /// Describe `source -> output` as a module copy, a directory clone or a
    /// plain file copy.
    pub fn process_target_copy(
        &mut self,
        source: &str,
        output: &str,
        deps: Dependencies,
    ) -> Option<PendingTarget> {
        if source == output {
            return None;
        }
        let source_kind = self.find_target(source).map(|t| t.kind.clone());
        let target = match source_kind {
            Some(TargetKind::Module(_) | TargetKind::ModuleCopy(_)) => {
                let name = self.module_copy_name(output);
                TargetKind::ModuleCopy(ModuleCopy {
                    name,
                    module_name: None,
                    source: source.to_string(),
                    output: output.to_string(),
                    dependencies: Vec::new(),
                })
            }
            Some(TargetKind::Directory(dir)) => TargetKind::Directory(Directory {
                output: output.to_string(),
                dependencies: dir.dependencies,
            }),
            _ => TargetKind::Copy(CopyTarget {
                name: String::new(),
                source: source.to_string(),
                output: output.to_string(),
                dependencies: Vec::new(),
            }),
        };
        let mut deps = deps;
        deps.push(source);
        Some(PendingTarget::new(Target::from(target), deps))
    }

    /// Name for a copied module. Clashing names get version suffixes.
    fn module_copy_name(&mut self, output: &str) -> String {
        let platform = self.platform;
        let naming = if platform.is_static_lib(output) {
            platform.parse_static_lib(output)
        } else if platform.is_shared_lib(output) {
            platform.parse_shared_lib(output)
        } else {
            platform.parse_executable(output)
        };
        let Some(naming) = naming else {
            return String::new();
        };
        let mut name = naming.target_name;

        let Some(conflict) = self
            .targets
            .iter()
            .position(|t| t.name() == Some(name.as_str()))
        else {
            return name;
        };
        let conflict_output = self.targets[conflict].output().to_string();
        if paths::basename(&conflict_output) == paths::basename(output) {
            // same file in another directory: the general naming rule applies
            return String::new();
        }
        if let Some(version) = platform
            .parse_shared_lib(&conflict_output)
            .and_then(|n| n.version)
        {
            let renamed = format!("{name}.{version}");
            self.targets[conflict].set_name(renamed);
        }
        if let Some(version) = naming.version {
            name = format!("{name}.{version}");
        }
        name
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    /// Add a target and its inline dependencies. Returns the outputs that
    /// were actually registered.
    pub fn register(&mut self, pending: PendingTarget) -> Vec<String> {
        let PendingTarget { mut target, inline } = pending;
        let mut registered = Vec::new();
        let output = target.output().to_string();

        if let Some(&existing_idx) = self.index.get(&output) {
            let existing = &self.targets[existing_idx];
            if *existing == target {
                return registered;
            }
            if existing.is_file() && !target.is_file() {
                warn!(output = %output, "replacing captured file with a produced target");
                self.targets.remove(existing_idx);
                self.rebuild_index();
            } else if is_object_lib(existing) && is_object_lib(&target) {
                self.move_aside(existing_idx);
            } else {
                error!(
                    output = %output,
                    existing = existing.type_name(),
                    new = target.type_name(),
                    "output already registered with a different definition"
                );
                return registered;
            }
        }

        if target.is_named() {
            let name = self.target_name(&target);
            target.set_name(name);
        }
        if let TargetKind::Cmd(cmd) = &mut target.kind {
            if let Some(dir) = cmd.working_dir.take() {
                let mut ignored = Dependencies::new();
                cmd.working_dir = Some(self.construct_path_arg(&dir, Capture::Nothing, &mut ignored));
            }
        }

        info!(output = %output, kind = target.type_name(), "registering target");
        if let TargetKind::Variable(variable) = &target.kind {
            self.variables.insert(variable.placeholder.clone());
        }
        let idx = self.targets.len();
        for out in target.outputs() {
            self.index.insert(out.to_string(), idx);
        }
        self.targets.push(target);
        registered.push(output);

        for dep in inline {
            registered.extend(self.register(PendingTarget::new(dep, Dependencies::new())));
        }
        registered
    }

    /// Rename an object library's output to `output#N`, updating references.
    fn move_aside(&mut self, idx: usize) {
        let old = self.targets[idx].output().to_string();
        let mut n = 1;
        while self.index.contains_key(&format!("{old}#{n}")) {
            n += 1;
        }
        let new = format!("{old}#{n}");
        debug!(from = %old, to = %new, "object library output moved aside");
        for target in &mut self.targets {
            for dep in target.dependencies_mut() {
                if *dep == old {
                    dep.clone_from(&new);
                }
            }
            if let Some(module) = target.as_module_mut() {
                for object in &mut module.objects {
                    if *object == old {
                        object.clone_from(&new);
                    }
                }
            }
        }
        self.targets[idx].set_output(new);
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.index = output_index(&self.targets);
        self.variables = self
            .targets
            .iter()
            .filter_map(|t| match &t.kind {
                TargetKind::Variable(v) => Some(v.placeholder.clone()),
                _ => None,
            })
            .collect();
    }

    /// Forced name, given name, or a name derived from the output path.
    fn target_name(&self, target: &Target) -> String {
        let output = target.output();
        if let Some(forced) = self.force_target_name.get(output) {
            return forced.clone();
        }
        if let Some(name) = target.name() {
            return name.to_string();
        }
        let mut name = match output.rfind('@') {
            Some(idx) => output.get(idx + 2..).unwrap_or_default().to_string(),
            None => output.trim_start_matches('/').to_string(),
        };
        if name.is_empty() {
            name = paths::basename(output).to_string();
        }
        if target
            .as_module()
            .is_some_and(|m| m.module_type == ModuleType::ObjectLib)
        {
            let (stem, ext) = paths::split_ext(&name);
            if ext != ".o" {
                name = format!("{stem}.o");
            }
        }
        name.replace(['/', '.'], "_")
    }

    // =========================================================================
    // IMPLICIT INCLUDE DIRECTORIES
    // =========================================================================

    /// Directories of `sources` needed to find header dependencies that no
    /// include dir covers (quoted includes resolve next to the source).
    #[must_use]
    pub fn implicit_include_dirs(
        &self,
        sources: &[SourceFile],
        include_dirs: &[String],
        dependencies: &[String],
    ) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();
        for dep in dependencies {
            let ext = paths::split_ext(dep).1;
            if !matches!(ext, ".h" | ".hpp" | ".inc" | ".ipp")
                || !(self.is_in_build_dir(dep) || self.is_in_source_dir(dep))
            {
                continue;
            }
            let dep_dir = paths::dirname(dep);
            if include_dirs.iter().any(|dir| paths::is_subpath(dep_dir, dir)) {
                continue;
            }
            for source in sources {
                let source_dir = paths::dirname(&source.path).to_string();
                if !include_dirs.contains(&source_dir) && !result.contains(&source_dir) {
                    result.push(source_dir);
                }
            }
        }
        result
    }

    // =========================================================================
    // FINALIZATION
    // =========================================================================

    /// Select required targets, make names unique and check outputs.
    pub fn finalize(&mut self) -> Result<()> {
        self.provide_required_targets()?;
        deduplicate_target_names(&mut self.targets);
        check_target_outputs(&self.targets)?;
        Ok(())
    }

    fn provide_required_targets(&mut self) -> Result<()> {
        if self.required_targets.is_empty() {
            return Ok(());
        }

        let mut keys: Vec<String> = Vec::new();
        for key in self.required_targets.clone() {
            let mut found = false;
            for build_dir in self.build_dirs.clone() {
                for path in self.list_files(&build_dir, Some(&key))? {
                    found = true;
                    let relocatable = self.relocate(&path);
                    if !keys.contains(&relocatable) {
                        keys.push(relocatable);
                    }
                }
            }
            if !found && !keys.contains(&key) {
                keys.push(key);
            }
        }

        for key in keys {
            let roots = self.match_required(&key)?;
            for idx in roots {
                self.targets[idx].top_level = true;
            }
        }

        let model = BuildObjectModel::new(std::mem::take(&mut self.targets));
        self.targets = model.filter_top_level().targets;
        self.rebuild_index();
        Ok(())
    }

    /// Indices of targets matching a `--targets` value, registering files
    /// from disk when nothing in the model matches.
    fn match_required(&mut self, key: &str) -> Result<Vec<usize>> {
        let by_name: Vec<usize> = self
            .targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.name() == Some(key))
            .map(|(idx, _)| idx)
            .collect();
        if !by_name.is_empty() {
            return Ok(by_name);
        }
        if let Some(&idx) = self.index.get(key) {
            return Ok(vec![idx]);
        }
        let output = self.path_arg(key);
        if let Some(&idx) = self.index.get(&output) {
            return Ok(vec![idx]);
        }

        if key.contains('*') {
            let name_glob = Glob::new(paths::basename(key))?.compile_matcher();
            let recursive = !key.contains('/') && !key.contains('\\');
            let dir_glob = GlobBuilder::new(paths::dirname(&output))
                .literal_separator(true)
                .build()?
                .compile_matcher();
            let found: Vec<usize> = self
                .targets
                .iter()
                .enumerate()
                .filter(|(_, t)| {
                    let out = t.output();
                    name_glob.is_match(paths::basename(out))
                        && (recursive || dir_glob.is_match(paths::dirname(out)))
                })
                .map(|(idx, _)| idx)
                .collect();
            if found.is_empty() {
                return Err(MigratorError::TargetNotFound(format!(
                    "{key} (paths are evaluated relative to the build directory)"
                )));
            }
            return Ok(found);
        }

        // a file or directory that exists on disk but was never referenced
        for (dir, placeholder) in self.dir_mapping.clone() {
            let full = self.normalize_path(&key.replace(placeholder, &dir));
            let path = std::path::Path::new(&full);
            if !path.exists() {
                continue;
            }
            let files = if path.is_dir() {
                self.list_files(&full, None)?
            } else {
                vec![full.clone()]
            };
            let mut deps = Dependencies::new();
            for file in &files {
                let relocatable = self.relocate(file);
                self.capture_file(file, &relocatable, None, &mut deps);
            }
            let (outputs, inline) = deps.into_parts();
            for target in inline {
                self.register(PendingTarget::new(target, Dependencies::new()));
            }
            return Ok(outputs
                .iter()
                .filter_map(|o| self.index.get(o).copied())
                .collect());
        }
        Err(MigratorError::TargetNotFound(format!(
            "{key} (paths are evaluated relative to the build directory)"
        )))
    }

    /// Files under `dir` matching `pattern`. A bare filename glob matches
    /// recursively; other globs match full paths.
    fn list_files(&self, dir: &str, pattern: Option<&str>) -> Result<Vec<String>> {
        let pattern = pattern.unwrap_or("*");
        let joined = self
            .platform
            .normalize_path(&self.platform.path_join(dir, pattern));
        if !pattern.contains('*') {
            return Ok(if std::path::Path::new(&joined).exists() {
                vec![joined]
            } else {
                Vec::new()
            });
        }

        let recursive = !pattern.contains('/') && !pattern.contains('\\');
        let (root, matcher) = if recursive {
            (dir.to_string(), Glob::new(pattern)?.compile_matcher())
        } else {
            let root = glob_root(&joined);
            let matcher = GlobBuilder::new(&joined)
                .literal_separator(true)
                .build()?
                .compile_matcher();
            (root, matcher)
        };

        let mut result: Vec<String> = WalkDir::new(&root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| !recursive || entry.file_type().is_file())
            .filter_map(|entry| {
                let path = self
                    .platform
                    .normalize_path(&entry.path().to_string_lossy());
                let candidate = if recursive {
                    entry.file_name().to_string_lossy().into_owned()
                } else {
                    path.clone()
                };
                matcher.is_match(&candidate).then_some(path)
            })
            .collect();
        result.sort();
        Ok(result)
    }
}

fn is_variable_placeholder(value: &str) -> bool {
    value.len() > 2 && value.starts_with('@') && value.ends_with('@')
}

fn is_object_lib(target: &Target) -> bool {
    target
        .as_module()
        .is_some_and(|m| m.module_type == ModuleType::ObjectLib)
}

/// Longest leading directory of a glob pattern without wildcards.
fn glob_root(pattern: &str) -> String {
    let mut root = Vec::new();
    for part in pattern.split('/') {
        if part.contains(['*', '?', '[']) {
            break;
        }
        root.push(part);
    }
    let root = root.join("/");
    if root.is_empty() { "/".to_string() } else { root }
}

/// Rename targets sharing a name until every name is unique.
///
/// Targets with the same file name in different directories get their
/// directory as a prefix; targets with different file names are named after
/// the file.
pub fn deduplicate_target_names(targets: &mut [Target]) {
    const MAX_ROUNDS: usize = 8;
    for _ in 0..MAX_ROUNDS {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, target) in targets.iter().enumerate() {
            if let Some(name) = target.name() {
                groups.entry(name.to_string()).or_default().push(idx);
            }
        }
        let duplicates: Vec<Vec<usize>> = groups.into_values().filter(|g| g.len() > 1).collect();
        if duplicates.is_empty() {
            return;
        }
        for group in duplicates {
            let mut by_basename: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for idx in group {
                let basename = paths::basename(targets[idx].output()).to_string();
                by_basename.entry(basename).or_default().push(idx);
            }
            for (basename, members) in by_basename {
                if members.len() > 1 {
                    for idx in members {
                        let output = targets[idx].output();
                        let stripped = output
                            .replace(&format!("{BUILD_DIR_PLACEHOLDER}/"), "")
                            .replace(&format!("{SOURCE_DIR_PLACEHOLDER}/"), "");
                        let dir = paths::dirname(&stripped);
                        if dir.is_empty() {
                            continue;
                        }
                        let prefix: String = dir
                            .chars()
                            .map(|c| if c.is_alphanumeric() { c } else { '_' })
                            .collect();
                        let name = targets[idx].name().unwrap_or_default().to_string();
                        targets[idx].set_name(format!("{prefix}_{name}"));
                    }
                } else {
                    for idx in members {
                        targets[idx].set_name(basename.replace('.', "_"));
                    }
                }
            }
        }
    }

    // still clashing: fall back to numbering, skipping names already taken
    let mut taken: BTreeSet<String> = targets.iter().filter_map(|t| t.name().map(str::to_string)).collect();
    let mut kept: BTreeSet<String> = BTreeSet::new();
    for target in targets.iter_mut() {
        let Some(name) = target.name().map(str::to_string) else {
            continue;
        };
        if kept.insert(name.clone()) {
            continue;
        }
        let mut number = 2usize;
        let mut candidate = format!("{name}_{number}");
        while taken.contains(&candidate) {
            number += 1;
            candidate = format!("{name}_{number}");
        }
        taken.insert(candidate.clone());
        kept.insert(candidate.clone());
        target.set_name(candidate);
    }
}

/// Every output, import libraries included, must belong to one target.
pub fn check_target_outputs(targets: &[Target]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for target in targets {
        for output in target.outputs() {
            if !seen.insert(output) {
                return Err(MigratorError::DuplicateOutput(output.to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Module;

    fn settings(source: &str, build: &str) -> Settings {
        Settings {
            logs: vec!["make:build.log".to_string()],
            source_dir: Some(source.to_string()),
            build_dirs: vec![build.to_string()],
            platform: Some(Platform::Linux),
            ..Settings::default()
        }
    }

    fn context() -> ParserContext {
        ParserContext::new(&settings("/src", "/src/build"), "/").unwrap()
    }

    fn module(module_type: ModuleType, output: &str) -> Target {
        Target::from(TargetKind::Module(Module::new(module_type, output)))
    }

    #[test]
    fn test_log_spec_parsing() {
        let spec = LogSpec::parse("ninja:out/build.log", None).unwrap();
        assert_eq!(spec.log_type, LogType::Ninja);
        assert_eq!(spec.path, "out/build.log");
        let spec = LogSpec::parse("C:/logs/a.txt", Some("make")).unwrap();
        assert_eq!(spec.path, "C:/logs/a.txt");
        assert!(LogSpec::parse("a.txt", None).is_err());
        assert!(LogSpec::parse("msbuild:a.txt", None).is_err());
    }

    #[test]
    fn test_new_validates_settings() {
        let mut s = settings("/src", "/src");
        assert!(ParserContext::new(&s, "/").is_err());
        s = settings("/src", "/b");
        s.logs.clear();
        assert!(ParserContext::new(&s, "/").is_err());
        s = settings("/src", "/b");
        s.dont_capture_sources = true;
        s.capture_sources = vec!["*.c".to_string()];
        assert!(ParserContext::new(&s, "/").is_err());
    }

    #[test]
    fn test_relocation_prefers_closest_dir() {
        let ctx = context();
        assert_eq!(ctx.path_arg("obj/a.o"), "@build_dir@/obj/a.o");
        assert_eq!(ctx.path_arg("../a.c"), "@source_dir@/a.c");
        assert_eq!(ctx.path_arg("/usr/include"), "/usr/include");
        assert_eq!(ctx.path_arg("."), "@build_dir@");
    }

    #[test]
    fn test_output_arg_creates_parent_directory() {
        let ctx = context();
        let mut deps = Dependencies::new();
        let output = ctx.output_arg("obj/x/a.o", &mut deps);
        assert_eq!(output, "@build_dir@/obj/x/a.o");
        assert_eq!(deps.outputs(), ["@build_dir@/obj/x".to_string()]);
        let mut deps = Dependencies::new();
        ctx.output_arg("a.o", &mut deps);
        assert!(deps.is_empty());
    }

    #[test]
    fn test_register_names_and_replaces_files() {
        let mut ctx = context();
        let file = Target::from(TargetKind::File(FileTarget {
            output: "@build_dir@/libz.a".to_string(),
            content: Vec::new(),
            dependencies: Vec::new(),
        }));
        ctx.register(PendingTarget::new(file, Dependencies::new()));
        let lib = module(ModuleType::StaticLib, "@build_dir@/libz.a");
        let registered = ctx.register(PendingTarget::new(lib, Dependencies::new()));
        assert_eq!(registered, vec!["@build_dir@/libz.a".to_string()]);
        assert_eq!(ctx.targets().len(), 1);
        assert_eq!(ctx.targets()[0].name(), Some("libz_a"));
    }

    #[test]
    fn test_register_moves_duplicate_object_libs_aside() {
        let mut ctx = context();
        let mut first = module(ModuleType::ObjectLib, "@build_dir@/a.o");
        first.set_name("first");
        ctx.register(PendingTarget::new(first, Dependencies::new()));
        let second = module(ModuleType::ObjectLib, "@build_dir@/a.o");
        ctx.register(PendingTarget::new(second, Dependencies::new()));
        assert!(ctx.find_target("@build_dir@/a.o#1").is_some());
        assert!(ctx.find_target("@build_dir@/a.o").is_some());
    }

    #[test]
    fn test_register_rejects_conflicting_outputs() {
        let mut ctx = context();
        ctx.register(PendingTarget::new(
            module(ModuleType::Executable, "@build_dir@/app"),
            Dependencies::new(),
        ));
        let registered = ctx.register(PendingTarget::new(
            module(ModuleType::SharedLib, "@build_dir@/app"),
            Dependencies::new(),
        ));
        assert!(registered.is_empty());
        assert_eq!(ctx.targets().len(), 1);
    }

    #[test]
    fn test_object_lib_names_use_o_extension() {
        let mut ctx = context();
        ctx.register(PendingTarget::new(
            module(ModuleType::ObjectLib, "@build_dir@/obj/a.obj"),
            Dependencies::new(),
        ));
        assert_eq!(ctx.targets()[0].name(), Some("obj_a_o"));
    }

    #[test]
    fn test_force_target_name() {
        let mut s = settings("/src", "/src/build");
        s.force_target_name = vec![("@build_dir@/app".to_string(), "main".to_string())];
        let mut ctx = ParserContext::new(&s, "/").unwrap();
        ctx.register(PendingTarget::new(
            module(ModuleType::Executable, "@build_dir@/app"),
            Dependencies::new(),
        ));
        assert_eq!(ctx.targets()[0].name(), Some("main"));
    }

    #[test]
    fn test_path_alias_variable() {
        let mut s = settings("/src", "/src/build");
        s.path_aliases = vec![("/opt/sdk".to_string(), "@SDK_DIR@".to_string())];
        let mut ctx = ParserContext::new(&s, "/").unwrap();
        ctx.prepare(None, &s).unwrap();
        let mut deps = Dependencies::new();
        let arg = ctx.dir_arg("/opt/sdk/include", &mut deps);
        assert_eq!(arg, "@SDK_DIR@/include");
        assert!(deps.outputs().contains(&"@SDK_DIR@".to_string()));
        assert!(ctx.find_target("@SDK_DIR@").is_some());
    }

    #[test]
    fn test_deduplicate_target_names() {
        let mut a = module(ModuleType::StaticLib, "@build_dir@/x/libfoo.a");
        a.set_name("foo");
        let mut b = module(ModuleType::StaticLib, "@build_dir@/y/libfoo.a");
        b.set_name("foo");
        let mut c = module(ModuleType::SharedLib, "@build_dir@/libbar.so");
        c.set_name("bar");
        let mut d = module(ModuleType::Executable, "@build_dir@/bar");
        d.set_name("bar");
        let mut targets = vec![a, b, c, d];
        deduplicate_target_names(&mut targets);
        let names: Vec<&str> = targets.iter().filter_map(Target::name).collect();
        assert_eq!(names, vec!["x_foo", "y_foo", "libbar_so", "bar"]);
    }

    #[test]
    fn test_numbered_names_skip_names_in_use() {
        let mut a = module(ModuleType::StaticLib, "@build_dir@/libfoo.a");
        a.set_name("foo");
        let mut b = module(ModuleType::StaticLib, "@source_dir@/libfoo.a");
        b.set_name("foo");
        let mut c = module(ModuleType::Executable, "@build_dir@/tool");
        c.set_name("foo_2");
        let mut targets = vec![a, b, c];
        deduplicate_target_names(&mut targets);
        let names: Vec<&str> = targets.iter().filter_map(Target::name).collect();
        assert_eq!(names, vec!["foo", "foo_3", "foo_2"]);
    }

    #[test]
    fn test_check_target_outputs_detects_import_lib_clash() {
        let mut dll = Module::new(ModuleType::SharedLib, "x.dll");
        dll.import_libs.push("x.lib".to_string());
        let targets = vec![
            Target::from(TargetKind::Module(dll)),
            module(ModuleType::StaticLib, "x.lib"),
        ];
        assert!(matches!(
            check_target_outputs(&targets),
            Err(MigratorError::DuplicateOutput(_))
        ));
    }

    #[test]
    fn test_implicit_include_dirs() {
        let ctx = context();
        let sources = vec![SourceFile::new("@source_dir@/lib/a.c", None)];
        let deps = vec![
            "@source_dir@/lib/a.h".to_string(),
            "/usr/include/stdio.h".to_string(),
        ];
        let dirs = ctx.implicit_include_dirs(&sources, &[], &deps);
        assert_eq!(dirs, vec!["@source_dir@/lib".to_string()]);
        let covered = ctx.implicit_include_dirs(&sources, &["@source_dir@".to_string()], &deps);
        assert!(covered.is_empty());
    }

    #[test]
    fn test_required_targets_keep_dependencies() {
        let mut s = settings("/src", "/src/build");
        s.targets = vec!["app".to_string()];
        let mut ctx = ParserContext::new(&s, "/").unwrap();
        let mut lib = module(ModuleType::StaticLib, "@build_dir@/liba.a");
        lib.set_name("a.static");
        ctx.register(PendingTarget::new(lib, Dependencies::new()));
        let mut app = module(ModuleType::Executable, "@build_dir@/app");
        app.set_name("app");
        app.dependencies_mut().push("@build_dir@/liba.a".to_string());
        ctx.register(PendingTarget::new(app, Dependencies::new()));
        ctx.register(PendingTarget::new(
            module(ModuleType::Executable, "@build_dir@/other"),
            Dependencies::new(),
        ));
        ctx.finalize().unwrap();
        let outputs: Vec<&str> = ctx.targets().iter().map(Target::output).collect();
        assert_eq!(outputs, vec!["@build_dir@/liba.a", "@build_dir@/app"]);
        assert!(ctx.targets()[1].top_level);
    }

    #[test]
    fn test_required_target_not_found() {
        let mut s = settings("/nonexistent-src", "/nonexistent-src/build");
        s.targets = vec!["missing".to_string()];
        let mut ctx = ParserContext::new(&s, "/").unwrap();
        assert!(matches!(ctx.finalize(), Err(MigratorError::TargetNotFound(_))));
    }
}
