//! # Build Object Model
//!
//! The intermediate representation between log parsing and generation.
//!
//! A model is an ordered list of [`Target`]s. Targets refer to each other
//! through their output paths, which are unique within a model. Paths are
//! relocatable: they start with `@build_dir@`, `@source_dir@` or a user
//! variable placeholder, or they are absolute system paths.

use crate::{MigratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Placeholder for the build directory in relocatable paths.
pub const BUILD_DIR_PLACEHOLDER: &str = "@build_dir@";
/// Placeholder for the source directory in relocatable paths.
pub const SOURCE_DIR_PLACEHOLDER: &str = "@source_dir@";

// =============================================================================
// FLAGS
// =============================================================================

/// A command line flag: a single token or a group of tokens that must stay
/// together (`-arch arm64`, `-Wl,-soname -Wl,libfoo.so.1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Single(String),
    Group(Vec<String>),
}

impl Flag {
    /// Build a group flag from its tokens.
    #[must_use]
    pub fn group<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Group(tokens.into_iter().map(Into::into).collect())
    }

    /// All tokens of the flag.
    #[must_use]
    pub fn tokens(&self) -> Vec<&str> {
        match self {
            Self::Single(token) => vec![token.as_str()],
            Self::Group(tokens) => tokens.iter().map(String::as_str).collect(),
        }
    }

    /// First token (the option name for groups).
    #[must_use]
    pub fn head(&self) -> &str {
        match self {
            Self::Single(token) => token,
            Self::Group(tokens) => tokens.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// Tokens joined with spaces. Used for regex matching of filters.
    #[must_use]
    pub fn joined(&self) -> String {
        self.tokens().join(" ")
    }

    /// Tokens glued together with a `-` prefix (`/DFOO` -> `-DFOO`).
    #[must_use]
    pub fn gnu_form(&self) -> String {
        let joined: String = self.tokens().concat();
        match joined.chars().next() {
            Some(first) => format!("-{}", &joined[first.len_utf8()..]),
            None => joined,
        }
    }
}

impl From<&str> for Flag {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<String> for Flag {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

// =============================================================================
// MODULE PIECES
// =============================================================================

/// Kind of binary a module produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    Executable,
    ObjectLib,
    SharedLib,
    StaticLib,
    Interface,
}

/// Source language of a compiled file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C++")]
    Cxx,
    #[serde(rename = "GASM")]
    Gasm,
    #[serde(rename = "RC")]
    Rc,
}

impl Language {
    /// Language name as CMake spells it in `project()` and generator expressions.
    #[must_use]
    pub fn cmake_name(self) -> &'static str {
        match self {
            Self::C => "C",
            Self::Cxx => "CXX",
            Self::Gasm => "ASM",
            Self::Rc => "RC",
        }
    }

    /// Classify a C-family source file by extension.
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = crate::paths::split_ext(path).1;
        match ext {
            ".c" | ".m" => Some(Self::C),
            ".cc" | ".cpp" | ".cxx" | ".c++" | ".C" | ".mm" => Some(Self::Cxx),
            ".s" | ".S" => Some(Self::Gasm),
            _ if ext.eq_ignore_ascii_case(".rc") => Some(Self::Rc),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::C => "C",
            Self::Cxx => "C++",
            Self::Gasm => "GASM",
            Self::Rc => "RC",
        };
        f.write_str(name)
    }
}

/// A source file compiled into a module, with its own flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    #[serde(default)]
    pub language: Option<Language>,
    #[serde(default)]
    pub compile_flags: Vec<Flag>,
    #[serde(default)]
    pub include_dirs: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SourceFile {
    #[must_use]
    pub fn new(path: impl Into<String>, language: Option<Language>) -> Self {
        Self {
            path: path.into(),
            language,
            compile_flags: Vec::new(),
            include_dirs: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}

/// A library a module links against: a target output or a system library name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LibRef {
    pub value: String,
    /// Linked inside a `--whole-archive` region.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub whole_archive: bool,
}

impl LibRef {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            whole_archive: false,
        }
    }

    #[must_use]
    pub fn whole_archive(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            whole_archive: true,
        }
    }
}

// =============================================================================
// TARGET KINDS
// =============================================================================

/// An executable or library built from sources and objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub name: String,
    pub module_type: ModuleType,
    pub output: String,
    #[serde(default)]
    pub import_libs: Vec<String>,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub compile_flags: Vec<Flag>,
    #[serde(default)]
    pub include_dirs: Vec<String>,
    #[serde(default)]
    pub link_flags: Vec<Flag>,
    #[serde(default)]
    pub libs: Vec<LibRef>,
    #[serde(default)]
    pub objects: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceFile>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub compatibility_version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Module {
    /// An empty module of the given type.
    #[must_use]
    pub fn new(module_type: ModuleType, output: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            module_type,
            output: output.into(),
            import_libs: Vec::new(),
            module_name: None,
            compile_flags: Vec::new(),
            include_dirs: Vec::new(),
            link_flags: Vec::new(),
            libs: Vec::new(),
            objects: Vec::new(),
            sources: Vec::new(),
            version: None,
            compatibility_version: None,
            dependencies: Vec::new(),
        }
    }

    /// `source` with the module's compile flags and include directories
    /// ahead of its own.
    #[must_use]
    pub fn inherited_source(&self, source: &SourceFile) -> SourceFile {
        SourceFile {
            compile_flags: unique_concat(&self.compile_flags, &source.compile_flags),
            include_dirs: unique_concat(&self.include_dirs, &source.include_dirs),
            ..source.clone()
        }
    }
}

/// `base` followed by the values of `extra` it lacks, each value once.
pub fn unique_concat<T: Clone + PartialEq>(base: &[T], extra: &[T]) -> Vec<T> {
    let mut values: Vec<T> = Vec::with_capacity(base.len() + extra.len());
    for value in base.iter().chain(extra) {
        if !values.contains(value) {
            values.push(value.clone());
        }
    }
    values
}

/// A copy of a module's output under another name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCopy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub module_name: Option<String>,
    pub source: String,
    pub output: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A file whose content was captured during parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTarget {
    pub output: String,
    #[serde(with = "content_base64")]
    pub content: Vec<u8>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A directory created during the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub output: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A plain file copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyTarget {
    #[serde(default)]
    pub name: String,
    pub source: String,
    pub output: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A user configurable path; its placeholder doubles as its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub placeholder: String,
    pub value: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// An arbitrary command that produces one or more outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<Flag>,
    pub output: String,
    #[serde(default)]
    pub extra_outputs: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// The kind-specific payload of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetKind {
    Module(Module),
    ModuleCopy(ModuleCopy),
    File(FileTarget),
    Directory(Directory),
    Copy(CopyTarget),
    Variable(Variable),
    Cmd(Command),
}

/// A node of the build graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(flatten)]
    pub kind: TargetKind,
    /// Selected explicitly by the user (`--targets`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub top_level: bool,
}

impl From<TargetKind> for Target {
    fn from(kind: TargetKind) -> Self {
        Self {
            kind,
            top_level: false,
        }
    }
}

impl Target {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            TargetKind::Module(_) => "module",
            TargetKind::ModuleCopy(_) => "module_copy",
            TargetKind::File(_) => "file",
            TargetKind::Directory(_) => "directory",
            TargetKind::Copy(_) => "copy",
            TargetKind::Variable(_) => "variable",
            TargetKind::Cmd(_) => "cmd",
        }
    }

    /// The primary output path.
    #[must_use]
    pub fn output(&self) -> &str {
        match &self.kind {
            TargetKind::Module(m) => &m.output,
            TargetKind::ModuleCopy(m) => &m.output,
            TargetKind::File(f) => &f.output,
            TargetKind::Directory(d) => &d.output,
            TargetKind::Copy(c) => &c.output,
            TargetKind::Variable(v) => &v.placeholder,
            TargetKind::Cmd(c) => &c.output,
        }
    }

    /// Primary and secondary outputs (import libraries, extra command outputs).
    #[must_use]
    pub fn outputs(&self) -> Vec<&str> {
        let mut result = vec![self.output()];
        match &self.kind {
            TargetKind::Module(m) => result.extend(m.import_libs.iter().map(String::as_str)),
            TargetKind::Cmd(c) => result.extend(c.extra_outputs.iter().map(String::as_str)),
            _ => {}
        }
        result
    }

    /// Target name; files and directories are anonymous.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            TargetKind::Module(m) => Some(m.name.as_str()),
            TargetKind::ModuleCopy(m) => Some(m.name.as_str()),
            TargetKind::Copy(c) => Some(c.name.as_str()),
            TargetKind::Variable(v) => Some(v.name.as_str()),
            TargetKind::Cmd(c) => Some(c.name.as_str()),
            TargetKind::File(_) | TargetKind::Directory(_) => None,
        }
        .filter(|name| !name.is_empty())
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        match &mut self.kind {
            TargetKind::Module(m) => m.name = name,
            TargetKind::ModuleCopy(m) => m.name = name,
            TargetKind::Copy(c) => c.name = name,
            TargetKind::Variable(v) => v.name = name,
            TargetKind::Cmd(c) => c.name = name,
            TargetKind::File(_) | TargetKind::Directory(_) => {}
        }
    }

    /// Whether the target kind carries a name.
    #[must_use]
    pub fn is_named(&self) -> bool {
        !matches!(self.kind, TargetKind::File(_) | TargetKind::Directory(_))
    }

    pub fn set_output(&mut self, output: impl Into<String>) {
        let output = output.into();
        match &mut self.kind {
            TargetKind::Module(m) => m.output = output,
            TargetKind::ModuleCopy(m) => m.output = output,
            TargetKind::File(f) => f.output = output,
            TargetKind::Directory(d) => d.output = output,
            TargetKind::Copy(c) => c.output = output,
            TargetKind::Variable(v) => v.placeholder = output,
            TargetKind::Cmd(c) => c.output = output,
        }
    }

    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        match &self.kind {
            TargetKind::Module(m) => &m.dependencies,
            TargetKind::ModuleCopy(m) => &m.dependencies,
            TargetKind::File(f) => &f.dependencies,
            TargetKind::Directory(d) => &d.dependencies,
            TargetKind::Copy(c) => &c.dependencies,
            TargetKind::Variable(v) => &v.dependencies,
            TargetKind::Cmd(c) => &c.dependencies,
        }
    }

    pub fn dependencies_mut(&mut self) -> &mut Vec<String> {
        match &mut self.kind {
            TargetKind::Module(m) => &mut m.dependencies,
            TargetKind::ModuleCopy(m) => &mut m.dependencies,
            TargetKind::File(f) => &mut f.dependencies,
            TargetKind::Directory(d) => &mut d.dependencies,
            TargetKind::Copy(c) => &mut c.dependencies,
            TargetKind::Variable(v) => &mut v.dependencies,
            TargetKind::Cmd(c) => &mut c.dependencies,
        }
    }

    /// Dependencies of the target and of its source files.
    #[must_use]
    pub fn all_dependencies(&self) -> Vec<&str> {
        let mut result: Vec<&str> = self.dependencies().iter().map(String::as_str).collect();
        if let TargetKind::Module(m) = &self.kind {
            for source in &m.sources {
                result.extend(source.dependencies.iter().map(String::as_str));
            }
        }
        result
    }

    #[must_use]
    pub fn as_module(&self) -> Option<&Module> {
        match &self.kind {
            TargetKind::Module(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_module_mut(&mut self) -> Option<&mut Module> {
        match &mut self.kind {
            TargetKind::Module(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self.kind, TargetKind::File(_))
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, TargetKind::Directory(_))
    }
}

// =============================================================================
// BUILD OBJECT MODEL
// =============================================================================

/// Format version written into saved models.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// The ordered collection of targets produced by parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildObjectModel {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub targets: Vec<Target>,
}

fn default_format_version() -> u32 {
    MODEL_FORMAT_VERSION
}

impl BuildObjectModel {
    #[must_use]
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            format_version: MODEL_FORMAT_VERSION,
            targets,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Map every output (including import libs) to the index of its target.
    #[must_use]
    pub fn output_index(&self) -> BTreeMap<String, usize> {
        output_index(&self.targets)
    }

    /// Find a target by any of its outputs.
    #[must_use]
    pub fn find(&self, output: &str) -> Option<&Target> {
        self.targets
            .iter()
            .find(|t| t.outputs().contains(&output))
    }

    /// Keep only top-level targets and their transitive dependencies.
    /// Models without top-level targets are returned unchanged.
    #[must_use]
    pub fn filter_top_level(&self) -> Self {
        let roots: Vec<&str> = self
            .targets
            .iter()
            .filter(|t| t.top_level)
            .map(Target::output)
            .collect();
        if roots.is_empty() {
            return self.clone();
        }
        let keep = self.dependency_closure(roots);
        let targets = self
            .targets
            .iter()
            .enumerate()
            .filter(|(idx, _)| keep.contains(idx))
            .map(|(_, t)| t.clone())
            .collect();
        Self::new(targets)
    }

    /// Indices of the given outputs' targets and everything they depend on,
    /// in post-order (dependencies first).
    #[must_use]
    pub fn dependency_closure<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> Vec<usize> {
        let index = self.output_index();
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        for root in roots {
            if let Some(&idx) = index.get(root) {
                self.visit(idx, &index, &mut visited, &mut order);
            }
        }
        order
    }

    fn visit(
        &self,
        idx: usize,
        index: &BTreeMap<String, usize>,
        visited: &mut BTreeSet<usize>,
        order: &mut Vec<usize>,
    ) {
        if !visited.insert(idx) {
            return;
        }
        for dep in self.targets[idx].all_dependencies() {
            if let Some(&dep_idx) = index.get(dep) {
                self.visit(dep_idx, index, visited, order);
            }
        }
        order.push(idx);
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the model as pretty printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| MigratorError::io(path, e))?;
        tracing::info!(path = %path.display(), targets = self.len(), "model saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| MigratorError::io(path, e))?;
        let model = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), targets = model.len(), "model loaded");
        Ok(model)
    }
}

/// Map every output of `targets` to its position.
#[must_use]
pub fn output_index(targets: &[Target]) -> BTreeMap<String, usize> {
    let mut index = BTreeMap::new();
    for (idx, target) in targets.iter().enumerate() {
        for output in target.outputs() {
            index.insert(output.to_string(), idx);
        }
    }
    index
}

mod content_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
