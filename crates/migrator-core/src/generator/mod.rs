//! # CMake Generator
//!
//! Renders a Build Object Model as a CMake project:
//!
//! - `CMakeLists.txt` with one block per target, in model order
//! - `extensions.cmake` with the helper functions the blocks call
//! - `<VAR>.cmake` list files for very long source lists
//! - captured files under `source/`, `prebuilt/` and `external/`
//!
//! Rendering is pure; [`CmakeGenerator::generate`] writes the result to the
//! output directory.

mod emit;
mod format;
mod prepare;

pub use emit::{EXTERNAL_SUBDIR, PREBUILT_SUBDIR, SOURCE_SUBDIR};
pub use format::{CmakeFormatter, escape_special_chars, quote};
pub use prepare::prepare;

use crate::context::check_target_outputs;
use crate::model::{BuildObjectModel, Target, TargetKind};
use crate::platform::Platform;
use crate::settings::Settings;
use crate::{MigratorError, Result};
use emit::Emitter;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the generated project script.
pub const CMAKE_LISTS: &str = "CMakeLists.txt";
/// Name of the helper module included by the project script.
pub const EXTENSIONS_FILE: &str = "extensions.cmake";

const EXTENSIONS: &str = include_str!("extensions.cmake");
const CMAKE_MINIMUM_VERSION: &str = "3.13";

/// Every file of a generated project, keyed by path relative to the output
/// directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedProject {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl GeneratedProject {
    /// Content of `CMakeLists.txt` as text.
    #[must_use]
    pub fn cmake_lists(&self) -> String {
        self.files
            .get(CMAKE_LISTS)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    }
}

/// Languages enabled by the project: `project()` languages first, then the
/// ones that need `enable_language`.
fn project_languages(targets: &[Target]) -> (Vec<&'static str>, Vec<&'static str>) {
    let mut used = BTreeSet::new();
    let mut has_modules = false;
    for module in targets.iter().filter_map(Target::as_module) {
        has_modules = true;
        used.extend(module.sources.iter().filter_map(|s| s.language.map(|l| l.cmake_name())));
    }
    let mut main: Vec<&'static str> = used.iter().copied().filter(|l| matches!(*l, "C" | "CXX")).collect();
    let extra: Vec<&'static str> = used.iter().copied().filter(|l| matches!(*l, "ASM" | "RC")).collect();
    if has_modules && main.is_empty() && extra.is_empty() {
        main.push("C");
    }
    (main, extra)
}

/// Generates CMake projects with fixed settings.
pub struct CmakeGenerator {
    out_dir: PathBuf,
    platform: Platform,
    project_name: Option<String>,
    project_version: Option<String>,
    rename: Vec<(Regex, String)>,
    flat_build_dir: bool,
    default_var_values: BTreeMap<String, String>,
}

impl CmakeGenerator {
    pub fn new(settings: &Settings, out_dir: impl Into<PathBuf>) -> Result<Self> {
        let rename = settings
            .rename
            .iter()
            .map(|(pattern, replacement)| Ok((Regex::new(pattern)?, replacement.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            out_dir: out_dir.into(),
            platform: settings.platform(),
            project_name: settings.cmake_project_name.clone().filter(|n| !n.is_empty()),
            project_version: settings.cmake_project_version.clone().filter(|v| !v.is_empty()),
            rename,
            flat_build_dir: settings.flat_build_dir,
            default_var_values: settings.default_var_values.iter().cloned().collect(),
        })
    }

    #[must_use]
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    fn header(&self, main: &[&str], extra: &[&str], source_dir_var: &str, threads: bool) -> String {
        let name = self.project_name.as_deref().unwrap_or("PROJECT");
        let version = self
            .project_version
            .as_ref()
            .map(|v| format!(" VERSION {v}"))
            .unwrap_or_default();
        let languages = if main.is_empty() { "NONE".to_string() } else { main.join(" ") };

        let mut text = format!("cmake_minimum_required(VERSION {CMAKE_MINIMUM_VERSION})\n\n");
        text.push_str(&format!("project({name}{version} LANGUAGES {languages})\n"));
        for language in extra {
            text.push_str(&format!("enable_language({language})\n"));
        }
        text.push('\n');
        text.push_str("list(APPEND CMAKE_MODULE_PATH ${CMAKE_CURRENT_LIST_DIR})\ninclude(extensions)\n\n");
        text.push_str(&format!(
            "set({source_dir_var} \"${{CMAKE_CURRENT_LIST_DIR}}/{}\" CACHE PATH \"\")\n",
            emit::SOURCE_SUBDIR
        ));
        if threads {
            text.push_str("\nfind_package(Threads REQUIRED)\n");
        }
        text
    }

    /// Render the model without touching the filesystem.
    pub fn render(&self, model: &BuildObjectModel) -> Result<GeneratedProject> {
        let (prepared, skip) = prepare(model, &self.rename, self.flat_build_dir, self.project_name.as_deref())?;
        check_target_outputs(&prepared.targets)?;

        let source_dir_var = self
            .project_name
            .as_ref()
            .map(|name| format!("{}_SOURCE_DIR", name.to_uppercase()))
            .unwrap_or_else(|| "SOURCE_DIR".to_string());
        let mut fmt = CmakeFormatter::new(&source_dir_var);
        for target in &prepared.targets {
            if let TargetKind::Variable(variable) = &target.kind {
                fmt.add_variable(&variable.placeholder, &variable.name);
            }
        }

        let (main, extra) = project_languages(&prepared.targets);
        let mut cmake = self.header(&main, &extra, &source_dir_var, emit::uses_threads(&prepared.targets));

        let languages: Vec<&'static str> = main.iter().chain(&extra).copied().collect();
        let mut emitter = Emitter::new(
            &prepared.targets,
            fmt,
            self.platform,
            languages,
            self.project_name.as_deref(),
            self.flat_build_dir,
            self.default_var_values.clone(),
        );
        for target in &prepared.targets {
            if skip.contains(target.output()) {
                debug!(output = target.output(), "target skipped");
                continue;
            }
            emitter.emit(target)?;
        }
        cmake.push_str(&emitter.cmake);

        let mut files = BTreeMap::new();
        for (path, content) in emitter.fmt.take_side_files() {
            files.insert(path, content.into_bytes());
        }
        for (path, content) in std::mem::take(&mut emitter.files) {
            files.insert(path, content);
        }
        files.insert(EXTENSIONS_FILE.to_string(), EXTENSIONS.as_bytes().to_vec());
        files.insert(CMAKE_LISTS.to_string(), cmake.into_bytes());
        Ok(GeneratedProject { files })
    }

    /// Render the model and write every file below the output directory.
    pub fn generate(&self, model: &BuildObjectModel) -> Result<GeneratedProject> {
        let project = self.render(model)?;
        for (relative, content) in &project.files {
            let path = self.out_dir.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| MigratorError::io(parent, e))?;
            }
            std::fs::write(&path, content).map_err(|e| MigratorError::io(&path, e))?;
        }
        info!(
            out_dir = %self.out_dir.display(),
            files = project.files.len(),
            "CMake project generated"
        );
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileTarget, Flag, Language, Module, ModuleType, SourceFile, Variable};

    fn settings() -> Settings {
        Settings {
            platform: Some(Platform::Linux),
            ..Settings::default()
        }
    }

    fn library() -> Target {
        let mut module = Module::new(ModuleType::SharedLib, "@build_dir@/lib/libfoo.so.1.2");
        module.name = "foo".to_string();
        module.module_name = Some("foo".to_string());
        module.sources = vec![
            SourceFile::new("@source_dir@/foo.c", Some(Language::C)),
            SourceFile::new("@source_dir@/asm/foo.S", Some(Language::Gasm)),
        ];
        module.link_flags = vec![Flag::from("-Wl,-soname,libfoo.so.1")];
        module.version = Some("1.2".to_string());
        Target::from(TargetKind::Module(module))
    }

    #[test]
    fn test_header_and_module() {
        let generator = CmakeGenerator::new(&settings(), "/tmp/out").unwrap();
        let project = generator.render(&BuildObjectModel::new(vec![library()])).unwrap();
        let cmake = project.cmake_lists();
        assert!(cmake.starts_with(
            "cmake_minimum_required(VERSION 3.13)\n\nproject(PROJECT LANGUAGES C)\nenable_language(ASM)\n\n"
        ));
        assert!(cmake.contains("include(extensions)\n"));
        assert!(cmake.contains("set(SOURCE_DIR \"${CMAKE_CURRENT_LIST_DIR}/source\" CACHE PATH \"\")\n"));
        assert!(cmake.contains("add_library(foo SHARED ${SOURCE_DIR}/foo.c ${SOURCE_DIR}/asm/foo.S)"));
        assert!(cmake.contains("set_target_output_subdir(foo LIBRARY_OUTPUT_DIRECTORY lib)"));
        assert!(cmake.contains("set_target_properties(foo PROPERTIES VERSION 1.2)"));
        assert!(cmake.contains("set_target_properties(foo PROPERTIES SOVERSION 1)"));
        assert!(!cmake.contains("soname"));
        assert!(!cmake.contains("Threads"));
        assert!(project.files.contains_key(EXTENSIONS_FILE));
    }

    #[test]
    fn test_project_name_and_version() {
        let settings = Settings {
            cmake_project_name: Some("zlib".to_string()),
            cmake_project_version: Some("1.3".to_string()),
            ..settings()
        };
        let generator = CmakeGenerator::new(&settings, "/tmp/out").unwrap();
        let project = generator.render(&BuildObjectModel::new(vec![library()])).unwrap();
        let cmake = project.cmake_lists();
        assert!(cmake.contains("project(zlib VERSION 1.3 LANGUAGES C)\n"));
        assert!(cmake.contains("set(ZLIB_SOURCE_DIR "));
        assert!(cmake.contains("${ZLIB_SOURCE_DIR}/foo.c"));
    }

    #[test]
    fn test_variables_become_expansions() {
        let variable = Target::from(TargetKind::Variable(Variable {
            name: "SDK".to_string(),
            placeholder: "@SDK@".to_string(),
            value: "/opt/sdk".to_string(),
            dependencies: Vec::new(),
        }));
        let mut module = Module::new(ModuleType::Executable, "@build_dir@/app");
        module.name = "app".to_string();
        module.sources = vec![SourceFile::new("@source_dir@/main.c", Some(Language::C))];
        module.include_dirs = vec!["@SDK@/include".to_string()];
        module.dependencies = vec!["@SDK@".to_string()];
        let model = BuildObjectModel::new(vec![variable, Target::from(TargetKind::Module(module))]);
        let generator = CmakeGenerator::new(&settings(), "/tmp/out").unwrap();
        let cmake = generator.render(&model).unwrap().cmake_lists();
        assert!(cmake.contains("set(SDK /opt/sdk CACHE STRING \"\")\n"));
        assert!(cmake.contains("target_include_directories(app PRIVATE ${SDK}/include)"));
    }

    #[test]
    fn test_empty_model_has_no_languages() {
        let generator = CmakeGenerator::new(&settings(), "/tmp/out").unwrap();
        let cmake = generator.render(&BuildObjectModel::default()).unwrap().cmake_lists();
        assert!(cmake.contains("project(PROJECT LANGUAGES NONE)\n"));
    }

    #[test]
    fn test_rename_rules() {
        let settings = Settings {
            rename: vec![("^foo$".to_string(), "foo_shared".to_string())],
            ..settings()
        };
        let generator = CmakeGenerator::new(&settings, "/tmp/out").unwrap();
        let cmake = generator.render(&BuildObjectModel::new(vec![library()])).unwrap().cmake_lists();
        assert!(cmake.contains("add_library(foo_shared SHARED"));
        assert!(cmake.contains("set_target_properties(foo_shared PROPERTIES OUTPUT_NAME foo)"));

        let invalid = Settings {
            rename: vec![("(".to_string(), String::new())],
            ..self::settings()
        };
        assert!(matches!(
            CmakeGenerator::new(&invalid, "/tmp/out"),
            Err(MigratorError::Pattern(_))
        ));
    }

    #[test]
    fn test_generate_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = Target::from(TargetKind::File(FileTarget {
            output: "@build_dir@/include/config.h".to_string(),
            content: b"#define X 1\n".to_vec(),
            dependencies: Vec::new(),
        }));
        let generator = CmakeGenerator::new(&settings(), dir.path()).unwrap();
        generator.generate(&BuildObjectModel::new(vec![file])).unwrap();
        assert!(dir.path().join(CMAKE_LISTS).is_file());
        assert!(dir.path().join(EXTENSIONS_FILE).is_file());
        let captured = std::fs::read(dir.path().join("prebuilt/include/config.h")).unwrap();
        assert_eq!(captured, b"#define X 1\n");
    }
}
