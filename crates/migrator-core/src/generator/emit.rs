//! CMake code for each target kind.

use super::format::{CmakeFormatter, quote};
use crate::model::{
    BUILD_DIR_PLACEHOLDER, Command, CopyTarget, Flag, LibRef, Module, ModuleCopy, ModuleType,
    SOURCE_DIR_PLACEHOLDER, Target, TargetKind, Variable, output_index,
};
use crate::platform::Platform;
use crate::{MigratorError, Result, paths};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Subdirectory of the output for files captured from the build tree.
pub const PREBUILT_SUBDIR: &str = "prebuilt";
/// Subdirectory of the output for files captured from the source tree.
pub const SOURCE_SUBDIR: &str = "source";
/// Subdirectory of the output for files captured from anywhere else.
pub const EXTERNAL_SUBDIR: &str = "external";
/// With more prebuilt files than this, they are copied with a glob loop.
const GLOB_FILE_LIMIT: usize = 3;

const PREBUILT_GLOB: &str = "
set(copy_prebuilt_artifacts_DIR prebuilt)
set(copy_prebuilt_artifacts_DEST ${CMAKE_CURRENT_BINARY_DIR})
file(GLOB_RECURSE _files RELATIVE ${CMAKE_CURRENT_LIST_DIR}/${copy_prebuilt_artifacts_DIR} ${copy_prebuilt_artifacts_DIR}/*)
foreach(_f ${_files})
    configure_file(${copy_prebuilt_artifacts_DIR}/${_f} ${copy_prebuilt_artifacts_DEST}/${_f} COPYONLY)
endforeach()
";

/// CMake spelling of well known system libraries. An empty value drops the
/// library: the toolchain links it implicitly.
fn system_library(name: &str) -> Option<&'static str> {
    Some(match name {
        "dl" => "${CMAKE_DL_LIBS}",
        "pthread" => "Threads::Threads",
        "advapi32" | "comdlg32" | "gdi32" | "kernel32" | "ole32" | "oleaut32" | "shell32" | "user32"
        | "uuid" | "winspool" | "c" | "gcc_s" => "",
        _ => return None,
    })
}

/// Language a compile flag is restricted to, if any.
fn flag_language(flag: &Flag) -> Option<&'static str> {
    let Flag::Single(token) = flag else {
        return None;
    };
    let standard = token.strip_prefix("-std=")?;
    if standard.contains("++") {
        Some("CXX")
    } else if standard.starts_with('c') || standard.starts_with("gnu") {
        Some("C")
    } else {
        None
    }
}

/// Name for an unnamed target, derived from its output path.
fn name_from_output(output: &str) -> String {
    let tail = output.rsplit('@').next().unwrap_or(output);
    let tail = tail.strip_prefix('/').unwrap_or(tail);
    tail.replace(['.', '/'], "_")
}

fn strip_lib_suffix(value: &str) -> &str {
    value.strip_suffix(".lib").unwrap_or(value)
}

/// Whether any module needs `find_package(Threads)`.
pub fn uses_threads(targets: &[Target]) -> bool {
    targets.iter().filter_map(Target::as_module).any(|m| {
        m.libs.iter().any(|lib| lib.value == "pthread")
            || m.link_flags.iter().chain(&m.compile_flags).any(|f| f.head() == "-pthread")
    })
}

/// Accumulates `CMakeLists.txt` and the files that accompany it.
pub struct Emitter<'a> {
    targets: &'a [Target],
    index: BTreeMap<String, usize>,
    pub fmt: CmakeFormatter,
    platform: Platform,
    flat_build_dir: bool,
    languages: Vec<&'static str>,
    program_prefix: String,
    programs: BTreeMap<String, String>,
    source_options: BTreeMap<String, Vec<String>>,
    source_include_dirs: BTreeMap<String, Vec<String>>,
    empty_source: Option<String>,
    prebuilt_glob: bool,
    prebuilt_copied: bool,
    default_var_values: BTreeMap<String, String>,
    pub cmake: String,
    pub files: Vec<(String, Vec<u8>)>,
}

impl<'a> Emitter<'a> {
    pub fn new(
        targets: &'a [Target],
        fmt: CmakeFormatter,
        platform: Platform,
        languages: Vec<&'static str>,
        project_name: Option<&str>,
        flat_build_dir: bool,
        default_var_values: BTreeMap<String, String>,
    ) -> Self {
        let prebuilt_files = targets
            .iter()
            .filter(|t| t.is_file() && t.output().starts_with(BUILD_DIR_PLACEHOLDER))
            .count();
        let programs = BTreeMap::from([("cmake".to_string(), "CMAKE_COMMAND".to_string())]);
        Self {
            targets,
            index: output_index(targets),
            fmt,
            platform,
            flat_build_dir,
            languages,
            program_prefix: project_name.map(|n| format!("{}_", n.to_uppercase())).unwrap_or_default(),
            programs,
            source_options: BTreeMap::new(),
            source_include_dirs: BTreeMap::new(),
            empty_source: None,
            prebuilt_glob: prebuilt_files > GLOB_FILE_LIMIT,
            prebuilt_copied: false,
            default_var_values,
            cmake: String::new(),
            files: Vec::new(),
        }
    }

    fn lookup(&self, output: &str) -> Option<&'a Target> {
        self.index.get(output).map(|&idx| &self.targets[idx])
    }

    fn target_name(target: &Target) -> String {
        target
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| name_from_output(target.output()))
    }

    /// Flags as CMake arguments. Multi-token flags are kept together with
    /// `SHELL:` so CMake does not de-duplicate their parts.
    fn flag_arguments(&self, flags: &[Flag]) -> Vec<String> {
        flags
            .iter()
            .map(|flag| match flag {
                Flag::Group(tokens) => format!("SHELL:{}", tokens.join(" ")),
                Flag::Single(token) if self.platform.is_windows() => {
                    let runtime = token.trim_start_matches(['-', '/']);
                    match runtime {
                        "MT" | "MTd" => "/MT$<$<CONFIG:Debug>:d>".to_string(),
                        "MD" | "MDd" => "/MD$<$<CONFIG:Debug>:d>".to_string(),
                        _ => token.clone(),
                    }
                }
                Flag::Single(token) => token.clone(),
            })
            .collect()
    }

    pub fn emit(&mut self, target: &Target) -> Result<()> {
        debug!(output = target.output(), kind = target.type_name(), "generating target");
        match &target.kind {
            TargetKind::Module(module) => self.module(module),
            TargetKind::ModuleCopy(copy) => {
                self.module_copy(copy);
                Ok(())
            }
            TargetKind::Copy(copy) => {
                self.copy(copy);
                Ok(())
            }
            TargetKind::Cmd(command) => {
                self.command(command);
                Ok(())
            }
            TargetKind::Variable(variable) => {
                self.variable(variable);
                Ok(())
            }
            TargetKind::File(file) => {
                self.file(&file.output, &file.content);
                Ok(())
            }
            TargetKind::Directory(directory) => {
                self.directory(&directory.output);
                Ok(())
            }
        }
    }

    // =========================================================================
    // MODULES
    // =========================================================================

    fn empty_source(&mut self) -> String {
        if let Some(path) = &self.empty_source {
            return path.clone();
        }
        let extension = if self.languages.contains(&"C") {
            ".c"
        } else if self.languages.contains(&"CXX") {
            ".cpp"
        } else {
            match self.languages.first() {
                Some(&"ASM") => ".S",
                Some(&"RC") => ".rc",
                _ => ".c",
            }
        };
        let path = format!("${{CMAKE_CURRENT_BINARY_DIR}}/empty{extension}");
        self.cmake
            .push_str("# Workaround for CMake error: 'No SOURCES given to target'\n");
        self.cmake.push_str(&format!(
            "if(NOT EXISTS {path})\n    file(WRITE {path} \"\")\nendif()\n"
        ));
        self.empty_source = Some(path.clone());
        path
    }

    /// `set_source_files_properties` for one property, checking that every
    /// target compiles the source the same way.
    fn source_property(&mut self, path: &str, property: &'static str, values: Vec<String>) -> Result<()> {
        let seen = match property {
            "COMPILE_OPTIONS" => &mut self.source_options,
            _ => &mut self.source_include_dirs,
        };
        match seen.get(path) {
            Some(previous) if *previous != values => {
                return Err(MigratorError::IncompatibleSourceProperty {
                    path: path.to_string(),
                    property,
                    previous: previous.clone(),
                    current: values,
                });
            }
            Some(_) => return Ok(()),
            None => {
                seen.insert(path.to_string(), values.clone());
            }
        }
        let value = self.fmt.join_property_values(&values);
        let call = self
            .fmt
            .call("set_source_files_properties", &[path, "PROPERTIES", property], &[value], &[]);
        self.cmake.push_str(&call);
        Ok(())
    }

    fn link_libraries(&self, libs: &[LibRef]) -> Vec<String> {
        let mut result = Vec::new();
        let mut in_whole_archive = false;
        for lib in libs {
            let value = match self.lookup(&lib.value) {
                Some(target) if matches!(target.kind, TargetKind::Module(_) | TargetKind::ModuleCopy(_)) => {
                    Self::target_name(target)
                }
                Some(_) => strip_lib_suffix(&lib.value).to_string(),
                None => {
                    let value = strip_lib_suffix(&lib.value);
                    system_library(value).unwrap_or(value).to_string()
                }
            };
            if value.is_empty() {
                continue;
            }
            if lib.whole_archive != in_whole_archive {
                result.push(
                    if lib.whole_archive { "-Wl,-whole-archive" } else { "-Wl,-no-whole-archive" }.to_string(),
                );
                in_whole_archive = lib.whole_archive;
            }
            result.push(value);
        }
        if in_whole_archive {
            result.push("-Wl,-no-whole-archive".to_string());
        }
        result
    }

    /// `add_dependencies` for named targets not already implied by linking
    /// or by `$<TARGET_OBJECTS>`.
    fn add_dependencies(&mut self, name: &str, module: Option<&Module>, dependencies: &[String]) {
        let mut implied = BTreeSet::new();
        if let Some(module) = module {
            let referenced = module.libs.iter().map(|lib| &lib.value).chain(&module.objects);
            for output in referenced {
                if let Some(target) = self.lookup(output) {
                    if !matches!(target.kind, TargetKind::Cmd(_)) {
                        implied.extend(target.outputs().into_iter().map(str::to_string));
                    }
                }
            }
        }
        let mut names = BTreeSet::new();
        for dep in dependencies {
            if dep.starts_with(SOURCE_DIR_PLACEHOLDER) || implied.contains(dep) {
                continue;
            }
            let Some(target) = self.lookup(dep) else {
                continue;
            };
            if matches!(target.kind, TargetKind::Module(_) | TargetKind::Cmd(_)) {
                names.insert(Self::target_name(target));
            }
        }
        names.remove(name);
        if !names.is_empty() {
            let names: Vec<String> = names.into_iter().collect();
            let call = self.fmt.call("add_dependencies", &[name], &names, &[]);
            self.cmake.push_str(&call);
        }
    }

    fn module(&mut self, module: &Module) -> Result<()> {
        let mut module = module.clone();
        let owned_name = if module.name.is_empty() {
            name_from_output(&module.output)
        } else {
            module.name.clone()
        };
        let name = owned_name.as_str();

        let pthread = Flag::from("-pthread");
        let had_pthread = module.link_flags.contains(&pthread) || module.compile_flags.contains(&pthread);
        if had_pthread {
            module.link_flags.retain(|f| *f != pthread);
            module.compile_flags.retain(|f| *f != pthread);
            if !module.libs.iter().any(|lib| lib.value == "pthread") {
                module.libs.push(LibRef::new("pthread"));
            }
        }

        self.cmake.push('\n');

        for source in &module.sources {
            if !source.compile_flags.is_empty() {
                let values = self.flag_arguments(&source.compile_flags);
                self.source_property(&source.path, "COMPILE_OPTIONS", values)?;
            }
            if !source.include_dirs.is_empty() {
                self.source_property(&source.path, "INCLUDE_DIRECTORIES", source.include_dirs.clone())?;
            }
        }

        let mut sources: Vec<String> = module.sources.iter().map(|s| s.path.clone()).collect();
        let mut external_objects = Vec::new();
        let mut system_objects = Vec::new();
        let mut object_targets = 0usize;
        for object in &module.objects {
            match self.lookup(object) {
                Some(target) if matches!(target.kind, TargetKind::Module(_) | TargetKind::ModuleCopy(_)) => {
                    sources.push(format!("$<TARGET_OBJECTS:{}>", Self::target_name(target)));
                    object_targets += 1;
                }
                Some(_) => external_objects.push(object.clone()),
                None if object.starts_with(SOURCE_DIR_PLACEHOLDER) => external_objects.push(object.clone()),
                None => system_objects.push(object.clone()),
            }
        }
        // CMake cannot pick a linker for a target made of objects only
        let specify_linker_language = module.sources.is_empty() && (object_targets > 0 || !external_objects.is_empty());
        if !external_objects.is_empty() {
            sources.extend(external_objects.iter().cloned());
            let call = self.fmt.call(
                "set_source_files_properties",
                &[],
                &external_objects,
                &["PROPERTIES", "EXTERNAL_OBJECT", "ON"],
            );
            self.cmake.push_str(&call);
        }

        if sources.is_empty() && module.module_type != ModuleType::Interface {
            sources.push(self.empty_source());
        }

        let list_var = format!("{}_SRC", name.replace('.', "_").to_uppercase());
        let call = match module.module_type {
            ModuleType::Executable => {
                self.fmt
                    .call_with_list_file("add_executable", &[name], &sources, &[], Some(&list_var))
            }
            ModuleType::Interface => self.fmt.call("add_library", &[name, "INTERFACE"], &[], &[]),
            kind => {
                let keyword = match kind {
                    ModuleType::SharedLib => "SHARED",
                    ModuleType::StaticLib => "STATIC",
                    _ => "OBJECT",
                };
                self.fmt
                    .call_with_list_file("add_library", &[name, keyword], &sources, &[], Some(&list_var))
            }
        };
        self.cmake.push_str(&call);

        if specify_linker_language {
            if let Some(language) = self.languages.first().copied() {
                let call = self.fmt.call(
                    "set_target_properties",
                    &[name],
                    &["PROPERTIES".to_string(), "LINKER_LANGUAGE".to_string(), language.to_string()],
                    &[],
                );
                self.cmake.push_str(&call);
            }
        }

        let mut link_options = system_objects;
        link_options.extend(self.flag_arguments(&module.link_flags));
        if !link_options.is_empty() {
            let call = self.fmt.call("target_link_options", &[name, "PRIVATE"], &link_options, &[]);
            self.cmake.push_str(&call);
        }

        let visibility = if module.module_type == ModuleType::Interface { "INTERFACE" } else { "PRIVATE" };
        let libraries = self.link_libraries(&module.libs);
        if !libraries.is_empty() {
            let call = self.fmt.call("target_link_libraries", &[name, visibility], &libraries, &[]);
            self.cmake.push_str(&call);
        }

        let source_languages: BTreeSet<&str> = module
            .sources
            .iter()
            .filter_map(|s| s.language.map(|l| l.cmake_name()))
            .collect();
        let (common, per_language): (Vec<Flag>, Vec<Flag>) = if source_languages.len() > 1 {
            module
                .compile_flags
                .iter()
                .cloned()
                .partition(|flag| flag_language(flag).is_none())
        } else {
            (module.compile_flags.clone(), Vec::new())
        };
        if !common.is_empty() {
            let options = self.flag_arguments(&common);
            let call = self.fmt.call("target_compile_options", &[name, visibility], &options, &[]);
            self.cmake.push_str(&call);
        }
        for language in ["C", "CXX"] {
            let flags: Vec<Flag> = per_language
                .iter()
                .filter(|flag| flag_language(flag) == Some(language))
                .cloned()
                .collect();
            if flags.is_empty() {
                continue;
            }
            let options = self.flag_arguments(&flags);
            let call = self.fmt.call(
                "target_language_compile_options",
                &[name, language, "PRIVATE"],
                &options,
                &[],
            );
            self.cmake.push_str(&call);
        }

        if !module.include_dirs.is_empty() {
            let call = self.fmt.call(
                "target_include_directories",
                &[name, visibility],
                &module.include_dirs,
                &[],
            );
            self.cmake.push_str(&call);
        }

        self.add_dependencies(name, Some(&module), &module.dependencies);

        if module.module_type != ModuleType::Interface {
            if let Some(module_name) = module.module_name.as_deref().filter(|m| *m != name) {
                let call = self.fmt.call(
                    "set_target_properties",
                    &[name, "PROPERTIES", "OUTPUT_NAME"],
                    &[module_name.to_string()],
                    &[],
                );
                self.cmake.push_str(&call);
            }
        }

        if self.platform.is_windows() {
            let import = module
                .import_libs
                .first()
                .and_then(|lib| self.platform.parse_import_lib(lib));
            if let Some(import) = import {
                if Some(import.module_name.as_str()) != module.module_name.as_deref() {
                    let call = self.fmt.call(
                        "set_target_properties",
                        &[name, "PROPERTIES", "ARCHIVE_OUTPUT_NAME"],
                        &[import.module_name],
                        &[],
                    );
                    self.cmake.push_str(&call);
                }
            }
        }

        self.output_subdirs(name, &module);

        if let Some(version) = &module.version {
            let call = self
                .fmt
                .call("set_target_properties", &[name, "PROPERTIES", "VERSION"], &[version.clone()], &[]);
            self.cmake.push_str(&call);
        }
        if let Some(version) = &module.compatibility_version {
            let call = self
                .fmt
                .call("set_target_properties", &[name, "PROPERTIES", "SOVERSION"], &[version.clone()], &[]);
            self.cmake.push_str(&call);
        }
        Ok(())
    }

    fn output_subdirs(&mut self, name: &str, module: &Module) {
        if matches!(module.module_type, ModuleType::ObjectLib | ModuleType::Interface) || self.flat_build_dir {
            return;
        }
        let output_dir = paths::dirname(&module.output);
        let Some(subdir) = output_dir
            .strip_prefix(BUILD_DIR_PLACEHOLDER)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return;
        };
        let mut properties = Vec::new();
        match module.module_type {
            ModuleType::SharedLib if self.platform.is_windows() => {
                properties.extend(["RUNTIME_OUTPUT_DIRECTORY", "ARCHIVE_OUTPUT_DIRECTORY"]);
            }
            ModuleType::SharedLib => {
                properties.extend(["LIBRARY_OUTPUT_DIRECTORY", "RUNTIME_OUTPUT_DIRECTORY"]);
            }
            ModuleType::StaticLib => properties.push("ARCHIVE_OUTPUT_DIRECTORY"),
            _ => properties.push("RUNTIME_OUTPUT_DIRECTORY"),
        }
        for property in properties {
            let call = self
                .fmt
                .call("set_target_output_subdir", &[name, property], &[subdir.to_string()], &[]);
            self.cmake.push_str(&call);
        }
    }

    // =========================================================================
    // COPIES
    // =========================================================================

    fn module_copy(&mut self, copy: &ModuleCopy) {
        let mut source = copy.source.as_str();
        let mut origin = None;
        for _ in 0..self.targets.len() {
            match self.lookup(source).map(|t| &t.kind) {
                Some(TargetKind::Module(module)) => {
                    origin = Some(module);
                    break;
                }
                Some(TargetKind::ModuleCopy(inner)) => source = inner.source.as_str(),
                _ => break,
            }
        }
        let Some(origin) = origin else {
            warn!(output = %copy.output, source = %copy.source, "module copy without source module");
            return;
        };
        if copy.name.is_empty() || copy.name == origin.name {
            return;
        }
        self.cmake.push('\n');
        let function = if origin.module_type == ModuleType::Executable { "add_executable" } else { "add_library" };
        let call = self
            .fmt
            .call(function, &[copy.name.as_str()], &["ALIAS".to_string(), origin.name.clone()], &[]);
        self.cmake.push_str(&call);
    }

    /// The build-dir target a copy ultimately originates from.
    fn copy_origin(&self, source: &str) -> Option<&'a Target> {
        let mut source = source.to_string();
        for _ in 0..=self.targets.len() {
            let target = self.lookup(&source)?;
            if !target.output().starts_with(BUILD_DIR_PLACEHOLDER) {
                return None;
            }
            match &target.kind {
                TargetKind::Copy(copy) => source.clone_from(&copy.source),
                TargetKind::ModuleCopy(copy) => source.clone_from(&copy.source),
                _ => return Some(target),
            }
        }
        None
    }

    fn copy(&mut self, copy: &CopyTarget) {
        if self.copy_origin(&copy.source).is_none() {
            let line = self.fmt.format(&format!(
                "configure_file({} {} COPYONLY)\n",
                quote(&copy.source, false),
                quote(&copy.output, false)
            ));
            self.cmake.push_str(&line);
            return;
        }
        let link = paths::relpath(&copy.source, paths::dirname(&copy.output)).unwrap_or_else(|| copy.source.clone());
        let command = Command {
            name: copy.name.clone(),
            program: "cmake".to_string(),
            args: ["-E", "create_symlink", link.as_str(), copy.output.as_str()]
                .into_iter()
                .map(Flag::from)
                .collect(),
            output: copy.output.clone(),
            extra_outputs: Vec::new(),
            working_dir: None,
            parameters: BTreeMap::new(),
            dependencies: vec![copy.source.clone()],
        };
        self.command(&command);
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    fn program_variable(&mut self, program: &str) -> String {
        if let Some(var) = self.programs.get(program) {
            return var.clone();
        }
        let base: String = paths::basename(program)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        let var = format!("{}{base}", self.program_prefix);
        self.cmake.push_str(&format!(
            "\nfind_program({var} {program})\nif(NOT {var})\n    message(FATAL_ERROR \"{program} not found\")\nendif()\n"
        ));
        self.programs.insert(program.to_string(), var.clone());
        var
    }

    fn command(&mut self, command: &Command) {
        let program_var = self.program_variable(&command.program);

        let mut object_libs = Vec::new();
        let mut depends = String::new();
        if !command.dependencies.is_empty() {
            depends.push_str("\n    DEPENDS");
            for dep in &command.dependencies {
                let entry = match self.lookup(dep).map(|t| (t, &t.kind)) {
                    Some((_, TargetKind::Directory(_))) => continue,
                    Some((target, TargetKind::Module(module))) => {
                        if module.module_type == ModuleType::ObjectLib {
                            object_libs.push((Self::target_name(target), module.output.clone()));
                        }
                        Self::target_name(target)
                    }
                    _ => dep.clone(),
                };
                depends.push_str(&format!("\n        {entry}"));
            }
        }

        let mut line = vec![format!("${{{program_var}}}")];
        for arg in command.args.iter().flat_map(Flag::tokens) {
            match self.lookup(arg).map(|t| (t, &t.kind)) {
                Some((target, TargetKind::Module(module))) if module.module_type != ModuleType::ObjectLib => {
                    line.push(format!("$<TARGET_FILE:{}>", Self::target_name(target)));
                }
                _ => line.push(arg.to_string()),
            }
        }
        let params: String = command.parameters.iter().map(|(k, v)| format!(" {k}={v}")).collect();
        let step = |text: &str| format!("\n    COMMAND\n        ${{CMAKE_COMMAND}} -E env{params}\n        {text}");

        // object libraries cannot choose where their objects land
        let mut commands: String = object_libs
            .iter()
            .map(|(name, output)| {
                step(&format!(
                    "${{CMAKE_COMMAND}} -E copy_if_different \"$<TARGET_OBJECTS:{name}>\" \"{output}\""
                ))
            })
            .collect();
        commands.push_str(&step(&line.join(" ")));

        let working_dir = command
            .working_dir
            .as_ref()
            .map(|dir| format!("\n    WORKING_DIRECTORY \"{dir}\""))
            .unwrap_or_default();
        let mut outputs = command.output.clone();
        for extra in &command.extra_outputs {
            outputs.push_str(&format!("\n    {extra}"));
        }
        let name = if command.name.is_empty() {
            name_from_output(&command.output)
        } else {
            command.name.clone()
        };
        let text = format!(
            "\nadd_custom_command(OUTPUT {outputs}{commands}{depends}{working_dir}\n    VERBATIM\n)\nadd_custom_target({name} ALL DEPENDS {outputs})\n"
        );
        let text = self.fmt.format(&text);
        self.cmake.push_str(&text);
    }

    // =========================================================================
    // VARIABLES, FILES, DIRECTORIES
    // =========================================================================

    fn variable(&mut self, variable: &Variable) {
        let value = self
            .default_var_values
            .get(&variable.name)
            .cloned()
            .unwrap_or_else(|| variable.value.clone());
        let values = if value.is_empty() { Vec::new() } else { vec![value] };
        let text = if variable.name.to_lowercase() == variable.name {
            self.fmt.variable(&variable.name, &values, &[])
        } else {
            self.fmt.cache_variable(&variable.name, &values, "STRING")
        };
        self.cmake.push_str(&text);
    }

    fn file(&mut self, output: &str, content: &[u8]) {
        let in_build_dir = output.starts_with(BUILD_DIR_PLACEHOLDER);
        let in_source_dir = output.starts_with(SOURCE_DIR_PLACEHOLDER);
        let (subdir, rest) = if in_build_dir {
            (PREBUILT_SUBDIR, &output[BUILD_DIR_PLACEHOLDER.len()..])
        } else if in_source_dir {
            (SOURCE_SUBDIR, &output[SOURCE_DIR_PLACEHOLDER.len()..])
        } else {
            (EXTERNAL_SUBDIR, output)
        };
        let location = paths::normpath(&format!("{subdir}/{}", rest.trim_start_matches('/')))
            .replace('\\', "/")
            .replace("..", "_")
            .replace(':', "_");
        let location = location.trim_start_matches('/').to_string();
        self.files.push((location.clone(), content.to_vec()));

        if !in_build_dir {
            return;
        }
        if self.prebuilt_glob {
            if !self.prebuilt_copied {
                self.cmake.push_str(PREBUILT_GLOB);
                self.prebuilt_copied = true;
            }
            return;
        }
        let line = format!(
            "configure_file({} {} COPYONLY)\n",
            self.fmt.location(&location),
            self.fmt.substitute(&quote(output, false))
        );
        self.cmake.push_str(&line);
    }

    fn directory(&mut self, output: &str) {
        if output.starts_with(SOURCE_DIR_PLACEHOLDER) || output == BUILD_DIR_PLACEHOLDER {
            return;
        }
        let line = self.fmt.format(&format!("file(MAKE_DIRECTORY {})\n", quote(output, false)));
        self.cmake.push_str(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileTarget, SourceFile};

    fn emitter(targets: &[Target]) -> Emitter<'_> {
        Emitter::new(
            targets,
            CmakeFormatter::new("SOURCE_DIR"),
            Platform::Linux,
            vec!["C"],
            None,
            false,
            BTreeMap::new(),
        )
    }

    fn module(kind: ModuleType, name: &str, output: &str) -> Module {
        let mut m = Module::new(kind, output);
        m.name = name.to_string();
        m
    }

    fn target(module: Module) -> Target {
        Target::from(TargetKind::Module(module))
    }

    #[test]
    fn test_system_libraries_and_whole_archive() {
        let z = module(ModuleType::StaticLib, "z.static", "@build_dir@/libz.a");
        let mut app = module(ModuleType::Executable, "app", "@build_dir@/app");
        app.libs = vec![
            LibRef::whole_archive("@build_dir@/libz.a"),
            LibRef::new("dl"),
            LibRef::new("c"),
            LibRef::new("m"),
        ];
        app.link_flags = vec![Flag::from("-pthread")];
        let targets = vec![target(z), target(app.clone())];
        let mut e = emitter(&targets);
        e.emit(&targets[1]).unwrap();
        assert!(e.cmake.contains(
            "target_link_libraries(app PRIVATE -Wl,-whole-archive z.static -Wl,-no-whole-archive\n"
        ) || e.cmake.contains("-Wl,-whole-archive\n    z.static\n    -Wl,-no-whole-archive\n"));
        assert!(e.cmake.contains("${CMAKE_DL_LIBS}"));
        assert!(e.cmake.contains("Threads::Threads"));
        assert!(!e.cmake.contains("target_link_options"));
        assert!(!e.cmake.contains("add_dependencies"));
        assert!(uses_threads(&targets));
    }

    #[test]
    fn test_object_only_target() {
        let obj = module(ModuleType::ObjectLib, "a.o", "@build_dir@/a.o");
        let mut lib = module(ModuleType::StaticLib, "a.static", "@build_dir@/out/liba.a");
        lib.objects = vec!["@build_dir@/a.o".to_string(), "@source_dir@/prebuilt.o".to_string()];
        lib.module_name = Some("a".to_string());
        let targets = vec![target(obj), target(lib)];
        let mut e = emitter(&targets);
        e.emit(&targets[1]).unwrap();
        let cmake = &e.cmake;
        assert!(cmake.contains("set_source_files_properties(${SOURCE_DIR}/prebuilt.o PROPERTIES EXTERNAL_OBJECT ON)"));
        assert!(cmake.contains("add_library(a.static STATIC $<TARGET_OBJECTS:a.o> ${SOURCE_DIR}/prebuilt.o)"));
        assert!(cmake.contains("set_target_properties(a.static PROPERTIES LINKER_LANGUAGE C)"));
        assert!(cmake.contains("set_target_properties(a.static PROPERTIES OUTPUT_NAME a)"));
        assert!(cmake.contains("set_target_output_subdir(a.static ARCHIVE_OUTPUT_DIRECTORY out)"));
    }

    #[test]
    fn test_empty_module_gets_placeholder_source() {
        let exe = module(ModuleType::Executable, "app", "@build_dir@/app");
        let targets = vec![target(exe)];
        let mut e = emitter(&targets);
        e.emit(&targets[0]).unwrap();
        assert!(e.cmake.contains("file(WRITE ${CMAKE_CURRENT_BINARY_DIR}/empty.c \"\")"));
        assert!(e.cmake.contains("add_executable(app ${CMAKE_CURRENT_BINARY_DIR}/empty.c)"));
    }

    #[test]
    fn test_incompatible_source_flags() {
        let mut a = module(ModuleType::ObjectLib, "a", "@build_dir@/a.o");
        let mut source = SourceFile::new("@source_dir@/a.c", None);
        source.compile_flags = vec![Flag::from("-DA")];
        a.sources.push(source.clone());
        let mut b = module(ModuleType::ObjectLib, "b", "@build_dir@/b.o");
        source.compile_flags = vec![Flag::from("-DB")];
        b.sources.push(source);
        let targets = vec![target(a), target(b)];
        let mut e = emitter(&targets);
        e.emit(&targets[0]).unwrap();
        let err = e.emit(&targets[1]).unwrap_err();
        assert!(matches!(err, MigratorError::IncompatibleSourceProperty { property: "COMPILE_OPTIONS", .. }));
    }

    #[test]
    fn test_mixed_language_standard_flags() {
        let mut lib = module(ModuleType::StaticLib, "mix", "@build_dir@/libmix.a");
        lib.sources = vec![
            SourceFile::new("@source_dir@/a.c", Some(crate::model::Language::C)),
            SourceFile::new("@source_dir@/b.cpp", Some(crate::model::Language::Cxx)),
        ];
        lib.compile_flags = vec![Flag::from("-O2"), Flag::from("-std=c++17"), Flag::group(["-arch", "arm64"])];
        let targets = vec![target(lib)];
        let mut e = emitter(&targets);
        e.emit(&targets[0]).unwrap();
        assert!(e.cmake.contains("target_compile_options(mix PRIVATE -O2 \"SHELL:-arch arm64\")"));
        assert!(e.cmake.contains("target_language_compile_options(mix CXX PRIVATE -std=c++17)"));
    }

    #[test]
    fn test_copy_from_source_and_from_build() {
        let lib = module(ModuleType::SharedLib, "foo", "@build_dir@/libfoo.so.1");
        let header = CopyTarget {
            name: "a_h".to_string(),
            source: "@source_dir@/a.h".to_string(),
            output: "@build_dir@/include/a.h".to_string(),
            dependencies: Vec::new(),
        };
        let link = CopyTarget {
            name: "libfoo_so".to_string(),
            source: "@build_dir@/libfoo.so.1".to_string(),
            output: "@build_dir@/lib/libfoo.so".to_string(),
            dependencies: Vec::new(),
        };
        let targets = vec![
            target(lib),
            Target::from(TargetKind::Copy(header)),
            Target::from(TargetKind::Copy(link)),
        ];
        let mut e = emitter(&targets);
        e.emit(&targets[1]).unwrap();
        e.emit(&targets[2]).unwrap();
        assert!(e.cmake.contains(
            "configure_file(${SOURCE_DIR}/a.h ${CMAKE_CURRENT_BINARY_DIR}/include/a.h COPYONLY)"
        ));
        assert!(e.cmake.contains("${CMAKE_COMMAND} -E create_symlink ../libfoo.so.1 ${CMAKE_CURRENT_BINARY_DIR}/lib/libfoo.so"));
        assert!(e.cmake.contains("\n    DEPENDS\n        foo"));
        assert!(e.cmake.contains("add_custom_target(libfoo_so ALL DEPENDS ${CMAKE_CURRENT_BINARY_DIR}/lib/libfoo.so)"));
        assert!(!e.cmake.contains("find_program"));
    }

    #[test]
    fn test_command_finds_program_once() {
        let command = Command {
            name: String::new(),
            program: "python3".to_string(),
            args: vec![Flag::from("gen.py")],
            output: "@build_dir@/gen/out.h".to_string(),
            extra_outputs: Vec::new(),
            working_dir: Some("@build_dir@/gen".to_string()),
            parameters: BTreeMap::from([("LANG".to_string(), "C".to_string())]),
            dependencies: Vec::new(),
        };
        let targets = vec![Target::from(TargetKind::Cmd(command.clone()))];
        let mut e = emitter(&targets);
        e.emit(&targets[0]).unwrap();
        e.emit(&targets[0]).unwrap();
        assert_eq!(e.cmake.matches("find_program(PYTHON3 python3)").count(), 1);
        assert!(e.cmake.contains("${CMAKE_COMMAND} -E env LANG=C\n        ${PYTHON3} gen.py"));
        assert!(e.cmake.contains("WORKING_DIRECTORY \"${CMAKE_CURRENT_BINARY_DIR}/gen\""));
        assert!(e.cmake.contains("add_custom_target(gen_out_h ALL DEPENDS"));
    }

    #[test]
    fn test_only_cmake_is_a_known_program() {
        let strip = Command {
            name: "strip_app".to_string(),
            program: "objcopy".to_string(),
            args: vec![Flag::from("--strip-all"), Flag::from("app")],
            output: "@build_dir@/app.stripped".to_string(),
            extra_outputs: Vec::new(),
            working_dir: None,
            parameters: BTreeMap::new(),
            dependencies: Vec::new(),
        };
        let targets = vec![Target::from(TargetKind::Cmd(strip))];
        let mut e = emitter(&targets);
        e.emit(&targets[0]).unwrap();
        assert!(e.cmake.contains("find_program(OBJCOPY objcopy)"));
        assert!(!e.cmake.contains("CMAKE_OBJCOPY"));
    }

    #[test]
    fn test_variables() {
        let upper = Variable {
            name: "SDK_DIR".to_string(),
            placeholder: "@SDK_DIR@".to_string(),
            value: "/opt/sdk".to_string(),
            dependencies: Vec::new(),
        };
        let lower = Variable {
            name: "tools".to_string(),
            placeholder: "@tools@".to_string(),
            value: "/opt/tools".to_string(),
            dependencies: Vec::new(),
        };
        let targets = vec![
            Target::from(TargetKind::Variable(upper)),
            Target::from(TargetKind::Variable(lower)),
        ];
        let mut e = Emitter::new(
            &targets,
            CmakeFormatter::new("SOURCE_DIR"),
            Platform::Linux,
            Vec::new(),
            None,
            false,
            BTreeMap::from([("tools".to_string(), "/usr/local/tools".to_string())]),
        );
        e.emit(&targets[0]).unwrap();
        e.emit(&targets[1]).unwrap();
        assert!(e.cmake.contains("set(SDK_DIR /opt/sdk CACHE STRING \"\")\n"));
        assert!(e.cmake.contains("set(tools /usr/local/tools)\n"));
    }

    #[test]
    fn test_files_and_directories() {
        let file = |output: &str| {
            Target::from(TargetKind::File(FileTarget {
                output: output.to_string(),
                content: b"data".to_vec(),
                dependencies: Vec::new(),
            }))
        };
        let targets = vec![
            file("@build_dir@/config.h"),
            file("@source_dir@/captured.c"),
            file("/usr/include/external.h"),
        ];
        let mut e = emitter(&targets);
        for t in &targets {
            e.emit(t).unwrap();
        }
        e.directory("@build_dir@/out");
        e.directory("@source_dir@/ignored");
        let locations: Vec<&str> = e.files.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(locations, vec!["prebuilt/config.h", "source/captured.c", "external/usr/include/external.h"]);
        assert!(e.cmake.contains(
            "configure_file(${CMAKE_CURRENT_LIST_DIR}/prebuilt/config.h ${CMAKE_CURRENT_BINARY_DIR}/config.h COPYONLY)"
        ));
        assert!(!e.cmake.contains("captured.c"));
        assert!(!e.cmake.contains("external.h"));
        assert!(e.cmake.contains("file(MAKE_DIRECTORY ${CMAKE_CURRENT_BINARY_DIR}/out)"));
        assert!(!e.cmake.contains("ignored"));
    }

    #[test]
    fn test_prebuilt_glob() {
        let targets: Vec<Target> = (0..4)
            .map(|i| {
                Target::from(TargetKind::File(FileTarget {
                    output: format!("@build_dir@/f{i}.h"),
                    content: Vec::new(),
                    dependencies: Vec::new(),
                }))
            })
            .collect();
        let mut e = emitter(&targets);
        for t in &targets {
            e.emit(t).unwrap();
        }
        assert_eq!(e.cmake.matches("file(GLOB_RECURSE").count(), 1);
        assert!(!e.cmake.contains("configure_file(${CMAKE_CURRENT_LIST_DIR}"));
        assert_eq!(e.files.len(), 4);
    }

    #[test]
    fn test_module_copy_alias() {
        let exe = module(ModuleType::Executable, "tool", "@build_dir@/tool");
        let copy = ModuleCopy {
            name: "tool_copy".to_string(),
            module_name: None,
            source: "@build_dir@/tool".to_string(),
            output: "@build_dir@/bin/tool".to_string(),
            dependencies: Vec::new(),
        };
        let targets = vec![target(exe), Target::from(TargetKind::ModuleCopy(copy))];
        let mut e = emitter(&targets);
        e.emit(&targets[1]).unwrap();
        assert!(e.cmake.contains("add_executable(tool_copy ALIAS tool)"));
    }
}
