//! Model rewrites that only make sense for CMake output.

use crate::Result;
use crate::model::{
    BUILD_DIR_PLACEHOLDER, BuildObjectModel, Flag, Module, ModuleType, SOURCE_DIR_PLACEHOLDER, SourceFile, Target,
    TargetKind, output_index,
};
use crate::paths;
use crate::platform::Platform;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Modules do not need to depend on their output directory when every
/// output lands in the build root.
pub fn drop_output_dir_dependencies(targets: &mut [Target]) {
    for target in targets {
        let TargetKind::Module(module) = &mut target.kind else {
            continue;
        };
        let output_dir = paths::dirname(&module.output).to_string();
        module.dependencies.retain(|dep| *dep != output_dir);
    }
}

/// Object library name for the `number`th variant of a source file.
fn variant_name(path: &str, number: usize) -> String {
    let relative = path
        .replace(&format!("{BUILD_DIR_PLACEHOLDER}/"), "")
        .replace(&format!("{SOURCE_DIR_PLACEHOLDER}/"), "");
    format!("{}_{number}", relative.replace(['/', '.'], "_").to_lowercase())
}

/// A bare source reference: path, language and dependencies only.
fn source_reference(source: &SourceFile) -> SourceFile {
    SourceFile {
        dependencies: source.dependencies.clone(),
        ..SourceFile::new(source.path.clone(), source.language)
    }
}

/// `set_source_files_properties` is global to a directory, so a source
/// compiled with different flags by different modules cannot be listed
/// directly in each of them. Every variant of such a source becomes an
/// object library of its own.
pub fn split_conflicting_source_instances(targets: &mut Vec<Target>) {
    let mut first_seen: BTreeMap<&str, (&[Flag], &[String])> = BTreeMap::new();
    let mut conflicting: BTreeSet<String> = BTreeSet::new();
    for module in targets.iter().filter_map(Target::as_module) {
        for source in &module.sources {
            let properties = (source.compile_flags.as_slice(), source.include_dirs.as_slice());
            match first_seen.get(source.path.as_str()) {
                Some(seen) if *seen != properties => {
                    conflicting.insert(source.path.clone());
                }
                Some(_) => {}
                None => {
                    first_seen.insert(&source.path, properties);
                }
            }
        }
    }
    if conflicting.is_empty() {
        return;
    }
    debug!(sources = ?conflicting, "sources compiled with different flags");

    let mut variants: BTreeMap<(String, Vec<Flag>, Vec<String>), String> = BTreeMap::new();
    let mut numbers: BTreeMap<String, usize> = BTreeMap::new();
    let mut new_targets: Vec<(usize, Target)> = Vec::new();
    for (idx, target) in targets.iter_mut().enumerate() {
        let TargetKind::Module(module) = &mut target.kind else {
            continue;
        };
        if module.sources.is_empty() {
            continue;
        }
        let (moved, kept): (Vec<SourceFile>, Vec<SourceFile>) = std::mem::take(&mut module.sources)
            .into_iter()
            .partition(|s| conflicting.contains(&s.path));
        module.sources = kept;
        if moved.is_empty() {
            continue;
        }
        let output_dir = paths::dirname(&module.output).to_string();
        for source in &moved {
            let source = module.inherited_source(source);
            let key = (source.path.clone(), source.compile_flags.clone(), source.include_dirs.clone());
            let output = match variants.get(&key) {
                Some(output) => output.clone(),
                None => {
                    let number = numbers.entry(source.path.clone()).or_default();
                    *number += 1;
                    let name = variant_name(&source.path, *number);
                    let mut object = Module::new(ModuleType::ObjectLib, paths::join(&output_dir, &format!("{name}.o")));
                    object.name = name;
                    object.compile_flags = source.compile_flags.clone();
                    object.include_dirs = source.include_dirs.clone();
                    object.sources = vec![source_reference(&source)];
                    let output = object.output.clone();
                    debug!(object = %output, source = %source.path, "source variant split out");
                    new_targets.push((idx, Target::from(TargetKind::Module(object))));
                    variants.insert(key, output.clone());
                    output
                }
            };
            module.objects.push(output.clone());
            module.dependencies.push(output);
        }
        if module.sources.is_empty() {
            module.compile_flags.clear();
            module.include_dirs.clear();
        }
    }

    // each object library goes right before the first module using it
    for (inserted, (idx, target)) in new_targets.into_iter().enumerate() {
        targets.insert(idx + inserted, target);
    }
}

/// Object libraries compiled with identical flags and linked by exactly the
/// same modules are merged into one `object_lib_<n>` library.
pub fn merge_object_libraries_with_same_arguments(targets: &mut Vec<Target>, project_name: Option<&str>) {
    let index = output_index(targets);
    let pinned: BTreeSet<&str> = targets
        .iter()
        .filter(|t| t.as_module().is_none())
        .flat_map(|t| t.dependencies().iter().map(String::as_str))
        .collect();

    // objects per flag set in first-use order, and the modules using each
    let mut objects_by_flags: BTreeMap<(Vec<Flag>, Vec<String>), Vec<String>> = BTreeMap::new();
    let mut users: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for module in targets.iter().filter_map(Target::as_module) {
        for object in &module.objects {
            let Some(child_target) = index.get(object).map(|&idx| &targets[idx]) else {
                continue;
            };
            if child_target.top_level || pinned.contains(object.as_str()) {
                continue;
            }
            let Some(child) = child_target.as_module().filter(|m| m.module_type == ModuleType::ObjectLib) else {
                continue;
            };
            let Some(first) = child.sources.first() else {
                continue;
            };
            let modules = users.entry(object.clone()).or_default();
            if modules.is_empty() {
                let source = child.inherited_source(first);
                objects_by_flags
                    .entry((source.compile_flags, source.include_dirs))
                    .or_default()
                    .push(object.clone());
            }
            if !modules.contains(&module.output) {
                modules.push(module.output.clone());
            }
        }
    }

    // (merged library, objects it replaces, modules using it)
    let mut merged: Vec<(Target, Vec<String>, Vec<String>)> = Vec::new();
    for objects in objects_by_flags.values() {
        let mut classes: Vec<(Vec<String>, Vec<String>)> = Vec::new();
        for object in objects {
            let mut modules = users.get(object).cloned().unwrap_or_default();
            modules.sort();
            match classes.iter_mut().find(|(signature, _)| *signature == modules) {
                Some((_, members)) => members.push(object.clone()),
                None => classes.push((modules, vec![object.clone()])),
            }
        }
        for (modules, members) in classes.into_iter().filter(|(_, members)| members.len() > 1) {
            let children: Vec<&Module> = members
                .iter()
                .filter_map(|o| index.get(o))
                .filter_map(|&idx| targets[idx].as_module())
                .collect();
            let sources: Vec<SourceFile> = children
                .iter()
                .flat_map(|child| child.sources.iter().map(|s| child.inherited_source(s)))
                .collect();
            let Some(first) = sources.first() else {
                continue;
            };
            let number = (merged.len() + 1).to_string();
            let name = [project_name, Some("object_lib"), Some(number.as_str())]
                .into_iter()
                .flatten()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("_");
            let mut library = Module::new(ModuleType::ObjectLib, format!("{BUILD_DIR_PLACEHOLDER}/{name}.o"));
            library.name = name;
            library.compile_flags = first.compile_flags.clone();
            library.include_dirs = first.include_dirs.clone();
            library.sources = sources.iter().map(source_reference).collect();
            for child in &children {
                for dep in &child.dependencies {
                    if !library.dependencies.contains(dep) {
                        library.dependencies.push(dep.clone());
                    }
                }
            }
            debug!(library = %library.output, objects = ?members, "object libraries merged");
            merged.push((Target::from(TargetKind::Module(library)), members, modules));
        }
    }
    if merged.is_empty() {
        return;
    }

    let replaced: BTreeSet<String> = merged.iter().flat_map(|(_, members, _)| members.iter().cloned()).collect();
    let mut pending: Vec<Option<Target>> = merged.iter().map(|(library, _, _)| Some(library.clone())).collect();
    let mut result = Vec::with_capacity(targets.len());
    for mut target in std::mem::take(targets) {
        if replaced.contains(target.output()) {
            continue;
        }
        if let TargetKind::Module(module) = &mut target.kind {
            for (slot, (library, members, modules)) in pending.iter_mut().zip(&merged) {
                if !modules.contains(&module.output) {
                    continue;
                }
                module.objects.retain(|o| !members.contains(o));
                module.dependencies.retain(|d| !members.contains(d));
                module.objects.push(library.output().to_string());
                module.dependencies.push(library.output().to_string());
                if let Some(library) = slot.take() {
                    result.push(library);
                }
            }
        }
        result.push(target);
    }
    *targets = result;
}

/// Source files cannot carry dependencies in CMake; hoist them to the module.
pub fn move_source_dependencies_to_target(targets: &mut [Target]) {
    for target in targets {
        let TargetKind::Module(module) = &mut target.kind else {
            continue;
        };
        for source in &mut module.sources {
            for dep in std::mem::take(&mut source.dependencies) {
                if !module.dependencies.contains(&dep) {
                    module.dependencies.push(dep);
                }
            }
        }
    }
}

/// Directory targets already created by `configure_file` of a file below them.
/// Returns the outputs to skip; each skipped directory gains a dependency on
/// one of those files.
pub fn redundant_directories(targets: &mut [Target]) -> BTreeSet<String> {
    let mut created_by: BTreeMap<String, String> = BTreeMap::new();
    for target in targets.iter().filter(|t| t.is_file()) {
        let output = target.output();
        let mut dir = paths::dirname(output);
        while !dir.is_empty() && dir != "/" {
            created_by.insert(dir.to_string(), output.to_string());
            dir = paths::dirname(dir);
        }
    }

    let mut skip = BTreeSet::new();
    for target in targets.iter_mut() {
        if !target.is_directory() || target.top_level {
            continue;
        }
        let Some(file) = created_by.get(target.output()) else {
            continue;
        };
        debug!(directory = target.output(), file = %file, "directory created by file");
        skip.insert(target.output().to_string());
        target.dependencies_mut().push(file.clone());
    }
    skip
}

fn strip_wl(value: &str) -> &str {
    value.strip_prefix("-Wl,").unwrap_or(value)
}

/// Split a version link flag into its option name and value.
fn version_flag(flag: &Flag) -> Option<(String, String)> {
    match flag {
        Flag::Group(tokens) => match tokens.as_slice() {
            [name, value] => Some((strip_wl(name).to_string(), strip_wl(value).to_string())),
            _ => None,
        },
        Flag::Single(token) => {
            let body = strip_wl(token);
            let (name, value) = body.split_once(',').or_else(|| body.split_once('='))?;
            if value.contains(',') {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        }
    }
}

/// Turn `-soname`, `-current_version` and `-compatibility_version` link
/// flags of executables and shared libraries into `VERSION`/`SOVERSION`.
pub fn extract_version_properties(targets: &mut [Target]) {
    for target in targets {
        let TargetKind::Module(module) = &mut target.kind else {
            continue;
        };
        if !matches!(module.module_type, ModuleType::Executable | ModuleType::SharedLib) {
            continue;
        }
        let mut kept = Vec::with_capacity(module.link_flags.len());
        for flag in std::mem::take(&mut module.link_flags) {
            match version_flag(&flag) {
                Some((name, value)) if name == "-soname" => {
                    module.compatibility_version = Platform::Linux
                        .parse_shared_lib(&value)
                        .and_then(|naming| naming.version);
                }
                Some((name, value)) if name == "-compatibility_version" => {
                    module.compatibility_version = Some(value);
                }
                Some((name, value)) if name == "-current_version" => module.version = Some(value),
                _ => kept.push(flag),
            }
        }
        module.link_flags = kept;
    }
}

/// Apply `--rename` rules, then replace characters CMake does not accept
/// in target names.
pub fn rename_targets(targets: &mut [Target], rules: &[(Regex, String)]) -> Result<()> {
    let invalid = Regex::new(r"[^a-zA-Z0-9_.+-]")?;
    for target in targets {
        let Some(name) = target.name().map(str::to_string) else {
            continue;
        };
        let mut renamed = name.clone();
        for (re, replacement) in rules {
            renamed = re.replace_all(&renamed, replacement.as_str()).into_owned();
        }
        renamed = invalid.replace_all(&renamed, "_").into_owned();
        if renamed != name {
            debug!(from = %name, to = %renamed, "target renamed");
            target.set_name(renamed);
        }
    }
    Ok(())
}

/// Run every preparation pass. Returns the model to emit and the outputs
/// whose targets must not produce any CMake code.
pub fn prepare(
    model: &BuildObjectModel,
    rules: &[(Regex, String)],
    flat_build_dir: bool,
    project_name: Option<&str>,
) -> Result<(BuildObjectModel, BTreeSet<String>)> {
    let mut targets = model.targets.clone();
    if flat_build_dir {
        drop_output_dir_dependencies(&mut targets);
    }
    split_conflicting_source_instances(&mut targets);
    merge_object_libraries_with_same_arguments(&mut targets, project_name);
    move_source_dependencies_to_target(&mut targets);
    let skip = redundant_directories(&mut targets);
    extract_version_properties(&mut targets);
    rename_targets(&mut targets, rules)?;
    let prepared = BuildObjectModel::new(targets).filter_top_level();
    Ok((prepared, skip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Directory, FileTarget, Module, SourceFile};

    fn shared(flags: Vec<Flag>) -> Target {
        let mut module = Module::new(ModuleType::SharedLib, "@build_dir@/lib/libfoo.so.1.2.3");
        module.name = "foo".to_string();
        module.version = Some("1.2.3".to_string());
        module.link_flags = flags;
        Target::from(TargetKind::Module(module))
    }

    #[test]
    fn test_soname_becomes_soversion() {
        let mut targets = vec![shared(vec![
            Flag::from("-Wl,-soname,libfoo.so.1"),
            Flag::from("-Wl,--as-needed"),
        ])];
        extract_version_properties(&mut targets);
        let module = targets[0].as_module().unwrap();
        assert_eq!(module.compatibility_version.as_deref(), Some("1"));
        assert_eq!(module.link_flags, vec![Flag::from("-Wl,--as-needed")]);
    }

    #[test]
    fn test_darwin_versions() {
        let mut targets = vec![shared(vec![
            Flag::group(["-compatibility_version", "2.0.0"]),
            Flag::from("-Wl,-current_version,2.4.0"),
        ])];
        extract_version_properties(&mut targets);
        let module = targets[0].as_module().unwrap();
        assert_eq!(module.compatibility_version.as_deref(), Some("2.0.0"));
        assert_eq!(module.version.as_deref(), Some("2.4.0"));
        assert!(module.link_flags.is_empty());
    }

    fn source(path: &str, flags: &[&str]) -> SourceFile {
        let mut source = SourceFile::new(path, crate::model::Language::from_path(path));
        source.compile_flags = flags.iter().map(|f| Flag::from(*f)).collect();
        source
    }

    fn module(kind: ModuleType, output: &str, sources: Vec<SourceFile>, objects: &[&str]) -> Target {
        let mut module = Module::new(kind, output);
        module.name = crate::paths::basename(output).to_string();
        module.sources = sources;
        module.objects = objects.iter().map(|o| o.to_string()).collect();
        module.dependencies = module.objects.clone();
        Target::from(TargetKind::Module(module))
    }

    fn outputs(targets: &[Target]) -> Vec<&str> {
        targets.iter().map(Target::output).collect()
    }

    // =========================================================================
    // SOURCE VARIANTS
    // =========================================================================

    #[test]
    fn test_source_compiled_twice_in_one_binary_is_split() {
        let mut targets = vec![module(
            ModuleType::Executable,
            "@build_dir@/bin/app",
            vec![
                source("@source_dir@/main.c", &[]),
                source("@source_dir@/a.c", &["-DA"]),
                source("@source_dir@/a.c", &["-DB"]),
            ],
            &[],
        )];
        split_conflicting_source_instances(&mut targets);

        assert_eq!(
            outputs(&targets),
            vec!["@build_dir@/bin/a_c_1.o", "@build_dir@/bin/a_c_2.o", "@build_dir@/bin/app"]
        );
        let first = targets[0].as_module().unwrap();
        assert_eq!(first.name, "a_c_1");
        assert_eq!(first.compile_flags, vec![Flag::from("-DA")]);
        assert_eq!(first.sources[0].path, "@source_dir@/a.c");
        assert!(first.sources[0].compile_flags.is_empty());
        assert_eq!(targets[1].as_module().unwrap().compile_flags, vec![Flag::from("-DB")]);

        let app = targets[2].as_module().unwrap();
        assert_eq!(app.sources.len(), 1);
        assert_eq!(app.sources[0].path, "@source_dir@/main.c");
        assert_eq!(app.objects, vec!["@build_dir@/bin/a_c_1.o", "@build_dir@/bin/a_c_2.o"]);
    }

    #[test]
    fn test_identical_variants_share_one_object_library() {
        let mut targets = vec![
            module(ModuleType::Executable, "@build_dir@/x", vec![source("@source_dir@/lib/A.c", &["-DA"])], &[]),
            module(ModuleType::Executable, "@build_dir@/y", vec![source("@source_dir@/lib/A.c", &["-DB"])], &[]),
            module(ModuleType::Executable, "@build_dir@/z", vec![source("@source_dir@/lib/A.c", &["-DA"])], &[]),
        ];
        split_conflicting_source_instances(&mut targets);

        assert_eq!(
            outputs(&targets),
            vec![
                "@build_dir@/lib_a_c_1.o",
                "@build_dir@/x",
                "@build_dir@/lib_a_c_2.o",
                "@build_dir@/y",
                "@build_dir@/z"
            ]
        );
        let z = targets[4].as_module().unwrap();
        assert!(z.sources.is_empty());
        assert_eq!(z.objects, vec!["@build_dir@/lib_a_c_1.o"]);
    }

    #[test]
    fn test_consistent_sources_are_left_alone() {
        let mut targets = vec![
            module(ModuleType::Executable, "@build_dir@/x", vec![source("@source_dir@/a.c", &["-DA"])], &[]),
            module(ModuleType::Executable, "@build_dir@/y", vec![source("@source_dir@/a.c", &["-DA"])], &[]),
        ];
        let before = targets.clone();
        split_conflicting_source_instances(&mut targets);
        assert_eq!(targets, before);
    }

    // =========================================================================
    // OBJECT LIBRARY MERGING
    // =========================================================================

    fn object(output: &str, path: &str, flags: &[&str]) -> Target {
        let mut target = module(ModuleType::ObjectLib, output, vec![source(path, &[])], &[]);
        if let Some(module) = target.as_module_mut() {
            module.compile_flags = flags.iter().map(|f| Flag::from(*f)).collect();
        }
        target
    }

    #[test]
    fn test_objects_shared_by_the_same_modules_are_merged() {
        let mut targets = vec![
            object("@build_dir@/x.o", "@source_dir@/x.c", &["-DV"]),
            object("@build_dir@/y.o", "@source_dir@/y.c", &["-DV"]),
            object("@build_dir@/z.o", "@source_dir@/z.c", &["-DV"]),
            module(ModuleType::Executable, "@build_dir@/app1", Vec::new(), &["@build_dir@/x.o", "@build_dir@/y.o"]),
            module(ModuleType::Executable, "@build_dir@/app2", Vec::new(), &["@build_dir@/y.o", "@build_dir@/x.o"]),
            module(ModuleType::Executable, "@build_dir@/app3", Vec::new(), &["@build_dir@/z.o"]),
        ];
        merge_object_libraries_with_same_arguments(&mut targets, Some("proj"));

        assert_eq!(
            outputs(&targets),
            vec![
                "@build_dir@/z.o",
                "@build_dir@/proj_object_lib_1.o",
                "@build_dir@/app1",
                "@build_dir@/app2",
                "@build_dir@/app3"
            ]
        );
        let library = targets[1].as_module().unwrap();
        assert_eq!(library.name, "proj_object_lib_1");
        assert_eq!(library.compile_flags, vec![Flag::from("-DV")]);
        let paths: Vec<&str> = library.sources.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["@source_dir@/x.c", "@source_dir@/y.c"]);
        for app in &targets[2..4] {
            assert_eq!(app.as_module().unwrap().objects, vec!["@build_dir@/proj_object_lib_1.o"]);
            assert_eq!(app.dependencies(), ["@build_dir@/proj_object_lib_1.o"]);
        }
        assert_eq!(targets[4].as_module().unwrap().objects, vec!["@build_dir@/z.o"]);
    }

    #[test]
    fn test_objects_with_different_flags_are_not_merged() {
        let mut targets = vec![
            object("@build_dir@/x.o", "@source_dir@/x.c", &["-DX"]),
            object("@build_dir@/y.o", "@source_dir@/y.c", &["-DY"]),
            module(ModuleType::Executable, "@build_dir@/app", Vec::new(), &["@build_dir@/x.o", "@build_dir@/y.o"]),
        ];
        let before = targets.clone();
        merge_object_libraries_with_same_arguments(&mut targets, None);
        assert_eq!(targets, before);
    }

    #[test]
    fn test_top_level_objects_are_not_merged() {
        let mut targets = vec![
            object("@build_dir@/x.o", "@source_dir@/x.c", &[]),
            object("@build_dir@/y.o", "@source_dir@/y.c", &[]),
            module(ModuleType::Executable, "@build_dir@/app", Vec::new(), &["@build_dir@/x.o", "@build_dir@/y.o"]),
        ];
        targets[0].top_level = true;
        merge_object_libraries_with_same_arguments(&mut targets, None);
        assert_eq!(outputs(&targets), vec!["@build_dir@/x.o", "@build_dir@/y.o", "@build_dir@/app"]);
    }

    #[test]
    fn test_source_dependencies_are_hoisted() {
        let mut module = Module::new(ModuleType::ObjectLib, "@build_dir@/a.o");
        module.dependencies = vec!["@source_dir@/a.c".to_string()];
        let mut source = SourceFile::new("@source_dir@/a.c", None);
        source.dependencies = vec!["@source_dir@/a.c".to_string(), "@build_dir@/gen.h".to_string()];
        module.sources.push(source);
        let mut targets = vec![Target::from(TargetKind::Module(module))];
        move_source_dependencies_to_target(&mut targets);
        let module = targets[0].as_module().unwrap();
        assert_eq!(module.dependencies, vec!["@source_dir@/a.c", "@build_dir@/gen.h"]);
        assert!(module.sources[0].dependencies.is_empty());
    }

    #[test]
    fn test_directory_created_by_file_is_skipped() {
        let mut targets = vec![
            Target::from(TargetKind::Directory(Directory {
                output: "@build_dir@/include".to_string(),
                dependencies: Vec::new(),
            })),
            Target::from(TargetKind::Directory(Directory {
                output: "@build_dir@/empty".to_string(),
                dependencies: Vec::new(),
            })),
            Target::from(TargetKind::File(FileTarget {
                output: "@build_dir@/include/sub/config.h".to_string(),
                content: Vec::new(),
                dependencies: Vec::new(),
            })),
        ];
        let skip = redundant_directories(&mut targets);
        assert_eq!(skip.into_iter().collect::<Vec<_>>(), vec!["@build_dir@/include"]);
        assert_eq!(targets[0].dependencies(), ["@build_dir@/include/sub/config.h"]);
    }

    #[test]
    fn test_rename_and_sanitize() {
        let mut targets = vec![shared(Vec::new())];
        targets[0].set_name("foo bar:1");
        let rules = vec![(Regex::new("^foo").unwrap(), "my_foo".to_string())];
        rename_targets(&mut targets, &rules).unwrap();
        assert_eq!(targets[0].name(), Some("my_foo_bar_1"));
    }

    #[test]
    fn test_flat_build_dir_drops_output_dir() {
        let mut module = Module::new(ModuleType::Executable, "@build_dir@/bin/app");
        module.dependencies = vec!["@build_dir@/bin".to_string(), "@build_dir@/a.o".to_string()];
        let mut targets = vec![Target::from(TargetKind::Module(module))];
        drop_output_dir_dependencies(&mut targets);
        assert_eq!(targets[0].dependencies(), ["@build_dir@/a.o"]);
    }
}
