//! # Clang / GCC Driver
//!
//! Turns `cc`, `gcc`, `clang` (and C++ variants) invocations into module
//! targets: `-c` produces an object library, everything else links an
//! executable or a shared library. Preprocess-only and compile-to-assembly
//! invocations pass through untouched.

use super::{LogEntry, LogParser, Outcome, compile_patterns, filter_flags};
use crate::context::{Dependencies, ParserContext, PendingTarget};
use crate::model::{Flag, Language, LibRef, Module, ModuleType, SourceFile, Target, TargetKind};
use crate::paths;
use crate::platform::Platform;
use crate::settings::Settings;
use crate::{MigratorError, Result};
use regex::Regex;
use std::process::Command as Process;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Link,
    /// `-c`: compile and assemble, don't link.
    Assemble,
    /// `-S`
    Compile,
    /// `-E`
    Preprocess,
}

/// Where a recognized flag goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Compile,
    Link,
    Both,
}

// =============================================================================
// FLAG TABLES
// =============================================================================

/// Control flags taking a value that don't affect the build graph.
const CONTROL_WITH_VALUE: &[&str] = &["-MF", "-MT", "-MQ"];
const CONTROL: &[&str] = &["-MD", "-MMD", "-MP", "-MG", "-pipe", "-v", "-###"];

const LINK_SWITCHES: &[&str] = &[
    "-all_load",
    "-headerpad_max_install_names",
    "-no-undefined",
    "-nolibc",
    "-nostdlib++",
    "-no-canonical-prefixes",
    "-nostdlib",
    "-nodefaultlibs",
    "-nostartfiles",
    "-single_module",
    "-pie",
    "-no-pie",
    "-rdynamic",
    "-static",
    "-static-libgcc",
    "-static-libstdc++",
];
const LINK_WITH_VALUE: &[&str] = &[
    "-compatibility_version",
    "-current_version",
    "-version-info",
    "-exported_symbols_list",
    "-framework",
    "-rpath",
    "-rpath-link",
    "-install_name",
    "-z",
];
const SHARED_SWITCHES: &[&str] = &["-shared", "-dynamiclib", "-dynamic"];

const COMPILE_SWITCHES: &[&str] = &["-w", "-W", "-pedantic", "-ansi"];
const COMPILE_WITH_VALUE: &[&str] = &[
    "-target",
    "--target",
    "-gcc-toolchain",
    "--gcc-toolchain",
    "--sysroot",
    "-arch",
    "-x",
    "-isystem",
    "-include",
    "-iquote",
    "-idirafter",
];
const COMPILE_PREFIXES: &[&str] = &["-O", "-f", "-std=", "--std=", "-B", "-W"];

const BOTH_WITH_VALUE: &[&str] = &["-isysroot"];
const BOTH_PREFIXES: &[&str] = &["-g", "-m"];

/// Link flags whose value is the next `-Wl,` token.
const CAPTURE_NEXT: &[&str] = &[
    "-Wl,-soname",
    "-Wl,-compatibility_version",
    "-Wl,-current_version",
    "-Wl,-z",
    "-Wl,-version-script",
    "-Wl,--version-script",
    "-Wl,-rpath-link",
    "-Wl,--rpath-link",
    "-Wl,-rpath",
    "-Wl,--rpath",
];
/// Link flags naming a file, with the prefix their value carries.
const FILE_ARGS: &[(&str, &str)] = &[
    ("-exported_symbols_list", ""),
    ("-Wl,-version-script", "-Wl,"),
    ("-Wl,--version-script", "-Wl,"),
];
/// Link flags naming a directory, with the prefix their value carries.
const DIR_ARGS: &[(&str, &str)] = &[
    ("-Wl,-rpath-link", "-Wl,"),
    ("-Wl,--rpath-link", "-Wl,"),
    ("-rpath-link", ""),
    ("-Wl,-rpath", "-Wl,"),
    ("-Wl,--rpath", "-Wl,"),
    ("-rpath", ""),
];

/// Result of scanning the driver's arguments.
#[derive(Debug, Default)]
struct Invocation {
    mode: Option<Mode>,
    output: Option<String>,
    is_shared: bool,
    lib_dirs: Vec<String>,
    include_dirs: Vec<String>,
    compile_flags: Vec<Flag>,
    link_flags: Vec<Flag>,
    infiles: Vec<String>,
}

impl Invocation {
    fn mode(&self) -> Mode {
        self.mode.unwrap_or(Mode::Link)
    }

    fn push(&mut self, route: Route, flag: Flag) {
        match route {
            Route::Compile => self.compile_flags.push(flag),
            Route::Link => self.link_flags.push(flag),
            Route::Both => {
                self.compile_flags.push(flag.clone());
                self.link_flags.push(flag);
            }
        }
    }
}

// =============================================================================
// PARSER
// =============================================================================

pub struct ClangGccParser {
    platform: Platform,
    program_re: Regex,
    static_lib_re: Regex,
    shared_lib_re: Option<Regex>,
    ignore_compile_flags: Vec<Regex>,
    ignore_link_flags: Vec<Regex>,
    scan_implicit_dependencies: bool,
}

impl ClangGccParser {
    pub fn new(platform: Platform, settings: &Settings) -> Result<Self> {
        let shared_lib_re = match platform {
            Platform::Linux => Some(Regex::new(r"^.+\.so(?:\.\d+)*$")?),
            Platform::Darwin => Some(Regex::new(r"^.+\.dylib$")?),
            Platform::Windows => None,
        };
        Ok(Self {
            platform,
            program_re: platform.program_regex(&["cc", "c++", "clang", "clang++", "gcc", "g++"])?,
            static_lib_re: Regex::new(r"^.+\.a$")?,
            shared_lib_re,
            ignore_compile_flags: compile_patterns(&settings.ignore_compile_flags)?,
            ignore_link_flags: compile_patterns(&settings.ignore_link_flags)?,
            scan_implicit_dependencies: settings.scan_implicit_dependencies,
        })
    }

    fn is_lib_path(&self, token: &str) -> bool {
        !token.starts_with('-')
            && (self.static_lib_re.is_match(token)
                || self.shared_lib_re.as_ref().is_some_and(|re| re.is_match(token)))
    }

    /// Sort every argument into compile flags, link flags or inputs.
    fn scan(&self, args: &[String]) -> Result<Invocation> {
        let mut inv = Invocation::default();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            let arg = arg.as_str();
            match arg {
                "-E" => inv.mode = Some(Mode::Preprocess),
                "-S" => {
                    if inv.mode != Some(Mode::Preprocess) {
                        inv.mode = Some(Mode::Compile);
                    }
                }
                "-c" => {
                    if inv.mode.is_none() {
                        inv.mode = Some(Mode::Assemble);
                    }
                }
                "-o" => inv.output = Some(value_of(arg, &mut iter)?),
                "-pthread" => inv.push(Route::Both, Flag::from(arg)),
                "-L" => inv.lib_dirs.push(value_of(arg, &mut iter)?),
                "-I" => inv.include_dirs.push(value_of(arg, &mut iter)?),
                "-D" | "-U" => {
                    let value = value_of(arg, &mut iter)?;
                    inv.push(Route::Compile, Flag::from(format!("{arg}{value}")));
                }
                "-l" => {
                    let value = value_of(arg, &mut iter)?;
                    inv.push(Route::Link, Flag::from(format!("-l{value}")));
                }
                "-Q" => {
                    value_of(arg, &mut iter)?;
                }
                _ if CONTROL.contains(&arg) => {}
                _ if CONTROL_WITH_VALUE.contains(&arg) => {
                    value_of(arg, &mut iter)?;
                }
                _ if SHARED_SWITCHES.contains(&arg) => inv.is_shared = true,
                _ if LINK_SWITCHES.contains(&arg) => inv.push(Route::Link, Flag::from(arg)),
                _ if LINK_WITH_VALUE.contains(&arg) => {
                    let value = value_of(arg, &mut iter)?;
                    inv.push(Route::Link, Flag::group([arg.to_string(), value]));
                }
                _ if COMPILE_SWITCHES.contains(&arg) => inv.push(Route::Compile, Flag::from(arg)),
                _ if COMPILE_WITH_VALUE.contains(&arg) => {
                    let value = value_of(arg, &mut iter)?;
                    inv.push(Route::Compile, Flag::group([arg.to_string(), value]));
                }
                _ if BOTH_WITH_VALUE.contains(&arg) => {
                    let value = value_of(arg, &mut iter)?;
                    inv.push(Route::Both, Flag::group([arg.to_string(), value]));
                }
                _ if arg.starts_with("-o") => inv.output = Some(arg[2..].to_string()),
                _ if arg.starts_with("-L") => inv.lib_dirs.push(arg[2..].to_string()),
                _ if arg.starts_with("-I") => inv.include_dirs.push(arg[2..].to_string()),
                _ if arg.starts_with("-D") || arg.starts_with("-U") => {
                    inv.push(Route::Compile, Flag::from(arg));
                }
                _ if arg.starts_with("-Wl,") || arg.starts_with("-l") => {
                    inv.push(Route::Link, Flag::from(arg));
                }
                _ if arg.starts_with("-stdlib=") => inv.push(Route::Link, Flag::from(arg)),
                _ if arg.starts_with("--target=")
                    || arg.starts_with("--sysroot=")
                    || arg.starts_with("--gcc-toolchain=") =>
                {
                    inv.push(Route::Compile, Flag::from(arg));
                }
                _ if COMPILE_PREFIXES.iter().any(|p| arg.starts_with(p)) => {
                    inv.push(Route::Compile, Flag::from(arg));
                }
                _ if BOTH_PREFIXES.iter().any(|p| arg.starts_with(p)) => {
                    inv.push(Route::Both, Flag::from(arg));
                }
                _ if self.is_lib_path(arg) => inv.push(Route::Link, Flag::from(arg)),
                _ if arg.starts_with('-') && arg.len() > 1 => {
                    debug!(flag = arg, "unknown flag, treated as compile and link flag");
                    inv.push(Route::Both, Flag::from(arg));
                }
                _ => inv.infiles.push(arg.to_string()),
            }
        }
        Ok(inv)
    }

    /// Pull libraries out of the link flags, resolving `-l` names.
    fn extract_libs(
        &self,
        link_flags: Vec<Flag>,
        lib_dirs: &[String],
        ctx: &ParserContext,
        deps: &mut Dependencies,
    ) -> (Vec<Flag>, Vec<LibRef>) {
        let mut remaining = Vec::new();
        let mut libs = Vec::new();
        let mut whole_archive = false;
        let mut static_only = false;

        for flag in link_flags {
            let Flag::Single(arg) = &flag else {
                remaining.push(flag);
                continue;
            };
            let value = if arg.ends_with("--whole-archive") {
                whole_archive = true;
                continue;
            } else if arg.ends_with("--no-whole-archive") {
                whole_archive = false;
                continue;
            } else if arg.ends_with("-Bstatic") {
                static_only = true;
                continue;
            } else if arg.ends_with("-Bdynamic") {
                static_only = false;
                continue;
            } else if let Some(name) = arg.strip_prefix("-l") {
                match name.strip_prefix(':') {
                    Some(file) => {
                        let resolved = lib_dirs
                            .iter()
                            .map(|dir| ctx.platform().path_join(dir, file))
                            .find(|path| {
                                ctx.find_target_by_path(path).is_some()
                                    || std::path::Path::new(&ctx.normalize_path(path)).is_file()
                            })
                            .unwrap_or_else(|| file.to_string());
                        ctx.file_arg(&resolved, deps)
                    }
                    None => ctx.lib_arg(name, lib_dirs, static_only, deps),
                }
            } else if !arg.starts_with("-Wl,") && self.is_lib_path(arg) {
                ctx.file_arg(arg, deps)
            } else {
                remaining.push(flag);
                continue;
            };
            libs.push(if whole_archive {
                LibRef::whole_archive(value)
            } else {
                LibRef::new(value)
            });
        }
        (remaining, libs)
    }

    /// Group value-taking `-Wl,` flags and relocate paths inside link flags.
    fn process_link_flags(flags: Vec<Flag>, ctx: &ParserContext, deps: &mut Dependencies) -> Vec<Flag> {
        let mut result = Vec::with_capacity(flags.len());
        let mut iter = flags.into_iter().peekable();
        while let Some(flag) = iter.next() {
            let flag = match flag {
                Flag::Single(arg) if CAPTURE_NEXT.contains(&arg.as_str()) => match iter.next() {
                    Some(next) => {
                        let mut tokens = vec![arg];
                        tokens.extend(next.tokens().into_iter().map(str::to_string));
                        Flag::Group(tokens)
                    }
                    None => Flag::Single(arg),
                },
                Flag::Single(arg) => Flag::Single(relocate_joined_value(&arg, ctx, deps)),
                group => group,
            };
            result.push(relocate_group_value(flag, ctx, deps));
        }
        result
    }

    /// Run the compiler with `-M` once per architecture to list headers.
    fn implicit_dependencies(
        &self,
        compiler: &str,
        compile_flags: &[Flag],
        include_dirs: &[String],
        sources: &[String],
        cwd: &str,
    ) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut compile_flags = compile_flags.to_vec();
        let host = Platform::host();
        if compiler.contains("clang") && host.is_windows() && self.platform != host {
            match self.platform {
                Platform::Linux => compile_flags.push(Flag::from("--target=i686-pc-linux-gnu")),
                Platform::Darwin => compile_flags.push(Flag::from("--target=i686-apple-darwin10")),
                Platform::Windows => {}
            }
        }

        for flags in split_multiarch(&compile_flags) {
            let mut cmd = Process::new(compiler);
            cmd.arg("-M").current_dir(cwd);
            for flag in &flags {
                cmd.args(flag.tokens());
            }
            cmd.args(include_dirs.iter().map(|d| format!("-I{d}")));
            cmd.args(sources);
            let output = match cmd.output() {
                Ok(output) => output,
                Err(e) => {
                    warn!(compiler, error = %e, "cannot run compiler to scan dependencies");
                    return found;
                }
            };
            if !output.status.success() {
                error!(
                    compiler,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "dependency scan failed"
                );
            }
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                for file in line.trim_end_matches('\\').split_whitespace() {
                    if file.ends_with(':') || sources.iter().any(|s| s == file) {
                        continue;
                    }
                    if !found.iter().any(|f| f == file) {
                        found.push(file.to_string());
                    }
                }
            }
        }
        found
    }
}

fn value_of<'a>(flag: &str, iter: &mut impl Iterator<Item = &'a String>) -> Result<String> {
    iter.next()
        .cloned()
        .ok_or_else(|| MigratorError::Parse(format!("{flag} expects a value")))
}

/// `-Wl,--version-script=x.map` and `-Wl,-rpath,dir` carry a path after
/// `=` or `,`.
fn relocate_joined_value(arg: &str, ctx: &ParserContext, deps: &mut Dependencies) -> String {
    let lookup = FILE_ARGS
        .iter()
        .map(|(name, _)| (*name, true))
        .chain(DIR_ARGS.iter().map(|(name, _)| (*name, false)));
    for (name, is_file) in lookup {
        let Some(rest) = arg.strip_prefix(name) else {
            continue;
        };
        let Some(delim) = rest.chars().next().filter(|c| *c == '=' || *c == ',') else {
            continue;
        };
        let Some((head, value)) = arg.rsplit_once(delim) else {
            continue;
        };
        let value = if is_file {
            ctx.file_arg(value, deps)
        } else {
            ctx.dir_arg(value, deps)
        };
        return format!("{head}{delim}{value}");
    }
    arg.to_string()
}

/// Relocate the value token of a grouped path flag.
fn relocate_group_value(flag: Flag, ctx: &ParserContext, deps: &mut Dependencies) -> Flag {
    let Flag::Group(mut tokens) = flag else {
        return flag;
    };
    let head = tokens.first().cloned().unwrap_or_default();
    let file_prefix = FILE_ARGS.iter().find(|(n, _)| *n == head).map(|(_, p)| (*p, true));
    let dir_prefix = DIR_ARGS.iter().find(|(n, _)| *n == head).map(|(_, p)| (*p, false));
    let Some((prefix, is_file)) = file_prefix.or(dir_prefix) else {
        return Flag::Group(tokens);
    };
    if let Some(last) = tokens.last_mut() {
        let (prefix, value) = match last.strip_prefix(prefix) {
            Some(value) if !prefix.is_empty() => (prefix, value.to_string()),
            _ => ("", last.clone()),
        };
        let value = if is_file {
            ctx.file_arg(&value, deps)
        } else {
            ctx.dir_arg(&value, deps)
        };
        *last = format!("{prefix}{value}");
    }
    Flag::Group(tokens)
}

/// Split a compile flag list with several `-arch` groups into one list per
/// architecture. Each list keeps one `-arch` group in its original position.
#[must_use]
pub fn split_multiarch(flags: &[Flag]) -> Vec<Vec<Flag>> {
    let is_arch = |flag: &Flag| matches!(flag, Flag::Group(tokens) if tokens.first().is_some_and(|t| t == "-arch"));
    let arch_positions: Vec<usize> = flags
        .iter()
        .enumerate()
        .filter(|(_, f)| is_arch(f))
        .map(|(idx, _)| idx)
        .collect();
    if arch_positions.len() <= 1 {
        return vec![flags.to_vec()];
    }
    arch_positions
        .iter()
        .map(|&keep| {
            flags
                .iter()
                .enumerate()
                .filter(|(idx, f)| *idx == keep || !is_arch(f))
                .map(|(_, f)| f.clone())
                .collect()
        })
        .collect()
}

impl LogParser for ClangGccParser {
    fn name(&self) -> &'static str {
        "clang_gcc"
    }

    fn priority(&self) -> i32 {
        7
    }

    fn parse(&mut self, entry: &LogEntry, ctx: &mut ParserContext) -> Result<Option<Outcome>> {
        let Some(tokens) = entry.tokens() else {
            return Ok(None);
        };
        // `${CC:-gcc}` style parameter expansions
        if !self.program_re.is_match(tokens[0].trim_matches(['{', '}', '$'])) {
            return Ok(None);
        }
        let compiler = tokens[0].clone();

        let mut inv = self.scan(&tokens[1..])?;
        let mode = inv.mode();
        if !matches!(mode, Mode::Link | Mode::Assemble) {
            return Ok(None);
        }
        if mode != Mode::Link {
            inv.link_flags.clear();
            inv.lib_dirs.clear();
        }

        let mut deps = Dependencies::new();
        let lib_dirs: Vec<String> = inv
            .lib_dirs
            .iter()
            .filter(|dir| {
                let flag = format!("-L{dir}");
                !self.ignore_link_flags.iter().any(|re| re.is_match(&flag))
            })
            .cloned()
            .collect();
        let link_flags = filter_flags(&self.ignore_link_flags, std::mem::take(&mut inv.link_flags));
        let (link_flags, libs) = self.extract_libs(link_flags, &lib_dirs, ctx, &mut deps);
        let link_flags = Self::process_link_flags(link_flags, ctx, &mut deps);

        let mut objects = Vec::new();
        let mut sources = Vec::new();
        let mut original_sources = Vec::new();
        for infile in &inv.infiles {
            let language = Language::from_path(infile).filter(|l| *l != Language::Rc);
            let path = ctx.file_arg(infile, &mut deps);
            match language {
                Some(language) => {
                    original_sources.push(ctx.normalize_path(infile));
                    sources.push(SourceFile::new(path, Some(language)));
                }
                None => objects.push(path),
            }
        }

        let (compile_flags, raw_include_dirs) = if sources.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            let include_dirs: Vec<String> = inv
                .include_dirs
                .iter()
                .filter(|dir| {
                    let flag = format!("-I{dir}");
                    !self.ignore_compile_flags.iter().any(|re| re.is_match(&flag))
                })
                .cloned()
                .collect();
            (
                filter_flags(&self.ignore_compile_flags, std::mem::take(&mut inv.compile_flags)),
                include_dirs,
            )
        };
        let mut include_dirs: Vec<String> = raw_include_dirs
            .iter()
            .map(|dir| ctx.dir_arg(dir, &mut deps))
            .collect();

        let (module_type, naming, output) = if mode == Mode::Assemble {
            let output = inv.output.clone().unwrap_or_else(|| {
                let first = inv.infiles.first().map(String::as_str).unwrap_or("a");
                format!("{}.o", paths::split_ext(paths::basename(first)).0)
            });
            (ModuleType::ObjectLib, None, output)
        } else {
            let output = inv.output.clone().unwrap_or_else(|| "a.out".to_string());
            if inv.is_shared {
                (ModuleType::SharedLib, self.platform.parse_shared_lib(&output), output)
            } else {
                (ModuleType::Executable, self.platform.parse_executable(&output), output)
            }
        };

        if self.scan_implicit_dependencies && !original_sources.is_empty() {
            let cwd = ctx.working_dir().to_string();
            let found = self.implicit_dependencies(
                &compiler,
                &compile_flags,
                &raw_include_dirs,
                &original_sources,
                &cwd,
            );
            let relocated: Vec<String> = found.iter().map(|dep| ctx.file_arg(dep, &mut deps)).collect();
            let implicit = ctx.implicit_include_dirs(&sources, &include_dirs, &relocated);
            include_dirs.extend(implicit);
        }

        let output = ctx.output_arg(&output, &mut deps);
        let mut module = Module::new(module_type, output);
        if let Some(naming) = naming {
            module.name = naming.target_name;
            module.version = naming.version;
        }
        module.compile_flags = compile_flags;
        module.include_dirs = include_dirs;
        module.link_flags = link_flags;
        module.libs = libs;
        module.objects = objects;
        module.sources = sources;

        debug!(output = %module.output, kind = ?module.module_type, "compiler invocation parsed");
        Ok(Some(Outcome::Replace(LogEntry::Target(PendingTarget::new(
            Target::from(TargetKind::Module(module)),
            deps,
        )))))
    }
}
