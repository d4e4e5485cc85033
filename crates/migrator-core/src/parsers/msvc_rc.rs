//! # Resource Compiler
//!
//! `rc.exe` invocations become object libraries with a single RC source.
//! The resource compiler has no dependency output, so the `.rc` file is
//! scanned for `#include` directives and for icons, bitmaps and other
//! files it embeds.

use super::{LogEntry, LogParser, Outcome, compile_patterns, filter_flags};
use crate::context::{Dependencies, ParserContext, PendingTarget};
use crate::model::{Flag, Language, Module, ModuleType, SourceFile, Target, TargetKind};
use crate::paths;
use crate::platform::Platform;
use crate::settings::Settings;
use crate::{MigratorError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

/// Options carrying a value, either attached (`/dFOO`) or as the next token.
/// Longer names come first so `/ln` is not read as `/l` + `n`.
const VALUE_OPTIONS: &[&str] = &["fo", "ln", "gn", "d", "u", "l", "g", "i", "c"];
const SWITCHES: &[&str] = &["nologo", "r", "v", "x", "n", "y", "w"];

pub struct MsvcRcParser {
    program_re: Regex,
    include_re: Regex,
    resource_re: Regex,
    ignore_compile_flags: Vec<Regex>,
}

#[derive(Debug, Default)]
struct RcInvocation {
    output: Option<String>,
    include_dirs: Vec<String>,
    compile_flags: Vec<Flag>,
    infiles: Vec<String>,
}

impl MsvcRcParser {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            program_re: Platform::Windows.program_regex(&["rc"])?,
            include_re: Regex::new(r#"^\s*#\s*include\s+["<](?P<path>[^\s][^<>"]*)[>"]"#)?,
            resource_re: Regex::new(
                r#"^\s*[_A-Za-z0-9]+\s+(?:BITMAP|CURSOR|FONT|HTML|ICON)\s+(?:DISCARDABLE\s+)?["<](?P<path>[^\s][^<>"]*)[>"]"#,
            )?,
            ignore_compile_flags: compile_patterns(&settings.ignore_compile_flags)?,
        })
    }

    fn scan(args: &[String]) -> Result<RcInvocation> {
        let mut inv = RcInvocation::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let option = arg
                .strip_prefix('/')
                .or_else(|| arg.strip_prefix('-'))
                .filter(|_| !arg.to_ascii_lowercase().ends_with(".rc"));
            let Some(option) = option else {
                inv.infiles.push(arg.clone());
                continue;
            };
            let lower = option.to_ascii_lowercase();
            if SWITCHES.contains(&lower.as_str()) {
                if lower == "w" {
                    inv.compile_flags.push(Flag::from("/w"));
                }
                continue;
            }
            let Some(name) = VALUE_OPTIONS.iter().find(|name| lower.starts_with(*name)) else {
                return Err(MigratorError::Parse(format!("unknown rc option '{arg}'")));
            };
            let attached = &option[name.len()..];
            let value = if attached.is_empty() {
                iter.next()
                    .cloned()
                    .ok_or_else(|| MigratorError::Parse(format!("rc option '{arg}' expects a value")))?
            } else {
                attached.to_string()
            };
            match *name {
                "fo" => inv.output = Some(value),
                "i" => inv.include_dirs.push(value),
                "d" => inv.compile_flags.push(Flag::from(format!("-D{value}"))),
                "u" => inv.compile_flags.push(Flag::from(format!("-U{value}"))),
                "c" => inv.compile_flags.push(Flag::group(["/c".to_string(), value])),
                other => inv.compile_flags.push(Flag::from(format!("/{other}{value}"))),
            }
        }
        Ok(inv)
    }

    /// Record included headers and embedded resources of `source`.
    fn add_included_dependencies(
        &self,
        ctx: &ParserContext,
        source: &str,
        include_dirs: &[String],
        cwd: &str,
        seen: &mut BTreeSet<String>,
        deps: &mut Dependencies,
    ) {
        if !seen.insert(source.to_string()) {
            return;
        }
        let content = match std::fs::read(source) {
            Ok(content) => String::from_utf8_lossy(&content).into_owned(),
            Err(_) => {
                warn!(path = source, "file not found, unable to enumerate included files");
                return;
            }
        };
        let platform = ctx.platform();
        let source_dir = paths::dirname(source).to_string();
        let mut search_dirs = vec![source_dir.clone(), cwd.to_string()];
        search_dirs.extend(include_dirs.iter().map(|d| platform.path_join(cwd, d)));

        for line in content.lines() {
            if let Some(caps) = self.resource_re.captures(line) {
                let rel = caps["path"].trim();
                let found = [cwd, source_dir.as_str()]
                    .iter()
                    .map(|dir| platform.normalize_path(&platform.path_join(dir, rel)))
                    .find(|path| Path::new(path).exists());
                match found {
                    Some(path) => {
                        ctx.file_arg(&path, deps);
                    }
                    None => warn!(resource = rel, "unable to resolve resource"),
                }
                continue;
            }
            let Some(caps) = self.include_re.captures(line) else {
                continue;
            };
            let rel = caps["path"].trim();
            let found = search_dirs
                .iter()
                .map(|dir| platform.normalize_path(&platform.path_join(dir, rel)))
                .find(|path| Path::new(path).is_file());
            match found {
                Some(path) => {
                    self.add_included_dependencies(ctx, &path, include_dirs, cwd, seen, deps);
                    ctx.file_arg(&path, deps);
                }
                None => debug!(include = rel, "unable to resolve include"),
            }
        }
    }
}

impl LogParser for MsvcRcParser {
    fn name(&self) -> &'static str {
        "msvc_rc"
    }

    fn priority(&self) -> i32 {
        7
    }

    fn parse(&mut self, entry: &LogEntry, ctx: &mut ParserContext) -> Result<Option<Outcome>> {
        let Some(tokens) = entry.tokens() else {
            return Ok(None);
        };
        if !self.program_re.is_match(&tokens[0]) {
            return Ok(None);
        }
        // `rc : warning ...` is tool output
        if tokens.len() < 2 || tokens[1] == ":" {
            return Ok(None);
        }

        let inv = Self::scan(&tokens[1..])?;
        let Some(first) = inv.infiles.first() else {
            return Err(MigratorError::Parse("rc without input file".to_string()));
        };
        let include_dirs: Vec<String> = inv
            .include_dirs
            .iter()
            .filter(|dir| {
                let flag = format!("-I{dir}");
                !self.ignore_compile_flags.iter().any(|re| re.is_match(&flag))
            })
            .cloned()
            .collect();
        let compile_flags = filter_flags(&self.ignore_compile_flags, inv.compile_flags.clone());

        let mut deps = Dependencies::new();
        let cwd = ctx.working_dir().to_string();
        let mut seen = BTreeSet::new();
        for infile in &inv.infiles {
            let full = ctx.normalize_path(infile);
            self.add_included_dependencies(ctx, &full, &include_dirs, &cwd, &mut seen, &mut deps);
        }

        let sources: Vec<SourceFile> = inv
            .infiles
            .iter()
            .map(|infile| SourceFile::new(ctx.file_arg(infile, &mut deps), Some(Language::Rc)))
            .collect();
        let output = inv
            .output
            .clone()
            .unwrap_or_else(|| format!("{}.res", paths::split_ext(first).0));
        let output = ctx.output_arg(&output, &mut deps);

        let mut module = Module::new(ModuleType::ObjectLib, output);
        module.include_dirs = include_dirs.iter().map(|d| ctx.dir_arg(d, &mut deps)).collect();
        module.compile_flags = compile_flags;
        module.sources = sources;
        Ok(Some(Outcome::Replace(LogEntry::Target(PendingTarget::new(
            Target::from(TargetKind::Module(module)),
            deps,
        )))))
    }
}
