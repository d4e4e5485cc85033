//! `ar` archive creation and extraction.

use super::{LogEntry, LogParser, Outcome};
use crate::context::{Dependencies, ParserContext, PendingTarget};
use crate::model::{Module, ModuleType, Target, TargetKind};
use crate::paths;
use crate::platform::Platform;
use crate::{MigratorError, Result};
use regex::Regex;
use tracing::{debug, error};

/// Operation and modifier letters `ar` accepts in its first argument.
const KEY_LETTERS: &str = "dmpqrtxabcDfiNoOPsSTuUvV";

#[derive(Debug, Default)]
struct ArKey {
    extract: bool,
    list: bool,
    /// `a`, `b`, `i`: a member name precedes the archive.
    relpos: bool,
    /// `N`: an instance count precedes the archive.
    count: bool,
}

impl ArKey {
    fn parse(key: &str) -> Option<Self> {
        let letters = key.strip_prefix('-').unwrap_or(key);
        if letters.is_empty() || !letters.chars().all(|c| KEY_LETTERS.contains(c)) {
            return None;
        }
        Some(Self {
            extract: letters.contains('x'),
            list: letters.contains('t'),
            relpos: letters.contains(['a', 'b', 'i']),
            count: letters.contains('N'),
        })
    }
}

pub struct GnuArParser {
    platform: Platform,
    program_re: Regex,
}

impl GnuArParser {
    pub fn new(platform: Platform) -> Result<Self> {
        Ok(Self {
            platform,
            program_re: platform.program_regex(&["ar"])?,
        })
    }

    /// Re-create the object targets of an archive in the current directory.
    fn extract(&self, archives: &[String], ctx: &ParserContext) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for archive in archives {
            let Some(module) = ctx.find_target_by_path(archive).and_then(Target::as_module) else {
                error!(archive = %archive, "cannot find target for archive");
                continue;
            };
            for object in &module.objects {
                let Some(object_target) = ctx.find_target(object) else {
                    debug!(object = %object, "archive member is not a known target");
                    continue;
                };
                let mut copy = object_target.clone();
                let member = paths::basename(object).split('#').next().unwrap_or_default();
                copy.set_output(ctx.path_arg(member));
                copy.set_name(String::new());
                entries.push(LogEntry::from(copy));
            }
        }
        entries
    }
}

impl LogParser for GnuArParser {
    fn name(&self) -> &'static str {
        "gnu_ar"
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

        let mut key = None;
        let mut operands: Vec<String> = Vec::new();
        let mut iter = tokens[1..].iter();
        while let Some(token) = iter.next() {
            if token == "--plugin" || token == "--target" {
                iter.next();
            } else if token.starts_with("--") {
                continue;
            } else if key.is_none() {
                key = Some(
                    ArKey::parse(token)
                        .ok_or_else(|| MigratorError::Parse(format!("unknown ar key '{token}'")))?,
                );
            } else {
                operands.push(token.clone());
            }
        }
        let key = key.ok_or_else(|| MigratorError::Parse("ar without operation".to_string()))?;

        if key.extract {
            return Ok(Some(Outcome::Split(self.extract(&operands, ctx))));
        }
        if key.list {
            return Ok(Some(Outcome::Drop));
        }

        let mut operands = operands.into_iter();
        if key.relpos {
            operands.next();
        }
        if key.count {
            operands.next();
        }
        let archive = operands
            .next()
            .ok_or_else(|| MigratorError::Parse("ar without archive".to_string()))?;

        let mut deps = Dependencies::new();
        let objects: Vec<String> = operands.map(|object| ctx.file_arg(&object, &mut deps)).collect();
        let naming = self.platform.parse_static_lib(&archive);
        let output = ctx.output_arg(&archive, &mut deps);

        let mut module = Module::new(ModuleType::StaticLib, output);
        if let Some(naming) = naming {
            module.name = naming.target_name;
            module.module_name = Some(naming.module_name);
        }
        module.objects = objects;
        Ok(Some(Outcome::Replace(LogEntry::Target(PendingTarget::new(
            Target::from(TargetKind::Module(module)),
            deps,
        )))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::tokenizer::ShellCommand;

    fn context() -> ParserContext {
        let settings = Settings {
            logs: vec!["make:build.log".to_string()],
            source_dir: Some("/nonexistent/src".to_string()),
            build_dirs: vec!["/nonexistent/build".to_string()],
            platform: Some(Platform::Linux),
            ..Settings::default()
        };
        ParserContext::new(&settings, "/").unwrap()
    }

    fn command(line: &str, working_dir: &str) -> LogEntry {
        LogEntry::Command(ShellCommand {
            tokens: line.split_whitespace().map(str::to_string).collect(),
            parameters: Default::default(),
            redirections: Vec::new(),
            working_dir: working_dir.to_string(),
        })
    }

    fn object(ctx: &mut ParserContext, output: &str) {
        ctx.register(PendingTarget::new(
            Target::from(TargetKind::Module(Module::new(ModuleType::ObjectLib, output))),
            Dependencies::new(),
        ));
    }

    #[test]
    fn test_archive_creation() {
        let mut ctx = context();
        object(&mut ctx, "@build_dir@/a.o");
        let mut parser = GnuArParser::new(Platform::Linux).unwrap();
        let result = parser
            .parse(&command("ar rcs libz.a a.o b.o", "/nonexistent/build"), &mut ctx)
            .unwrap();
        let Some(Outcome::Replace(LogEntry::Target(pending))) = result else {
            panic!("expected target");
        };
        let module = pending.target.as_module().unwrap();
        assert_eq!(module.module_type, ModuleType::StaticLib);
        assert_eq!(module.name, "z.static");
        assert_eq!(module.module_name.as_deref(), Some("z"));
        assert_eq!(module.objects, vec!["@build_dir@/a.o", "@build_dir@/b.o"]);
        assert!(module.dependencies.contains(&"@build_dir@/a.o".to_string()));
    }

    #[test]
    fn test_relpos_and_dash_key() {
        let mut ctx = context();
        let mut parser = GnuArParser::new(Platform::Linux).unwrap();
        let result = parser
            .parse(&command("/usr/bin/ar -rb x.o libq.a y.o", "/nonexistent/build"), &mut ctx)
            .unwrap();
        let Some(Outcome::Replace(LogEntry::Target(pending))) = result else {
            panic!("expected target");
        };
        assert_eq!(pending.output(), "@build_dir@/libq.a");
    }

    #[test]
    fn test_list_is_swallowed() {
        let mut ctx = context();
        let mut parser = GnuArParser::new(Platform::Linux).unwrap();
        let result = parser.parse(&command("ar t libz.a", "/nonexistent/build"), &mut ctx).unwrap();
        assert_eq!(result, Some(Outcome::Drop));
    }

    #[test]
    fn test_extract_copies_object_targets() {
        let mut ctx = context();
        object(&mut ctx, "@build_dir@/obj/a.o");
        let mut lib = Module::new(ModuleType::StaticLib, "@build_dir@/libz.a");
        lib.objects = vec!["@build_dir@/obj/a.o".to_string()];
        ctx.register(PendingTarget::new(
            Target::from(TargetKind::Module(lib)),
            Dependencies::new(),
        ));
        ctx.set_entry_working_dir(Some("/nonexistent/build/tmp"));
        let mut parser = GnuArParser::new(Platform::Linux).unwrap();
        let result = parser
            .parse(&command("ar x ../libz.a", "/nonexistent/build/tmp"), &mut ctx)
            .unwrap();
        let Some(Outcome::Split(entries)) = result else {
            panic!("expected split");
        };
        assert_eq!(entries.len(), 1);
        let LogEntry::Target(pending) = &entries[0] else {
            panic!("expected target");
        };
        assert_eq!(pending.output(), "@build_dir@/tmp/a.o");
        assert_eq!(pending.target.name(), None);
    }
}
