//! `cmake -E` file operations found in logs of CMake generated builds.

use super::{LogEntry, LogParser, Outcome};
use crate::context::{Dependencies, ParserContext, PendingTarget};
use crate::model::{Directory, Target, TargetKind};
use crate::platform::Platform;
use crate::{MigratorError, Result};
use regex::Regex;
use tracing::warn;

pub struct CmakeToolParser {
    program_re: Regex,
}

impl CmakeToolParser {
    pub fn new(platform: Platform) -> Result<Self> {
        Ok(Self {
            program_re: platform.program_regex(&["cmake"])?,
        })
    }

    fn copies(ctx: &mut ParserContext, source: &str, outputs: &[String]) -> Vec<LogEntry> {
        let mut source_deps = Dependencies::new();
        let source = ctx.file_arg(source, &mut source_deps);
        let mut entries = Vec::new();
        for output in outputs {
            let mut deps = source_deps.clone();
            let output = ctx.output_arg(output, &mut deps);
            if let Some(target) = ctx.process_target_copy(&source, &output, deps) {
                entries.push(LogEntry::Target(target));
            }
        }
        entries
    }
}

impl LogParser for CmakeToolParser {
    fn name(&self) -> &'static str {
        "cmake_tool"
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
        let Some(position) = tokens.iter().position(|t| t == "-E") else {
            return Ok(None);
        };
        let Some((command, args)) = tokens[position + 1..].split_first() else {
            return Err(MigratorError::Parse("cmake -E without command".to_string()));
        };

        let entries = match command.as_str() {
            "cmake_symlink_library" | "create_symlink" | "copy" | "copy_if_different" => {
                let Some((source, outputs)) = args.split_first() else {
                    return Err(MigratorError::Parse(format!("cmake -E {command} expects arguments")));
                };
                Self::copies(ctx, source, outputs)
            }
            "make_directory" => args
                .iter()
                .map(|dir| {
                    let output = ctx.path_arg(dir);
                    LogEntry::Target(PendingTarget::new(
                        Target::from(TargetKind::Directory(Directory {
                            output,
                            dependencies: Vec::new(),
                        })),
                        Dependencies::new(),
                    ))
                })
                .collect(),
            other => {
                warn!(command = other, "unsupported cmake command");
                Vec::new()
            }
        };
        Ok(Some(Outcome::Split(entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Module, ModuleType};
    use crate::settings::Settings;
    use crate::tokenizer::ShellCommand;

    fn context() -> ParserContext {
        let settings = Settings {
            logs: vec!["make:build.log".to_string()],
            source_dir: Some("/nonexistent/src".to_string()),
            build_dirs: vec!["/nonexistent/build".to_string()],
            platform: Some(Platform::Darwin),
            ..Settings::default()
        };
        ParserContext::new(&settings, "/").unwrap()
    }

    fn command(line: &str) -> LogEntry {
        LogEntry::Command(ShellCommand {
            tokens: line.split_whitespace().map(str::to_string).collect(),
            parameters: Default::default(),
            redirections: Vec::new(),
            working_dir: "/nonexistent/build".to_string(),
        })
    }

    #[test]
    fn test_symlink_library() {
        let mut ctx = context();
        let mut lib = Module::new(ModuleType::SharedLib, "@build_dir@/libfoo.1.2.dylib");
        lib.name = "foo".to_string();
        ctx.register(PendingTarget::new(
            Target::from(TargetKind::Module(lib)),
            Dependencies::new(),
        ));
        let mut parser = CmakeToolParser::new(Platform::Darwin).unwrap();
        let result = parser
            .parse(
                &command("/usr/bin/cmake -E cmake_symlink_library libfoo.1.2.dylib libfoo.1.dylib libfoo.dylib"),
                &mut ctx,
            )
            .unwrap();
        let Some(Outcome::Split(entries)) = result else {
            panic!("expected split");
        };
        let outputs: Vec<String> = entries
            .iter()
            .filter_map(|e| match e {
                LogEntry::Target(t) => Some(t.output().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(outputs, vec!["@build_dir@/libfoo.1.dylib", "@build_dir@/libfoo.dylib"]);
    }

    #[test]
    fn test_unrelated_cmake_invocations_pass() {
        let mut ctx = context();
        let mut parser = CmakeToolParser::new(Platform::Darwin).unwrap();
        let result = parser.parse(&command("cmake --build ."), &mut ctx).unwrap();
        assert_eq!(result, None);
        let result = parser.parse(&command("cmake -E echo hi"), &mut ctx).unwrap();
        assert_eq!(result, Some(Outcome::Split(Vec::new())));
    }
}
