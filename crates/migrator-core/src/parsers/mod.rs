//! # Log Parsers
//!
//! A build log is fed line by line through a chain of parsers sorted by
//! priority. Early parsers clean up raw lines (substitutions, directory
//! tracking, continuation lines), the tokenizer turns lines into commands,
//! and tool parsers turn commands into targets.
//!
//! Each parser sees one [`LogEntry`] at a time and may rewrite it, split it
//! into several entries (which continue through the remaining parsers only)
//! or swallow it. Entries that leave the chain as targets are registered in
//! the [`ParserContext`].

mod clang_gcc;
mod cmake_tool;
mod copy_tools;
mod gnu_ar;
mod msvc_rc;
mod text;

pub use clang_gcc::{ClangGccParser, split_multiarch};
pub use cmake_tool::CmakeToolParser;
pub use copy_tools::CopyToolsParser;
pub use gnu_ar::GnuArParser;
pub use msvc_rc::MsvcRcParser;
pub use text::{
    CommandTokenizerParser, InlineFileParser, LineAccumulatorParser, MakeLogParser,
    ReplaceLineParser, ResponseFileParser,
};

use crate::Result;
use crate::context::{LogSpec, LogType, ParserContext, PendingTarget};
use crate::model::{Flag, Target};
use crate::settings::Settings;
use crate::tokenizer::ShellCommand;
use regex::Regex;
use std::path::Path;
use tracing::{debug, error, info};

// =============================================================================
// ENTRIES
// =============================================================================

/// One unit of work flowing through the parser chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// A raw log line.
    Line(String),
    /// End of the current log.
    Eof,
    /// A tokenized command.
    Command(ShellCommand),
    /// A target produced by a tool parser.
    Target(PendingTarget),
}

impl LogEntry {
    #[must_use]
    pub fn tokens(&self) -> Option<&[String]> {
        match self {
            Self::Command(cmd) if !cmd.tokens.is_empty() => Some(&cmd.tokens),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Line(line) => line.clone(),
            Self::Eof => "<eof>".to_string(),
            Self::Command(cmd) => cmd.tokens.join(" "),
            Self::Target(target) => target.output().to_string(),
        }
    }
}

impl From<Target> for LogEntry {
    fn from(target: Target) -> Self {
        Self::Target(PendingTarget {
            target,
            inline: Vec::new(),
        })
    }
}

impl From<PendingTarget> for LogEntry {
    fn from(target: PendingTarget) -> Self {
        Self::Target(target)
    }
}

/// What a parser did with an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Continue with a rewritten entry.
    Replace(LogEntry),
    /// Continue with each entry through the remaining parsers.
    Split(Vec<LogEntry>),
    /// Stop processing the entry.
    Drop,
}

// =============================================================================
// PARSER TRAIT
// =============================================================================

/// A stage of the parser chain.
pub trait LogParser {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Lower runs first.
    fn priority(&self) -> i32;

    /// Inspect an entry. `Ok(None)` passes it on unchanged.
    fn parse(&mut self, entry: &LogEntry, ctx: &mut ParserContext) -> Result<Option<Outcome>>;
}

/// Compile `--ignore_*_flags` style regex lists.
pub(crate) fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(Into::into))
        .collect()
}

/// Drop flags matching any of `patterns`. Groups match on their joined text.
pub(crate) fn filter_flags(patterns: &[Regex], flags: Vec<Flag>) -> Vec<Flag> {
    if patterns.is_empty() {
        return flags;
    }
    flags
        .into_iter()
        .filter(|flag| {
            let text = flag.joined();
            !patterns.iter().any(|re| re.is_match(&text))
        })
        .collect()
}

// =============================================================================
// CHAIN
// =============================================================================

/// Parsers applicable to one log, in priority order.
pub struct ParserChain {
    parsers: Vec<Box<dyn LogParser>>,
}

impl ParserChain {
    /// Build the chain for a log type from settings.
    pub fn new(settings: &Settings, log_type: LogType, ctx: &ParserContext) -> Result<Self> {
        let mut parsers: Vec<Box<dyn LogParser>> = vec![
            Box::new(ReplaceLineParser::new(&settings.replace_line)?),
            Box::new(MakeLogParser::new(log_type, ctx.working_dir())?),
            Box::new(LineAccumulatorParser::new()),
            Box::new(CommandTokenizerParser::new(
                settings.tokenizer_ruleset(),
                settings.command_substitution,
            )?),
            Box::new(InlineFileParser::new()),
            Box::new(ResponseFileParser::new(settings.tokenizer_ruleset())?),
            Box::new(ClangGccParser::new(ctx.platform(), settings)?),
            Box::new(GnuArParser::new(ctx.platform())?),
            Box::new(CopyToolsParser::new()?),
            Box::new(CmakeToolParser::new(ctx.platform())?),
            Box::new(MsvcRcParser::new(settings)?),
        ];
        parsers.sort_by_key(|p| p.priority());
        debug!(
            parsers = ?parsers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "parser chain ready"
        );
        Ok(Self { parsers })
    }

    /// Chain from explicit parsers (sorted by priority).
    #[must_use]
    pub fn from_parsers(mut parsers: Vec<Box<dyn LogParser>>) -> Self {
        parsers.sort_by_key(|p| p.priority());
        Self { parsers }
    }

    /// Run an entry through the whole chain.
    pub fn feed(&mut self, entry: LogEntry, ctx: &mut ParserContext) {
        ctx.set_entry_working_dir(None);
        self.run(0, entry, ctx);
        ctx.set_entry_working_dir(None);
    }

    fn run(&mut self, start: usize, entry: LogEntry, ctx: &mut ParserContext) {
        let mut entry = entry;
        for idx in start..self.parsers.len() {
            if let LogEntry::Command(cmd) = &entry {
                ctx.set_entry_working_dir(Some(&cmd.working_dir));
            }
            let parser = &mut self.parsers[idx];
            match parser.parse(&entry, ctx) {
                Ok(None) => {}
                Ok(Some(Outcome::Replace(next))) => entry = next,
                Ok(Some(Outcome::Split(entries))) => {
                    for next in entries {
                        self.run(idx + 1, next, ctx);
                    }
                    return;
                }
                Ok(Some(Outcome::Drop)) => return,
                Err(e) => {
                    error!(
                        parser = parser.name(),
                        entry = %entry.describe(),
                        error = %e,
                        "failed to parse entry, log may be parsed incorrectly"
                    );
                }
            }
        }
        if let LogEntry::Target(target) = entry {
            ctx.register(target);
        }
    }
}

/// Parse one log file into the context.
pub fn parse_log(ctx: &mut ParserContext, settings: &Settings, log: &LogSpec) -> Result<()> {
    let path = Path::new(&log.path);
    let bytes = std::fs::read(path).map_err(|e| crate::MigratorError::io(path, e))?;
    let content = String::from_utf8_lossy(&bytes);
    info!(log = %log.path, log_type = %log.log_type, "parsing log");

    let mut chain = ParserChain::new(settings, log.log_type, ctx)?;
    for line in content.lines() {
        chain.feed(LogEntry::Line(line.trim_end_matches('\r').to_string()), ctx);
    }
    chain.feed(LogEntry::Eof, ctx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Directory, TargetKind};
    use crate::platform::Platform;

    struct Splitter;

    impl LogParser for Splitter {
        fn name(&self) -> &'static str {
            "splitter"
        }

        fn priority(&self) -> i32 {
            0
        }

        fn parse(&mut self, entry: &LogEntry, _ctx: &mut ParserContext) -> Result<Option<Outcome>> {
            let LogEntry::Line(line) = entry else {
                return Ok(None);
            };
            Ok(Some(Outcome::Split(
                line.split(',').map(|s| LogEntry::Line(s.to_string())).collect(),
            )))
        }
    }

    struct DirMaker {
        seen: usize,
    }

    impl LogParser for DirMaker {
        fn name(&self) -> &'static str {
            "dir_maker"
        }

        fn priority(&self) -> i32 {
            1
        }

        fn parse(&mut self, entry: &LogEntry, _ctx: &mut ParserContext) -> Result<Option<Outcome>> {
            let LogEntry::Line(line) = entry else {
                return Ok(None);
            };
            self.seen += 1;
            if line == "bad" {
                return Err(crate::MigratorError::Parse("bad line".to_string()));
            }
            Ok(Some(Outcome::Replace(LogEntry::from(Target::from(
                TargetKind::Directory(Directory {
                    output: format!("@build_dir@/{line}"),
                    dependencies: Vec::new(),
                }),
            )))))
        }
    }

    fn context() -> ParserContext {
        let settings = Settings {
            logs: vec!["make:build.log".to_string()],
            source_dir: Some("/src".to_string()),
            build_dirs: vec!["/build".to_string()],
            platform: Some(Platform::Linux),
            ..Settings::default()
        };
        ParserContext::new(&settings, "/").unwrap()
    }

    #[test]
    fn test_split_entries_continue_with_remaining_parsers() {
        let mut ctx = context();
        let mut chain = ParserChain::from_parsers(vec![
            Box::new(DirMaker { seen: 0 }),
            Box::new(Splitter),
        ]);
        chain.feed(LogEntry::Line("a,b".to_string()), &mut ctx);
        let outputs: Vec<&str> = ctx.targets().iter().map(Target::output).collect();
        assert_eq!(outputs, vec!["@build_dir@/a", "@build_dir@/b"]);
    }

    #[test]
    fn test_parser_errors_do_not_stop_the_chain() {
        let mut ctx = context();
        let mut chain = ParserChain::from_parsers(vec![Box::new(DirMaker { seen: 0 })]);
        chain.feed(LogEntry::Line("bad".to_string()), &mut ctx);
        chain.feed(LogEntry::Line("ok".to_string()), &mut ctx);
        assert_eq!(ctx.targets().len(), 1);
    }

    #[test]
    fn test_filter_flags_matches_joined_groups() {
        let patterns = compile_patterns(&["^-arch x86".to_string()]).unwrap();
        let flags = vec![
            Flag::group(["-arch", "x86_64"]),
            Flag::group(["-arch", "arm64"]),
            Flag::from("-O2"),
        ];
        let kept = filter_flags(&patterns, flags);
        assert_eq!(kept, vec![Flag::group(["-arch", "arm64"]), Flag::from("-O2")]);
    }
}
