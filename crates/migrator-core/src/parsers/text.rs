//! Line level parsers: everything between a raw log line and a tokenized
//! command, plus the command rewrites that need no tool knowledge.

use super::{LogEntry, LogParser, Outcome};
use crate::Result;
use crate::context::{LogType, ParserContext, PendingTarget};
use crate::model::{FileTarget, Target, TargetKind};
use crate::tokenizer::{CommandTokenizer, ShellCommand, TokenizerRuleset};
use regex::Regex;
use std::path::Path;
use tracing::{debug, error, info};

// =============================================================================
// REPLACE LINE
// =============================================================================

/// Applies `--replace_line REGEX REPL` to every raw line. Replacements use
/// `$1`/`${name}` group references.
pub struct ReplaceLineParser {
    replacements: Vec<(Regex, String)>,
}

impl ReplaceLineParser {
    pub fn new(replacements: &[(String, String)]) -> Result<Self> {
        let replacements = replacements
            .iter()
            .map(|(pattern, repl)| Ok((Regex::new(pattern)?, repl.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { replacements })
    }
}

impl LogParser for ReplaceLineParser {
    fn name(&self) -> &'static str {
        "replace_line"
    }

    fn priority(&self) -> i32 {
        -1
    }

    fn parse(&mut self, entry: &LogEntry, _ctx: &mut ParserContext) -> Result<Option<Outcome>> {
        let LogEntry::Line(line) = entry else {
            return Ok(None);
        };
        if self.replacements.is_empty() {
            return Ok(None);
        }
        let mut replaced = line.clone();
        for (re, repl) in &self.replacements {
            replaced = re.replace_all(&replaced, repl.as_str()).into_owned();
        }
        if replaced == *line {
            return Ok(None);
        }
        debug!(from = %line, to = %replaced, "line replaced");
        Ok(Some(Outcome::Replace(LogEntry::Line(replaced))))
    }
}

// =============================================================================
// MAKE / NINJA DIRECTORY TRACKING
// =============================================================================

/// Follows make's `Entering directory`/`Leaving directory` messages and
/// strips ninja's `[n/m] ` progress prefix.
pub struct MakeLogParser {
    log_type: LogType,
    directory_stack: Vec<String>,
    directory_re: Regex,
    progress_re: Regex,
}

impl MakeLogParser {
    pub fn new(log_type: LogType, working_dir: &str) -> Result<Self> {
        Ok(Self {
            log_type,
            directory_stack: vec![working_dir.to_string()],
            directory_re: Regex::new(
                r"(?P<mode>Entering|Leaving) directory ['`](?P<path>[^'`]+)'",
            )?,
            progress_re: Regex::new(r"^\[\d+/\d+\] ")?,
        })
    }

    fn current(&self) -> &str {
        self.directory_stack.last().map(String::as_str).unwrap_or("")
    }
}

impl LogParser for MakeLogParser {
    fn name(&self) -> &'static str {
        "make_log"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn parse(&mut self, entry: &LogEntry, ctx: &mut ParserContext) -> Result<Option<Outcome>> {
        let LogEntry::Line(line) = entry else {
            return Ok(None);
        };

        if let Some(caps) = self.directory_re.captures(line) {
            let dir = ctx.normalize_path(&caps["path"]);
            if &caps["mode"] == "Entering" {
                info!(dir = %dir, "changing current directory");
                self.directory_stack.push(dir);
                ctx.set_working_dir(self.current());
            } else if self.current() == dir && self.directory_stack.len() > 1 {
                self.directory_stack.pop();
                ctx.set_working_dir(self.current());
            } else {
                error!(
                    expected = %dir,
                    top = %self.current(),
                    "directory stack mismatch"
                );
            }
            return Ok(Some(Outcome::Drop));
        }

        if self.log_type == LogType::Ninja {
            let stripped = self.progress_re.replace(line, "");
            if stripped.len() != line.len() {
                return Ok(Some(Outcome::Replace(LogEntry::Line(stripped.into_owned()))));
            }
        }
        Ok(None)
    }
}

// =============================================================================
// LINE CONTINUATION
// =============================================================================

/// Joins lines ending with a backslash.
#[derive(Default)]
pub struct LineAccumulatorParser {
    accumulator: String,
}

impl LineAccumulatorParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogParser for LineAccumulatorParser {
    fn name(&self) -> &'static str {
        "line_accumulator"
    }

    fn priority(&self) -> i32 {
        2
    }

    fn parse(&mut self, entry: &LogEntry, _ctx: &mut ParserContext) -> Result<Option<Outcome>> {
        match entry {
            LogEntry::Line(line) => {
                if let Some(head) = line.strip_suffix('\\') {
                    self.accumulator.push_str(head);
                    return Ok(Some(Outcome::Drop));
                }
                if self.accumulator.is_empty() {
                    return Ok(None);
                }
                let joined = std::mem::take(&mut self.accumulator) + line;
                Ok(Some(Outcome::Replace(LogEntry::Line(joined))))
            }
            LogEntry::Eof if !self.accumulator.is_empty() => {
                let rest = std::mem::take(&mut self.accumulator);
                Ok(Some(Outcome::Split(vec![LogEntry::Line(rest), LogEntry::Eof])))
            }
            _ => Ok(None),
        }
    }
}

// =============================================================================
// TOKENIZER
// =============================================================================

/// Splits lines into commands.
pub struct CommandTokenizerParser {
    tokenizer: CommandTokenizer,
}

impl CommandTokenizerParser {
    pub fn new(ruleset: TokenizerRuleset, command_substitution: bool) -> Result<Self> {
        Ok(Self {
            tokenizer: CommandTokenizer::new(ruleset, command_substitution)?,
        })
    }
}

impl LogParser for CommandTokenizerParser {
    fn name(&self) -> &'static str {
        "command_tokenizer"
    }

    fn priority(&self) -> i32 {
        4
    }

    fn parse(&mut self, entry: &LogEntry, ctx: &mut ParserContext) -> Result<Option<Outcome>> {
        let LogEntry::Line(line) = entry else {
            return Ok(None);
        };
        if line.trim().is_empty() {
            return Ok(Some(Outcome::Drop));
        }
        // most lines of a log are tool output, not commands
        let commands = match self.tokenizer.split_commands(line, ctx.working_dir()) {
            Ok(commands) => commands,
            Err(e) => {
                debug!(line = %line, error = %e, "line is not a command");
                return Ok(Some(Outcome::Drop));
            }
        };
        Ok(Some(Outcome::Split(
            commands
                .into_iter()
                .filter(|cmd| !cmd.tokens.is_empty())
                .map(LogEntry::Command)
                .collect(),
        )))
    }
}

// =============================================================================
// INLINE FILES
// =============================================================================

/// Records files written with `echo ... > file` so later commands can read
/// them (response files written by nmake or make recipes).
#[derive(Default)]
pub struct InlineFileParser;

impl InlineFileParser {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl LogParser for InlineFileParser {
    fn name(&self) -> &'static str {
        "inline_file"
    }

    fn priority(&self) -> i32 {
        4
    }

    fn parse(&mut self, entry: &LogEntry, ctx: &mut ParserContext) -> Result<Option<Outcome>> {
        let LogEntry::Command(cmd) = entry else {
            return Ok(None);
        };
        if cmd.tokens.first().map(String::as_str) != Some("echo") {
            return Ok(None);
        }
        for redirection in &cmd.redirections {
            let Some(dst) = redirection.dst.as_deref() else {
                continue;
            };
            if redirection.op != ">" && redirection.op != ">>" {
                continue;
            }
            let full = ctx.normalize_path(dst);
            if Path::new(&full).exists() {
                continue;
            }
            let output = ctx.path_arg(&full);
            let line = format!("{}\n", cmd.tokens[1..].join(" "));
            if ctx.find_target(&output).is_none() {
                info!(path = %full, "found inline file");
                let target = Target::from(TargetKind::File(FileTarget {
                    output: output.clone(),
                    content: Vec::new(),
                    dependencies: Vec::new(),
                }));
                ctx.register(PendingTarget {
                    target,
                    inline: Vec::new(),
                });
            }
            if let Some(Target {
                kind: TargetKind::File(file),
                ..
            }) = ctx.find_target_mut(&output)
            {
                if redirection.op == ">" {
                    file.content.clear();
                }
                file.content.extend_from_slice(line.as_bytes());
            }
        }
        Ok(None)
    }
}

// =============================================================================
// RESPONSE FILES
// =============================================================================

/// Expands `@file` arguments from disk or from a captured file target.
pub struct ResponseFileParser {
    tokenizer: CommandTokenizer,
}

impl ResponseFileParser {
    pub fn new(ruleset: TokenizerRuleset) -> Result<Self> {
        Ok(Self {
            tokenizer: CommandTokenizer::new(ruleset, false)?,
        })
    }

    fn read(&self, path: &str, ctx: &ParserContext) -> Option<String> {
        let full = ctx.normalize_path(path);
        if let Ok(content) = std::fs::read(&full) {
            return Some(String::from_utf8_lossy(&content).into_owned());
        }
        match ctx.find_target(&ctx.path_arg(&full)) {
            Some(Target {
                kind: TargetKind::File(file),
                ..
            }) => Some(String::from_utf8_lossy(&file.content).into_owned()),
            _ => {
                error!(path = %full, "response file not found, log may be parsed incorrectly");
                None
            }
        }
    }
}

impl LogParser for ResponseFileParser {
    fn name(&self) -> &'static str {
        "response_file"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn parse(&mut self, entry: &LogEntry, ctx: &mut ParserContext) -> Result<Option<Outcome>> {
        let LogEntry::Command(cmd) = entry else {
            return Ok(None);
        };
        if !cmd.tokens.iter().any(|t| t.len() > 1 && t.starts_with('@')) {
            return Ok(None);
        }

        let mut tokens = Vec::with_capacity(cmd.tokens.len());
        for token in &cmd.tokens {
            let expanded = token
                .strip_prefix('@')
                .filter(|path| !path.is_empty())
                .and_then(|path| self.read(path, ctx));
            match expanded {
                Some(content) => tokens.extend(self.tokenizer.split_args(&content.replace(['\r', '\n'], " "))?),
                None => tokens.push(token.clone()),
            }
        }
        Ok(Some(Outcome::Replace(LogEntry::Command(ShellCommand {
            tokens,
            ..cmd.clone()
        }))))
    }
}
