//! `cp`, `ln` and `mv` between build and source trees.

use super::{LogEntry, LogParser, Outcome};
use crate::context::{Dependencies, ParserContext};
use crate::paths;
use crate::platform::Platform;
use crate::{MigratorError, Result};
use regex::Regex;
use tracing::info;

pub struct CopyToolsParser {
    program_re: Regex,
}

impl CopyToolsParser {
    pub fn new() -> Result<Self> {
        // coreutils spelling regardless of the build platform
        Ok(Self {
            program_re: Platform::Linux.program_regex(&["cp", "ln", "mv"])?,
        })
    }
}

impl LogParser for CopyToolsParser {
    fn name(&self) -> &'static str {
        "copy_tools"
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
        let program = paths::basename(&tokens[0]);
        let is_link = program == "ln" || program.ends_with("-ln");

        let mut symbolic = false;
        let mut operands = Vec::new();
        for token in &tokens[1..] {
            match token.strip_prefix('-') {
                Some(opts) if !opts.is_empty() && !opts.starts_with('-') => {
                    symbolic |= opts.contains('s');
                }
                Some(long) if long == "-symbolic" => symbolic = true,
                Some(_) => {}
                None => operands.push(token.as_str()),
            }
        }
        let &[source, output] = operands.as_slice() else {
            return Err(MigratorError::Parse(format!(
                "{program} expects a source and a destination, got {}",
                operands.len()
            )));
        };

        let output_full = ctx.normalize_path(output);
        let output = ctx.path_arg(&output_full);
        if !ctx.is_in_build_dir(&output) && !ctx.is_in_source_dir(&output) {
            info!(output = %output, "copy output not in build or source directory, ignoring");
            return Ok(Some(Outcome::Drop));
        }

        let source = if is_link && symbolic {
            // a symlink's target is relative to the link's directory
            ctx.platform()
                .path_join(paths::dirname(&output_full), source)
        } else {
            source.to_string()
        };
        let mut deps = Dependencies::new();
        let source = ctx.file_arg(&source, &mut deps);

        Ok(Some(match ctx.process_target_copy(&source, &output, deps) {
            Some(target) => Outcome::Replace(LogEntry::Target(target)),
            None => Outcome::Drop,
        }))
    }
}
