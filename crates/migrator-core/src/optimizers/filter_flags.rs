//! Flag de-duplication and user keep/delete/replace rules.

use super::Optimizer;
use crate::Result;
use crate::model::{BuildObjectModel, Flag, TargetKind};
use regex::Regex;
use std::collections::BTreeSet;
use tracing::debug;

pub struct FilterFlags {
    keep: Vec<Regex>,
    delete: Vec<Regex>,
    replace: Vec<(Regex, String)>,
}

impl FilterFlags {
    pub fn new(keep: &[String], delete: &[String], replace: &[(String, String)]) -> Result<Self> {
        let mut keep = keep.iter().map(|p| Regex::new(p)).collect::<std::result::Result<Vec<_>, _>>()?;
        if !keep.is_empty() {
            // include dirs only go away through delete rules
            keep.push(Regex::new(r"^[-/]I")?);
        }
        let delete = delete.iter().map(|p| Regex::new(p)).collect::<std::result::Result<Vec<_>, _>>()?;
        let replace = replace
            .iter()
            .map(|(pattern, repl)| Ok((Regex::new(pattern)?, repl.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { keep, delete, replace })
    }

    fn is_removed(&self, value: &str) -> bool {
        if self.delete.iter().any(|re| re.is_match(value)) {
            return true;
        }
        !self.keep.is_empty() && !self.keep.iter().any(|re| re.is_match(value))
    }

    fn replace_token(&self, token: &str) -> String {
        self.replace
            .iter()
            .fold(token.to_string(), |acc, (re, repl)| re.replace_all(&acc, repl.as_str()).into_owned())
    }

    fn flags(&self, flags: &[Flag]) -> Vec<Flag> {
        unique(flags)
            .into_iter()
            .filter(|flag| {
                let removed = self.is_removed(&flag.joined());
                if removed {
                    debug!(flag = %flag, "flag removed");
                }
                !removed
            })
            .map(|flag| match flag {
                Flag::Single(token) => Flag::Single(self.replace_token(&token)),
                Flag::Group(tokens) => Flag::Group(tokens.iter().map(|t| self.replace_token(t)).collect()),
            })
            .collect()
    }

    fn include_dirs(&self, dirs: &[String]) -> Vec<String> {
        unique(dirs)
            .into_iter()
            .filter(|dir| !self.is_removed(&format!("-I{dir}")))
            .map(|dir| self.replace_token(&dir))
            .collect()
    }
}

/// First occurrence of every value, in order.
fn unique<T: Clone + Ord>(values: &[T]) -> Vec<T> {
    let mut seen = BTreeSet::new();
    values.iter().filter(|v| seen.insert(*v)).cloned().collect()
}

impl Optimizer for FilterFlags {
    fn name(&self) -> &'static str {
        "filter_flags"
    }

    fn optimize(&self, model: &BuildObjectModel) -> Result<BuildObjectModel> {
        let mut model = model.clone();
        for target in &mut model.targets {
            let TargetKind::Module(module) = &mut target.kind else {
                continue;
            };
            for source in &mut module.sources {
                source.compile_flags = self.flags(&source.compile_flags);
                source.include_dirs = self.include_dirs(&source.include_dirs);
            }
            module.compile_flags = self.flags(&module.compile_flags);
            module.include_dirs = self.include_dirs(&module.include_dirs);
            module.link_flags = self.flags(&module.link_flags);
        }
        Ok(model)
    }
}
