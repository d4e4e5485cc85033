//! # Command Tokenizer
//!
//! Splits a shell command line from a build log into commands and arguments.
//!
//! A single log line may hold several commands (`cd obj && gcc -c ../a.c`),
//! parameter assignments (`CC=gcc make`), subshells and redirections. The
//! tokenizer resolves those into [`ShellCommand`]s with an effective working
//! directory each.
//!
//! Three rulesets are supported:
//! - `posix`: sh quoting, `\` escapes anything, subshells
//! - `windows`: cmd.exe/argv quoting, `\` only escapes quotes
//! - `posix_on_windows`: sh-like quoting that keeps `C:\path` backslashes

use crate::paths;
use crate::{MigratorError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// TYPES
// =============================================================================

/// Quoting and splitting rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerRuleset {
    #[default]
    Posix,
    Windows,
    PosixOnWindows,
}

impl FromStr for TokenizerRuleset {
    type Err = MigratorError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "posix" => Ok(Self::Posix),
            "windows" => Ok(Self::Windows),
            "posix_on_windows" => Ok(Self::PosixOnWindows),
            other => Err(MigratorError::InvalidSetting(format!(
                "unknown tokenizer ruleset '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TokenizerRuleset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Posix => "posix",
            Self::Windows => "windows",
            Self::PosixOnWindows => "posix_on_windows",
        })
    }
}

/// A stripped trailing redirection such as `2>&1` or `> out.log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub src: Option<String>,
    pub op: String,
    pub dst: Option<String>,
}

/// One command of a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub tokens: Vec<String>,
    /// `VAR=value` assignments preceding the command.
    pub parameters: BTreeMap<String, String>,
    pub redirections: Vec<Redirection>,
    pub working_dir: String,
}

/// A piece of a line between command separators.
#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Plain(String),
    Subshell(String),
}

// =============================================================================
// TOKENIZER
// =============================================================================

/// Stateful tokenizer. Assignments on a line of their own carry over to the
/// next command.
#[derive(Debug)]
pub struct CommandTokenizer {
    ruleset: TokenizerRuleset,
    command_substitution: bool,
    pending_parameters: BTreeMap<String, String>,
    redirection_re: Regex,
    substitution_re: Regex,
}

impl CommandTokenizer {
    pub fn new(ruleset: TokenizerRuleset, command_substitution: bool) -> Result<Self> {
        Ok(Self {
            ruleset,
            command_substitution,
            pending_parameters: BTreeMap::new(),
            redirection_re: Regex::new(
                r#"(?P<src>\d|&)?(?P<op>(?:>>|>|<)(?:\||&)?)\s*["']?(?P<dst>\d|[^\s"']+)?["']?$"#,
            )?,
            substitution_re: Regex::new(r"`(.+?)`|\$\((.+?)\)")?,
        })
    }

    #[must_use]
    pub fn ruleset(&self) -> TokenizerRuleset {
        self.ruleset
    }

    /// Split a line into commands, starting in `working_dir`.
    pub fn split_commands(&mut self, line: &str, working_dir: &str) -> Result<Vec<ShellCommand>> {
        let line = if self.command_substitution && self.ruleset != TokenizerRuleset::Windows {
            self.substitute_commands(line, working_dir)?
        } else {
            line.to_string()
        };

        let mut dir_stack = vec![working_dir.to_string()];
        let mut commands = Vec::new();

        for segment in self.split_segments(&line)? {
            let current_dir = dir_stack.last().cloned().unwrap_or_default();
            let text = match segment {
                Segment::Subshell(inner) => {
                    commands.extend(self.split_commands(&inner, &current_dir)?);
                    continue;
                }
                Segment::Plain(text) => text,
            };

            let (text, redirections) = self.strip_redirections(&text);
            let mut tokens = self.split_args(&text)?;
            if self.ruleset == TokenizerRuleset::Windows
                && tokens.first().is_some_and(|t| t.eq_ignore_ascii_case("set"))
            {
                tokens.remove(0);
            }

            let assignments = tokens
                .iter()
                .take_while(|t| is_assignment(t))
                .count();
            for token in tokens.drain(..assignments) {
                if let Some((key, value)) = token.split_once('=') {
                    self.pending_parameters
                        .insert(key.to_string(), value.to_string());
                }
            }
            if tokens.is_empty() {
                continue;
            }
            let parameters = std::mem::take(&mut self.pending_parameters);

            match tokens[0].as_str() {
                "cd" | "chdir" => {
                    let target = tokens.get(1..).and_then(<[String]>::last);
                    if let (Some(target), Some(top)) = (target, dir_stack.last_mut()) {
                        *top = paths::join(top, target);
                    }
                    continue;
                }
                "pushd" => {
                    if let Some(target) = tokens.get(1) {
                        dir_stack.push(paths::join(&current_dir, target));
                    }
                    continue;
                }
                "popd" => {
                    if dir_stack.len() > 1 {
                        dir_stack.pop();
                    }
                    continue;
                }
                _ => {}
            }

            // a pipeline is several commands sharing the line's state
            for part in tokens.split(|t| t == "|") {
                if part.is_empty() {
                    continue;
                }
                commands.push(ShellCommand {
                    tokens: part.to_vec(),
                    parameters: parameters.clone(),
                    redirections: redirections.clone(),
                    working_dir: current_dir.clone(),
                });
            }
        }

        Ok(commands)
    }

    /// Split a command line into arguments.
    pub fn split_args(&self, line: &str) -> Result<Vec<String>> {
        let chars: Vec<char> = line.chars().collect();
        let mut args = Vec::new();
        let mut accu: Option<String> = None;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];

            if c.is_whitespace() {
                if let Some(arg) = accu.take() {
                    args.push(arg);
                }
                i += 1;
                continue;
            }

            if let Some(len) = operator_len(&chars[i..], accu.is_none()) {
                if let Some(arg) = accu.take() {
                    args.push(arg);
                }
                args.push(chars[i..i + len].iter().collect());
                i += len;
                continue;
            }

            let piece = accu.get_or_insert_with(String::new);
            match (self.ruleset, c) {
                (_, '"') => {
                    i = self.read_double_quoted(&chars, i + 1, piece)?;
                }
                (TokenizerRuleset::Posix, '\'') => {
                    let Some(end) = chars[i + 1..].iter().position(|&ch| ch == '\'') else {
                        return Err(MigratorError::Tokenize(format!(
                            "unterminated single quote in: {line}"
                        )));
                    };
                    piece.extend(&chars[i + 1..i + 1 + end]);
                    i += end + 2;
                }
                (TokenizerRuleset::Posix, '\\') => {
                    let Some(&next) = chars.get(i + 1) else {
                        return Err(MigratorError::Tokenize(format!(
                            "trailing backslash in: {line}"
                        )));
                    };
                    piece.push(next);
                    i += 2;
                }
                (TokenizerRuleset::PosixOnWindows, '\\') => match chars.get(i + 1) {
                    Some(&next) if "\"\\&|<>*".contains(next) => {
                        piece.push(next);
                        i += 2;
                    }
                    _ => {
                        piece.push('\\');
                        i += 1;
                    }
                },
                (TokenizerRuleset::Windows, '\\') => {
                    i = read_argv_backslashes(&chars, i, piece);
                }
                _ => {
                    piece.push(c);
                    i += 1;
                }
            }
        }

        if let Some(arg) = accu {
            args.push(arg);
        }
        Ok(args)
    }

    /// Read a double quoted string starting after the opening quote. Returns
    /// the index after the closing quote.
    fn read_double_quoted(&self, chars: &[char], start: usize, piece: &mut String) -> Result<usize> {
        let mut i = start;
        while i < chars.len() {
            let c = chars[i];
            match c {
                '"' => {
                    if self.ruleset == TokenizerRuleset::Windows && chars.get(i + 1) == Some(&'"') {
                        piece.push('"');
                        i += 2;
                        continue;
                    }
                    return Ok(i + 1);
                }
                '\\' if self.ruleset == TokenizerRuleset::Windows => {
                    i = read_argv_backslashes(chars, i, piece);
                }
                '\\' => match chars.get(i + 1) {
                    Some(&next) if next == '"' || next == '\\' => {
                        piece.push(next);
                        i += 2;
                    }
                    _ => {
                        piece.push('\\');
                        i += 1;
                    }
                },
                _ => {
                    piece.push(c);
                    i += 1;
                }
            }
        }
        if self.ruleset == TokenizerRuleset::Posix {
            let text: String = chars.iter().collect();
            return Err(MigratorError::Tokenize(format!(
                "unterminated double quote in: {text}"
            )));
        }
        Ok(i)
    }

    /// Split a line on `&&`, `||` and `;` outside of quotes. On POSIX a
    /// parenthesized group at the start of a command is a subshell.
    fn split_segments(&self, line: &str) -> Result<Vec<Segment>> {
        let chars: Vec<char> = line.chars().collect();
        let posix_quotes = self.ruleset == TokenizerRuleset::Posix;
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut quote: Option<char> = None;
        let mut i = 0;

        let flush = |current: &mut String, segments: &mut Vec<Segment>| {
            let text = strip_shell_keyword(current.trim());
            if !text.is_empty() {
                segments.push(Segment::Plain(text.to_string()));
            }
            current.clear();
        };

        while i < chars.len() {
            let c = chars[i];
            if let Some(q) = quote {
                current.push(c);
                if c == '\\' && q == '"' && self.ruleset != TokenizerRuleset::Windows {
                    if let Some(&next) = chars.get(i + 1) {
                        current.push(next);
                        i += 1;
                    }
                } else if c == q {
                    quote = None;
                }
                i += 1;
                continue;
            }

            match c {
                '"' => quote = Some('"'),
                '\'' if posix_quotes => quote = Some('\''),
                '\\' if self.escapes_outside_quotes(chars.get(i + 1).copied()) => {
                    current.push(c);
                    if let Some(&next) = chars.get(i + 1) {
                        current.push(next);
                    }
                    i += 2;
                    continue;
                }
                '(' if self.ruleset != TokenizerRuleset::Windows && current.trim().is_empty() => {
                    let Some(close) = matching_paren(&chars, i) else {
                        return Err(MigratorError::Tokenize(format!(
                            "unbalanced parenthesis in: {line}"
                        )));
                    };
                    let inner: String = chars[i + 1..close].iter().collect();
                    segments.push(Segment::Subshell(inner));
                    current.clear();
                    i = close + 1;
                    continue;
                }
                '&' | '|' if chars.get(i + 1) == Some(&c) => {
                    flush(&mut current, &mut segments);
                    i += 2;
                    continue;
                }
                ';' => {
                    flush(&mut current, &mut segments);
                    i += 1;
                    continue;
                }
                _ => {}
            }
            current.push(c);
            i += 1;
        }
        flush(&mut current, &mut segments);
        Ok(segments)
    }

    /// Remove trailing redirections, innermost last.
    fn strip_redirections(&self, text: &str) -> (String, Vec<Redirection>) {
        let mut text = text.trim().to_string();
        let mut redirections = Vec::new();
        while let Some(caps) = self.redirection_re.captures(&text) {
            let Some(whole) = caps.get(0) else {
                break;
            };
            if whole.start() == 0 || self.inside_quotes(&text[..whole.start()]) {
                break;
            }
            redirections.insert(
                0,
                Redirection {
                    src: caps.name("src").map(|m| m.as_str().to_string()),
                    op: caps
                        .name("op")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                    dst: caps.name("dst").map(|m| m.as_str().to_string()),
                },
            );
            text = text[..whole.start()].trim_end().to_string();
        }
        (text, redirections)
    }

    fn inside_quotes(&self, prefix: &str) -> bool {
        let mut quote: Option<char> = None;
        let mut escaped = false;
        for c in prefix.chars() {
            if escaped {
                escaped = false;
                continue;
            }
            match quote {
                Some(q) if c == q => quote = None,
                Some('"') if c == '\\' && self.ruleset != TokenizerRuleset::Windows => escaped = true,
                Some(_) => {}
                None if c == '"' => quote = Some('"'),
                None if c == '\'' && self.ruleset == TokenizerRuleset::Posix => quote = Some('\''),
                None if c == '\\' => escaped = self.escapes_outside_quotes(None),
                None => {}
            }
        }
        quote.is_some()
    }

    /// Whether a backslash outside quotes escapes the following character.
    fn escapes_outside_quotes(&self, next: Option<char>) -> bool {
        match self.ruleset {
            TokenizerRuleset::Posix => true,
            TokenizerRuleset::PosixOnWindows => next.is_none_or(|n| "\"\\&|<>*".contains(n)),
            TokenizerRuleset::Windows => false,
        }
    }

    /// Replace `` `cmd` `` and `$(cmd)` with the command's output.
    fn substitute_commands(&self, line: &str, working_dir: &str) -> Result<String> {
        let mut result = String::new();
        let mut last = 0;
        for caps in self.substitution_re.captures_iter(line) {
            let (Some(whole), Some(command)) = (caps.get(0), caps.get(1).or_else(|| caps.get(2)))
            else {
                continue;
            };
            result.push_str(&line[last..whole.start()]);
            let output = std::process::Command::new("sh")
                .arg("-c")
                .arg(command.as_str())
                .current_dir(working_dir)
                .output()
                .map_err(|e| MigratorError::io(working_dir, e))?;
            let text = String::from_utf8_lossy(&output.stdout);
            result.extend(text.chars().filter(|c| *c != '\r' && *c != '\n'));
            tracing::debug!(command = command.as_str(), "command substituted");
            last = whole.end();
        }
        result.push_str(&line[last..]);
        Ok(result)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// `NAME=value` where NAME is a shell identifier.
fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Length of a shell operator at the start of `chars`, if any.
fn operator_len(chars: &[char], at_word_start: bool) -> Option<usize> {
    let first = *chars.first()?;
    let second = chars.get(1).copied();
    match first {
        '&' | '|' if second == Some(first) => Some(2),
        '&' | '|' | '<' | '>' => Some(1),
        c if at_word_start && c.is_ascii_digit() && second == Some('>') => Some(2),
        _ => None,
    }
}

/// Windows argv backslash rule: 2n backslashes before a quote give n
/// backslashes, 2n+1 give n backslashes and a literal quote; backslashes
/// elsewhere are literal. Returns the index after the consumed input.
fn read_argv_backslashes(chars: &[char], start: usize, piece: &mut String) -> usize {
    let count = chars[start..].iter().take_while(|&&c| c == '\\').count();
    let after = start + count;
    if chars.get(after) == Some(&'"') {
        piece.extend(std::iter::repeat_n('\\', count / 2));
        if count % 2 == 1 {
            piece.push('"');
            return after + 1;
        }
        return after;
    }
    piece.extend(std::iter::repeat_n('\\', count));
    after
}

fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (idx, &c) in chars.iter().enumerate().skip(open) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop `then`/`else`/`do` prefixes and lone `fi`/`done` left over from
/// shell conditionals.
fn strip_shell_keyword(text: &str) -> &str {
    for keyword in ["then", "else", "do"] {
        if let Some(rest) = text.strip_prefix(keyword) {
            if rest.starts_with(char::is_whitespace) {
                return rest.trim_start();
            }
        }
    }
    if matches!(text, "fi" | "done" | "then" | "else" | "do") {
        return "";
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn posix() -> CommandTokenizer {
        CommandTokenizer::new(TokenizerRuleset::Posix, false).unwrap()
    }

    #[test]
    fn test_split_args_posix_quoting() {
        let tokenizer = posix();
        let args = tokenizer
            .split_args(r#"gcc -DNAME="\"x y\"" 'a b' c\ d -o out"#)
            .unwrap();
        assert_eq!(args, vec!["gcc", r#"-DNAME="x y""#, "a b", "c d", "-o", "out"]);
    }

    #[test]
    fn test_split_args_empty_quoted_argument() {
        let args = posix().split_args(r#"cmd "" x"#).unwrap();
        assert_eq!(args, vec!["cmd", "", "x"]);
    }

    #[test]
    fn test_split_args_unterminated_quote_fails() {
        assert!(posix().split_args("gcc \"a.c").is_err());
        assert!(posix().split_args("gcc 'a.c").is_err());
    }

    #[test]
    fn test_split_args_windows_rules() {
        let tokenizer = CommandTokenizer::new(TokenizerRuleset::Windows, false).unwrap();
        let args = tokenizer
            .split_args(r#"C:\bin\rc.exe /fo"C:\out dir\a.res" "say ""hi""" a\\\"b"#)
            .unwrap();
        assert_eq!(
            args,
            vec![r"C:\bin\rc.exe", r"/foC:\out dir\a.res", r#"say "hi""#, r#"a\"b"#]
        );
    }

    #[test]
    fn test_split_args_posix_on_windows_keeps_backslashes() {
        let tokenizer = CommandTokenizer::new(TokenizerRuleset::PosixOnWindows, false).unwrap();
        let args = tokenizer.split_args(r#"gcc C:\src\a.c -DX=\"1\""#).unwrap();
        assert_eq!(args, vec!["gcc", r"C:\src\a.c", r#"-DX="1""#]);
    }

    #[test]
    fn test_split_commands_tracks_cd() {
        let mut tokenizer = posix();
        let commands = tokenizer
            .split_commands("cd obj && gcc -c ../a.c; ar rcs liba.a a.o", "/b")
            .unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].tokens, vec!["gcc", "-c", "../a.c"]);
        assert_eq!(commands[0].working_dir, "/b/obj");
        assert_eq!(commands[1].tokens[0], "ar");
        assert_eq!(commands[1].working_dir, "/b/obj");
    }

    #[test]
    fn test_split_commands_subshell_keeps_outer_dir() {
        let mut tokenizer = posix();
        let commands = tokenizer
            .split_commands("(cd sub && gcc -c a.c) && gcc a.o", "/b")
            .unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].working_dir, "/b/sub");
        assert_eq!(commands[1].working_dir, "/b");
    }

    #[test]
    fn test_split_commands_pushd_popd() {
        let mut tokenizer = posix();
        let commands = tokenizer
            .split_commands("pushd x && cc -c a.c && popd && cc -c b.c", "/b")
            .unwrap();
        assert_eq!(commands[0].working_dir, "/b/x");
        assert_eq!(commands[1].working_dir, "/b");
    }

    #[test]
    fn test_split_commands_redirections_and_parameters() {
        let mut tokenizer = posix();
        let commands = tokenizer
            .split_commands("CC=gcc LANG=C make all > out.log 2>&1", "/b")
            .unwrap();
        assert_eq!(commands.len(), 1);
        let command = &commands[0];
        assert_eq!(command.tokens, vec!["make", "all"]);
        assert_eq!(command.parameters.get("CC").map(String::as_str), Some("gcc"));
        assert_eq!(command.redirections.len(), 2);
        assert_eq!(command.redirections[0].op, ">");
        assert_eq!(command.redirections[0].dst.as_deref(), Some("out.log"));
        assert_eq!(command.redirections[1].src.as_deref(), Some("2"));
    }

    #[test]
    fn test_parameters_carry_to_next_command() {
        let mut tokenizer = posix();
        assert!(tokenizer.split_commands("FOO=1", "/b").unwrap().is_empty());
        let commands = tokenizer.split_commands("gcc a.c", "/b").unwrap();
        assert_eq!(commands[0].parameters.get("FOO").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_separators_inside_quotes_are_kept() {
        let mut tokenizer = posix();
        let commands = tokenizer
            .split_commands(r#"echo "a && b; c" > x"#, "/b")
            .unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].tokens, vec!["echo", "a && b; c"]);
    }

    #[test]
    fn test_pipeline_splits_commands() {
        let mut tokenizer = posix();
        let commands = tokenizer.split_commands("gcc -E a.c | tee a.i", "/b").unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].tokens, vec!["tee", "a.i"]);
    }

    #[test]
    fn test_shell_conditional_keywords() {
        let mut tokenizer = posix();
        let commands = tokenizer
            .split_commands("if test -d x; then cp a b; fi", "/b")
            .unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].tokens, vec!["cp", "a", "b"]);
    }

    #[test]
    fn test_windows_set_parameter() {
        let mut tokenizer = CommandTokenizer::new(TokenizerRuleset::Windows, false).unwrap();
        let commands = tokenizer
            .split_commands("set PATH=C:\\x && rc.exe a.rc", "C:/b")
            .unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].parameters.get("PATH").map(String::as_str), Some("C:\\x"));
    }

    proptest! {
        #[test]
        fn prop_plain_words_split_on_whitespace(words in proptest::collection::vec("[A-Za-z0-9_./=-]{1,8}", 1..6)) {
            let line = words.join("  ");
            let args = posix().split_args(&line).unwrap();
            prop_assert_eq!(args, words);
        }
    }
}
