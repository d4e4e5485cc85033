//! # Builder
//!
//! Runs `--build_command` entries and captures their console output so the
//! parse stage has logs to read.
//!
//! Every command writes stdout and stderr to `<out_dir>/build_command_<n>.log`.
//! The log handed to the parser is the explicit LOG of a command when one is
//! given. Without any explicit LOG, the console output of the last command is
//! parsed.

use crate::context::LogSpec;
use crate::settings::{BuildCommandSpec, Settings};
use crate::{MigratorError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

/// Subdirectory of the output directory commands run in by default.
pub const DEFAULT_BUILD_SUBDIR: &str = "_build";

/// A build command with its placeholders resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PreparedCommand {
    command: String,
    working_dir: PathBuf,
    log: Option<String>,
}

/// What the build produced for the parse stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// `TYPE:PATH` log arguments.
    pub logs: Vec<String>,
    /// Working directories of the commands whose logs are parsed.
    pub build_dirs: Vec<String>,
}

impl BuildOutput {
    /// Replace `logs`; fill `build_dirs` only when none were given.
    pub fn apply(&self, settings: &mut Settings) {
        settings.logs.clone_from(&self.logs);
        if settings.build_dirs.is_empty() {
            settings.build_dirs.clone_from(&self.build_dirs);
        }
    }
}

fn substitute(value: &str, source_dir: &Path, out_dir: &Path) -> String {
    value
        .replace("{source_dir}", &source_dir.to_string_lossy())
        .replace("{out_dir}", &out_dir.to_string_lossy())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| MigratorError::io(path, e))
}

/// Runs the configured build commands in order.
pub struct Builder {
    out_dir: PathBuf,
    commands: Vec<PreparedCommand>,
    log_type: String,
}

impl Builder {
    pub fn new(settings: &Settings, out_dir: &Path) -> Result<Self> {
        if settings.build_commands.is_empty() {
            return Err(MigratorError::InvalidSetting(
                "build_commands must be specified".to_string(),
            ));
        }
        let Some(source_dir) = settings.source_dir.as_deref() else {
            return Err(MigratorError::InvalidSetting(
                "source_dir must be specified to build".to_string(),
            ));
        };
        let out_dir = absolute(out_dir)?;
        let source_dir = absolute(Path::new(source_dir))?;
        if out_dir == source_dir {
            return Err(MigratorError::InvalidSetting(
                "out_dir cannot be the same as source_dir".to_string(),
            ));
        }
        let commands = settings
            .build_commands
            .iter()
            .map(|spec| Self::prepare(spec, &source_dir, &out_dir))
            .collect();
        Ok(Self {
            out_dir,
            commands,
            log_type: settings.log_type.clone().unwrap_or_else(|| "make".to_string()),
        })
    }

    fn prepare(spec: &BuildCommandSpec, source_dir: &Path, out_dir: &Path) -> PreparedCommand {
        let mut working_dir = out_dir.join(DEFAULT_BUILD_SUBDIR);
        let mut log = spec.log.as_deref().map(|l| substitute(l, source_dir, out_dir));
        if let Some(dir) = spec.working_dir.as_deref() {
            let dir = substitute(dir, source_dir, out_dir);
            // a lone second value that is not a directory names the log
            if log.is_none() && !Path::new(&dir).is_dir() && Path::new(&dir).extension().is_some() {
                log = Some(dir);
            } else {
                working_dir = PathBuf::from(dir);
            }
        }
        PreparedCommand {
            command: substitute(&spec.command, source_dir, out_dir),
            working_dir,
            log,
        }
    }

    fn log_argument(&self, path: &str) -> String {
        if LogSpec::parse(path, None).is_ok() {
            path.to_string()
        } else {
            format!("{}:{path}", self.log_type)
        }
    }

    fn run(&self, command: &PreparedCommand, log_path: &Path) -> Result<()> {
        std::fs::create_dir_all(&command.working_dir)
            .map_err(|e| MigratorError::io(&command.working_dir, e))?;
        let log = File::create(log_path).map_err(|e| MigratorError::io(log_path, e))?;
        let stderr = log.try_clone().map_err(|e| MigratorError::io(log_path, e))?;
        info!(
            command = %command.command,
            cwd = %command.working_dir.display(),
            log = %log_path.display(),
            "running build command"
        );

        let mut process = if cfg!(windows) {
            let mut process = Command::new("cmd");
            process.arg("/C").arg(&command.command);
            process
        } else {
            let mut process = Command::new("sh");
            process.arg("-c").arg(&command.command);
            process
        };
        let status = process
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .status()
            .map_err(|e| MigratorError::io(&command.working_dir, e))?;
        if !status.success() {
            return Err(MigratorError::BuildCommand {
                command: command.command.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    /// Run every command; stop at the first failure.
    pub fn build(&self) -> Result<BuildOutput> {
        std::fs::create_dir_all(&self.out_dir).map_err(|e| MigratorError::io(&self.out_dir, e))?;
        let any_explicit_log = self.commands.iter().any(|c| c.log.is_some());
        let mut output = BuildOutput::default();
        for (idx, command) in self.commands.iter().enumerate() {
            let console_log = self.out_dir.join(format!("build_command_{}.log", idx + 1));
            self.run(command, &console_log)?;

            let parsed = match &command.log {
                Some(log) => Some(log.clone()),
                None if !any_explicit_log && idx + 1 == self.commands.len() => {
                    Some(console_log.to_string_lossy().into_owned())
                }
                None => None,
            };
            if let Some(log) = parsed {
                info!(log = %log, "added to parser queue");
                output.logs.push(self.log_argument(&log));
                output
                    .build_dirs
                    .push(command.working_dir.to_string_lossy().into_owned());
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(source: &Path, commands: Vec<BuildCommandSpec>) -> Settings {
        Settings {
            source_dir: Some(source.to_string_lossy().into_owned()),
            build_commands: commands,
            ..Settings::default()
        }
    }

    fn spec(command: &str) -> BuildCommandSpec {
        BuildCommandSpec {
            command: command.to_string(),
            working_dir: None,
            log: None,
        }
    }

    #[test]
    fn test_requires_commands_and_distinct_dirs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Builder::new(&settings(dir.path(), Vec::new()), dir.path()).is_err());
        assert!(Builder::new(&settings(dir.path(), vec![spec("true")]), dir.path()).is_err());
    }

    #[test]
    fn test_placeholders_and_default_working_dir() {
        let source = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = Builder::new(
            &settings(source.path(), vec![spec("make -C {source_dir} O={out_dir}")]),
            out.path(),
        )
        .unwrap();
        let command = &builder.commands[0];
        assert!(command.command.contains(&*source.path().to_string_lossy()));
        assert!(command.command.ends_with(&format!("O={}", out.path().to_string_lossy())));
        assert_eq!(command.working_dir, out.path().join(DEFAULT_BUILD_SUBDIR));
        assert_eq!(command.log, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_console_output_of_last_command_is_parsed() {
        let source = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = Builder::new(
            &settings(source.path(), vec![spec("echo first"), spec("echo cc -c a.c; echo oops >&2")]),
            out.path(),
        )
        .unwrap();
        let output = builder.build().unwrap();
        let console = out.path().join("build_command_2.log");
        assert_eq!(output.logs, vec![format!("make:{}", console.to_string_lossy())]);
        assert_eq!(
            output.build_dirs,
            vec![out.path().join(DEFAULT_BUILD_SUBDIR).to_string_lossy().into_owned()]
        );
        let content = std::fs::read_to_string(console).unwrap();
        assert!(content.contains("cc -c a.c"));
        assert!(content.contains("oops"));
        assert!(out.path().join("build_command_1.log").is_file());

        let mut merged = Settings {
            build_dirs: vec!["/given".to_string()],
            ..Settings::default()
        };
        output.apply(&mut merged);
        assert_eq!(merged.logs, output.logs);
        assert_eq!(merged.build_dirs, vec!["/given"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_explicit_log_and_failure() {
        let source = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let work = out.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let explicit = BuildCommandSpec {
            command: "echo done".to_string(),
            working_dir: Some(work.to_string_lossy().into_owned()),
            log: Some("ninja:{out_dir}/ninja.log".to_string()),
        };
        let builder = Builder::new(&settings(source.path(), vec![explicit, spec("true")]), out.path()).unwrap();
        let output = builder.build().unwrap();
        assert_eq!(output.logs, vec![format!("ninja:{}/ninja.log", out.path().to_string_lossy())]);
        assert_eq!(output.build_dirs, vec![work.to_string_lossy().into_owned()]);

        let failing = Builder::new(&settings(source.path(), vec![spec("exit 3")]), out.path()).unwrap();
        assert!(matches!(failing.build(), Err(MigratorError::BuildCommand { .. })));
    }
}
