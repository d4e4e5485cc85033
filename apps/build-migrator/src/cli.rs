//! # CLI
//!
//! Command line options and the commands behind them.
//!
//! Settings are layered, lowest first: `<out_dir>/settings.json` from an
//! earlier run, the selected presets, then the options given on the command
//! line.

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use migrator_core::platform::Platform;
use migrator_core::settings::PresetLoader;
use migrator_core::tokenizer::TokenizerRuleset;
use migrator_core::{BuildCommandSpec, BuildMigrator, BuildObjectModel, Settings, Stage};
use std::path::{Path, PathBuf};
use tracing::info;

// =============================================================================
// OPTIONS
// =============================================================================

/// Migrate a make/ninja build to CMake by parsing its build log.
#[derive(Parser, Debug, Default)]
#[command(name = "build-migrator", version)]
pub struct Cli {
    /// Stages to run. Default: all of them
    #[arg(long, num_args = 1.., value_enum)]
    pub commands: Vec<StageArg>,

    /// Output directory. Default: current directory
    #[arg(long = "out_dir", value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Save the Build Object Model to PATH instead of <out_dir>/bom.json
    #[arg(long, value_name = "PATH", conflicts_with = "load")]
    pub save: Option<PathBuf>,

    /// Load the Build Object Model from PATH
    #[arg(long, value_name = "PATH")]
    pub load: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,

    // ----- presets -----
    /// List available presets (--preset_dirs is honored)
    #[arg(long = "list_presets")]
    pub list_presets: bool,

    /// Search directories for presets
    #[arg(long = "preset_dirs", num_args = 1.., value_name = "PATH")]
    pub preset_dirs: Vec<String>,

    /// Load settings from presets, given by name or by path
    #[arg(long, num_args = 1.., value_name = "NAME_OR_PATH")]
    pub presets: Vec<String>,

    /// Print the settings of the selected presets and exit
    #[arg(long = "show_settings")]
    pub show_settings: bool,

    // ----- build -----
    /// Build command with optional working directory and log.
    /// {source_dir} and {out_dir} are substituted
    #[arg(
        long = "build_command",
        num_args = 1..=3,
        value_names = ["CMD", "WORKING_DIR", "LOG"]
    )]
    pub build_command: Vec<Vec<String>>,

    // ----- parse -----
    /// Root of the source tree
    #[arg(long = "source_dir", value_name = "DIR")]
    pub source_dir: Option<String>,

    /// Directories the build wrote to
    #[arg(long = "build_dirs", num_args = 1.., value_name = "DIR")]
    pub build_dirs: Vec<String>,

    /// Logs to parse, as [make:|ninja:]PATH
    #[arg(long, num_args = 1.., value_name = "LOG")]
    pub logs: Vec<String>,

    /// Type of logs given without a prefix
    #[arg(long = "log_type", value_parser = ["make", "ninja"])]
    pub log_type: Option<String>,

    /// Platform the build ran on. Default: host
    #[arg(long, value_parser = parse_platform)]
    pub platform: Option<Platform>,

    /// Initial working directory of the log. Default: first build dir
    #[arg(long = "working_dir", value_name = "DIR")]
    pub working_dir: Option<String>,

    /// Treat PATH as an alias of TARGET
    #[arg(long = "path_alias", num_args = 2, value_names = ["PATH", "TARGET"])]
    pub path_alias: Vec<Vec<String>>,

    /// How many '..' a path may climb out of source and build dirs; negative is unlimited
    #[arg(long = "max_relpath_level", allow_negative_numbers = true)]
    pub max_relpath_level: Option<i64>,

    /// Keep only these targets (output globs) and their dependencies
    #[arg(long, num_args = 1.., value_name = "GLOB")]
    pub targets: Vec<String>,

    /// Force the target name of an output
    #[arg(long = "force_target_name", num_args = 2, value_names = ["OUTPUT", "NAME"])]
    pub force_target_name: Vec<Vec<String>>,

    /// Extra source files to capture (globs)
    #[arg(long = "capture_sources", num_args = 1.., value_name = "GLOB")]
    pub capture_sources: Vec<String>,

    /// Do not copy referenced source files into the output
    #[arg(long = "dont_capture_sources")]
    pub dont_capture_sources: bool,

    /// Rewrite log lines matching PATTERN before parsing ($1 refers to groups)
    #[arg(
        long = "replace_line",
        num_args = 2,
        value_names = ["PATTERN", "REPLACEMENT"],
        allow_hyphen_values = true
    )]
    pub replace_line: Vec<Vec<String>>,

    /// Quoting rules for command lines. Default: derived from the platform
    #[arg(long = "tokenizer_ruleset", value_parser = parse_ruleset)]
    pub tokenizer_ruleset: Option<TokenizerRuleset>,

    /// Evaluate $(...) and `...` found in command lines
    #[arg(long = "command_substitution")]
    pub command_substitution: bool,

    /// Compile flags (regexes) to drop while parsing
    #[arg(long = "ignore_compile_flags", num_args = 1.., value_name = "REGEX")]
    pub ignore_compile_flags: Vec<String>,

    /// Link flags (regexes) to drop while parsing
    #[arg(long = "ignore_link_flags", num_args = 1.., value_name = "REGEX")]
    pub ignore_link_flags: Vec<String>,

    /// Scan sources for #include dependencies
    #[arg(long = "scan_implicit_dependencies")]
    pub scan_implicit_dependencies: bool,

    // ----- optimize -----
    /// Skip every optimizer
    #[arg(long = "dont_optimize")]
    pub dont_optimize: bool,

    /// Keep only flags matching these regexes
    #[arg(long = "keep_flags", num_args = 1.., value_name = "REGEX")]
    pub keep_flags: Vec<String>,

    /// Delete flags matching these regexes
    #[arg(long = "delete_flags", num_args = 1.., value_name = "REGEX")]
    pub delete_flags: Vec<String>,

    /// Replace flags matching PATTERN
    #[arg(
        long = "replace_flag",
        num_args = 2,
        value_names = ["PATTERN", "REPLACEMENT"],
        allow_hyphen_values = true
    )]
    pub replace_flag: Vec<Vec<String>>,

    /// Regex substitution in captured files whose path matches PATHMASK
    #[arg(
        long = "file_target_gsub",
        num_args = 3,
        value_names = ["PATHMASK", "REGEX", "REPLACEMENT"],
        allow_hyphen_values = true
    )]
    pub file_target_gsub: Vec<Vec<String>>,

    /// Re-encode captured files whose path matches PATHMASK
    #[arg(
        long = "file_target_change_encoding",
        num_args = 3,
        value_names = ["PATHMASK", "FROM", "TO"]
    )]
    pub file_target_change_encoding: Vec<Vec<String>>,

    // ----- generate -----
    /// CMake project name; also prefixes generated variables
    #[arg(long = "cmake_project_name", value_name = "NAME")]
    pub cmake_project_name: Option<String>,

    #[arg(long = "cmake_project_version", value_name = "VERSION")]
    pub cmake_project_version: Option<String>,

    /// Rename targets matching PATTERN
    #[arg(long, num_args = 2, value_names = ["PATTERN", "REPLACEMENT"])]
    pub rename: Vec<Vec<String>>,

    /// Put every output directly into the binary dir
    #[arg(long = "flat_build_dir")]
    pub flat_build_dir: bool,

    /// Default value of a generated cache variable
    #[arg(long = "default_var_value", num_args = 2, value_names = ["NAME", "VALUE"])]
    pub default_var_value: Vec<Vec<String>>,
}

/// Pipeline stage as spelled on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StageArg {
    Build,
    Parse,
    Optimize,
    Generate,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Build => Stage::Build,
            StageArg::Parse => Stage::Parse,
            StageArg::Optimize => Stage::Optimize,
            StageArg::Generate => Stage::Generate,
        }
    }
}

fn parse_platform(value: &str) -> std::result::Result<Platform, String> {
    value.parse().map_err(|e: migrator_core::MigratorError| e.to_string())
}

fn parse_ruleset(value: &str) -> std::result::Result<TokenizerRuleset, String> {
    value.parse().map_err(|e: migrator_core::MigratorError| e.to_string())
}

fn pairs(values: &[Vec<String>]) -> Vec<(String, String)> {
    values
        .iter()
        .filter_map(|pair| match pair.as_slice() {
            [first, second] => Some((first.clone(), second.clone())),
            _ => None,
        })
        .collect()
}

fn triples(values: &[Vec<String>]) -> Vec<(String, String, String)> {
    values
        .iter()
        .filter_map(|triple| match triple.as_slice() {
            [first, second, third] => Some((first.clone(), second.clone(), third.clone())),
            _ => None,
        })
        .collect()
}

impl Cli {
    /// The options given on the command line as settings.
    pub fn to_settings(&self) -> Result<Settings> {
        let build_commands = self
            .build_command
            .iter()
            .map(|values| BuildCommandSpec::from_values(values))
            .collect::<migrator_core::Result<Vec<_>>>()
            .context("invalid --build_command")?;

        Ok(Settings {
            commands: self.commands.iter().copied().map(Stage::from).collect(),
            out_dir: self.out_dir.clone(),
            verbose: self.verbose,
            source_dir: self.source_dir.clone(),
            platform: self.platform,
            presets: self.presets.clone(),
            preset_dirs: self.preset_dirs.clone(),
            build_commands,
            logs: self.logs.clone(),
            log_type: self.log_type.clone(),
            build_dirs: self.build_dirs.clone(),
            working_dir: self.working_dir.clone(),
            path_aliases: pairs(&self.path_alias),
            max_relpath_level: self.max_relpath_level,
            targets: self.targets.clone(),
            force_target_name: pairs(&self.force_target_name),
            capture_sources: self.capture_sources.clone(),
            dont_capture_sources: self.dont_capture_sources,
            replace_line: pairs(&self.replace_line),
            tokenizer_ruleset: self.tokenizer_ruleset,
            command_substitution: self.command_substitution,
            ignore_compile_flags: self.ignore_compile_flags.clone(),
            ignore_link_flags: self.ignore_link_flags.clone(),
            scan_implicit_dependencies: self.scan_implicit_dependencies,
            dont_optimize: self.dont_optimize,
            keep_flags: self.keep_flags.clone(),
            delete_flags: self.delete_flags.clone(),
            replace_flags: pairs(&self.replace_flag),
            file_target_gsubs: triples(&self.file_target_gsub),
            file_target_change_encodings: triples(&self.file_target_change_encoding),
            cmake_project_name: self.cmake_project_name.clone(),
            cmake_project_version: self.cmake_project_version.clone(),
            rename: pairs(&self.rename),
            flat_build_dir: self.flat_build_dir,
            default_var_values: pairs(&self.default_var_value),
        })
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

fn preset_loader(preset_dirs: &[String]) -> PresetLoader {
    PresetLoader::new(preset_dirs.iter().map(PathBuf::from))
}

/// Print every preset found in `preset_dirs` and return them.
pub fn cmd_list_presets(preset_dirs: &[String]) -> Result<Vec<(String, PathBuf)>> {
    let presets = preset_loader(preset_dirs).list();
    for (name, path) in &presets {
        println!("{name}\n  {}", path.display());
    }
    Ok(presets)
}

/// Print the merged settings of `presets` as JSON and return them.
pub fn cmd_show_settings(preset_dirs: &[String], presets: &[String]) -> Result<String> {
    let merged = preset_loader(preset_dirs)
        .load(presets)
        .context("failed to load presets")?;
    let json = serde_json::to_string_pretty(&merged)?;
    println!("{json}");
    Ok(json)
}

/// Layer persisted settings, presets and explicit options. The output
/// directory defaults to the current directory.
pub fn resolve_settings(explicit: &Settings) -> Result<Settings> {
    let presets = preset_loader(&explicit.preset_dirs)
        .load(&explicit.presets)
        .context("failed to load presets")?;
    let presets = Settings::from_value(presets).context("invalid preset")?;
    let mut settings = presets.overlay(explicit)?;

    let out_dir = match settings.out_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    settings.out_dir = Some(out_dir.clone());

    if let Some(saved) = Settings::load(&out_dir)
        .with_context(|| format!("failed to load settings from {}", out_dir.display()))?
    {
        info!(out_dir = %out_dir.display(), "using saved settings");
        settings = saved.overlay(&settings)?;
    }
    Ok(settings)
}

/// Run the selected stages and persist the model and the settings.
pub fn cmd_run(explicit: &Settings, load: Option<&Path>, save: Option<&Path>) -> Result<BuildObjectModel> {
    if load.is_some() && save.is_some() {
        bail!("--save and --load are mutually exclusive");
    }
    let settings = resolve_settings(explicit)?;
    let Some(out_dir) = settings.out_dir.clone() else {
        bail!("no output directory");
    };

    let mut migrator = BuildMigrator::new(settings);
    let model = migrator.run_with(load, save).context("migration failed")?;
    migrator
        .settings()
        .save(&out_dir)
        .context("failed to save settings")?;
    info!(targets = model.len(), out_dir = %out_dir.display(), "done");
    Ok(model)
}

/// Dispatch parsed options.
pub fn execute(cli: &Cli) -> Result<()> {
    if cli.list_presets {
        cmd_list_presets(&cli.preset_dirs)?;
        return Ok(());
    }
    if cli.show_settings {
        cmd_show_settings(&cli.preset_dirs, &cli.presets)?;
        return Ok(());
    }
    let settings = cli.to_settings()?;
    cmd_run(&settings, cli.load.as_deref(), cli.save.as_deref())?;
    Ok(())
}
