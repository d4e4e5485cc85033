//! # Settings
//!
//! Every option of the pipeline in one serde struct, plus the layering
//! rules: presets, persisted `settings.json` and explicit options.
//!
//! Layering works on JSON objects. A [`Settings`] value serializes only the
//! fields that were set, so merging two objects never lets an unset option
//! hide a set one.

use crate::platform::Platform;
use crate::tokenizer::TokenizerRuleset;
use crate::{MigratorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// File name of persisted settings inside the output directory.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Keys that only make sense for a single invocation.
pub const NON_PERSISTENT_KEYS: &[&str] = &[
    "verbose",
    "commands",
    "build_commands",
    "presets",
    "preset_dirs",
    "list_presets",
    "show_settings",
    "save",
    "load",
];

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Parse,
    Optimize,
    Generate,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Self::Build, Self::Parse, Self::Optimize, Self::Generate];
}

/// A `--build_command CMD [WORKING_DIR] [LOG]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCommandSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl BuildCommandSpec {
    /// Build from the positional values of one `--build_command`.
    pub fn from_values(values: &[String]) -> Result<Self> {
        match values {
            [command] => Ok(Self {
                command: command.clone(),
                working_dir: None,
                log: None,
            }),
            [command, working_dir] => Ok(Self {
                command: command.clone(),
                working_dir: Some(working_dir.clone()),
                log: None,
            }),
            [command, working_dir, log] => Ok(Self {
                command: command.clone(),
                working_dir: Some(working_dir.clone()),
                log: Some(log.clone()),
            }),
            _ => Err(MigratorError::InvalidSetting(
                "--build_command takes CMD [WORKING_DIR] [LOG]".to_string(),
            )),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// All pipeline options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    // ----- general -----
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "is_false")]
    pub verbose: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preset_dirs: Vec<String>,

    // ----- build -----
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub build_commands: Vec<BuildCommandSpec>,

    // ----- parse -----
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub build_dirs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path_aliases: Vec<(String, String)>,
    /// Negative means unlimited; unset means 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_relpath_level: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub force_target_name: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capture_sources: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub dont_capture_sources: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replace_line: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer_ruleset: Option<TokenizerRuleset>,
    #[serde(skip_serializing_if = "is_false")]
    pub command_substitution: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignore_compile_flags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignore_link_flags: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub scan_implicit_dependencies: bool,

    // ----- optimize -----
    #[serde(skip_serializing_if = "is_false")]
    pub dont_optimize: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keep_flags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delete_flags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replace_flags: Vec<(String, String)>,
    /// `(path mask, regex, replacement)` applied to captured file contents.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_target_gsubs: Vec<(String, String, String)>,
    /// `(path mask, source encoding, target encoding)` for captured files.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_target_change_encodings: Vec<(String, String, String)>,

    // ----- generate -----
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmake_project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmake_project_version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rename: Vec<(String, String)>,
    #[serde(skip_serializing_if = "is_false")]
    pub flat_build_dir: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub default_var_values: Vec<(String, String)>,
}

impl Settings {
    /// Effective platform: explicit or host.
    #[must_use]
    pub fn platform(&self) -> Platform {
        self.platform.unwrap_or_else(Platform::host)
    }

    /// Effective relative path limit; `None` is unlimited.
    #[must_use]
    pub fn max_relpath_level(&self) -> Option<usize> {
        match self.max_relpath_level {
            None => Some(0),
            Some(level) if level < 0 => None,
            Some(level) => Some(level as usize),
        }
    }

    /// Effective tokenizer rules: explicit or derived from the platform.
    #[must_use]
    pub fn tokenizer_ruleset(&self) -> TokenizerRuleset {
        self.tokenizer_ruleset.unwrap_or(match self.platform() {
            Platform::Windows => TokenizerRuleset::Windows,
            _ => TokenizerRuleset::Posix,
        })
    }

    /// Stages to run; all of them when none were requested.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        if self.commands.is_empty() {
            Stage::ALL.to_vec()
        } else {
            let mut stages = self.commands.clone();
            stages.sort();
            stages.dedup();
            stages
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// `other` on top of `self`: set options of `other` replace those of `self`.
    pub fn overlay(&self, other: &Settings) -> Result<Settings> {
        let mut base = object(self.to_value()?)?;
        for (key, value) in object(other.to_value()?)? {
            base.insert(key, value);
        }
        Settings::from_value(Value::Object(base))
    }

    /// Persist to `<dir>/settings.json`, dropping per-invocation keys.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let mut map = object(self.to_value()?)?;
        for key in NON_PERSISTENT_KEYS {
            map.remove(*key);
        }
        let path = dir.join(SETTINGS_FILE_NAME);
        let json = serde_json::to_string_pretty(&Value::Object(map))?;
        std::fs::write(&path, json).map_err(|e| MigratorError::io(&path, e))?;
        tracing::debug!(path = %path.display(), "settings saved");
        Ok(path)
    }

    /// Load `<dir>/settings.json` if present.
    pub fn load(dir: &Path) -> Result<Option<Settings>> {
        let path = dir.join(SETTINGS_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path).map_err(|e| MigratorError::io(&path, e))?;
        let settings = serde_json::from_str(&json)?;
        tracing::debug!(path = %path.display(), "settings loaded");
        Ok(Some(settings))
    }
}

fn object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(MigratorError::InvalidSetting(format!(
            "settings must be a JSON object, got {other}"
        ))),
    }
}

// =============================================================================
// PRESETS
// =============================================================================

/// Merge preset objects: lists concatenate, scalars are overwritten by the
/// rightmost object. A key that is a list in one object and a scalar in
/// another is an error.
pub fn merge_presets<'a>(presets: impl IntoIterator<Item = &'a Value>) -> Result<Value> {
    let mut result = Map::new();
    for preset in presets {
        let Value::Object(map) = preset else {
            return Err(MigratorError::InvalidSetting(
                "preset must be a JSON object".to_string(),
            ));
        };
        for (key, value) in map {
            let Some(existing) = result.get_mut(key) else {
                result.insert(key.clone(), value.clone());
                continue;
            };
            match (existing, value) {
                (Value::Array(existing), Value::Array(items)) => {
                    existing.extend(items.iter().cloned());
                }
                (existing, value) if existing.is_array() == value.is_array() => {
                    *existing = value.clone();
                }
                _ => {
                    return Err(MigratorError::InvalidSetting(format!(
                        "attribute type conflict in settings: {key}"
                    )));
                }
            }
        }
    }
    Ok(Value::Object(result))
}

/// Finds preset files by name in search directories.
#[derive(Debug, Clone, Default)]
pub struct PresetLoader {
    search_dirs: Vec<PathBuf>,
}

impl PresetLoader {
    #[must_use]
    pub fn new(search_dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            search_dirs: search_dirs.into_iter().collect(),
        }
    }

    /// `(name, path)` of every `*.json` preset in the search directories.
    #[must_use]
    pub fn list(&self) -> Vec<(String, PathBuf)> {
        let mut result = Vec::new();
        for dir in &self.search_dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut found: Vec<(String, PathBuf)> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
                })
                .filter_map(|path| {
                    let name = path.file_stem()?.to_string_lossy().into_owned();
                    Some((name, path))
                })
                .collect();
            found.sort();
            result.extend(found);
        }
        result
    }

    /// Load presets given by name or by path and merge them.
    pub fn load(&self, presets: &[String]) -> Result<Value> {
        let available = self.list();
        let mut values = Vec::new();
        for name_or_path in presets {
            let candidate = Path::new(name_or_path);
            let path = if candidate.is_file()
                && candidate
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
            {
                candidate.to_path_buf()
            } else if let Some((_, path)) = available.iter().find(|(name, _)| name == name_or_path) {
                path.clone()
            } else {
                return Err(MigratorError::InvalidSetting(format!(
                    "preset file not found: {name_or_path}"
                )));
            };
            let json = std::fs::read_to_string(&path).map_err(|e| MigratorError::io(&path, e))?;
            values.push(serde_json::from_str::<Value>(&json)?);
            tracing::debug!(preset = %path.display(), "preset loaded");
        }
        merge_presets(values.iter())
    }
}
