//! # Platform Conventions
//!
//! File naming rules of the platform the build log was produced on.
//!
//! Logs may be parsed on a different host than the one that produced them,
//! so nothing here touches the filesystem. `resolve_lib` takes an
//! existence check from the caller instead.

use crate::paths;
use crate::{MigratorError, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// PLATFORM
// =============================================================================

/// Target platform of the build being migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Linux,
    Darwin,
    Windows,
}

/// Names derived from a library or executable filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleNaming {
    /// Name without prefix, extension and version (`libfoo.so.1` -> `foo`).
    pub module_name: String,
    /// Name the build target gets (`foo`, `foo.static`).
    pub target_name: String,
    /// Dotted version encoded in the filename, if any.
    pub version: Option<String>,
}

impl FromStr for Platform {
    type Err = MigratorError;

    fn from_str(name: &str) -> Result<Self> {
        let name = name.to_ascii_lowercase();
        if name.starts_with("win") {
            Ok(Self::Windows)
        } else if name == "darwin" || name == "mac" || name == "macos" {
            Ok(Self::Darwin)
        } else if name == "linux" || name == "unix" {
            Ok(Self::Linux)
        } else {
            Err(MigratorError::InvalidSetting(format!(
                "unknown platform '{name}'"
            )))
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
        };
        f.write_str(name)
    }
}

impl Platform {
    /// The platform the migrator itself runs on.
    #[must_use]
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::Darwin
        } else {
            Self::Linux
        }
    }

    #[must_use]
    pub fn is_windows(self) -> bool {
        self == Self::Windows
    }

    // =========================================================================
    // PATHS
    // =========================================================================

    /// Normalize a path to `/` separators with `.`/`..` folded.
    #[must_use]
    pub fn normalize_path(self, path: &str) -> String {
        match self {
            Self::Windows => paths::normpath(&path.replace('\\', "/")),
            _ => paths::normpath(path),
        }
    }

    /// Whether the path is absolute on this platform.
    ///
    /// Windows logs may still contain Unix style absolute paths (MSYS,
    /// cross builds), so a leading `/` counts there too.
    #[must_use]
    pub fn is_absolute(self, path: &str) -> bool {
        match self {
            Self::Windows => {
                let bytes = path.as_bytes();
                path.starts_with("\\\\")
                    || path.starts_with('/')
                    || (bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic())
            }
            _ => path.starts_with('/'),
        }
    }

    /// Join two paths; an absolute second component wins.
    #[must_use]
    pub fn path_join(self, first: &str, second: &str) -> String {
        if self.is_absolute(second) || first.is_empty() {
            return second.to_string();
        }
        let separators: &[char] = if self.is_windows() { &['/', '\\'] } else { &['/'] };
        format!(
            "{}/{}",
            first.trim_end_matches(separators),
            second.trim_start_matches(separators)
        )
    }

    // =========================================================================
    // LIBRARY NAMES
    // =========================================================================

    fn shared_lib_ext(self) -> &'static str {
        match self {
            Self::Linux => ".so",
            Self::Darwin => ".dylib",
            Self::Windows => ".dll",
        }
    }

    fn static_lib_ext(self) -> &'static str {
        match self {
            Self::Windows => ".lib",
            _ => ".a",
        }
    }

    #[must_use]
    pub fn is_shared_lib(self, path: &str) -> bool {
        match self {
            Self::Linux => self.parse_shared_lib(path).is_some(),
            Self::Darwin => path.ends_with(".dylib"),
            Self::Windows => path.to_ascii_lowercase().ends_with(".dll"),
        }
    }

    #[must_use]
    pub fn is_static_lib(self, path: &str) -> bool {
        match self {
            Self::Windows => path.to_ascii_lowercase().ends_with(".lib"),
            _ => path.ends_with(".a"),
        }
    }

    /// `libfoo.so.1.2` -> `foo` version `1.2`; `libfoo.1.dylib` -> `foo` version `1`;
    /// `Foo.dll` -> `foo`.
    #[must_use]
    pub fn parse_shared_lib(self, path: &str) -> Option<ModuleNaming> {
        let filename = self.filename(path);
        match self {
            Self::Linux => {
                let rest = filename.strip_prefix("lib")?;
                // greedy name: the last ".so" followed only by a version wins
                let mut search_end = rest.len();
                while let Some(idx) = rest[..search_end].rfind(".so") {
                    let name = &rest[..idx];
                    if let Some(version) = parse_version_suffix(&rest[idx + 3..]) {
                        if is_plain_name(name) {
                            return Some(ModuleNaming {
                                module_name: name.to_string(),
                                target_name: name.to_string(),
                                version,
                            });
                        }
                    }
                    search_end = idx;
                }
                None
            }
            Self::Darwin => {
                let rest = filename.strip_prefix("lib")?.strip_suffix(".dylib")?;
                let (name, version) = split_trailing_version(rest);
                is_plain_name(name).then(|| ModuleNaming {
                    module_name: name.to_string(),
                    target_name: name.to_string(),
                    version,
                })
            }
            Self::Windows => {
                let name = strip_suffix_ignore_case(filename, ".dll")?;
                is_plain_name(name).then(|| ModuleNaming {
                    module_name: name.to_string(),
                    target_name: remove_lib_prefix(name).to_ascii_lowercase(),
                    version: None,
                })
            }
        }
    }

    /// `libfoo.a` -> target `foo.static`.
    #[must_use]
    pub fn parse_static_lib(self, path: &str) -> Option<ModuleNaming> {
        let filename = self.filename(path);
        let (name, target_name) = match self {
            Self::Windows => {
                let name = strip_suffix_ignore_case(filename, ".lib")?;
                (name, remove_lib_prefix(name).to_ascii_lowercase())
            }
            _ => {
                let name = filename.strip_prefix("lib")?.strip_suffix(".a")?;
                (name, name.to_string())
            }
        };
        is_plain_name(name).then(|| ModuleNaming {
            module_name: name.to_string(),
            target_name: format!("{target_name}.static"),
            version: None,
        })
    }

    /// Import libraries only exist on Windows: `foo.lib` next to `foo.dll`.
    #[must_use]
    pub fn parse_import_lib(self, path: &str) -> Option<ModuleNaming> {
        if !self.is_windows() {
            return None;
        }
        let name = strip_suffix_ignore_case(self.filename(path), ".lib")?;
        is_plain_name(name).then(|| ModuleNaming {
            module_name: name.to_string(),
            target_name: remove_lib_prefix(name).to_ascii_lowercase(),
            version: None,
        })
    }

    /// `app.1.2` -> `app` version `1.2`; `App.exe` -> `app`.
    #[must_use]
    pub fn parse_executable(self, path: &str) -> Option<ModuleNaming> {
        let filename = self.filename(path);
        match self {
            Self::Windows => {
                let name = strip_suffix_ignore_case(filename, ".exe")?;
                is_plain_name(name).then(|| ModuleNaming {
                    module_name: name.to_string(),
                    target_name: name.to_ascii_lowercase(),
                    version: None,
                })
            }
            _ => {
                let (name, version) = split_trailing_version(filename);
                is_plain_name(name).then(|| ModuleNaming {
                    module_name: name.to_string(),
                    target_name: name.to_string(),
                    version,
                })
            }
        }
    }

    /// Candidate filenames for `-l<namespec>`.
    #[must_use]
    pub fn library_filenames(self, namespec: &str, shared: bool, static_: bool) -> Vec<String> {
        let mut result = Vec::new();
        match self {
            Self::Windows => {
                let base = paths::split_ext(namespec).0;
                if shared {
                    result.push(format!("{base}{}", self.shared_lib_ext()));
                }
                result.push(format!("{base}{}", self.static_lib_ext()));
            }
            _ => {
                if shared {
                    result.push(format!("lib{namespec}{}", self.shared_lib_ext()));
                }
                if static_ {
                    result.push(format!("lib{namespec}{}", self.static_lib_ext()));
                }
            }
        }
        result
    }

    /// Search `lib_dirs` (relative to `cwd`) for a library.
    ///
    /// `exists` decides whether a candidate path is present; callers check
    /// both the filesystem and the targets registered so far.
    pub fn resolve_lib(
        self,
        namespec: &str,
        lib_dirs: &[String],
        cwd: &str,
        static_only: bool,
        exists: &dyn Fn(&str) -> bool,
    ) -> Option<String> {
        let filenames = self.library_filenames(namespec, !static_only, true);
        let mut dirs: Vec<&str> = Vec::new();
        if self.is_windows() {
            dirs.push(cwd);
        }
        dirs.extend(lib_dirs.iter().map(String::as_str));

        for dir in dirs {
            let dir = self.path_join(cwd, dir);
            for filename in &filenames {
                let candidate = self.normalize_path(&self.path_join(&dir, filename));
                if exists(&candidate) {
                    return Some(candidate);
                }
            }
        }
        None
    }

    // =========================================================================
    // PROGRAMS
    // =========================================================================

    /// Regex matching every spelling of a program: `gcc`, `x86_64-linux-gnu-gcc`,
    /// `/usr/bin/gcc`, `gcc.sh`, and on Windows `C:\bin\gcc.exe`.
    pub fn program_regex(self, names: &[&str]) -> Result<Regex> {
        let escaped: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
        let alternatives = escaped.join("|");
        let pattern = match self {
            Self::Windows => format!(r"^(?:.+-|.+\\|.+/)?(?:{alternatives})(?:\.exe|\.bat)?$"),
            _ => format!(r"^(?:.+-|.+/)?(?:{alternatives})(?:\.sh)?$"),
        };
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(self.is_windows())
            .build()?;
        Ok(regex)
    }

    fn filename(self, path: &str) -> &str {
        if self.is_windows() {
            path.rsplit(['/', '\\']).next().unwrap_or(path)
        } else {
            paths::basename(path)
        }
    }
}

// =============================================================================
// NAME PARSING HELPERS
// =============================================================================

/// Filename stems may not contain separators or whitespace.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c == '/' || c == '\\' || c.is_whitespace())
}

fn remove_lib_prefix(name: &str) -> &str {
    if name.len() > 3 && name[..3].eq_ignore_ascii_case("lib") {
        &name[3..]
    } else {
        name
    }
}

fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let split = name.len().checked_sub(suffix.len())?;
    if name.is_char_boundary(split) && name[split..].eq_ignore_ascii_case(suffix) {
        Some(&name[..split])
    } else {
        None
    }
}

/// Parse `(\.\d+){0,4}` anchored at both ends. `Some(None)` for an empty input.
fn parse_version_suffix(suffix: &str) -> Option<Option<String>> {
    if suffix.is_empty() {
        return Some(None);
    }
    let body = suffix.strip_prefix('.')?;
    let parts: Vec<&str> = body.split('.').collect();
    if parts.len() > 4
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    Some(Some(body.to_string()))
}

/// Split up to four trailing `.N` groups off a name, keeping at least one
/// character of name.
fn split_trailing_version(name: &str) -> (&str, Option<String>) {
    let mut end = name.len();
    let mut groups = 0;
    while groups < 4 {
        let Some(dot) = name[..end].rfind('.') else {
            break;
        };
        let digits = &name[dot + 1..end];
        if dot == 0 || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            break;
        }
        end = dot;
        groups += 1;
    }
    if end == name.len() {
        (name, None)
    } else {
        (&name[..end], Some(name[end + 1..].to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_from_str() {
        assert_eq!("Windows".parse::<Platform>().unwrap(), Platform::Windows);
        assert_eq!("win32".parse::<Platform>().unwrap(), Platform::Windows);
        assert_eq!("mac".parse::<Platform>().unwrap(), Platform::Darwin);
        assert_eq!("linux".parse::<Platform>().unwrap(), Platform::Linux);
        assert!("amiga".parse::<Platform>().is_err());
    }

    #[test]
    fn test_parse_unix_shared_lib() {
        let naming = Platform::Linux.parse_shared_lib("/x/libfoo.so.1.2").unwrap();
        assert_eq!(naming.module_name, "foo");
        assert_eq!(naming.target_name, "foo");
        assert_eq!(naming.version.as_deref(), Some("1.2"));

        let naming = Platform::Linux.parse_shared_lib("libfoo.so").unwrap();
        assert_eq!(naming.version, None);

        let naming = Platform::Linux.parse_shared_lib("libfoo.so.bar.so.3").unwrap();
        assert_eq!(naming.module_name, "foo.so.bar");

        assert!(Platform::Linux.parse_shared_lib("foo.so").is_none());
        assert!(Platform::Linux.parse_shared_lib("libfoo.so.x").is_none());
        assert!(Platform::Linux.parse_shared_lib("libfoo.so.1.2.3.4.5").is_none());
    }

    #[test]
    fn test_parse_darwin_shared_lib() {
        let naming = Platform::Darwin.parse_shared_lib("libz.1.2.11.dylib").unwrap();
        assert_eq!(naming.module_name, "z");
        assert_eq!(naming.version.as_deref(), Some("1.2.11"));
        assert!(Platform::Darwin.is_shared_lib("libz.dylib"));
    }

    #[test]
    fn test_parse_static_lib() {
        let naming = Platform::Linux.parse_static_lib("out/libssl.a").unwrap();
        assert_eq!(naming.module_name, "ssl");
        assert_eq!(naming.target_name, "ssl.static");

        let naming = Platform::Windows.parse_static_lib("C:\\out\\LibCrypto.LIB").unwrap();
        assert_eq!(naming.module_name, "LibCrypto");
        assert_eq!(naming.target_name, "crypto.static");
    }

    #[test]
    fn test_parse_executable() {
        let naming = Platform::Linux.parse_executable("bin/app.1.2").unwrap();
        assert_eq!(naming.target_name, "app");
        assert_eq!(naming.version.as_deref(), Some("1.2"));

        let naming = Platform::Linux.parse_executable("a.out").unwrap();
        assert_eq!(naming.target_name, "a.out");

        let naming = Platform::Windows.parse_executable("Tool.EXE").unwrap();
        assert_eq!(naming.target_name, "tool");
        assert!(Platform::Windows.parse_executable("tool").is_none());
    }

    #[test]
    fn test_windows_paths() {
        let windows = Platform::Windows;
        assert!(windows.is_absolute("C:\\x"));
        assert!(windows.is_absolute("\\\\server\\share"));
        assert!(!windows.is_absolute("x\\y"));
        assert_eq!(windows.normalize_path("C:\\a\\..\\b"), "C:/b");
        assert_eq!(windows.path_join("C:\\a\\", "b"), "C:\\a/b");
    }

    #[test]
    fn test_resolve_lib_prefers_shared() {
        let lib_dirs = vec!["lib".to_string()];
        let exists = |p: &str| p == "/b/lib/libz.so" || p == "/b/lib/libz.a";
        let found = Platform::Linux.resolve_lib("z", &lib_dirs, "/b", false, &exists);
        assert_eq!(found.as_deref(), Some("/b/lib/libz.so"));
        let found = Platform::Linux.resolve_lib("z", &lib_dirs, "/b", true, &exists);
        assert_eq!(found.as_deref(), Some("/b/lib/libz.a"));
        let found = Platform::Linux.resolve_lib("m", &lib_dirs, "/b", false, &exists);
        assert!(found.is_none());
    }

    #[test]
    fn test_program_regex() {
        let re = Platform::Linux.program_regex(&["gcc", "g++"]).unwrap();
        assert!(re.is_match("gcc"));
        assert!(re.is_match("/usr/bin/g++"));
        assert!(re.is_match("aarch64-linux-gnu-gcc"));
        assert!(!re.is_match("gccx"));
        assert!(!re.is_match("xgcc"));

        let re = Platform::Windows.program_regex(&["rc"]).unwrap();
        assert!(re.is_match("C:\\Kits\\bin\\RC.EXE"));
        assert!(!re.is_match("rcx.exe"));
    }
}
