//! CMake text formatting: quoting, placeholder substitution and call layout.

use crate::model::{BUILD_DIR_PLACEHOLDER, SOURCE_DIR_PLACEHOLDER};

/// Argument lists longer than this move to a separate `<VAR>.cmake` file.
const MAX_INLINE_ARGS: usize = 30;
/// Calls whose arguments exceed this width get one argument per line.
const MAX_LINE_ARGS_WIDTH: usize = 60;

/// Escape characters CMake would otherwise interpret inside arguments.
pub fn escape_special_chars(value: &str) -> String {
    value.replace('\t', "\\t").replace('\n', "\\n").replace('\r', "\\r")
}

/// Quote a single argument following CMake rules.
///
/// Already quoted values pass through. With `force`, the value is always
/// wrapped in quotes, which keeps `;` separated lists together.
pub fn quote(value: &str, force: bool) -> String {
    if !force {
        if value.is_empty() {
            return "\"\"".to_string();
        }
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            return escape_special_chars(value);
        }
    }
    let doubled = value.replace('\\', "\\\\");
    if !force && !doubled.contains(' ') {
        return escape_special_chars(&doubled);
    }
    escape_special_chars(&format!("\"{}\"", doubled.replace('"', "\\\"")))
}

/// Double backslashes that do not start a `\"`, `\t`, `\r` or `\n` escape.
fn escape_backslashes(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        result.push(c);
        if c == '\\' && !matches!(chars.peek(), Some('"' | 't' | 'r' | 'n')) {
            result.push('\\');
        }
    }
    result
}

/// Renders relocatable paths and call expressions as CMake source.
#[derive(Debug, Clone)]
pub struct CmakeFormatter {
    /// Placeholder and its CMake expansion, longest placeholder first.
    placeholders: Vec<(String, String)>,
    /// `<VAR>.cmake` files produced for long argument lists.
    side_files: Vec<(String, String)>,
}

impl CmakeFormatter {
    #[must_use]
    pub fn new(source_dir_var: &str) -> Self {
        Self {
            placeholders: vec![
                (BUILD_DIR_PLACEHOLDER.to_string(), "${CMAKE_CURRENT_BINARY_DIR}".to_string()),
                (SOURCE_DIR_PLACEHOLDER.to_string(), format!("${{{source_dir_var}}}")),
            ],
            side_files: Vec::new(),
        }
    }

    /// Expand `placeholder` as `${name}`.
    pub fn add_variable(&mut self, placeholder: &str, name: &str) {
        self.placeholders.push((placeholder.to_string(), format!("${{{name}}}")));
        self.placeholders.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Replace placeholders with their CMake expansions.
    #[must_use]
    pub fn substitute(&self, value: &str) -> String {
        self.placeholders
            .iter()
            .fold(value.to_string(), |acc, (placeholder, expansion)| acc.replace(placeholder, expansion))
    }

    /// Substitute placeholders, then escape stray backslashes.
    #[must_use]
    pub fn format(&self, value: &str) -> String {
        escape_backslashes(&self.substitute(value))
    }

    /// Quote a path relative to the generated `CMakeLists.txt`.
    #[must_use]
    pub fn location(&self, path: &str) -> String {
        quote(&format!("${{CMAKE_CURRENT_LIST_DIR}}/{path}"), false)
    }

    /// A property value: a single argument or a quoted `;` list.
    #[must_use]
    pub fn join_property_values(&self, values: &[String]) -> String {
        let joined = match values {
            [] => "\"\"".to_string(),
            [single] => {
                // a variable may expand to a list
                let force = single.len() > 1 && single.starts_with('@') && single.ends_with('@');
                quote(single, force)
            }
            _ => quote(&values.join(";"), true),
        };
        self.format(&joined)
    }

    /// `func(<begin> <argv> <end>)`, wrapped when the arguments get long.
    pub fn call(&mut self, func: &str, begin: &[&str], argv: &[String], end: &[&str]) -> String {
        self.call_with_list_file(func, begin, argv, end, None)
    }

    /// Like [`Self::call`], moving more than thirty arguments to
    /// `<list_var>.cmake` and referencing them through `${list_var}`.
    pub fn call_with_list_file(
        &mut self,
        func: &str,
        begin: &[&str],
        argv: &[String],
        end: &[&str],
        list_var: Option<&str>,
    ) -> String {
        let begin_str = self.format(&format!("{func}({}", begin.join(" ")));
        let mut end_str = if end.is_empty() {
            String::new()
        } else {
            format!(" {}", self.format(&end.join(" ")))
        };
        let quoted: Vec<String> = argv.iter().map(|arg| quote(arg, false)).collect();

        let mut prefix = String::new();
        let mut argv_str = if begin.is_empty() { String::new() } else { " ".to_string() };
        match list_var {
            Some(var) if quoted.len() > MAX_INLINE_ARGS => {
                let path = format!("{var}.cmake");
                let mut content = format!("set({var}\n");
                for arg in &quoted {
                    content.push_str(&self.substitute(arg));
                    content.push('\n');
                }
                content.push_str(")\n");
                self.side_files.push((path.clone(), content));
                prefix = format!("include({})\n", self.location(&path));
                argv_str.push_str(&format!("${{{var}}}"));
            }
            _ => argv_str.push_str(&self.substitute(&quoted.join(" "))),
        }

        if argv_str.len() > MAX_LINE_ARGS_WIDTH {
            argv_str = format!("\n    {}\n", self.substitute(&quoted.join("\n    ")));
            if !end.is_empty() {
                end_str = format!("   {end_str}\n");
            }
        }
        format!("{prefix}{begin_str}{argv_str}{end_str})\n")
    }

    /// `set(name value...)`
    pub fn variable(&mut self, name: &str, values: &[String], suffix: &[&str]) -> String {
        if values.is_empty() {
            return self.call("set", &[name], &[String::new()], suffix);
        }
        self.call("set", &[name], values, suffix)
    }

    /// `set(NAME value... CACHE <kind> "")`
    pub fn cache_variable(&mut self, name: &str, values: &[String], kind: &str) -> String {
        self.variable(name, values, &["CACHE", kind, "\"\""])
    }

    /// Take the list files produced so far.
    pub fn take_side_files(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.side_files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("", false), "\"\"");
        assert_eq!(quote("abc", false), "abc");
        assert_eq!(quote("a b", false), "\"a b\"");
        assert_eq!(quote("say \"hi\" now", false), "\"say \\\"hi\\\" now\"");
        assert_eq!(quote("C:\\dir", false), "C:\\\\dir");
        assert_eq!(quote("a\tb", false), "a\\tb");
        assert_eq!(quote("\"already quoted\"", false), "\"already quoted\"");
        assert_eq!(quote("a;b", true), "\"a;b\"");
    }

    #[test]
    fn test_placeholders() {
        let mut fmt = CmakeFormatter::new("FOO_SOURCE_DIR");
        fmt.add_variable("@SDK@", "SDK");
        assert_eq!(
            fmt.substitute("@build_dir@/a @source_dir@/b @SDK@/c"),
            "${CMAKE_CURRENT_BINARY_DIR}/a ${FOO_SOURCE_DIR}/b ${SDK}/c"
        );
    }

    #[test]
    fn test_short_and_wrapped_calls() {
        let mut fmt = CmakeFormatter::new("SOURCE_DIR");
        assert_eq!(
            fmt.call("add_library", &["z", "STATIC"], &["@source_dir@/z.c".to_string()], &[]),
            "add_library(z STATIC ${SOURCE_DIR}/z.c)\n"
        );
        let argv: Vec<String> = (0..6).map(|i| format!("@source_dir@/file{i}.c")).collect();
        let call = fmt.call("set_source_files_properties", &[], &argv, &["PROPERTIES", "EXTERNAL_OBJECT", "ON"]);
        assert!(call.starts_with("set_source_files_properties(\n    ${SOURCE_DIR}/file0.c\n"));
        assert!(call.ends_with("${SOURCE_DIR}/file5.c\n    PROPERTIES EXTERNAL_OBJECT ON\n)\n"));
    }

    #[test]
    fn test_long_source_list_goes_to_file() {
        let mut fmt = CmakeFormatter::new("SOURCE_DIR");
        let argv: Vec<String> = (0..31).map(|i| format!("@source_dir@/f{i}.c")).collect();
        let call = fmt.call_with_list_file("add_executable", &["app"], &argv, &[], Some("APP_SRC"));
        assert_eq!(
            call,
            "include(${CMAKE_CURRENT_LIST_DIR}/APP_SRC.cmake)\nadd_executable(app ${APP_SRC})\n"
        );
        let files = fmt.take_side_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "APP_SRC.cmake");
        assert!(files[0].1.starts_with("set(APP_SRC\n${SOURCE_DIR}/f0.c\n"));
        assert!(files[0].1.ends_with("${SOURCE_DIR}/f30.c\n)\n"));
    }

    #[test]
    fn test_property_values() {
        let fmt = CmakeFormatter::new("SOURCE_DIR");
        assert_eq!(fmt.join_property_values(&[]), "\"\"");
        assert_eq!(fmt.join_property_values(&["-DA".to_string()]), "-DA");
        assert_eq!(
            fmt.join_property_values(&["-DA".to_string(), "-DB".to_string()]),
            "\"-DA;-DB\""
        );
    }

    #[test]
    fn test_cache_variable() {
        let mut fmt = CmakeFormatter::new("SOURCE_DIR");
        assert_eq!(
            fmt.cache_variable("SDK", &["/opt/sdk".to_string()], "STRING"),
            "set(SDK /opt/sdk CACHE STRING \"\")\n"
        );
        assert_eq!(fmt.variable("empty", &[], &[]), "set(empty \"\")\n");
    }
}
