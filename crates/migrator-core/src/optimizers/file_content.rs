//! Rewrites of captured file contents: regex substitution and re-encoding.

use super::Optimizer;
use crate::model::{BuildObjectModel, TargetKind};
use crate::{MigratorError, Result};
use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE, WINDOWS_1252};
use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use tracing::debug;

// =============================================================================
// PATH MASKS
// =============================================================================

/// Case-insensitive wildcard over target outputs; `*` also matches `/`.
/// A leading `!` inverts the match.
#[derive(Debug, Clone)]
pub struct PathMask {
    glob: GlobMatcher,
    negated: bool,
}

impl PathMask {
    pub fn new(mask: &str) -> Result<Self> {
        let (negated, pattern) = match mask.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, mask),
        };
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(false)
            .build()?
            .compile_matcher();
        Ok(Self { glob, negated })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.glob.is_match(path) != self.negated
    }
}

// =============================================================================
// TEXT ENCODINGS
// =============================================================================

/// A named text encoding and whether encoded text starts with a BOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEncoding {
    encoding: &'static Encoding,
    bom: bool,
}

impl TextEncoding {
    pub fn from_name(name: &str) -> Result<Self> {
        let label = name.trim().to_ascii_lowercase().replace('_', "-");
        let (encoding, bom) = match label.as_str() {
            "utf-8-sig" | "utf8-sig" => (UTF_8, true),
            "utf-16" | "utf16" | "utf-16-le" | "utf-16le" => (UTF_16LE, true),
            "utf-16-be" | "utf-16be" => (UTF_16BE, true),
            "latin-1" | "latin1" | "l1" | "iso-8859-1" => (WINDOWS_1252, false),
            _ if label.starts_with("utf-32") || label.starts_with("utf32") => {
                return Err(MigratorError::InvalidSetting(format!("unsupported encoding: {name}")));
            }
            _ => match Encoding::for_label(label.as_bytes()) {
                Some(encoding) => (encoding, false),
                None => return Err(MigratorError::InvalidSetting(format!("unknown encoding: {name}"))),
            },
        };
        Ok(Self { encoding, bom })
    }

    /// Encoding announced by a byte order mark, UTF-8 without one.
    pub fn detect(bytes: &[u8]) -> Self {
        match Encoding::for_bom(bytes) {
            Some((encoding, _)) => Self { encoding, bom: true },
            None => Self {
                encoding: UTF_8,
                bom: false,
            },
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        let (text, had_errors) = self.encoding.decode_with_bom_removal(bytes);
        if had_errors {
            return Err(MigratorError::Parse(format!("content is not valid {}", self.encoding.name())));
        }
        Ok(text.into_owned())
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(text.len() + 3);
        if self.encoding == UTF_16LE || self.encoding == UTF_16BE {
            let bom = if self.bom { "\u{feff}" } else { "" };
            for unit in bom.encode_utf16().chain(text.encode_utf16()) {
                if self.encoding == UTF_16LE {
                    bytes.extend_from_slice(&unit.to_le_bytes());
                } else {
                    bytes.extend_from_slice(&unit.to_be_bytes());
                }
            }
            return Ok(bytes);
        }
        if self.bom {
            bytes.extend_from_slice(b"\xEF\xBB\xBF");
        }
        let (encoded, _, unmappable) = self.encoding.encode(text);
        if unmappable {
            return Err(MigratorError::Parse(format!(
                "content cannot be represented in {}",
                self.encoding.name()
            )));
        }
        bytes.extend_from_slice(&encoded);
        Ok(bytes)
    }
}

// =============================================================================
// OPTIMIZERS
// =============================================================================

/// Regex substitution, line by line, in captured files matching a mask.
pub struct FileTargetGsub {
    rules: Vec<(PathMask, Regex, String)>,
}

impl FileTargetGsub {
    pub fn new(rules: &[(String, String, String)]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|(mask, pattern, replacement)| {
                Ok((PathMask::new(mask)?, Regex::new(pattern)?, replacement.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

impl Optimizer for FileTargetGsub {
    fn name(&self) -> &'static str {
        "file_target_gsub"
    }

    fn optimize(&self, model: &BuildObjectModel) -> Result<BuildObjectModel> {
        let mut model = model.clone();
        for target in &mut model.targets {
            let TargetKind::File(file) = &mut target.kind else {
                continue;
            };
            for (mask, regex, replacement) in &self.rules {
                if !mask.is_match(&file.output) {
                    continue;
                }
                let encoding = TextEncoding::detect(&file.content);
                let text = encoding.decode(&file.content)?;
                // per line, terminators excluded
                let replaced: String = text
                    .split_inclusive('\n')
                    .map(|line| {
                        let (body, end) = match line.strip_suffix('\n') {
                            Some(body) => (body, "\n"),
                            None => (line, ""),
                        };
                        format!("{}{end}", regex.replace_all(body, replacement.as_str()))
                    })
                    .collect();
                file.content = encoding.encode(&replaced)?;
                debug!(output = %file.output, "file content substituted");
            }
        }
        Ok(model)
    }
}

/// Re-encodes captured files matching a mask.
pub struct FileTargetChangeEncoding {
    rules: Vec<(PathMask, TextEncoding, TextEncoding)>,
}

impl FileTargetChangeEncoding {
    pub fn new(rules: &[(String, String, String)]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|(mask, from, to)| {
                Ok((PathMask::new(mask)?, TextEncoding::from_name(from)?, TextEncoding::from_name(to)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

impl Optimizer for FileTargetChangeEncoding {
    fn name(&self) -> &'static str {
        "file_target_change_encoding"
    }

    fn optimize(&self, model: &BuildObjectModel) -> Result<BuildObjectModel> {
        let mut model = model.clone();
        for target in &mut model.targets {
            let TargetKind::File(file) = &mut target.kind else {
                continue;
            };
            for (mask, from, to) in &self.rules {
                if mask.is_match(&file.output) {
                    let text = from.decode(&file.content)?;
                    file.content = to.encode(&text)?;
                    debug!(output = %file.output, "file re-encoded");
                }
            }
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileTarget, Target};

    fn file(output: &str, content: &[u8]) -> Target {
        Target::from(TargetKind::File(FileTarget {
            output: output.to_string(),
            content: content.to_vec(),
            dependencies: Vec::new(),
        }))
    }

    fn content(model: &BuildObjectModel, output: &str) -> Vec<u8> {
        match &model.find(output).unwrap().kind {
            TargetKind::File(file) => file.content.clone(),
            other => panic!("not a file: {other:?}"),
        }
    }

    fn rule(a: &str, b: &str, c: &str) -> (String, String, String) {
        (a.to_string(), b.to_string(), c.to_string())
    }

    // =========================================================================
    // MASKS
    // =========================================================================

    #[test]
    fn test_mask_star_crosses_directories() {
        let mask = PathMask::new("*.RC").unwrap();
        assert!(mask.is_match("@source_dir@/res/app.rc"));
        assert!(!mask.is_match("@source_dir@/res/app.h"));
    }

    #[test]
    fn test_negated_mask() {
        let mask = PathMask::new("!*/version.h").unwrap();
        assert!(mask.is_match("@source_dir@/config.h"));
        assert!(!mask.is_match("@source_dir@/include/version.h"));
    }

    // =========================================================================
    // ENCODINGS
    // =========================================================================

    #[test]
    fn test_encoding_names() {
        assert_eq!(TextEncoding::from_name("UTF_8").unwrap(), TextEncoding::detect(b"plain"));
        assert_eq!(TextEncoding::from_name("utf-16").unwrap(), TextEncoding::detect(b"\xFF\xFEa\0"));
        assert!(TextEncoding::from_name("utf-32").is_err());
        assert!(TextEncoding::from_name("klingon").is_err());
    }

    #[test]
    fn test_utf16_encoding_writes_bom() {
        let le = TextEncoding::from_name("utf-16-le").unwrap().encode("ab").unwrap();
        assert_eq!(le, b"\xFF\xFEa\0b\0");
        let be = TextEncoding::from_name("utf-16-be").unwrap().encode("a").unwrap();
        assert_eq!(be, b"\xFE\xFF\0a");
    }

    // =========================================================================
    // OPTIMIZERS
    // =========================================================================

    #[test]
    fn test_gsub_applies_to_matching_files_only() {
        let model = BuildObjectModel::new(vec![
            file("@source_dir@/a.h", b"#define PATH \"/opt/x\"\nint x;\n"),
            file("@source_dir@/b.txt", b"/opt/x\n"),
        ]);
        let gsub = FileTargetGsub::new(&[rule("*.h", r"/opt/(\w+)", "/usr/$1")]).unwrap();
        let result = gsub.optimize(&model).unwrap();
        assert_eq!(content(&result, "@source_dir@/a.h"), b"#define PATH \"/usr/x\"\nint x;\n");
        assert_eq!(content(&result, "@source_dir@/b.txt"), b"/opt/x\n");
    }

    #[test]
    fn test_gsub_works_per_line_and_keeps_encoding() {
        let mut utf16 = vec![0xFF, 0xFE];
        for unit in "one\ntwo".encode_utf16() {
            utf16.extend_from_slice(&unit.to_le_bytes());
        }
        let model = BuildObjectModel::new(vec![file("@source_dir@/res.rc", &utf16)]);
        let gsub = FileTargetGsub::new(&[rule("*.rc", "$", ";")]).unwrap();
        let result = gsub.optimize(&model).unwrap();

        let mut expected = vec![0xFF, 0xFE];
        for unit in "one;\ntwo;".encode_utf16() {
            expected.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(content(&result, "@source_dir@/res.rc"), expected);
    }

    #[test]
    fn test_change_encoding_latin1_to_utf8_sig() {
        let model = BuildObjectModel::new(vec![file("@source_dir@/msg.txt", b"caf\xE9\n")]);
        let change = FileTargetChangeEncoding::new(&[rule("*.txt", "latin-1", "utf-8-sig")]).unwrap();
        let result = change.optimize(&model).unwrap();
        assert_eq!(content(&result, "@source_dir@/msg.txt"), "\u{feff}café\n".as_bytes());
    }

    #[test]
    fn test_change_encoding_strips_source_bom() {
        let model = BuildObjectModel::new(vec![file("@source_dir@/a.rc", b"\xEF\xBB\xBFA")]);
        let change = FileTargetChangeEncoding::new(&[rule("*", "utf-8-sig", "utf-16-le")]).unwrap();
        let result = change.optimize(&model).unwrap();
        assert_eq!(content(&result, "@source_dir@/a.rc"), b"\xFF\xFEA\0");
    }

    #[test]
    fn test_undecodable_content_is_a_parse_error() {
        let model = BuildObjectModel::new(vec![file("@source_dir@/msg.txt", b"caf\xE9\n")]);
        let change = FileTargetChangeEncoding::new(&[rule("*.txt", "utf-8", "utf-16")]).unwrap();
        let err = change.optimize(&model).unwrap_err();
        assert!(matches!(err, MigratorError::Parse(_)));
    }

    #[test]
    fn test_invalid_encoding_fails_construction() {
        assert!(FileTargetChangeEncoding::new(&[rule("*", "utf-8", "utf-32")]).is_err());
    }
}
