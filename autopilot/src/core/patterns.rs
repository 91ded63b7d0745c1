//! Versioned pattern sets for readiness detection.
//!
//! The driven CLI exposes no protocol, only a repainted screen. Which text
//! means "idle", "working" or "asking for permission" is therefore data, not
//! code: a [`PatternSet`] can be loaded from TOML and swapped without touching
//! the controller. [`CompiledPatterns`] is the validated, ready-to-match form.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::ansi::strip_ansi;
use crate::error::DriverError;

pub const PATTERN_SET_VERSION: u32 = 1;

/// Raw, serializable pattern configuration.
///
/// All pattern entries are regular expressions. Clear-screen markers are
/// literal byte strings (TOML `\u001b` escapes are the usual way to write them).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSet {
    pub version: u32,
    /// Tried in order; any match marks the frame as a ready candidate.
    pub ready_patterns: Vec<String>,
    /// A match after the last ready match (in stripped text) vetoes readiness.
    pub busy_patterns: Vec<String>,
    /// Any match means the CLI is blocked on an interactive permission prompt.
    pub permission_patterns: Vec<String>,
    /// Markers that release a latched permission prompt. Empty means "use ready_patterns".
    pub resolved_patterns: Vec<String>,
    pub clear_screen_markers: Vec<String>,
}

impl Default for PatternSet {
    fn default() -> Self {
        Self {
            version: PATTERN_SET_VERSION,
            ready_patterns: vec![
                r"\? for shortcuts".to_string(),
                r"(?m)^\s*[│|]?\s*>\s*[│|]?\s*$".to_string(),
                // Inverse-video caret; only visible in the JSON-escaped form.
                r"\\u001b\[7m \\u001b\[27m".to_string(),
            ],
            // The spinner line sits above the idle footer while working, so
            // Claude Code relies on the debounce instead of a busy marker.
            busy_patterns: Vec::new(),
            permission_patterns: vec![
                r"(?i)do you want to".to_string(),
                r"(?i)proceed with".to_string(),
                r"(?i)\bcontinue\?".to_string(),
                r"(?i)do you trust the files".to_string(),
                r"(?i)\(y/n\)".to_string(),
            ],
            resolved_patterns: vec![r"\? for shortcuts".to_string()],
            clear_screen_markers: vec![
                "\u{1b}[2J".to_string(),
                "\u{1b}[3J".to_string(),
                "\u{1b}c".to_string(),
            ],
        }
    }
}

impl PatternSet {
    /// Validate and compile into matchers.
    pub fn compile(&self) -> Result<CompiledPatterns, DriverError> {
        if self.ready_patterns.is_empty() {
            return Err(DriverError::Configuration(
                "patterns.ready_patterns must not be empty".to_string(),
            ));
        }
        if self.clear_screen_markers.iter().any(String::is_empty) {
            return Err(DriverError::Configuration(
                "patterns.clear_screen_markers must not contain empty markers".to_string(),
            ));
        }

        let ready = compile_list("ready_patterns", &self.ready_patterns)?;
        let resolved = if self.resolved_patterns.is_empty() {
            ready.clone()
        } else {
            compile_list("resolved_patterns", &self.resolved_patterns)?
        };

        Ok(CompiledPatterns {
            version: self.version,
            ready,
            busy: compile_list("busy_patterns", &self.busy_patterns)?,
            permission: compile_list("permission_patterns", &self.permission_patterns)?,
            resolved,
            clear: ClearMarkers::new(
                self.clear_screen_markers
                    .iter()
                    .map(|marker| marker.as_bytes().to_vec())
                    .collect(),
            ),
        })
    }
}

fn compile_list(field: &str, patterns: &[String]) -> Result<Vec<Regex>, DriverError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| {
                DriverError::Configuration(format!(
                    "patterns.{field}: invalid pattern {pattern:?}: {err}"
                ))
            })
        })
        .collect()
}

/// Literal clear-screen markers.
#[derive(Debug, Clone, Default)]
pub struct ClearMarkers {
    markers: Vec<Vec<u8>>,
    max_len: usize,
}

impl ClearMarkers {
    pub fn new(markers: Vec<Vec<u8>>) -> Self {
        let max_len = markers.iter().map(Vec::len).max().unwrap_or(0);
        Self { markers, max_len }
    }

    /// Length of the longest marker.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Exclusive end offset of the last marker occurrence in `haystack`.
    pub fn last_end(&self, haystack: &[u8]) -> Option<usize> {
        self.markers
            .iter()
            .filter_map(|marker| rfind(haystack, marker).map(|start| start + marker.len()))
            .max()
    }

    /// The bytes after the last marker, or everything when no marker is present.
    pub fn live_suffix<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        match self.last_end(bytes) {
            Some(end) => &bytes[end..],
            None => bytes,
        }
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|window| window == needle)
}

/// The three textual views of a live frame that patterns are tried against.
#[derive(Debug, Clone)]
pub struct FrameText {
    /// ANSI-stripped text.
    pub stripped: String,
    /// Lossy UTF-8 of the raw bytes, escapes intact.
    pub raw: String,
    /// JSON string encoding of `raw` (ESC becomes `\u001b`).
    pub escaped: String,
}

impl FrameText {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(bytes).into_owned();
        let escaped = serde_json::to_string(&raw).unwrap_or_default();
        Self {
            stripped: strip_ansi(bytes),
            raw,
            escaped,
        }
    }

    fn forms(&self) -> [&str; 3] {
        [&self.stripped, &self.raw, &self.escaped]
    }
}

/// Validated matchers built from a [`PatternSet`].
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    version: u32,
    ready: Vec<Regex>,
    busy: Vec<Regex>,
    permission: Vec<Regex>,
    resolved: Vec<Regex>,
    clear: ClearMarkers,
}

impl CompiledPatterns {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn clear_markers(&self) -> &ClearMarkers {
        &self.clear
    }

    /// First permission pattern matching the frame, by declaration order.
    pub fn permission_match(&self, frame: &FrameText) -> Option<&str> {
        first_match(&self.permission, frame)
    }

    /// First ready pattern matching the frame, by declaration order.
    pub fn ready_match(&self, frame: &FrameText) -> Option<&str> {
        first_match(&self.ready, frame)
    }

    /// Whether a busy marker starts after the last ready marker in the stripped text.
    ///
    /// The buffer accumulates every repaint since the last clear, so a busy
    /// line that was later overdrawn by an idle footer must not count.
    pub fn busy_after_ready(&self, frame: &FrameText) -> bool {
        let text = frame.stripped.as_str();
        let last_start = |patterns: &[Regex]| {
            patterns
                .iter()
                .filter_map(|re| re.find_iter(text).last().map(|m| m.start()))
                .max()
        };
        match (last_start(&self.busy), last_start(&self.ready)) {
            (Some(busy), Some(ready)) => busy > ready,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn is_resolved(&self, frame: &FrameText) -> bool {
        first_match(&self.resolved, frame).is_some()
    }
}

impl Default for CompiledPatterns {
    fn default() -> Self {
        match PatternSet::default().compile() {
            Ok(compiled) => compiled,
            Err(err) => unreachable!("built-in pattern set must compile: {err}"),
        }
    }
}

fn first_match<'a>(patterns: &'a [Regex], frame: &FrameText) -> Option<&'a str> {
    patterns
        .iter()
        .find(|re| frame.forms().iter().any(|text| re.is_match(text)))
        .map(Regex::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_compiles() {
        let compiled = PatternSet::default().compile().expect("compile");
        assert_eq!(compiled.version(), PATTERN_SET_VERSION);
        assert_eq!(compiled.clear_markers().max_len(), 4);
    }

    #[test]
    fn invalid_regex_is_a_configuration_error() {
        let set = PatternSet {
            permission_patterns: vec!["(unclosed".to_string()],
            ..PatternSet::default()
        };
        let err = set.compile().unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));
        assert!(err.to_string().contains("permission_patterns"));
    }

    #[test]
    fn empty_ready_list_is_rejected() {
        let set = PatternSet {
            ready_patterns: Vec::new(),
            ..PatternSet::default()
        };
        assert!(set.compile().is_err());
    }

    #[test]
    fn live_suffix_uses_last_marker() {
        let markers = PatternSet::default().compile().expect("compile");
        let bytes = b"old frame\x1b[2Jmiddle\x1b[3Jnewest";
        assert_eq!(markers.clear_markers().live_suffix(bytes), b"newest");
        assert_eq!(markers.clear_markers().live_suffix(b"no clear"), b"no clear");
    }

    #[test]
    fn escaped_form_matches_inverse_caret() {
        let compiled = CompiledPatterns::default();
        let frame = FrameText::from_bytes(b"\x1b[7m \x1b[27m");
        assert!(frame.escaped.contains("\\u001b[7m"));
        assert_eq!(
            compiled.ready_match(&frame),
            Some(r"\\u001b\[7m \\u001b\[27m")
        );
    }

    #[test]
    fn parses_toml_with_escaped_markers() {
        let raw = r#"
version = 2
ready_patterns = ["READY>"]
clear_screen_markers = ["\u001b[2J"]
"#;
        let set: PatternSet = toml::from_str(raw).expect("parse");
        assert_eq!(set.version, 2);
        assert_eq!(set.clear_screen_markers, vec!["\u{1b}[2J".to_string()]);
        // Unspecified lists fall back to defaults.
        assert!(!set.permission_patterns.is_empty());
        set.compile().expect("compile");
    }

    #[test]
    fn busy_marker_only_counts_after_last_ready_marker() {
        let set = PatternSet {
            busy_patterns: vec!["esc to interrupt".to_string()],
            ..PatternSet::default()
        };
        let compiled = set.compile().expect("compile");
        let working = FrameText::from_bytes(b"? for shortcuts\n* Working (esc to interrupt)");
        let done = FrameText::from_bytes(b"* Working (esc to interrupt)\n? for shortcuts");
        assert!(compiled.busy_after_ready(&working));
        assert!(!compiled.busy_after_ready(&done));
    }

    #[test]
    fn resolved_falls_back_to_ready_patterns() {
        let set = PatternSet {
            ready_patterns: vec!["IDLE".to_string()],
            resolved_patterns: Vec::new(),
            ..PatternSet::default()
        };
        let compiled = set.compile().expect("compile");
        assert!(compiled.is_resolved(&FrameText::from_bytes(b"IDLE")));
    }
}
