//! Persistent configuration: `name=value` lines grouped by `[section]`
//! headers (spec.md §6). A malformed line is a warning, not a hard error
//! (spec.md §7's "Configuration parse error → Warn and continue with
//! defaults").

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::DcError;
use crate::logging::{diagnostic, Severity};

#[derive(Debug, Default, Clone)]
pub struct Config {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `text`, warning and skipping any line that isn't a comment,
    /// a `[section]` header, or a `name=value` pair.
    pub fn parse(text: &str) -> Self {
        let mut config = Config::new();
        let mut section = String::new();
        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                match line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                    Some(name) => section = name.trim().to_string(),
                    None => {
                        diagnostic(
                            Severity::Warning,
                            "config",
                            &format!("line {}: malformed section header {:?}, ignoring", idx + 1, raw_line),
                        );
                    }
                }
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    config
                        .sections
                        .entry(section.clone())
                        .or_default()
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
                None => {
                    diagnostic(
                        Severity::Warning,
                        "config",
                        &format!("line {}: expected name=value, got {:?}, ignoring", idx + 1, raw_line),
                    );
                }
            }
        }
        config
    }

    pub fn load(path: &Path) -> Result<Self, DcError> {
        let text = fs::read_to_string(path).map_err(|source| DcError::ConfigIo { path: path.to_path_buf(), source })?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section).and_then(|m| m.get(key)).map(String::as_str)
    }

    pub fn get_or(&self, section: &str, key: &str, default: &'static str) -> String {
        self.get(section, key).unwrap_or(default).to_string()
    }

    pub fn get_u64(&self, section: &str, key: &str, default: u64) -> u64 {
        match self.get(section, key) {
            Some(value) => value.parse().unwrap_or_else(|_| {
                diagnostic(
                    Severity::Warning,
                    "config",
                    &format!("[{section}] {key}={value:?} is not an integer, using default {default}"),
                );
                default
            }),
            None => default,
        }
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections.entry(section.to_string()).or_default().insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_pairs() {
        let cfg = Config::parse(
            "[audio]\nlow_water=512\nname = value with spaces\n[video]\nwidth=640\n# comment\nbogus line\n",
        );
        assert_eq!(cfg.get("audio", "low_water"), Some("512"));
        assert_eq!(cfg.get("audio", "name"), Some("value with spaces"));
        assert_eq!(cfg.get("video", "width"), Some("640"));
        assert_eq!(cfg.get_u64("audio", "low_water", 0), 512);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let cfg = Config::parse("[x]\nnotkv\nok=1\n");
        assert_eq!(cfg.get("x", "ok"), Some("1"));
    }

    #[test]
    fn missing_keys_fall_back_to_default() {
        let cfg = Config::new();
        assert_eq!(cfg.get_u64("video", "width", 640), 640);
    }
}
