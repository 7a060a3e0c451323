//! Key/value configuration properties.
//!
//! Server binaries read their settings from plain text files of
//! `key <delimiter> value` lines. The format is deliberately forgiving:
//! lines whose first character is `#` are comments, lines without the
//! delimiter are skipped, and surrounding whitespace never matters.
//! Lookups go through typed getters that take the caller's default, so a
//! missing or malformed setting can never fail a running server.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use tracing::debug;

/// Characters stripped from both ends of keys and values.
const OUTER_WHITESPACE: &[char] = &[' ', '\t', '\r', '\n'];

fn trim_outer(s: &str) -> &str {
    s.trim_matches(OUTER_WHITESPACE)
}

/// An ordered collection of string properties with typed, defaulting lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    props: BTreeMap<String, String>,
}

impl Properties {
    /// Creates an empty property set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads properties from a file, merging over anything already present.
    ///
    /// `delimiter` separates keys from values (the first occurrence on each
    /// line wins; later occurrences belong to the value). With `multiline`
    /// set, repeated keys concatenate their values instead of replacing
    /// them, letting one logical value span several lines.
    ///
    /// Only the open can fail; malformed lines are skipped, never reported.
    pub fn load_file(
        &mut self,
        path: impl AsRef<Path>,
        delimiter: char,
        multiline: bool,
    ) -> io::Result<()> {
        let path = path.as_ref();
        let file = File::open(path)?;
        self.load_reader(BufReader::new(file), delimiter, multiline)?;
        debug!(path = %path.display(), entries = self.props.len(), "loaded properties");
        Ok(())
    }

    /// Loads properties from any buffered reader. See [`Properties::load_file`].
    pub fn load_reader<R: BufRead>(
        &mut self,
        reader: R,
        delimiter: char,
        multiline: bool,
    ) -> io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            // A comment marker counts only in column zero.
            if line.starts_with('#') {
                continue;
            }
            let Some(pos) = line.find(delimiter) else {
                continue;
            };
            let key = trim_outer(&line[..pos]);
            let value = trim_outer(&line[pos + delimiter.len_utf8()..]);
            if multiline {
                self.props
                    .entry(key.to_string())
                    .or_default()
                    .push_str(value);
            } else {
                self.props.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Returns the string value for `key`, or `default` when absent.
    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.props.get(key) {
            Some(v) => v.as_str(),
            None => default,
        }
    }

    /// Returns the value for `key` as an `i32`, or `default` when absent
    /// or not a number.
    pub fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.get_parsed(key, default)
    }

    /// Returns the value for `key` as an `i64`, or `default` when absent
    /// or not a number.
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get_parsed(key, default)
    }

    /// Returns the value for `key` as a `u64`, or `default` when absent
    /// or not a number.
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get_parsed(key, default)
    }

    /// Returns the value for `key` as an `f64`, or `default` when absent
    /// or not a number.
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get_parsed(key, default)
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.props.get(key) {
            Some(v) => v.parse().unwrap_or(default),
            None => default,
        }
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.props.insert(key.into(), value.into());
    }

    /// True when a value exists for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    /// Number of stored properties.
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// True when no properties are stored.
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Iterates over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders every property as `<prefix><key>=<value>` lines, in key
    /// order, for startup logging. Entries with empty keys are skipped.
    pub fn render_list(&self, line_prefix: &str) -> String {
        let mut out = String::new();
        for (key, value) in &self.props {
            if key.is_empty() {
                continue;
            }
            out.push_str(line_prefix);
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn from_text(text: &str) -> Properties {
        let mut props = Properties::new();
        props.load_reader(text.as_bytes(), '=', false).unwrap();
        props
    }

    #[test]
    fn test_basic_key_value() {
        let props = from_text("metaServer.port = 20000\nmetaServer.logDir = /var/log/nimbus\n");
        assert_eq!(props.get_str("metaServer.port", ""), "20000");
        assert_eq!(props.get_str("metaServer.logDir", ""), "/var/log/nimbus");
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn test_surrounding_whitespace_trimmed() {
        let props = from_text("  key  = value with spaces  \n");
        assert_eq!(props.get_str("key", ""), "value with spaces");
    }

    #[test]
    fn test_tabs_and_carriage_returns_trimmed() {
        let props = from_text("\tchunk.dir\t=\t/data/chunks\r\n");
        assert_eq!(props.get_str("chunk.dir", ""), "/data/chunks");
    }

    #[test]
    fn test_comment_lines_ignored() {
        let props = from_text("# commented = out\nreal = yes\n");
        assert!(!props.contains_key("# commented"));
        assert_eq!(props.get_str("real", ""), "yes");
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_hash_past_column_zero_is_data() {
        // Only a leading '#' makes a comment; indented ones are ordinary text.
        let props = from_text("  # note = kept\n");
        assert_eq!(props.get_str("# note", ""), "kept");
    }

    #[test]
    fn test_lines_without_delimiter_skipped() {
        let props = from_text("no delimiter here\nvalid = 1\n");
        assert_eq!(props.len(), 1);
        assert_eq!(props.get_i32("valid", 0), 1);
    }

    #[test]
    fn test_splits_at_first_delimiter_only() {
        let props = from_text("connect = host=nimbus01 port=20000\n");
        assert_eq!(props.get_str("connect", ""), "host=nimbus01 port=20000");
    }

    #[test]
    fn test_last_assignment_wins() {
        let props = from_text("retries = 3\nretries = 5\n");
        assert_eq!(props.get_i32("retries", 0), 5);
    }

    #[test]
    fn test_multiline_concatenates_values() {
        let mut props = Properties::new();
        props
            .load_reader("hosts = alpha,\nhosts = beta,\nhosts = gamma\n".as_bytes(), '=', true)
            .unwrap();
        assert_eq!(props.get_str("hosts", ""), "alpha,beta,gamma");
    }

    #[test]
    fn test_custom_delimiter() {
        let mut props = Properties::new();
        props.load_reader("port: 30000\n".as_bytes(), ':', false).unwrap();
        assert_eq!(props.get_u64("port", 0), 30000);
    }

    #[test]
    fn test_typed_getters_fall_back_to_default() {
        let props = from_text("present = 42\n");
        assert_eq!(props.get_i32("present", 0), 42);
        assert_eq!(props.get_i32("absent", -7), -7);
        assert_eq!(props.get_i64("absent", 1 << 40), 1 << 40);
        assert_eq!(props.get_u64("absent", 9000), 9000);
        assert_eq!(props.get_f64("absent", 0.25), 0.25);
        assert_eq!(props.get_str("absent", "fallback"), "fallback");
    }

    #[test]
    fn test_unparseable_numeric_returns_default() {
        let props = from_text("threads = lots\nratio = 0.5x\n");
        assert_eq!(props.get_i32("threads", 8), 8);
        assert_eq!(props.get_f64("ratio", 1.0), 1.0);
    }

    #[test]
    fn test_negative_and_float_values() {
        let props = from_text("offset = -128\nload = 0.75\n");
        assert_eq!(props.get_i64("offset", 0), -128);
        assert_eq!(props.get_f64("load", 0.0), 0.75);
    }

    #[test]
    fn test_set_overrides_loaded_value() {
        let mut props = from_text("mode = file\n");
        props.set("mode", "memory");
        assert_eq!(props.get_str("mode", ""), "memory");
    }

    #[test]
    fn test_render_list_sorted_with_prefix() {
        let mut props = Properties::new();
        props.set("b", "2");
        props.set("a", "1");
        assert_eq!(props.render_list("cfg."), "cfg.a=1\ncfg.b=2\n");
    }

    #[test]
    fn test_load_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.prp");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "# nimbus meta server").unwrap();
        writeln!(file, "metaServer.checkpointDir = /data/cp").unwrap();
        writeln!(file, "metaServer.replicationCheckSecs = 30").unwrap();
        drop(file);

        let mut props = Properties::new();
        props.load_file(&path, '=', false).unwrap();
        assert_eq!(props.get_str("metaServer.checkpointDir", ""), "/data/cp");
        assert_eq!(props.get_i32("metaServer.replicationCheckSecs", 0), 30);
    }

    #[test]
    fn test_load_file_missing_is_error() {
        let mut props = Properties::new();
        assert!(props.load_file("/nonexistent/meta.prp", '=', false).is_err());
    }

    #[test]
    fn test_merging_loads_accumulate() {
        let mut props = Properties::new();
        props.load_reader("a = 1\n".as_bytes(), '=', false).unwrap();
        props.load_reader("b = 2\na = 3\n".as_bytes(), '=', false).unwrap();
        assert_eq!(props.get_i32("a", 0), 3);
        assert_eq!(props.get_i32("b", 0), 2);
    }
}
