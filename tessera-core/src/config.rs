//! Repository configuration stored at `<store>/config.json`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::fsutil::atomic_write;

pub const CONFIG_FILE: &str = "config.json";

/// Per-repository settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// zstd level for loose objects (1-22)
    pub compression_level: i32,
    /// Decoded objects kept in the read cache
    pub cache_capacity: usize,
    /// Unchanged lines around each diff hunk
    pub diff_context: usize,
    /// Minimum confidence for automatic smart-merge resolution
    pub merge_threshold: f64,
    /// Run smart merge over conflicts
    pub smart_merge: bool,
    /// Worker threads for per-file merges; 0 uses available parallelism
    pub max_workers: usize,
    /// Line offset tolerated by lenient patch application
    pub fuzz_offset: usize,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    /// Branch created by `init`
    pub default_branch: String,
    /// Work-tree paths skipped when staging directories
    pub ignore: Vec<String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            compression_level: 3,
            cache_capacity: 1024,
            diff_context: 3,
            merge_threshold: 0.8,
            smart_merge: true,
            max_workers: 0,
            fuzz_offset: 3,
            user_name: None,
            user_email: None,
            default_branch: "main".to_string(),
            ignore: Vec::new(),
        }
    }
}

/// A single configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<String>),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Str(_) => "string",
            ConfigValue::Int(_) => "integer",
            ConfigValue::Float(_) => "number",
            ConfigValue::Bool(_) => "boolean",
            ConfigValue::List(_) => "list",
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Str(s) => write!(f, "{}", s),
            ConfigValue::Int(i) => write!(f, "{}", i),
            ConfigValue::Float(x) => write!(f, "{}", x),
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

/// Every settable key
pub const CONFIG_KEYS: &[&str] = &[
    "compression_level",
    "cache_capacity",
    "diff_context",
    "merge_threshold",
    "smart_merge",
    "max_workers",
    "fuzz_offset",
    "user_name",
    "user_email",
    "default_branch",
    "ignore",
];

fn unknown_key(key: &str) -> Error {
    Error::invalid(format!("unknown config key '{}'", key))
}

fn mismatch(key: &str, expected: &str, got: &ConfigValue) -> Error {
    Error::invalid(format!("'{}' expects a {}, got a {}", key, expected, got.type_name()))
}

fn non_negative(key: &str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::invalid(format!("'{}' must not be negative", key)))
}

impl RepoConfig {
    /// Load the configuration, or defaults if the file does not exist
    pub fn load(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, store_dir: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        atomic_write(&store_dir.join(CONFIG_FILE), data.as_bytes())
    }

    /// Author string for commits, if a user name is configured
    pub fn author(&self) -> Option<String> {
        let name = self.user_name.as_ref()?;
        Some(match &self.user_email {
            Some(email) => format!("{} <{}>", name, email),
            None => name.clone(),
        })
    }

    pub fn get(&self, key: &str) -> Result<ConfigValue> {
        let value = match key {
            "compression_level" => ConfigValue::Int(self.compression_level as i64),
            "cache_capacity" => ConfigValue::Int(self.cache_capacity as i64),
            "diff_context" => ConfigValue::Int(self.diff_context as i64),
            "merge_threshold" => ConfigValue::Float(self.merge_threshold),
            "smart_merge" => ConfigValue::Bool(self.smart_merge),
            "max_workers" => ConfigValue::Int(self.max_workers as i64),
            "fuzz_offset" => ConfigValue::Int(self.fuzz_offset as i64),
            "user_name" => ConfigValue::Str(self.user_name.clone().unwrap_or_default()),
            "user_email" => ConfigValue::Str(self.user_email.clone().unwrap_or_default()),
            "default_branch" => ConfigValue::Str(self.default_branch.clone()),
            "ignore" => ConfigValue::List(self.ignore.clone()),
            _ => return Err(unknown_key(key)),
        };
        Ok(value)
    }

    /// Set a key, checking the value's type and range
    pub fn set(&mut self, key: &str, value: ConfigValue) -> Result<()> {
        match (key, value) {
            ("compression_level", ConfigValue::Int(level)) => {
                if !(1..=22).contains(&level) {
                    return Err(Error::invalid("compression_level must be between 1 and 22"));
                }
                self.compression_level = level as i32;
            }
            ("cache_capacity", ConfigValue::Int(n)) => self.cache_capacity = non_negative(key, n)?,
            ("diff_context", ConfigValue::Int(n)) => self.diff_context = non_negative(key, n)?,
            ("max_workers", ConfigValue::Int(n)) => self.max_workers = non_negative(key, n)?,
            ("fuzz_offset", ConfigValue::Int(n)) => self.fuzz_offset = non_negative(key, n)?,
            ("merge_threshold", ConfigValue::Float(x)) => self.set_threshold(x)?,
            ("merge_threshold", ConfigValue::Int(n)) => self.set_threshold(n as f64)?,
            ("smart_merge", ConfigValue::Bool(b)) => self.smart_merge = b,
            ("user_name", ConfigValue::Str(s)) => self.user_name = Some(s).filter(|s| !s.is_empty()),
            ("user_email", ConfigValue::Str(s)) => self.user_email = Some(s).filter(|s| !s.is_empty()),
            ("default_branch", ConfigValue::Str(s)) => {
                crate::refs::validate_ref_name(&s)?;
                self.default_branch = s;
            }
            ("ignore", ConfigValue::List(items)) => self.ignore = items,
            (key, value) => {
                let expected = self.get(key)?;
                return Err(mismatch(key, expected.type_name(), &value));
            }
        }
        Ok(())
    }

    fn set_threshold(&mut self, x: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&x) {
            return Err(Error::invalid("merge_threshold must be within [0, 1]"));
        }
        self.merge_threshold = x;
        Ok(())
    }

    /// Parse a textual value into the type `key` holds
    pub fn parse_value(&self, key: &str, raw: &str) -> Result<ConfigValue> {
        let bad = |what: &str| Error::invalid(format!("'{}' expects {}, got '{}'", key, what, raw));
        Ok(match self.get(key)? {
            ConfigValue::Str(_) => ConfigValue::Str(raw.to_string()),
            ConfigValue::Int(_) => ConfigValue::Int(raw.trim().parse().map_err(|_| bad("an integer"))?),
            ConfigValue::Float(_) => ConfigValue::Float(raw.trim().parse().map_err(|_| bad("a number"))?),
            ConfigValue::Bool(_) => match raw.trim() {
                "true" | "yes" | "on" | "1" => ConfigValue::Bool(true),
                "false" | "no" | "off" | "0" => ConfigValue::Bool(false),
                _ => return Err(bad("a boolean")),
            },
            ConfigValue::List(_) => ConfigValue::List(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(config, RepoConfig::default());
        assert_eq!(config.merge_threshold, 0.8);
        assert_eq!(config.default_branch, "main");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RepoConfig::default();
        config.set("diff_context", ConfigValue::Int(5)).unwrap();
        config.set("ignore", ConfigValue::List(vec!["target".into()])).unwrap();
        config.save(dir.path()).unwrap();
        assert_eq!(RepoConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"diff_context": 7}"#).unwrap();
        let config = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(config.diff_context, 7);
        assert_eq!(config.cache_capacity, 1024);
    }

    #[test]
    fn test_type_checking() {
        let mut config = RepoConfig::default();
        assert!(matches!(
            config.set("diff_context", ConfigValue::Bool(true)),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(config.get("nope"), Err(Error::Invalid(_))));
        assert!(config.set("max_workers", ConfigValue::Int(-1)).is_err());
        assert!(config.set("merge_threshold", ConfigValue::Float(1.5)).is_err());
        assert!(config.set("compression_level", ConfigValue::Int(30)).is_err());
        assert!(config.set("default_branch", ConfigValue::Str(String::new())).is_err());
    }

    #[test]
    fn test_parse_value_by_key_type() {
        let config = RepoConfig::default();
        assert_eq!(config.parse_value("max_workers", "4").unwrap(), ConfigValue::Int(4));
        assert_eq!(config.parse_value("merge_threshold", "0.75").unwrap(), ConfigValue::Float(0.75));
        assert_eq!(config.parse_value("smart_merge", "off").unwrap(), ConfigValue::Bool(false));
        assert_eq!(
            config.parse_value("ignore", "target, build").unwrap(),
            ConfigValue::List(vec!["target".into(), "build".into()])
        );
        assert!(config.parse_value("diff_context", "many").is_err());
    }

    #[test]
    fn test_author_string() {
        let mut config = RepoConfig::default();
        assert_eq!(config.author(), None);
        config.set("user_name", ConfigValue::Str("Ada".into())).unwrap();
        config.set("user_email", ConfigValue::Str("ada@example.com".into())).unwrap();
        assert_eq!(config.author().as_deref(), Some("Ada <ada@example.com>"));
    }
}
