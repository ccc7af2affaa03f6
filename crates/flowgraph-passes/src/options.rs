//! By-name pass options and pipeline configuration.

use flowgraph_core::{Error, Result};
use std::collections::BTreeMap;

/// Option map handed to [`create_pass`](crate::create_pass).
///
/// Values are kept in textual form; list-valued options are comma separated.
///
/// # Example
///
/// ```ignore
/// let opts = PassOptions::new()
///     .with("feeds", "x,y:1")
///     .with("fetches", "out");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOptions {
    entries: BTreeMap<String, String>,
}

impl PassOptions {
    /// Create an empty option map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set an option.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Raw textual value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    /// Iterate over option names.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    /// Reject options the pass does not understand.
    pub fn expect_only(&self, pass: &str, known: &[&str]) -> Result<()> {
        for key in self.keys() {
            if !known.contains(&key) {
                return Err(invalid(key, format!("not an option of pass '{}'", pass)));
            }
        }
        Ok(())
    }

    /// Parse a boolean option (`true`/`false`/`1`/`0`).
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get(key)
            .map(|raw| match raw {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                other => Err(invalid(key, format!("expected a boolean, got '{}'", other))),
            })
            .transpose()
    }

    /// Parse an unsigned integer option.
    pub fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<usize>()
                    .map_err(|e| invalid(key, format!("'{}': {}", raw, e)))
            })
            .transpose()
    }

    /// Parse a `u32` option.
    pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<u32>()
                    .map_err(|e| invalid(key, format!("'{}': {}", raw, e)))
            })
            .transpose()
    }

    /// Parse a comma-separated list option (empty entries are dropped).
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn invalid(option: &str, message: String) -> Error {
    Error::InvalidOption {
        option: option.to_string(),
        message,
    }
}

/// Ordered list of passes to build, each with its options.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    entries: Vec<(String, PassOptions)>,
}

impl PipelineConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pass entry.
    pub fn pass(mut self, name: impl Into<String>, options: PassOptions) -> Self {
        self.entries.push((name.into(), options));
        self
    }

    /// Configured entries in order.
    pub fn entries(&self) -> &[(String, PassOptions)] {
        &self.entries
    }

    /// Build the configured pipeline.
    pub fn build(&self) -> Result<crate::PassPipeline> {
        let mut pipeline = crate::PassPipeline::new();
        for (name, options) in &self.entries {
            pipeline.add_boxed(crate::create_pass(name, options)?);
        }
        Ok(pipeline)
    }
}
