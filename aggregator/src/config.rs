//! Bucket configuration
//!
//! [`BucketConfig`] describes one bucket and is immutable once built.
//! [`Settings`] loads a set of bucket descriptors from a config file layered
//! with `TALLY__`-prefixed environment variables.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tally_shared::ValidationError;
use tracing::info;

pub const DEFAULT_CAPPED_SIZE: u64 = 5040;
pub const DEFAULT_UPLOAD_FORMAT: &str = "csv";
pub const FIRST_SHEET_FILTER: &str = "tally.upload.filters.first_sheet";

/// Cache lifetime, in seconds, of realtime bucket responses.
pub const REALTIME_MAX_AGE: u64 = 120;
/// Cache lifetime, in seconds, of all other bucket responses.
pub const STANDARD_MAX_AGE: u64 = 1800;

static VALID_BUCKET_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());

/// Values a [`BucketConfigBuilder`] starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketDefaults {
    pub queryable: bool,
    pub raw_queries_allowed: bool,
    pub realtime: bool,
    pub capped_size: u64,
    pub upload_format: String,
    pub upload_filters: Vec<String>,
}

impl Default for BucketDefaults {
    fn default() -> Self {
        Self {
            queryable: true,
            raw_queries_allowed: false,
            realtime: false,
            capped_size: DEFAULT_CAPPED_SIZE,
            upload_format: DEFAULT_UPLOAD_FORMAT.to_string(),
            upload_filters: vec![FIRST_SHEET_FILTER.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketConfig {
    name: String,
    data_group: String,
    data_type: String,
    bearer_token: Option<String>,
    queryable: bool,
    raw_queries_allowed: bool,
    realtime: bool,
    capped_size: u64,
    upload_format: String,
    upload_filters: Vec<String>,
    auto_ids: Option<Vec<String>>,
}

impl BucketConfig {
    /// Builder seeded with [`BucketDefaults::default`].
    pub fn builder(
        name: impl Into<String>,
        data_group: impl Into<String>,
        data_type: impl Into<String>,
    ) -> BucketConfigBuilder {
        Self::builder_with_defaults(name, data_group, data_type, &BucketDefaults::default())
    }

    pub fn builder_with_defaults(
        name: impl Into<String>,
        data_group: impl Into<String>,
        data_type: impl Into<String>,
        defaults: &BucketDefaults,
    ) -> BucketConfigBuilder {
        BucketConfigBuilder {
            config: BucketConfig {
                name: name.into(),
                data_group: data_group.into(),
                data_type: data_type.into(),
                bearer_token: None,
                queryable: defaults.queryable,
                raw_queries_allowed: defaults.raw_queries_allowed,
                realtime: defaults.realtime,
                capped_size: defaults.capped_size,
                upload_format: defaults.upload_format.clone(),
                upload_filters: defaults.upload_filters.clone(),
                auto_ids: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_group(&self) -> &str {
        &self.data_group
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    pub fn queryable(&self) -> bool {
        self.queryable
    }

    pub fn raw_queries_allowed(&self) -> bool {
        self.raw_queries_allowed
    }

    pub fn realtime(&self) -> bool {
        self.realtime
    }

    pub fn capped_size(&self) -> u64 {
        self.capped_size
    }

    pub fn upload_format(&self) -> &str {
        &self.upload_format
    }

    pub fn upload_filters(&self) -> &[String] {
        &self.upload_filters
    }

    pub fn auto_ids(&self) -> Option<&[String]> {
        self.auto_ids.as_deref()
    }

    /// Seconds a response for this bucket may be cached.
    pub fn max_age(&self) -> u64 {
        if self.realtime {
            REALTIME_MAX_AGE
        } else {
            STANDARD_MAX_AGE
        }
    }
}

pub struct BucketConfigBuilder {
    config: BucketConfig,
}

impl BucketConfigBuilder {
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.config.bearer_token = Some(token.into());
        self
    }

    pub fn queryable(mut self, queryable: bool) -> Self {
        self.config.queryable = queryable;
        self
    }

    pub fn raw_queries_allowed(mut self, allowed: bool) -> Self {
        self.config.raw_queries_allowed = allowed;
        self
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.config.realtime = realtime;
        self
    }

    pub fn capped_size(mut self, capped_size: u64) -> Self {
        self.config.capped_size = capped_size;
        self
    }

    pub fn upload_format(mut self, format: impl Into<String>) -> Self {
        self.config.upload_format = format.into();
        self
    }

    pub fn upload_filters(mut self, filters: Vec<String>) -> Self {
        self.config.upload_filters = filters;
        self
    }

    pub fn auto_ids(mut self, keys: Vec<String>) -> Self {
        self.config.auto_ids = Some(keys);
        self
    }

    pub fn build(self) -> Result<BucketConfig, ValidationError> {
        let config = self.config;
        if !VALID_BUCKET_NAME.is_match(&config.name) {
            return Err(ValidationError::new(
                "name",
                format!(
                    "'{}' must start with a lowercase letter and contain only a-z, 0-9 and _",
                    config.name
                ),
            ));
        }
        if config.data_group.is_empty() {
            return Err(ValidationError::new("data_group", "must not be empty"));
        }
        if config.data_type.is_empty() {
            return Err(ValidationError::new("data_type", "must not be empty"));
        }
        if config.auto_ids.as_ref().is_some_and(|keys| keys.is_empty()) {
            return Err(ValidationError::new("auto_ids", "must list at least one field"));
        }
        Ok(config)
    }
}

/// One `[[buckets]]` entry. Unset options fall back to `[defaults]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketSettings {
    pub name: String,
    pub data_group: String,
    pub data_type: String,
    pub bearer_token: Option<String>,
    pub queryable: Option<bool>,
    pub raw_queries_allowed: Option<bool>,
    pub realtime: Option<bool>,
    pub capped_size: Option<u64>,
    pub upload_format: Option<String>,
    pub upload_filters: Option<Vec<String>>,
    pub auto_ids: Option<Vec<String>>,
}

impl BucketSettings {
    pub fn to_config(&self, defaults: &BucketDefaults) -> Result<BucketConfig, ValidationError> {
        let mut builder = BucketConfig::builder_with_defaults(
            &self.name,
            &self.data_group,
            &self.data_type,
            defaults,
        );
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_token(token);
        }
        if let Some(queryable) = self.queryable {
            builder = builder.queryable(queryable);
        }
        if let Some(allowed) = self.raw_queries_allowed {
            builder = builder.raw_queries_allowed(allowed);
        }
        if let Some(realtime) = self.realtime {
            builder = builder.realtime(realtime);
        }
        if let Some(capped_size) = self.capped_size {
            builder = builder.capped_size(capped_size);
        }
        if let Some(format) = &self.upload_format {
            builder = builder.upload_format(format);
        }
        if let Some(filters) = &self.upload_filters {
            builder = builder.upload_filters(filters.clone());
        }
        if let Some(keys) = &self.auto_ids {
            builder = builder.auto_ids(keys.clone());
        }
        builder.build()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub defaults: BucketDefaults,
    pub buckets: Vec<BucketSettings>,
}

impl Settings {
    /// Load from `path` (format by extension), then apply `TALLY__*` overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("TALLY").separator("__"))
            .build()
            .with_context(|| format!("failed to read config {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("invalid config {}", path.display()))?;

        info!(path = %path.display(), buckets = settings.buckets.len(), "loaded settings");
        Ok(settings)
    }

    /// Validated configs for every bucket, in file order.
    pub fn bucket_configs(&self) -> Result<Vec<BucketConfig>, ValidationError> {
        let mut seen = HashSet::new();
        self.buckets
            .iter()
            .map(|bucket| {
                if !seen.insert(bucket.name.as_str()) {
                    return Err(ValidationError::new(
                        "name",
                        format!("bucket '{}' is configured more than once", bucket.name),
                    ));
                }
                bucket.to_config(&self.defaults)
            })
            .collect()
    }
}
