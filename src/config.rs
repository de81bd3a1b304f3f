use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::filter::EmptyMatchPolicy;
use crate::data::loader::SUPPORTED_EXTENSIONS;
use crate::data::model::BundleOptions;
use crate::data::projector::{
    ProjectionLimits, DEFAULT_HEATMAP_LABEL_MULTIPLE, DEFAULT_MAX_FEATURES,
};
use crate::data::schema::{SchemaDeriver, DEFAULT_NUMERIC_STEP};
use crate::error::{ScopeError, ScopeResult};

pub const BASE_DIR_ENV: &str = "CELLSCOPE_BASE_DIR";
pub const MAX_FEATURES_ENV: &str = "CELLSCOPE_MAX_FEATURES";

const DEFAULT_SELECTION_CAPACITY: usize = 512;

/// Runtime settings for a [`Session`](crate::session::Session).
///
/// Every field has a default, so a config file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory that dataset paths are resolved against.
    pub base_dir: PathBuf,
    /// File extensions (without the dot) shown by the file listing.
    pub allowed_extensions: Vec<String>,
    pub max_features: usize,
    pub heatmap_label_multiple: usize,
    /// Bundles kept in memory at once.
    pub dataset_capacity: usize,
    /// `None` leaves the selection registry unbounded.
    pub selection_capacity: Option<usize>,
    pub numeric_step: i64,
    pub step_overrides: BTreeMap<String, i64>,
    pub empty_match: EmptyMatchPolicy,
    /// Build the boxplot and heatmap views at load time.
    pub precompute_views: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            base_dir: PathBuf::from("testdata"),
            allowed_extensions: SUPPORTED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            max_features: DEFAULT_MAX_FEATURES,
            heatmap_label_multiple: DEFAULT_HEATMAP_LABEL_MULTIPLE,
            dataset_capacity: 1,
            selection_capacity: Some(DEFAULT_SELECTION_CAPACITY),
            numeric_step: DEFAULT_NUMERIC_STEP,
            step_overrides: BTreeMap::new(),
            empty_match: EmptyMatchPolicy::default(),
            precompute_views: true,
        }
    }
}

impl Settings {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn resolve(path: Option<&Path>) -> ScopeResult<Settings> {
        let mut settings = match path {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        settings.apply_overrides(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> ScopeResult<Settings> {
        let content = fs::read_to_string(path)
            .map_err(|e| ScopeError::Config(format!("cannot read {}: {e}", path.display())))?;
        let settings: Settings = serde_json::from_str(&content)
            .map_err(|e| ScopeError::Config(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json(content: &str) -> ScopeResult<Settings> {
        let settings: Settings =
            serde_json::from_str(content).map_err(|e| ScopeError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `CELLSCOPE_*` overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> ScopeResult<()> {
        if let Some(dir) = var(BASE_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.base_dir = PathBuf::from(dir);
        }
        if let Some(raw) = var(MAX_FEATURES_ENV) {
            self.max_features = raw.trim().parse().map_err(|_| {
                ScopeError::Config(format!("{MAX_FEATURES_ENV} must be a positive integer, got '{raw}'"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ScopeResult<()> {
        if self.max_features == 0 {
            return Err(ScopeError::Config("max_features must be at least 1".into()));
        }
        if self.heatmap_label_multiple == 0 {
            return Err(ScopeError::Config("heatmap_label_multiple must be at least 1".into()));
        }
        if self.dataset_capacity == 0 {
            return Err(ScopeError::Config("dataset_capacity must be at least 1".into()));
        }
        if self.selection_capacity == Some(0) {
            return Err(ScopeError::Config(
                "selection_capacity must be at least 1 (use null for no limit)".into(),
            ));
        }
        if self.numeric_step <= 0 {
            return Err(ScopeError::Config("numeric_step must be positive".into()));
        }
        if let Some((name, _)) = self.step_overrides.iter().find(|(_, step)| **step <= 0) {
            return Err(ScopeError::Config(format!("step override for '{name}' must be positive")));
        }
        if self.allowed_extensions.is_empty() {
            return Err(ScopeError::Config("allowed_extensions must not be empty".into()));
        }
        Ok(())
    }

    /// Extensions normalised to lowercase with any leading dot removed.
    pub fn extensions(&self) -> Vec<String> {
        self.allowed_extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .collect()
    }

    pub fn projection_limits(&self) -> ProjectionLimits {
        ProjectionLimits {
            max_features: self.max_features,
            heatmap_label_multiple: self.heatmap_label_multiple,
        }
    }

    pub fn schema_deriver(&self) -> SchemaDeriver {
        SchemaDeriver::new(self.numeric_step, self.step_overrides.clone())
    }

    pub fn bundle_options(&self) -> BundleOptions {
        BundleOptions {
            boxplot_view: self.precompute_views,
            heatmap_view: self.precompute_views,
        }
    }

    pub fn dataset_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.dataset_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn selection_capacity(&self) -> Option<NonZeroUsize> {
        self.selection_capacity.and_then(NonZeroUsize::new)
    }
}
