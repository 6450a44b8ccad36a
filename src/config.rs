//! Labeler configuration.
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! an optional JSON file, and command-line flags or their environment
//! variables. A JSON file looks like:
//! ```json
//! {
//!   "data_directory": "data/boston_split/graph_dataset",
//!   "output_path": "labels_density_3class.csv",
//!   "class_count": 3
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::analyzers::types::DensityClasses;
use crate::error::{LabelError, Result};

pub const DEFAULT_DATA_DIRECTORY: &str = "data/boston_split/graph_dataset";
pub const DEFAULT_OUTPUT_PATH: &str = "labels_density_3class.csv";
pub const DEFAULT_CLASS_COUNT: DensityClasses = DensityClasses::Three;

/// Resolved settings for one labeling run.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelerConfig {
    /// Directory scanned (non-recursively) for `.pt` files.
    pub data_directory: PathBuf,
    /// CSV destination, overwritten on every run.
    pub output_path: PathBuf,
    pub class_count: DensityClasses,
}

impl Default for LabelerConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from(DEFAULT_DATA_DIRECTORY),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            class_count: DEFAULT_CLASS_COUNT,
        }
    }
}

impl LabelerConfig {
    /// Builds a config, rejecting unsupported class counts.
    pub fn new(
        data_directory: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        class_count: u8,
    ) -> Result<Self> {
        Ok(Self {
            data_directory: data_directory.into(),
            output_path: output_path.into(),
            class_count: DensityClasses::try_from(class_count)?,
        })
    }

    /// Resolves all layers: defaults, the optional JSON file at
    /// `config_file`, then `cli`.
    ///
    /// An unsupported class count given on the command line is rejected
    /// before the config file is read.
    pub fn from_layers(config_file: Option<&Path>, cli: ConfigOverrides) -> Result<Self> {
        if let Some(n) = cli.class_count {
            DensityClasses::try_from(n)?;
        }

        let overrides = match config_file {
            Some(path) => ConfigOverrides::load(path)?.merge(cli),
            None => cli,
        };
        Self::resolve(overrides)
    }

    /// Applies overrides on top of the defaults.
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self> {
        let defaults = Self::default();
        let class_count = match overrides.class_count {
            Some(n) => DensityClasses::try_from(n)?,
            None => defaults.class_count,
        };

        Ok(Self {
            data_directory: overrides
                .data_directory
                .unwrap_or(defaults.data_directory),
            output_path: overrides.output_path.unwrap_or(defaults.output_path),
            class_count,
        })
    }
}

/// A partial configuration, as read from a file or the command line.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub data_directory: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub class_count: Option<u8>,
}

impl ConfigOverrides {
    /// Loads overrides from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| LabelError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fields set in `other` replace those in `self`.
    pub fn merge(self, other: ConfigOverrides) -> Self {
        Self {
            data_directory: other.data_directory.or(self.data_directory),
            output_path: other.output_path.or(self.output_path),
            class_count: other.class_count.or(self.class_count),
        }
    }
}
