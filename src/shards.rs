//! On-disk training shards
//!
//! A shard is a JSON object holding a feature matrix, one label per row and the generator
//! config which produced it. Shards of one generation run share the file name prefix
//! `training_data_{run_id}_`, which is how they are discovered again.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::config::DataGeneratorConfig;

pub const DEFAULT_FEATURES_KEY: &str = "data";
pub const DEFAULT_LABEL_KEY: &str = "labels";

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Malformed shard '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("Shard '{path}' has no key `{key}`")]
    MissingKey { path: String, key: String },
    #[error("Shard '{path}' has {rows} feature rows but {labels} labels")]
    RowMismatch {
        path: String,
        rows: usize,
        labels: usize,
    },
    #[error("Shard '{path}' has ragged rows")]
    Ragged { path: String },
    #[error("No shards for run `{run_id}` in '{folder}'")]
    NoShards { folder: String, run_id: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ShardError + '_ {
    move |source| ShardError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn parse_error(path: &Path) -> impl FnOnce(serde_json::Error) -> ShardError + '_ {
    move |source| ShardError::Parse {
        path: path.display().to_string(),
        source,
    }
}

/// A shard as written by the data generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingShard {
    pub data: Vec<Vec<f32>>,
    pub labels: Vec<f32>,
    pub generator_config: Option<DataGeneratorConfig>,
}

/// Labels are stored either as a flat vector or as a matrix with one row per example
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StoredLabels {
    Flat(Vec<f32>),
    Matrix(Vec<Vec<f32>>),
}

/// Columns read from a shard with configurable keys
#[derive(Debug, Clone, PartialEq)]
pub struct ShardContents {
    pub features: Vec<Vec<f32>>,
    /// One row per example, `label_dim` columns
    pub labels: Vec<Vec<f32>>,
    pub label_dim: usize,
    /// Kept opaque so that shards from any generator can be loaded
    pub generator_config: Option<JsonValue>,
}

impl ShardContents {
    pub fn n_rows(&self) -> usize {
        self.features.len()
    }

    pub fn input_dim(&self) -> usize {
        self.features.first().map_or(0, Vec::len)
    }
}

/// File name of shard `index` of a generation run
pub fn shard_file_name(run_id: &str, index: usize) -> String {
    format!("training_data_{run_id}_{index:04}.json")
}

pub fn write_shard(path: &Path, shard: &TrainingShard) -> Result<(), ShardError> {
    let json = serde_json::to_string(shard).map_err(parse_error(path))?;
    fs::write(path, json).map_err(io_error(path))?;
    log::debug!("Wrote {} rows to '{}'", shard.data.len(), path.display());
    Ok(())
}

/// Reads a shard, looking up features and labels under the given keys
pub fn read_shard(
    path: &Path,
    features_key: &str,
    label_key: &str,
) -> Result<ShardContents, ShardError> {
    let json = fs::read_to_string(path).map_err(io_error(path))?;
    let mut object: serde_json::Map<String, JsonValue> =
        serde_json::from_str(&json).map_err(parse_error(path))?;

    let missing = |key: &str| ShardError::MissingKey {
        path: path.display().to_string(),
        key: key.to_string(),
    };
    let features: Vec<Vec<f32>> = serde_json::from_value(
        object
            .remove(features_key)
            .ok_or_else(|| missing(features_key))?,
    )
    .map_err(parse_error(path))?;
    let stored: StoredLabels =
        serde_json::from_value(object.remove(label_key).ok_or_else(|| missing(label_key))?)
            .map_err(parse_error(path))?;
    let generator_config = object
        .remove("generator_config")
        .filter(|config| !config.is_null());

    let (labels, label_dim) = match stored {
        StoredLabels::Flat(labels) => (labels.into_iter().map(|l| vec![l]).collect(), 1),
        StoredLabels::Matrix(labels) => {
            let dim = labels.first().map_or(1, Vec::len);
            (labels, dim)
        }
    };

    if features.len() != labels.len() {
        return Err(ShardError::RowMismatch {
            path: path.display().to_string(),
            rows: features.len(),
            labels: labels.len(),
        });
    }
    let width = features.first().map_or(0, Vec::len);
    if features.iter().any(|row| row.len() != width)
        || labels.iter().any(|row| row.len() != label_dim)
    {
        return Err(ShardError::Ragged {
            path: path.display().to_string(),
        });
    }

    Ok(ShardContents {
        features,
        labels,
        label_dim,
        generator_config,
    })
}

/// Lists all shards of a generation run in `folder`, sorted by file name
pub fn discover_shards(folder: &Path, run_id: &str) -> Result<Vec<PathBuf>, ShardError> {
    let prefix = format!("training_data_{run_id}_");
    let mut paths = Vec::new();
    for entry in fs::read_dir(folder).map_err(io_error(folder))? {
        let entry = entry.map_err(io_error(folder))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        // the suffix after the prefix must be the numeric index, so that run `a` does not
        // pick up the shards of run `a_b`
        let is_shard = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".json"))
            .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()));
        if is_shard {
            paths.push(entry.path());
        }
    }
    if paths.is_empty() {
        return Err(ShardError::NoShards {
            folder: folder.display().to_string(),
            run_id: run_id.to_string(),
        });
    }
    paths.sort();
    Ok(paths)
}
