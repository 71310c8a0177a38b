//! Folder generation and config persistence helpers

use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;

use crate::config::{NetworkConfig, TrainConfig};

#[derive(Debug, Error)]
pub enum UtilError {
    #[error("Could not create folder '{path}': {source}")]
    CreateFolder {
        path: String,
        source: std::io::Error,
    },
    #[error("Could not write '{path}': {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("Could not serialize '{path}': {source}")]
    Serialize {
        path: String,
        source: serde_json::Error,
    },
}

/// Creates `folder` and every missing parent, one path component at a time.
///
/// Absolute paths are only created when `allow_abs_path_folder_generation` is set, otherwise a
/// warning is logged and nothing is created. Returns whether the folder exists afterwards.
pub fn try_gen_folder(
    folder: impl AsRef<Path>,
    allow_abs_path_folder_generation: bool,
) -> Result<bool, UtilError> {
    let folder = folder.as_ref();
    if folder.is_absolute() && !allow_abs_path_folder_generation {
        log::warn!(
            "Absolute folder path '{}' provided, but allow_abs_path_folder_generation is off. No folders will be generated.",
            folder.display()
        );
        return Ok(folder.is_dir());
    }

    let mut current = PathBuf::new();
    for component in folder.components() {
        current.push(component);
        if matches!(component, Component::RootDir | Component::Prefix(_)) {
            continue;
        }
        if current.is_dir() {
            log::debug!("Found folder '{}'", current.display());
            continue;
        }
        log::info!("Did not find folder '{}', creating it", current.display());
        fs::create_dir(&current).map_err(|source| UtilError::CreateFolder {
            path: current.display().to_string(),
            source,
        })?;
    }
    Ok(true)
}

/// Pretty-prints `value` as JSON into `path`
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), UtilError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| UtilError::Serialize {
        path: path.display().to_string(),
        source,
    })?;
    fs::write(path, json).map_err(|source| UtilError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Saves the network and training configs of a model as
/// `{model_id}_network_config.json` and `{model_id}_train_config.json`
pub fn save_configs(
    model_id: &str,
    save_folder: impl AsRef<Path>,
    network_config: &NetworkConfig,
    train_config: &TrainConfig,
    allow_abs_path_folder_generation: bool,
) -> Result<(PathBuf, PathBuf), UtilError> {
    let save_folder = save_folder.as_ref();
    try_gen_folder(save_folder, allow_abs_path_folder_generation)?;

    let network_path = save_folder.join(format!("{model_id}_network_config.json"));
    write_json(&network_path, network_config)?;
    log::info!("Saved network config to '{}'", network_path.display());

    let train_path = save_folder.join(format!("{model_id}_train_config.json"));
    write_json(&train_path, train_config)?;
    log::info!("Saved train config to '{}'", train_path.display());

    Ok((network_path, train_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::load_json, shards::tests::scratch_dir};

    #[test]
    fn test_try_gen_folder_nested() {
        let scratch = scratch_dir("gen_folder");
        let dir = scratch.path();
        let nested = dir.join("a").join("b").join("c");
        assert!(try_gen_folder(&nested, true).unwrap());
        assert!(nested.is_dir());
        // existing folders are fine
        assert!(try_gen_folder(&nested, true).unwrap());
    }

    #[test]
    fn test_try_gen_folder_refuses_absolute() {
        let scratch = scratch_dir("gen_folder_abs");
        let dir = scratch.path();
        let nested = dir.join("x");
        assert!(nested.is_absolute());
        assert!(!try_gen_folder(&nested, false).unwrap());
        assert!(!nested.exists());
    }

    #[test]
    fn test_save_configs_round_trip() {
        let scratch = scratch_dir("save_configs");
        let dir = scratch.path();
        let network = NetworkConfig::default();
        let train = TrainConfig {
            n_epochs: 7,
            ..Default::default()
        };
        let (network_path, train_path) =
            save_configs("ddm", dir, &network, &train, true).unwrap();
        assert!(network_path.ends_with("ddm_network_config.json"));
        assert_eq!(load_json::<NetworkConfig>(&network_path).unwrap(), network);
        assert_eq!(load_json::<TrainConfig>(&train_path).unwrap(), train);
    }
}
