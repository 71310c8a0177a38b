//! Data loader
//!
//! Batches are served from training shards on disk. Only one shard is held in memory at a
//! time: it is loaded when the first batch of that shard is requested, and its rows are
//! bootstrap-resampled on every load.

use std::path::{Path, PathBuf};

use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::shards::{
    DEFAULT_FEATURES_KEY, DEFAULT_LABEL_KEY, ShardContents, ShardError, read_shard,
};

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("A dataset needs at least one shard file")]
    NoFiles,
    #[error("Batch size must be positive")]
    ZeroBatchSize,
    #[error("Shard '{path}' has {rows} rows, fewer than the {required} required")]
    ShardTooSmall {
        path: String,
        rows: usize,
        required: usize,
    },
    #[error(
        "Shard '{path}' has input dimension {got}, but the first shard has {expected}"
    )]
    InputDimensionMismatch {
        path: String,
        expected: usize,
        got: usize,
    },
    #[error(
        "Shard '{path}' has label dimension {got}, but the first shard has {expected}"
    )]
    LabelDimensionMismatch {
        path: String,
        expected: usize,
        got: usize,
    },
    #[error("Batch index {index} out of range for {len} batches")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Cannot split {n_files} shard files into non-empty training and validation sets")]
    Split { n_files: usize },
    #[error(transparent)]
    Shard(#[from] ShardError),
}

/// A mini batch of features and labels, `batch_size` rows each
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<Vec<f32>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Options for [`ShardDataset`]
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub batch_size: usize,
    /// Labels below are raised to this value
    pub label_lower_bound: Option<f32>,
    /// Labels above are lowered to this value
    pub label_upper_bound: Option<f32>,
    pub features_key: String,
    pub label_key: String,
    pub seed: Option<u64>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            label_lower_bound: None,
            label_upper_bound: None,
            features_key: DEFAULT_FEATURES_KEY.to_string(),
            label_key: DEFAULT_LABEL_KEY.to_string(),
            seed: None,
        }
    }
}

/// Indexable collection of batches backed by a list of shard files
pub struct ShardDataset {
    file_ids: Vec<PathBuf>,
    /// Order in which files are visited, permuted by a shuffling [`DataLoader`]
    indexes: Vec<usize>,
    options: DatasetOptions,
    input_dim: usize,
    label_dim: usize,
    batches_per_file: usize,
    data_generator_config: Option<JsonValue>,
    tmp_data: Option<ShardContents>,
    rng: Pcg64Mcg,
}

impl ShardDataset {
    /// Creates a dataset, reading the first shard for its shape metadata
    pub fn new(file_ids: Vec<PathBuf>, options: DatasetOptions) -> Result<Self, DataLoaderError> {
        if file_ids.is_empty() {
            return Err(DataLoaderError::NoFiles);
        }
        if options.batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        let init_file = read_shard(&file_ids[0], &options.features_key, &options.label_key)?;
        let batches_per_file = init_file.n_rows() / options.batch_size;
        if batches_per_file == 0 {
            return Err(DataLoaderError::ShardTooSmall {
                path: file_ids[0].display().to_string(),
                rows: init_file.n_rows(),
                required: options.batch_size,
            });
        }
        let rng = match options.seed {
            Some(seed) => Pcg64Mcg::seed_from_u64(seed),
            None => Pcg64Mcg::from_rng(&mut rand::rng()),
        };
        log::debug!(
            "Dataset over {} files: input_dim {}, label_dim {}, {} batches per file",
            file_ids.len(),
            init_file.input_dim(),
            init_file.label_dim,
            batches_per_file
        );
        Ok(Self {
            indexes: (0..file_ids.len()).collect(),
            input_dim: init_file.input_dim(),
            label_dim: init_file.label_dim,
            batches_per_file,
            data_generator_config: init_file.generator_config,
            file_ids,
            options,
            tmp_data: None,
            rng,
        })
    }

    /// Number of batches per epoch, partial batches at the end of a shard are dropped
    pub fn len(&self) -> usize {
        self.file_ids.len() * self.batches_per_file
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn label_dim(&self) -> usize {
        self.label_dim
    }

    pub fn batch_size(&self) -> usize {
        self.options.batch_size
    }

    pub fn batches_per_file(&self) -> usize {
        self.batches_per_file
    }

    pub fn file_ids(&self) -> &[PathBuf] {
        &self.file_ids
    }

    /// Generator config found in the first shard, if any
    pub fn data_generator_config(&self) -> Option<&JsonValue> {
        self.data_generator_config.as_ref()
    }

    /// Returns batch `index`, loading the next shard when a new file starts
    pub fn get(&mut self, index: usize) -> Result<Batch, DataLoaderError> {
        if index >= self.len() {
            return Err(DataLoaderError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        let reload = index % self.batches_per_file == 0;
        let tmp_data = match self.tmp_data.take() {
            Some(data) if !reload => data,
            _ => self.load_file(self.indexes[index / self.batches_per_file])?,
        };

        let batch_size = self.options.batch_size;
        let start = (index % self.batches_per_file) * batch_size;
        let features = tmp_data.features[start..start + batch_size].to_vec();
        let labels = tmp_data.labels[start..start + batch_size]
            .iter()
            .map(|row| row.iter().map(|l| self.clip_label(*l)).collect())
            .collect();
        self.tmp_data = Some(tmp_data);
        Ok(Batch { features, labels })
    }

    fn clip_label(&self, label: f32) -> f32 {
        let mut label = label;
        if let Some(lower) = self.options.label_lower_bound {
            label = label.max(lower);
        }
        if let Some(upper) = self.options.label_upper_bound {
            label = label.min(upper);
        }
        label
    }

    fn load_file(&mut self, file_index: usize) -> Result<ShardContents, DataLoaderError> {
        let path = &self.file_ids[file_index];
        let mut contents =
            read_shard(path, &self.options.features_key, &self.options.label_key)?;
        let required = self.batches_per_file * self.options.batch_size;
        if contents.n_rows() < required {
            return Err(DataLoaderError::ShardTooSmall {
                path: path.display().to_string(),
                rows: contents.n_rows(),
                required,
            });
        }
        if contents.input_dim() != self.input_dim {
            return Err(DataLoaderError::InputDimensionMismatch {
                path: path.display().to_string(),
                expected: self.input_dim,
                got: contents.input_dim(),
            });
        }
        if contents.label_dim != self.label_dim {
            return Err(DataLoaderError::LabelDimensionMismatch {
                path: path.display().to_string(),
                expected: self.label_dim,
                got: contents.label_dim,
            });
        }

        // bootstrap resample, rows are drawn with replacement
        let n = contents.n_rows();
        let sample: Vec<usize> = (0..n).map(|_| self.rng.random_range(0..n)).collect();
        contents.features = sample.iter().map(|&i| contents.features[i].clone()).collect();
        contents.labels = sample.iter().map(|&i| contents.labels[i].clone()).collect();
        log::debug!("Loaded shard '{}'", path.display());
        Ok(contents)
    }

    fn shuffle_files(&mut self) {
        self.indexes.shuffle(&mut self.rng);
        // the next `get` must reload even if it is not at a file boundary
        self.tmp_data = None;
    }
}

/// Iterates over the batches of a [`ShardDataset`] once per epoch
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    dataset: ShardDataset,
    shuffle: bool,
}

impl DataLoader {
    /// With `shuffle`, the order of shard files is permuted at the start of every epoch.
    /// Batches within a shard keep their order so that every shard is loaded once per epoch.
    pub fn new(dataset: ShardDataset, shuffle: bool) -> Self {
        Self { dataset, shuffle }
    }

    pub fn dataset(&self) -> &ShardDataset {
        &self.dataset
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn iter(&mut self) -> DataLoaderIterator<'_> {
        if self.shuffle {
            self.dataset.shuffle_files();
        }
        DataLoaderIterator {
            dataset: &mut self.dataset,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches until the end of the dataset
pub struct DataLoaderIterator<'a> {
    dataset: &'a mut ShardDataset,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Result<Batch, DataLoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.dataset.len() {
            return None;
        }
        let batch = self.dataset.get(self.curr_iter);
        self.curr_iter += 1;
        Some(batch)
    }
}

/// Splits shard files into training and validation files, keeping at least one of each.
/// The validation files are taken from the end of the list.
pub fn split_train_valid(
    files: &[PathBuf],
    valid_fraction: f32,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>), DataLoaderError> {
    let n_files = files.len();
    if n_files < 2 {
        return Err(DataLoaderError::Split { n_files });
    }
    let n_valid = ((n_files as f32 * valid_fraction).round() as usize).clamp(1, n_files - 1);
    let (train, valid) = files.split_at(n_files - n_valid);
    Ok((train.to_vec(), valid.to_vec()))
}

/// Convenience for building a loader over files in one call
pub fn loader_for(
    files: &[impl AsRef<Path>],
    options: DatasetOptions,
    shuffle: bool,
) -> Result<DataLoader, DataLoaderError> {
    let files = files.iter().map(|f| f.as_ref().to_path_buf()).collect();
    Ok(DataLoader::new(ShardDataset::new(files, options)?, shuffle))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, fs};

    use super::*;
    use crate::shards::{TrainingShard, shard_file_name, tests::scratch_dir, write_shard};
    use proptest::prelude::*;
    use tempfile::TempDir;

    /// Writes `n_files` shards of `rows` rows. Row `i` of file `f` is `[f, i]` labeled `f * 100 + i`.
    /// The shards live as long as the returned guard.
    fn write_shards(name: &str, n_files: usize, rows: usize) -> (TempDir, Vec<PathBuf>) {
        let scratch = scratch_dir(name);
        let files = (0..n_files)
            .map(|f| {
                let shard = TrainingShard {
                    data: (0..rows).map(|i| vec![f as f32, i as f32]).collect(),
                    labels: (0..rows).map(|i| (f * 100 + i) as f32).collect(),
                    generator_config: None,
                };
                let path = scratch.path().join(shard_file_name("t", f));
                write_shard(&path, &shard).unwrap();
                path
            })
            .collect();
        (scratch, files)
    }

    fn options(batch_size: usize) -> DatasetOptions {
        DatasetOptions {
            batch_size,
            seed: Some(42),
            ..Default::default()
        }
    }

    #[test]
    fn test_dataset_shape() {
        let (_scratch, files) = write_shards("dataset_shape", 3, 10);
        let dataset = ShardDataset::new(files, options(4)).unwrap();
        // 10 rows per file make 2 full batches of 4
        assert_eq!(dataset.batches_per_file(), 2);
        assert_eq!(dataset.len(), 6);
        assert_eq!(dataset.input_dim(), 2);
        assert_eq!(dataset.label_dim(), 1);
        assert!(dataset.data_generator_config().is_none());
    }

    #[test]
    fn test_batches_stay_within_one_file() {
        let (_scratch, files) = write_shards("batches_one_file", 2, 8);
        let mut loader = loader_for(&files, options(4), false).unwrap();
        let batches: Vec<Batch> = loader.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 4);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.len(), 4);
            assert!(!batch.is_empty());
            let expected_file = (i / 2) as f32;
            for (row, label) in batch.features.iter().zip(batch.labels.iter()) {
                assert_eq!(row[0], expected_file);
                // labels travel with their rows through the resampling
                assert_eq!(label[0], row[0] * 100.0 + row[1]);
            }
        }
    }

    /// File of each batch of one epoch, in visiting order
    fn epoch_file_order(loader: &mut DataLoader) -> Vec<u32> {
        loader
            .iter()
            .map(|b| b.unwrap().features[0][0] as u32)
            .collect()
    }

    #[test]
    fn test_shuffle_visits_every_file() {
        let (_scratch, files) = write_shards("shuffle_files", 4, 4);
        let mut loader = loader_for(&files, options(4), true).unwrap();
        for _ in 0..3 {
            let seen: HashSet<u32> = epoch_file_order(&mut loader).into_iter().collect();
            assert_eq!(seen.len(), 4);
        }
    }

    #[test]
    fn test_shuffle_changes_file_order() {
        let (_scratch, files) = write_shards("shuffle_order", 6, 4);
        let mut shuffled = loader_for(&files, options(4), true).unwrap();
        let orders: HashSet<Vec<u32>> = (0..5).map(|_| epoch_file_order(&mut shuffled)).collect();
        // 720 possible orders, five identical draws from a seeded rng do not happen
        assert!(orders.len() > 1);

        let mut in_order = loader_for(&files, options(4), false).unwrap();
        for _ in 0..2 {
            assert_eq!(epoch_file_order(&mut in_order), vec![0, 1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn test_label_dimension_mismatch() {
        let scratch = scratch_dir("label_dim");
        let flat = scratch.path().join(shard_file_name("t", 0));
        let matrix = scratch.path().join(shard_file_name("t", 1));
        fs::write(&flat, r#"{"data": [[1.0], [2.0]], "labels": [0.5, 0.6]}"#).unwrap();
        fs::write(
            &matrix,
            r#"{"data": [[3.0], [4.0]], "labels": [[0.1, 0.2], [0.3, 0.4]]}"#,
        )
        .unwrap();

        let mut dataset = ShardDataset::new(vec![flat, matrix], options(2)).unwrap();
        assert_eq!(dataset.label_dim(), 1);
        assert!(dataset.get(0).is_ok());
        assert!(matches!(
            dataset.get(1),
            Err(DataLoaderError::LabelDimensionMismatch {
                expected: 1,
                got: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_label_bounds() {
        let (_scratch, files) = write_shards("label_bounds", 1, 20);
        let opts = DatasetOptions {
            label_lower_bound: Some(5.0),
            label_upper_bound: Some(10.0),
            ..options(20)
        };
        let mut dataset = ShardDataset::new(files, opts).unwrap();
        let batch = dataset.get(0).unwrap();
        assert!(batch.labels.iter().all(|l| (5.0..=10.0).contains(&l[0])));
    }

    #[test]
    fn test_dataset_errors() {
        assert!(matches!(
            ShardDataset::new(vec![], options(4)),
            Err(DataLoaderError::NoFiles)
        ));
        let (_scratch, files) = write_shards("dataset_errors", 1, 3);
        assert!(matches!(
            ShardDataset::new(files.clone(), options(0)),
            Err(DataLoaderError::ZeroBatchSize)
        ));
        assert!(matches!(
            ShardDataset::new(files.clone(), options(4)),
            Err(DataLoaderError::ShardTooSmall {
                rows: 3,
                required: 4,
                ..
            })
        ));
        let mut dataset = ShardDataset::new(files, options(3)).unwrap();
        assert!(matches!(
            dataset.get(1),
            Err(DataLoaderError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_split_train_valid() {
        let files: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("{i}"))).collect();
        let (train, valid) = split_train_valid(&files, 0.2).unwrap();
        assert_eq!(train.len(), 4);
        assert_eq!(valid, vec![PathBuf::from("4")]);
        // always keeps one training file
        let (train, valid) = split_train_valid(&files, 1.0).unwrap();
        assert_eq!((train.len(), valid.len()), (1, 4));
        assert!(matches!(
            split_train_valid(&files[..1], 0.5),
            Err(DataLoaderError::Split { n_files: 1 })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_every_batch_is_full(n_files in 1usize..4, rows in 1usize..30, batch_size in 1usize..8) {
            prop_assume!(rows >= batch_size);
            let (_scratch, files) = write_shards(
                &format!("prop_{n_files}_{rows}_{batch_size}"),
                n_files,
                rows,
            );
            let mut loader = loader_for(&files, options(batch_size), true).unwrap();
            prop_assert_eq!(loader.len(), n_files * (rows / batch_size));
            let mut count = 0;
            for batch in loader.iter() {
                let batch = batch.unwrap();
                prop_assert_eq!(batch.features.len(), batch_size);
                prop_assert_eq!(batch.labels.len(), batch_size);
                count += 1;
            }
            prop_assert_eq!(count, n_files * (rows / batch_size));
        }
    }
}
