//! Where training batches come from.

use std::{fs, path::Path};

use log::info;
use ndarray::{s, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::{DataConfig, SwarmConfig},
    error::{Result, SwarmError},
};

/// One step's worth of token sequences, `target` is `obs` shifted by one position.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub obs: Array2<u32>,
    pub target: Array2<u32>,
}

impl Batch {
    /// Splits `[batch, seq + 1]` windows into inputs and next-token targets.
    fn from_windows(windows: Array2<u32>) -> Self {
        let obs = windows.slice(s![.., ..-1]).to_owned();
        let target = windows.slice(s![.., 1..]).to_owned();
        Self { obs, target }
    }
}

/// An unbounded, lazily generated sequence of batches.
pub trait DataSource {
    fn get_samples(&mut self) -> Result<Batch>;
}

/// Byte-level language modelling over the contents of a file.
pub struct TextLoader {
    bytes: Vec<u8>,
    batch_size: usize,
    seq_len: usize,
    rng: StdRng,
}

impl TextLoader {
    /// Reads `path` whole and prepares random windows of `seq_len + 1` bytes.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `InvalidConfig` if it is shorter than one window.
    pub fn open<P: AsRef<Path>>(path: P, batch_size: usize, seq_len: usize, seed: u64) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;

        if bytes.len() <= seq_len {
            return Err(SwarmError::InvalidConfig(format!(
                "{} holds {} bytes, a sample needs {}",
                path.display(),
                bytes.len(),
                seq_len + 1
            )));
        }

        info!(path:% = path.display(), bytes = bytes.len(); "text corpus loaded");
        Ok(Self {
            bytes,
            batch_size,
            seq_len,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl DataSource for TextLoader {
    fn get_samples(&mut self) -> Result<Batch> {
        let window = self.seq_len + 1;
        let mut windows = Array2::zeros((self.batch_size, window));

        for mut row in windows.rows_mut() {
            let start = self.rng.random_range(0..=self.bytes.len() - window);
            let bytes = &self.bytes[start..start + window];
            row.iter_mut()
                .zip(bytes)
                .for_each(|(tok, &byte)| *tok = byte as u32);
        }

        Ok(Batch::from_windows(windows))
    }
}

/// Uniformly random token ids.
pub struct RandomTokens {
    vocab: u32,
    batch_size: usize,
    seq_len: usize,
    rng: StdRng,
}

impl RandomTokens {
    pub fn new(vocab: u32, batch_size: usize, seq_len: usize, seed: u64) -> Self {
        Self {
            vocab,
            batch_size,
            seq_len,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl DataSource for RandomTokens {
    fn get_samples(&mut self) -> Result<Batch> {
        let windows = Array2::from_shape_simple_fn((self.batch_size, self.seq_len + 1), || {
            self.rng.random_range(0..self.vocab)
        });

        Ok(Batch::from_windows(windows))
    }
}

/// Builds the data source a configuration asks for.
pub fn from_config(config: &SwarmConfig, seed: u64) -> Result<Box<dyn DataSource>> {
    let training = &config.training;

    Ok(match &config.data {
        DataConfig::Text { path } => Box::new(TextLoader::open(
            path,
            training.batch_size,
            training.seq_len,
            seed,
        )?),
        DataConfig::Random => Box::new(RandomTokens::new(
            config.model.vocab as u32,
            training.batch_size,
            training.seq_len,
            seed,
        )),
    })
}

impl<D: DataSource + ?Sized> DataSource for Box<D> {
    fn get_samples(&mut self) -> Result<Batch> {
        (**self).get_samples()
    }
}
