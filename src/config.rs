//! Training settings for the MNIST driver.
//!
//! Every field is optional in the JSON file; missing ones fall back to the
//! defaults below.
//!
//! ```json
//! {
//!   "batch_size": 100,
//!   "iterations": 1800,
//!   "learning_rate": 0.01,
//!   "hidden_sizes": [100],
//!   "model_out": "model.json"
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{NnError, Result};
use crate::optimizer::DEFAULT_LEARNING_RATE;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub iterations: usize,
    pub learning_rate: f64,
    pub seed: u64,
    /// Widths of the hidden Affine/Relu pairs.
    pub hidden_sizes: Vec<usize>,
    /// Report metrics every this many iterations.
    pub log_every: usize,
    pub train_size: usize,
    pub test_size: usize,
    /// Where to write the trained model as JSON.
    pub model_out: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            batch_size: 100,
            iterations: 1800,
            learning_rate: DEFAULT_LEARNING_RATE,
            seed: 42,
            hidden_sizes: vec![100],
            log_every: 100,
            train_size: 10000,
            test_size: 1000,
            model_out: None,
        }
    }
}

impl TrainingConfig {
    pub fn from_json(json: &str) -> Result<TrainingConfig> {
        let config: TrainingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(NnError::InvalidConfig("batch_size must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(NnError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.hidden_sizes.is_empty() || self.hidden_sizes.contains(&0) {
            return Err(NnError::InvalidConfig(
                "hidden_sizes must be a non-empty list of positive widths".into(),
            ));
        }
        if self.log_every == 0 {
            return Err(NnError::InvalidConfig("log_every must be positive".into()));
        }
        if self.batch_size > self.train_size {
            return Err(NnError::InvalidConfig(format!(
                "batch_size {} exceeds train_size {}",
                self.batch_size, self.train_size
            )));
        }
        Ok(())
    }
}

/// Reads and validates a configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    TrainingConfig::from_json(&contents)
}
