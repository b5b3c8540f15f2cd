//! Feed-forward network predicting the next motor state from a window of
//! past states and actions.

use burn::backend::{Autodiff, NdArray};
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::Backend;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::relu;
use burn::tensor::{Tensor, TensorData};
use eyre::{eyre, Result, WrapErr};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::recording::write_json;

pub type InferenceBackend = NdArray<f32>;
pub type TrainingBackend = Autodiff<InferenceBackend>;

pub const HIDDEN_UNITS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlpConfig {
    pub input_dimension: usize,
    pub output_dimension: usize,
    pub hidden: usize,
}

impl MlpConfig {
    pub fn new(input_dimension: usize, output_dimension: usize) -> Self {
        Self {
            input_dimension,
            output_dimension,
            hidden: HIDDEN_UNITS,
        }
    }
}

/// Input -> Linear -> ReLU -> Linear -> ReLU -> Linear -> Output
#[derive(Debug, Module)]
pub struct Mlp<B: Backend> {
    input: Linear<B>,
    hidden: Linear<B>,
    output: Linear<B>,
}

/// Checkpoint weights live in `<path>.bin`, the dimensions in `<path>.json`.
fn checkpoint_paths(path: &Path) -> (PathBuf, PathBuf) {
    (path.with_extension("bin"), path.with_extension("json"))
}

impl<B: Backend> Mlp<B> {
    pub fn new(config: MlpConfig, device: &B::Device) -> Self {
        Self {
            input: LinearConfig::new(config.input_dimension, config.hidden).init(device),
            hidden: LinearConfig::new(config.hidden, config.hidden).init(device),
            output: LinearConfig::new(config.hidden, config.output_dimension).init(device),
        }
    }

    pub fn config(&self) -> MlpConfig {
        let [input_dimension, hidden] = self.input.weight.dims();
        let [_, output_dimension] = self.output.weight.dims();
        MlpConfig {
            input_dimension,
            output_dimension,
            hidden,
        }
    }

    /// `[batch, input_dimension]` -> `[batch, output_dimension]`
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = relu(self.input.forward(input));
        let x = relu(self.hidden.forward(x));
        self.output.forward(x)
    }

    /// Prediction for a single input row.
    pub fn predict(&self, input: &[f32], device: &B::Device) -> Result<Vec<f32>> {
        let tensor = Tensor::<B, 2>::from_data(TensorData::new(input.to_vec(), [1, input.len()]), device);
        self.forward(tensor)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| eyre!("Reading prediction: {:?}", e))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let (weights, config) = checkpoint_paths(path);
        write_json(&config, &self.config())?;
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(weights.clone(), &recorder)
            .map_err(|e| eyre!("Saving {}: {}", weights.display(), e))
    }

    pub fn load(path: &Path, device: &B::Device) -> Result<Self> {
        let (weights, config_path) = checkpoint_paths(path);
        let file = File::open(&config_path)
            .wrap_err_with(|| format!("opening {}", config_path.display()))?;
        let config: MlpConfig = serde_json::from_reader(BufReader::new(file))
            .wrap_err_with(|| format!("parsing {}", config_path.display()))?;

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        Self::new(config, device)
            .load_file(weights.clone(), &recorder, device)
            .map_err(|e| eyre!("Loading {}: {}", weights.display(), e))
    }
}

pub fn to_tensor<B: Backend>(array: &Array2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = array.dim();
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_data(TensorData::new(data, [rows, cols]), device)
}
