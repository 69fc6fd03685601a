//! Computation layers and the forward/backward contract they share.

use std::collections::BTreeMap;

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Result;
use crate::matrix::Matrix;
use crate::record::LayerKind;

pub mod activation;
pub mod affine;
pub mod convolution;
pub mod pooling;

pub use activation::{Relu, Sigmoid, Tanh};
pub use affine::Affine;
pub use convolution::{Convolution, FilterShape};
pub use pooling::MaxPooling;

/// Parameter or gradient matrices keyed by name (`"w"`, `"b"`).
///
/// Built fresh on every call; biases travel as `1 x N` rows.
pub type ParameterSet = BTreeMap<String, Matrix>;

/// Standard deviation of the zero-mean normal used for weight init.
pub const WEIGHT_INIT_STD: f64 = 0.01;

/// A unit of the network that can be run forward and differentiated.
///
/// `backward` uses whatever `forward` cached on the same instance, so the two
/// must be called in pairs on one batch.
pub trait Layer {
    fn forward(&mut self, x: &Matrix) -> Result<Matrix>;

    fn backward(&mut self, dout: &Matrix) -> Result<Matrix>;

    fn kind(&self) -> LayerKind;

    /// Drops everything cached by `forward` and `backward`.
    fn clear_cache(&mut self);

    /// Structural settings needed to rebuild the layer (strides, shapes).
    fn attributes(&self) -> BTreeMap<String, usize> {
        BTreeMap::new()
    }

    fn as_parametric(&self) -> Option<&dyn ParamLayer> {
        None
    }

    fn as_parametric_mut(&mut self) -> Option<&mut dyn ParamLayer> {
        None
    }
}

/// Layers that own trainable weights.
pub trait ParamLayer: Layer {
    fn params(&self) -> ParameterSet;

    /// Gradients from the last `backward`; `StateNotReady` if there are none.
    fn gradients(&self) -> Result<ParameterSet>;

    /// Adopts `params` and drops the cached gradients.
    fn update_params(&mut self, params: ParameterSet) -> Result<()>;
}

pub(crate) fn normal_matrix<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Matrix {
    Matrix::from_shape_simple_fn((rows, cols), || {
        let z: f64 = rng.sample(StandardNormal);
        z * WEIGHT_INIT_STD
    })
}

pub(crate) fn take_param(params: &mut ParameterSet, key: &str) -> Result<Matrix> {
    params
        .remove(key)
        .ok_or_else(|| crate::error::NnError::MissingParameter(key.to_string()))
}
