//! Parameter update strategies.

use serde::{Deserialize, Serialize};

use crate::error::{dims_mismatch, NnError, Result};
use crate::layers::ParameterSet;

pub const DEFAULT_LEARNING_RATE: f64 = 0.01;

/// Turns a layer's gradients into new parameter values.
pub trait Optimizer {
    /// Rewrites every entry of `params` using the gradient under the same key.
    fn update(&mut self, params: &mut ParameterSet, grads: &ParameterSet) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn to_record(&self) -> OptimizerRecord;
}

/// Portable description of an optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerRecord {
    pub kind: String,
    pub learning_rate: f64,
}

impl OptimizerRecord {
    pub fn into_optimizer(self) -> Result<Box<dyn Optimizer>> {
        match self.kind.as_str() {
            "sgd" => Ok(Box::new(
                SgdBuilder::new().learning_rate(self.learning_rate).finalize()?,
            )),
            _ => Err(NnError::UnknownLayerKind(self.kind)),
        }
    }
}

/// Plain stochastic gradient descent, `p -= lr * g`.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
}

impl Default for Sgd {
    fn default() -> Self {
        Sgd {
            lr: DEFAULT_LEARNING_RATE,
        }
    }
}

impl Sgd {
    pub fn new() -> Sgd {
        Sgd::default()
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, params: &mut ParameterSet, grads: &ParameterSet) -> Result<()> {
        for (key, grad) in params.keys().map(|k| (k, grads.get(k))) {
            let grad = grad.ok_or_else(|| NnError::MissingParameter(key.clone()))?;
            if grad.dim() != params[key].dim() {
                return Err(dims_mismatch("Sgd::update", params[key].dim(), grad.dim()));
            }
        }
        for (key, param) in params.iter_mut() {
            param.scaled_add(-self.lr, &grads[key]);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn to_record(&self) -> OptimizerRecord {
        OptimizerRecord {
            kind: "sgd".to_string(),
            learning_rate: self.lr,
        }
    }
}

pub struct SgdBuilder {
    lr: f64,
}

impl SgdBuilder {
    pub fn new() -> SgdBuilder {
        SgdBuilder {
            lr: DEFAULT_LEARNING_RATE,
        }
    }

    pub fn learning_rate(&mut self, lr: f64) -> &mut SgdBuilder {
        self.lr = lr;
        self
    }

    pub fn finalize(&mut self) -> Result<Sgd> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(NnError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        Ok(Sgd { lr: self.lr })
    }
}

impl Default for SgdBuilder {
    fn default() -> Self {
        SgdBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn single(key: &str, m: crate::matrix::Matrix) -> ParameterSet {
        let mut set = ParameterSet::new();
        set.insert(key.to_string(), m);
        set
    }

    #[test]
    fn default_learning_rate() {
        assert_eq!(Sgd::new().learning_rate(), 0.01);
        assert_eq!(SgdBuilder::new().finalize().unwrap().learning_rate(), 0.01);
    }

    #[test]
    fn update_steps_against_gradient() {
        let mut sgd = SgdBuilder::new().learning_rate(0.1).finalize().unwrap();
        let mut params = single("w", arr2(&[[1.0, 2.0, 3.0]]));
        let grads = single("w", arr2(&[[0.0, 0.5, 1.0]]));
        sgd.update(&mut params, &grads).unwrap();
        assert_abs_diff_eq!(params["w"], arr2(&[[1.0, 1.95, 2.9]]), epsilon = 1e-12);
    }

    #[test]
    fn update_touches_every_key() {
        let mut sgd = Sgd::new();
        let mut params = single("w", arr2(&[[1.0]]));
        params.insert("b".to_string(), arr2(&[[2.0]]));
        let mut grads = single("w", arr2(&[[100.0]]));
        grads.insert("b".to_string(), arr2(&[[-100.0]]));
        sgd.update(&mut params, &grads).unwrap();
        assert_abs_diff_eq!(params["w"][[0, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(params["b"][[0, 0]], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn update_is_all_or_nothing() {
        let mut sgd = Sgd::new();
        let mut params = single("a", arr2(&[[1.0]]));
        params.insert("b".to_string(), arr2(&[[1.0]]));
        let grads = single("a", arr2(&[[1.0]]));
        assert!(matches!(
            sgd.update(&mut params, &grads),
            Err(NnError::MissingParameter(_))
        ));
        assert_eq!(params["a"], arr2(&[[1.0]]));

        let grads = single("a", arr2(&[[1.0, 1.0]]));
        let mut params = single("a", arr2(&[[1.0]]));
        assert!(sgd.update(&mut params, &grads).is_err());
    }

    #[test]
    fn builder_rejects_non_positive_rate() {
        assert!(SgdBuilder::new().learning_rate(0.0).finalize().is_err());
        assert!(SgdBuilder::new().learning_rate(f64::NAN).finalize().is_err());
    }

    #[test]
    fn record_round_trip() {
        let sgd = SgdBuilder::new().learning_rate(0.05).finalize().unwrap();
        let rebuilt = sgd.to_record().into_optimizer().unwrap();
        assert_eq!(rebuilt.learning_rate(), 0.05);
        let unknown = OptimizerRecord {
            kind: "adam".to_string(),
            learning_rate: 0.1,
        };
        assert!(matches!(
            unknown.into_optimizer(),
            Err(NnError::UnknownLayerKind(_))
        ));
    }
}
