use crate::error::{NnError, Result};
use crate::layers::Layer;
use crate::matrix::{ensure_same_shape, Matrix};
use crate::record::LayerKind;

/// Logistic activation, `1 / (1 + e^-x)`.
#[derive(Debug, Default, Clone)]
pub struct Sigmoid {
    out: Option<Matrix>,
}

impl Sigmoid {
    pub fn new() -> Sigmoid {
        Sigmoid::default()
    }
}

impl Layer for Sigmoid {
    fn forward(&mut self, x: &Matrix) -> Result<Matrix> {
        let y = x.mapv(|v| 1.0 / (1.0 + (-v).exp()));
        self.out = Some(y.clone());
        Ok(y)
    }

    fn backward(&mut self, dout: &Matrix) -> Result<Matrix> {
        let y = cached(&self.out, "Sigmoid::backward called before forward")?;
        ensure_same_shape("Sigmoid::backward", dout, y)?;
        Ok(dout * &y.mapv(|s| s * (1.0 - s)))
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Sigmoid
    }

    fn clear_cache(&mut self) {
        self.out = None;
    }
}

#[derive(Debug, Default, Clone)]
pub struct Relu {
    out: Option<Matrix>,
}

impl Relu {
    pub fn new() -> Relu {
        Relu::default()
    }
}

impl Layer for Relu {
    fn forward(&mut self, x: &Matrix) -> Result<Matrix> {
        let y = x.mapv(|v| if v > 0.0 { v } else { 0.0 });
        self.out = Some(y.clone());
        Ok(y)
    }

    fn backward(&mut self, dout: &Matrix) -> Result<Matrix> {
        let y = cached(&self.out, "Relu::backward called before forward")?;
        ensure_same_shape("Relu::backward", dout, y)?;
        let mut dx = dout.clone();
        dx.zip_mut_with(y, |d, &v| {
            if v <= 0.0 {
                *d = 0.0;
            }
        });
        Ok(dx)
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Relu
    }

    fn clear_cache(&mut self) {
        self.out = None;
    }
}

#[derive(Debug, Default, Clone)]
pub struct Tanh {
    out: Option<Matrix>,
}

impl Tanh {
    pub fn new() -> Tanh {
        Tanh::default()
    }
}

impl Layer for Tanh {
    fn forward(&mut self, x: &Matrix) -> Result<Matrix> {
        let y = x.mapv(f64::tanh);
        self.out = Some(y.clone());
        Ok(y)
    }

    fn backward(&mut self, dout: &Matrix) -> Result<Matrix> {
        let y = cached(&self.out, "Tanh::backward called before forward")?;
        ensure_same_shape("Tanh::backward", dout, y)?;
        Ok(dout * &y.mapv(|t| 1.0 - t * t))
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Tanh
    }

    fn clear_cache(&mut self) {
        self.out = None;
    }
}

fn cached<'a>(out: &'a Option<Matrix>, what: &'static str) -> Result<&'a Matrix> {
    out.as_ref().ok_or(NnError::StateNotReady(what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn input() -> Matrix {
        arr2(&[[-2.0, -0.5, 0.0], [0.25, 1.0, 3.0]])
    }

    fn upstream() -> Matrix {
        arr2(&[[1.0, -2.0, 0.5], [3.0, 0.1, -1.0]])
    }

    #[test]
    fn sigmoid_matches_closed_form() {
        let mut layer = Sigmoid::new();
        let y = layer.forward(&input()).unwrap();
        let dx = layer.backward(&upstream()).unwrap();
        for ((x, g), (out, d)) in input()
            .iter()
            .zip(upstream().iter())
            .zip(y.iter().zip(dx.iter()))
        {
            let s = 1.0 / (1.0 + (-x).exp());
            assert_abs_diff_eq!(*out, s, epsilon = 1e-12);
            assert_abs_diff_eq!(*d, g * s * (1.0 - s), epsilon = 1e-12);
        }
    }

    #[test]
    fn relu_masks_non_positive_inputs() {
        let mut layer = Relu::new();
        let y = layer.forward(&input()).unwrap();
        assert_eq!(y, arr2(&[[0.0, 0.0, 0.0], [0.25, 1.0, 3.0]]));
        let dx = layer.backward(&upstream()).unwrap();
        assert_eq!(dx, arr2(&[[0.0, 0.0, 0.0], [3.0, 0.1, -1.0]]));
    }

    #[test]
    fn tanh_matches_closed_form() {
        let mut layer = Tanh::new();
        let y = layer.forward(&input()).unwrap();
        let dx = layer.backward(&upstream()).unwrap();
        for ((x, g), (out, d)) in input()
            .iter()
            .zip(upstream().iter())
            .zip(y.iter().zip(dx.iter()))
        {
            let t = x.tanh();
            assert_abs_diff_eq!(*out, t, epsilon = 1e-12);
            assert_abs_diff_eq!(*d, g * (1.0 - t * t), epsilon = 1e-12);
        }
    }

    #[test]
    fn tanh_backward_handles_non_square_batches() {
        let mut layer = Tanh::new();
        let x = Matrix::zeros((4, 2));
        layer.forward(&x).unwrap();
        let dx = layer.backward(&Matrix::ones((4, 2))).unwrap();
        assert_eq!(dx, Matrix::ones((4, 2)));
    }

    #[test]
    fn backward_before_forward_is_rejected() {
        assert!(matches!(
            Sigmoid::new().backward(&upstream()),
            Err(NnError::StateNotReady(_))
        ));
        assert!(matches!(
            Relu::new().backward(&upstream()),
            Err(NnError::StateNotReady(_))
        ));
        assert!(matches!(
            Tanh::new().backward(&upstream()),
            Err(NnError::StateNotReady(_))
        ));
    }

    #[test]
    fn backward_rejects_mismatched_gradient() {
        let mut layer = Sigmoid::new();
        layer.forward(&input()).unwrap();
        assert!(matches!(
            layer.backward(&Matrix::zeros((3, 2))),
            Err(NnError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn forward_is_repeatable() {
        let mut layer = Sigmoid::new();
        let a = layer.forward(&input()).unwrap();
        let b = layer.forward(&input()).unwrap();
        assert_eq!(a, b);
    }
}
