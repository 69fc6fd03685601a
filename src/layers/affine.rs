use rand::Rng;

use crate::error::{dims_mismatch, NnError, Result};
use crate::layers::{normal_matrix, take_param, Layer, ParamLayer, ParameterSet};
use crate::matrix::{
    add_vector_to_columns, dot, row_to_vector, sum_each_column, transpose, vector_to_row, Matrix,
    Vector,
};
use crate::record::LayerKind;

/// Dense layer, `y = x·w + b`.
///
/// `w` is `(input_size, output_size)` and `b` has `output_size` entries.
#[derive(Debug, Clone)]
pub struct Affine {
    w: Matrix,
    b: Vector,
    x: Option<Matrix>,
    dw: Option<Matrix>,
    db: Option<Vector>,
}

impl Affine {
    pub fn new<R: Rng + ?Sized>(input_size: usize, output_size: usize, rng: &mut R) -> Affine {
        let w = normal_matrix(input_size, output_size, rng);
        let b = normal_matrix(1, output_size, rng).row(0).to_owned();
        Affine {
            w,
            b,
            x: None,
            dw: None,
            db: None,
        }
    }

    pub fn with_params(w: Matrix, b: Vector) -> Result<Affine> {
        if b.len() != w.ncols() {
            return Err(dims_mismatch("Affine::with_params", w.dim(), (1, b.len())));
        }
        Ok(Affine {
            w,
            b,
            x: None,
            dw: None,
            db: None,
        })
    }

    pub fn input_size(&self) -> usize {
        self.w.nrows()
    }

    pub fn output_size(&self) -> usize {
        self.w.ncols()
    }

    pub fn weights(&self) -> &Matrix {
        &self.w
    }

    pub fn bias(&self) -> &Vector {
        &self.b
    }
}

impl Layer for Affine {
    fn forward(&mut self, x: &Matrix) -> Result<Matrix> {
        let y = add_vector_to_columns(&dot(x, &self.w)?, &self.b)?;
        self.x = Some(x.clone());
        Ok(y)
    }

    fn backward(&mut self, dout: &Matrix) -> Result<Matrix> {
        let x = self
            .x
            .as_ref()
            .ok_or(NnError::StateNotReady("Affine::backward called before forward"))?;
        if dout.dim() != (x.nrows(), self.w.ncols()) {
            return Err(dims_mismatch(
                "Affine::backward",
                dout.dim(),
                (x.nrows(), self.w.ncols()),
            ));
        }
        let dx = dot(dout, &transpose(&self.w))?;
        let dw = dot(&transpose(x), dout)?;
        self.dw = Some(dw);
        self.db = Some(sum_each_column(dout));
        Ok(dx)
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Affine
    }

    fn clear_cache(&mut self) {
        self.x = None;
        self.dw = None;
        self.db = None;
    }

    fn as_parametric(&self) -> Option<&dyn ParamLayer> {
        Some(self)
    }

    fn as_parametric_mut(&mut self) -> Option<&mut dyn ParamLayer> {
        Some(self)
    }
}

impl ParamLayer for Affine {
    fn params(&self) -> ParameterSet {
        let mut params = ParameterSet::new();
        params.insert("w".to_string(), self.w.clone());
        params.insert("b".to_string(), vector_to_row(&self.b));
        params
    }

    fn gradients(&self) -> Result<ParameterSet> {
        match (&self.dw, &self.db) {
            (Some(dw), Some(db)) => {
                let mut grads = ParameterSet::new();
                grads.insert("w".to_string(), dw.clone());
                grads.insert("b".to_string(), vector_to_row(db));
                Ok(grads)
            }
            _ => Err(NnError::StateNotReady("Affine has no gradients; run backward first")),
        }
    }

    fn update_params(&mut self, mut params: ParameterSet) -> Result<()> {
        let w = take_param(&mut params, "w")?;
        let b = row_to_vector(&take_param(&mut params, "b")?)?;
        if w.dim() != self.w.dim() {
            return Err(dims_mismatch("Affine::update_params", w.dim(), self.w.dim()));
        }
        if b.len() != self.b.len() {
            return Err(dims_mismatch(
                "Affine::update_params",
                (1, b.len()),
                (1, self.b.len()),
            ));
        }
        self.w = w;
        self.b = b;
        self.dw = None;
        self.db = None;
        Ok(())
    }
}
