use std::collections::BTreeMap;

use rand::Rng;

use crate::error::{dims_mismatch, NnError, Result};
use crate::image::{col2im, get_out_size, im2col, ImageBatch, ImageShape};
use crate::layers::{normal_matrix, take_param, Layer, ParamLayer, ParameterSet};
use crate::matrix::{
    add_vector_to_columns, dot, row_to_vector, sum_each_column, transpose, vector_to_row, Matrix,
    Vector,
};
use crate::record::LayerKind;

/// Spatial size of a filter bank and how many filters it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterShape {
    pub width: usize,
    pub height: usize,
    pub count: usize,
}

impl FilterShape {
    pub fn new(width: usize, height: usize, count: usize) -> Self {
        FilterShape {
            width,
            height,
            count,
        }
    }
}

/// 2D convolution computed as `im2col(x)·w + b`.
///
/// `w` has one row per `(input channel, filter row, filter column)` and one
/// column per filter. Each output row holds `filter.count` stacked
/// `out_h x out_w` planes, the same layout the layer expects for its input.
#[derive(Debug, Clone)]
pub struct Convolution {
    stride: usize,
    padding: usize,
    input: ImageShape,
    filter: FilterShape,
    out_h: usize,
    out_w: usize,
    w: Matrix,
    b: Vector,
    patches: Option<Matrix>,
    dw: Option<Matrix>,
    db: Option<Vector>,
}

impl Convolution {
    pub fn new<R: Rng + ?Sized>(
        stride: usize,
        padding: usize,
        input: ImageShape,
        filter: FilterShape,
        rng: &mut R,
    ) -> Result<Convolution> {
        let w = normal_matrix(filter.width * filter.height * input.channel, filter.count, rng);
        let b = normal_matrix(1, filter.count, rng).row(0).to_owned();
        Convolution::with_params(stride, padding, input, filter, w, b)
    }

    pub fn with_params(
        stride: usize,
        padding: usize,
        input: ImageShape,
        filter: FilterShape,
        w: Matrix,
        b: Vector,
    ) -> Result<Convolution> {
        let out_h = get_out_size(input.height, filter.height, stride, padding)?;
        let out_w = get_out_size(input.width, filter.width, stride, padding)?;
        let w_dim = (filter.width * filter.height * input.channel, filter.count);
        if w.dim() != w_dim {
            return Err(dims_mismatch("Convolution::with_params", w.dim(), w_dim));
        }
        if b.len() != filter.count {
            return Err(dims_mismatch(
                "Convolution::with_params",
                (1, b.len()),
                (1, filter.count),
            ));
        }
        Ok(Convolution {
            stride,
            padding,
            input,
            filter,
            out_h,
            out_w,
            w,
            b,
            patches: None,
            dw: None,
            db: None,
        })
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn input_shape(&self) -> ImageShape {
        self.input
    }

    pub fn filter_shape(&self) -> FilterShape {
        self.filter
    }

    /// `(out_h, out_w)` of each output plane.
    pub fn out_size(&self) -> (usize, usize) {
        (self.out_h, self.out_w)
    }

    pub fn weights(&self) -> &Matrix {
        &self.w
    }

    pub fn bias(&self) -> &Vector {
        &self.b
    }
}

impl Layer for Convolution {
    fn forward(&mut self, x: &Matrix) -> Result<Matrix> {
        let batch = ImageBatch::from_matrix(
            x,
            self.input.width,
            self.input.height,
            self.input.channel,
            self.padding,
        )?;
        let patches = im2col(&batch, self.filter.height, self.filter.width, self.stride)?;
        let y = add_vector_to_columns(&dot(&patches, &self.w)?, &self.b)?;
        let out = rows_to_planes(&y, x.nrows(), self.out_h * self.out_w);
        self.patches = Some(patches);
        Ok(out)
    }

    fn backward(&mut self, dout: &Matrix) -> Result<Matrix> {
        let patches = self
            .patches
            .as_ref()
            .ok_or(NnError::StateNotReady("Convolution::backward called before forward"))?;
        let positions = self.out_h * self.out_w;
        let batch = patches.nrows() / positions;
        let expected = (batch, positions * self.filter.count);
        if dout.dim() != expected {
            return Err(dims_mismatch("Convolution::backward", dout.dim(), expected));
        }

        let dy = planes_to_rows(dout, positions, self.filter.count);
        let dw = dot(&transpose(patches), &dy)?;
        let db = sum_each_column(&dy);
        let dpatches = dot(&dy, &transpose(&self.w))?;
        let shape = ImageShape::new(
            self.input.width,
            self.input.height,
            self.input.channel,
            batch,
        );
        let dx = col2im(
            &dpatches,
            &shape,
            self.filter.height,
            self.filter.width,
            self.stride,
            self.padding,
        )?;
        self.dw = Some(dw);
        self.db = Some(db);
        Ok(dx)
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Convolution
    }

    fn clear_cache(&mut self) {
        self.patches = None;
        self.dw = None;
        self.db = None;
    }

    fn attributes(&self) -> BTreeMap<String, usize> {
        let mut attrs = BTreeMap::new();
        attrs.insert("stride".to_string(), self.stride);
        attrs.insert("padding".to_string(), self.padding);
        attrs.insert("input_width".to_string(), self.input.width);
        attrs.insert("input_height".to_string(), self.input.height);
        attrs.insert("input_channel".to_string(), self.input.channel);
        attrs.insert("input_batch".to_string(), self.input.batch);
        attrs.insert("filter_width".to_string(), self.filter.width);
        attrs.insert("filter_height".to_string(), self.filter.height);
        attrs.insert("filter_count".to_string(), self.filter.count);
        attrs
    }

    fn as_parametric(&self) -> Option<&dyn ParamLayer> {
        Some(self)
    }

    fn as_parametric_mut(&mut self) -> Option<&mut dyn ParamLayer> {
        Some(self)
    }
}

impl ParamLayer for Convolution {
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
            _ => Err(NnError::StateNotReady(
                "Convolution has no gradients; run backward first",
            )),
        }
    }

    fn update_params(&mut self, mut params: ParameterSet) -> Result<()> {
        let w = take_param(&mut params, "w")?;
        let b = row_to_vector(&take_param(&mut params, "b")?)?;
        if w.dim() != self.w.dim() {
            return Err(dims_mismatch("Convolution::update_params", w.dim(), self.w.dim()));
        }
        if b.len() != self.b.len() {
            return Err(dims_mismatch(
                "Convolution::update_params",
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

/// `(batch * positions, channels)` patch-major rows into `(batch, channels * positions)`
/// channel-major planes.
pub(crate) fn rows_to_planes(y: &Matrix, batch: usize, positions: usize) -> Matrix {
    let channels = y.ncols();
    let mut out = Matrix::zeros((batch, channels * positions));
    for n in 0..batch {
        for p in 0..positions {
            for c in 0..channels {
                out[[n, c * positions + p]] = y[[n * positions + p, c]];
            }
        }
    }
    out
}

/// Inverse of [`rows_to_planes`].
pub(crate) fn planes_to_rows(planes: &Matrix, positions: usize, channels: usize) -> Matrix {
    let batch = planes.nrows();
    let mut out = Matrix::zeros((batch * positions, channels));
    for n in 0..batch {
        for p in 0..positions {
            for c in 0..channels {
                out[[n * positions + p, c]] = planes[[n, c * positions + p]];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn stepped(rows: usize, cols: usize, first: f64, step: f64) -> Matrix {
        Array2::from_shape_fn((rows, cols), |(i, j)| first + step * (i * cols + j) as f64)
    }

    fn fixture() -> Convolution {
        let mut w = Matrix::zeros((8, 3));
        for r in 0..8 {
            let row = if r < 4 { [1.0, 2.0, -1.0] } else { [-1.0, 1.0, 2.0] };
            for (c, v) in row.iter().enumerate() {
                w[[r, c]] = *v;
            }
        }
        Convolution::with_params(
            1,
            0,
            ImageShape::new(3, 3, 2, 2),
            FilterShape::new(2, 2, 3),
            w,
            Vector::zeros(3),
        )
        .unwrap()
    }

    #[test]
    fn forward_produces_channel_major_planes() {
        let mut con = fixture();
        let out = con.forward(&stepped(2, 18, 1.0, 1.0)).unwrap();
        assert_eq!(out.dim(), (2, 12));

        let planes = |c1: [f64; 4], c2: [f64; 4]| -> Vec<f64> {
            let mut v = Vec::new();
            for (a, b) in [(1.0, -1.0), (2.0, 1.0), (-1.0, 2.0)] {
                v.extend((0..4).map(|i| a * c1[i] + b * c2[i]));
            }
            v
        };
        assert_eq!(
            out.row(0).to_vec(),
            planes([12.0, 16.0, 24.0, 28.0], [48.0, 52.0, 60.0, 64.0])
        );
        assert_eq!(
            out.row(1).to_vec(),
            planes([84.0, 88.0, 96.0, 100.0], [120.0, 124.0, 132.0, 136.0])
        );
    }

    #[test]
    fn forward_adds_bias_per_filter() {
        let mut con = fixture();
        let params = {
            let mut p = con.params();
            p.insert("b".to_string(), Matrix::from_elem((1, 3), 0.5));
            p
        };
        con.update_params(params).unwrap();
        let with_bias = con.forward(&stepped(2, 18, 1.0, 1.0)).unwrap();
        let without = fixture().forward(&stepped(2, 18, 1.0, 1.0)).unwrap();
        assert_eq!(with_bias, without + 0.5);
    }

    #[test]
    fn backward_computes_patch_gradients() {
        let mut con = fixture();
        con.forward(&stepped(1, 18, 1.0, 1.0)).unwrap();
        let dx = con.backward(&Matrix::ones((1, 12))).unwrap();
        let grads = con.gradients().unwrap();

        // every filter sees each of the four positions once
        assert_eq!(grads["b"], Matrix::from_elem((1, 3), 4.0));
        // dw[0][f] sums x[0..2, 0..2] of channel 0 over positions: 1 + 2 + 4 + 5
        assert_eq!(grads["w"][[0, 0]], 12.0);
        assert_eq!(grads["w"][[4, 2]], 48.0);

        // dx = col2im(ones · wᵀ); per-channel row sums of w are 2 and 2
        let counts = [1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0];
        let expected: Vec<f64> = counts.iter().chain(counts.iter()).map(|c| c * 2.0).collect();
        assert_eq!(dx.row(0).to_vec(), expected);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(5);
        let input = ImageShape::new(4, 4, 2, 2);
        let mut con = Convolution::new(1, 1, input, FilterShape::new(3, 3, 2), &mut rng).unwrap();
        let x = Array2::from_shape_fn((2, input.features()), |(i, j)| {
            ((i * 31 + j * 7) % 11) as f64 / 11.0 - 0.5
        });
        let out = con.forward(&x).unwrap();
        // loss = sum(out * g) for a fixed g, so dL/dout = g
        let g = Array2::from_shape_fn(out.dim(), |(i, j)| ((i + 3 * j) % 5) as f64 - 2.0);
        let dx = con.backward(&g).unwrap();
        let dw = con.gradients().unwrap()["w"].clone();

        let eps = 1e-5;
        let loss = |c: &mut Convolution, x: &Matrix| (c.forward(x).unwrap() * &g).sum();
        for &(i, j) in &[(0, 0), (0, 13), (1, 5), (1, 31)] {
            let mut plus = x.clone();
            plus[[i, j]] += eps;
            let mut minus = x.clone();
            minus[[i, j]] -= eps;
            let numeric = (loss(&mut con, &plus) - loss(&mut con, &minus)) / (2.0 * eps);
            assert_abs_diff_eq!(dx[[i, j]], numeric, epsilon = 1e-6);
        }
        for &(r, c) in &[(0, 0), (7, 1), (17, 0)] {
            let mut params = con.params();
            let base = params["w"].clone();
            let mut w = base.clone();
            w[[r, c]] += eps;
            params.insert("w".to_string(), w);
            con.update_params(params.clone()).unwrap();
            let up = loss(&mut con, &x);
            let mut w = base.clone();
            w[[r, c]] -= eps;
            params.insert("w".to_string(), w);
            con.update_params(params.clone()).unwrap();
            let down = loss(&mut con, &x);
            params.insert("w".to_string(), base);
            con.update_params(params).unwrap();
            assert_abs_diff_eq!(dw[[r, c]], (up - down) / (2.0 * eps), epsilon = 1e-6);
        }
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            Convolution::new(
                2,
                0,
                ImageShape::new(4, 4, 1, 1),
                FilterShape::new(3, 3, 1),
                &mut rng
            ),
            Err(NnError::NonIntegerOutputSize { .. })
        ));
        assert!(matches!(
            Convolution::new(
                1,
                0,
                ImageShape::new(2, 2, 1, 1),
                FilterShape::new(3, 3, 1),
                &mut rng
            ),
            Err(NnError::NegativeOutputSize { .. })
        ));
    }

    #[test]
    fn backward_requires_forward() {
        let mut con = fixture();
        assert!(matches!(
            con.backward(&Matrix::zeros((2, 12))),
            Err(NnError::StateNotReady(_))
        ));
        con.forward(&stepped(2, 18, 1.0, 1.0)).unwrap();
        assert!(con.backward(&Matrix::zeros((2, 11))).is_err());
    }

    #[test]
    fn plane_relayout_round_trips() {
        let y = stepped(6, 4, 0.0, 1.0);
        let planes = rows_to_planes(&y, 2, 3);
        assert_eq!(planes.row(0).to_vec()[..3], [0.0, 4.0, 8.0]);
        assert_eq!(planes_to_rows(&planes, 3, 4), y);
    }
}
