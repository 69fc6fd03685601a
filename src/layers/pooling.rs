use std::collections::BTreeMap;

use crate::error::{dims_mismatch, NnError, Result};
use crate::image::{col2im, get_out_size, im2col, ImageBatch, ImageShape};
use crate::layers::Layer;
use crate::matrix::{max_each_row, reshape, Matrix};
use crate::record::LayerKind;

/// Non-overlapping max pooling (stride equals the window).
///
/// Input and output rows use the channel-major plane layout of
/// [`Convolution`](crate::layers::Convolution).
#[derive(Debug, Clone)]
pub struct MaxPooling {
    input: ImageShape,
    pool_w: usize,
    pool_h: usize,
    out_h: usize,
    out_w: usize,
    // argmax inside each window, ordered (image, position, channel)
    arg_max: Option<Vec<usize>>,
    batch: usize,
}

impl MaxPooling {
    pub fn new(input: ImageShape, pool_w: usize, pool_h: usize) -> Result<MaxPooling> {
        if pool_w != pool_h {
            return Err(NnError::InvalidConfig(format!(
                "pooling window must be square, got {}x{}",
                pool_w, pool_h
            )));
        }
        let out_h = get_out_size(input.height, pool_h, pool_h, 0)?;
        let out_w = get_out_size(input.width, pool_w, pool_w, 0)?;
        Ok(MaxPooling {
            input,
            pool_w,
            pool_h,
            out_h,
            out_w,
            arg_max: None,
            batch: 0,
        })
    }

    pub fn input_shape(&self) -> ImageShape {
        self.input
    }

    pub fn pool_size(&self) -> (usize, usize) {
        (self.pool_w, self.pool_h)
    }

    pub fn out_size(&self) -> (usize, usize) {
        (self.out_h, self.out_w)
    }
}

impl Layer for MaxPooling {
    fn forward(&mut self, x: &Matrix) -> Result<Matrix> {
        let channel = self.input.channel;
        let window = self.pool_w * self.pool_h;
        let positions = self.out_h * self.out_w;
        let batch = x.nrows();

        let images = ImageBatch::from_matrix(x, self.input.width, self.input.height, channel, 0)?;
        let cols = im2col(&images, self.pool_h, self.pool_w, self.pool_h)?;
        // one window of one channel per row
        let windows = reshape(&cols, batch * positions * channel, window)?;
        let (max, arg_max) = max_each_row(&windows);

        let mut out = Matrix::zeros((batch, channel * positions));
        for n in 0..batch {
            for p in 0..positions {
                for c in 0..channel {
                    out[[n, c * positions + p]] = max[(n * positions + p) * channel + c];
                }
            }
        }
        self.arg_max = Some(arg_max);
        self.batch = batch;
        Ok(out)
    }

    fn backward(&mut self, dout: &Matrix) -> Result<Matrix> {
        let arg_max = self
            .arg_max
            .as_ref()
            .ok_or(NnError::StateNotReady("MaxPooling::backward called before forward"))?;
        let channel = self.input.channel;
        let window = self.pool_w * self.pool_h;
        let positions = self.out_h * self.out_w;
        let expected = (self.batch, channel * positions);
        if dout.dim() != expected {
            return Err(dims_mismatch("MaxPooling::backward", dout.dim(), expected));
        }

        let mut windows = Matrix::zeros((self.batch * positions * channel, window));
        for n in 0..self.batch {
            for p in 0..positions {
                for c in 0..channel {
                    let row = (n * positions + p) * channel + c;
                    windows[[row, arg_max[row]]] = dout[[n, c * positions + p]];
                }
            }
        }
        let cols = reshape(&windows, self.batch * positions, channel * window)?;
        let shape = ImageShape::new(self.input.width, self.input.height, channel, self.batch);
        col2im(&cols, &shape, self.pool_h, self.pool_w, self.pool_h, 0)
    }

    fn kind(&self) -> LayerKind {
        LayerKind::MaxPooling
    }

    fn clear_cache(&mut self) {
        self.arg_max = None;
        self.batch = 0;
    }

    fn attributes(&self) -> BTreeMap<String, usize> {
        let mut attrs = BTreeMap::new();
        attrs.insert("input_width".to_string(), self.input.width);
        attrs.insert("input_height".to_string(), self.input.height);
        attrs.insert("input_channel".to_string(), self.input.channel);
        attrs.insert("input_batch".to_string(), self.input.batch);
        attrs.insert("pool_width".to_string(), self.pool_w);
        attrs.insert("pool_height".to_string(), self.pool_h);
        attrs
    }
}
