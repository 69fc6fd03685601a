//! 4D view of a batch matrix and the im2col / col2im patch transforms.
//!
//! A batch matrix row holds one image as `channel` stacked `height x width`
//! planes, each plane row-major. `ImageBatch` reinterprets that as
//! `(batch, channel, height, width)` with optional zero padding.

use ndarray::{s, Array2, Array4};

use crate::error::{dims_mismatch, NnError, Result};
use crate::matrix::Matrix;

/// Width, height and channel count of one image plus the batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub width: usize,
    pub height: usize,
    pub channel: usize,
    pub batch: usize,
}

impl ImageShape {
    pub fn new(width: usize, height: usize, channel: usize, batch: usize) -> Self {
        ImageShape {
            width,
            height,
            channel,
            batch,
        }
    }

    /// Number of columns of a batch matrix holding images of this shape.
    pub fn features(&self) -> usize {
        self.width * self.height * self.channel
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    data: Array4<f64>,
    padding: usize,
}

impl ImageBatch {
    pub fn from_matrix(
        x: &Matrix,
        width: usize,
        height: usize,
        channel: usize,
        padding: usize,
    ) -> Result<ImageBatch> {
        if x.ncols() != width * height * channel {
            return Err(dims_mismatch(
                "ImageBatch::from_matrix",
                x.dim(),
                (x.nrows(), width * height * channel),
            ));
        }
        let batch = x.nrows();
        let mut data = Array4::zeros((
            batch,
            channel,
            height + 2 * padding,
            width + 2 * padding,
        ));
        let plain = x
            .as_standard_layout()
            .into_owned()
            .into_shape((batch, channel, height, width))
            .map_err(|_| dims_mismatch("ImageBatch::from_matrix", x.dim(), (batch, channel)))?;
        data.slice_mut(s![
            ..,
            ..,
            padding..padding + height,
            padding..padding + width
        ])
        .assign(&plain);
        Ok(ImageBatch { data, padding })
    }

    pub fn batch_size(&self) -> usize {
        self.data.dim().0
    }

    pub fn channel(&self) -> usize {
        self.data.dim().1
    }

    /// Padded height.
    pub fn height(&self) -> usize {
        self.data.dim().2
    }

    /// Padded width.
    pub fn width(&self) -> usize {
        self.data.dim().3
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn data(&self) -> &Array4<f64> {
        &self.data
    }
}

/// Spatial output size of a sliding window.
pub fn get_out_size(
    input_size: usize,
    filter_size: usize,
    stride: usize,
    padding: usize,
) -> Result<usize> {
    if stride == 0 {
        return Err(NnError::InvalidConfig("stride must be positive".into()));
    }
    let padded = input_size + 2 * padding;
    if padded < filter_size {
        return Err(NnError::NegativeOutputSize {
            input: input_size,
            filter: filter_size,
            padding,
        });
    }
    let span = padded - filter_size;
    if span % stride != 0 {
        return Err(NnError::NonIntegerOutputSize { span, stride });
    }
    Ok(span / stride + 1)
}

/// Extracts every `filter_h x filter_w` window into one row.
///
/// Rows are ordered image-major, then `oh`, then `ow`. Columns hold the
/// window of channel 0 row-major, then channel 1, and so on.
pub fn im2col(
    batch: &ImageBatch,
    filter_h: usize,
    filter_w: usize,
    stride: usize,
) -> Result<Matrix> {
    let out_h = get_out_size(batch.height(), filter_h, stride, 0)?;
    let out_w = get_out_size(batch.width(), filter_w, stride, 0)?;
    let channel = batch.channel();
    let window = filter_h * filter_w;

    let mut cols = Array2::zeros((batch.batch_size() * out_h * out_w, window * channel));
    let mut row = 0;
    for image in batch.data.outer_iter() {
        for oh in 0..out_h {
            for ow in 0..out_w {
                let top = oh * stride;
                let left = ow * stride;
                for c in 0..channel {
                    let patch = image.slice(s![c, top..top + filter_h, left..left + filter_w]);
                    let mut dst = cols.slice_mut(s![row, c * window..(c + 1) * window]);
                    for (d, v) in dst.iter_mut().zip(patch.iter()) {
                        *d = *v;
                    }
                }
                row += 1;
            }
        }
    }
    Ok(cols)
}

/// Scatter-adds patch rows back into image layout, dropping the padding.
///
/// Inverse bookkeeping of [`im2col`]: overlapping windows accumulate. The
/// result is a `(batch, channel * height * width)` matrix for the unpadded
/// `shape`.
pub fn col2im(
    cols: &Matrix,
    shape: &ImageShape,
    filter_h: usize,
    filter_w: usize,
    stride: usize,
    padding: usize,
) -> Result<Matrix> {
    let out_h = get_out_size(shape.height, filter_h, stride, padding)?;
    let out_w = get_out_size(shape.width, filter_w, stride, padding)?;
    let window = filter_h * filter_w;
    let expected = (shape.batch * out_h * out_w, window * shape.channel);
    if cols.dim() != expected {
        return Err(dims_mismatch("col2im", cols.dim(), expected));
    }

    let mut padded = Array4::<f64>::zeros((
        shape.batch,
        shape.channel,
        shape.height + 2 * padding,
        shape.width + 2 * padding,
    ));
    let mut row = 0;
    for b in 0..shape.batch {
        for oh in 0..out_h {
            for ow in 0..out_w {
                let top = oh * stride;
                let left = ow * stride;
                for c in 0..shape.channel {
                    let src = cols.slice(s![row, c * window..(c + 1) * window]);
                    let mut dst =
                        padded.slice_mut(s![b, c, top..top + filter_h, left..left + filter_w]);
                    for (d, v) in dst.iter_mut().zip(src.iter()) {
                        *d += *v;
                    }
                }
                row += 1;
            }
        }
    }

    let inner = padded
        .slice(s![
            ..,
            ..,
            padding..padding + shape.height,
            padding..padding + shape.width
        ])
        .to_owned();
    let flat: Vec<f64> = inner.iter().copied().collect();
    Array2::from_shape_vec((shape.batch, shape.features()), flat)
        .map_err(|_| dims_mismatch("col2im", cols.dim(), (shape.batch, shape.features())))
}
