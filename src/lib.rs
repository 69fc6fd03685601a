//! A small layered neural-network engine.
//!
//! Batches are `ndarray` matrices with one sample per row. Image layers
//! reinterpret each row as `channel × height × width` planes and use
//! im2col/col2im to turn convolution and pooling into matrix products.
//!
//! A [`Network`] chains [`Layer`](layers::Layer)s, ends in a
//! [`LossLayer`](loss::LossLayer) and updates parameters through an
//! [`Optimizer`](optimizer::Optimizer). Trained networks round-trip through
//! [`ModelRecord`](record::ModelRecord).

pub mod config;
pub mod error;
pub mod image;
pub mod layers;
pub mod loss;
pub mod matrix;
pub mod network;
pub mod optimizer;
pub mod record;

pub use error::{NnError, Result};
pub use matrix::{Matrix, Vector};
pub use network::{MetricsSink, Network, NetworkBuilder};
