use log::{debug, trace};

use crate::error::{NnError, Result};
use crate::layers::{Layer, ParameterSet};
use crate::loss::{LossLayer, SoftmaxWithLoss};
use crate::matrix::Matrix;
use crate::optimizer::{Optimizer, Sgd};
use crate::record::{layer_to_record, loss_from_tag, record_to_layer, ModelRecord};

/// Receives `(iteration, loss, accuracy)` after every training step.
pub trait MetricsSink {
    fn record(&mut self, iteration: usize, loss: f64, accuracy: f64);
}

impl<F: FnMut(usize, f64, f64)> MetricsSink for F {
    fn record(&mut self, iteration: usize, loss: f64, accuracy: f64) {
        self(iteration, loss, accuracy)
    }
}

/// Layers applied in order, followed by a loss layer.
///
/// A training step is `forward`, `backward`, `update`, in that order, on one
/// batch.
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
    loss: Box<dyn LossLayer>,
    optimizer: Box<dyn Optimizer>,
}

impl Network {
    /// Empty network with softmax cross-entropy loss and default SGD.
    pub fn new() -> Network {
        NetworkBuilder::new().finalize()
    }

    pub fn add<L: Layer + 'static>(&mut self, layer: L) {
        self.layers.push(Box::new(layer));
    }

    pub fn add_boxed(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// Runs `x` through every layer, without the loss.
    ///
    /// The loss cache is dropped since it belongs to an earlier batch; on
    /// error every layer cache goes too.
    pub fn predict(&mut self, x: &Matrix) -> Result<Matrix> {
        let result = self.run_layers(x);
        if result.is_err() {
            self.clear_caches();
        } else {
            self.loss.clear_cache();
        }
        result
    }

    /// Returns `(loss, accuracy)` of the batch.
    ///
    /// A failure anywhere, loss included, drops all cached state; a following
    /// `backward` or `update` reports `StateNotReady`.
    pub fn forward(&mut self, x: &Matrix, t: &Matrix) -> Result<(f64, f64)> {
        let result = self.run_layers(x).and_then(|y| self.loss.forward(&y, t));
        let (loss, accuracy) = match result {
            Ok(metrics) => metrics,
            Err(e) => {
                self.clear_caches();
                return Err(e);
            }
        };
        debug!(
            "forward: batch {} loss {:.6} accuracy {:.4}",
            x.nrows(),
            loss,
            accuracy
        );
        Ok((loss, accuracy))
    }

    fn run_layers(&mut self, x: &Matrix) -> Result<Matrix> {
        let mut out = x.clone();
        for layer in self.layers.iter_mut() {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    fn clear_caches(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.clear_cache();
        }
        self.loss.clear_cache();
    }

    pub fn backward(&mut self) -> Result<()> {
        let mut dout = self.loss.backward()?;
        for layer in self.layers.iter_mut().rev() {
            dout = layer.backward(&dout)?;
        }
        Ok(())
    }

    /// Applies the optimizer to every parametrized layer.
    ///
    /// All gradients are gathered first, so a layer without gradients
    /// aborts the update before any parameter changes.
    pub fn update(&mut self) -> Result<()> {
        let mut pending: Vec<(usize, ParameterSet, ParameterSet)> = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            if let Some(p) = layer.as_parametric() {
                pending.push((i, p.params(), p.gradients()?));
            }
        }
        for (i, mut params, grads) in pending {
            self.optimizer.update(&mut params, &grads)?;
            let layer = self.layers[i]
                .as_parametric_mut()
                .ok_or(NnError::StateNotReady("layer lost its parameters"))?;
            layer.update_params(params)?;
            trace!("updated layer {} ({})", i, self.layers[i].kind());
        }
        Ok(())
    }

    /// One forward/backward/update pass.
    pub fn train_step(&mut self, x: &Matrix, t: &Matrix) -> Result<(f64, f64)> {
        let metrics = self.forward(x, t)?;
        self.backward()?;
        self.update()?;
        Ok(metrics)
    }

    /// Trains on every batch in turn, reporting each step to `sink`.
    pub fn train<I, S>(&mut self, batches: I, sink: &mut S) -> Result<usize>
    where
        I: IntoIterator<Item = (Matrix, Matrix)>,
        S: MetricsSink + ?Sized,
    {
        let mut iterations = 0;
        for (x, t) in batches {
            let (loss, accuracy) = self.train_step(&x, &t)?;
            sink.record(iterations, loss, accuracy);
            iterations += 1;
        }
        Ok(iterations)
    }

    pub fn to_record(&self) -> ModelRecord {
        ModelRecord {
            layers: self
                .layers
                .iter()
                .map(|l| layer_to_record(l.as_ref()))
                .collect(),
            loss: self.loss.kind().tag().to_string(),
            optimizer: self.optimizer.to_record(),
        }
    }

    pub fn from_record(record: &ModelRecord) -> Result<Network> {
        let mut builder = NetworkBuilder::new();
        builder
            .set_loss(loss_from_tag(&record.loss)?)
            .set_optimizer(record.optimizer.clone().into_optimizer()?);
        for layer in &record.layers {
            builder.add_boxed(record_to_layer(layer)?);
        }
        Ok(builder.finalize())
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::new()
    }
}

pub struct NetworkBuilder {
    layers: Vec<Box<dyn Layer>>,
    loss: Option<Box<dyn LossLayer>>,
    optimizer: Option<Box<dyn Optimizer>>,
}

impl NetworkBuilder {
    pub fn new() -> NetworkBuilder {
        NetworkBuilder {
            layers: vec![],
            loss: None,
            optimizer: None,
        }
    }

    pub fn add<L: Layer + 'static>(&mut self, layer: L) -> &mut NetworkBuilder {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn add_boxed(&mut self, layer: Box<dyn Layer>) -> &mut NetworkBuilder {
        self.layers.push(layer);
        self
    }

    pub fn set_loss(&mut self, loss: Box<dyn LossLayer>) -> &mut NetworkBuilder {
        self.loss = Some(loss);
        self
    }

    pub fn set_optimizer(&mut self, optimizer: Box<dyn Optimizer>) -> &mut NetworkBuilder {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn finalize(&mut self) -> Network {
        Network {
            layers: std::mem::take(&mut self.layers),
            loss: self
                .loss
                .take()
                .unwrap_or_else(|| Box::new(SoftmaxWithLoss::new())),
            optimizer: self.optimizer.take().unwrap_or_else(|| Box::new(Sgd::new())),
        }
    }
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        NetworkBuilder::new()
    }
}
