//! Conversion between layers and portable tagged records.
//!
//! A record is a kind tag, the layer's parameter blobs and, for layers with
//! geometry, a small attribute map. Decoding goes through [`DECODERS`], a
//! table keyed by [`LayerKind`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{dims_mismatch, NnError, Result};
use crate::image::ImageShape;
use crate::layers::{
    Affine, Convolution, FilterShape, Layer, MaxPooling, ParameterSet, Relu, Sigmoid, Tanh,
};
use crate::loss::{LossLayer, SmoothL1Loss, SoftmaxWithLoss};
use crate::matrix::{row_to_vector, Matrix};
use crate::optimizer::OptimizerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Sigmoid,
    Relu,
    Tanh,
    Affine,
    Convolution,
    MaxPooling,
    SoftmaxWithLoss,
    SmoothL1Loss,
}

impl LayerKind {
    pub fn tag(&self) -> &'static str {
        match self {
            LayerKind::Sigmoid => "sigmoid",
            LayerKind::Relu => "relu",
            LayerKind::Tanh => "tanh",
            LayerKind::Affine => "affine",
            LayerKind::Convolution => "convolution",
            LayerKind::MaxPooling => "max_pooling",
            LayerKind::SoftmaxWithLoss => "softmax_with_loss",
            LayerKind::SmoothL1Loss => "smooth_l1_loss",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for LayerKind {
    type Err = NnError;

    fn from_str(s: &str) -> Result<LayerKind> {
        let kind = match s {
            "sigmoid" => LayerKind::Sigmoid,
            "relu" => LayerKind::Relu,
            "tanh" => LayerKind::Tanh,
            "affine" => LayerKind::Affine,
            "convolution" => LayerKind::Convolution,
            "max_pooling" => LayerKind::MaxPooling,
            "softmax_with_loss" => LayerKind::SoftmaxWithLoss,
            "smooth_l1_loss" => LayerKind::SmoothL1Loss,
            other => return Err(NnError::UnknownLayerKind(other.to_string())),
        };
        Ok(kind)
    }
}

/// Row-major matrix payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBlob {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl ParamBlob {
    pub fn from_matrix(m: &Matrix) -> ParamBlob {
        ParamBlob {
            rows: m.nrows(),
            cols: m.ncols(),
            data: m.iter().copied().collect(),
        }
    }

    pub fn to_matrix(&self) -> Result<Matrix> {
        let (rows, cols) = (self.rows, self.cols);
        Array2::from_shape_vec((rows, cols), self.data.clone())
            .map_err(|_| dims_mismatch("ParamBlob::to_matrix", (rows, cols), (1, self.data.len())))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamBlob>,
    #[serde(default)]
    pub attributes: BTreeMap<String, usize>,
}

impl LayerRecord {
    fn attr(&self, key: &str) -> Result<usize> {
        self.attributes
            .get(key)
            .copied()
            .ok_or_else(|| NnError::MissingParameter(key.to_string()))
    }

    fn param(&self, key: &str) -> Result<Matrix> {
        self.params
            .get(key)
            .ok_or_else(|| NnError::MissingParameter(key.to_string()))?
            .to_matrix()
    }

    fn input_shape(&self) -> Result<ImageShape> {
        Ok(ImageShape::new(
            self.attr("input_width")?,
            self.attr("input_height")?,
            self.attr("input_channel")?,
            self.attributes.get("input_batch").copied().unwrap_or(1),
        ))
    }
}

/// A whole network: hidden layers, loss tag and optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub layers: Vec<LayerRecord>,
    pub loss: String,
    pub optimizer: OptimizerRecord,
}

impl ModelRecord {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<ModelRecord> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<ModelRecord> {
        ModelRecord::from_json(&fs::read_to_string(path)?)
    }
}

pub fn layer_to_record(layer: &dyn Layer) -> LayerRecord {
    let params: ParameterSet = layer
        .as_parametric()
        .map(|p| p.params())
        .unwrap_or_default();
    LayerRecord {
        kind: layer.kind().tag().to_string(),
        params: params
            .iter()
            .map(|(k, m)| (k.clone(), ParamBlob::from_matrix(m)))
            .collect(),
        attributes: layer.attributes(),
    }
}

pub type Decoder = fn(&LayerRecord) -> Result<Box<dyn Layer>>;

/// Layer decoders keyed by kind. Loss kinds are decoded by [`loss_from_tag`].
pub const DECODERS: &[(LayerKind, Decoder)] = &[
    (LayerKind::Sigmoid, decode_sigmoid),
    (LayerKind::Relu, decode_relu),
    (LayerKind::Tanh, decode_tanh),
    (LayerKind::Affine, decode_affine),
    (LayerKind::Convolution, decode_convolution),
    (LayerKind::MaxPooling, decode_max_pooling),
];

pub fn record_to_layer(record: &LayerRecord) -> Result<Box<dyn Layer>> {
    let kind: LayerKind = record.kind.parse()?;
    let decode = DECODERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, d)| *d)
        .ok_or_else(|| NnError::UnknownLayerKind(record.kind.clone()))?;
    decode(record)
}

pub fn loss_from_tag(tag: &str) -> Result<Box<dyn LossLayer>> {
    match tag.parse::<LayerKind>()? {
        LayerKind::SoftmaxWithLoss => Ok(Box::new(SoftmaxWithLoss::new())),
        LayerKind::SmoothL1Loss => Ok(Box::new(SmoothL1Loss::new())),
        _ => Err(NnError::UnknownLayerKind(tag.to_string())),
    }
}

fn decode_sigmoid(_: &LayerRecord) -> Result<Box<dyn Layer>> {
    Ok(Box::new(Sigmoid::new()))
}

fn decode_relu(_: &LayerRecord) -> Result<Box<dyn Layer>> {
    Ok(Box::new(Relu::new()))
}

fn decode_tanh(_: &LayerRecord) -> Result<Box<dyn Layer>> {
    Ok(Box::new(Tanh::new()))
}

fn decode_affine(record: &LayerRecord) -> Result<Box<dyn Layer>> {
    let w = record.param("w")?;
    let b = row_to_vector(&record.param("b")?)?;
    Ok(Box::new(Affine::with_params(w, b)?))
}

fn decode_convolution(record: &LayerRecord) -> Result<Box<dyn Layer>> {
    let filter = FilterShape::new(
        record.attr("filter_width")?,
        record.attr("filter_height")?,
        record.attr("filter_count")?,
    );
    let w = record.param("w")?;
    let b = row_to_vector(&record.param("b")?)?;
    Ok(Box::new(Convolution::with_params(
        record.attr("stride")?,
        record.attr("padding")?,
        record.input_shape()?,
        filter,
        w,
        b,
    )?))
}

fn decode_max_pooling(record: &LayerRecord) -> Result<Box<dyn Layer>> {
    Ok(Box::new(MaxPooling::new(
        record.input_shape()?,
        record.attr("pool_width")?,
        record.attr("pool_height")?,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn tags_parse_back() {
        for kind in [
            LayerKind::Sigmoid,
            LayerKind::Relu,
            LayerKind::Tanh,
            LayerKind::Affine,
            LayerKind::Convolution,
            LayerKind::MaxPooling,
            LayerKind::SoftmaxWithLoss,
            LayerKind::SmoothL1Loss,
        ] {
            assert_eq!(kind.tag().parse::<LayerKind>().unwrap(), kind);
        }
        assert!(matches!(
            "dropout".parse::<LayerKind>(),
            Err(NnError::UnknownLayerKind(ref k)) if k == "dropout"
        ));
    }

    #[test]
    fn affine_record_keeps_parameters() {
        let aff = Affine::with_params(
            arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]),
            arr1(&[-2.0, -1.0]),
        )
        .unwrap();
        let record = layer_to_record(&aff);
        assert_eq!(record.kind, "affine");
        assert_eq!(
            record.params["w"],
            ParamBlob {
                rows: 3,
                cols: 2,
                data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
            }
        );
        assert_eq!(record.params["b"].data, vec![-2.0, -1.0]);

        let mut rebuilt = record_to_layer(&record).unwrap();
        let x = arr2(&[[5.0, 6.0, 7.0], [8.0, 9.0, 10.0]]);
        assert_eq!(
            rebuilt.forward(&x).unwrap(),
            arr2(&[[56.0, 75.0], [83.0, 111.0]])
        );
    }

    #[test]
    fn activation_records_have_no_parameters() {
        let record = layer_to_record(&Tanh::new());
        assert_eq!(record.kind, "tanh");
        assert!(record.params.is_empty());
        assert_eq!(record_to_layer(&record).unwrap().kind(), LayerKind::Tanh);
    }

    #[test]
    fn convolution_and_pooling_round_trip() {
        let mut rng = StdRng::seed_from_u64(9);
        let input = ImageShape::new(4, 4, 1, 2);
        let mut con =
            Convolution::new(1, 1, input, FilterShape::new(3, 3, 2), &mut rng).unwrap();
        let mut pool = MaxPooling::new(ImageShape::new(4, 4, 2, 2), 2, 2).unwrap();

        let mut con2 = record_to_layer(&layer_to_record(&con)).unwrap();
        let mut pool2 = record_to_layer(&layer_to_record(&pool)).unwrap();

        let x = Array2::from_shape_fn((2, 16), |(i, j)| (i as f64 - j as f64) * 0.1);
        let a = pool.forward(&con.forward(&x).unwrap()).unwrap();
        let b = pool2.forward(&con2.forward(&x).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_kind_and_missing_parts_fail() {
        let record = LayerRecord {
            kind: "lstm".to_string(),
            params: BTreeMap::new(),
            attributes: BTreeMap::new(),
        };
        assert!(matches!(
            record_to_layer(&record),
            Err(NnError::UnknownLayerKind(_))
        ));

        let record = LayerRecord {
            kind: "affine".to_string(),
            params: BTreeMap::new(),
            attributes: BTreeMap::new(),
        };
        assert!(matches!(
            record_to_layer(&record),
            Err(NnError::MissingParameter(_))
        ));

        // loss tags are not hidden layers
        let record = LayerRecord {
            kind: "softmax_with_loss".to_string(),
            params: BTreeMap::new(),
            attributes: BTreeMap::new(),
        };
        assert!(matches!(
            record_to_layer(&record),
            Err(NnError::UnknownLayerKind(_))
        ));
        assert!(loss_from_tag("relu").is_err());
        assert_eq!(
            loss_from_tag("smooth_l1_loss").unwrap().kind(),
            LayerKind::SmoothL1Loss
        );
    }

    #[test]
    fn blob_with_wrong_length_is_rejected() {
        let blob = ParamBlob {
            rows: 2,
            cols: 2,
            data: vec![1.0, 2.0, 3.0],
        };
        assert!(blob.to_matrix().is_err());
    }

    #[test]
    fn model_record_json_round_trip() {
        let record = ModelRecord {
            layers: vec![layer_to_record(&Relu::new())],
            loss: "softmax_with_loss".to_string(),
            optimizer: OptimizerRecord {
                kind: "sgd".to_string(),
                learning_rate: 0.01,
            },
        };
        let json = record.to_json().unwrap();
        assert_eq!(ModelRecord::from_json(&json).unwrap(), record);
        assert!(ModelRecord::from_json("{\"layers\": 3}").is_err());
    }
}
