use std::env;
use std::process;

use log::{error, info};
use mnist::{Mnist, MnistBuilder};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

use simple_convnet::config::{load_config, TrainingConfig};
use simple_convnet::layers::{Affine, Relu};
use simple_convnet::optimizer::SgdBuilder;
use simple_convnet::{Matrix, NetworkBuilder, NnError, Result};

const IMAGE_SIZE: usize = 28 * 28;
const CLASSES: usize = 10;

fn main() {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => load_config(&path),
        None => Ok(TrainingConfig::default()),
    };
    let result = config.and_then(|config| run(&config));
    if let Err(e) = result {
        error!("training failed: {}", e);
        process::exit(1);
    }
}

fn run(config: &TrainingConfig) -> Result<()> {
    let Mnist {
        trn_img,
        trn_lbl,
        tst_img,
        tst_lbl,
        ..
    } = MnistBuilder::new()
        .label_format_digit()
        .training_set_length(config.train_size as u32)
        .test_set_length(config.test_size as u32)
        .download_and_extract()
        .finalize();

    let (trn_x, trn_t) = to_matrices(&trn_img, &trn_lbl)?;
    let (tst_x, tst_t) = to_matrices(&tst_img, &tst_lbl)?;
    info!(
        "loaded {} training and {} test images",
        trn_x.nrows(),
        tst_x.nrows()
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut builder = NetworkBuilder::new();
    builder.set_optimizer(Box::new(
        SgdBuilder::new()
            .learning_rate(config.learning_rate)
            .finalize()?,
    ));
    let mut input = IMAGE_SIZE;
    for &hidden in &config.hidden_sizes {
        builder.add(Affine::new(input, hidden, &mut rng)).add(Relu::new());
        input = hidden;
    }
    builder.add(Affine::new(input, CLASSES, &mut rng));
    let mut net = builder.finalize();

    let samples = trn_x.nrows();
    let batches = (0..config.iterations).map(|_| {
        let picked = sample(&mut rng, samples, config.batch_size).into_vec();
        (trn_x.select(Axis(0), &picked), trn_t.select(Axis(0), &picked))
    });

    let log_every = config.log_every;
    let mut report = |iteration: usize, loss: f64, accuracy: f64| {
        if iteration % log_every == 0 {
            info!(
                "iteration {:>5}: loss {:.4}, batch accuracy {:.3}",
                iteration, loss, accuracy
            );
        }
    };
    net.train(batches, &mut report)?;

    let (loss, accuracy) = net.forward(&tst_x, &tst_t)?;
    info!("test set: loss {:.4}, accuracy {:.4}", loss, accuracy);

    if let Some(path) = &config.model_out {
        net.to_record().save(path)?;
        info!("model written to {}", path.display());
    }
    Ok(())
}

/// Scales pixels to `[0, 1]` and one-hot encodes the digit labels.
fn to_matrices(images: &[u8], labels: &[u8]) -> Result<(Matrix, Matrix)> {
    let n = labels.len();
    let x = Array2::from_shape_vec(
        (n, IMAGE_SIZE),
        images.iter().map(|&p| f64::from(p) / 255.0).collect(),
    )
    .map_err(|_| NnError::ElementCountMismatch {
        from: (1, images.len()),
        to: (n, IMAGE_SIZE),
    })?;
    let mut t = Matrix::zeros((n, CLASSES));
    for (row, &label) in labels.iter().enumerate() {
        t[[row, label as usize]] = 1.0;
    }
    Ok((x, t))
}
