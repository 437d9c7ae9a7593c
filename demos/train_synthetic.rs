/// Train the message classifier on synthetic word and analytics streams
use ndarray::{Array, IxDyn};
use zmlcore::backend::{ArrayBackend, CandleBackend};
use zmlcore::data::BatchIterator;
use zmlcore::training::Trainer;
use zmlcore::{ClassifierConfig, IteratorConfig, NetworkType};

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== zmlcore - synthetic classifier training ===");

    let config = match std::env::args().nth(1) {
        Some(path) => ClassifierConfig::from_json_file(path)?,
        None => ClassifierConfig {
            width: 8,
            num_words: 16,
            analytics_features: 4,
            ..Default::default()
        },
    };

    let backend = CandleBackend::preferred(IteratorConfig { batch_size: 16 })?;
    log::info!("Using device: {:?}", backend.device());

    // 512 messages; the label is encoded in the first feature of every stream
    let ndata = 512;
    let classes = config.num_exclusive();
    let label = |sample: usize| (sample % classes) as f32;

    let (words, steps) = match config.network_type {
        NetworkType::Recurrent => {
            let steps = 6;
            let words = Array::from_shape_fn(IxDyn(&[ndata * steps, config.num_words]), |ix| {
                if ix[1] == 0 {
                    label(ix[0] / steps)
                } else {
                    ((ix[0] * 31 + ix[1] * 7) % 5) as f32 / 5.0
                }
            });
            (words, steps)
        }
        NetworkType::Convolutional => {
            let [channels, height, width] = config.conv_input;
            let words = Array::from_shape_fn(IxDyn(&[ndata, channels, height, width]), |ix| {
                if ix[2] == 0 {
                    label(ix[0])
                } else {
                    ((ix[0] * 31 + ix[2] * 7 + ix[3]) % 5) as f32 / 5.0
                }
            });
            (words, 1)
        }
    };

    let mut inputs = vec![words];
    let mut steps = vec![steps];
    if config.analytics_input {
        inputs.push(Array::from_shape_fn(
            IxDyn(&[ndata, config.analytics_features]),
            |ix| if ix[1] == 0 { label(ix[0]) } else { 0.5 },
        ));
        steps.push(1);
    }

    let labels = Array::from_shape_fn(IxDyn(&[ndata, classes]), |ix| {
        (ix[0] % classes == ix[1]) as u8 as f32
    });

    log::info!(
        "{:?} network, {} input streams, steps {:?}",
        config.network_type,
        inputs.len(),
        steps
    );

    let mut dataset = BatchIterator::new(&backend, inputs, Some(vec![labels]), Some(steps))?;
    dataset.check_shuffle_alignment()?;

    let mut trainer = Trainer::new(&config, backend.device())?;
    let history = trainer.fit(&mut dataset, 5)?;
    let accuracy = trainer.evaluate(&mut dataset)?;

    log::info!("Loss history: {:?}", history);
    log::info!("Training accuracy: {:.2}%", accuracy * 100.0);

    Ok(())
}
