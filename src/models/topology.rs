/// Declarative description of a classifier graph
///
/// A topology lists the input streams (each with its own layer stack), a
/// shared trunk applied after the streams are stacked together, and the
/// output heads that all diverge from the trunk's last layer (the branch node).
use serde::{Deserialize, Serialize};

use crate::config::{ClassifierConfig, NetworkType};
use crate::layers::{Activation, ConvSpec};

/// How an iterator batch (sample axis last) maps onto a batch-first tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputLayout {
    /// [steps * features, batch] -> [batch, steps, features]
    Sequence { features: usize },
    /// [channels, height, width, batch] -> [batch, channels, height, width]
    Image {
        channels: usize,
        height: usize,
        width: usize,
    },
    /// [features, batch] -> [batch, features]
    Flat { features: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Lstm { hidden: usize },
    RecurrentSum,
    Conv { spec: ConvSpec, dropout: f32 },
    Dense { out: usize, activation: Activation },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub layout: InputLayout,
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadKind {
    /// One label per sample, softmax normalized
    Exclusive,
    /// Independent labels, logistic per class
    Overlapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadSpec {
    pub kind: HeadKind,
    pub classes: usize,
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub streams: Vec<StreamSpec>,
    pub trunk: Vec<LayerSpec>,
    pub heads: Vec<HeadSpec>,
}

/// Width of the trunk layer where the streams meet
pub const TRUNK_WIDTH: usize = 20;

/// Convolution pipeline for word grids: narrow kernels first, then wider ones
/// as the height is halved twice
pub fn conv_pipeline() -> Vec<ConvSpec> {
    let act = Activation::leaky();
    vec![
        ConvSpec::new((1, 1, 2), act),
        ConvSpec::new((3, 1, 4), act),
        ConvSpec::new((5, 1, 6), act),
        ConvSpec::new((3, 1, 12), act).stride(2, 1),
        ConvSpec::new((5, 1, 18), act),
        ConvSpec::new((3, 3, 36), act).stride(2, 1).padding(1),
        ConvSpec::new((3, 2, 54), act).padding(1),
        ConvSpec::new((1, 3, 108), Activation::Logistic)
            .stride(1, 2)
            .padding(1),
    ]
}

impl Topology {
    /// Assemble the classifier topology selected by the configuration
    ///
    /// Content stage is recurrent (LSTM + sum) or convolutional, optionally
    /// stacked with an analytics branch. The exclusive softmax head is always
    /// present; the overlapping logistic head only with overlapping classes.
    pub fn classifier(config: &ClassifierConfig) -> crate::Result<Self> {
        config.validate()?;

        let content = match config.network_type {
            NetworkType::Recurrent => StreamSpec {
                name: "words".to_string(),
                layout: InputLayout::Sequence {
                    features: config.num_words,
                },
                layers: vec![
                    LayerSpec::Lstm {
                        hidden: config.recurrent_hidden(),
                    },
                    LayerSpec::RecurrentSum,
                ],
            },
            NetworkType::Convolutional => {
                let [channels, height, width] = config.conv_input;
                StreamSpec {
                    name: "words".to_string(),
                    layout: InputLayout::Image {
                        channels,
                        height,
                        width,
                    },
                    layers: conv_pipeline()
                        .into_iter()
                        .map(|spec| LayerSpec::Conv {
                            spec,
                            dropout: config.dropout,
                        })
                        .collect(),
                }
            }
        };

        let mut streams = vec![content];

        if config.analytics_input {
            let analytics = match config.network_type {
                NetworkType::Recurrent => LayerSpec::Dense {
                    out: 30,
                    activation: Activation::leaky(),
                },
                NetworkType::Convolutional => LayerSpec::Dense {
                    out: 20,
                    activation: Activation::Logistic,
                },
            };
            streams.push(StreamSpec {
                name: "analytics".to_string(),
                layout: InputLayout::Flat {
                    features: config.analytics_features,
                },
                layers: vec![analytics],
            });
        }

        let mut heads = vec![HeadSpec {
            kind: HeadKind::Exclusive,
            classes: config.num_exclusive(),
            activation: Activation::Softmax,
        }];
        if let Some(classes) = config.num_overlapping() {
            heads.push(HeadSpec {
                kind: HeadKind::Overlapping,
                classes,
                activation: Activation::Logistic,
            });
        }

        let topology = Self {
            streams,
            trunk: vec![LayerSpec::Dense {
                out: TRUNK_WIDTH,
                activation: Activation::Explin,
            }],
            heads,
        };

        log::debug!(
            "Assembled {:?} topology: {} streams, {} heads",
            config.network_type,
            topology.streams.len(),
            topology.heads.len()
        );

        Ok(topology)
    }

    pub fn head(&self, kind: HeadKind) -> Option<&HeadSpec> {
        self.heads.iter().find(|h| h.kind == kind)
    }
}
