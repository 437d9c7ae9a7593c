/// Classifier network built from a declarative topology
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::layers::{recurrent_sum, Activation, Conv, Dense, Lstm};

pub mod topology;

pub use topology::{HeadKind, HeadSpec, InputLayout, LayerSpec, StreamSpec, Topology};

/// Feature shape flowing between blocks, batch axis excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Features {
    Sequence(usize),
    Image(usize, usize, usize),
    Flat(usize),
}

impl Features {
    fn width(&self) -> usize {
        match *self {
            Features::Sequence(f) | Features::Flat(f) => f,
            Features::Image(c, h, w) => c * h * w,
        }
    }
}

enum Block {
    Lstm(Lstm),
    RecurrentSum,
    Conv(Conv),
    Dense(Dense),
}

impl Block {
    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Block::Lstm(lstm) => lstm.forward(x),
            Block::RecurrentSum => recurrent_sum(x),
            Block::Conv(conv) => conv.forward(x, train),
            Block::Dense(dense) => dense.forward(&flatten(x)?),
        }
    }
}

/// Collapse everything but the batch axis
fn flatten(x: &Tensor) -> Result<Tensor> {
    if x.rank() > 2 {
        x.flatten_from(1)
    } else {
        Ok(x.clone())
    }
}

/// Build one layer against the incoming feature shape
fn build_block(
    spec: &LayerSpec,
    input: Features,
    vb: VarBuilder,
) -> crate::Result<(Block, Features)> {
    let mismatch = |expected: &str| {
        crate::ZmlError::Config(format!(
            "{:?} expects {} input, got {:?}",
            spec, expected, input
        ))
    };

    match (spec, input) {
        (LayerSpec::Lstm { hidden }, Features::Sequence(features)) => {
            let lstm = Lstm::new(features, *hidden, vb)?;
            let out = Features::Sequence(lstm.hidden());
            Ok((Block::Lstm(lstm), out))
        }
        (LayerSpec::Lstm { .. }, _) => Err(mismatch("sequence")),

        (LayerSpec::RecurrentSum, Features::Sequence(features)) => {
            Ok((Block::RecurrentSum, Features::Flat(features)))
        }
        (LayerSpec::RecurrentSum, _) => Err(mismatch("sequence")),

        (LayerSpec::Conv { spec: conv, dropout }, Features::Image(c, h, w)) => {
            let (c2, h2, w2) = conv.output_shape((c, h, w)).ok_or_else(|| {
                crate::ZmlError::Config(format!(
                    "kernel {:?} does not fit a {}x{} feature map",
                    conv.kernel, h, w
                ))
            })?;
            let block = Conv::new(c, *conv, *dropout, vb)?;
            Ok((Block::Conv(block), Features::Image(c2, h2, w2)))
        }
        (LayerSpec::Conv { .. }, _) => Err(mismatch("image")),

        (LayerSpec::Dense { out, activation }, Features::Flat(_) | Features::Image(..)) => {
            let dense = Dense::new(input.width(), *out, *activation, vb)?;
            Ok((Block::Dense(dense), Features::Flat(*out)))
        }
        (LayerSpec::Dense { .. }, Features::Sequence(_)) => Err(mismatch("flat or image")),
    }
}

fn build_stack(
    layers: &[LayerSpec],
    mut features: Features,
    vb: VarBuilder,
) -> crate::Result<(Vec<Block>, Features)> {
    let mut blocks = Vec::with_capacity(layers.len());
    for (i, spec) in layers.iter().enumerate() {
        let (block, next) = build_block(spec, features, vb.pp(format!("layer_{}", i)))?;
        log::debug!("  {:?}: {:?} -> {:?}", spec, features, next);
        blocks.push(block);
        features = next;
    }
    Ok((blocks, features))
}

fn run_stack(blocks: &[Block], x: &Tensor, train: bool) -> Result<Tensor> {
    let mut x = x.clone();
    for block in blocks {
        x = block.forward(&x, train)?;
    }
    Ok(x)
}

/// Turn an iterator tensor (sample axis last) into a batch-first tensor
pub fn to_batch_first(layout: &InputLayout, x: &Tensor) -> crate::Result<Tensor> {
    let dims = x.dims();
    let bad_shape = || {
        crate::ZmlError::Config(format!("tensor of shape {:?} does not match {:?}", dims, layout))
    };

    let batched = match *layout {
        InputLayout::Sequence { features } => {
            if dims.len() != 2 || dims[0] % features != 0 {
                return Err(bad_shape());
            }
            let steps = dims[0] / features;
            x.reshape((steps, features, dims[1]))?.permute((2, 0, 1))?
        }
        InputLayout::Image {
            channels,
            height,
            width,
        } => {
            if dims.len() != 4 || dims[..3] != [channels, height, width] {
                return Err(bad_shape());
            }
            x.permute((3, 0, 1, 2))?
        }
        InputLayout::Flat { features } => {
            if dims.len() != 2 || dims[0] != features {
                return Err(bad_shape());
            }
            x.t()?
        }
    };

    Ok(batched.contiguous()?)
}

/// Head outputs, each [batch, classes]
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    pub exclusive: Tensor,
    pub overlapping: Option<Tensor>,
}

struct Head {
    spec: HeadSpec,
    dense: Dense,
}

/// Multi-stream classifier with exclusive and optional overlapping heads
///
/// Each stream runs its own stack, the results are stacked along the feature
/// axis, the trunk runs once, and every head reads the trunk output.
pub struct ClassifierNetwork {
    topology: Topology,
    streams: Vec<Vec<Block>>,
    trunk: Vec<Block>,
    heads: Vec<Head>,
}

impl ClassifierNetwork {
    /// Build every block of the topology, checking shapes along the way
    pub fn new(topology: Topology, vb: VarBuilder) -> crate::Result<Self> {
        if topology.streams.is_empty() {
            return Err(crate::ZmlError::Config("topology has no input streams".to_string()));
        }
        if topology.head(HeadKind::Exclusive).is_none() {
            return Err(crate::ZmlError::Config("topology has no exclusive head".to_string()));
        }

        let mut streams = Vec::with_capacity(topology.streams.len());
        let mut merged = 0;
        for stream in &topology.streams {
            log::debug!("Building stream '{}'", stream.name);
            let input = match stream.layout {
                InputLayout::Sequence { features } => Features::Sequence(features),
                InputLayout::Image {
                    channels,
                    height,
                    width,
                } => Features::Image(channels, height, width),
                InputLayout::Flat { features } => Features::Flat(features),
            };
            let (blocks, out) = build_stack(&stream.layers, input, vb.pp(&stream.name))?;
            if let Features::Sequence(_) = out {
                return Err(crate::ZmlError::Config(format!(
                    "stream '{}' still yields a sequence; end it with a recurrent sum",
                    stream.name
                )));
            }
            merged += out.width();
            streams.push(blocks);
        }

        let (trunk, branch) = build_stack(&topology.trunk, Features::Flat(merged), vb.pp("trunk"))?;

        let mut heads = Vec::with_capacity(topology.heads.len());
        for spec in &topology.heads {
            let name = match spec.kind {
                HeadKind::Exclusive => "exclusive",
                HeadKind::Overlapping => "overlapping",
            };
            let dense = Dense::new(branch.width(), spec.classes, spec.activation, vb.pp(name))?;
            heads.push(Head {
                spec: spec.clone(),
                dense,
            });
        }

        log::info!(
            "ClassifierNetwork: {} streams merged to {} features, branch width {}, {} heads",
            streams.len(),
            merged,
            branch.width(),
            heads.len()
        );

        Ok(Self {
            topology,
            streams,
            trunk,
            heads,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Trunk output shared by all heads: [batch, branch width]
    fn branch(&self, inputs: &[Tensor], train: bool) -> crate::Result<Tensor> {
        if inputs.len() != self.streams.len() {
            return Err(crate::ZmlError::Config(format!(
                "network has {} input streams, got {} tensors",
                self.streams.len(),
                inputs.len()
            )));
        }

        let mut outputs = Vec::with_capacity(inputs.len());
        for ((x, spec), blocks) in inputs.iter().zip(&self.topology.streams).zip(&self.streams) {
            let x = to_batch_first(&spec.layout, x)?;
            outputs.push(flatten(&run_stack(blocks, &x, train)?)?);
        }

        let merged = if outputs.len() == 1 {
            outputs.remove(0)
        } else {
            Tensor::cat(&outputs, 1)?
        };

        Ok(run_stack(&self.trunk, &merged, train)?)
    }

    fn run_heads(
        &self,
        inputs: &[Tensor],
        train: bool,
        head: impl Fn(&Dense, &Tensor) -> Result<Tensor>,
    ) -> crate::Result<ClassifierOutput> {
        let branch = self.branch(inputs, train)?;

        let mut exclusive = None;
        let mut overlapping = None;
        for h in &self.heads {
            let out = head(&h.dense, &branch)?;
            match h.spec.kind {
                HeadKind::Exclusive => exclusive = Some(out),
                HeadKind::Overlapping => overlapping = Some(out),
            }
        }

        let exclusive = exclusive
            .ok_or_else(|| crate::ZmlError::Config("no exclusive head".to_string()))?;
        Ok(ClassifierOutput {
            exclusive,
            overlapping,
        })
    }

    /// Forward pass over iterator tensors (sample axis last), one per stream
    pub fn forward(&self, inputs: &[Tensor], train: bool) -> crate::Result<ClassifierOutput> {
        self.run_heads(inputs, train, |dense, x| dense.forward(x))
    }

    /// Forward pass stopping before the head activations
    pub fn forward_logits(
        &self,
        inputs: &[Tensor],
        train: bool,
    ) -> crate::Result<ClassifierOutput> {
        self.run_heads(inputs, train, |dense, x| dense.logits(x))
    }

    pub fn head_activation(&self, kind: HeadKind) -> Option<Activation> {
        self.topology.head(kind).map(|h| h.activation)
    }
}
