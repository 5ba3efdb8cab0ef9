//! Model loading: tensor table → typed per-layer parameters.
//!
//! Parameters are bound through a declarative manifest of `(name template, expected
//! dims)` pairs. A missing entry fails the load with the exact key, a tensor of the
//! wrong rank or extent fails it with the offending shape.

use crate::error::{Error, ErrorFlags, Result, ResultExt, io_error};
use crate::format::{FileHeader, read_tensor_header};
use crate::tensor::Tensor;
use crate::utils::MemoryMapper;
use log::{debug, info};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// Extent of one tensor axis, resolved against the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extent {
    Embed,
    Vocab,
    /// Hidden width of the channel-mixing block, taken from the first tensor that uses it.
    Ffn,
}

/// Expected `(width, height)` of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dims {
    Vector(Extent),
    Matrix(Extent, Extent),
}

/// Names the weights of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerParam {
    Ln1Weight,
    Ln1Bias,
    AttTimeMixK,
    AttTimeMixV,
    AttTimeMixR,
    AttTimeFirst,
    AttTimeDecay,
    AttKey,
    AttValue,
    AttReceptance,
    AttOutput,
    Ln2Weight,
    Ln2Bias,
    FfnTimeMixK,
    FfnTimeMixR,
    FfnKey,
    FfnValue,
    FfnReceptance,
}

use Dims::{Matrix, Vector};
use Extent::{Embed, Ffn, Vocab};

const LAYER_MANIFEST: [(LayerParam, &str, Dims); 18] = [
    (LayerParam::Ln1Weight, "ln1.weight", Vector(Embed)),
    (LayerParam::Ln1Bias, "ln1.bias", Vector(Embed)),
    (LayerParam::AttTimeMixK, "att.time_mix_k", Vector(Embed)),
    (LayerParam::AttTimeMixV, "att.time_mix_v", Vector(Embed)),
    (LayerParam::AttTimeMixR, "att.time_mix_r", Vector(Embed)),
    (LayerParam::AttTimeFirst, "att.time_first", Vector(Embed)),
    (LayerParam::AttTimeDecay, "att.time_decay", Vector(Embed)),
    (LayerParam::AttKey, "att.key.weight", Matrix(Embed, Embed)),
    (LayerParam::AttValue, "att.value.weight", Matrix(Embed, Embed)),
    (LayerParam::AttReceptance, "att.receptance.weight", Matrix(Embed, Embed)),
    (LayerParam::AttOutput, "att.output.weight", Matrix(Embed, Embed)),
    (LayerParam::Ln2Weight, "ln2.weight", Vector(Embed)),
    (LayerParam::Ln2Bias, "ln2.bias", Vector(Embed)),
    (LayerParam::FfnTimeMixK, "ffn.time_mix_k", Vector(Embed)),
    (LayerParam::FfnTimeMixR, "ffn.time_mix_r", Vector(Embed)),
    (LayerParam::FfnKey, "ffn.key.weight", Matrix(Embed, Ffn)),
    (LayerParam::FfnValue, "ffn.value.weight", Matrix(Ffn, Embed)),
    (LayerParam::FfnReceptance, "ffn.receptance.weight", Matrix(Embed, Embed)),
];

/// Token embedding matrix; kept in source precision by the quantizer.
pub const EMBEDDING_TENSOR: &str = "emb.weight";
/// Vocabulary projection; kept in source precision by the quantizer.
pub const HEAD_TENSOR: &str = "head.weight";

const EMB: (&str, Dims) = (EMBEDDING_TENSOR, Matrix(Embed, Vocab));
const LN0_WEIGHT: (&str, Dims) = ("blocks.0.ln0.weight", Vector(Embed));
const LN0_BIAS: (&str, Dims) = ("blocks.0.ln0.bias", Vector(Embed));
const LN_OUT_WEIGHT: (&str, Dims) = ("ln_out.weight", Vector(Embed));
const LN_OUT_BIAS: (&str, Dims) = ("ln_out.bias", Vector(Embed));
const HEAD: (&str, Dims) = (HEAD_TENSOR, Matrix(Embed, Vocab));

/// Full tensor name of a block parameter.
pub fn layer_tensor_name(layer: usize, param: LayerParam) -> String {
    let template = LAYER_MANIFEST.iter().find(|(p, _, _)| *p == param).map_or("", |(_, name, _)| name);
    format!("blocks.{layer}.{template}")
}

/// Name and shape of one expected tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterShape {
    pub name: String,
    pub width: usize,
    /// `None` for vectors.
    pub height: Option<usize>,
}

/// Every tensor a model with this header must contain, in load order.
pub fn parameter_shapes(header: &FileHeader, ffn_width: usize) -> Vec<ParameterShape> {
    let extent = |extent: Extent| match extent {
        Embed => header.n_embed as usize,
        Vocab => header.n_vocab as usize,
        Ffn => ffn_width,
    };
    let shape = |name: String, dims: Dims| match dims {
        Vector(width) => ParameterShape { name, width: extent(width), height: None },
        Matrix(width, height) => ParameterShape { name, width: extent(width), height: Some(extent(height)) },
    };

    let mut shapes = vec![
        shape(EMB.0.to_string(), EMB.1),
        shape(LN0_WEIGHT.0.to_string(), LN0_WEIGHT.1),
        shape(LN0_BIAS.0.to_string(), LN0_BIAS.1),
    ];
    for layer in 0..header.n_layer as usize {
        shapes.extend(LAYER_MANIFEST.iter().map(|(param, _, dims)| shape(layer_tensor_name(layer, *param), *dims)));
    }
    shapes.extend([
        shape(LN_OUT_WEIGHT.0.to_string(), LN_OUT_WEIGHT.1),
        shape(LN_OUT_BIAS.0.to_string(), LN_OUT_BIAS.1),
        shape(HEAD.0.to_string(), HEAD.1),
    ]);
    shapes
}

/// Weights of one block. Vectors are stored as f32, matrices keep the file's encoding.
#[derive(Debug)]
pub struct LayerParameters {
    pub ln1_weight: Tensor,
    pub ln1_bias: Tensor,
    pub att_time_mix_k: Tensor,
    pub att_time_mix_v: Tensor,
    pub att_time_mix_r: Tensor,
    pub att_time_first: Tensor,
    /// Stored as `-exp(decay)` by the converter.
    pub att_time_decay: Tensor,
    pub att_key: Tensor,
    pub att_value: Tensor,
    pub att_receptance: Tensor,
    pub att_output: Tensor,
    pub ln2_weight: Tensor,
    pub ln2_bias: Tensor,
    pub ffn_time_mix_k: Tensor,
    pub ffn_time_mix_r: Tensor,
    pub ffn_key: Tensor,
    pub ffn_value: Tensor,
    pub ffn_receptance: Tensor,
}

impl LayerParameters {
    pub fn get(&self, param: LayerParam) -> &Tensor {
        match param {
            LayerParam::Ln1Weight => &self.ln1_weight,
            LayerParam::Ln1Bias => &self.ln1_bias,
            LayerParam::AttTimeMixK => &self.att_time_mix_k,
            LayerParam::AttTimeMixV => &self.att_time_mix_v,
            LayerParam::AttTimeMixR => &self.att_time_mix_r,
            LayerParam::AttTimeFirst => &self.att_time_first,
            LayerParam::AttTimeDecay => &self.att_time_decay,
            LayerParam::AttKey => &self.att_key,
            LayerParam::AttValue => &self.att_value,
            LayerParam::AttReceptance => &self.att_receptance,
            LayerParam::AttOutput => &self.att_output,
            LayerParam::Ln2Weight => &self.ln2_weight,
            LayerParam::Ln2Bias => &self.ln2_bias,
            LayerParam::FfnTimeMixK => &self.ffn_time_mix_k,
            LayerParam::FfnTimeMixR => &self.ffn_time_mix_r,
            LayerParam::FfnKey => &self.ffn_key,
            LayerParam::FfnValue => &self.ffn_value,
            LayerParam::FfnReceptance => &self.ffn_receptance,
        }
    }
}

/// Handle to one model tensor, used by graph nodes to reach weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamRef {
    Emb,
    Ln0Weight,
    Ln0Bias,
    Layer(usize, LayerParam),
    LnOutWeight,
    LnOutBias,
    Head,
}

/// A loaded model. Immutable, shared between contexts through `Arc`.
///
/// **Layout:**
/// - `emb`: `n_embed × n_vocab` embedding rows, one per token
/// - `ln0_*`: normalization applied right after the embedding
/// - `layers`: one [`LayerParameters`] per block
/// - `ln_out_*`, `head`: final normalization and vocabulary projection
pub struct Model {
    pub header: FileHeader,
    pub emb: Tensor,
    pub ln0_weight: Tensor,
    pub ln0_bias: Tensor,
    pub layers: Vec<LayerParameters>,
    pub ln_out_weight: Tensor,
    pub ln_out_bias: Tensor,
    pub head: Tensor,
}

impl Model {
    /// Reads a model file. Nothing is kept from a file that fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(io_error(ErrorFlags::FILE_OPEN, format!("Failed to open model file {}", path.display())))
            .flag(ErrorFlags::FILE)?;
        let file_size = file
            .metadata()
            .map_err(io_error(ErrorFlags::FILE_STAT, format!("Failed to stat model file {}", path.display())))
            .flag(ErrorFlags::FILE)?
            .len();

        let mut mapper = MemoryMapper::new(&file).flag(ErrorFlags::FILE)?;
        let header = FileHeader::read(&mut mapper).flag(ErrorFlags::FILE)?;
        let tensors = read_tensor_table(&mut mapper).flag(ErrorFlags::FILE)?;

        debug!("Read {} tensors, {} of {file_size} bytes from {}", tensors.len(), mapper.offset(), path.display());

        let model = Self::assemble(header, tensors)?;
        info!(
            "Loaded model: {} layers, n_embed={}, n_vocab={}, {} ({:.1} MiB)",
            model.n_layer(),
            model.n_embed(),
            model.n_vocab(),
            model.header.data_type,
            model.size_in_bytes() as f64 / (1024.0 * 1024.0)
        );
        Ok(model)
    }

    /// Binds a tensor table to the parameter manifest.
    pub fn assemble(header: FileHeader, mut tensors: HashMap<String, Tensor>) -> Result<Self> {
        for (name, value) in [("n_vocab", header.n_vocab), ("n_embed", header.n_embed), ("n_layer", header.n_layer)] {
            if value == 0 {
                return Error::fail(ErrorFlags::MODEL | ErrorFlags::DATA, format!("Invalid {name}: must be positive"));
            }
        }

        let mut binder = Binder { header: &header, tensors: &mut tensors, ffn: None };

        let emb = binder.take(EMB.0, EMB.1)?;
        let ln0_weight = binder.take_vector(LN0_WEIGHT.0, LN0_WEIGHT.1)?;
        let ln0_bias = binder.take_vector(LN0_BIAS.0, LN0_BIAS.1)?;

        let layers = (0..header.n_layer as usize).map(|layer| binder.take_layer(layer)).collect::<Result<Vec<_>>>()?;

        let ln_out_weight = binder.take_vector(LN_OUT_WEIGHT.0, LN_OUT_WEIGHT.1)?;
        let ln_out_bias = binder.take_vector(LN_OUT_BIAS.0, LN_OUT_BIAS.1)?;
        let head = binder.take(HEAD.0, HEAD.1)?;

        if !tensors.is_empty() {
            debug!("Ignoring {} tensors outside the parameter manifest", tensors.len());
        }

        Ok(Self { header, emb, ln0_weight, ln0_bias, layers, ln_out_weight, ln_out_bias, head })
    }

    pub fn n_vocab(&self) -> usize {
        self.header.n_vocab as usize
    }

    pub fn n_embed(&self) -> usize {
        self.header.n_embed as usize
    }

    pub fn n_layer(&self) -> usize {
        self.header.n_layer as usize
    }

    /// Hidden width of the channel-mixing block.
    pub fn ffn_width(&self) -> usize {
        self.layers.first().map_or(0, |layer| layer.ffn_key.height())
    }

    /// All tensors in manifest order.
    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        let head = [&self.emb, &self.ln0_weight, &self.ln0_bias];
        let tail = [&self.ln_out_weight, &self.ln_out_bias, &self.head];
        let layers = self
            .layers
            .iter()
            .flat_map(|layer| LAYER_MANIFEST.iter().map(move |(param, _, _)| layer.get(*param)));
        head.into_iter().chain(layers).chain(tail)
    }

    pub fn size_in_bytes(&self) -> usize {
        self.tensors().map(Tensor::size_in_bytes).sum()
    }

    pub(crate) fn param(&self, param: ParamRef) -> &Tensor {
        match param {
            ParamRef::Emb => &self.emb,
            ParamRef::Ln0Weight => &self.ln0_weight,
            ParamRef::Ln0Bias => &self.ln0_bias,
            ParamRef::Layer(layer, param) => self.layers[layer].get(param),
            ParamRef::LnOutWeight => &self.ln_out_weight,
            ParamRef::LnOutBias => &self.ln_out_bias,
            ParamRef::Head => &self.head,
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("header", &self.header)
            .field("ffn_width", &self.ffn_width())
            .field("bytes", &self.size_in_bytes())
            .finish()
    }
}

/// Reads tensor records until the mapping is exhausted.
fn read_tensor_table(mapper: &mut MemoryMapper) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();

    while !mapper.is_exhausted() {
        let (header, name) = read_tensor_header(mapper)?;
        let payload = mapper.get_bytes(header.payload_size()?)?;
        let tensor = Tensor::from_bytes(name.clone(), &header, payload)?;
        tensors.insert(name, tensor);
    }

    Ok(tensors)
}

struct Binder<'a> {
    header: &'a FileHeader,
    tensors: &'a mut HashMap<String, Tensor>,
    ffn: Option<usize>,
}

impl Binder<'_> {
    fn take(&mut self, name: &str, dims: Dims) -> Result<Tensor> {
        let tensor = self.tensors.remove(name).ok_or_else(|| {
            Error::new(ErrorFlags::MODEL_PARAMS | ErrorFlags::PARAM_MISSING, format!("Model is missing parameter '{name}'"))
        })?;
        self.check(&tensor, dims).flag(ErrorFlags::MODEL_PARAMS)?;
        Ok(tensor)
    }

    fn take_vector(&mut self, name: &str, dims: Dims) -> Result<Tensor> {
        self.take(name, dims).map(Tensor::into_f32)
    }

    fn take_layer(&mut self, layer: usize) -> Result<LayerParameters> {
        let mut take = |param: LayerParam| {
            let (_, _, dims) = LAYER_MANIFEST[param as usize];
            let tensor = self.take(&layer_tensor_name(layer, param), dims)?;
            Ok::<_, Error>(if matches!(dims, Vector(_)) { tensor.into_f32() } else { tensor })
        };

        Ok(LayerParameters {
            ln1_weight: take(LayerParam::Ln1Weight)?,
            ln1_bias: take(LayerParam::Ln1Bias)?,
            att_time_mix_k: take(LayerParam::AttTimeMixK)?,
            att_time_mix_v: take(LayerParam::AttTimeMixV)?,
            att_time_mix_r: take(LayerParam::AttTimeMixR)?,
            att_time_first: take(LayerParam::AttTimeFirst)?,
            att_time_decay: take(LayerParam::AttTimeDecay)?,
            att_key: take(LayerParam::AttKey)?,
            att_value: take(LayerParam::AttValue)?,
            att_receptance: take(LayerParam::AttReceptance)?,
            att_output: take(LayerParam::AttOutput)?,
            ln2_weight: take(LayerParam::Ln2Weight)?,
            ln2_bias: take(LayerParam::Ln2Bias)?,
            ffn_time_mix_k: take(LayerParam::FfnTimeMixK)?,
            ffn_time_mix_r: take(LayerParam::FfnTimeMixR)?,
            ffn_key: take(LayerParam::FfnKey)?,
            ffn_value: take(LayerParam::FfnValue)?,
            ffn_receptance: take(LayerParam::FfnReceptance)?,
        })
    }

    fn check(&mut self, tensor: &Tensor, dims: Dims) -> Result<()> {
        let (width, height) = match dims {
            Vector(width) if tensor.dim_count() == 1 => (width, None),
            Matrix(width, height) if tensor.dim_count() == 2 => (width, Some(height)),
            _ => {
                return Error::fail(
                    ErrorFlags::SHAPE,
                    format!("Parameter '{}' has {} dimensions, expected {:?}", tensor.name(), tensor.dim_count(), dims),
                );
            }
        };

        let width_ok = self.resolve(width, tensor.width());
        let height_ok = height.is_none_or(|height| self.resolve(height, tensor.height()));
        if !(width_ok && height_ok) {
            return Error::fail(
                ErrorFlags::DIMENSION,
                format!(
                    "Parameter '{}' is {}x{}, expected {:?} for n_embed={} n_vocab={}",
                    tensor.name(),
                    tensor.width(),
                    tensor.height(),
                    dims,
                    self.header.n_embed,
                    self.header.n_vocab
                ),
            );
        }
        Ok(())
    }

    fn resolve(&mut self, extent: Extent, actual: usize) -> bool {
        match extent {
            Embed => actual == self.header.n_embed as usize,
            Vocab => actual == self.header.n_vocab as usize,
            Ffn => actual > 0 && *self.ffn.get_or_insert(actual) == actual,
        }
    }
}
