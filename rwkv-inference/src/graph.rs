//! A fixed dataflow graph over arena-resident f32 activations.
//!
//! Nodes are appended in topological order and each one's output is bump-allocated
//! from the arena, so every input of a node lives at a lower offset than its output.
//! Execution walks the node list once; work inside a node is spread over the
//! current rayon pool, element by element, so results do not depend on thread count.

use crate::arena::{Arena, ArenaPlan};
use crate::error::{Error, ErrorFlags, Result, ResultExt};
use crate::model::{Model, ParamRef};
use crate::state::{LayerState, StateLayout};
use crate::wkv::{WkvInputs, wkv_rows};
use log::debug;
use rayon::prelude::*;

pub(crate) type NodeId = usize;

const LAYER_NORM_EPS: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    OneMinus,
    Sigmoid,
    Relu,
    Sqr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Mul,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    /// Filled by the caller before each run.
    Input,
    /// A 1-D model weight, read in place.
    Param,
    /// Alias into another node's memory.
    View,
    /// One embedding row per input token.
    GetRows { table: ParamRef },
    LayerNorm { x: NodeId, weight: NodeId, bias: NodeId },
    Unary(UnaryOp, NodeId),
    /// The right operand may be a single row, broadcast over the left one's rows.
    Binary(BinaryOp, NodeId, NodeId),
    /// `x · weightᵀ`: one output column per weight row.
    MatMul { weight: ParamRef, x: NodeId },
    /// Rows of all parts, stacked in order.
    Concat(Vec<NodeId>),
    /// One recurrence step; output rows are `[wkv, aa', bb', pp']`.
    Wkv { k: NodeId, v: NodeId, time_first: NodeId, time_decay: NodeId, aa: NodeId, bb: NodeId, pp: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Arena { offset: usize },
    Param(ParamRef),
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    op: Op,
    width: usize,
    rows: usize,
    storage: Storage,
}

impl Node {
    fn len(&self) -> usize {
        self.width * self.rows
    }
}

/// Appends nodes to a graph under construction.
pub(crate) struct GraphBuilder<'m> {
    model: &'m Model,
    arena: Arena,
    nodes: Vec<Node>,
    token_count: usize,
}

impl<'m> GraphBuilder<'m> {
    fn new(model: &'m Model, arena: Arena, token_count: usize) -> Self {
        Self { model, arena, nodes: Vec::new(), token_count }
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn width(&self, id: NodeId) -> usize {
        self.nodes[id].width
    }

    pub fn rows(&self, id: NodeId) -> usize {
        self.nodes[id].rows
    }

    fn push(&mut self, op: Op, width: usize, rows: usize) -> Result<NodeId> {
        let offset = self.arena.alloc(width * rows).flag(ErrorFlags::GRAPH)?;
        self.nodes.push(Node { op, width, rows, storage: Storage::Arena { offset } });
        Ok(self.nodes.len() - 1)
    }

    fn ensure(&self, condition: bool, message: impl FnOnce() -> String) -> Result<()> {
        if condition { Ok(()) } else { Error::fail(ErrorFlags::GRAPH | ErrorFlags::DIMENSION, message()) }
    }

    pub fn input(&mut self, width: usize, rows: usize) -> Result<NodeId> {
        self.push(Op::Input, width, rows)
    }

    /// Exposes a 1-D f32 weight as a single-row node.
    pub fn param(&mut self, param: ParamRef) -> Result<NodeId> {
        let tensor = self.model.param(param);
        if tensor.as_f32().is_none() || tensor.dim_count() != 1 {
            return Error::fail(
                ErrorFlags::GRAPH | ErrorFlags::DATA_TYPE,
                format!("Parameter '{}' cannot be used as an elementwise operand", tensor.name()),
            );
        }
        self.nodes.push(Node { op: Op::Param, width: tensor.width(), rows: 1, storage: Storage::Param(param) });
        Ok(self.nodes.len() - 1)
    }

    /// `rows` rows of `width` elements starting `offset` elements into `src`.
    pub fn view(&mut self, src: NodeId, offset: usize, width: usize, rows: usize) -> Result<NodeId> {
        let source = &self.nodes[src];
        self.ensure(offset + width * rows <= source.len(), || {
            format!("View of {}x{} at {offset} exceeds source {}x{}", width, rows, source.width, source.rows)
        })?;

        let storage = match source.storage {
            Storage::Arena { offset: base } => Storage::Arena { offset: base + offset },
            Storage::Param(_) => return Error::fail(ErrorFlags::GRAPH, "Views of parameters are not supported"),
        };
        self.nodes.push(Node { op: Op::View, width, rows, storage });
        Ok(self.nodes.len() - 1)
    }

    pub fn row_view(&mut self, src: NodeId, row: usize, rows: usize) -> Result<NodeId> {
        let width = self.width(src);
        self.view(src, row * width, width, rows)
    }

    pub fn get_rows(&mut self, table: ParamRef) -> Result<NodeId> {
        let width = self.model.param(table).width();
        self.push(Op::GetRows { table }, width, self.token_count)
    }

    pub fn layer_norm(&mut self, x: NodeId, weight: ParamRef, bias: ParamRef) -> Result<NodeId> {
        let weight = self.param(weight)?;
        let bias = self.param(bias)?;
        let width = self.width(x);
        self.ensure(self.width(weight) == width && self.width(bias) == width, || {
            format!("Layer norm of width {width} with mismatched weight or bias")
        })?;
        self.push(Op::LayerNorm { x, weight, bias }, width, self.rows(x))
    }

    pub fn unary(&mut self, op: UnaryOp, x: NodeId) -> Result<NodeId> {
        self.push(Op::Unary(op, x), self.width(x), self.rows(x))
    }

    pub fn one_minus(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryOp::OneMinus, x)
    }

    pub fn sigmoid(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryOp::Sigmoid, x)
    }

    pub fn relu(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryOp::Relu, x)
    }

    pub fn sqr(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(UnaryOp::Sqr, x)
    }

    pub fn binary(&mut self, op: BinaryOp, a: NodeId, b: NodeId) -> Result<NodeId> {
        let (width, rows) = (self.width(a), self.rows(a));
        self.ensure(self.width(b) == width && (self.rows(b) == rows || self.rows(b) == 1), || {
            format!("Cannot broadcast {}x{} onto {width}x{rows}", self.width(b), self.rows(b))
        })?;
        self.push(Op::Binary(op, a, b), width, rows)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn matmul(&mut self, weight: ParamRef, x: NodeId) -> Result<NodeId> {
        let tensor = self.model.param(weight);
        let (in_width, out_width) = (tensor.width(), tensor.height());
        self.ensure(self.width(x) == in_width, || {
            format!("Matrix '{}' expects width {in_width}, input has {}", tensor.name(), self.width(x))
        })?;
        self.push(Op::MatMul { weight, x }, out_width, self.rows(x))
    }

    /// Stacks rows; a single part is returned as is.
    pub fn concat(&mut self, parts: &[NodeId]) -> Result<NodeId> {
        let Some(&first) = parts.first() else {
            return Error::fail(ErrorFlags::GRAPH, "Cannot concatenate zero tensors");
        };
        if parts.len() == 1 {
            return Ok(first);
        }

        let width = self.width(first);
        self.ensure(parts.iter().all(|&part| self.width(part) == width), || {
            format!("Concatenated tensors must all have width {width}")
        })?;
        let rows = parts.iter().map(|&part| self.rows(part)).sum();
        self.push(Op::Concat(parts.to_vec()), width, rows)
    }

    /// One WKV step over single-row operands; returns the 4-row output node.
    #[allow(clippy::too_many_arguments)]
    pub fn wkv(
        &mut self,
        k: NodeId,
        v: NodeId,
        time_first: NodeId,
        time_decay: NodeId,
        aa: NodeId,
        bb: NodeId,
        pp: NodeId,
    ) -> Result<NodeId> {
        let width = self.width(k);
        let operands = [k, v, time_first, time_decay, aa, bb, pp];
        self.ensure(operands.iter().all(|&id| self.width(id) == width && self.rows(id) == 1), || {
            format!("WKV operands must all be single rows of width {width}")
        })?;
        self.push(Op::Wkv { k, v, time_first, time_decay, aa, bb, pp }, width, 4)
    }

    fn plan(&self) -> ArenaPlan {
        self.arena.plan(self.nodes.len(), size_of::<Node>())
    }
}

/// Where a template's results live.
#[derive(Debug, Clone)]
pub(crate) struct GraphOutputs {
    pub state_in: NodeId,
    pub state_out: Vec<LayerState<NodeId>>,
    /// Node count before the logits tail.
    pub pre_logits: usize,
    pub logits: NodeId,
}

/// A built graph with its own activation arena.
#[derive(Debug)]
pub(crate) struct Graph {
    nodes: Vec<Node>,
    arena: Arena,
    plan: ArenaPlan,
    tokens: Vec<u32>,
    outputs: GraphOutputs,
}

impl Graph {
    /// Runs `template` once to measure, then again against a right-sized arena.
    pub fn build<F>(model: &Model, token_count: usize, template: F) -> Result<Self>
    where
        F: Fn(&mut GraphBuilder<'_>) -> Result<GraphOutputs>,
    {
        let mut measuring = GraphBuilder::new(model, Arena::measuring(), token_count);
        template(&mut measuring)?;
        let plan = measuring.plan();

        debug!(
            "Graph for {token_count} token(s): {} nodes, {:.2} MiB arena ({} floats padding)",
            plan.node_count,
            plan.total_bytes() as f64 / (1024.0 * 1024.0),
            plan.padding_floats
        );

        let mut builder = GraphBuilder::new(model, Arena::with_plan(&plan).flag(ErrorFlags::GRAPH)?, token_count);
        debug_assert!(!builder.arena.is_measuring());
        let outputs = template(&mut builder)?;

        Ok(Self { nodes: builder.nodes, arena: builder.arena, plan, tokens: vec![0; token_count], outputs })
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn plan(&self) -> &ArenaPlan {
        &self.plan
    }

    /// Loads inputs, runs the graph and copies results out.
    ///
    /// Arguments are validated by the caller; the logits tail is skipped when
    /// `logits_out` is `None`.
    pub fn evaluate(
        &mut self,
        model: &Model,
        layout: &StateLayout,
        tokens: &[u32],
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) {
        debug_assert_eq!(tokens.len(), self.tokens.len());
        self.tokens.copy_from_slice(tokens);

        let state = self.arena_range(self.outputs.state_in);
        match state_in {
            Some(values) => self.arena.data_mut()[state].copy_from_slice(values),
            None => layout.init(&mut self.arena.data_mut()[state]),
        }

        let end = if logits_out.is_some() { self.nodes.len() } else { self.outputs.pre_logits };
        for id in 0..end {
            self.compute(model, id);
        }

        for (layer, nodes) in self.outputs.state_out.iter().enumerate() {
            let slots = layout.layer_slots(layer);
            for field in crate::state::StateField::ALL {
                let range = self.arena_range(nodes.get(field));
                state_out[slots.get(field).range()].copy_from_slice(&self.arena.data()[range]);
            }
        }

        if let Some(logits) = logits_out {
            let range = self.arena_range(self.outputs.logits);
            logits.copy_from_slice(&self.arena.data()[range]);
        }
    }

    fn arena_range(&self, id: NodeId) -> std::ops::Range<usize> {
        let node = &self.nodes[id];
        match node.storage {
            Storage::Arena { offset } => offset..offset + node.len(),
            Storage::Param(_) => 0..0,
        }
    }

    fn compute(&mut self, model: &Model, id: NodeId) {
        let node = &self.nodes[id];
        let Storage::Arena { offset } = node.storage else { return };
        if matches!(node.op, Op::Input | Op::View | Op::Param) {
            return;
        }

        let (before, after) = self.arena.data_mut().split_at_mut(offset);
        let before: &[f32] = before;
        let out = &mut after[..node.len()];
        let nodes = &self.nodes;

        let read = |id: NodeId| -> &[f32] {
            let input = &nodes[id];
            match input.storage {
                Storage::Arena { offset } => {
                    debug_assert!(offset + input.len() <= before.len(), "input must precede output");
                    &before[offset..offset + input.len()]
                }
                Storage::Param(param) => model.param(param).as_f32().unwrap_or_default(),
            }
        };

        match &node.op {
            Op::Input | Op::View | Op::Param => {}
            Op::GetRows { table } => {
                let table = model.param(*table);
                out.par_chunks_mut(node.width)
                    .zip(self.tokens.par_iter())
                    .for_each(|(row, &token)| table.row_to_f32(token as usize, row));
            }
            Op::LayerNorm { x, weight, bias } => {
                let (weight, bias) = (read(*weight), read(*bias));
                out.par_chunks_mut(node.width)
                    .zip(read(*x).par_chunks(node.width))
                    .for_each(|(out, x)| layer_norm(x, weight, bias, out));
            }
            Op::Unary(op, x) => {
                let f: fn(f32) -> f32 = match op {
                    UnaryOp::OneMinus => |v| 1.0 - v,
                    UnaryOp::Sigmoid => |v| 1.0 / (1.0 + (-v).exp()),
                    UnaryOp::Relu => |v| v.max(0.0),
                    UnaryOp::Sqr => |v| v * v,
                };
                out.par_iter_mut().zip(read(*x).par_iter()).for_each(|(o, &v)| *o = f(v));
            }
            Op::Binary(op, a, b) => {
                let f: fn(f32, f32) -> f32 = match op {
                    BinaryOp::Add => |a, b| a + b,
                    BinaryOp::Mul => |a, b| a * b,
                };
                let (a, b) = (read(*a), read(*b));
                out.par_iter_mut().enumerate().for_each(|(i, o)| *o = f(a[i], b[i % b.len()]));
            }
            Op::MatMul { weight, x } => {
                let weight = model.param(*weight);
                let x = read(*x);
                let in_width = weight.width();
                out.par_iter_mut().enumerate().for_each(|(i, o)| {
                    let (row, column) = (i / node.width, i % node.width);
                    *o = weight.row_dot(column, &x[row * in_width..(row + 1) * in_width]);
                });
            }
            Op::Concat(parts) => {
                let mut start = 0;
                for &part in parts {
                    let values = read(part);
                    out[start..start + values.len()].copy_from_slice(values);
                    start += values.len();
                }
            }
            Op::Wkv { k, v, time_first, time_decay, aa, bb, pp } => {
                let inputs = WkvInputs {
                    k: read(*k),
                    v: read(*v),
                    time_first: read(*time_first),
                    time_decay: read(*time_decay),
                    aa: read(*aa),
                    bb: read(*bb),
                    pp: read(*pp),
                };
                wkv_rows(&inputs, out);
            }
        }
    }
}

fn layer_norm(x: &[f32], weight: &[f32], bias: &[f32], out: &mut [f32]) {
    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    let variance = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let scale = 1.0 / (variance + LAYER_NORM_EPS).sqrt();

    for (i, o) in out.iter_mut().enumerate() {
        *o = (x[i] - mean) * scale * weight[i] + bias[i];
    }
}

#[cfg(test)]
#[path = "../tests/unit/graph_test.rs"]
pub(crate) mod tests;
