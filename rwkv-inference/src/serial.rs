//! Single-token graph: one token id plus the previous state in, logits plus the
//! next state out.
//!
//! The state input node and its per-layer views are created once with the graph
//! and reused by every evaluation.

use crate::error::{Error, ErrorFlags, Result};
use crate::graph::{Graph, GraphBuilder, GraphOutputs};
use crate::layers::{build_blocks, build_head};
use crate::model::Model;

fn serial_template(b: &mut GraphBuilder<'_>) -> Result<GraphOutputs> {
    if b.token_count() != 1 {
        return Error::fail(ErrorFlags::GRAPH, format!("Serial graph takes one token, got {}", b.token_count()));
    }

    let model = b.model();
    let state_len = crate::state::StateLayout::new(model.n_embed(), model.n_layer()).len();

    let state_in = b.input(state_len, 1)?;
    let (x, state_out) = build_blocks(b, state_in)?;

    let pre_logits = b.node_count();
    let logits = build_head(b, x)?;

    Ok(GraphOutputs { state_in, state_out, pre_logits, logits })
}

pub(crate) fn build_serial_graph(model: &Model) -> Result<Graph> {
    Graph::build(model, 1, serial_template)
}
