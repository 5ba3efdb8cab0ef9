//! Chunk graph: `T` token ids in, logits of the last token plus the next state out.
//!
//! Every projection is computed once for all `T` rows. The WKV recurrence is still
//! unrolled into `T` chained steps, so the arithmetic per token matches the
//! single-token graph exactly and both paths produce bit-identical state.

use crate::error::{Error, ErrorFlags, Result};
use crate::graph::{Graph, GraphBuilder, GraphOutputs};
use crate::layers::{build_blocks, build_head, last_row};
use crate::model::Model;
use crate::state::StateLayout;

fn sequence_template(b: &mut GraphBuilder<'_>) -> Result<GraphOutputs> {
    let model = b.model();
    let state_len = StateLayout::new(model.n_embed(), model.n_layer()).len();

    let state_in = b.input(state_len, 1)?;
    let (x, state_out) = build_blocks(b, state_in)?;

    // Only the last token's logits are produced.
    let pre_logits = b.node_count();
    let last = last_row(b, x)?;
    let logits = build_head(b, last)?;

    Ok(GraphOutputs { state_in, state_out, pre_logits, logits })
}

/// Measures and builds the chunk graph for `token_count` tokens.
pub(crate) fn build_sequence_graph(model: &Model, token_count: usize) -> Result<Graph> {
    if token_count == 0 {
        return Error::fail(ErrorFlags::ARGS | ErrorFlags::GRAPH, "Sequence graph needs at least one token");
    }
    Graph::build(model, token_count, sequence_template)
}
