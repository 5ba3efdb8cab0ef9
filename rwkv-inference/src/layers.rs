use crate::error::Result;
use crate::graph::{GraphBuilder, NodeId};
use crate::model::{LayerParam, ParamRef};
use crate::state::LayerState;

/// Token-shift interpolation between the current and the previous normalized input.
///
/// **Formula**: `mixed = x * μ + x_prev * (1 - μ)`, per channel.
fn token_shift(b: &mut GraphBuilder<'_>, x: NodeId, prev: NodeId, mix: ParamRef) -> Result<NodeId> {
    let mix = b.param(mix)?;
    let keep = b.one_minus(mix)?;
    let current = b.mul(x, mix)?;
    let previous = b.mul(prev, keep)?;
    b.add(current, previous)
}

/// Rows of `xx` shifted down by one, with `carry` in row 0.
///
/// Row `t` of the result is the normalized input that preceded row `t` of `xx`.
fn shifted(b: &mut GraphBuilder<'_>, xx: NodeId, carry: NodeId) -> Result<NodeId> {
    let rows = b.rows(xx);
    if rows == 1 {
        return Ok(carry);
    }
    let head = b.row_view(xx, 0, rows - 1)?;
    b.concat(&[carry, head])
}

pub(crate) fn last_row(b: &mut GraphBuilder<'_>, x: NodeId) -> Result<NodeId> {
    let rows = b.rows(x);
    if rows == 1 { Ok(x) } else { b.row_view(x, rows - 1, 1) }
}

/// New values of the five carries after one layer.
pub(crate) type LayerCarry = LayerState<NodeId>;

/// Time-mixing block: RWKV's replacement for attention.
///
/// **Steps** (per row `t` of the input):
/// ```text
/// xx  = LayerNorm(x)
/// r   = σ(W_r · mix(xx, xx_prev, μ_r))
/// k   = W_k · mix(xx, xx_prev, μ_k)
/// v   = W_v · mix(xx, xx_prev, μ_v)
/// wkv = WKV(k, v, u, w; aa, bb, pp)
/// out = x + W_o · (r ⊙ wkv)
/// ```
///
/// Projections run once over all rows; the WKV step runs row after row because each
/// step consumes the carry produced by the previous one.
pub(crate) struct TimeMixing {
    layer: usize,
}

impl TimeMixing {
    pub fn new(layer: usize) -> Self {
        Self { layer }
    }

    fn param(&self, param: LayerParam) -> ParamRef {
        ParamRef::Layer(self.layer, param)
    }

    /// Returns the block output and the updated `att_*` carries.
    pub fn build(&self, b: &mut GraphBuilder<'_>, x: NodeId, state: &LayerState<NodeId>) -> Result<(NodeId, LayerCarry)> {
        let xx = b.layer_norm(x, self.param(LayerParam::Ln1Weight), self.param(LayerParam::Ln1Bias))?;
        let prev = shifted(b, xx, state.att_xx)?;

        let xk = token_shift(b, xx, prev, self.param(LayerParam::AttTimeMixK))?;
        let xv = token_shift(b, xx, prev, self.param(LayerParam::AttTimeMixV))?;
        let xr = token_shift(b, xx, prev, self.param(LayerParam::AttTimeMixR))?;

        let r = b.matmul(self.param(LayerParam::AttReceptance), xr)?;
        let r = b.sigmoid(r)?;
        let k = b.matmul(self.param(LayerParam::AttKey), xk)?;
        let v = b.matmul(self.param(LayerParam::AttValue), xv)?;

        let time_first = b.param(self.param(LayerParam::AttTimeFirst))?;
        let time_decay = b.param(self.param(LayerParam::AttTimeDecay))?;

        let (mut aa, mut bb, mut pp) = (state.att_aa, state.att_bb, state.att_pp);
        let mut outputs = Vec::with_capacity(b.rows(x));
        for t in 0..b.rows(x) {
            let k_t = b.row_view(k, t, 1)?;
            let v_t = b.row_view(v, t, 1)?;
            let step = b.wkv(k_t, v_t, time_first, time_decay, aa, bb, pp)?;

            outputs.push(b.row_view(step, 0, 1)?);
            aa = b.row_view(step, 1, 1)?;
            bb = b.row_view(step, 2, 1)?;
            pp = b.row_view(step, 3, 1)?;
        }
        let wkv = b.concat(&outputs)?;

        let gated = b.mul(r, wkv)?;
        let projected = b.matmul(self.param(LayerParam::AttOutput), gated)?;
        let out = b.add(x, projected)?;

        let att_xx = last_row(b, xx)?;
        Ok((out, LayerState { ffn_xx: state.ffn_xx, att_xx, att_aa: aa, att_bb: bb, att_pp: pp }))
    }
}

/// Channel-mixing block: a gated feed-forward network with a squared ReLU.
///
/// **Steps** (per row):
/// ```text
/// xx  = LayerNorm(x)
/// r   = σ(W_r · mix(xx, xx_prev, μ_r))
/// k   = ReLU(W_k · mix(xx, xx_prev, μ_k))²
/// out = x + r ⊙ (W_v · k)
/// ```
pub(crate) struct ChannelMixing {
    layer: usize,
}

impl ChannelMixing {
    pub fn new(layer: usize) -> Self {
        Self { layer }
    }

    fn param(&self, param: LayerParam) -> ParamRef {
        ParamRef::Layer(self.layer, param)
    }

    /// Returns the block output and the last normalized row, the new `ffn_xx`.
    pub fn build(&self, b: &mut GraphBuilder<'_>, x: NodeId, ffn_xx: NodeId) -> Result<(NodeId, NodeId)> {
        let xx = b.layer_norm(x, self.param(LayerParam::Ln2Weight), self.param(LayerParam::Ln2Bias))?;
        let prev = shifted(b, xx, ffn_xx)?;

        let xk = token_shift(b, xx, prev, self.param(LayerParam::FfnTimeMixK))?;
        let xr = token_shift(b, xx, prev, self.param(LayerParam::FfnTimeMixR))?;

        let r = b.matmul(self.param(LayerParam::FfnReceptance), xr)?;
        let r = b.sigmoid(r)?;

        let k = b.matmul(self.param(LayerParam::FfnKey), xk)?;
        let k = b.relu(k)?;
        let k = b.sqr(k)?;
        let kv = b.matmul(self.param(LayerParam::FfnValue), k)?;

        let gated = b.mul(r, kv)?;
        let out = b.add(x, gated)?;

        Ok((out, last_row(b, xx)?))
    }
}

/// Views of one layer's five carries inside the state input node.
pub(crate) fn state_views(b: &mut GraphBuilder<'_>, state: NodeId, layer: usize) -> Result<LayerState<NodeId>> {
    let n_embed = b.model().n_embed();
    let layout = crate::state::StateLayout::new(n_embed, b.model().n_layer());
    let slots = layout.layer_slots(layer);

    Ok(LayerState {
        ffn_xx: b.view(state, slots.ffn_xx.offset, n_embed, 1)?,
        att_xx: b.view(state, slots.att_xx.offset, n_embed, 1)?,
        att_aa: b.view(state, slots.att_aa.offset, n_embed, 1)?,
        att_bb: b.view(state, slots.att_bb.offset, n_embed, 1)?,
        att_pp: b.view(state, slots.att_pp.offset, n_embed, 1)?,
    })
}

/// Embedding lookup, `ln0`, then every block. Shared by both graph shapes.
pub(crate) fn build_blocks(b: &mut GraphBuilder<'_>, state: NodeId) -> Result<(NodeId, Vec<LayerCarry>)> {
    let x = b.get_rows(ParamRef::Emb)?;
    let mut x = b.layer_norm(x, ParamRef::Ln0Weight, ParamRef::Ln0Bias)?;

    let n_layer = b.model().n_layer();
    let mut carries = Vec::with_capacity(n_layer);
    for layer in 0..n_layer {
        let views = state_views(b, state, layer)?;
        let (after_att, mut carry) = TimeMixing::new(layer).build(b, x, &views)?;
        let (after_ffn, ffn_xx) = ChannelMixing::new(layer).build(b, after_att, views.ffn_xx)?;
        carry.ffn_xx = ffn_xx;
        carries.push(carry);
        x = after_ffn;
    }

    Ok((x, carries))
}

/// Final normalization and vocabulary projection.
pub(crate) fn build_head(b: &mut GraphBuilder<'_>, x: NodeId) -> Result<NodeId> {
    let x = b.layer_norm(x, ParamRef::LnOutWeight, ParamRef::LnOutBias)?;
    b.matmul(ParamRef::Head, x)
}
