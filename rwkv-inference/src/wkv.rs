//! The WKV recurrence: a log-domain running weighted average of values.
//!
//! The carry `(aa, bb, pp)` holds numerator, denominator and the log of their
//! common scale, so exponentials never see unbounded arguments. The operation
//! order below is load-bearing: reordering the max/exp steps changes the bits of
//! the result and can overflow on degenerate inputs.

use rayon::prelude::*;

/// Recurrent carry of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WkvCarry {
    pub aa: f32,
    pub bb: f32,
    pub pp: f32,
}

/// One step for one channel. `u` is the bonus of the current token (time_first),
/// `w` the per-step log decay (time_decay, already negative).
#[inline]
pub fn wkv_step(k: f32, v: f32, u: f32, w: f32, carry: WkvCarry) -> (f32, WkvCarry) {
    let WkvCarry { aa, bb, pp } = carry;

    let ww = u + k;
    let qq = pp.max(ww);
    let e1 = (pp - qq).exp();
    let e2 = (ww - qq).exp();
    let numerator = e1 * aa + e2 * v;
    let denominator = e1 * bb + e2;

    let ww = pp + w;
    let qq = ww.max(k);
    let e1 = (ww - qq).exp();
    let e2 = (k - qq).exp();
    let next = WkvCarry { aa: e1 * aa + e2 * v, bb: e1 * bb + e2, pp: qq };

    (numerator / denominator, next)
}

/// Inputs of one step across all channels.
pub(crate) struct WkvInputs<'a> {
    pub k: &'a [f32],
    pub v: &'a [f32],
    pub time_first: &'a [f32],
    pub time_decay: &'a [f32],
    pub aa: &'a [f32],
    pub bb: &'a [f32],
    pub pp: &'a [f32],
}

/// Runs one step over every channel, writing `[wkv | aa' | bb' | pp']` into `out`.
pub(crate) fn wkv_rows(inputs: &WkvInputs<'_>, out: &mut [f32]) {
    let n = inputs.k.len();
    debug_assert_eq!(out.len(), 4 * n);

    let (wkv, rest) = out.split_at_mut(n);
    let (aa, rest) = rest.split_at_mut(n);
    let (bb, pp) = rest.split_at_mut(n);

    wkv.par_iter_mut()
        .zip(aa.par_iter_mut())
        .zip(bb.par_iter_mut())
        .zip(pp.par_iter_mut())
        .enumerate()
        .for_each(|(i, (((wkv, aa), bb), pp))| {
            let carry = WkvCarry { aa: inputs.aa[i], bb: inputs.bb[i], pp: inputs.pp[i] };
            let (value, next) = wkv_step(inputs.k[i], inputs.v[i], inputs.time_first[i], inputs.time_decay[i], carry);
            *wkv = value;
            *aa = next.aa;
            *bb = next.bb;
            *pp = next.pp;
        });
}
