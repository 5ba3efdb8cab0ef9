use super::*;
use crate::format::{FileHeader, StorageType};
use crate::model::parameter_shapes;
use crate::serial::build_serial_graph;
use crate::sequence::build_sequence_graph;
use crate::tensor::Tensor;
use crate::wkv::{WkvCarry, wkv_step};
use std::collections::HashMap;

const N_VOCAB: usize = 64;
const N_EMBED: usize = 32;
const N_LAYER: usize = 2;
const FFN_WIDTH: usize = 64;

fn synthetic_values(name: &str, len: usize, rng: &mut fastrand::Rng) -> Vec<f32> {
    let mut uniform = |lo: f32, hi: f32| lo + rng.f32() * (hi - lo);
    (0..len)
        .map(|_| {
            if name.contains("time_mix") {
                uniform(0.0, 1.0)
            } else if name.contains("time_decay") {
                -uniform(-1.0, 1.0).exp()
            } else if name.contains("time_first") {
                uniform(-0.5, 0.5)
            } else if name.contains("ln") && name.ends_with("weight") {
                uniform(0.9, 1.1)
            } else if name.ends_with("bias") {
                uniform(-0.05, 0.05)
            } else {
                uniform(-0.1, 0.1)
            }
        })
        .collect()
}

/// A small random f32 model assembled in memory.
pub(crate) fn tiny_model() -> Model {
    let header = FileHeader::new(N_VOCAB as u32, N_EMBED as u32, N_LAYER as u32, StorageType::F32);
    let mut rng = fastrand::Rng::with_seed(42);

    let tensors: HashMap<_, _> = parameter_shapes(&header, FFN_WIDTH)
        .into_iter()
        .map(|shape| {
            let values = synthetic_values(&shape.name, shape.width * shape.height.unwrap_or(1), &mut rng);
            let tensor = Tensor::from_f32(shape.name.clone(), shape.width, shape.height, values);
            (shape.name, tensor)
        })
        .collect();

    Model::assemble(header, tensors).unwrap()
}

fn layout(model: &Model) -> StateLayout {
    StateLayout::new(model.n_embed(), model.n_layer())
}

fn matvec(tensor: &Tensor, x: &[f32]) -> Vec<f32> {
    (0..tensor.height()).map(|row| tensor.row_dot(row, x)).collect()
}

fn norm(x: &[f32], weight: &Tensor, bias: &Tensor) -> Vec<f32> {
    let mut out = vec![0.0; x.len()];
    layer_norm(x, weight.as_f32().unwrap(), bias.as_f32().unwrap(), &mut out);
    out
}

fn mix(x: &[f32], prev: &[f32], mu: &Tensor) -> Vec<f32> {
    let mu = mu.as_f32().unwrap();
    (0..x.len()).map(|i| x[i] * mu[i] + prev[i] * (1.0 - mu[i])).collect()
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Straight-line single-token forward pass used as an oracle for the graph.
fn reference_forward(model: &Model, token: u32, state: &mut [f32]) -> Vec<f32> {
    let layout = layout(model);
    let mut x = vec![0.0; model.n_embed()];
    model.emb.row_to_f32(token as usize, &mut x);
    let mut x = norm(&x, &model.ln0_weight, &model.ln0_bias);

    for (i, layer) in model.layers.iter().enumerate() {
        let slots = layout.layer_slots(i);

        let xx = norm(&x, &layer.ln1_weight, &layer.ln1_bias);
        let prev = state[slots.att_xx.range()].to_vec();
        let r: Vec<f32> = matvec(&layer.att_receptance, &mix(&xx, &prev, &layer.att_time_mix_r)).into_iter().map(sigmoid).collect();
        let k = matvec(&layer.att_key, &mix(&xx, &prev, &layer.att_time_mix_k));
        let v = matvec(&layer.att_value, &mix(&xx, &prev, &layer.att_time_mix_v));

        let (u, w) = (layer.att_time_first.as_f32().unwrap(), layer.att_time_decay.as_f32().unwrap());
        let mut gated = vec![0.0; model.n_embed()];
        for c in 0..model.n_embed() {
            let carry = WkvCarry {
                aa: state[slots.att_aa.offset + c],
                bb: state[slots.att_bb.offset + c],
                pp: state[slots.att_pp.offset + c],
            };
            let (out, next) = wkv_step(k[c], v[c], u[c], w[c], carry);
            gated[c] = r[c] * out;
            state[slots.att_aa.offset + c] = next.aa;
            state[slots.att_bb.offset + c] = next.bb;
            state[slots.att_pp.offset + c] = next.pp;
        }
        state[slots.att_xx.range()].copy_from_slice(&xx);
        let out = matvec(&layer.att_output, &gated);
        x.iter_mut().zip(&out).for_each(|(x, o)| *x += o);

        let xx = norm(&x, &layer.ln2_weight, &layer.ln2_bias);
        let prev = state[slots.ffn_xx.range()].to_vec();
        let r: Vec<f32> = matvec(&layer.ffn_receptance, &mix(&xx, &prev, &layer.ffn_time_mix_r)).into_iter().map(sigmoid).collect();
        let k: Vec<f32> = matvec(&layer.ffn_key, &mix(&xx, &prev, &layer.ffn_time_mix_k))
            .into_iter()
            .map(|v| v.max(0.0) * v.max(0.0))
            .collect();
        let kv = matvec(&layer.ffn_value, &k);
        state[slots.ffn_xx.range()].copy_from_slice(&xx);
        x.iter_mut().zip(r.iter().zip(&kv)).for_each(|(x, (r, kv))| *x += r * kv);
    }

    let x = norm(&x, &model.ln_out_weight, &model.ln_out_bias);
    matvec(&model.head, &x)
}

fn assert_close(actual: &[f32], expected: &[f32], what: &str) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= 1e-4 * (1.0 + e.abs()), "{what}[{i}]: {a} vs {e}");
    }
}

#[test]
fn test_serial_graph_matches_reference() {
    let model = tiny_model();
    let layout = layout(&model);
    let mut graph = build_serial_graph(&model).unwrap();

    let mut expected_state = vec![0.0; layout.len()];
    layout.init(&mut expected_state);
    let mut state = expected_state.clone();

    for token in [3u32, 17, 63, 0] {
        let expected_logits = reference_forward(&model, token, &mut expected_state);

        let mut next = vec![0.0; layout.len()];
        let mut logits = vec![0.0; model.n_vocab()];
        graph.evaluate(&model, &layout, &[token], Some(&state), &mut next, Some(&mut logits));
        state = next;

        assert_close(&logits, &expected_logits, "logits");
        assert_close(&state, &expected_state, "state");
    }
}

#[test]
fn test_missing_state_uses_initial_values() {
    let model = tiny_model();
    let layout = layout(&model);
    let mut graph = build_serial_graph(&model).unwrap();

    let mut initial = vec![0.0; layout.len()];
    layout.init(&mut initial);

    let mut from_none = vec![0.0; layout.len()];
    let mut from_init = vec![0.0; layout.len()];
    graph.evaluate(&model, &layout, &[5], None, &mut from_none, None);
    graph.evaluate(&model, &layout, &[5], Some(&initial), &mut from_init, None);

    assert_eq!(from_none, from_init);
}

#[test]
fn test_skipping_logits_leaves_state_identical() {
    let model = tiny_model();
    let layout = layout(&model);
    let mut graph = build_sequence_graph(&model, 3).unwrap();

    let mut with_logits = vec![0.0; layout.len()];
    let mut without_logits = vec![0.0; layout.len()];
    let mut logits = vec![0.0; model.n_vocab()];
    graph.evaluate(&model, &layout, &[1, 2, 3], None, &mut with_logits, Some(&mut logits));
    graph.evaluate(&model, &layout, &[1, 2, 3], None, &mut without_logits, None);

    assert_eq!(with_logits, without_logits);
    assert!(logits.iter().any(|&v| v != 0.0));
}

#[test]
fn test_sequence_graph_is_bit_identical_to_serial() {
    let model = tiny_model();
    let layout = layout(&model);
    let tokens = [9u32, 8, 7, 6, 5];

    let mut serial = build_serial_graph(&model).unwrap();
    let mut state: Option<Vec<f32>> = None;
    let mut serial_logits = vec![0.0; model.n_vocab()];
    for &token in &tokens {
        let mut next = vec![0.0; layout.len()];
        serial.evaluate(&model, &layout, &[token], state.as_deref(), &mut next, Some(&mut serial_logits));
        state = Some(next);
    }

    let mut sequence = build_sequence_graph(&model, tokens.len()).unwrap();
    let mut sequence_state = vec![0.0; layout.len()];
    let mut sequence_logits = vec![0.0; model.n_vocab()];
    sequence.evaluate(&model, &layout, &tokens, None, &mut sequence_state, Some(&mut sequence_logits));

    assert_eq!(state.unwrap(), sequence_state);
    assert_eq!(serial_logits, sequence_logits);
}

#[test]
fn test_builder_rejects_mismatched_shapes() {
    let model = tiny_model();
    let mut b = GraphBuilder::new(&model, Arena::measuring(), 1);

    let a = b.input(4, 2).unwrap();
    let c = b.input(3, 1).unwrap();
    let err = b.add(a, c).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::GRAPH | ErrorFlags::DIMENSION));

    let err = b.matmul(ParamRef::Head, a).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::GRAPH));

    let err = b.param(ParamRef::Head).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::DATA_TYPE));

    let err = b.view(a, 6, 4, 1).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::DIMENSION));
}

#[test]
fn test_broadcast_and_concat() {
    let model = tiny_model();
    let template = |b: &mut GraphBuilder<'_>| -> Result<GraphOutputs> {
        let state_in = b.input(4, 2)?;
        let row = b.row_view(state_in, 1, 1)?;
        let sum = b.add(state_in, row)?;
        let stacked = b.concat(&[row, sum])?;
        Ok(GraphOutputs { state_in, state_out: Vec::new(), pre_logits: b.node_count(), logits: stacked })
    };

    let mut graph = Graph::build(&model, 1, template).unwrap();
    let range = graph.arena_range(graph.outputs.state_in);
    graph.arena.data_mut()[range].copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]);
    for id in 0..graph.nodes.len() {
        graph.compute(&model, id);
    }

    let range = graph.arena_range(graph.outputs.logits);
    assert_eq!(
        &graph.arena.data()[range],
        &[10.0, 20.0, 30.0, 40.0, 11.0, 22.0, 33.0, 44.0, 20.0, 40.0, 60.0, 80.0]
    );
}
