use super::*;
use crate::graph::tests::tiny_model;

fn tiny_context(n_threads: usize) -> Context {
    Context::with_model(Arc::new(tiny_model()), n_threads, false).unwrap()
}

fn buffers(ctx: &Context) -> (Vec<f32>, Vec<f32>) {
    (vec![0.0; ctx.state_len()], vec![0.0; ctx.logits_len()])
}

#[test]
fn test_buffer_sizes() {
    let ctx = tiny_context(2);

    assert_eq!(ctx.state_len(), 5 * ctx.n_embed() * ctx.n_layer());
    assert_eq!(ctx.logits_len(), ctx.n_vocab());
    assert_eq!(ctx.n_threads(), 2);
}

#[test]
fn test_out_of_range_token_leaves_buffers_untouched() {
    let mut ctx = tiny_context(1);
    let (mut state, mut logits) = (vec![7.0; ctx.state_len()], vec![7.0; ctx.logits_len()]);

    let token = ctx.n_vocab() as u32;
    let err = ctx.eval(token, None, &mut state, Some(&mut logits)).unwrap_err();

    assert!(err.flags().contains(ErrorFlags::ARGS));
    assert!(state.iter().all(|&v| v == 7.0));
    assert!(logits.iter().all(|&v| v == 7.0));
    assert!(ctx.last_error().contains(ErrorFlags::ARGS));
    assert!(ctx.last_error().is_empty());
}

#[test]
fn test_wrong_buffer_lengths_are_rejected() {
    let mut ctx = tiny_context(1);
    let (mut state, mut logits) = buffers(&ctx);

    let mut short_state = vec![0.0; ctx.state_len() - 1];
    let err = ctx.eval(1, None, &mut short_state, None).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::ARGS | ErrorFlags::DIMENSION));

    let err = ctx.eval(1, Some(&short_state), &mut state, None).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::DIMENSION));

    let err = ctx.eval(1, None, &mut state, Some(&mut logits[1..])).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::DIMENSION));
}

#[test]
fn test_empty_sequence_and_zero_chunk_are_rejected() {
    let mut ctx = tiny_context(1);
    let (mut state, _) = buffers(&ctx);

    let err = ctx.eval_sequence(&[], None, &mut state, None).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::ARGS));

    let err = ctx.eval_sequence_in_chunks(&[1, 2, 3], 0, None, &mut state, None).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::ARGS));
}

#[test]
fn test_sequence_graph_is_rebuilt_on_length_change() {
    let mut ctx = tiny_context(2);
    let (mut state, mut logits) = buffers(&ctx);

    assert!(ctx.sequence.is_none());
    ctx.eval_sequence(&[1, 2, 3], None, &mut state, Some(&mut logits)).unwrap();
    assert_eq!(ctx.sequence.as_ref().map(Graph::token_count), Some(3));

    ctx.eval_sequence(&[4], Some(&state.clone()), &mut state, None).unwrap();
    assert_eq!(ctx.sequence.as_ref().map(Graph::token_count), Some(3));

    ctx.eval_sequence(&[5, 6], None, &mut state, None).unwrap();
    assert_eq!(ctx.sequence.as_ref().map(Graph::token_count), Some(2));
}

#[test]
fn test_chunked_matches_token_by_token() {
    let mut ctx = tiny_context(3);
    let tokens: Vec<u32> = (0..11).map(|i| (i * 7 % 64) as u32).collect();

    let mut serial_state: Option<Vec<f32>> = None;
    let mut serial_logits = vec![0.0; ctx.logits_len()];
    for &token in &tokens {
        let mut next = vec![0.0; ctx.state_len()];
        ctx.eval(token, serial_state.as_deref(), &mut next, Some(&mut serial_logits)).unwrap();
        serial_state = Some(next);
    }

    for chunk_size in [1, 4, 11, 32] {
        let (mut state, mut logits) = buffers(&ctx);
        ctx.eval_sequence_in_chunks(&tokens, chunk_size, None, &mut state, Some(&mut logits)).unwrap();
        assert_eq!(serial_state.as_deref(), Some(state.as_slice()), "chunk size {chunk_size}");
        assert_eq!(serial_logits, logits, "chunk size {chunk_size}");
    }
}

#[test]
fn test_thread_count_does_not_change_results() {
    let mut single = tiny_context(1);
    let mut multi = single.clone_context(4).unwrap();
    let (mut state_a, mut logits_a) = buffers(&single);
    let (mut state_b, mut logits_b) = buffers(&multi);

    single.eval_sequence(&[10, 20, 30], None, &mut state_a, Some(&mut logits_a)).unwrap();
    multi.eval_sequence(&[10, 20, 30], None, &mut state_b, Some(&mut logits_b)).unwrap();

    assert_eq!(state_a, state_b);
    assert_eq!(logits_a, logits_b);
}

#[test]
fn test_clone_shares_weights_and_print_toggle() {
    let mut ctx = tiny_context(1);
    ctx.set_print_errors(true);

    let clone = ctx.clone_context(2).unwrap();
    assert!(Arc::ptr_eq(ctx.model(), clone.model()));
    assert!(clone.print_errors());
    assert_eq!(Arc::strong_count(ctx.model()), 2);

    drop(clone);
    assert_eq!(Arc::strong_count(ctx.model()), 1);
}

#[test]
fn test_init_state_and_gpu_offload() {
    let mut ctx = tiny_context(1);
    let (mut state, _) = buffers(&ctx);

    ctx.init_state(&mut state).unwrap();
    let slots = ctx.state_layout().layer_slots(0);
    assert!(state[slots.att_pp.range()].iter().all(|&v| v == crate::state::PP_INIT));
    assert!(state[slots.att_aa.range()].iter().all(|&v| v == 0.0));

    assert!(!ctx.gpu_offload_layers(0).unwrap());
    assert!(!ctx.gpu_offload_layers(ctx.n_layer()).unwrap());
    let err = ctx.gpu_offload_layers(ctx.n_layer() + 1).unwrap_err();
    assert_eq!(err.flags(), ErrorFlags::ARGS);
    assert_eq!(ctx.last_error(), ErrorFlags::ARGS);
    assert!(ctx.init_state(&mut state[1..]).is_err());
}
