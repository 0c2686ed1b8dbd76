use graphtrans::gradients::{clip_gradients, compute_grad_norm};
use graphtrans::optimizer::{adamw_update, AdamWOptimizer};
use graphtrans::{BatchedGraph, GraphTrans, ModelConfig, ModelError, Tensor};

fn inputs(h: usize) -> (BatchedGraph, Tensor, Tensor, Tensor, Tensor) {
    let graph = BatchedGraph::batch(&[
        BatchedGraph::from_relations(2, &[(0, 1)]).unwrap(),
        BatchedGraph::from_relations(2, &[(1, 0)]).unwrap(),
    ])
    .unwrap();
    let fill = |n: usize, step: f32| -> Vec<f32> {
        (0..n).map(|i| ((i * 5 % 11) as f32 - 5.0) * step).collect()
    };
    let ent = Tensor::new(fill(2 * 2 * h, 0.1), vec![2, 2, h]);
    let rel = Tensor::new(fill(2 * 3 * h, 0.07), vec![2, 3, h]);
    (graph, ent, Tensor::zeros(vec![2, 2]), rel, Tensor::zeros(vec![2, 3]))
}

/// 0.5 * ||g_root - target||², and its gradient
fn root_loss(g_root: &Tensor, target: &Tensor) -> (f32, Tensor) {
    let diff = g_root.sub(target);
    let loss = 0.5 * diff.data.iter().map(|d| d * d).sum::<f32>();
    (loss, diff)
}

#[test]
fn test_adamw_reduces_root_regression_loss() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = ModelConfig::tiny();
    let h = config.nhid;
    let mut model = GraphTrans::new(&config).unwrap();
    let mut optimizer = AdamWOptimizer::new(&model);
    let (graph, ent, ent_mask, rel, rel_mask) = inputs(h);
    let target = Tensor::new(
        (0..2 * h).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect(),
        vec![2, h],
    );

    let mut losses = Vec::new();
    for _ in 0..60 {
        let (g_ent, g_root, cache) = model
            .forward(&ent, &ent_mask, &[2, 2], &rel, &rel_mask, &graph)
            .unwrap();
        let (loss, grad_root) = root_loss(&g_root, &target);
        losses.push(loss);
        let mut grads = model
            .backward(&graph, &Tensor::zeros(g_ent.shape.clone()), &grad_root, &cache)
            .unwrap();
        clip_gradients(&mut grads, 5.0);
        assert!(compute_grad_norm(&grads) <= 5.0 + 1e-3);
        adamw_update(&mut model, &grads, &mut optimizer, 2e-2, 0.0);
    }

    let first = losses[0];
    let last = *losses.last().unwrap();
    assert!(last < 0.5 * first, "loss went from {first} to {last}");
    assert_eq!(optimizer.step, 60);
}

#[test]
fn test_backward_rejects_wrong_gradient_shape() {
    let config = ModelConfig::tiny();
    let model = GraphTrans::new(&config).unwrap();
    let (graph, ent, ent_mask, rel, rel_mask) = inputs(config.nhid);
    let (g_ent, _, cache) = model
        .forward(&ent, &ent_mask, &[2, 2], &rel, &rel_mask, &graph)
        .unwrap();
    let result = model.backward(&graph, &g_ent, &Tensor::zeros(vec![1, config.nhid]), &cache);
    assert!(matches!(result, Err(ModelError::ShapeMismatch { .. })));
}

#[test]
fn test_eval_mode_is_deterministic() {
    let mut config = ModelConfig::tiny();
    config.attn_drop = 0.3;
    config.drop = 0.3;
    let mut model = GraphTrans::new(&config).unwrap();
    model.set_training(false);
    let (graph, ent, ent_mask, rel, rel_mask) = inputs(config.nhid);
    let run = |m: &GraphTrans| {
        m.forward(&ent, &ent_mask, &[2, 2], &rel, &rel_mask, &graph)
            .unwrap()
            .1
    };
    assert_eq!(run(&model), run(&model));
}
