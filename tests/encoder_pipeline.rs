use approx::assert_abs_diff_eq;
use graphtrans::utils::pad;
use graphtrans::{
    AttentionMode, BatchedGraph, BiLstmEncoder, EncoderMode, GraphEncoder, GraphTrans,
    ModelConfig, MultiHeadAttention, NodeType, SeedStream, Tensor,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ramp(shape: Vec<usize>, step: f32) -> Tensor {
    let n: usize = shape.iter().product();
    Tensor::new((0..n).map(|i| ((i * 7 % 17) as f32 - 8.0) * step).collect(), shape)
}

/// Two samples: (3 entities, relations 0->1 and 2->0) and (1 entity, none).
fn sample_graphs() -> BatchedGraph {
    BatchedGraph::batch(&[
        BatchedGraph::from_relations(3, &[(0, 1), (2, 0)]).unwrap(),
        BatchedGraph::from_relations(1, &[]).unwrap(),
    ])
    .unwrap()
}

#[test]
fn test_entities_to_graph_to_copy_attention() {
    init_logger();
    let config = ModelConfig::tiny();
    let h = config.nhid;
    let ent_len = [3usize, 1];

    // Four entity names of up to 3 tokens each
    let tokens = ramp(vec![4, 3, h], 0.05);
    let token_mask = Tensor::new(
        vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        vec![4, 3],
    );
    let ent_encoder = BiLstmEncoder::new(&config, EncoderMode::Entity).unwrap();
    let ent = ent_encoder.forward(&tokens, &token_mask, Some(&ent_len)).unwrap();
    assert_eq!(ent.shape, vec![2, 3, h]);
    let ent_mask = Tensor::new(vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0], vec![2, 3]);

    // Root + 2 relations x 2 directions, and a root alone
    let rel = ramp(vec![2, 5, h], 0.03);
    let mut rel_mask = Tensor::zeros(vec![2, 5]);
    for v in &mut rel_mask.data[6..] {
        *v = 1.0;
    }

    let graph = sample_graphs();
    let model = GraphTrans::new(&config).unwrap();
    let (g_ent, g_root, _) = model
        .forward(&ent, &ent_mask, &ent_len, &rel, &rel_mask, &graph)
        .unwrap();
    assert_eq!(g_root.shape, vec![graph.batch_size(), h]);
    assert_eq!(g_ent.shape, vec![2, 3, h]);
    assert!(g_ent.data[(3 + 1) * h..].iter().all(|&v| v == 0.0));

    // Copy distribution over entities from a decoder state
    let copy = MultiHeadAttention::new(&config, AttentionMode::Copy, config.seed_for(SeedStream::Attention)).unwrap();
    let dec = ramp(vec![2, config.dec_ninp], 0.1);
    let (logits, _) = copy.forward(&dec, &g_ent, Some(&ent_mask)).unwrap();
    assert_eq!(logits.shape, vec![2, 1, 3]);
    let probs = logits.softmax(-1);
    assert_abs_diff_eq!(probs.data[4], 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(probs.data[5], 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(probs.data[3], 1.0, epsilon = 1e-6);
}

#[test]
fn test_title_encoder_with_normal_attention() {
    init_logger();
    let config = ModelConfig::tiny();
    let encoder = BiLstmEncoder::new(&config, EncoderMode::Title).unwrap();
    let title = ramp(vec![2, 4, config.nhid], 0.04);
    let mask = Tensor::new(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0], vec![2, 4]);
    let encoded = encoder.forward(&title, &mask, None).unwrap();
    assert_eq!(encoded.shape, vec![2, 4, config.nhid]);

    let attn = MultiHeadAttention::new(&config, AttentionMode::Normal, config.seed_for(SeedStream::Attention)).unwrap();
    let queries = ramp(vec![2, 5, config.nhid], 0.02);
    let (out, _) = attn.forward(&queries, &encoded, Some(&mask)).unwrap();
    assert_eq!(out.shape, queries.shape);
}

#[test]
fn test_attention_weights_sum_to_one_on_batched_graph() {
    init_logger();
    let config = ModelConfig::tiny();
    let model = GraphTrans::new(&config).unwrap();
    let graph = sample_graphs();
    let feat = ramp(vec![graph.num_nodes(), config.nhid], 0.1);
    let (_, cache) = model.layers[0].forward(&graph, &feat).unwrap();
    let width = config.nhid;
    for node in 0..graph.num_nodes() {
        for col in 0..width {
            let total: f32 = graph
                .in_edges(node)
                .iter()
                .map(|&e| cache.attn.data[e * width + col])
                .sum();
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);
        }
    }
}

#[test]
fn test_gat_variant_has_no_transformer_tail() {
    let mut config = ModelConfig::tiny();
    config.graph_enc = GraphEncoder::Gat;
    let model = GraphTrans::new(&config).unwrap();
    assert_eq!(model.num_layers(), config.prop);
    assert!(model.layers.iter().all(|l| !l.is_trans() && l.ln.is_none()));

    let graph = sample_graphs();
    assert_eq!(graph.filter_nodes(NodeType::Root).len(), 2);
    let ent = pad(&[ramp(vec![3, config.nhid], 0.1), ramp(vec![1, config.nhid], 0.2)]);
    let ent_mask = Tensor::new(vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0], vec![2, 3]);
    let rel = ramp(vec![2, 5, config.nhid], 0.03);
    let rel_mask = Tensor::new(
        vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0],
        vec![2, 5],
    );
    let (g_ent, g_root, _) = model
        .forward(&ent, &ent_mask, &[3, 1], &rel, &rel_mask, &graph)
        .unwrap();
    assert_eq!(g_ent.shape, vec![2, 3, config.nhid]);
    assert_eq!(g_root.shape, vec![2, config.nhid]);
}

#[test]
fn test_zero_rounds_pass_features_through() {
    let mut config = ModelConfig::tiny();
    config.prop = 0;
    let model = GraphTrans::new(&config).unwrap();
    let graph = BatchedGraph::batch(&[BatchedGraph::from_relations(2, &[]).unwrap()]).unwrap();
    let ent = ramp(vec![1, 2, config.nhid], 0.1);
    let rel = ramp(vec![1, 1, config.nhid], 0.3);
    let (g_ent, g_root, _) = model
        .forward(&ent, &Tensor::zeros(vec![1, 2]), &[2], &rel, &Tensor::zeros(vec![1, 1]), &graph)
        .unwrap();
    assert_eq!(g_ent, ent);
    assert_eq!(g_root, rel.reshape(&[1, config.nhid]));
}
