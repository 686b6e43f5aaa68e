use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, Array3, Array4, ArrayD, IxDyn};
use vit::{
    AttentionMaskMode, BlockOptions, Classifier, ModelError, VisionTransformer, ViTConfig,
    WeightBundle,
};

const HIDDEN: usize = 8;
const HEADS: usize = 2;
const MLP: usize = 16;
const LAYERS: usize = 2;
const PATCH: usize = 4;
const IMAGE: usize = 8;
const CLASSES: usize = 3;

fn config() -> ViTConfig {
    ViTConfig::custom(HIDDEN, HEADS, MLP, LAYERS, PATCH).with_dropout(0.0, 0.0)
}

/// Deterministic, distinct values for every array of the checkpoint
fn filled(shape: &[usize], seed: usize) -> ArrayD<f32> {
    let mut counter = 0usize;
    ArrayD::from_shape_fn(IxDyn(shape), |_| {
        counter += 1;
        seed as f32 + counter as f32 * 1e-3
    })
}

fn synthetic_bundle(n_tokens: usize) -> WeightBundle {
    let mut weights = WeightBundle::new();
    let mut seed = 0;
    let mut next = || {
        seed += 1;
        seed
    };

    weights.insert("head/kernel", filled(&[HIDDEN, CLASSES], next()));
    weights.insert("head/bias", filled(&[CLASSES], next()));
    weights.insert("embedding/kernel", filled(&[PATCH, PATCH, 3, HIDDEN], next()));
    weights.insert("embedding/bias", filled(&[HIDDEN], next()));
    weights.insert("cls", filled(&[1, 1, HIDDEN], next()));
    weights.insert(
        "Transformer/posembed_input/pos_embedding",
        filled(&[1, n_tokens, HIDDEN], next()),
    );
    weights.insert("Transformer/encoder_norm/scale", filled(&[HIDDEN], next()));
    weights.insert("Transformer/encoder_norm/bias", filled(&[HIDDEN], next()));

    for i in 0..LAYERS {
        let root = format!("Transformer/encoderblock_{}", i);
        let head_size = HIDDEN / HEADS;
        for name in ["query", "key", "value"] {
            let path = format!("{}/MultiHeadDotProductAttention_1/{}", root, name);
            weights.insert(format!("{}/kernel", path), filled(&[HIDDEN, HEADS, head_size], next()));
            weights.insert(format!("{}/bias", path), filled(&[HEADS, head_size], next()));
        }
        let out = format!("{}/MultiHeadDotProductAttention_1/out", root);
        weights.insert(format!("{}/kernel", out), filled(&[HEADS, head_size, HIDDEN], next()));
        weights.insert(format!("{}/bias", out), filled(&[HIDDEN], next()));

        weights.insert(format!("{}/MlpBlock_3/Dense_0/kernel", root), filled(&[HIDDEN, MLP], next()));
        weights.insert(format!("{}/MlpBlock_3/Dense_0/bias", root), filled(&[MLP], next()));
        weights.insert(format!("{}/MlpBlock_3/Dense_1/kernel", root), filled(&[MLP, HIDDEN], next()));
        weights.insert(format!("{}/MlpBlock_3/Dense_1/bias", root), filled(&[HIDDEN], next()));

        for norm in ["LayerNorm_0", "LayerNorm_2"] {
            weights.insert(format!("{}/{}/scale", root, norm), filled(&[HIDDEN], next()));
            weights.insert(format!("{}/{}/bias", root, norm), filled(&[HIDDEN], next()));
        }
    }
    weights
}

fn dense_as_weight(weights: &WeightBundle, key: &str, rows: usize, cols: usize) -> Array2<f32> {
    let kernel = weights.get(key).unwrap();
    let kernel = Array2::from_shape_vec((rows, cols), kernel.iter().copied().collect()).unwrap();
    kernel.t().to_owned()
}

fn flat(weights: &WeightBundle, key: &str) -> Array1<f32> {
    weights.get(key).unwrap().iter().copied().collect()
}

fn model(options: &BlockOptions) -> VisionTransformer {
    VisionTransformer::new(&config(), IMAGE, CLASSES, options).unwrap()
}

#[test]
fn test_import_copies_every_parameter() {
    let mut vit = model(&BlockOptions::default());
    let weights = synthetic_bundle(vit.n_tokens());
    vit.load_from(&weights).unwrap();

    assert_eq!(vit.head.weight, dense_as_weight(&weights, "head/kernel", HIDDEN, CLASSES));
    assert_eq!(vit.head.bias, flat(&weights, "head/bias"));

    let embeddings = &vit.transformer().embeddings;
    let hwio = weights.get("embedding/kernel").unwrap();
    for ((o, i, h, w), &value) in embeddings.patch_embeddings.weight.indexed_iter() {
        assert_eq!(value, hwio[&[h, w, i, o][..]]);
    }
    assert_eq!(embeddings.cls_token.as_ref().unwrap(), &flat(&weights, "cls"));
    let posemb = flat(&weights, "Transformer/posembed_input/pos_embedding");
    assert_eq!(
        embeddings.position_embeddings.iter().copied().collect::<Vec<_>>(),
        posemb.to_vec()
    );

    for (i, block) in vit.transformer().encoder.layers().iter().enumerate() {
        let root = format!("Transformer/encoderblock_{}", i);
        let attn = block.attention();
        for (name, linear) in [
            ("query", &attn.query),
            ("key", &attn.key),
            ("value", &attn.value),
            ("out", &attn.out),
        ] {
            let path = format!("{}/MultiHeadDotProductAttention_1/{}", root, name);
            assert_eq!(
                linear.weight,
                dense_as_weight(&weights, &format!("{}/kernel", path), HIDDEN, HIDDEN)
            );
            assert_eq!(linear.bias, flat(&weights, &format!("{}/bias", path)));
        }

        let mlp = block.mlp();
        let dense0 = format!("{}/MlpBlock_3/Dense_0", root);
        let dense1 = format!("{}/MlpBlock_3/Dense_1", root);
        assert_eq!(mlp.fc1.weight, dense_as_weight(&weights, &format!("{}/kernel", dense0), HIDDEN, MLP));
        assert_eq!(mlp.fc1.bias, flat(&weights, &format!("{}/bias", dense0)));
        assert_eq!(mlp.fc2.weight, dense_as_weight(&weights, &format!("{}/kernel", dense1), MLP, HIDDEN));
        assert_eq!(mlp.fc2.bias, flat(&weights, &format!("{}/bias", dense1)));

        let norm = block.attention_norm().layer_norm_ref();
        assert_eq!(norm.gamma, flat(&weights, &format!("{}/LayerNorm_0/scale", root)));
        assert_eq!(norm.beta, flat(&weights, &format!("{}/LayerNorm_0/bias", root)));
        let norm = block.ffn_norm().layer_norm_ref();
        assert_eq!(norm.gamma, flat(&weights, &format!("{}/LayerNorm_2/scale", root)));
        assert_eq!(norm.beta, flat(&weights, &format!("{}/LayerNorm_2/bias", root)));
    }

    let encoder_norm = vit.transformer().encoder.encoder_norm();
    assert_eq!(encoder_norm.gamma, flat(&weights, "Transformer/encoder_norm/scale"));
    assert_eq!(encoder_norm.beta, flat(&weights, "Transformer/encoder_norm/bias"));
}

#[test]
fn test_import_reaches_through_pruned_and_wrapped_variants() {
    let options = BlockOptions {
        mask_mode: AttentionMaskMode::PreSoftmax,
        activation_pruning: true,
        sparse_norm: true,
        attention_drop_path: Some(0.2),
        mlp_drop_path: Some(0.2),
        ..BlockOptions::default()
    };
    let mut pruned = model(&options);
    let mut plain = model(&BlockOptions::default());
    let weights = synthetic_bundle(plain.n_tokens());
    pruned.load_from(&weights).unwrap();
    plain.load_from(&weights).unwrap();

    assert_eq!(pruned.state_dict(), plain.state_dict());
}

#[test]
fn test_export_then_import_reproduces_parameters() {
    let source = model(&BlockOptions::default());
    let exported = source.to_weight_bundle();

    let mut target = model(&BlockOptions::default());
    assert_ne!(target.state_dict(), source.state_dict());
    target.load_from(&exported).unwrap();
    assert_eq!(target.state_dict(), source.state_dict());
}

#[test]
fn test_failed_import_leaves_model_untouched() {
    let mut vit = model(&BlockOptions::default());
    let before = vit.state_dict();

    let full = synthetic_bundle(vit.n_tokens());
    let mut broken = WeightBundle::new();
    for key in full.keys().filter(|k| *k != "Transformer/encoderblock_1/MlpBlock_3/Dense_1/bias") {
        broken.insert(key, full.get(key).unwrap().clone());
    }

    assert!(matches!(
        vit.load_from(&broken),
        Err(ModelError::MissingWeight { .. })
    ));
    assert_eq!(vit.state_dict(), before);
}

#[test]
fn test_zero_head() {
    let mut vit = model(&BlockOptions::default()).with_zero_head(true);
    let full = synthetic_bundle(vit.n_tokens());
    let mut weights = WeightBundle::new();
    for key in full.keys().filter(|k| !k.starts_with("head/")) {
        weights.insert(key, full.get(key).unwrap().clone());
    }
    vit.load_from(&weights).unwrap();
    assert!(vit.head.weight.iter().all(|&w| w == 0.0));
    assert!(vit.head.bias.iter().all(|&b| b == 0.0));
}

#[test]
fn test_position_embedding_resized_from_7x7_to_14x14() {
    // Checkpoint trained at 112px (7x7 grid), model at 224px (14x14 grid)
    let small = ViTConfig::custom(4, 1, 4, 1, 16).with_dropout(0.0, 0.0);
    let source = VisionTransformer::new(&small, 112, 2, &BlockOptions::default()).unwrap();
    assert_eq!(source.n_tokens(), 50);

    let mut weights = source.to_weight_bundle();
    let ramp = Array2::from_shape_fn((50, 4), |(t, h)| {
        if t == 0 {
            -1.0 - h as f32
        } else {
            let (y, x) = ((t - 1) / 7, (t - 1) % 7);
            10.0 * y as f32 + x as f32 + 100.0 * h as f32
        }
    });
    weights.insert(
        "Transformer/posembed_input/pos_embedding",
        ramp.clone().into_shape_with_order((1, 50, 4)).unwrap(),
    );

    let mut target = VisionTransformer::new(&small, 224, 2, &BlockOptions::default()).unwrap();
    target.load_from(&weights).unwrap();
    let posemb = &target.transformer().embeddings.position_embeddings;
    assert_eq!(posemb.dim(), (197, 4));

    // class token copied verbatim
    assert_eq!(posemb.row(0), ramp.row(0));

    let at = |i: usize, j: usize, h: usize| posemb[[1 + i * 14 + j, h]];
    let expected = |i: usize, j: usize, h: usize| {
        let scale = 6.0 / 13.0;
        10.0 * i as f32 * scale + j as f32 * scale + 100.0 * h as f32
    };
    for h in 0..4 {
        // corners map onto corners
        assert_abs_diff_eq!(at(0, 0, h), 100.0 * h as f32, epsilon = 1e-3);
        assert_abs_diff_eq!(at(0, 13, h), 6.0 + 100.0 * h as f32, epsilon = 1e-3);
        assert_abs_diff_eq!(at(13, 0, h), 60.0 + 100.0 * h as f32, epsilon = 1e-3);
        assert_abs_diff_eq!(at(13, 13, h), 66.0 + 100.0 * h as f32, epsilon = 1e-3);
        // interior points follow the ramp
        for (i, j) in [(6, 7), (7, 6), (5, 8), (1, 12)] {
            assert_abs_diff_eq!(at(i, j, h), expected(i, j, h), epsilon = 1e-3);
        }
    }
}

#[test]
fn test_non_square_position_grid_rejected() {
    let mut vit = model(&BlockOptions::default());
    let mut weights = synthetic_bundle(vit.n_tokens());
    // 1 class token + 6 grid tokens
    weights.insert(
        "Transformer/posembed_input/pos_embedding",
        Array3::<f32>::zeros((1, 7, HIDDEN)),
    );
    assert!(matches!(
        vit.load_from(&weights),
        Err(ModelError::NonSquareGrid { tokens: 6 })
    ));
}

#[test]
fn test_gap_classifier_treats_every_row_as_grid() {
    let gap = config().with_classifier(Classifier::Gap);
    let mut source =
        VisionTransformer::new(&gap, IMAGE, CLASSES, &BlockOptions::default()).unwrap();
    assert_eq!(source.n_tokens(), 4);
    source.transformer_mut().embeddings.position_embeddings =
        Array2::from_shape_fn((4, HIDDEN), |(t, h)| (t * HIDDEN + h) as f32 + 1.0);
    let weights = source.to_weight_bundle();
    assert!(!weights.contains("cls"));

    let mut target = VisionTransformer::new(&gap, 16, CLASSES, &BlockOptions::default()).unwrap();
    target.load_from(&weights).unwrap();
    let posemb = &target.transformer().embeddings.position_embeddings;
    assert_eq!(posemb.dim(), (16, HIDDEN));

    let stored = &source.transformer().embeddings.position_embeddings;
    assert_eq!(posemb.row(0), stored.row(0));
    assert_eq!(posemb.row(15), stored.row(3));
}

#[test]
fn test_conv_kernel_shape_checked() {
    let mut vit = model(&BlockOptions::default());
    let mut weights = synthetic_bundle(vit.n_tokens());
    weights.insert("embedding/kernel", Array4::<f32>::zeros((PATCH, PATCH, 3, HIDDEN + 1)));
    assert!(matches!(
        vit.load_from(&weights),
        Err(ModelError::ShapeMismatch { .. })
    ));
}

/// Imports `weights` and checks the failure is a shape error that left every
/// parameter as it was
fn assert_shape_rejected(weights: &WeightBundle) {
    let mut vit = model(&BlockOptions::default());
    let before = vit.state_dict();
    assert!(matches!(
        vit.load_from(weights),
        Err(ModelError::ShapeMismatch { .. })
    ));
    assert_eq!(vit.state_dict(), before);
}

#[test]
fn test_transposed_mlp_kernel_rejected() {
    let mut weights = synthetic_bundle(model(&BlockOptions::default()).n_tokens());
    // same element count as the [HIDDEN, MLP] slot, axes swapped
    weights.insert(
        "Transformer/encoderblock_0/MlpBlock_3/Dense_0/kernel",
        filled(&[MLP, HIDDEN], 99),
    );
    assert_shape_rejected(&weights);
}

#[test]
fn test_position_table_with_other_hidden_size_rejected() {
    let mut weights = synthetic_bundle(model(&BlockOptions::default()).n_tokens());
    // 80 elements would also fill a [10, HIDDEN] table
    weights.insert(
        "Transformer/posembed_input/pos_embedding",
        filled(&[1, 5, 2 * HIDDEN], 99),
    );
    assert_shape_rejected(&weights);
}

#[test]
fn test_patch_kernel_in_oihw_order_rejected() {
    let mut weights = synthetic_bundle(model(&BlockOptions::default()).n_tokens());
    weights.insert("embedding/kernel", filled(&[HIDDEN, 3, PATCH, PATCH], 99));
    assert_shape_rejected(&weights);
}

#[test]
fn test_attention_head_split_on_wrong_axis_rejected() {
    let head_size = HIDDEN / HEADS;
    let mut weights = synthetic_bundle(model(&BlockOptions::default()).n_tokens());
    weights.insert(
        "Transformer/encoderblock_1/MultiHeadDotProductAttention_1/query/kernel",
        filled(&[HEADS, head_size, HIDDEN], 99),
    );
    assert_shape_rejected(&weights);

    let mut weights = synthetic_bundle(model(&BlockOptions::default()).n_tokens());
    weights.insert(
        "Transformer/encoderblock_1/MultiHeadDotProductAttention_1/out/bias",
        filled(&[HEADS, head_size], 99),
    );
    assert_shape_rejected(&weights);
}

#[test]
fn test_flat_position_table_and_class_token_accepted() {
    let mut vit = model(&BlockOptions::default());
    let n_tokens = vit.n_tokens();
    let mut weights = synthetic_bundle(n_tokens);
    let table = filled(&[n_tokens, HIDDEN], 50);
    weights.insert("Transformer/posembed_input/pos_embedding", table.clone());
    weights.insert("cls", filled(&[HIDDEN], 60));
    vit.load_from(&weights).unwrap();

    let embeddings = &vit.transformer().embeddings;
    assert_eq!(
        embeddings.position_embeddings.iter().copied().collect::<Vec<_>>(),
        table.iter().copied().collect::<Vec<_>>()
    );
    assert_eq!(embeddings.cls_token.as_ref().unwrap(), &flat(&weights, "cls"));
}
