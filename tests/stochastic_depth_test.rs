use ndarray::Array3;
use proptest::prelude::*;
use vit::{Block, BlockOptions, Layer, Mlp, ModelError, StochasticDepth, ViTConfig};

fn config() -> ViTConfig {
    ViTConfig::custom(8, 2, 16, 1, 4).with_dropout(0.0, 0.0)
}

fn input() -> Array3<f32> {
    Array3::from_shape_fn((2, 3, 8), |(b, t, h)| ((b + 2 * t + 3 * h) as f32 * 0.4).cos())
}

#[test]
fn test_construction_rejects_out_of_range_probability() {
    for p in [0.0, 1.0, -0.1, 2.0] {
        let mlp = Mlp::new(&config()).unwrap();
        assert!(matches!(
            StochasticDepth::new(mlp, p),
            Err(ModelError::InvalidArgument { .. })
        ));
    }
}

#[test]
fn test_inference_mode_is_deterministic() {
    let mlp = Mlp::new(&config()).unwrap();
    let mut reference = mlp.clone();
    let mut wrapped = StochasticDepth::new(mlp, 0.5).unwrap();
    let x = input();

    let expected = reference.forward(&x).unwrap();
    let first = wrapped.forward(&x).unwrap();
    let second = wrapped.forward(&x).unwrap();
    assert_eq!(first, expected);
    assert_eq!(second, expected);
}

#[test]
fn test_training_bypass_frequency_and_scaling() {
    let p = 0.3;
    let mlp = Mlp::new(&config()).unwrap();
    let x = input();
    let scaled = mlp.clone().forward(&x).unwrap() * (1.0 - p);

    let mut wrapped = StochasticDepth::with_seed(mlp, p, 42).unwrap();
    wrapped.set_training(true);

    let trials = 4000;
    let mut bypassed = 0;
    for _ in 0..trials {
        let out = wrapped.forward(&x).unwrap();
        if out == x {
            bypassed += 1;
        } else {
            assert_eq!(out, scaled);
        }
    }

    let frequency = bypassed as f32 / trials as f32;
    assert!((frequency - p).abs() < 0.03, "bypass frequency {}", frequency);
}

#[test]
fn test_block_with_drop_paths_is_deterministic_in_eval() {
    let options = BlockOptions {
        attention_drop_path: Some(0.4),
        mlp_drop_path: Some(0.4),
        ..BlockOptions::default()
    };
    let mut block = Block::new(&config(), &options, 3).unwrap();
    assert_eq!(block.attention_layer().layer_type(), "StochasticDepth(Attention)");
    assert_eq!(block.mlp_layer().layer_type(), "StochasticDepth(Mlp)");

    let x = input();
    let first = block.forward(&x).unwrap();
    assert_eq!(block.forward(&x).unwrap(), first);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_training_output_is_input_or_scaled(p in 0.05f32..0.95, seed in any::<u64>()) {
        let mlp = Mlp::new(&config()).unwrap();
        let x = input();
        let scaled = mlp.clone().forward(&x).unwrap() * (1.0 - p);

        let mut wrapped = StochasticDepth::with_seed(mlp, p, seed).unwrap();
        wrapped.set_training(true);
        for _ in 0..8 {
            let out = wrapped.forward(&x).unwrap();
            prop_assert!(out == x || out == scaled);
        }
    }
}
