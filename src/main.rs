use std::sync::Arc;

use clap::{Parser, ValueEnum};
use ndarray::Array4;
use rand::Rng;
use rand_distr::StandardNormal;
use vit::{
    AttentionMaskMode, BlockOptions, MagnitudeMasker, VisionTransformer, ViTConfig, VitOutput,
    WeightBundle,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MaskMode {
    None,
    Pre,
    Post,
}

#[derive(Parser)]
#[command(name = "vit")]
#[command(about = "Build a Vision Transformer, optionally import weights, and run one batch")]
struct Args {
    /// Model configuration preset
    #[arg(long, default_value = "ViT-B_16")]
    preset: String,

    /// Square input image size in pixels
    #[arg(long, default_value_t = 224)]
    img_size: usize,

    #[arg(long, default_value_t = 1000)]
    num_classes: usize,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Weight bundle to import (.json or bincode)
    #[arg(long)]
    weights: Option<String>,

    /// Zero the classification head instead of importing it
    #[arg(long)]
    zero_head: bool,

    /// Where the attention pruning mask is applied
    #[arg(long, value_enum, default_value_t = MaskMode::None)]
    mask_mode: MaskMode,

    /// Route attention probabilities and MLP activations through a magnitude masker
    #[arg(long)]
    activation_pruning: bool,

    /// Magnitude below which the masker zeroes activations
    #[arg(long, default_value_t = 1e-3)]
    mask_threshold: f32,

    /// Use sparse layer normalization
    #[arg(long)]
    sparse_norm: bool,

    /// Store sparse-norm activations as 8-bit blocks
    #[arg(long)]
    quantize: bool,

    /// Stochastic-depth drop probability for the MLP branch
    #[arg(long)]
    mlp_drop_path: Option<f32>,

    /// Run the batch in training mode
    #[arg(long)]
    train: bool,
}

fn main() -> vit::Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ViTConfig::preset(&args.preset)?;
    let mask_mode = match args.mask_mode {
        MaskMode::None => AttentionMaskMode::Disabled,
        MaskMode::Pre => AttentionMaskMode::PreSoftmax,
        MaskMode::Post => AttentionMaskMode::PostSoftmax { renormalize: false },
    };
    let options = BlockOptions {
        mask_mode,
        activation_pruning: args.activation_pruning,
        masker: Arc::new(MagnitudeMasker::new(args.mask_threshold)),
        sparse_norm: args.sparse_norm,
        quantize: args.quantize,
        mlp_drop_path: args.mlp_drop_path,
        ..BlockOptions::default()
    };

    let mut model = VisionTransformer::new(&config, args.img_size, args.num_classes, &options)?
        .with_zero_head(args.zero_head);

    if let Some(path) = &args.weights {
        let weights = WeightBundle::load(path)?;
        model.load_from(&weights)?;
    }
    if args.train {
        model.train();
    }

    let mut rng = rand::rng();
    let images = Array4::from_shape_fn((args.batch, 3, args.img_size, args.img_size), |_| {
        rng.sample::<f32, _>(StandardNormal)
    });

    println!("\n=== MODEL ===");
    println!("Preset: {}", args.preset);
    println!("Tokens per image: {}", model.n_tokens());
    println!("Parameters: {}", model.parameters());

    match model.forward(&images, None, false)? {
        VitOutput::Logits(logits) => {
            println!("Logits shape: {:?}", logits.dim());
            if let Some(row) = logits.outer_iter().next() {
                let (best, score) = row
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
                println!("Top class of first image: {} ({:.4})", best, score);
            }
        }
        other => println!("Unexpected output: {:?}", other),
    }

    Ok(())
}
