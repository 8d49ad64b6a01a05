use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::{
    encoder::{Backbone, EncoderConfig, PositionalEncoding},
    model_manager::DeviceChoice,
};

#[derive(Debug, Parser)]
#[command(
    name = "snipseek",
    about = "Find the document page a screenshot snippet was taken from",
    version
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sample random crops from page images into training pairs
    Prepare(PrepareArgs),
    /// Fine-tune the encoder on crop/page pairs
    Train(TrainArgs),
    /// Embed a page corpus and write the index artifacts
    Build(BuildArgs),
    /// Look up the pages most similar to a snippet image
    Query(QueryArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Encoder architecture --

#[derive(Debug, Clone, Args)]
pub struct ArchArgs {
    /// Convolutional backbone
    #[arg(long, value_enum, default_value = "resnet34")]
    pub backbone: Backbone,

    /// Embedding dimension
    #[arg(long, default_value = "384")]
    pub embed_dim: usize,

    /// Transformer encoder layers
    #[arg(long, default_value = "3")]
    pub layers: usize,

    /// Attention heads per layer
    #[arg(long, default_value = "8")]
    pub heads: usize,

    /// Side of the square encoder input, in pixels
    #[arg(long, default_value = "512")]
    pub image_size: u32,

    /// Positional signal added to the spatial tokens
    #[arg(long, value_enum, default_value = "zero")]
    pub positional: PositionalEncoding,
}

impl ArchArgs {
    pub fn config(&self) -> EncoderConfig {
        EncoderConfig {
            backbone: self.backbone,
            embed_dim: self.embed_dim,
            num_layers: self.layers,
            num_heads: self.heads,
            image_size: self.image_size,
            positional: self.positional,
        }
    }
}

/// Architecture flags for commands that load existing weights. Each flag
/// that is given must agree with the configuration stored next to the
/// weights.
#[derive(Debug, Clone, Default, Args)]
pub struct ExpectedArchArgs {
    #[arg(long, value_enum)]
    pub backbone: Option<Backbone>,

    #[arg(long)]
    pub embed_dim: Option<usize>,

    #[arg(long)]
    pub layers: Option<usize>,

    #[arg(long)]
    pub heads: Option<usize>,

    #[arg(long)]
    pub image_size: Option<u32>,

    #[arg(long, value_enum)]
    pub positional: Option<PositionalEncoding>,
}

impl ExpectedArchArgs {
    /// `stored` with every given flag applied on top.
    pub fn apply(&self, stored: &EncoderConfig) -> EncoderConfig {
        EncoderConfig {
            backbone: self.backbone.unwrap_or(stored.backbone),
            embed_dim: self.embed_dim.unwrap_or(stored.embed_dim),
            num_layers: self.layers.unwrap_or(stored.num_layers),
            num_heads: self.heads.unwrap_or(stored.num_heads),
            image_size: self.image_size.unwrap_or(stored.image_size),
            positional: self.positional.unwrap_or(stored.positional),
        }
    }
}

// -- Prepare --

#[derive(Debug, Parser)]
pub struct PrepareArgs {
    /// Directory of rasterized pages (<pdf>_page_<n>.png)
    #[arg(long)]
    pub pages_dir: PathBuf,

    /// Where to write the training pairs (default: <data-dir>/training_pairs.json)
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Crops sampled per page
    #[arg(long, default_value = "6")]
    pub crops_per_page: usize,

    /// Smallest crop area as a fraction of the page
    #[arg(long, default_value = "0.03")]
    pub min_area: f64,

    /// Largest crop area as a fraction of the page
    #[arg(long, default_value = "0.5")]
    pub max_area: f64,

    /// Random seed
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

// -- Train --

#[derive(Debug, Parser)]
pub struct TrainArgs {
    /// Training pairs written by `prepare` (default: <data-dir>/training_pairs.json)
    #[arg(long)]
    pub pairs: Option<PathBuf>,

    #[arg(long, default_value = "3")]
    pub epochs: usize,

    #[arg(long, default_value = "8")]
    pub batch_size: usize,

    /// AdamW learning rate
    #[arg(long, default_value = "1e-4")]
    pub lr: f64,

    /// Softmax temperature of the contrastive loss
    #[arg(long, default_value = "0.07")]
    pub temperature: f64,

    /// Seed for batch shuffling
    #[arg(long, default_value = "0")]
    pub seed: u64,

    #[arg(long, value_enum, default_value = "auto")]
    pub device: DeviceChoice,

    /// Output weights (default: <data-dir>/encoder.safetensors)
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Initialize the backbone from a local ImageNet safetensors checkpoint
    #[arg(long, conflicts_with = "pretrained")]
    pub init_backbone: Option<PathBuf>,

    /// Download ImageNet backbone weights from the Hugging Face Hub
    #[arg(long)]
    pub pretrained: bool,

    #[command(flatten)]
    pub arch: ArchArgs,
}

// -- Build --

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Page records JSON (or training pairs) or a directory of page images
    #[arg(long)]
    pub pages: PathBuf,

    /// Encoder weights (default: <data-dir>/encoder.safetensors)
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Similarity index output (default: <data-dir>/index.redb)
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Embedding matrix output (default: <data-dir>/embeddings.bin)
    #[arg(long)]
    pub embeddings: Option<PathBuf>,

    /// Page metadata output (default: <data-dir>/pages_meta.json)
    #[arg(long)]
    pub metadata: Option<PathBuf>,

    /// Pages embedded per batch
    #[arg(long, default_value = "8")]
    pub batch_size: usize,

    #[arg(long, value_enum, default_value = "auto")]
    pub device: DeviceChoice,

    #[command(flatten)]
    pub arch: ExpectedArchArgs,
}

// -- Query --

#[derive(Debug, Parser)]
pub struct QueryArgs {
    /// Snippet image to look up
    #[arg(long)]
    pub snippet: PathBuf,

    /// Number of candidate pages to return
    #[arg(short = 'k', long, default_value = "5")]
    pub top_k: usize,

    /// Encoder weights (default: <data-dir>/encoder.safetensors)
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Similarity index (default: <data-dir>/index.redb)
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Page metadata (default: <data-dir>/pages_meta.json)
    #[arg(long)]
    pub metadata: Option<PathBuf>,

    /// Also cross-check the embedding matrix against the index
    #[arg(long)]
    pub embeddings: Option<PathBuf>,

    /// Tesseract language set, e.g. eng+deu
    #[arg(long, default_value = "eng")]
    pub ocr_langs: String,

    /// Seconds allowed per OCR call
    #[arg(long, default_value = "30")]
    pub ocr_timeout_secs: u64,

    /// Skip OCR verification
    #[arg(long)]
    pub no_verify: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    #[arg(long, value_enum, default_value = "auto")]
    pub device: DeviceChoice,

    #[command(flatten)]
    pub arch: ExpectedArchArgs,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "snipseek",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn query_defaults() {
        let cli = Cli::parse_from(["snipseek", "query", "--snippet", "s.png"]);
        match cli.command {
            Command::Query(args) => {
                assert_eq!(args.snippet, PathBuf::from("s.png"));
                assert_eq!(args.top_k, 5);
                assert_eq!(args.ocr_langs, "eng");
                assert!(!args.no_verify);
                assert!(!args.json);
                assert_eq!(args.device, DeviceChoice::Auto);
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn train_arch_defaults_match_encoder_defaults() {
        let cli = Cli::parse_from(["snipseek", "train"]);
        match cli.command {
            Command::Train(args) => {
                assert_eq!(args.arch.config(), EncoderConfig::default());
                assert_eq!(args.epochs, 3);
                assert_eq!(args.batch_size, 8);
                assert!((args.lr - 1e-4).abs() < 1e-12);
            }
            _ => panic!("expected train command"),
        }
    }

    #[test]
    fn prepare_defaults() {
        let cli = Cli::parse_from(["snipseek", "prepare", "--pages-dir", "pages"]);
        match cli.command {
            Command::Prepare(args) => {
                assert_eq!(args.crops_per_page, 6);
                assert_eq!(args.min_area, 0.03);
                assert_eq!(args.max_area, 0.5);
            }
            _ => panic!("expected prepare command"),
        }
    }

    #[test]
    fn init_backbone_conflicts_with_pretrained() {
        let parsed = Cli::try_parse_from([
            "snipseek",
            "train",
            "--pretrained",
            "--init-backbone",
            "resnet.safetensors",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn expected_arch_overrides_only_given_flags() {
        let cli = Cli::parse_from([
            "snipseek", "query", "--snippet", "s.png", "--heads", "4",
        ]);
        match cli.command {
            Command::Query(args) => {
                let stored = EncoderConfig::default();
                let expected = args.arch.apply(&stored);
                assert_eq!(expected.num_heads, 4);
                assert_eq!(expected.embed_dim, stored.embed_dim);
                assert!(stored.ensure_matches(&expected).is_err());
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }
}
