use std::time::Duration;

use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use snipseek::{
    cli::{BuildArgs, Cli, Command, PrepareArgs, QueryArgs, TrainArgs},
    error::{self, Error},
    index_builder::{self, BuildOptions},
    model_manager::{self, BackboneInit, ModelManager},
    ocr::TesseractOcr,
    page_index::{IndexHandle, PageIndex},
    query::{self, QueryOptions, QueryService},
    sampler::{self, CropConfig},
    trainer::{TrainConfig, Trainer},
    walker, DataDir,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("SNIPSEEK_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let progress = !cli.quiet;

    match cli.command {
        Command::Prepare(args) => cmd_prepare(&data_dir, &args),
        Command::Train(args) => cmd_train(&data_dir, &args, progress),
        Command::Build(args) => cmd_build(&data_dir, &args, progress),
        Command::Query(args) => cmd_query(&data_dir, &args),
        Command::Completions(_) => Ok(()),
    }
}

fn cmd_prepare(data_dir: &DataDir, args: &PrepareArgs) -> error::Result<()> {
    if !args.pages_dir.is_dir() {
        return Err(Error::NotFound {
            kind: "pages directory",
            path: args.pages_dir.clone(),
        });
    }
    let out = args.out.clone().unwrap_or_else(|| data_dir.training_pairs());

    let pages = walker::discover_pages(&args.pages_dir)?;
    info!(pages = pages.len(), dir = %args.pages_dir.display(), "discovered pages");

    let config = CropConfig {
        count: args.crops_per_page,
        min_area_frac: args.min_area,
        max_area_frac: args.max_area,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let pairs = sampler::make_training_pairs(&pages, &config, &mut rng)?;
    sampler::write_training_pairs(&out, &pairs)?;

    println!(
        "Wrote {} training pairs from {} pages to {}",
        pairs.len(),
        pages.len(),
        out.display()
    );
    Ok(())
}

fn cmd_train(
    data_dir: &DataDir,
    args: &TrainArgs,
    progress: bool,
) -> error::Result<()> {
    let pairs_path = args.pairs.clone().unwrap_or_else(|| data_dir.training_pairs());
    let out = args.out.clone().unwrap_or_else(|| data_dir.weights());
    let pairs = sampler::load_training_pairs(&pairs_path)?;

    let device = args.device.device()?;
    info!(?device, pairs = pairs.len(), "loaded training pairs");

    let config = TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        learning_rate: args.lr,
        temperature: args.temperature,
        seed: args.seed,
        progress,
    };
    let mut trainer = Trainer::new(args.arch.config(), config, device)?;

    let init = match (&args.init_backbone, args.pretrained) {
        (Some(path), _) => Some(BackboneInit::File(path.clone())),
        (None, true) => Some(BackboneInit::Hub),
        (None, false) => None,
    };
    if let Some(init) = init {
        trainer.init_backbone(&init)?;
    }

    let history = trainer.fit(&pairs)?;
    trainer.save(&out)?;

    for (epoch, loss) in history.epoch_losses.iter().enumerate() {
        println!("epoch {}: loss {loss:.4}", epoch + 1);
    }
    println!("Saved encoder weights to {}", out.display());
    Ok(())
}

fn cmd_build(
    data_dir: &DataDir,
    args: &BuildArgs,
    progress: bool,
) -> error::Result<()> {
    let weights = args.weights.clone().unwrap_or_else(|| data_dir.weights());
    let paths = data_dir.artifacts(
        args.index.as_deref(),
        args.embeddings.as_deref(),
        args.metadata.as_deref(),
    );

    let stored = model_manager::read_weights_config(&weights)?;
    let mut model = ModelManager::new(&weights, args.device.device()?)
        .with_expected_config(args.arch.apply(&stored));

    let pages = index_builder::load_pages(&args.pages)?;
    let index = index_builder::build_index(
        pages,
        &mut model,
        &BuildOptions {
            batch_size: args.batch_size,
            progress,
        },
    )?;
    index.save(&paths)?;

    println!(
        "Indexed {} pages (dimension {}, build {:016x})",
        index.len(),
        index.dimension(),
        index.build_id()
    );
    println!("  index:      {}", paths.index.display());
    println!("  embeddings: {}", paths.embeddings.display());
    println!("  metadata:   {}", paths.metadata.display());
    Ok(())
}

fn cmd_query(data_dir: &DataDir, args: &QueryArgs) -> error::Result<()> {
    if !args.snippet.is_file() {
        return Err(Error::NotFound {
            kind: "snippet image",
            path: args.snippet.clone(),
        });
    }
    let weights = args.weights.clone().unwrap_or_else(|| data_dir.weights());
    let paths = data_dir.artifacts(
        args.index.as_deref(),
        args.embeddings.as_deref(),
        args.metadata.as_deref(),
    );

    let index = PageIndex::open(&paths, args.embeddings.is_some())?;
    let device = args.device.device()?;
    let stored = model_manager::read_weights_config(&weights)?;
    let encoder =
        model_manager::load_encoder(&weights, Some(&args.arch.apply(&stored)), &device)?;

    let service = QueryService::new(
        encoder,
        device,
        IndexHandle::new(index),
        TesseractOcr::new(args.ocr_langs.clone()),
    )?;
    let options = QueryOptions {
        top_k: args.top_k,
        verify: !args.no_verify,
        ocr_timeout: Duration::from_secs(args.ocr_timeout_secs),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to start tokio runtime: {e}")))?;
    let results = runtime.block_on(service.query(&args.snippet, &options))?;

    if args.json {
        query::format_json(&results, &args.snippet)?;
    } else {
        query::format_human(&results, options.verify);
    }
    Ok(())
}
