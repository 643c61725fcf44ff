//! Leaf Classification CLI Tool
//!
//! Fetches the deployed model, inspects it, and classifies leaf photos from
//! the command line with the same pipeline the upload handler uses.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use leaf_core::{load_leaf_config, setup_cli_logging, LeafConfig, Session, Verdict};
use leaf_inference::{backend_name, LeafPipeline};
use serde::Serialize;
use tracing::info;

/// Leaf Disease Classification Tool
#[derive(Parser, Debug)]
#[command(
    name = "leaf-classify",
    version,
    about = "Classify leaf photos as diseased or healthy",
    long_about = "Provision the leaf disease model from its remote artifact, inspect it, \
                  and classify JPEG or PNG leaf photos with a confidence gate."
)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/leaf.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Make sure the model artifact is cached locally
    Fetch,

    /// Load the model and print what it expects and produces
    Inspect,

    /// Classify one or more images
    Classify {
        /// Image files (JPEG or PNG)
        #[arg(required = true, value_name = "IMAGE")]
        images: Vec<PathBuf>,

        /// Print verdicts as JSON
        #[arg(long)]
        json: bool,

        /// Override the configured confidence threshold
        #[arg(short, long)]
        threshold: Option<f32>,
    },
}

/// One line of `classify --json` output
#[derive(Debug, Serialize)]
struct ClassifyReport {
    image: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_cli_logging(cli.verbose).context("Failed to initialize logging")?;

    let config = load_leaf_config(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    match cli.command {
        Commands::Fetch => fetch(&config),
        Commands::Inspect => inspect(&config),
        Commands::Classify {
            images,
            json,
            threshold,
        } => classify(&config, &images, json, threshold),
    }
}

fn fetch(config: &LeafConfig) -> Result<()> {
    let pipeline = LeafPipeline::from_config(config).context("Failed to build pipeline")?;
    let provider = pipeline.provider();

    println!("{}", "Fetching model artifact...".cyan());
    let record = provider
        .cache()
        .ensure_local(provider.artifact_spec())
        .with_context(|| format!("Failed to fetch {}", config.artifact.url))?;

    println!("{}", "Model artifact ready".green().bold());
    println!("  Path:       {}", config.artifact.path.display());
    println!("  Source:     {}", record.locator);
    println!("  Size:       {:.2} MB", record.size as f64 / (1024.0 * 1024.0));
    println!("  SHA-256:    {}", record.sha256);
    println!("  Fetched at: {}", record.fetched_at.to_rfc3339());
    Ok(())
}

fn inspect(config: &LeafConfig) -> Result<()> {
    let pipeline = LeafPipeline::from_config(config).context("Failed to build pipeline")?;

    println!("{}", "Loading model...".cyan());
    let model = pipeline.warm_up().context("Failed to provision model")?;

    println!("{}", "Model".green().bold());
    println!("  Backend:       {}", backend_name());
    println!("  Artifact:      {}", config.artifact.path.display());
    println!("  SHA-256:       {}", model.artifact().sha256);
    println!("  Output width:  {}", model.output_width());
    println!(
        "  Labels:        {}",
        model.labels().iter().collect::<Vec<_>>().join(", ")
    );
    println!(
        "  Input:         {:?} ({})",
        pipeline.preprocessor().output_shape(),
        pipeline.preprocessor().channel_order()
    );
    println!("  Threshold:     {:.2}", pipeline.threshold());
    Ok(())
}

fn classify(
    config: &LeafConfig,
    images: &[PathBuf],
    json: bool,
    threshold: Option<f32>,
) -> Result<()> {
    let mut pipeline = LeafPipeline::from_config(config).context("Failed to build pipeline")?;
    if let Some(threshold) = threshold {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("--threshold must be in [0, 1], got {}", threshold);
        }
        pipeline = pipeline.with_threshold(threshold);
    }

    pipeline.warm_up().context("Failed to provision model")?;
    // The CLI runs on behalf of a local operator, who is trusted.
    let session = Session::authorized();

    let progress = if images.len() > 1 && !json {
        let bar = ProgressBar::new(images.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} images ({eta})")?
                .progress_chars("=>-"),
        );
        Some(bar)
    } else {
        None
    };

    let mut reports = Vec::with_capacity(images.len());
    for image in images {
        let report = match classify_one(&pipeline, &session, image) {
            Ok(verdict) => ClassifyReport {
                image: image.clone(),
                verdict: Some(verdict),
                error: None,
            },
            Err(e) => ClassifyReport {
                image: image.clone(),
                verdict: None,
                error: Some(format!("{:#}", e)),
            },
        };

        if !json {
            let line = format_report(&report);
            match &progress {
                Some(bar) => bar.println(line),
                None => println!("{}", line),
            }
        }
        if let Some(bar) = &progress {
            bar.inc(1);
        }
        reports.push(report);
    }

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    info!(
        "Classified {} of {} images",
        reports.len() - failed,
        reports.len()
    );
    if failed > 0 {
        bail!("{} of {} images could not be classified", failed, reports.len());
    }
    Ok(())
}

fn classify_one(pipeline: &LeafPipeline, session: &Session, image: &Path) -> Result<Verdict> {
    let bytes =
        std::fs::read(image).with_context(|| format!("Failed to read {}", image.display()))?;
    let verdict = pipeline.classify(session, &bytes)?;
    Ok(verdict)
}

fn format_report(report: &ClassifyReport) -> String {
    let name = report
        .image
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    match (&report.verdict, &report.error) {
        (Some(verdict), _) if verdict.is_confident() => {
            format!("{}  {}", name.bold(), verdict.summary().green())
        }
        (Some(verdict), _) => format!("{}  {}", name.bold(), verdict.summary().yellow()),
        (None, Some(error)) => format!("{}  {} {}", name.bold(), "Error:".red(), error),
        (None, None) => format!("{}  {}", name.bold(), "no result".red()),
    }
}
