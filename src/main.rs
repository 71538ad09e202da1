use anyhow::Context;
use clap::Parser;
use log::info;
use pk_engine::computing::{Aborter, ComputingComponent, ComputingRequest};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pk_engine")]
#[command(about = "Therapeutic drug monitoring computation engine")]
struct Cli {
    /// Computing request file (JSON)
    #[arg(short, long, required_unless_present = "example")]
    request: Option<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Write an example request to the output directory and exit
    #[arg(long)]
    example: bool,

    /// Number of Monte-Carlo samples for percentile computations
    #[arg(short, long)]
    samples: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("creating output directory {:?}", cli.output))?;

    if cli.example {
        let path = cli.output.join("example_request.json");
        let file = std::fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, &pk_engine::example_data::example_request())?;
        info!("example request written to {path:?}");
        return Ok(());
    }

    let request_path = cli.request.expect("clap enforces request without --example");
    let content = std::fs::read_to_string(&request_path)
        .with_context(|| format!("reading request {request_path:?}"))?;
    let request: ComputingRequest = serde_json::from_str(&content)?;
    info!(
        "loaded request {} for drug model {}",
        request.id, request.drug_model.drug_model_id
    );

    let mut component = ComputingComponent::new();
    if let Some(samples) = cli.samples {
        component = component.with_percentile_samples(samples);
    }

    let aborter = Aborter::new();
    let response = match component.compute(&request, &aborter) {
        Ok(response) => response,
        Err(error) => {
            anyhow::bail!("computation failed ({:?}): {}", error.status(), error);
        }
    };

    pk_engine::output::save_response(&response, &cli.output)?;
    info!("results saved to {:?}", cli.output);
    Ok(())
}
