//! defectseg CLI — segment surface defects in images.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use defectseg::pipeline::{pair_outputs, run_batch};
use defectseg::topology::WeightBinding;
use defectseg::{FailurePolicy, GgufFile, SegmentConfig, Segmenter, Topology};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "defectseg")]
#[command(about = "Binary defect masks from a ResNet50-UNet segmentation model")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment one or more images and write JPEG masks.
    Segment(CliSegmentArgs),

    /// Print the layer table and execution plan summary.
    Topology {
        /// Dump the full topology as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List the tensors stored in a GGUF model file.
    ModelInfo {
        #[arg(short = 'm', long = "model", default_value = "modelunet.gguf")]
        model: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct CliSegmentArgs {
    /// Mask threshold: probabilities below it become background.
    #[arg(long = "thresh", visible_alias = "th")]
    threshold: Option<f32>,

    /// GGUF model file.
    #[arg(short = 'm', long = "model", default_value = "modelunet.gguf")]
    model: PathBuf,

    /// Compute threads (defaults to the number of cores).
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Input images.
    #[arg(short = 'i', long = "inp", num_args = 1.., required = true)]
    inputs: Vec<PathBuf>,

    /// Output masks, paired with inputs by position.
    #[arg(short = 'o', long = "out", num_args = 1..)]
    outputs: Vec<PathBuf>,

    /// JSON configuration file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop at the first failed image.
    #[arg(long)]
    fail_fast: bool,

    /// Write a JSON batch report.
    #[arg(long)]
    report: Option<PathBuf>,
}

impl CliSegmentArgs {
    fn to_config(&self) -> CliResult<SegmentConfig> {
        let mut config = match &self.config {
            Some(path) => SegmentConfig::from_json_file(path)?,
            None => SegmentConfig::default(),
        };
        if let Some(t) = self.threshold {
            config.threshold = t;
        }
        if self.threads.is_some() {
            config.engine.threads = self.threads;
        }
        if self.fail_fast {
            config.failure_policy = FailurePolicy::FailFast;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Segment(args) => run_segment(&args),
        Commands::Topology { json } => run_topology(json),
        Commands::ModelInfo { model } => run_model_info(&model),
    }
}

// ── segment ────────────────────────────────────────────────────────────

fn run_segment(args: &CliSegmentArgs) -> CliResult<()> {
    let config = args.to_config()?;
    let policy = config.failure_policy;
    tracing::info!(
        model = %args.model.display(),
        inputs = args.inputs.len(),
        threshold = config.threshold,
        "starting segmentation"
    );

    let segmenter = Segmenter::from_model_file(&args.model, config)?;
    let jobs = pair_outputs(&args.inputs, &args.outputs);
    let report = run_batch(&segmenter, &jobs, policy);

    if let Some(path) = &args.report {
        report.write_json(path)?;
        tracing::info!(path = %path.display(), "report written");
    }

    if report.failed > 0 {
        return Err(format!("{} of {} images failed", report.failed, report.total()).into());
    }
    Ok(())
}

// ── topology ───────────────────────────────────────────────────────────

fn run_topology(json: bool) -> CliResult<()> {
    let topology = Topology::reference();
    let plan = topology.build_plan()?;

    if json {
        println!("{}", serde_json::to_string_pretty(topology)?);
        return Ok(());
    }

    println!("{} ({} -> {})", topology.name, topology.input, topology.output);
    println!(
        "  {:>3}  {:<24} {:<24} {:>2} {:>3} {:>3} {:>4}  binding",
        "id", "conv", "batch-norm", "k", "pad", "str", "relu"
    );
    for (i, spec) in topology.layers.iter().enumerate() {
        let binding = match spec.binding {
            WeightBinding::Standalone => "",
            WeightBinding::DualOutput => "dual-output",
            WeightBinding::SuppliedByPrevious => "supplied",
        };
        println!(
            "  {:>3}  {:<24} {:<24} {:>2} {:>3} {:>3} {:>4}  {}",
            i,
            spec.conv,
            spec.bn.unwrap_or("-"),
            spec.kernel,
            spec.padding,
            spec.stride,
            if spec.activation { "yes" } else { "no" },
            binding
        );
    }

    let extents = plan.infer_spatial(topology)?;
    println!("plan: {} nodes, output {}", plan.len(), plan.output());
    for skip in plan.retained() {
        let (w, h) = extents[skip.node.0];
        println!("  retained {:?} at {} ({}x{})", skip.source, skip.node, w, h);
    }
    Ok(())
}

// ── model-info ─────────────────────────────────────────────────────────

fn run_model_info(model: &std::path::Path) -> CliResult<()> {
    let file = GgufFile::open(model)?;
    println!("{}", model.display());
    println!("  gguf version:  {}", file.version());
    println!("  architecture:  {}", file.architecture().unwrap_or("-"));
    println!("  alignment:     {}", file.alignment());
    println!("  tensors:       {}", file.tensors().len());
    for info in file.tensors() {
        println!("    {:<40} {:?} {:?}", info.name, info.dims, info.ggml_type);
    }
    Ok(())
}
