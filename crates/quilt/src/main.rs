//! quilt - batch fusion for tensor dataflow graphs
//!
//! Reads a graph file, tiles its batch onto one spatial canvas, and writes
//! the fused graph together with a report of what the pass did.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand, ValueEnum};
use quilt_fuse::{BatchFuser, FusedGraph, FusionOptions};
use quilt_graph::Graph;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Batch fusion for tensor dataflow graphs
#[derive(Parser, Debug)]
#[command(name = "quilt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The command to execute
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Report formats
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    /// Human-readable summary
    Text,
    /// JSON object
    Json,
}

/// Options shared by every command that runs the pass
#[derive(clap::Args, Debug)]
struct PassArgs {
    /// Pass configuration (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<Utf8PathBuf>,

    /// Number of samples to tile, overriding the configuration
    #[arg(long, value_name = "N")]
    tiles: Option<usize>,
}

/// Subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Fuse a graph and write the result
    Fuse {
        /// Graph file (JSON)
        #[arg(value_name = "GRAPH")]
        graph: Utf8PathBuf,

        /// Output file name [default: <GRAPH>.fused.json]
        #[arg(short, long, value_name = "FILE")]
        output: Option<Utf8PathBuf>,

        #[command(flatten)]
        pass: PassArgs,

        /// Report format
        #[arg(long, value_enum, default_value = "text")]
        report: ReportFormat,
    },

    /// Show a graph and where the pass would place each tensor
    Inspect {
        /// Graph file (JSON)
        #[arg(value_name = "GRAPH")]
        graph: Utf8PathBuf,

        #[command(flatten)]
        pass: PassArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Fuse {
            ref graph,
            ref output,
            ref pass,
            report,
        } => fuse(graph, output.as_deref(), pass, report),
        Commands::Inspect { ref graph, ref pass } => inspect(graph, pass),
    }
}

fn load_graph(path: &Utf8Path) -> Result<Graph> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    Graph::from_json(&text).with_context(|| format!("failed to parse graph {path}"))
}

fn load_options(pass: &PassArgs) -> Result<FusionOptions> {
    let mut options = match &pass.config {
        Some(path) => FusionOptions::load(path).with_context(|| format!("invalid configuration {path}"))?,
        None => FusionOptions::default(),
    };
    if let Some(tiles) = pass.tiles {
        options = options.with_tile_count(tiles);
    }
    Ok(options)
}

fn run_pass(graph: &Graph, pass: &PassArgs) -> Result<FusedGraph> {
    let options = load_options(pass)?;
    let fused = BatchFuser::new(options).fuse(graph).context("batch fusion failed")?;
    let missing = fused.missing_outputs();
    if !missing.is_empty() {
        tracing::warn!("{} output(s) could not be fused: {:?}", missing.len(), missing);
    }
    Ok(fused)
}

/// Fuse a graph file
fn fuse(path: &Utf8Path, output: Option<&Utf8Path>, pass: &PassArgs, report: ReportFormat) -> Result<()> {
    tracing::info!("Fusing {}", path);
    let graph = load_graph(path)?;
    let fused = run_pass(&graph, pass)?;

    let output = output.map_or_else(|| path.with_extension("fused.json"), Utf8Path::to_path_buf);
    let json = fused.graph.to_json().context("failed to serialize fused graph")?;
    std::fs::write(&output, json).with_context(|| format!("failed to write {output}"))?;
    tracing::info!("Generated: {}", output);

    match report {
        ReportFormat::Text => print!("{}", fused.report),
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&fused.report)?),
    }
    Ok(())
}

/// Print a graph summary and the placement of every tensor
fn inspect(path: &Utf8Path, pass: &PassArgs) -> Result<()> {
    let graph = load_graph(path)?;

    let mut kinds: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, op) in graph.ops() {
        *kinds.entry(op.kind.name()).or_default() += 1;
    }
    println!("{path}");
    println!(
        "  {} tensors, {} operations, {} inputs, {} outputs",
        graph.num_tensors(),
        graph.num_ops(),
        graph.inputs().len(),
        graph.outputs().len()
    );
    for (kind, count) in &kinds {
        println!("  {kind:<12} {count:>4}");
    }

    let fused = run_pass(&graph, pass)?;
    println!();
    println!(
        "  {:<16} {:<16} {:<8} {:<8} {}",
        "tensor", "shape", "place", "gap", "canvas"
    );
    for (id, tensor) in graph.tensors() {
        let label = tensor.name.clone().unwrap_or_else(|| id.to_string());
        let shape = tensor.spec.shape.to_string();
        match fused.tensor_info(id) {
            Some(info) => println!(
                "  {:<16} {:<16} {:<8} {:<8} {}",
                label,
                shape,
                format!("{:?}", info.placement).to_lowercase(),
                format!("{}x{}", info.gap[0], info.gap[1]),
                info.canvas_shape
            ),
            None => println!("  {label:<16} {shape:<16} skipped"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use quilt_graph::{DType, OpKind, PadParams, TensorAttr, TensorSpec};

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    /// A four-sample zero pad, written as `model.json`.
    fn write_graph(root: &Utf8Path) -> Utf8PathBuf {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 2, 6, 6], TensorAttr::Input));
        let pad = OpKind::Pad(PadParams {
            front: vec![0, 0, 1, 1],
            back: vec![0, 0, 1, 1],
            value: 0.0,
        });
        g.emit(pad, &[x], TensorAttr::Output).unwrap();
        let path = root.join("model.json");
        std::fs::write(&path, g.to_json().unwrap()).unwrap();
        path
    }

    fn no_pass_args() -> PassArgs {
        PassArgs {
            config: None,
            tiles: None,
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fuse_flags() {
        let cli = Cli::try_parse_from([
            "quilt", "fuse", "model.json", "--tiles", "4", "--report", "json", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Fuse {
            graph,
            output,
            pass,
            report,
        } = cli.command
        else {
            panic!("expected the fuse command");
        };
        assert_eq!(graph, Utf8PathBuf::from("model.json"));
        assert!(output.is_none());
        assert!(pass.config.is_none());
        assert_eq!(pass.tiles, Some(4));
        assert_eq!(report, ReportFormat::Json);
    }

    #[test]
    fn test_tiles_flag_overrides_config() {
        let (_dir, root) = utf8_tempdir();
        let config = root.join("quilt.toml");
        std::fs::write(&config, "tile_count = 2\nmax_backward_passes = 8\n").unwrap();

        let pass = PassArgs {
            config: Some(config.clone()),
            tiles: None,
        };
        assert_eq!(load_options(&pass).unwrap().tile_count, Some(2));

        let pass = PassArgs {
            config: Some(config),
            tiles: Some(4),
        };
        let options = load_options(&pass).unwrap();
        assert_eq!(options.tile_count, Some(4));
        assert_eq!(options.max_backward_passes, 8);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let (_dir, root) = utf8_tempdir();
        let config = root.join("quilt.toml");
        std::fs::write(&config, "tile_count = 0\n").unwrap();
        let pass = PassArgs {
            config: Some(config),
            tiles: None,
        };
        let err = load_options(&pass).unwrap_err();
        assert!(err.to_string().starts_with("invalid configuration"));
    }

    #[test]
    fn test_fuse_writes_next_to_the_graph() {
        let (_dir, root) = utf8_tempdir();
        let path = write_graph(&root);
        fuse(&path, None, &no_pass_args(), ReportFormat::Json).unwrap();

        let fused = load_graph(&root.join("model.fused.json")).unwrap();
        assert_eq!(fused.inputs().len(), 1);
        assert_eq!(fused.outputs().len(), 1);
        assert_eq!(fused.shape(fused.inputs()[0]).dims(), &[4, 2, 6, 6]);
        assert_eq!(fused.shape(fused.outputs()[0]).dims(), &[4, 2, 8, 8]);
    }

    #[test]
    fn test_fuse_honours_output_path() {
        let (_dir, root) = utf8_tempdir();
        let path = write_graph(&root);
        let output = root.join("out.json");
        fuse(&path, Some(&output), &no_pass_args(), ReportFormat::Text).unwrap();

        assert!(output.exists());
        assert!(!root.join("model.fused.json").exists());
        assert!(load_graph(&output).is_ok());
    }

    #[test]
    fn test_inspect_runs_the_pass() {
        let (_dir, root) = utf8_tempdir();
        let path = write_graph(&root);
        assert!(inspect(&path, &no_pass_args()).is_ok());
        assert!(inspect(&root.join("missing.json"), &no_pass_args()).is_err());
    }
}
