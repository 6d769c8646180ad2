use clap::Parser;
use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use pose_graph_diagnostic::config::DiagnosticConfig;
use pose_graph_diagnostic::mapping::{diagnose, load_graph, write_csv, LevenbergMarquardt};
use pose_graph_diagnostic::utils::plot::plot_trajectories;

/// Reports how far each relative-pose constraint of a g2o graph is from the
/// initial estimate, then refines the estimate with Levenberg-Marquardt.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// g2o file to load.
    #[arg(default_value = "data/2d/2d-1.g2o")]
    file: PathBuf,

    /// Load SE2 poses and XY landmarks instead of SE3 poses.
    #[arg(long = "2d")]
    planar: bool,

    /// Optional JSON DiagnosticConfig. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of Levenberg-Marquardt iterations.
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Stop once the total graph error falls below this value.
    #[arg(long)]
    error_tol: Option<f64>,

    /// Write the per-factor residual report to this CSV file.
    #[arg(long)]
    residuals_csv: Option<PathBuf>,

    /// Draw the XY trajectory before and after optimization to this PNG file.
    #[arg(long)]
    plot: Option<PathBuf>,
}

/// Config file first, command line flags on top.
fn resolve_config(args: &Args) -> Result<DiagnosticConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => DiagnosticConfig::from_json_file(path)?,
        None => DiagnosticConfig::default(),
    };
    if let Some(max_iterations) = args.max_iterations {
        config.optimizer.max_iterations = max_iterations;
    }
    if let Some(error_tol) = args.error_tol {
        config.optimizer.error_tol = error_tol;
    }
    if args.residuals_csv.is_some() {
        config.residuals_csv = args.residuals_csv.clone();
    }
    if args.plot.is_some() {
        config.plot = args.plot.clone();
    }
    config.optimizer.validate()?;
    Ok(config)
}

/// Graph error before and after optimization.
#[derive(Debug, Clone, Copy)]
struct Summary {
    initial_error: Option<f64>,
    final_error: f64,
}

fn run(args: &Args, out: &mut impl Write) -> Result<Summary, Box<dyn Error>> {
    let config = resolve_config(args)?;
    let (graph, initial) = load_graph(&args.file, !args.planar)?;

    // a broken factor is reported by the diagnostic below, the optimizer then fails on it
    let initial_error = match graph.error(&initial) {
        Ok(error) => {
            writeln!(out, "Initial Error: {error}")?;
            Some(error)
        }
        Err(err) => {
            log::warn!("{}: initial error unavailable: {err}", graph.name);
            writeln!(out, "Initial Error: n/a")?;
            None
        }
    };

    let reports = diagnose(&graph, &initial);
    for report in &reports {
        writeln!(out, "{report}")?;
    }
    if let Some(path) = &config.residuals_csv {
        write_csv(File::create(path)?, &reports)?;
        log::info!("residual report written to {}", path.display());
    }

    let result = LevenbergMarquardt::new(config.optimizer.clone()).optimize(&graph, &initial)?;
    let final_error = graph.error(&result.estimates)?;
    writeln!(out, "Final Error: {final_error}")?;

    if let Some(path) = &config.plot {
        plot_trajectories(path, &graph.name, &initial, &result.estimates)?;
        log::info!("trajectory plot written to {}", path.display());
    }

    Ok(Summary {
        initial_error,
        final_error,
    })
}

fn main() {
    env_logger::init();
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let stdout = std::io::stdout();
    let summary = run(&args, &mut stdout.lock())?;
    if let Some(initial_error) = summary.initial_error {
        log::info!(
            "graph error reduced by {:.3}%",
            100.0 * (1.0 - summary.final_error / initial_error.max(f64::MIN_POSITIVE))
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pose_graph_diagnostic::mapping::{G2oError, OptimizerError};
    use std::fs;

    const GRAPH: &str = "\
VERTEX_SE3:QUAT 0 0 0 0 0 0 0 1
VERTEX_SE3:QUAT 1 1.2 0.1 0 0 0 0 1
VERTEX_SE3:QUAT 2 2.1 -0.2 0.1 0 0 0.0998334 0.9950042
EDGE_SE3:QUAT 0 1 1 0 0 0 0 0 1 1 0 0 0 0 0 1 0 0 0 0 1 0 0 0 1 0 0 1 0 1
EDGE_SE3:QUAT 1 2 1 0 0 0 0 0 1 1 0 0 0 0 0 1 0 0 0 0 1 0 0 0 1 0 0 1 0 1
EDGE_SE3:QUAT 2 5 1 0 0 0 0 0 1 1 0 0 0 0 0 1 0 0 0 0 1 0 0 0 1 0 0 1 0 1
";

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["pose-graph-diagnostic"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn cli_defaults() {
        let args = args(&[]);
        assert_eq!(PathBuf::from("data/2d/2d-1.g2o"), args.file);
        assert!(!args.planar);

        let args = super::tests::args(&["graph.g2o", "--2d", "--max-iterations", "7"]);
        assert!(args.planar);
        let config = resolve_config(&args).unwrap();
        assert_eq!(7, config.optimizer.max_iterations);
        assert_eq!(1e-8, config.optimizer.error_tol);
    }

    #[test]
    fn flags_override_config_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("config.json");
        fs::write(
            &config_path,
            r#"{ "optimizer": { "max_iterations": 3, "error_tol": 0.5 }, "plot": "a.png" }"#,
        )?;
        let args = args(&[
            "graph.g2o",
            "--config",
            config_path.to_str().unwrap(),
            "--error-tol",
            "0.25",
        ]);
        let config = resolve_config(&args)?;
        assert_eq!(3, config.optimizer.max_iterations);
        assert_eq!(0.25, config.optimizer.error_tol);
        assert_eq!(Some(PathBuf::from("a.png")), config.plot);
        Ok(())
    }

    #[test]
    fn bad_damping_is_rejected_before_loading() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("config.json");
        fs::write(&config_path, r#"{ "optimizer": { "lambda_factor": 1.0 } }"#)?;
        let args = args(&[
            "does/not/exist.g2o",
            "--config",
            config_path.to_str().unwrap(),
        ]);
        let mut out = Vec::new();
        let err = run(&args, &mut out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OptimizerError>(),
            Some(OptimizerError::InvalidParams(_))
        ));
        assert!(out.is_empty());
        Ok(())
    }

    #[test]
    fn end_to_end() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let graph_path = dir.path().join("three.g2o");
        let csv_path = dir.path().join("residuals.csv");
        fs::write(&graph_path, GRAPH)?;

        let args = args(&[
            graph_path.to_str().unwrap(),
            "--residuals-csv",
            csv_path.to_str().unwrap(),
        ]);
        let mut out = Vec::new();
        let result = run(&args, &mut out);
        // factor 2 references a missing vertex, the optimizer refuses the graph
        assert!(result.is_err());
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("Initial Error: n/a"));
        assert!(text.contains("Node 1 to 2"));
        assert!(text.contains("Factor 2 skipped: no estimate for key 5"));
        assert!(!text.contains("Final Error"));
        assert_eq!(4, fs::read_to_string(&csv_path)?.lines().count());

        let valid: String = GRAPH.lines().take(5).map(|l| format!("{l}\n")).collect();
        fs::write(&graph_path, valid)?;
        let mut out = Vec::new();
        let summary = run(&args, &mut out)?;
        let text = String::from_utf8(out)?;

        assert!(text.starts_with("Initial Error: "));
        assert!(text.contains("Node 0 to 1"));
        assert!(text.contains("Node 1 to 2"));
        assert!(text.contains("Translation difference v2: "));
        assert!(text.trim_end().lines().last().unwrap().starts_with("Final Error: "));
        let initial_error = summary.initial_error.unwrap();
        assert!(initial_error > 0.0);
        assert!(summary.final_error <= initial_error);
        assert!(summary.final_error < 1e-6);

        let csv = fs::read_to_string(&csv_path)?;
        assert_eq!(3, csv.lines().count());
        Ok(())
    }

    #[test]
    fn missing_graph_is_fatal() {
        let args = args(&["does/not/exist.g2o"]);
        let mut out = Vec::new();
        let err = run(&args, &mut out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<G2oError>(),
            Some(G2oError::FileNotFound(_))
        ));
    }
}
