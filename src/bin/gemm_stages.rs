//! gemm-stages: run a GEMM stage pipeline from a description file or preset
//!
//! Usage:
//!   gemm-stages run --preset conv-ladder
//!   gemm-stages run --config stages.json --report report.json
//!   gemm-stages run --preset tiny --backend vulkan --shader shader/spv/gemm_strided.spv
//!   gemm-stages validate --config stages.json
//!   gemm-stages presets
//!
//! Exit status is 0 when every stage ran and the result was downloaded,
//! 1 otherwise. Set RUST_LOG=debug for per-stage logging.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use gemm_stages::{
    presets, CpuBackend, ExecutionContext, ExecutorOptions, GemmBackend, PipelineDescription,
    PipelineError, PipelineExecutor, RunReport,
};

/// Run a fixed sequence of strided GEMM stages over shared device buffers
#[derive(Parser)]
#[command(name = "gemm-stages")]
#[command(version)]
#[command(about = "Run a fixed sequence of strided GEMM stages over shared device buffers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate, upload, run every stage and download the result
    Run {
        #[command(flatten)]
        source: Source,

        /// Device backend
        #[arg(long, value_enum, default_value_t = BackendKind::Cpu)]
        backend: BackendKind,

        /// Memory budget of the CPU backend in MiB
        #[arg(long)]
        device_memory_mib: Option<u64>,

        /// Compiled GEMM shader for the Vulkan backend
        #[arg(long, default_value = "shader/spv/gemm_strided.spv")]
        shader: PathBuf,

        /// Write a JSON run report to this path
        #[arg(long)]
        report: Option<PathBuf>,

        /// Fail if the result contains NaN or infinity
        #[arg(long)]
        validate_finite: bool,

        /// Number of leading result values to print
        #[arg(long, default_value_t = 8)]
        show: usize,
    },

    /// Allocate buffers and validate the stage list without running it
    Validate {
        #[command(flatten)]
        source: Source,
    },

    /// List built-in pipeline presets
    Presets,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Source {
    /// Pipeline description (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in preset name
    #[arg(long)]
    preset: Option<String>,
}

impl Source {
    fn load(&self) -> Result<PipelineDescription, PipelineError> {
        match (&self.config, &self.preset) {
            (Some(path), _) => PipelineDescription::from_path(path),
            (None, Some(name)) => presets::by_name(name).ok_or_else(|| {
                PipelineError::config(format!(
                    "unknown preset '{}' (available: {})",
                    name,
                    presets::PRESET_NAMES.join(", ")
                ))
            }),
            (None, None) => Err(PipelineError::config("no pipeline description given")),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Cpu,
    Vulkan,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.stage() {
                Some(stage) => eprintln!("error [{}] at stage {}: {}", err.kind(), stage, err),
                None => eprintln!("error [{}]: {}", err.kind(), err),
            }
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Commands) -> Result<(), PipelineError> {
    match command {
        Commands::Run {
            source,
            backend,
            device_memory_mib,
            shader,
            report,
            validate_finite,
            show,
        } => {
            let description = source.load()?;
            let executor = PipelineExecutor::with_options(ExecutorOptions { validate_finite });

            let run_report = match backend {
                BackendKind::Cpu => {
                    let cpu = match device_memory_mib {
                        Some(mib) => CpuBackend::with_memory_budget(memory_budget_bytes(mib)?),
                        None => CpuBackend::new(),
                    };
                    run_on(cpu, &description, &executor)?
                }
                BackendKind::Vulkan => run_vulkan(&shader, &description, &executor)?,
            };

            print_report(&run_report, show);

            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&run_report)?)?;
                println!("Report written to {}", path.display());
            }
            Ok(())
        }

        Commands::Validate { source } => {
            let description = source.load()?;
            let mut ctx = ExecutionContext::new(CpuBackend::new());
            let prepared = description.prepare(&mut ctx)?;

            println!("Layout: {:?}", prepared.stages().layout());
            for (_, buffer) in prepared.buffers().iter() {
                println!(
                    "  buffer {:<10} role {} {:>12} bytes",
                    buffer.name(),
                    buffer.role(),
                    buffer.capacity_bytes()
                );
            }
            for stage in prepared.stages().iter() {
                let (m, n, k) = stage.stage().shape();
                println!(
                    "  [{:>2}] {:<12} m={:<7} n={:<7} k={:<5} seed={:?}{}",
                    stage.index(),
                    stage.name(),
                    m,
                    n,
                    k,
                    stage.stage().result_seed(),
                    if stage.needs_barrier() { " barrier" } else { "" }
                );
            }
            println!(
                "OK: {} stages, {:.3} GFLOP",
                prepared.stages().len(),
                prepared.stages().total_flops() as f64 / 1e9
            );
            Ok(())
        }

        Commands::Presets => {
            for name in presets::PRESET_NAMES {
                if let Some(description) = presets::by_name(name) {
                    println!(
                        "{:<12} {} stages, {:?}",
                        name,
                        description.stages.len(),
                        description.layout
                    );
                }
            }
            Ok(())
        }
    }
}

fn memory_budget_bytes(mib: u64) -> Result<u64, PipelineError> {
    mib.checked_mul(1024 * 1024).ok_or_else(|| {
        PipelineError::config(format!("device memory budget of {} MiB is too large", mib))
    })
}

fn run_on<B: GemmBackend>(
    backend: B,
    description: &PipelineDescription,
    executor: &PipelineExecutor,
) -> Result<RunReport, PipelineError> {
    let mut ctx = ExecutionContext::new(backend);
    let prepared = description.prepare(&mut ctx)?;
    prepared.execute(executor, &mut ctx)
}

#[cfg(feature = "vulkan")]
fn run_vulkan(
    shader: &std::path::Path,
    description: &PipelineDescription,
    executor: &PipelineExecutor,
) -> Result<RunReport, PipelineError> {
    let backend = gemm_stages::VulkanBackend::from_spirv_path(shader)?;
    run_on(backend, description, executor)
}

#[cfg(not(feature = "vulkan"))]
fn run_vulkan(
    _shader: &std::path::Path,
    _description: &PipelineDescription,
    _executor: &PipelineExecutor,
) -> Result<RunReport, PipelineError> {
    Err(PipelineError::Device(gemm_stages::DeviceError::InitializationFailed(
        "built without the `vulkan` feature".to_string(),
    )))
}

fn print_report(report: &RunReport, show: usize) {
    println!("Device: {}", report.device);
    for stage in &report.stages {
        println!(
            "  [{:>2}] {:<12} {}x{}x{} {:>10.3} ms{}",
            stage.index,
            stage.name,
            stage.m,
            stage.n,
            stage.k,
            stage.elapsed_secs * 1e3,
            if stage.barrier { "  (after barrier)" } else { "" }
        );
    }
    let output = report.output();
    let head: Vec<String> = output.iter().take(show).map(|v| format!("{}", v)).collect();
    println!(
        "Result '{}': {} values [{}{}]",
        report.result_buffer,
        output.len(),
        head.join(", "),
        if output.len() > show { ", ..." } else { "" }
    );
    println!(
        "Total: {:.3} s, {:.2} GFLOP/s, sha256 {}",
        report.elapsed_secs,
        report.gflops(),
        report.output_digest
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_budget_bytes() {
        assert_eq!(memory_budget_bytes(0).unwrap(), 0);
        assert_eq!(memory_budget_bytes(64).unwrap(), 64 << 20);
    }

    #[test]
    fn test_memory_budget_overflow_is_configuration_error() {
        assert!(matches!(
            memory_budget_bytes(u64::MAX),
            Err(PipelineError::Configuration { .. })
        ));
    }
}
