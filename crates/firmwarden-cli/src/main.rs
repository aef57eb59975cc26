use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use firmwarden_core::{
    analyze, explain_attack_path,
    report::{render_explanation, render_findings, render_scan, render_scans},
    AttackPathExplainer, BundleFileProvider, CorrelationEngine, ErrorPayload, OutputFormat,
    ScanOrchestrator, ScanRegistry, ScanRequest, ScanStatus,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(
    name = "firmwarden",
    author,
    version,
    about = "Firmware scan orchestrator and risk correlator"
)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Scan registry file (default: $FIRMWARDEN_STATE_DIR/scan_registry.json)
    #[arg(long, value_name = "FILE", global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the analysis tool against a firmware image and wait for it to finish
    Scan {
        firmware: PathBuf,
        /// Directory that receives the per-scan output directory
        #[arg(long, value_name = "DIR", default_value = "./logs")]
        log_base: PathBuf,
        /// Confirm the tool's overwrite prompt
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show one scan record
    Status {
        scan_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List all recorded scans
    List {
        #[arg(long)]
        json: bool,
    },
    /// Ask a running scan to stop
    Stop { scan_id: String },
    /// Correlate the evidence of a scan output directory or bundle file
    Findings {
        #[arg(value_name = "LOG_DIR|BUNDLE")]
        target: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Explain how one finding could be exploited
    Explain {
        #[arg(value_name = "LOG_DIR|BUNDLE")]
        target: PathBuf,
        /// Finding index as listed by `findings`
        #[arg(long, default_value_t = 0)]
        index: usize,
        #[arg(long)]
        json: bool,
    },
}

fn format_for(json: bool) -> OutputFormat {
    if json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    let registry_path = config.registry_path(cli.registry.as_deref());

    match cli.command {
        Commands::Scan {
            firmware,
            log_base,
            force,
            json,
        } => {
            let request = ScanRequest {
                firmware,
                log_base,
                force_overwrite: force,
            };
            run_scan(&config, &registry_path, request, format_for(json)).await
        }
        Commands::Status { scan_id, json } => {
            let registry = ScanRegistry::open_file(&registry_path);
            match registry.get_scan(&scan_id) {
                Ok(record) => {
                    emit(&render_scan(&record, format_for(json))?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => emit_error(&err.payload()),
            }
        }
        Commands::List { json } => {
            let registry = ScanRegistry::open_file(&registry_path);
            emit(&render_scans(&registry.list_scans(), format_for(json))?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stop { scan_id } => {
            let registry = ScanRegistry::open_file(&registry_path);
            match registry.stop_scan(&scan_id) {
                Ok(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => emit_error(&err.payload()),
            }
        }
        Commands::Findings { target, json } => {
            let engine = CorrelationEngine::new(config.policy.clone())?;
            match analyze(&BundleFileProvider::new(), &engine, &target).await {
                Ok(report) => {
                    info!(findings = report.count, target = %target.display(), "correlation complete");
                    emit(&render_findings(&report, format_for(json))?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => emit_error(&err.payload()),
            }
        }
        Commands::Explain {
            target,
            index,
            json,
        } => {
            let engine = CorrelationEngine::new(config.policy.clone())?;
            let explainer = AttackPathExplainer::new(&config.policy);
            let provider = BundleFileProvider::new();
            match explain_attack_path(&provider, &engine, &explainer, &target, index).await {
                Ok(explanation) => {
                    emit(&render_explanation(&explanation, format_for(json))?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => emit_error(&err.payload()),
            }
        }
    }
}

async fn run_scan(
    config: &AppConfig,
    registry_path: &Path,
    request: ScanRequest,
    format: OutputFormat,
) -> Result<ExitCode> {
    let registry = Arc::new(ScanRegistry::open_file(registry_path));
    let orchestrator = ScanOrchestrator::new(registry.clone(), config.analyzer_settings());
    let launched = match orchestrator.start_scan(request).await {
        Ok(launched) => launched,
        Err(err) => return emit_error(&err.payload()),
    };

    let started = launched.started;
    let clock = Instant::now();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&started)?),
        OutputFormat::Human => eprintln!(
            "{} scan {} -> {}",
            "Started".bold(),
            started.scan_id,
            started.log_dir.display()
        ),
    }

    let mut completion = launched.completion;
    let status = tokio::select! {
        joined = &mut completion => joined.context("scan task aborted")?,
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("failed to listen for CTRL-C")?;
            warn!(scan_id = %started.scan_id, "interrupt received; stopping scan");
            if let Err(err) = registry.stop_scan(&started.scan_id) {
                warn!(scan_id = %started.scan_id, error = %err, "stop request failed");
            }
            completion.await.context("scan task aborted")?
        }
    };
    registry.flush()?;

    let record = registry.get_scan(&started.scan_id)?;
    if format == OutputFormat::Human {
        let elapsed = humantime::format_duration(std::time::Duration::from_secs(
            clock.elapsed().as_secs(),
        ));
        let label = match status {
            ScanStatus::Finished => status.as_str().green().bold(),
            _ => status.as_str().red().bold(),
        };
        eprintln!("{label} after {elapsed}");
    }
    emit(&render_scan(&record, format)?);

    Ok(if status == ScanStatus::Finished {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn emit(text: &str) {
    if text.ends_with('\n') {
        print!("{text}");
    } else {
        println!("{text}");
    }
}

fn emit_error(payload: &ErrorPayload) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(payload)?);
    Ok(ExitCode::FAILURE)
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
