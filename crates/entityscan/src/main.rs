//! entityscan command-line entry point
//!
//! Exit codes: 0 complete, 1 fatal configuration or I/O error,
//! 3 interrupted with a partial report written.

use anyhow::Result;
use clap::Parser;
use entityscan::cli::{CheckConfigArgs, Cli, Commands, MergeArgs, ScanArgs, SourceArgs};
use entityscan::scan::default_report_path;
use entityscan::{
    run_batch, run_merge, spawn_signal_listener, BatchRequest, MergeRequest, PipelineConfig,
    ResumeMode, ScanRequest, Scanner, StopSignal, EXIT_FATAL, EXIT_OK,
};
use entityscan_classifiers::PatternClassifier;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Scan(args) => scan(args).await,
        Commands::Batch(args) => {
            let request = BatchRequest::from_args(&args, cli.verbose, cli.json_logs)?;
            let stop = StopSignal::new();
            spawn_signal_listener(stop.clone());

            let summary = run_batch(request, stop).await?;
            println!(
                "{} inputs: {} complete, {} partial, {} failed, {} skipped",
                summary.workers.len(),
                summary.complete,
                summary.partial,
                summary.failed,
                summary.skipped
            );
            Ok(summary.exit_code())
        }
        Commands::Merge(args) => merge(args),
        Commands::CheckConfig(args) => check_config(args),
    }
}

async fn scan(args: ScanArgs) -> Result<i32> {
    let metrics = match &args.metrics_file {
        Some(_) => Some(init_metrics()?),
        None => None,
    };

    let config = PipelineConfig::load(args.config.as_deref(), &args.source)?;
    let classifier = PatternClassifier::from_config(&config.patterns)?;
    info!(
        "Loaded {} inclusion and {} exclusion groups",
        classifier.inclusion_count(),
        classifier.exclusion_count()
    );

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_report_path(&args.input));
    let mut request = ScanRequest::new(args.input.clone(), output);
    request.resume = match (args.resume, args.resume_from) {
        (true, _) => ResumeMode::FromCheckpoint,
        (false, Some(line)) => ResumeMode::FromLine(line),
        (false, None) => ResumeMode::Fresh,
    };
    request.db = args.db.clone();
    if let Some(source_id) = &args.source_id {
        request.source_id = source_id.clone();
    }

    let stop = StopSignal::new();
    spawn_signal_listener(stop.clone());

    // The scan loop is synchronous; keep it off the runtime threads so the
    // signal listener stays responsive
    let outcome = tokio::task::spawn_blocking(move || {
        Scanner::new(&config, &classifier, stop).run(&request)
    })
    .await??;

    println!("{}", outcome.report.render_summary());
    println!("Report: {}", outcome.report_path.display());

    if let (Some(handle), Some(path)) = (metrics, &args.metrics_file) {
        std::fs::write(path, handle.render())?;
        info!("Wrote metrics to {}", path.display());
    }

    Ok(outcome.exit_code())
}

fn merge(args: MergeArgs) -> Result<i32> {
    let merged = run_merge(&MergeRequest {
        reports: args.reports,
        output: args.output.clone(),
        shards: args.shards,
        db: args.db,
    })?;

    println!("{}", merged.render_summary());
    println!("Report: {}", args.output.display());
    Ok(EXIT_OK)
}

fn check_config(args: CheckConfigArgs) -> Result<i32> {
    let config = PipelineConfig::load(args.config.as_deref(), &SourceArgs::default())?;
    let classifier = PatternClassifier::from_config(&config.patterns)?;

    println!(
        "{} groups ({} inclusion, {} exclusion), fingerprint {}",
        classifier.inclusion_count() + classifier.exclusion_count(),
        classifier.inclusion_count(),
        classifier.exclusion_count(),
        classifier.fingerprint()
    );
    for group in classifier.groups() {
        let kind = if group.is_exclusion() {
            "exclude".to_string()
        } else {
            group.risk_tier().as_str().to_string()
        };
        println!(
            "  {:>4}  {:<9} {:<32} {:<32} {} patterns",
            group.priority(),
            kind,
            group.name(),
            group.category(),
            group.pattern_count()
        );
    }
    Ok(EXIT_OK)
}

/// Initialize tracing/logging on stderr; stdout carries the summary
fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("entityscan=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("entityscan=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

/// Initialize the Prometheus recorder and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;
    entityscan_telemetry::metrics::describe_metrics();

    info!("Metrics recorder initialized");
    Ok(handle)
}
