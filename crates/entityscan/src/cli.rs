//! Command-line interface

use clap::{Args, Parser, Subcommand};
use entityscan_core::{Compression, DecodePolicy, Encoding, InputFormat};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "entityscan")]
#[command(
    author,
    version,
    about = "Streaming entity detection for very large OSINT bulk files"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan one input file
    Scan(ScanArgs),

    /// Scan many input files in parallel worker processes
    Batch(BatchArgs),

    /// Sum several run reports (and optionally store shards) into one
    Merge(MergeArgs),

    /// Validate a pattern configuration and print its groups
    CheckConfig(CheckConfigArgs),
}

/// How inputs are read; overrides the `source:` section of the config file
#[derive(Args, Debug, Clone, Default)]
pub struct SourceArgs {
    /// Text encoding: utf-8 or latin-1
    #[arg(long, value_parser = parse_enum::<Encoding>)]
    pub encoding: Option<Encoding>,

    /// Undecodable lines: replace or skip
    #[arg(long, value_parser = parse_enum::<DecodePolicy>)]
    pub on_decode_error: Option<DecodePolicy>,

    /// Line layout: lines, tsv or csv
    #[arg(long, value_parser = parse_enum::<InputFormat>)]
    pub format: Option<InputFormat>,

    /// Columns to classify, by header name or zero-based index
    #[arg(long, value_delimiter = ',')]
    pub fields: Vec<String>,

    /// Delimited input has no header row
    #[arg(long)]
    pub no_header: bool,

    /// Compression: auto, none or gzip
    #[arg(long, value_parser = parse_enum::<Compression>)]
    pub compression: Option<Compression>,

    /// Known or approximate record count, used for ETA
    #[arg(long)]
    pub expected_records: Option<u64>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ScanArgs {
    /// Input file (plain, TSV/CSV, or .gz)
    #[arg(short, long)]
    pub input: PathBuf,

    /// Report path (default: <input name>.report.json in the working directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Pattern configuration (default: built-in patterns)
    #[arg(short, long, env = "ENTITYSCAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip lines up to and including LINE; the report covers only the rest
    #[arg(long, value_name = "LINE", conflicts_with = "resume")]
    pub resume_from: Option<u64>,

    /// Continue from the checkpoint next to the report, carrying its counts
    #[arg(long)]
    pub resume: bool,

    /// Also write matched records to this SQLite store
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Source identifier recorded in the report and store (default: input file name)
    #[arg(long)]
    pub source_id: Option<String>,

    /// Write Prometheus metrics to this file when the run ends
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Input glob patterns, e.g. 'data/**/*.tsv.gz'
    #[arg(long, num_args = 1.., required = true)]
    pub inputs: Vec<String>,

    /// Directory for reports, checkpoints and store shards
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Pattern configuration passed to every worker
    #[arg(short, long, env = "ENTITYSCAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Parallel workers (default: number of CPUs)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Kill a worker that runs longer than this
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Give each worker its own SQLite shard in the output directory
    #[arg(long)]
    pub db_shards: bool,

    /// Resume each worker from its checkpoint
    #[arg(long)]
    pub resume: bool,

    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(Args, Debug, Clone)]
pub struct MergeArgs {
    /// Reports to merge
    #[arg(required = true)]
    pub reports: Vec<PathBuf>,

    /// Merged report path
    #[arg(short, long)]
    pub output: PathBuf,

    /// SQLite shards to union into --db
    #[arg(long, num_args = 1.., requires = "db")]
    pub shards: Vec<PathBuf>,

    /// Destination store for --shards
    #[arg(long)]
    pub db: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckConfigArgs {
    /// Pattern configuration (default: built-in patterns)
    #[arg(short, long, env = "ENTITYSCAN_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Parse a CLI value through the type's serde names, so flags accept the
/// same spellings as the config file
fn parse_enum<T: DeserializeOwned>(s: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unsupported value `{}`", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_flags() {
        let cli = Cli::try_parse_from([
            "entityscan",
            "scan",
            "--input",
            "contracts.tsv.gz",
            "--format",
            "tsv",
            "--fields",
            "recipient_name,recipient_parent_name",
            "--encoding",
            "latin-1",
            "--resume-from",
            "1000",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        let Commands::Scan(args) = cli.command else {
            panic!("expected scan");
        };
        assert_eq!(args.input, PathBuf::from("contracts.tsv.gz"));
        assert_eq!(args.source.format, Some(InputFormat::Tsv));
        assert_eq!(args.source.encoding, Some(Encoding::Latin1));
        assert_eq!(
            args.source.fields,
            vec!["recipient_name", "recipient_parent_name"]
        );
        assert_eq!(args.resume_from, Some(1000));
    }

    #[test]
    fn test_resume_flags_conflict() {
        let result = Cli::try_parse_from([
            "entityscan",
            "scan",
            "--input",
            "a.txt",
            "--resume",
            "--resume-from",
            "5",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_enum_value() {
        let result = Cli::try_parse_from(["entityscan", "scan", "--input", "a", "--format", "xml"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_and_merge() {
        let cli = Cli::try_parse_from([
            "entityscan",
            "batch",
            "--inputs",
            "data/*.tsv",
            "data/*.gz",
            "--output-dir",
            "out",
            "--jobs",
            "4",
            "--db-shards",
        ])
        .unwrap();
        let Commands::Batch(args) = cli.command else {
            panic!("expected batch");
        };
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.jobs, Some(4));
        assert!(args.db_shards);

        let merge = Cli::try_parse_from(["entityscan", "merge", "a.json", "--output", "m.json"]);
        assert!(merge.is_ok());

        let shards_without_db = Cli::try_parse_from([
            "entityscan",
            "merge",
            "a.json",
            "--output",
            "m.json",
            "--shards",
            "a.sqlite",
        ]);
        assert!(shards_without_db.is_err());
    }
}
