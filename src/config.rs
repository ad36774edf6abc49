use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::pipeline::{FailurePolicy, PipelineConfig};
use crate::schema::RowPolicy;
use crate::sink::{OutputMode, OutputTarget};

/// Map patient insurance records onto a CMS-1500 CSV layout.
#[derive(Debug, Parser)]
#[command(name = "claimmapper", version)]
pub struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Map a patient batch through a schema into CSV
    Map(MapArgs),
    /// Write fake patient records as JSONL
    Generate(GenerateArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnError {
    Skip,
    Abort,
}

impl From<OnError> for FailurePolicy {
    fn from(value: OnError) -> Self {
        match value {
            OnError::Skip => FailurePolicy::Skip,
            OnError::Abort => FailurePolicy::Abort,
        }
    }
}

#[derive(Debug, Args)]
pub struct MapArgs {
    /// Schema table (CSV)
    #[arg(long)]
    pub schema: PathBuf,

    /// Patient batch: a JSON document or JSONL
    #[arg(long)]
    pub input: PathBuf,

    /// CSV destination; stdout when omitted
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Row policy when the schema does not set one: tall, wide or wide:N
    #[arg(long, default_value = "wide:3")]
    pub policy: RowPolicy,

    #[arg(long, value_enum, default_value_t = OnError::Skip)]
    pub on_error: OnError,

    /// Write rows as they are produced instead of committing at the end
    #[arg(long)]
    pub streaming: bool,

    /// Concurrent patient jobs; defaults to available parallelism
    #[arg(long)]
    pub workers: Option<usize>,

    /// Also write the run report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Coverage classifier rules, e.g. "tricare=government;cobra=group"
    #[arg(long)]
    pub classifier_rules: Option<String>,

    #[arg(long, default_value_t = 500)]
    pub classifier_timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    #[arg(long)]
    pub output: PathBuf,

    #[arg(long, default_value_t = 10)]
    pub count: usize,
}

/// Resolved settings for a `map` run.
#[derive(Clone, Debug)]
pub struct Config {
    pub schema_path: PathBuf,
    pub input_path: PathBuf,
    pub output: OutputTarget,
    pub report_path: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub classifier_rules: Option<String>,
    pub classifier_timeout: Duration,
}

impl From<MapArgs> for Config {
    fn from(args: MapArgs) -> Self {
        let workers = args.workers.filter(|w| *w > 0).unwrap_or_else(default_workers);
        Config {
            schema_path: args.schema,
            input_path: args.input,
            output: args.output.map_or(OutputTarget::Stdout, OutputTarget::File),
            report_path: args.report,
            pipeline: PipelineConfig {
                default_policy: args.policy,
                failure_policy: args.on_error.into(),
                output_mode: if args.streaming {
                    OutputMode::Streaming
                } else {
                    OutputMode::Atomic
                },
                workers,
            },
            classifier_rules: args.classifier_rules,
            classifier_timeout: Duration::from_millis(args.classifier_timeout_ms),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_map(args: &[&str]) -> Config {
        let cli = Cli::try_parse_from(args).expect("arguments should parse");
        match cli.command {
            Command::Map(map) => Config::from(map),
            other => panic!("Expected map command, got {:?}", other),
        }
    }

    #[test]
    fn test_map_defaults() {
        let config = parse_map(&["claimmapper", "map", "--schema", "s.csv", "--input", "p.json"]);
        assert_eq!(config.output, OutputTarget::Stdout);
        assert_eq!(config.pipeline.default_policy, RowPolicy::Wide { slots: 3 });
        assert_eq!(config.pipeline.failure_policy, FailurePolicy::Skip);
        assert_eq!(config.pipeline.output_mode, OutputMode::Atomic);
        assert!(config.pipeline.workers >= 1);
        assert_eq!(config.classifier_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_map_options() {
        let config = parse_map(&[
            "claimmapper",
            "-v",
            "map",
            "--schema",
            "s.csv",
            "--input",
            "p.json",
            "--output",
            "out.csv",
            "--policy",
            "tall",
            "--on-error",
            "abort",
            "--streaming",
            "--workers",
            "3",
        ]);
        assert_eq!(config.output, OutputTarget::File(PathBuf::from("out.csv")));
        assert_eq!(config.pipeline.default_policy, RowPolicy::Tall);
        assert_eq!(config.pipeline.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.pipeline.output_mode, OutputMode::Streaming);
        assert_eq!(config.pipeline.workers, 3);
    }

    #[test]
    fn test_rejects_bad_policy() {
        let result = Cli::try_parse_from(["claimmapper", "map", "--schema", "s", "--input", "p", "--policy", "wide:0"]);
        assert!(result.is_err());
    }
}
