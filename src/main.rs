use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use claimmapper::classifier::{BoundedClassifier, KeywordClassifier};
use claimmapper::config::{Cli, Command, Config};
use claimmapper::pipeline::Pipeline;
use claimmapper::{json_faker, logging, reader, reporter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;

    match cli.command {
        Command::Map(args) => run_map(Config::from(args)).await,
        Command::Generate(args) => json_faker::write_fake_patients_jsonl(&args.output, args.count),
    }
}

async fn run_map(config: Config) -> anyhow::Result<()> {
    let schema_text = reader::read_schema(&config.schema_path).await?;
    let records = reader::read_patients(&config.input_path).await?;

    let mut pipeline =
        Pipeline::from_schema_source(&schema_text, config.pipeline.clone()).context("invalid mapping schema")?;
    if let Some(rules) = &config.classifier_rules {
        let keywords = KeywordClassifier::parse(rules).context("invalid classifier rules")?;
        pipeline = pipeline.with_classifier(Arc::new(BoundedClassifier::new(
            Arc::new(keywords),
            config.classifier_timeout,
        )));
    }
    tracing::info!(
        fields = pipeline.schema().fields.len(),
        policy = %pipeline.schema().policy,
        patients = records.len(),
        "Starting run"
    );

    let report = pipeline.run(records, &config.output).await?;
    reporter::print_report(&report);
    if let Some(path) = &config.report_path {
        reporter::write_report_json(&report, path)?;
    }
    Ok(())
}
