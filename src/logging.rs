use tracing_subscriber::EnvFilter;

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `verbose` picks debug over info.
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "claimmapper=debug" } else { "claimmapper=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

/// Per-patient stage event. Carries identifiers only, never field values.
pub fn log_patient_event(component: &str, patient_id: &str, event: &str, message: &str) {
    tracing::debug!(component, patient_id, event, "{}", message);
}
