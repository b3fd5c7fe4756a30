use switchyard_demo::{App, RuntimeConfig};

fn main() -> anyhow::Result<()> {
    let config = RuntimeConfig::load()?;
    switchyard_observability::init_with(config.log_format);

    let report = App::build(config)?.run()?;
    tracing::info!(report = %serde_json::to_string(&report)?, "demo finished");
    Ok(())
}
