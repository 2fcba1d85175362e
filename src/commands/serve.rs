use anyhow::Result;

use crate::config::ExporterConfig;

pub fn run(config: ExporterConfig) -> Result<()> {
    // Build tokio runtime explicitly (no #[tokio::main] on fn main)
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(crate::server::run(config))
}
