use std::process::ExitCode;

use anyhow::Context;
use orbit::CommunicationContext;
use orbit::config::props;
use orbit_smoke::all_tests;
use orbit_smoke::cli::{self, Invocation};

#[tokio::main]
async fn main() -> ExitCode {
    cli::init_tracing();
    cli::report(run().await)
}

async fn run() -> anyhow::Result<()> {
    let invocation = Invocation::parse(std::env::args().skip(1))
        .context("invalid arguments")?
        .with_override(props::WARN_DISPATCH, "0");

    // The registry must be complete before any context exists.
    let registry = invocation
        .load_registry()
        .context("failed to load interface definitions")?;
    let config = invocation.into_config();

    CommunicationContext::scoped(
        config,
        registry,
        async |context: &CommunicationContext| -> anyhow::Result<()> {
            let initial = all_tests(context).await?;

            match initial.shutdown().await {
                Ok(()) => tracing::info!("Server acknowledged shutdown"),
                Err(e) if e.is_timeout() => {
                    tracing::warn!(error = %e, "Server did not acknowledge shutdown in time")
                }
                Err(e) => return Err(e).context("shutdown request failed"),
            }
            Ok(())
        },
    )
    .await
}
