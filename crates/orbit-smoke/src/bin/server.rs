use std::process::ExitCode;

use anyhow::Context;
use orbit::CommunicationContext;
use orbit_smoke::cli::{self, Invocation};
use orbit_smoke::{ADAPTER_NAME, DEFAULT_SERVER_ENDPOINT, serve};

#[tokio::main]
async fn main() -> ExitCode {
    cli::init_tracing();
    cli::report(run().await)
}

async fn run() -> anyhow::Result<()> {
    let invocation = Invocation::parse(std::env::args().skip(1))
        .context("invalid arguments")?
        .with_default(&format!("{ADAPTER_NAME}.Endpoints"), DEFAULT_SERVER_ENDPOINT);

    let registry = invocation
        .load_registry()
        .context("failed to load interface definitions")?;
    let config = invocation.into_config();

    CommunicationContext::scoped(
        config,
        registry,
        async |context: &CommunicationContext| -> anyhow::Result<()> {
            serve(context).await.context("failed to start adapter")?;

            tokio::select! {
                _ = context.wait_for_shutdown() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, shutting down");
                    context.begin_shutdown();
                }
            }

            context.shutdown().await;
            tracing::info!("Server stopped");
            Ok(())
        },
    )
    .await
}
