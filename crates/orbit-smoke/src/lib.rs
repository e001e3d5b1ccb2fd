//! Client and server halves of the orbit smoke test.

pub mod cli;
pub mod initial;
pub mod suite;

use std::sync::Arc;

use orbit::{AdapterError, AdapterHandle, CommunicationContext, ContextError};

pub use initial::{IDENTITY, InitialError, InitialI, InitialPrx, TYPE_NAME};
pub use suite::{SuiteError, all_tests};

/// Adapter the server exposes its object through.
pub const ADAPTER_NAME: &str = "TestAdapter";

pub const DEFAULT_SERVER_ENDPOINT: &str = "tcp -h 127.0.0.1 -p 12010";

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Create the test adapter, register `InitialI`, and start accepting.
pub async fn serve(context: &CommunicationContext) -> Result<AdapterHandle, ServeError> {
    let adapter = context.create_adapter(ADAPTER_NAME).await?;
    adapter.add(IDENTITY, TYPE_NAME, Arc::new(InitialI::new("orbit smoke server")))?;
    adapter.activate()?;
    tracing::info!(
        adapter = ADAPTER_NAME,
        address = %adapter.proxy_address(IDENTITY),
        "Serving"
    );
    Ok(adapter)
}
