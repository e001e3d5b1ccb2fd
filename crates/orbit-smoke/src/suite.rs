//! The client-side checks run against a live `Initial` object.

use orbit::{CommunicationContext, ContextError, InvocationError};

use crate::initial::{InitialError, InitialPrx, TYPE_NAME};

/// Property naming the proxy address of the object under test.
pub const INITIAL_PROXY_PROPERTY: &str = "Test.Initial.Proxy";

pub const DEFAULT_INITIAL_PROXY: &str = "initial:tcp -h 127.0.0.1 -p 12010";

#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Initial(#[from] InitialError),

    #[error("check failed: {0}")]
    Check(String),
}

fn check(condition: bool, what: impl Into<String>) -> Result<(), SuiteError> {
    if condition {
        Ok(())
    } else {
        Err(SuiteError::Check(what.into()))
    }
}

/// Connect to the `Initial` object and exercise every operation but `shutdown`.
///
/// Returns the proxy so the caller can decide how to end the session.
pub async fn all_tests(context: &CommunicationContext) -> Result<InitialPrx, SuiteError> {
    let address = context
        .config()
        .get(INITIAL_PROXY_PROPERTY, DEFAULT_INITIAL_PROXY)
        .to_string();

    tracing::info!(%address, "Creating proxy");
    let initial = InitialPrx::new(context.create_proxy(TYPE_NAME, &address).await?)?;

    // 1. Liveness and type
    initial.ping().await?;
    let id = initial.ice_id().await?;
    check(id == "Test::Initial", format!("ice_id returned '{id}'"))?;

    // 2. Inherited operation
    let name = initial.get_name().await?;
    check(!name.is_empty(), "getName returned an empty name")?;

    // 3. Round trips
    let echoed = initial.echo("hello").await?;
    check(echoed == "hello", format!("echo returned '{echoed}'"))?;
    let sum = initial.add(2, 3).await?;
    check(sum == 5, format!("add(2, 3) returned {sum}"))?;
    let words = initial.split("a b  c").await?;
    check(words == ["a", "b", "c"], format!("split returned {words:?}"))?;

    // 4. Rejected locally, nothing sent
    let missing = initial.proxy().invoke("noSuchOperation", Vec::new()).await;
    check(
        matches!(missing, Err(InvocationError::OperationNotExist { .. })),
        format!("unknown operation gave {missing:?}"),
    )?;
    let short = initial.proxy().invoke("add", Vec::new()).await;
    check(
        matches!(short, Err(InvocationError::BadArguments { .. })),
        format!("missing arguments gave {short:?}"),
    )?;

    // 5. Rejected by the servant
    let overflow = initial.add(i32::MAX, 1).await;
    check(
        matches!(
            overflow,
            Err(InitialError::Invocation(InvocationError::Remote(_)))
        ),
        format!("overflowing add gave {overflow:?}"),
    )?;

    tracing::info!(server = %name, "All checks passed");
    Ok(initial)
}
