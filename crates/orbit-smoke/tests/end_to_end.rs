use std::sync::Arc;
use std::time::Duration;

use orbit::config::props;
use orbit::{CommunicationContext, ConfigStore, ContextError, ContextState, TypeRegistry};
use orbit_schema::error::SchemaError;
use orbit_smoke::cli::{CliError, Invocation};
use orbit_smoke::suite::INITIAL_PROXY_PROPERTY;
use orbit_smoke::{IDENTITY, InitialError, InitialPrx, SuiteError, all_tests, serve};
use serde_json::Value;

fn frozen(pairs: &[(&str, &str)]) -> Arc<ConfigStore> {
    let mut config = ConfigStore::from_pairs(pairs.iter().copied());
    config.freeze();
    Arc::new(config)
}

fn registry() -> Arc<TypeRegistry> {
    Invocation::parse(Vec::<String>::new())
        .unwrap()
        .load_registry()
        .unwrap()
}

/// Server context with the test adapter on an ephemeral port.
async fn server(registry: &Arc<TypeRegistry>) -> (CommunicationContext, String) {
    let context = CommunicationContext::new(
        frozen(&[
            ("TestAdapter.Endpoints", "127.0.0.1:0"),
            (props::WARN_DISPATCH, "0"),
        ]),
        Arc::clone(registry),
    )
    .unwrap();
    let adapter = serve(&context).await.unwrap();
    let address = adapter.proxy_address(IDENTITY).to_string();
    (context, address)
}

fn client(registry: &Arc<TypeRegistry>, address: &str) -> CommunicationContext {
    CommunicationContext::new(
        frozen(&[(INITIAL_PROXY_PROPERTY, address)]),
        Arc::clone(registry),
    )
    .unwrap()
}

async fn closing(context: &CommunicationContext) {
    tokio::time::timeout(Duration::from_secs(5), context.wait_for_shutdown())
        .await
        .expect("server never left Open");
    assert_eq!(context.state(), ContextState::Closing);
}

#[tokio::test]
async fn client_runs_the_suite_and_shuts_the_server_down() {
    let registry = registry();
    let (server, address) = server(&registry).await;
    let client = client(&registry, &address);

    let initial = all_tests(&client).await.unwrap();
    initial.shutdown().await.unwrap();
    closing(&server).await;

    let report = client.destroy().await;
    assert_eq!(report.released, 1);
    assert!(report.is_clean());
    assert_eq!(client.outstanding_resources(), 0);

    let report = server.destroy().await;
    assert!(report.is_clean());
    assert_eq!(server.outstanding_resources(), 0);
    assert_eq!(server.state(), ContextState::Closed);
}

#[tokio::test]
async fn shutdown_operation_begins_shutdown_from_the_servant() {
    let registry = registry();
    let (server, address) = server(&registry).await;
    let client = client(&registry, &address);

    let initial = all_tests(&client).await.unwrap();
    let value = initial.proxy().invoke("shutdown", Vec::new()).await.unwrap();
    assert_eq!(value, Value::Null);
    closing(&server).await;

    client.destroy().await;
    server.destroy().await;
    assert_eq!(server.outstanding_resources(), 0);
}

#[tokio::test]
async fn scoped_client_against_a_closed_port_fails_cleanly() {
    let address = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("initial@{}", listener.local_addr().unwrap())
    };

    let result: Result<InitialPrx, SuiteError> = CommunicationContext::scoped(
        frozen(&[(INITIAL_PROXY_PROPERTY, address.as_str())]),
        registry(),
        async |context: &CommunicationContext| -> Result<InitialPrx, SuiteError> {
            all_tests(context).await
        },
    )
    .await;

    assert!(matches!(
        result,
        Err(SuiteError::Context(ContextError::Connection { .. }))
    ));
}

#[tokio::test]
async fn typed_proxy_rejects_other_interfaces() {
    let registry = registry();
    let (server, address) = server(&registry).await;
    let client = client(&registry, &address);

    let named = client.create_proxy("Named", &address).await.unwrap();
    assert!(matches!(
        InitialPrx::new(named),
        Err(InitialError::WrongType(name)) if name == "Named"
    ));

    client.destroy().await;
    server.destroy().await;
}

#[test]
fn schema_errors_stop_before_any_context_exists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Broken.ice");
    std::fs::write(&path, "module Test { interface Initial { void shutdown() }; };\n").unwrap();

    let invocation = Invocation::parse([path.display().to_string()]).unwrap();
    let err = invocation.load_registry().unwrap_err();
    assert!(matches!(err, CliError::Schema(SchemaError::Syntax { .. })));
}
