//! The smoke binaries as processes: exit status and stderr.

use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use orbit::bridge::codec::JsonCodec;
use orbit::bridge::protocol::{ClientFrame, ReplyOutcome, ServerFrame};
use orbit::config::props;
use orbit::{CommunicationContext, ConfigStore, ContextState, ProtocolVersion};
use orbit_smoke::cli::Invocation;
use orbit_smoke::suite::INITIAL_PROXY_PROPERTY;
use orbit_smoke::{IDENTITY, serve};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio_util::codec::{FramedRead, FramedWrite};

async fn run_client(args: &[String]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_smoke-client"))
        .args(args)
        .env_remove("RUST_LOG")
        .kill_on_drop(true)
        .output()
        .await
        .unwrap()
}

fn proxy_arg(address: &str) -> String {
    format!("--{INITIAL_PROXY_PROPERTY}={address}")
}

#[tokio::test]
async fn client_exits_zero_after_shutting_the_server_down() {
    let mut config = ConfigStore::from_pairs([
        ("TestAdapter.Endpoints", "127.0.0.1:0"),
        (props::WARN_DISPATCH, "0"),
    ]);
    config.freeze();
    let registry = Invocation::parse(Vec::<String>::new())
        .unwrap()
        .load_registry()
        .unwrap();
    let server = CommunicationContext::new(Arc::new(config), registry).unwrap();
    let adapter = serve(&server).await.unwrap();
    let address = adapter.proxy_address(IDENTITY).to_string();

    let output = run_client(&[proxy_arg(&address)]).await;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    tokio::time::timeout(Duration::from_secs(5), server.wait_for_shutdown())
        .await
        .unwrap();
    assert_eq!(server.state(), ContextState::Closing);
    server.destroy().await;
    assert_eq!(server.outstanding_resources(), 0);
}

#[tokio::test]
async fn client_exits_nonzero_when_nothing_listens() {
    let address = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("initial@{}", listener.local_addr().unwrap())
    };

    let output = run_client(&[proxy_arg(&address)]).await;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("error:"));
}

#[tokio::test]
async fn client_exits_nonzero_on_a_broken_schema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Broken.ice");
    std::fs::write(&path, "module Test { interface Initial { void shutdown() }; };\n").unwrap();

    let output = run_client(&[path.display().to_string()]).await;
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load interface definitions"), "{stderr}");
}

/// Answers the `Initial` operations itself but never acknowledges shutdown.
async fn silent_on_shutdown_peer() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut writer = FramedWrite::new(write_half, JsonCodec::<ServerFrame>::new());
        let mut reader = FramedRead::new(read_half, JsonCodec::<ClientFrame>::new());
        writer
            .send(ServerFrame::ValidateConnection {
                protocol: ProtocolVersion::CURRENT,
            })
            .await
            .unwrap();

        while let Some(Ok(frame)) = reader.next().await {
            let ClientFrame::Request {
                id,
                operation,
                args,
                ..
            } = frame
            else {
                continue;
            };
            let outcome = answer(&operation, &args);
            if writer.send(ServerFrame::Reply { id, outcome }).await.is_err() {
                return;
            }
        }
    });
    format!("initial@127.0.0.1:{port}")
}

fn answer(operation: &str, args: &[Value]) -> ReplyOutcome {
    let value = match operation {
        "ice_ping" | "shutdown" => Value::Null,
        "ice_id" => json!("Test::Initial"),
        "getName" => json!("scripted"),
        "echo" => args[0].clone(),
        "split" => json!(
            args[0]
                .as_str()
                .unwrap_or_default()
                .split_whitespace()
                .collect::<Vec<_>>()
        ),
        "add" => {
            let sum = args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0);
            if i32::try_from(sum).is_err() {
                return ReplyOutcome::ServantError {
                    message: "overflow".to_string(),
                };
            }
            json!(sum)
        }
        other => {
            return ReplyOutcome::OperationNotExist {
                operation: other.to_string(),
            };
        }
    };
    ReplyOutcome::Success { value }
}

#[tokio::test]
async fn unacknowledged_shutdown_is_not_fatal() {
    let address = silent_on_shutdown_peer().await;

    let output = run_client(&[
        proxy_arg(&address),
        format!("--{}=200", props::SHUTDOWN_TIMEOUT),
    ])
    .await;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}
