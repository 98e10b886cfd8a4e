//! Transport tests: a stub provider served over a real loopback socket

use async_trait::async_trait;
use serde_json::{json, Value};
use shoes_provider::plugin;
use shoes_provider::{AddInstanceRequest, InstanceDetail, Result, ShoesError, ShoesProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

struct StubShoes;

#[async_trait]
impl ShoesProvider for StubShoes {
    fn shoes_type(&self) -> &'static str {
        "stub"
    }

    async fn add_instance(&self, req: AddInstanceRequest) -> Result<InstanceDetail> {
        // "sleep" setup scripts stall so tests can force completion order
        if req.setup_script == "sleep" {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(InstanceDetail {
            cloud_id: format!("stub-{}", req.runner_name),
            shoes_type: "stub".to_string(),
            ip_address: "10.0.0.9".to_string(),
        })
    }

    async fn delete_instance(&self, cloud_id: &str) -> Result<()> {
        if cloud_id == "missing" {
            return Err(ShoesError::invalid_argument("cloud_id", "no such instance"));
        }
        Ok(())
    }
}

/// Start the stub server and return a connected client split into a line
/// reader and a write half.
async fn connect_stub() -> (Lines<BufReader<OwnedReadHalf>>, tokio::net::tcp::OwnedWriteHalf) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(plugin::serve_on(listener, Arc::new(StubShoes)));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, write) = stream.into_split();
    (BufReader::new(read).lines(), write)
}

async fn next_frame(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Value {
    let line = lines.next_line().await.unwrap().unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_add_instance_round_trip() {
    let (mut lines, mut write) = connect_stub().await;

    let request = json!({
        "id": 1,
        "method": "add_instance",
        "params": {
            "runner_name": "r1",
            "setup_script": "echo 0",
            "resource_type": "nano"
        }
    });
    write
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .unwrap();

    let frame = next_frame(&mut lines).await;
    assert_eq!(frame["id"], 1);
    assert_eq!(frame["status"], "ok");
    assert_eq!(frame["cloud_id"], "stub-r1");
    assert_eq!(frame["shoes_type"], "stub");
    assert_eq!(frame["ip_address"], "10.0.0.9");
}

#[tokio::test]
async fn test_delete_instance_round_trip() {
    let (mut lines, mut write) = connect_stub().await;

    let request = json!({
        "id": 4,
        "method": "delete_instance",
        "params": {"cloud_id": "stub-r1"}
    });
    write
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .unwrap();

    let frame = next_frame(&mut lines).await;
    assert_eq!(frame["id"], 4);
    assert_eq!(frame["status"], "deleted");
}

#[tokio::test]
async fn test_provider_error_maps_to_structured_code() {
    let (mut lines, mut write) = connect_stub().await;

    let request = json!({
        "method": "delete_instance",
        "params": {"cloud_id": "missing"}
    });
    write
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .unwrap();

    let frame = next_frame(&mut lines).await;
    assert_eq!(frame["status"], "error");
    assert_eq!(frame["code"], "invalid_argument");
    assert!(frame["message"]
        .as_str()
        .unwrap()
        .contains("no such instance"));
}

#[tokio::test]
async fn test_unknown_resource_type_is_invalid_argument() {
    let (mut lines, mut write) = connect_stub().await;

    let request = json!({
        "method": "add_instance",
        "params": {
            "runner_name": "r1",
            "setup_script": "echo 0",
            "resource_type": "colossal"
        }
    });
    write
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .unwrap();

    let frame = next_frame(&mut lines).await;
    assert_eq!(frame["status"], "error");
    assert_eq!(frame["code"], "invalid_argument");
    assert!(frame["message"].as_str().unwrap().contains("colossal"));
}

#[tokio::test]
async fn test_malformed_frame_reports_error_and_keeps_connection() {
    let (mut lines, mut write) = connect_stub().await;

    write.write_all(b"{not json}\n").await.unwrap();
    let frame = next_frame(&mut lines).await;
    assert_eq!(frame["status"], "error");
    assert_eq!(frame["code"], "invalid_argument");

    // The connection survives a bad frame
    let request = json!({
        "id": 9,
        "method": "delete_instance",
        "params": {"cloud_id": "stub-r1"}
    });
    write
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .unwrap();
    let frame = next_frame(&mut lines).await;
    assert_eq!(frame["id"], 9);
    assert_eq!(frame["status"], "deleted");
}

#[tokio::test]
async fn test_concurrent_calls_complete_out_of_order() {
    let (mut lines, mut write) = connect_stub().await;

    let slow = json!({
        "id": 1,
        "method": "add_instance",
        "params": {"runner_name": "slow", "setup_script": "sleep", "resource_type": "nano"}
    });
    let fast = json!({
        "id": 2,
        "method": "add_instance",
        "params": {"runner_name": "fast", "setup_script": "echo 0", "resource_type": "nano"}
    });
    write
        .write_all(format!("{}\n{}\n", slow, fast).as_bytes())
        .await
        .unwrap();

    // The fast call overtakes the stalled one; ids pair responses to calls
    let first = next_frame(&mut lines).await;
    assert_eq!(first["id"], 2);
    assert_eq!(first["cloud_id"], "stub-fast");

    let second = next_frame(&mut lines).await;
    assert_eq!(second["id"], 1);
    assert_eq!(second["cloud_id"], "stub-slow");
}

#[test]
fn test_handshake_constants() {
    // Contract values the orchestrator matches on
    assert_eq!(plugin::MAGIC_COOKIE_KEY, "SHOES_PLUGIN_MAGIC_COOKIE");
    assert_eq!(plugin::MAGIC_COOKIE_VALUE, "are_you_a_shoes?");
    assert_eq!(plugin::CORE_PROTOCOL_VERSION, 1);
    assert_eq!(plugin::APP_PROTOCOL_VERSION, 1);
    assert_eq!(plugin::WIRE_PROTOCOL, "shoes_json");
}
