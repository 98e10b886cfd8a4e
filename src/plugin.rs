//! Plugin registration and transport
//!
//! The orchestrator launches each backend as a subprocess and expects a
//! handshake before any RPC: the process refuses to run without the magic
//! cookie in its environment, binds a loopback listener, and announces it
//! on stdout as `CORE-VERSION|APP-VERSION|tcp|ADDR|PROTOCOL`.
//!
//! Behind the handshake the provider facade is served over line-delimited
//! JSON frames. Requests carry an optional `id` that is echoed back so the
//! orchestrator can issue many calls on one connection; every request is
//! handled on its own task and responses are written as they complete, in
//! whatever order the substrate settles them.

use crate::error::{ConfigError, Result, ShoesError};
use crate::provider::{AddInstanceRequest, InstanceDetail, ShoesProvider};
use crate::resource::ResourceTier;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const MAGIC_COOKIE_KEY: &str = "SHOES_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "are_you_a_shoes?";
pub const CORE_PROTOCOL_VERSION: u32 = 1;
pub const APP_PROTOCOL_VERSION: u32 = 1;
pub const WIRE_PROTOCOL: &str = "shoes_json";

/// One RPC call from the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum PluginCall {
    AddInstance {
        runner_name: String,
        setup_script: String,
        /// Tier name; unknown values are rejected as invalid-argument
        resource_type: String,
    },
    DeleteInstance {
        cloud_id: String,
    },
}

/// Outcome of one call. `status` is `ok` | `deleted` | `error`; errors carry
/// the structured code the orchestrator distinguishes (`invalid_argument`
/// or `internal`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PluginResponse {
    Ok(InstanceDetail),
    Deleted,
    Error { code: String, message: String },
}

#[derive(Debug, Deserialize)]
struct RequestFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(flatten)]
    call: PluginCall,
}

#[derive(Debug, Serialize)]
struct ResponseFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(flatten)]
    body: PluginResponse,
}

impl PluginResponse {
    fn from_error(err: &ShoesError) -> Self {
        PluginResponse::Error {
            code: err.status_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Execute one call against the facade and normalize the outcome.
pub async fn dispatch(provider: &dyn ShoesProvider, call: PluginCall) -> PluginResponse {
    match call {
        PluginCall::AddInstance {
            runner_name,
            setup_script,
            resource_type,
        } => {
            let tier = match ResourceTier::parse(&resource_type) {
                Ok(tier) => tier,
                // Tier names from the wire are caller input, not config
                Err(_) => {
                    return PluginResponse::from_error(&ShoesError::invalid_argument(
                        "resource_type",
                        format!("unknown resource type: {}", resource_type),
                    ));
                }
            };
            let request = AddInstanceRequest {
                runner_name,
                setup_script,
                resource_type: tier,
            };
            match provider.add_instance(request).await {
                Ok(detail) => PluginResponse::Ok(detail),
                Err(e) => {
                    warn!("add_instance failed: {}", e);
                    PluginResponse::from_error(&e)
                }
            }
        }
        PluginCall::DeleteInstance { cloud_id } => {
            match provider.delete_instance(&cloud_id).await {
                Ok(()) => PluginResponse::Deleted,
                Err(e) => {
                    warn!("delete_instance failed: {}", e);
                    PluginResponse::from_error(&e)
                }
            }
        }
    }
}

/// Verify the magic cookie, bind a loopback listener, announce it on
/// stdout, and serve the facade until the process is killed.
pub async fn serve(provider: Arc<dyn ShoesProvider>) -> Result<()> {
    if std::env::var(MAGIC_COOKIE_KEY).as_deref() != Ok(MAGIC_COOKIE_VALUE) {
        return Err(ShoesError::Config(ConfigError::InvalidValue {
            field: MAGIC_COOKIE_KEY.to_string(),
            reason: "this binary is a shoes plugin and must be launched by the orchestrator"
                .to_string(),
        }));
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    println!(
        "{}|{}|tcp|{}|{}",
        CORE_PROTOCOL_VERSION, APP_PROTOCOL_VERSION, addr, WIRE_PROTOCOL
    );
    info!("{} plugin listening on {}", provider.shoes_type(), addr);

    serve_on(listener, provider).await
}

/// Accept loop, split out so tests can drive a listener directly.
pub async fn serve_on(listener: TcpListener, provider: Arc<dyn ShoesProvider>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let provider = Arc::clone(&provider);
        info!("accepted connection from {}", peer);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, provider).await {
                warn!("connection from {} ended with error: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, provider: Arc<dyn ShoesProvider>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    handle_frames(reader, writer, provider).await
}

/// Read frames, fan each out onto its own task, and funnel responses back
/// through one writer so concurrent completions never interleave bytes.
async fn handle_frames<R, W>(reader: R, mut writer: W, provider: Arc<dyn ShoesProvider>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
        let _ = writer.flush().await;
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let frame: RequestFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                let response = ResponseFrame {
                    id: None,
                    body: PluginResponse::Error {
                        code: "invalid_argument".to_string(),
                        message: format!("malformed request frame: {}", e),
                    },
                };
                // Serialization of our own frames cannot fail
                if let Ok(encoded) = serde_json::to_string(&response) {
                    let _ = tx.send(encoded);
                }
                continue;
            }
        };

        let provider = Arc::clone(&provider);
        let tx = tx.clone();
        tokio::spawn(async move {
            let body = dispatch(provider.as_ref(), frame.call).await;
            let response = ResponseFrame { id: frame.id, body };
            if let Ok(encoded) = serde_json::to_string(&response) {
                let _ = tx.send(encoded);
            }
        });
    }

    drop(tx);
    let _ = writer_task.await;
    Ok(())
}
