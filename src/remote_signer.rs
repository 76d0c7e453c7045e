//! Signer reached over a request/response link
//!
//! Calls are JSON frames correlated by id. Each call registers a pending
//! entry and waits for its response with a bounded timeout; the entry is
//! removed on completion or expiry. When the inbound side of the link
//! closes, every in-flight call is rejected.
//!
//! Over TCP each frame is one line of JSON. `agidentity serve-signer`
//! exposes a key file this way and `signer.endpoint` points a gateway at it.

use crate::anchor_chain::CommitmentRecord;
use crate::errors::{AgidError, AgidResult, SafeLock};
use crate::signer::{Identity, KeyRef, Signer};
use crate::transport::RetryPolicy;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignerFrame {
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Outbound half of a signer connection.
#[async_trait]
pub trait SignerLink: Send + Sync {
    async fn send(&self, frame: SignerFrame) -> AgidResult<()>;
}

/// Link over a tokio channel.
pub struct ChannelLink {
    tx: mpsc::Sender<SignerFrame>,
}

impl ChannelLink {
    pub fn new(tx: mpsc::Sender<SignerFrame>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl SignerLink for ChannelLink {
    async fn send(&self, frame: SignerFrame) -> AgidResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| AgidError::transport("signer.send", "link closed"))
    }
}

/// Link over a TCP stream, one JSON frame per line.
pub struct TcpLink {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl TcpLink {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

#[async_trait]
impl SignerLink for TcpLink {
    async fn send(&self, frame: SignerFrame) -> AgidResult<()> {
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| AgidError::transport("signer.send", e.to_string()))
    }
}

/// Decode frames from `reader` until it closes. The receiver closes with it.
fn read_frames(reader: OwnedReadHalf) -> mpsc::Receiver<SignerFrame> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<SignerFrame>(&line) {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed signer frame"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "signer connection read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Open a TCP link to a signer at `addr`.
pub async fn dial_tcp(
    addr: &str,
) -> AgidResult<(Arc<dyn SignerLink>, mpsc::Receiver<SignerFrame>)> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| AgidError::transport("signer.connect", format!("{addr}: {e}")))?;
    let (reader, writer) = stream.into_split();
    Ok((Arc::new(TcpLink::new(writer)), read_frames(reader)))
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

fn reject_all(pending: &Pending, reason: &str) {
    if let Ok(mut map) = pending.safe_lock() {
        let count = map.len();
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(reason.to_string()));
        }
        if count > 0 {
            warn!(count, reason = %reason, "rejected in-flight signer calls");
        }
    }
}

pub struct RemoteSigner {
    link: Arc<dyn SignerLink>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
    identity: Identity,
    reader: JoinHandle<()>,
}

impl RemoteSigner {
    /// Attach to a link, start reading responses and fetch the identity.
    pub async fn connect(
        link: Arc<dyn SignerLink>,
        mut incoming: mpsc::Receiver<SignerFrame>,
        timeout: Duration,
    ) -> AgidResult<Self> {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                handle_frame(&reader_pending, frame);
            }
            reject_all(&reader_pending, "signer link disconnected");
        });

        let next_id = AtomicU64::new(1);
        let identity_value =
            call(&link, &pending, &next_id, timeout, "get_identity", json!({})).await;
        let identity = match identity_value {
            Ok(value) => serde_json::from_value(value)?,
            Err(e) => {
                reader.abort();
                return Err(e);
            }
        };
        info!(public_key = %identity_key(&identity), "connected to remote signer");

        Ok(Self {
            link,
            pending,
            next_id,
            timeout,
            identity,
            reader,
        })
    }

    /// Connect with capped exponential backoff; `dial` opens a fresh link
    /// on every attempt.
    pub async fn connect_with_retry<F, Fut>(
        policy: &RetryPolicy,
        timeout: Duration,
        mut dial: F,
    ) -> AgidResult<Self>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AgidResult<(Arc<dyn SignerLink>, mpsc::Receiver<SignerFrame>)>>,
    {
        policy
            .run("signer.connect", || {
                let attempt = dial();
                async move {
                    let (link, incoming) = attempt.await?;
                    Self::connect(link, incoming, timeout).await
                }
            })
            .await
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.safe_lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Drop the connection and fail every in-flight call.
    pub fn disconnect(&self) {
        self.reader.abort();
        reject_all(&self.pending, "signer link disconnected");
    }

    async fn call(&self, method: &str, params: Value) -> AgidResult<Value> {
        call(&self.link, &self.pending, &self.next_id, self.timeout, method, params).await
    }
}

impl Drop for RemoteSigner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn identity_key(identity: &Identity) -> &str {
    &identity.public_key
}

fn handle_frame(pending: &Pending, frame: SignerFrame) {
    match frame {
        SignerFrame::Response { id, result, error } => {
            let waiter = pending.safe_lock().ok().and_then(|mut m| m.remove(&id));
            match waiter {
                Some(tx) => {
                    let outcome = match error {
                        Some(message) => Err(message),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                }
                None => debug!(id, "response for unknown or expired call"),
            }
        }
        SignerFrame::Request { id, .. } => warn!(id, "unexpected request frame from signer"),
    }
}

async fn call(
    link: &Arc<dyn SignerLink>,
    pending: &Pending,
    next_id: &AtomicU64,
    timeout: Duration,
    method: &str,
    params: Value,
) -> AgidResult<Value> {
    let id = next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    pending.safe_lock()?.insert(id, tx);

    if let Err(e) = link
        .send(SignerFrame::Request {
            id,
            method: method.to_string(),
            params,
        })
        .await
    {
        pending.safe_lock()?.remove(&id);
        return Err(e);
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(message))) => Err(AgidError::signing(method, message)),
        Ok(Err(_)) => Err(AgidError::signing(method, "call dropped")),
        Err(_) => {
            pending.safe_lock()?.remove(&id);
            Err(AgidError::timeout(format!("signer.{method}"), timeout.as_secs()))
        }
    }
}

fn bytes_param(params: &Value, field: &str) -> AgidResult<Vec<u8>> {
    let encoded = params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AgidError::validation(field, "missing"))?;
    B64.decode(encoded)
        .map_err(|e| AgidError::validation(field, e.to_string()))
}

fn key_param(params: &Value) -> AgidResult<KeyRef> {
    Ok(serde_json::from_value(params.get("key").cloned().unwrap_or(Value::Null))?)
}

fn bytes_result(value: Value, method: &str) -> AgidResult<Vec<u8>> {
    let encoded = value
        .as_str()
        .ok_or_else(|| AgidError::signing(method, "expected base64 string result"))?;
    B64.decode(encoded)
        .map_err(|e| AgidError::signing(method, e.to_string()))
}

#[async_trait]
impl Signer for RemoteSigner {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    async fn sign(&self, data: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        let value = self.call("sign", json!({"data": B64.encode(data), "key": key})).await?;
        bytes_result(value, "sign")
    }

    async fn verify(&self, data: &[u8], signature: &[u8], key: &KeyRef) -> AgidResult<bool> {
        let value = self
            .call(
                "verify",
                json!({"data": B64.encode(data), "signature": B64.encode(signature), "key": key}),
            )
            .await?;
        value
            .as_bool()
            .ok_or_else(|| AgidError::signing("verify", "expected boolean result"))
    }

    async fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        let value = self.call("encrypt", json!({"data": B64.encode(plaintext), "key": key})).await?;
        bytes_result(value, "encrypt")
    }

    async fn decrypt(&self, ciphertext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        let value = self
            .call("decrypt", json!({"data": B64.encode(ciphertext), "key": key}))
            .await?;
        bytes_result(value, "decrypt")
    }

    async fn commit(&self, record: &CommitmentRecord) -> AgidResult<String> {
        let value = self.call("commit", json!({"record": record})).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AgidError::signing("commit", "expected receipt id"))
    }
}

async fn dispatch(signer: &dyn Signer, method: &str, params: &Value) -> AgidResult<Value> {
    match method {
        "get_identity" => Ok(serde_json::to_value(signer.identity())?),
        "sign" => {
            let sig = signer.sign(&bytes_param(params, "data")?, &key_param(params)?).await?;
            Ok(Value::String(B64.encode(sig)))
        }
        "verify" => {
            let ok = signer
                .verify(
                    &bytes_param(params, "data")?,
                    &bytes_param(params, "signature")?,
                    &key_param(params)?,
                )
                .await?;
            Ok(Value::Bool(ok))
        }
        "encrypt" => {
            let out = signer.encrypt(&bytes_param(params, "data")?, &key_param(params)?).await?;
            Ok(Value::String(B64.encode(out)))
        }
        "decrypt" => {
            let out = signer.decrypt(&bytes_param(params, "data")?, &key_param(params)?).await?;
            Ok(Value::String(B64.encode(out)))
        }
        "commit" => {
            let record: CommitmentRecord =
                serde_json::from_value(params.get("record").cloned().unwrap_or(Value::Null))?;
            Ok(Value::String(signer.commit(&record).await?))
        }
        other => Err(AgidError::validation("method", format!("unknown signer method '{other}'"))),
    }
}

/// Serve signer requests from `requests`, answering on `responses`, until
/// either side closes.
pub async fn serve_signer(
    signer: Arc<dyn Signer>,
    mut requests: mpsc::Receiver<SignerFrame>,
    responses: mpsc::Sender<SignerFrame>,
) {
    while let Some(frame) = requests.recv().await {
        let SignerFrame::Request { id, method, params } = frame else {
            continue;
        };
        let reply = match dispatch(signer.as_ref(), &method, &params).await {
            Ok(result) => SignerFrame::Response {
                id,
                result: Some(result),
                error: None,
            },
            Err(e) => SignerFrame::Response {
                id,
                result: None,
                error: Some(e.to_string()),
            },
        };
        if responses.send(reply).await.is_err() {
            break;
        }
    }
}

/// Accept signer connections on `listener` and serve each one until it
/// closes. Runs until the listener fails.
pub async fn serve_signer_tcp(signer: Arc<dyn Signer>, listener: TcpListener) -> AgidResult<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| AgidError::io("accept signer connection", e))?;
        info!(peer = %peer, "signer client connected");
        let (reader, writer) = stream.into_split();
        let requests = read_frames(reader);
        let (resp_tx, mut resp_rx) = mpsc::channel(32);
        tokio::spawn(serve_signer(Arc::clone(&signer), requests, resp_tx));
        tokio::spawn(async move {
            let link = TcpLink::new(writer);
            while let Some(frame) = resp_rx.recv().await {
                if let Err(e) = link.send(frame).await {
                    debug!(peer = %peer, error = %e, "signer client went away");
                    break;
                }
            }
        });
    }
}

/// In-process link to `signer`, served on a background task.
pub fn channel_pair(
    signer: Arc<dyn Signer>,
) -> (Arc<dyn SignerLink>, mpsc::Receiver<SignerFrame>, JoinHandle<()>) {
    let (req_tx, req_rx) = mpsc::channel(32);
    let (resp_tx, resp_rx) = mpsc::channel(32);
    let server = tokio::spawn(serve_signer(signer, req_rx, resp_tx));
    (Arc::new(ChannelLink::new(req_tx)), resp_rx, server)
}
