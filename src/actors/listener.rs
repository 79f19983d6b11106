//! Listener - Accepts agent connections
//!
//! Agents speak newline-delimited JSON. Every line is one request:
//!
//! ```text
//! {"command":"app_info","info":{...}}              -> {"state":...,"connect_reply":...}
//! {"command":"txn_data","run_id":"...","data":{}}  -> (no reply)
//! ```
//!
//! Each connection gets its own task which forwards requests to the
//! [`ProcessorHandle`]. The listener stops accepting once the processor is
//! gone.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    AgentRunId,
    app::{AppInfo, AppState},
    harvest::TxnData,
    worker::bind_addr::BindAddr,
};

use super::messages::{AppInfoReply, ProcessorError};
use super::processor::ProcessorHandle;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("unable to remove stale sock file {path}: {source} - another daemon may already be running?")]
    RemoveStale { path: PathBuf, source: io::Error },
    #[error("unable to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("accept failed: {0}")]
    Accept(io::Error),
}

impl ListenerError {
    /// Underlying OS error code, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ListenerError::RemoveStale { source, .. } | ListenerError::Bind { source, .. } => {
                source.raw_os_error()
            }
            ListenerError::Accept(e) => e.raw_os_error(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Request {
    AppInfo { info: Box<AppInfo> },
    TxnData { run_id: AgentRunId, data: Box<TxnData> },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    AppInfo {
        state: AppState,
        connect_reply: Option<Value>,
    },
    Error {
        error: String,
    },
}

impl From<AppInfoReply> for Response {
    fn from(reply: AppInfoReply) -> Self {
        Response::AppInfo {
            state: reply.state,
            connect_reply: reply
                .connect_reply
                .and_then(|raw| serde_json::from_slice(&raw).ok()),
        }
    }
}

enum Incoming {
    Unix {
        listener: UnixListener,
        path: Option<PathBuf>,
    },
    Tcp(TcpListener),
}

pub struct Listener {
    incoming: Incoming,
}

impl Listener {
    /// Bind `addr`. A stale socket file left behind by a previous daemon is
    /// removed first.
    pub async fn bind(addr: &BindAddr) -> Result<Self, ListenerError> {
        let bind_err = |source: io::Error| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        };

        let incoming = match addr {
            BindAddr::Unix(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!("removed stale sock file {}", path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(ListenerError::RemoveStale {
                            path: path.clone(),
                            source,
                        });
                    }
                }
                Incoming::Unix {
                    listener: UnixListener::bind(path).map_err(bind_err)?,
                    path: Some(path.clone()),
                }
            }
            BindAddr::Abstract(name) => Incoming::Unix {
                listener: bind_abstract(name).map_err(bind_err)?,
                path: None,
            },
            BindAddr::Tcp(sock) => Incoming::Tcp(TcpListener::bind(*sock).await.map_err(bind_err)?),
        };

        info!("listening on {addr}");
        Ok(Self { incoming })
    }

    /// Bound TCP address. `None` for domain sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.incoming {
            Incoming::Tcp(listener) => listener.local_addr().ok(),
            Incoming::Unix { .. } => None,
        }
    }

    /// Accept connections until the processor exits.
    ///
    /// Returns `Ok(())` when the processor has shut down, or the first accept
    /// error.
    #[instrument(skip_all)]
    pub async fn run(self, processor: ProcessorHandle) -> Result<(), ListenerError> {
        let result = match &self.incoming {
            Incoming::Unix { listener, .. } => {
                accept_loop(&processor, || async move {
                    listener.accept().await.map(|(stream, _)| stream)
                })
                .await
            }
            Incoming::Tcp(listener) => {
                accept_loop(&processor, || async move {
                    listener.accept().await.map(|(stream, _)| stream)
                })
                .await
            }
        };

        if let Incoming::Unix {
            path: Some(path), ..
        } = &self.incoming
        {
            let _ = std::fs::remove_file(path);
        }

        result
    }
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = StdUnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> io::Result<UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract sockets are only supported on linux",
    ))
}

async fn accept_loop<S, F, Fut>(processor: &ProcessorHandle, accept: F) -> Result<(), ListenerError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = io::Result<S>>,
{
    loop {
        tokio::select! {
            _ = processor.closed() => {
                debug!("processor stopped, closing listener");
                return Ok(());
            }
            accepted = accept() => {
                let stream = accepted.map_err(ListenerError::Accept)?;
                trace!("accepted connection");
                tokio::spawn(handle_connection(stream, processor.clone()));
            }
        }
    }
}

async fn handle_connection<S>(stream: S, processor: ProcessorHandle)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("connection read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("skipping malformed request: {e}");
                continue;
            }
        };

        match request {
            Request::AppInfo { info } => {
                let response = match processor.app_info(*info).await {
                    Ok(reply) => Response::from(reply),
                    Err(ProcessorError::Stopped) => break,
                    Err(e) => Response::Error {
                        error: e.to_string(),
                    },
                };

                let mut out = match serde_json::to_vec(&response) {
                    Ok(out) => out,
                    Err(e) => {
                        warn!("failed to encode reply: {e}");
                        continue;
                    }
                };
                out.push(b'\n');
                if let Err(e) = writer.write_all(&out).await {
                    debug!("connection write failed: {e}");
                    break;
                }
            }
            Request::TxnData { run_id, data } => {
                if processor.txn_data(run_id, *data).await.is_err() {
                    break;
                }
            }
        }
    }

    trace!("connection closed");
}
