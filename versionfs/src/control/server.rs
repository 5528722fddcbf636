//! Unix-socket transport for control requests.
//!
//! Each connection carries newline-delimited JSON [`ControlMessage`]s: the
//! client writes one `Request`, the daemon answers with one `Reply` or
//! `Error`. A connection may carry any number of exchanges.
use anyhow::Context;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::{Dispatcher, RawRequest};
use crate::backend::Backend;
use crate::error::{Result, VersionError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Request { path: String, request: RawRequest },
    Reply { payload: Vec<u8> },
    Error { errno: i32, message: String },
}

/// Accept connections on `socket` until the listener fails, spawning one task per client.
pub async fn serve<B: Backend + 'static>(
    socket: &Path,
    dispatcher: Arc<Dispatcher<B>>,
) -> anyhow::Result<()> {
    if socket.exists() {
        std::fs::remove_file(socket)
            .with_context(|| format!("failed to remove stale socket {}", socket.display()))?;
    }
    let listener = UnixListener::bind(socket)
        .with_context(|| format!("failed to bind control socket {}", socket.display()))?;
    info!("[control] listening on {}", socket.display());
    serve_listener(listener, dispatcher).await
}

pub async fn serve_listener<B: Backend + 'static>(
    listener: UnixListener,
    dispatcher: Arc<Dispatcher<B>>,
) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await.context("control accept failed")?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, dispatcher).await {
                warn!("[control] connection error: {e:?}");
            }
        });
    }
}

async fn handle_connection<B: Backend>(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher<B>>,
) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match serde_json::from_str::<ControlMessage>(&line) {
            Ok(ControlMessage::Request { path, request }) => {
                let mut out = BytesMut::new();
                match dispatcher.dispatch(&path, &request, &mut out).await {
                    Ok(()) => ControlMessage::Reply {
                        payload: out.to_vec(),
                    },
                    Err(e) => {
                        debug!("[control] {path}: {e}");
                        ControlMessage::Error {
                            errno: e.errno(),
                            message: e.to_string(),
                        }
                    }
                }
            }
            Ok(other) => ControlMessage::Error {
                errno: libc::EINVAL,
                message: format!("unexpected message {other:?}"),
            },
            Err(e) => ControlMessage::Error {
                errno: libc::EINVAL,
                message: format!("malformed request: {e}"),
            },
        };
        let mut encoded = serde_json::to_vec(&reply)?;
        encoded.push(b'\n');
        write.write_all(&encoded).await?;
    }
    Ok(())
}

/// Send one request to the daemon listening on `socket` and return the payload.
pub async fn send_request(socket: &Path, path: &str, request: RawRequest) -> Result<Vec<u8>> {
    let stream = UnixStream::connect(socket).await?;
    let (read, mut write) = stream.into_split();

    let msg = ControlMessage::Request {
        path: path.to_string(),
        request,
    };
    let mut encoded =
        serde_json::to_vec(&msg).map_err(|e| VersionError::io(format!("encode request: {e}")))?;
    encoded.push(b'\n');
    write.write_all(&encoded).await?;

    let mut lines = BufReader::new(read).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| VersionError::io("control socket closed without a reply"))?;
    match serde_json::from_str::<ControlMessage>(&line)
        .map_err(|e| VersionError::io(format!("decode reply: {e}")))?
    {
        ControlMessage::Reply { payload } => Ok(payload),
        ControlMessage::Error { errno, message } => Err(VersionError::from_errno(errno, message)),
        ControlMessage::Request { .. } => Err(VersionError::io("daemon answered with a request")),
    }
}
