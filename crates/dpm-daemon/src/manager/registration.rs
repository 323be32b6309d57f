//! Registration socket server.
//!
//! Each plugin connection follows a simple request/response protocol:
//!
//! 1. Plugin connects
//! 2. Plugin writes one JSON line (a `register` request)
//! 3. Manager dials the plugin's endpoint and writes one JSON line back
//! 4. Manager closes the connection
//!
//! The request line must arrive within the registration timeout and fit in
//! the frame limit; otherwise the connection is answered or dropped without
//! touching the manager.
//!
//! See [`device_plugin_manager_core::client`] for the plugin side.

use std::path::{Path, PathBuf};

use device_plugin_manager_core::error::{
    CODE_INVALID_PAYLOAD, CODE_INVALID_REQUEST, CODE_UNKNOWN_COMMAND, CODE_VERSION_MISMATCH,
};
use device_plugin_manager_core::protocol::{
    COMMAND_REGISTER, PROTOCOL_VERSION, RegisterAck, RegisterRequest, SocketRequest,
    SocketResponse,
};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Manager, ManagerError};
use crate::codec::{Frame, LineFrameCodec};

/// Removes the registration socket file when dropped.
pub(crate) struct SocketGuard {
    socket_path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        remove_socket_file(&self.socket_path);
    }
}

fn remove_socket_file(socket_path: &Path) {
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(
                "Failed to remove socket file {}: {e}",
                socket_path.display()
            );
        } else {
            debug!("Removed socket file {}", socket_path.display());
        }
    }
}

/// Bind the registration socket, replacing a stale socket file if present.
pub(crate) fn bind(socket_path: &Path) -> Result<(UnixListener, SocketGuard), ManagerError> {
    if let Some(dir) = socket_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ManagerError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    // A previous manager may have crashed without cleaning up.
    if socket_path.exists() {
        warn!("Removing stale socket file: {}", socket_path.display());
        std::fs::remove_file(socket_path).map_err(|source| ManagerError::Io {
            path: socket_path.to_path_buf(),
            source,
        })?;
    }

    let listener = UnixListener::bind(socket_path).map_err(|source| ManagerError::Bind {
        path: socket_path.to_path_buf(),
        source,
    })?;

    Ok((
        listener,
        SocketGuard {
            socket_path: socket_path.to_path_buf(),
        },
    ))
}

pub(crate) async fn run_accept_loop(
    listener: UnixListener,
    manager: Manager,
    cancel: CancellationToken,
) {
    info!("Registration accept loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Registration server cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, manager).await {
                                error!("Registration connection handler error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!(
                            "Accept error on socket {}: {e}",
                            manager.socket_path().display()
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    info!("Registration accept loop stopped");
}

async fn handle_connection(stream: UnixStream, manager: Manager) -> std::io::Result<()> {
    debug!("New registration connection");

    let config = manager.config();
    let mut frames = FramedRead::new(stream, LineFrameCodec::new(config.max_frame_bytes));

    let frame = match tokio::time::timeout(config.registration_timeout(), frames.next()).await {
        Err(_) => {
            warn!(
                "Registration client sent no request within {:?}",
                config.registration_timeout()
            );
            return Ok(());
        }
        Ok(None) => {
            debug!("Client disconnected without sending request");
            return Ok(());
        }
        Ok(Some(Err(e))) => {
            warn!("Failed to read registration request: {e}");
            return Ok(());
        }
        Ok(Some(Ok(frame))) => frame,
    };

    let response = match frame {
        Frame::Line(line) => dispatch(&line, &manager).await,
        Frame::Oversized => {
            warn!(
                "Registration request exceeds {} bytes",
                config.max_frame_bytes
            );
            SocketResponse::error(
                "unknown",
                CODE_INVALID_REQUEST,
                &format!("Request exceeds {} bytes", config.max_frame_bytes),
            )
        }
    };

    let mut response_json = serde_json::to_string(&response)?;
    response_json.push('\n');

    let mut stream = frames.into_inner();
    stream.write_all(response_json.as_bytes()).await?;
    stream.flush().await?;

    debug!("Registration response sent for request_id={}", response.request_id);
    Ok(())
}

/// Validate the envelope and route it to its command handler.
async fn dispatch(request_line: &[u8], manager: &Manager) -> SocketResponse {
    let request = match parse_envelope(request_line) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match request.command.as_str() {
        COMMAND_REGISTER => handle_register(&request, manager).await,
        other => SocketResponse::error(
            &request.request_id,
            CODE_UNKNOWN_COMMAND,
            &format!("Unknown command: '{other}'"),
        ),
    }
}

fn parse_envelope(request_line: &[u8]) -> Result<SocketRequest, SocketResponse> {
    let request: SocketRequest = serde_json::from_slice(request_line).map_err(|e| {
        warn!("Malformed registration request: {e}");
        SocketResponse::error(
            "unknown",
            CODE_INVALID_REQUEST,
            &format!("Failed to parse request: {e}"),
        )
    })?;

    debug!(
        "Registration request: command={} request_id={}",
        request.command, request.request_id
    );

    if request.version != PROTOCOL_VERSION {
        return Err(SocketResponse::error(
            &request.request_id,
            CODE_VERSION_MISMATCH,
            &format!(
                "Unsupported protocol version {}; server supports {}",
                request.version, PROTOCOL_VERSION
            ),
        ));
    }

    Ok(request)
}

/// Handle the `register` command.
///
/// Payload: `{"resource_name": "...", "api_version": "v1alpha", "endpoint": "..."}`
/// Response: `{"resource_name": "...", "generation": 7}`
async fn handle_register(request: &SocketRequest, manager: &Manager) -> SocketResponse {
    let register: RegisterRequest = match serde_json::from_value(request.payload.clone()) {
        Ok(register) => register,
        Err(e) => {
            return SocketResponse::error(
                &request.request_id,
                CODE_INVALID_PAYLOAD,
                &format!("Invalid register payload: {e}"),
            );
        }
    };

    let resource_name = register.resource_name.clone();
    match manager.handle_registration(register).await {
        Ok(generation) => {
            let ack = RegisterAck {
                resource_name,
                generation: generation.get(),
            };
            match serde_json::to_value(&ack) {
                Ok(payload) => SocketResponse::ok(&request.request_id, payload),
                Err(e) => SocketResponse::error(
                    &request.request_id,
                    CODE_INVALID_REQUEST,
                    &format!("Failed to encode response: {e}"),
                ),
            }
        }
        Err(e) => {
            warn!("Rejected registration of {resource_name}: {e}");
            SocketResponse::error(&request.request_id, e.code(), &e.to_string())
        }
    }
}
