//! In-process device plugin for tests and local experiments.
//!
//! [`DevicePluginStub`] serves a device socket that answers `list-and-watch`
//! with a full snapshot of its current devices and pushes a new snapshot
//! every time [`DevicePluginStub::update`] is called. Stopping the stub
//! closes every open stream, which the manager sees as a plugin crash.

use std::path::{Path, PathBuf};

use device_plugin_manager_core::protocol::{COMMAND_LIST_AND_WATCH, SocketRequest};
use device_plugin_manager_core::{
    API_VERSION, ClientError, Device, ListAndWatchResponse, RegisterAck, RegisterRequest, client,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct DevicePluginStub {
    socket_path: PathBuf,
    devices: watch::Sender<Vec<Device>>,
    cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl DevicePluginStub {
    pub fn new(devices: Vec<Device>, socket_path: impl Into<PathBuf>) -> Self {
        let (devices, _) = watch::channel(devices);
        Self {
            socket_path: socket_path.into(),
            devices,
            cancel: CancellationToken::new(),
            server: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the device socket and start serving streams.
    ///
    /// Restarting a stopped stub binds a fresh socket.
    pub async fn start(&mut self) -> std::io::Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;

        self.cancel = CancellationToken::new();
        self.server = Some(tokio::spawn(serve(
            listener,
            self.devices.subscribe(),
            self.cancel.clone(),
        )));
        debug!("Device plugin stub serving {}", self.socket_path.display());
        Ok(())
    }

    /// Close every stream and remove the socket.
    pub async fn stop(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        self.cancel.cancel();
        if let Err(e) = server.await {
            warn!("Device plugin stub server failed: {e}");
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(
                "Device plugin stub socket {} not removed: {e}",
                self.socket_path.display()
            );
        }
    }

    /// Replace the device list; every open stream receives the new snapshot.
    pub fn update(&self, devices: Vec<Device>) {
        self.devices.send_replace(devices);
    }

    /// Register this stub with the manager at `manager_socket`.
    ///
    /// The stub's absolute socket path is sent as the endpoint.
    pub async fn register(
        &self,
        manager_socket: &Path,
        resource_name: &str,
    ) -> Result<RegisterAck, ClientError> {
        let request = RegisterRequest::new(
            resource_name,
            API_VERSION,
            self.socket_path.to_string_lossy(),
        );
        let manager_socket = manager_socket.to_path_buf();
        tokio::task::spawn_blocking(move || client::register(&manager_socket, &request))
            .await
            .map_err(|e| ClientError::Io {
                path: self.socket_path.clone(),
                source: std::io::Error::other(e),
            })?
    }
}

impl Drop for DevicePluginStub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(
    listener: UnixListener,
    devices: watch::Receiver<Vec<Device>>,
    cancel: CancellationToken,
) {
    let mut streams = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    streams.spawn(stream_devices(stream, devices.clone()));
                }
                Err(e) => {
                    warn!("Device plugin stub accept failed: {e}");
                    break;
                }
            },
        }
    }
    streams.shutdown().await;
}

async fn stream_devices(stream: UnixStream, mut devices: watch::Receiver<Vec<Device>>) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
    }
    match serde_json::from_str::<SocketRequest>(line.trim()) {
        Ok(request) if request.command == COMMAND_LIST_AND_WATCH => {}
        _ => {
            warn!("Device plugin stub got an unexpected request: {}", line.trim());
            return;
        }
    }

    let mut stream = reader.into_inner();
    loop {
        let snapshot = ListAndWatchResponse {
            devices: devices.borrow_and_update().clone(),
        };
        let mut frame = match serde_json::to_string(&snapshot) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Device plugin stub failed to encode snapshot: {e}");
                return;
            }
        };
        frame.push('\n');
        if stream.write_all(frame.as_bytes()).await.is_err() {
            return;
        }
        if devices.changed().await.is_err() {
            return;
        }
    }
}
