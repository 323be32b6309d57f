//! Streaming client for a single plugin's device socket.
//!
//! An endpoint owns exactly one connection. It reads full snapshots, diffs
//! each against the previous one and pushes the diff to the manager's update
//! loop tagged with its [`Generation`]. The manager drops anything whose
//! generation is no longer the active one for the resource.
//!
//! Two ways for the stream to end are kept apart:
//!
//! - cancellation (replacement or manager stop): the endpoint goes quiet.
//!   The manager has already removed its devices from the inventory, using
//!   the inventory's mirror of this endpoint's last merged snapshot.
//! - EOF or a read error with no cancellation: the plugin went away on its
//!   own, so every known device is reported unhealthy before the task exits.
//!
//! A frame that cannot be decoded (bad UTF-8, bad JSON, over the size limit)
//! is skipped; the stream stays up.

use std::path::{Path, PathBuf};
use std::time::Duration;

use device_plugin_manager_core::protocol::{
    COMMAND_LIST_AND_WATCH, ListAndWatchResponse, SocketRequest,
};
use device_plugin_manager_core::{DeviceDiff, DeviceSet, device};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::EndpointError;
use crate::codec::{Frame, LineFrameCodec};
use super::{Generation, ManagerEvent};

/// A diff produced by one endpoint, waiting to be merged by the manager.
#[derive(Debug, Clone)]
pub(crate) struct EndpointUpdate {
    pub resource_name: String,
    pub generation: Generation,
    pub diff: DeviceDiff,
}

pub(crate) struct ResourceEndpoint {
    resource_name: String,
    socket_path: PathBuf,
    frames: FramedRead<UnixStream, LineFrameCodec>,
    last_snapshot: DeviceSet,
}

impl ResourceEndpoint {
    /// Connect to the plugin and open its device stream.
    ///
    /// Snapshot lines longer than `max_frame_bytes` are dropped.
    pub(crate) async fn dial(
        resource_name: &str,
        socket_path: &Path,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, EndpointError> {
        let mut stream = tokio::time::timeout(timeout, UnixStream::connect(socket_path))
            .await
            .map_err(|_| EndpointError::DialTimeout {
                path: socket_path.to_path_buf(),
            })?
            .map_err(|source| EndpointError::Dial {
                path: socket_path.to_path_buf(),
                source,
            })?;

        let request = SocketRequest::new(COMMAND_LIST_AND_WATCH, serde_json::json!({}));
        let mut request_line = serde_json::to_string(&request)?;
        request_line.push('\n');

        let handshake = |source: std::io::Error| EndpointError::Handshake {
            path: socket_path.to_path_buf(),
            source,
        };
        stream
            .write_all(request_line.as_bytes())
            .await
            .map_err(handshake)?;
        stream.flush().await.map_err(handshake)?;

        debug!(
            "Opened device stream for {} on {}",
            resource_name,
            socket_path.display()
        );

        Ok(Self {
            resource_name: resource_name.to_string(),
            socket_path: socket_path.to_path_buf(),
            frames: FramedRead::new(stream, LineFrameCodec::new(max_frame_bytes)),
            last_snapshot: DeviceSet::new(),
        })
    }

    /// Receive loop. Runs until the stream ends or `cancel` fires.
    pub(crate) async fn run(
        mut self,
        generation: Generation,
        cancel: CancellationToken,
        events: mpsc::Sender<ManagerEvent>,
    ) {
        info!(
            "Endpoint {} ({}) receiving from {}",
            self.resource_name,
            generation,
            self.socket_path.display()
        );

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Endpoint {} ({}) stopped", self.resource_name, generation);
                    return;
                }
                next = self.frames.next() => next,
            };

            let line = match next {
                None => {
                    warn!(
                        "Plugin for {} closed its device stream",
                        self.resource_name
                    );
                    break;
                }
                Some(Err(e)) => {
                    warn!(
                        "Device stream for {} failed: {e}",
                        self.resource_name
                    );
                    break;
                }
                Some(Ok(Frame::Oversized)) => {
                    warn!(
                        "Skipping oversized snapshot from {} (limit {} bytes)",
                        self.resource_name,
                        self.frames.decoder().max_length()
                    );
                    continue;
                }
                Some(Ok(Frame::Line(line))) => line,
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let snapshot: ListAndWatchResponse = match serde_json::from_slice(&line) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(
                        "Skipping malformed snapshot from {}: {e}",
                        self.resource_name
                    );
                    continue;
                }
            };

            let diff = self.observe(snapshot);
            if diff.is_empty() {
                continue;
            }
            debug!(
                "{} ({}): +{} ~{} -{}",
                self.resource_name,
                generation,
                diff.added.len(),
                diff.updated.len(),
                diff.removed.len()
            );
            if !self.publish(generation, diff, &cancel, &events).await {
                return;
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        let diff = self.mark_unhealthy();
        if !diff.is_empty() {
            warn!(
                "Marking {} device(s) of {} unhealthy after disconnect",
                diff.updated.len(),
                self.resource_name
            );
            self.publish(generation, diff, &cancel, &events).await;
        }
    }

    /// Replace the last snapshot and return what changed.
    fn observe(&mut self, snapshot: ListAndWatchResponse) -> DeviceDiff {
        let current = device::index_devices(snapshot.devices);
        let diff = DeviceDiff::between(&self.last_snapshot, &current);
        self.last_snapshot = current;
        diff
    }

    /// Synthetic snapshot with every known device unhealthy.
    fn mark_unhealthy(&mut self) -> DeviceDiff {
        let diff = DeviceDiff::all_unhealthy(&self.last_snapshot);
        for device in &diff.updated {
            self.last_snapshot.insert(device.id.clone(), device.clone());
        }
        diff
    }

    /// Hand a diff to the manager. Returns `false` once the endpoint should stop.
    async fn publish(
        &self,
        generation: Generation,
        diff: DeviceDiff,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ManagerEvent>,
    ) -> bool {
        let update = ManagerEvent::Update(EndpointUpdate {
            resource_name: self.resource_name.clone(),
            generation,
            diff,
        });
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = events.send(update) => sent.is_ok(),
        }
    }
}
