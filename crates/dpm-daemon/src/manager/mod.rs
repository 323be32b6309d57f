//! The device plugin manager.
//!
//! [`Manager`] owns the registration socket, one [`ResourceEndpoint`] per
//! registered resource name, and the merged device inventory. All mutable
//! bookkeeping (the endpoint slots and the inventory) lives in a single
//! [`ManagerState`] behind one mutex.
//!
//! ## Tasks
//!
//! ```text
//!  plugin ──register──▶ accept loop ──▶ handle_registration ─┐
//!                                                           │ Retired
//!  plugin ◀─list-and-watch── endpoint task ──Update──▶ ┌─────▼──────┐
//!  plugin ◀─list-and-watch── endpoint task ──Update──▶ │ update loop │──▶ callback
//!                                                      └─────────────┘
//! ```
//!
//! Endpoint tasks never touch the inventory. They push diffs into a bounded
//! channel; the single update loop merges each one under the lock and then
//! invokes the callback after the lock is released. Because every callback
//! goes through that one loop, callbacks for a resource are delivered in the
//! order their mutations happened.
//!
//! ## Replacement
//!
//! Registrations are serialised. Re-registering a resource retires the old
//! endpoint under the lock (its devices leave the inventory, its slot gets a
//! fresh generation, its token is cancelled), queues the removal for the
//! callback, and only then spawns the new endpoint's receive loop. Anything
//! the old endpoint still had in flight carries a stale generation and is
//! dropped by the update loop.
//!
//! Removals are queued on [`ManagerState`] rather than sent through the
//! channel, so a registration never waits on a full channel or a slow
//! callback. `Retired` only wakes the update loop, which drains the queue
//! before handling any other event.

mod endpoint;
mod error;
mod registration;

pub use error::{EndpointError, ManagerError};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use device_plugin_manager_core::resource::{validate_api_version, validate_resource_name};
use device_plugin_manager_core::{Device, DeviceDiff, DeviceSet, ManagerConfig, RegisterRequest, RegistrationError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use endpoint::{EndpointUpdate, ResourceEndpoint};

/// Change notification callback.
///
/// Invoked with `(resource_name, added, updated, removed)` every time the
/// inventory of a resource actually changes. Runs on the manager's update
/// task without any manager lock held, so it may call back into
/// [`Manager::devices`]. It should return promptly: updates for every
/// resource queue up behind it.
pub type MonitorCallback = Arc<dyn Fn(&str, &[Device], &[Device], &[Device]) + Send + Sync>;

/// Identifies one endpoint instance.
///
/// Minted from a manager-wide counter every time an endpoint is created, so
/// a newer endpoint for the same resource always has a larger generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen {}", self.0)
    }
}

/// Messages consumed by the update loop.
#[derive(Debug)]
pub(crate) enum ManagerEvent {
    /// Diff from an endpoint; merged only if its generation is still active.
    Update(EndpointUpdate),
    /// A retired endpoint's removal was queued on the state.
    Retired,
}

/// An inventory change ready for the callback.
#[derive(Debug, Clone)]
pub(crate) struct Notification {
    resource_name: String,
    diff: DeviceDiff,
}

struct EndpointSlot {
    generation: Generation,
    socket_path: PathBuf,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ManagerState {
    endpoints: HashMap<String, EndpointSlot>,
    inventory: HashMap<String, DeviceSet>,
    last_generation: u64,
    accepting: bool,
    /// Removals from retired endpoints, not yet reported.
    pending: VecDeque<Notification>,
}

impl ManagerState {
    fn mint_generation(&mut self) -> Generation {
        self.last_generation += 1;
        Generation(self.last_generation)
    }

    /// Remove the active slot for `resource_name` and its devices.
    ///
    /// Returns the slot (so the caller can stop its task) and the removal
    /// that was applied to the inventory.
    fn retire(&mut self, resource_name: &str) -> Option<(EndpointSlot, DeviceDiff)> {
        let slot = self.endpoints.remove(resource_name)?;
        let removal = match self.inventory.get_mut(resource_name) {
            Some(devices) => DeviceDiff::removal_of(devices).apply_to(devices),
            None => DeviceDiff::default(),
        };
        Some((slot, removal))
    }
}

/// Handles owned while the manager is running.
struct Runtime {
    cancel: CancellationToken,
    events: mpsc::Sender<ManagerEvent>,
    accept_task: JoinHandle<()>,
    update_task: JoinHandle<()>,
    _socket: registration::SocketGuard,
}

struct ManagerInner {
    config: ManagerConfig,
    callback: MonitorCallback,
    state: Mutex<ManagerState>,
    runtime: Mutex<Option<Runtime>>,
    registration_lock: tokio::sync::Mutex<()>,
}

/// Device plugin manager handle. Cheap to clone; clones share one manager.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("socket_path", &self.inner.config.socket_path)
            .field("running", &self.is_running())
            .finish()
    }
}

fn validate_config(config: &ManagerConfig) -> Result<(), ManagerError> {
    if config.socket_path.as_os_str().is_empty() {
        return Err(ManagerError::Config {
            message: "registration socket path is empty".to_string(),
        });
    }
    Ok(())
}

impl Manager {
    /// Create a manager. Nothing is bound until [`Manager::start`].
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Config`] when the socket path is empty.
    pub fn new<F>(config: ManagerConfig, callback: F) -> Result<Self, ManagerError>
    where
        F: Fn(&str, &[Device], &[Device], &[Device]) + Send + Sync + 'static,
    {
        validate_config(&config)?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                callback: Arc::new(callback),
                state: Mutex::new(ManagerState::default()),
                runtime: Mutex::new(None),
                registration_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Path of the registration socket.
    pub fn socket_path(&self) -> &Path {
        &self.inner.config.socket_path
    }

    pub fn is_running(&self) -> bool {
        self.lock_runtime().is_some()
    }

    /// Bind the registration socket and start serving registrations.
    ///
    /// A stale socket file left by a previous run is removed first. Must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::Config`] if the socket path is empty
    /// - [`ManagerError::AlreadyRunning`] if the manager was already started
    /// - [`ManagerError::Io`] / [`ManagerError::Bind`] if the socket cannot be created
    pub async fn start(&self) -> Result<(), ManagerError> {
        validate_config(&self.inner.config)?;

        let mut runtime = self.lock_runtime();
        if runtime.is_some() {
            return Err(ManagerError::AlreadyRunning);
        }

        let socket_path = self.inner.config.socket_path.clone();
        let (listener, socket) = registration::bind(&socket_path)?;

        let cancel = CancellationToken::new();
        let (events, events_rx) = mpsc::channel(self.inner.config.event_buffer.max(1));

        self.lock_state().accepting = true;

        let update_task = tokio::spawn(run_update_loop(self.clone(), events_rx, cancel.clone()));
        let accept_task = tokio::spawn(registration::run_accept_loop(
            listener,
            self.clone(),
            cancel.clone(),
        ));

        *runtime = Some(Runtime {
            cancel,
            events,
            accept_task,
            update_task,
            _socket: socket,
        });

        info!(
            "Device plugin manager listening on {}",
            socket_path.display()
        );
        Ok(())
    }

    /// Stop serving registrations, stop every endpoint and clear the inventory.
    ///
    /// Registrations still in flight are rejected with
    /// [`RegistrationError::ShuttingDown`]. Waits up to the configured
    /// shutdown timeout for background tasks, aborting any that overrun.
    /// Calling `stop` on a manager that is not running does nothing.
    pub async fn stop(&self) {
        let Some(runtime) = self.lock_runtime().take() else {
            debug!("Device plugin manager already stopped");
            return;
        };

        info!("Stopping device plugin manager");
        runtime.cancel.cancel();
        self.lock_state().accepting = false;

        // Let any registration past its dial observe `accepting == false`.
        let _serial = self.inner.registration_lock.lock().await;

        let slots: Vec<(String, EndpointSlot)> = {
            let mut state = self.lock_state();
            state.inventory.clear();
            state.pending.clear();
            state.endpoints.drain().collect()
        };

        let timeout = self.inner.config.shutdown_timeout();
        let mut tasks = vec![
            ("registration accept loop".to_string(), runtime.accept_task),
            ("update loop".to_string(), runtime.update_task),
        ];
        for (resource_name, slot) in slots {
            slot.cancel.cancel();
            if let Some(task) = slot.task {
                tasks.push((format!("endpoint {resource_name} ({})", slot.generation), task));
            }
        }

        for (name, mut task) in tasks {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => debug!("{name} finished"),
                Ok(Err(e)) => error!("{name} failed: {e}"),
                Err(_) => {
                    warn!("{name} did not finish within {timeout:?}; aborting");
                    task.abort();
                }
            }
        }

        // Dropping the socket guard removes the socket file.
        drop(runtime.events);
        drop(runtime._socket);
        info!("Device plugin manager stopped");
    }

    /// Copy of the current inventory, keyed by resource name.
    ///
    /// Every resource with an active endpoint is present, possibly with an
    /// empty list before its first snapshot arrives. Lists are sorted by id.
    pub fn devices(&self) -> HashMap<String, Vec<Device>> {
        let state = self.lock_state();
        state
            .inventory
            .iter()
            .map(|(name, devices)| {
                let mut list: Vec<Device> = devices.values().cloned().collect();
                list.sort_by(|a, b| a.id.cmp(&b.id));
                (name.clone(), list)
            })
            .collect()
    }

    /// Resource names with an active endpoint, sorted.
    pub fn resources(&self) -> Vec<String> {
        let state = self.lock_state();
        let mut names: Vec<String> = state.endpoints.keys().cloned().collect();
        names.sort();
        names
    }

    /// Generation of the active endpoint for `resource_name`.
    pub fn active_generation(&self, resource_name: &str) -> Option<Generation> {
        self.lock_state()
            .endpoints
            .get(resource_name)
            .map(|slot| slot.generation)
    }

    /// Accept a registration: dial the plugin and make its endpoint active.
    ///
    /// Returns once the new endpoint is active, before its first snapshot
    /// has been merged. If the resource already had an endpoint, that one is
    /// retired first and its devices are reported as removed.
    ///
    /// # Errors
    ///
    /// Field validation failures, an unreachable plugin socket, or a manager
    /// that is not running. None of them change the inventory or the
    /// existing endpoint.
    pub async fn handle_registration(
        &self,
        request: RegisterRequest,
    ) -> Result<Generation, RegistrationError> {
        validate_resource_name(&request.resource_name)?;
        validate_api_version(&request.api_version)?;
        let socket_path = self.resolve_endpoint(&request.endpoint)?;

        let _serial = self.inner.registration_lock.lock().await;

        let (events, cancel) = {
            let runtime = self.lock_runtime();
            let runtime = runtime.as_ref().ok_or(RegistrationError::ShuttingDown)?;
            (runtime.events.clone(), runtime.cancel.clone())
        };

        let dial = ResourceEndpoint::dial(
            &request.resource_name,
            &socket_path,
            self.inner.config.dial_timeout(),
            self.inner.config.max_frame_bytes,
        );
        let endpoint = tokio::select! {
            _ = cancel.cancelled() => return Err(RegistrationError::ShuttingDown),
            dialled = dial => dialled.map_err(|e| RegistrationError::InvalidEndpoint {
                endpoint: request.endpoint.clone(),
                reason: e.to_string(),
            })?,
        };

        let resource_name = request.resource_name;
        let endpoint_cancel = cancel.child_token();
        let (generation, retired) = {
            let mut state = self.lock_state();
            // `stop` cancels before it clears `accepting`.
            if !state.accepting || endpoint_cancel.is_cancelled() {
                return Err(RegistrationError::ShuttingDown);
            }
            let generation = state.mint_generation();
            let retired = state.retire(&resource_name).map(|(old, removal)| {
                if !removal.is_empty() {
                    state.pending.push_back(Notification {
                        resource_name: resource_name.clone(),
                        diff: removal,
                    });
                }
                old
            });
            state.endpoints.insert(
                resource_name.clone(),
                EndpointSlot {
                    generation,
                    socket_path: socket_path.clone(),
                    cancel: endpoint_cancel.clone(),
                    task: None,
                },
            );
            state.inventory.insert(resource_name.clone(), DeviceSet::new());
            (generation, retired)
        };

        if let Some(old) = retired {
            info!(
                "Replacing endpoint for {} ({} at {} -> {} at {})",
                resource_name,
                old.generation,
                old.socket_path.display(),
                generation,
                socket_path.display()
            );
            old.cancel.cancel();
            // A full channel already holds a wake-up; a closed one means stop.
            let _ = events.try_send(ManagerEvent::Retired);
        } else {
            info!(
                "Registered {} ({}) at {}",
                resource_name,
                generation,
                socket_path.display()
            );
        }

        let task = tokio::spawn(endpoint.run(generation, endpoint_cancel, events));
        let mut state = self.lock_state();
        match state.endpoints.get_mut(&resource_name) {
            Some(slot) if slot.generation == generation => slot.task = Some(task),
            // Stop drained the slot; the endpoint's token is already cancelled.
            _ => task.abort(),
        }

        Ok(generation)
    }

    /// Merge an endpoint's diff into the inventory.
    ///
    /// Returns the change to report, or `None` when the diff is stale (its
    /// generation is not the active one) or changed nothing.
    fn apply_snapshot_diff(&self, update: EndpointUpdate) -> Option<Notification> {
        let mut state = self.lock_state();

        let active = state
            .endpoints
            .get(&update.resource_name)
            .map(|slot| slot.generation);
        if active != Some(update.generation) {
            debug!(
                "Discarding stale update for {} from {} (active: {:?})",
                update.resource_name, update.generation, active
            );
            return None;
        }

        let devices = state
            .inventory
            .entry(update.resource_name.clone())
            .or_default();
        let effective = update.diff.apply_to(devices);
        if effective.is_empty() {
            return None;
        }

        Some(Notification {
            resource_name: update.resource_name,
            diff: effective,
        })
    }

    /// Merge a diff and, if anything changed, report it to the callback.
    ///
    /// The lock is released before the callback runs.
    fn handle_snapshot_diff(&self, update: EndpointUpdate) {
        if let Some(notification) = self.apply_snapshot_diff(update) {
            self.notify(&notification);
        }
    }

    fn take_pending(&self) -> VecDeque<Notification> {
        std::mem::take(&mut self.lock_state().pending)
    }

    fn notify(&self, notification: &Notification) {
        let Notification {
            resource_name,
            diff,
        } = notification;
        debug!(
            "Inventory of {} changed: +{} ~{} -{}",
            resource_name,
            diff.added.len(),
            diff.updated.len(),
            diff.removed.len()
        );

        let callback = &self.inner.callback;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(resource_name, &diff.added, &diff.updated, &diff.removed)
        }));
        if outcome.is_err() {
            error!("Device callback panicked while handling {}", resource_name);
        }
    }

    /// Resolve a plugin endpoint to a socket path.
    ///
    /// Relative endpoints are taken relative to the registration socket's
    /// directory.
    fn resolve_endpoint(&self, endpoint: &str) -> Result<PathBuf, RegistrationError> {
        if endpoint.trim().is_empty() {
            return Err(RegistrationError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "endpoint is empty".to_string(),
            });
        }
        let path = Path::new(endpoint);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.inner.config.plugin_dir().join(path))
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.inner.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Applies endpoint updates and dispatches callbacks, one event at a time.
async fn run_update_loop(
    manager: Manager,
    mut events: mpsc::Receiver<ManagerEvent>,
    cancel: CancellationToken,
) {
    debug!("Update loop started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        for notification in manager.take_pending() {
            manager.notify(&notification);
        }
        if let ManagerEvent::Update(update) = event {
            manager.handle_snapshot_diff(update);
        }
    }
    debug!("Update loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    type Calls = Arc<Mutex<Vec<(String, DeviceDiff)>>>;

    fn recording_manager(socket_path: PathBuf) -> (Manager, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let manager = Manager::new(ManagerConfig::new(socket_path), move |name, a, u, r| {
            sink.lock().unwrap().push((
                name.to_string(),
                DeviceDiff {
                    added: a.to_vec(),
                    updated: u.to_vec(),
                    removed: r.to_vec(),
                },
            ));
        })
        .unwrap();
        (manager, calls)
    }

    /// Install an active slot by hand, without a plugin behind it.
    fn activate(manager: &Manager, resource_name: &str) -> Generation {
        let mut state = manager.lock_state();
        let generation = state.mint_generation();
        state.retire(resource_name);
        state.endpoints.insert(
            resource_name.to_string(),
            EndpointSlot {
                generation,
                socket_path: PathBuf::from("/nonexistent"),
                cancel: CancellationToken::new(),
                task: None,
            },
        );
        state
            .inventory
            .insert(resource_name.to_string(), DeviceSet::new());
        generation
    }

    fn update(resource_name: &str, generation: Generation, added: Vec<Device>) -> EndpointUpdate {
        EndpointUpdate {
            resource_name: resource_name.to_string(),
            generation,
            diff: DeviceDiff {
                added,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_new_rejects_empty_socket_path() {
        let err = Manager::new(ManagerConfig::new(""), |_, _, _, _| {}).unwrap_err();
        assert!(matches!(err, ManagerError::Config { .. }));
    }

    #[test]
    fn test_generations_are_monotonic() {
        let (manager, _) = recording_manager(PathBuf::from("/tmp/unused.sock"));
        let a = activate(&manager, "vendor.example/a");
        let b = activate(&manager, "vendor.example/b");
        let a2 = activate(&manager, "vendor.example/a");
        assert!(a < b && b < a2);
        assert_eq!(manager.active_generation("vendor.example/a"), Some(a2));
    }

    #[test]
    fn test_active_update_is_merged_and_reported() {
        let (manager, calls) = recording_manager(PathBuf::from("/tmp/unused.sock"));
        let generation = activate(&manager, "vendor.example/gpu");

        manager.handle_snapshot_diff(update(
            "vendor.example/gpu",
            generation,
            vec![Device::healthy("Dev1"), Device::healthy("Dev2")],
        ));

        assert_eq!(manager.devices()["vendor.example/gpu"].len(), 2);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.added.len(), 2);
    }

    #[test]
    fn test_noop_update_is_not_reported() {
        let (manager, calls) = recording_manager(PathBuf::from("/tmp/unused.sock"));
        let generation = activate(&manager, "vendor.example/gpu");
        let devices = vec![Device::healthy("Dev1")];

        manager.handle_snapshot_diff(update("vendor.example/gpu", generation, devices.clone()));
        manager.handle_snapshot_diff(update("vendor.example/gpu", generation, devices));

        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[traced_test]
    #[test]
    fn test_stale_generation_is_discarded() {
        let (manager, calls) = recording_manager(PathBuf::from("/tmp/unused.sock"));
        let old = activate(&manager, "vendor.example/gpu");
        let current = activate(&manager, "vendor.example/gpu");

        manager.handle_snapshot_diff(update(
            "vendor.example/gpu",
            old,
            vec![Device::healthy("Ghost")],
        ));

        assert!(manager.devices()["vendor.example/gpu"].is_empty());
        assert!(calls.lock().unwrap().is_empty());
        assert!(logs_contain("Discarding stale update"));

        manager.handle_snapshot_diff(update(
            "vendor.example/gpu",
            current,
            vec![Device::healthy("Dev1")],
        ));
        assert_eq!(manager.devices()["vendor.example/gpu"].len(), 1);
    }

    #[test]
    fn test_update_for_unknown_resource_is_discarded() {
        let (manager, calls) = recording_manager(PathBuf::from("/tmp/unused.sock"));
        manager.handle_snapshot_diff(update(
            "vendor.example/none",
            Generation(1),
            vec![Device::healthy("Dev1")],
        ));
        assert!(manager.devices().is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retire_removes_devices_of_that_resource_only() {
        let (manager, _) = recording_manager(PathBuf::from("/tmp/unused.sock"));
        let gpu = activate(&manager, "vendor.example/gpu");
        let nic = activate(&manager, "vendor.example/nic");
        manager.handle_snapshot_diff(update("vendor.example/gpu", gpu, vec![Device::healthy("0")]));
        manager.handle_snapshot_diff(update("vendor.example/nic", nic, vec![Device::healthy("0")]));

        let (slot, removal) = manager.lock_state().retire("vendor.example/gpu").unwrap();
        assert_eq!(slot.generation, gpu);
        assert_eq!(removal.removed, vec![Device::healthy("0")]);

        let devices = manager.devices();
        assert!(devices["vendor.example/gpu"].is_empty());
        assert_eq!(devices["vendor.example/nic"].len(), 1);
    }

    #[test]
    fn test_reentrant_callback_does_not_deadlock() {
        let seen = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Manager>>> = Arc::new(Mutex::new(None));
        let (seen_cb, slot_cb) = (seen.clone(), slot.clone());
        let manager = Manager::new(ManagerConfig::new("/tmp/unused.sock"), move |name, _, _, _| {
            if let Some(manager) = slot_cb.lock().unwrap().as_ref() {
                seen_cb.store(manager.devices()[name].len(), Ordering::SeqCst);
            }
        })
        .unwrap();
        *slot.lock().unwrap() = Some(manager.clone());

        let generation = activate(&manager, "vendor.example/gpu");
        manager.handle_snapshot_diff(update(
            "vendor.example/gpu",
            generation,
            vec![Device::healthy("a"), Device::healthy("b")],
        ));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        slot.lock().unwrap().take();
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let manager = Manager::new(ManagerConfig::new("/tmp/unused.sock"), |_, _, _, _| {
            panic!("callback bug");
        })
        .unwrap();
        let generation = activate(&manager, "vendor.example/gpu");
        manager.handle_snapshot_diff(update(
            "vendor.example/gpu",
            generation,
            vec![Device::healthy("a")],
        ));
        assert_eq!(manager.devices()["vendor.example/gpu"].len(), 1);
    }

    #[test]
    fn test_relative_endpoint_resolves_next_to_registration_socket() {
        let (manager, _) = recording_manager(PathBuf::from("/run/dpm/manager.sock"));
        assert_eq!(
            manager.resolve_endpoint("gpu.sock").unwrap(),
            PathBuf::from("/run/dpm/gpu.sock")
        );
        assert_eq!(
            manager.resolve_endpoint("/elsewhere/gpu.sock").unwrap(),
            PathBuf::from("/elsewhere/gpu.sock")
        );
        assert!(matches!(
            manager.resolve_endpoint("  "),
            Err(RegistrationError::InvalidEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_registration_before_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = recording_manager(dir.path().join("manager.sock"));
        let err = manager
            .handle_registration(RegisterRequest::new(
                "vendor.example/gpu",
                device_plugin_manager_core::API_VERSION,
                "gpu.sock",
            ))
            .await
            .unwrap_err();
        assert_eq!(err, RegistrationError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_registration_in_flight_at_stop_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, calls) = recording_manager(dir.path().join("manager.sock"));
        manager.start().await.unwrap();
        let mut plugin = crate::stub::DevicePluginStub::new(
            vec![Device::healthy("a")],
            dir.path().join("gpu.sock"),
        );
        plugin.start().await.unwrap();

        // Park the registration behind the serialisation lock.
        let serial = manager.inner.registration_lock.lock().await;
        let registering = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .handle_registration(RegisterRequest::new(
                        "vendor.example/gpu",
                        device_plugin_manager_core::API_VERSION,
                        "gpu.sock",
                    ))
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stopping = tokio::spawn({
            let manager = manager.clone();
            async move { manager.stop().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(serial);

        let result = registering.await.unwrap();
        assert_eq!(result, Err(RegistrationError::ShuttingDown));
        tokio::time::timeout(std::time::Duration::from_secs(5), stopping)
            .await
            .expect("stop did not finish")
            .unwrap();
        assert!(manager.resources().is_empty());
        assert!(manager.devices().is_empty());
        assert!(calls.lock().unwrap().is_empty());
        plugin.stop().await;
    }

    #[tokio::test]
    async fn test_replacement_does_not_wait_on_full_event_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = recording_manager(dir.path().join("manager.sock"));

        // Runtime whose update loop never drains: the test owns the receiver.
        let (events, mut events_rx) = mpsc::channel(1);
        events.try_send(ManagerEvent::Retired).unwrap();
        let (_listener, socket) = registration::bind(manager.socket_path()).unwrap();
        *manager.lock_runtime() = Some(Runtime {
            cancel: CancellationToken::new(),
            events,
            accept_task: tokio::spawn(async {}),
            update_task: tokio::spawn(async {}),
            _socket: socket,
        });
        manager.lock_state().accepting = true;

        let mut first = crate::stub::DevicePluginStub::new(
            vec![Device::healthy("a")],
            dir.path().join("one.sock"),
        );
        let mut second = crate::stub::DevicePluginStub::new(
            vec![Device::healthy("b")],
            dir.path().join("two.sock"),
        );
        first.start().await.unwrap();
        second.start().await.unwrap();

        let register = |endpoint: &str| {
            RegisterRequest::new(
                "vendor.example/gpu",
                device_plugin_manager_core::API_VERSION,
                endpoint,
            )
        };
        let old = manager.handle_registration(register("one.sock")).await.unwrap();
        manager.handle_snapshot_diff(update("vendor.example/gpu", old, vec![Device::healthy("a")]));

        let replaced = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            manager.handle_registration(register("two.sock")),
        )
        .await
        .expect("registration blocked on the event channel")
        .unwrap();
        assert!(replaced > old);

        let pending: Vec<Notification> = manager.take_pending().into_iter().collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].resource_name, "vendor.example/gpu");
        assert_eq!(pending[0].diff.removed, vec![Device::healthy("a")]);
        assert!(manager.devices()["vendor.example/gpu"].is_empty());

        assert!(matches!(events_rx.recv().await, Some(ManagerEvent::Retired)));
        drop(events_rx);
        manager.stop().await;
        first.stop().await;
        second.stop().await;
    }
}
