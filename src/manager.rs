use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Weak,
    },
};

use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    common::{
        staging_log_path, LogCreationFlags, LogManagerMode, SharedLogSettings,
        DEFAULT_APPLICATION_SHARED_LOG_ID, DEFAULT_MAXIMUM_RECORD_SIZE, MAX_PATHNAME_LENGTH,
        STAGING_LOG_SIZE, STAGING_LOG_STREAMS,
    },
    container::{ContainerBinding, ContainerError, DriverBinding, InProcBinding},
    lifecycle::{ActivityGuard, BeginClose, ServiceLifecycle},
    logical_log::LogicalLog,
    physical_log::{PhysicalLog, PhysicalLogError, PhysicalLogHandle},
};

/// Error that occurred during calls to [`LogManager`] or [`LogManagerHandle`].
#[derive(Debug, Snafu)]
pub enum ManagerError {
    /// The manager or handle has been closed; the operation was not started.
    #[snafu(display("log manager is closed"))]
    Closed,

    /// Cooperative cancellation was observed at a suspension point.
    #[snafu(display("operation was cancelled"))]
    Cancelled,

    /// A physical log with this id is already open.
    #[snafu(display("physical log {} already exists", id))]
    Collision { id: Uuid },

    /// The container binding failed the operation.
    #[snafu(display("container error: {}", source))]
    Container { source: ContainerError },

    /// An operation on the physical log wrapper failed.
    #[snafu(display("physical log error: {}", source))]
    PhysicalLog { source: PhysicalLogError },

    /// A container path exceeded the longest accepted pathname.
    #[snafu(display("path '{}' exceeds {} characters", path.display(), limit))]
    PathTooLong { path: PathBuf, limit: usize },

    /// A default-shared-log operation was issued without shared-log settings.
    #[snafu(display("no shared log settings were supplied at manager open"))]
    MissingSharedLogSettings,
}

impl ManagerError {
    pub fn is_collision(&self) -> bool {
        matches!(self, ManagerError::Collision { .. })
    }
}

struct ManagerHandleEntry {
    #[allow(dead_code)]
    handle: Weak<LogManagerHandle>,
    /// Manager activity representing this handle; released when the entry is removed.
    _activity: ActivityGuard,
}

struct PhysicalLogEntry {
    log: Arc<PhysicalLog>,
    /// Manager activity representing this physical log; released when the entry is
    /// removed after the log's last consumer closes.
    _activity: ActivityGuard,
}

#[derive(Default)]
struct Tables {
    binding: Option<Arc<dyn ContainerBinding>>,
    handles: HashMap<i64, ManagerHandleEntry>,
    logs: HashMap<Uuid, PhysicalLogEntry>,
}

/// Process-wide registry of open physical logs and manager handles.
///
/// The backing container binding is created lazily by the first handle; it is closed
/// when the last handle and the last physical log are gone.  An out-of-proc binding
/// that reports the driver missing transparently downgrades the manager to in-proc.
pub struct LogManager {
    shared_log_settings: Option<SharedLogSettings>,
    mode: parking_lot::Mutex<LogManagerMode>,
    next_handle_id: AtomicI64,
    tables: tokio::sync::Mutex<Tables>,
    lifecycle: Arc<ServiceLifecycle>,
    weak_self: Weak<LogManager>,
}

impl LogManager {
    /// Opens a manager with the given default shared-log settings and mode.
    pub async fn open(
        shared_log_settings: Option<SharedLogSettings>,
        mode: LogManagerMode,
    ) -> Result<Arc<LogManager>, ManagerError> {
        let manager = Arc::new_cyclic(|weak| LogManager {
            shared_log_settings,
            mode: parking_lot::Mutex::new(mode.resolve()),
            next_handle_id: AtomicI64::new(0),
            tables: tokio::sync::Mutex::new(Tables::default()),
            lifecycle: ServiceLifecycle::new(),
            weak_self: weak.clone(),
        });
        manager.lifecycle.open();
        Ok(manager)
    }

    /// The manager's current mode; `OutOfProc` may downgrade to `InProc` at first use.
    pub fn mode(&self) -> LogManagerMode {
        *self.mode.lock()
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    pub(crate) fn shared_log_settings(&self) -> Option<&SharedLogSettings> {
        self.shared_log_settings.as_ref()
    }

    fn arc_self(&self) -> Arc<LogManager> {
        self.weak_self.upgrade().expect("manager is alive")
    }

    #[cfg(test)]
    pub(crate) async fn handle_count(&self) -> usize {
        self.tables.lock().await.handles.len()
    }

    #[cfg(test)]
    pub(crate) async fn physical_log_count(&self) -> usize {
        self.tables.lock().await.logs.len()
    }

    #[cfg(test)]
    pub(crate) async fn binding_loaded(&self) -> bool {
        self.tables.lock().await.binding.is_some()
    }

    /// Acquires a handle, lazily creating the container binding on first use.
    pub async fn get_handle(
        self: &Arc<Self>,
        partition_id: Uuid,
        replica_id: i64,
        work_directory: &Path,
        _token: &CancellationToken,
    ) -> Result<Arc<LogManagerHandle>, ManagerError> {
        // Activity representing the handle; released when the handle reports closure
        // in `on_close_handle`.
        let activity = self
            .lifecycle
            .try_acquire_activity()
            .ok_or(ManagerError::Closed)?;

        let mut tables = self.tables.lock().await;

        if tables.binding.is_none() {
            let mode = *self.mode.lock();
            let binding: Arc<dyn ContainerBinding> = match mode {
                LogManagerMode::OutOfProc => Arc::new(DriverBinding),
                LogManagerMode::InProc => Arc::new(InProcBinding),
                LogManagerMode::Default => unreachable!("mode was resolved at open"),
            };

            let binding = match binding.open().await {
                Ok(()) => binding,
                Err(e) if mode == LogManagerMode::OutOfProc && e.is_driver_not_loaded() => {
                    // Normal for driverless environments; fall back to in-proc.
                    warn!(
                        error = %e,
                        "out-of-proc mode requested but driver is not loaded, downgrading to in-proc"
                    );
                    *self.mode.lock() = LogManagerMode::InProc;
                    let binding: Arc<dyn ContainerBinding> = Arc::new(InProcBinding);
                    binding.open().await.context(ContainerSnafu)?;
                    binding
                }
                Err(e) => {
                    error!(error = %e, "failed to open container binding");
                    return Err(ManagerError::Container { source: e });
                }
            };

            tables.binding = Some(binding);
        }

        let id = self.next_handle_id.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = LogManagerHandle::new(
            self.arc_self(),
            id,
            partition_id,
            replica_id,
            work_directory.to_path_buf(),
        );
        tables.handles.insert(
            id,
            ManagerHandleEntry {
                handle: Arc::downgrade(&handle),
                _activity: activity,
            },
        );

        Ok(handle)
    }

    fn binding(tables: &Tables) -> Result<Arc<dyn ContainerBinding>, ManagerError> {
        tables
            .binding
            .as_ref()
            .map(Arc::clone)
            .ok_or(ManagerError::Closed)
    }

    /// Closes the container binding once no handles and no physical logs remain.
    async fn close_binding_if_empty(&self, tables: &mut Tables) {
        if tables.handles.is_empty() && tables.logs.is_empty() {
            if let Some(binding) = tables.binding.take() {
                if let Err(e) = binding.close().await {
                    warn!(error = %e, "failed to close container binding on last close");
                }
            }
        }
    }

    pub(crate) async fn on_close_handle(
        &self,
        handle: &LogManagerHandle,
    ) -> Result<(), ContainerError> {
        let entry;
        {
            let mut tables = self.tables.lock().await;
            entry = tables.handles.remove(&handle.id());
            assert!(entry.is_some(), "manager handle missing from handle table");
            self.close_binding_if_empty(&mut tables).await;
        }
        // The activity is released outside the lock, after which the manager may
        // finish closing.
        drop(entry);
        Ok(())
    }

    /// Creates a new physical log container and returns the first handle to it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn on_create_and_open_physical_log(
        self: &Arc<Self>,
        path: &Path,
        id: Uuid,
        log_size: u64,
        maximum_number_streams: u32,
        maximum_record_size: u32,
        flags: LogCreationFlags,
        token: &CancellationToken,
    ) -> Result<Arc<PhysicalLogHandle>, ManagerError> {
        // Activity representing the physical log; released when the log reports its
        // last consumer closed.
        let activity = self
            .lifecycle
            .try_acquire_activity()
            .ok_or(ManagerError::Closed)?;

        let mut tables = self.tables.lock().await;

        if tables.logs.contains_key(&id) {
            return Err(ManagerError::Collision { id });
        }

        let binding = Self::binding(&tables)?;
        let container = binding
            .create_container(
                path,
                id,
                log_size,
                maximum_number_streams,
                maximum_record_size,
                flags,
            )
            .await
            .context(ContainerSnafu)?;

        let log = PhysicalLog::new(self.arc_self(), id, path.to_path_buf(), container);
        log.open();

        let handle = match log.get_handle(token).await {
            Ok(handle) => handle,
            Err(e) => {
                // Roll back: close what was opened, delete the container just created.
                error!(container_id = %id, error = %e, "failed to acquire first handle");
                if let Err(e2) = log.container().close().await {
                    warn!(container_id = %id, error = %e2,
                        "failed to close container while compensating for create failure");
                }
                if let Err(e2) = binding.delete_container(path, id).await {
                    warn!(container_id = %id, error = %e2,
                        "failed to delete container while compensating for create failure");
                }
                return Err(ManagerError::PhysicalLog { source: e });
            }
        };

        tables.logs.insert(
            id,
            PhysicalLogEntry {
                log,
                _activity: activity,
            },
        );

        info!(container_id = %id, path = %path.display(), "created physical log");
        Ok(handle)
    }

    /// Opens a physical log, or aliases another handle onto an already open one.
    pub(crate) async fn on_open_physical_log(
        self: &Arc<Self>,
        path: &Path,
        id: Uuid,
        token: &CancellationToken,
    ) -> Result<Arc<PhysicalLogHandle>, ManagerError> {
        let activity = self
            .lifecycle
            .try_acquire_activity()
            .ok_or(ManagerError::Closed)?;

        let mut tables = self.tables.lock().await;

        if let Some(entry) = tables.logs.get(&id) {
            // Already open; the activity acquired above is redundant with the one the
            // map entry already holds.
            drop(activity);
            let log = Arc::clone(&entry.log);
            return log.get_handle(token).await.context(PhysicalLogSnafu);
        }

        let binding = Self::binding(&tables)?;

        // In-proc containers are keyed by path; the id is used only for the registry.
        let open_id = if *self.mode.lock() == LogManagerMode::InProc {
            Uuid::nil()
        } else {
            id
        };
        let container = match binding.open_container(path, open_id).await {
            Ok(container) => container,
            Err(e) => {
                if e.is_not_found() {
                    info!(container_id = %id, path = %path.display(),
                        "physical log container does not exist");
                } else {
                    error!(container_id = %id, path = %path.display(), error = %e,
                        "failed to open physical log container");
                }
                return Err(ManagerError::Container { source: e });
            }
        };

        let log = PhysicalLog::new(self.arc_self(), id, path.to_path_buf(), container);
        log.open();

        let handle = match log.get_handle(token).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(container_id = %id, error = %e, "failed to acquire first handle");
                if let Err(e2) = log.container().close().await {
                    warn!(container_id = %id, error = %e2,
                        "failed to close container while compensating for open failure");
                }
                return Err(ManagerError::PhysicalLog { source: e });
            }
        };

        tables.logs.insert(
            id,
            PhysicalLogEntry {
                log,
                _activity: activity,
            },
        );

        info!(container_id = %id, path = %path.display(), "opened physical log");
        Ok(handle)
    }

    pub(crate) async fn on_delete_physical_log(
        &self,
        path: &Path,
        id: Uuid,
    ) -> Result<(), ManagerError> {
        let tables = self.tables.lock().await;
        let binding = Self::binding(&tables)?;

        let delete_id = if *self.mode.lock() == LogManagerMode::InProc {
            Uuid::nil()
        } else {
            id
        };
        match binding.delete_container(path, delete_id).await {
            Ok(()) => {
                info!(container_id = %id, path = %path.display(), "deleted physical log");
                Ok(())
            }
            Err(e) => {
                info!(container_id = %id, path = %path.display(), error = %e,
                    "failed to delete physical log container");
                Err(ManagerError::Container { source: e })
            }
        }
    }

    /// Deletes a logical log and, when it was the container's last stream, deletes the
    /// container too.
    pub(crate) async fn delete_logical_log_and_maybe_delete_physical_log(
        &self,
        handle: &PhysicalLogHandle,
        logical_log_id: Uuid,
        token: &CancellationToken,
    ) -> Result<(), PhysicalLogError> {
        let tables = self.tables.lock().await;

        handle
            .delete_logical_log_only(logical_log_id, token)
            .await?;

        let remaining = handle
            .owner()
            .container()
            .enumerate_streams()
            .await
            .map_err(|source| PhysicalLogError::Container { source })?;

        if remaining.is_empty() {
            let binding = match tables.binding.as_ref() {
                Some(binding) => Arc::clone(binding),
                None => return Err(PhysicalLogError::Closed),
            };
            match binding
                .delete_container(handle.owner().path(), Uuid::nil())
                .await
            {
                Ok(()) => {
                    info!(container_id = %handle.owner_id(), "deleted empty physical log");
                }
                Err(e) if e.is_sharing_violation() => {
                    // The container is still open (by this very handle); deletion is
                    // deferred until its last consumer closes and retries.
                    info!(container_id = %handle.owner_id(),
                        "container still open, deferring physical log deletion");
                }
                Err(e) => return Err(PhysicalLogError::Container { source: e }),
            }
        }

        Ok(())
    }

    pub(crate) async fn on_physical_log_handle_close(
        &self,
        handle: &PhysicalLogHandle,
    ) -> Result<(), ContainerError> {
        let mut last_consumer_closed = false;
        let mut removed_entry = None;
        let result;

        {
            let mut tables = self.tables.lock().await;

            let owner = {
                let entry = tables
                    .logs
                    .get(&handle.owner_id())
                    .expect("physical log missing from log table");
                assert!(Arc::ptr_eq(&entry.log, handle.owner()));
                Arc::clone(&entry.log)
            };

            result = owner.on_close_handle(handle.id()).await;
            match &result {
                Ok(last) => last_consumer_closed = *last,
                Err(e) => {
                    warn!(handle_id = handle.id(), error = %e,
                        "physical log handle close failed");
                }
            }

            if last_consumer_closed {
                removed_entry = tables.logs.remove(&handle.owner_id());
                assert!(removed_entry.is_some());
                self.close_binding_if_empty(&mut tables).await;
            }
        }

        // The physical log's activity is released outside the lock, after which the
        // manager may finish closing.
        drop(removed_entry);
        result.map(|_| ())
    }

    pub(crate) async fn on_logical_log_close(
        &self,
        log: &LogicalLog,
    ) -> Result<(), ContainerError> {
        let mut last_consumer_closed = false;
        let mut removed_entry = None;
        let result;

        {
            let mut tables = self.tables.lock().await;

            let owner = {
                let entry = tables
                    .logs
                    .get(&log.owner_id())
                    .expect("physical log missing from log table");
                Arc::clone(&entry.log)
            };

            result = owner.on_close_logical_log(log).await;
            match &result {
                Ok(last) => last_consumer_closed = *last,
                Err(e) => {
                    warn!(log_id = %log.id(), error = %e, "logical log close failed");
                }
            }

            if last_consumer_closed {
                removed_entry = tables.logs.remove(&log.owner_id());
                assert!(removed_entry.is_some());
                self.close_binding_if_empty(&mut tables).await;
            }
        }

        drop(removed_entry);
        result.map(|_| ())
    }

    /// Closes the manager, waiting for outstanding handles and physical logs.
    pub async fn close(&self, _token: &CancellationToken) -> Result<(), ManagerError> {
        match self.lifecycle.begin_close() {
            BeginClose::NotOpen => Ok(()),
            BeginClose::AlreadyRequested => {
                self.lifecycle.wait_closed().await;
                Ok(())
            }
            BeginClose::Run => {
                self.lifecycle.finish_close();
                Ok(())
            }
            BeginClose::Drain => {
                self.lifecycle.wait_drained().await;
                self.lifecycle.finish_close();
                Ok(())
            }
        }
    }

    /// Fire-and-forget close.
    pub fn abort(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.close(&CancellationToken::new()).await {
                warn!(error = %e, "manager close failed during abort");
            }
        });
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("mode", &*self.mode.lock())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

/// A consumer's handle to the [`LogManager`].
pub struct LogManagerHandle {
    owner: Arc<LogManager>,
    id: i64,
    partition_id: Uuid,
    replica_id: i64,
    work_directory: PathBuf,
    lifecycle: Arc<ServiceLifecycle>,
}

impl LogManagerHandle {
    fn new(
        owner: Arc<LogManager>,
        id: i64,
        partition_id: Uuid,
        replica_id: i64,
        work_directory: PathBuf,
    ) -> Arc<Self> {
        let lifecycle = ServiceLifecycle::new();
        lifecycle.open();
        Arc::new(Self {
            owner,
            id,
            partition_id,
            replica_id,
            work_directory,
            lifecycle,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn mode(&self) -> LogManagerMode {
        self.owner.mode()
    }

    fn acquire_activity(&self) -> Result<ActivityGuard, ManagerError> {
        self.lifecycle
            .try_acquire_activity()
            .ok_or(ManagerError::Closed)
    }

    fn staging_log_path(&self) -> PathBuf {
        staging_log_path(&self.work_directory, self.partition_id, self.replica_id)
    }

    fn check_path_length(&self, path: &Path) -> Result<(), ManagerError> {
        if path.as_os_str().len() > MAX_PATHNAME_LENGTH {
            error!(
                path = %path.display(),
                length = path.as_os_str().len(),
                limit = MAX_PATHNAME_LENGTH,
                "container path exceeds the maximum path length"
            );
            return Err(ManagerError::PathTooLong {
                path: path.to_path_buf(),
                limit: MAX_PATHNAME_LENGTH,
            });
        }
        Ok(())
    }

    fn staging_record_size(&self) -> u32 {
        self.owner
            .shared_log_settings()
            .map(|s| s.maximum_record_size)
            .unwrap_or(DEFAULT_MAXIMUM_RECORD_SIZE)
    }

    /// Creates and opens a physical log at an explicit path and id.
    ///
    /// In-proc requests against the well-known default shared-log id are redirected to
    /// the per-replica staging log.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_and_open_physical_log(
        &self,
        path: &Path,
        id: Uuid,
        log_size: u64,
        maximum_number_streams: u32,
        maximum_record_size: u32,
        flags: LogCreationFlags,
        token: &CancellationToken,
    ) -> Result<Arc<PhysicalLogHandle>, ManagerError> {
        let _activity = self.acquire_activity()?;

        if self.mode() == LogManagerMode::InProc && id == DEFAULT_APPLICATION_SHARED_LOG_ID {
            return self.create_and_open_staging_log(token).await;
        }

        self.check_path_length(path)?;
        self.owner
            .on_create_and_open_physical_log(
                path,
                id,
                log_size,
                maximum_number_streams,
                maximum_record_size,
                flags,
                token,
            )
            .await
    }

    /// Creates and opens the default shared log from the manager's settings.
    pub async fn create_and_open_default_physical_log(
        &self,
        token: &CancellationToken,
    ) -> Result<Arc<PhysicalLogHandle>, ManagerError> {
        let _activity = self.acquire_activity()?;

        let settings = self
            .owner
            .shared_log_settings()
            .ok_or(ManagerError::MissingSharedLogSettings)?
            .clone();

        if self.mode() == LogManagerMode::InProc
            && settings.container_id == DEFAULT_APPLICATION_SHARED_LOG_ID
        {
            return self.create_and_open_staging_log(token).await;
        }

        self.owner
            .on_create_and_open_physical_log(
                &settings.path,
                settings.container_id,
                settings.log_size,
                settings.maximum_number_streams,
                settings.maximum_record_size,
                settings.creation_flags,
                token,
            )
            .await
    }

    async fn create_and_open_staging_log(
        &self,
        token: &CancellationToken,
    ) -> Result<Arc<PhysicalLogHandle>, ManagerError> {
        assert_eq!(self.mode(), LogManagerMode::InProc);

        let path = self.staging_log_path();
        self.check_path_length(&path)?;

        // A fresh id each time: the staging log registry entry is keyed by it, and the
        // container itself is found by path.
        self.owner
            .on_create_and_open_physical_log(
                &path,
                Uuid::new_v4(),
                STAGING_LOG_SIZE,
                STAGING_LOG_STREAMS,
                self.staging_record_size(),
                LogCreationFlags::UseNonSparseFile,
                token,
            )
            .await
    }

    /// Opens an existing physical log at an explicit path and id.
    pub async fn open_physical_log(
        &self,
        path: &Path,
        id: Uuid,
        token: &CancellationToken,
    ) -> Result<Arc<PhysicalLogHandle>, ManagerError> {
        let _activity = self.acquire_activity()?;

        if self.mode() == LogManagerMode::InProc && id == DEFAULT_APPLICATION_SHARED_LOG_ID {
            return self.open_staging_log(token).await;
        }

        self.check_path_length(path)?;
        self.owner.on_open_physical_log(path, id, token).await
    }

    /// Opens the default shared log from the manager's settings.
    pub async fn open_default_physical_log(
        &self,
        token: &CancellationToken,
    ) -> Result<Arc<PhysicalLogHandle>, ManagerError> {
        let _activity = self.acquire_activity()?;

        let settings = self
            .owner
            .shared_log_settings()
            .ok_or(ManagerError::MissingSharedLogSettings)?
            .clone();

        if self.mode() == LogManagerMode::InProc
            && settings.container_id == DEFAULT_APPLICATION_SHARED_LOG_ID
        {
            return self.open_staging_log(token).await;
        }

        self.owner
            .on_open_physical_log(&settings.path, settings.container_id, token)
            .await
    }

    async fn open_staging_log(
        &self,
        token: &CancellationToken,
    ) -> Result<Arc<PhysicalLogHandle>, ManagerError> {
        assert_eq!(self.mode(), LogManagerMode::InProc);

        let path = self.staging_log_path();
        self.check_path_length(&path)?;

        // A random registry id; the underlying open resolves the container by path.
        self.owner
            .on_open_physical_log(&path, Uuid::new_v4(), token)
            .await
    }

    /// Deletes a physical log at an explicit path and id.
    pub async fn delete_physical_log(
        &self,
        path: &Path,
        id: Uuid,
        token: &CancellationToken,
    ) -> Result<(), ManagerError> {
        let _activity = self.acquire_activity()?;

        if self.mode() == LogManagerMode::InProc && id == DEFAULT_APPLICATION_SHARED_LOG_ID {
            return self.delete_staging_log(token).await;
        }

        self.owner.on_delete_physical_log(path, id).await
    }

    /// Deletes the default shared log from the manager's settings.
    pub async fn delete_default_physical_log(
        &self,
        token: &CancellationToken,
    ) -> Result<(), ManagerError> {
        let _activity = self.acquire_activity()?;

        let settings = self
            .owner
            .shared_log_settings()
            .ok_or(ManagerError::MissingSharedLogSettings)?
            .clone();

        if self.mode() == LogManagerMode::InProc
            && settings.container_id == DEFAULT_APPLICATION_SHARED_LOG_ID
        {
            return self.delete_staging_log(token).await;
        }

        self.owner
            .on_delete_physical_log(&settings.path, settings.container_id)
            .await
    }

    async fn delete_staging_log(&self, _token: &CancellationToken) -> Result<(), ManagerError> {
        assert_eq!(self.mode(), LogManagerMode::InProc);

        let path = self.staging_log_path();
        self.check_path_length(&path)?;
        self.owner.on_delete_physical_log(&path, Uuid::nil()).await
    }

    /// Closes this handle.  When it is the last handle and no physical logs remain,
    /// the container binding is closed as well.
    pub async fn close(&self, _token: &CancellationToken) -> Result<(), ManagerError> {
        match self.lifecycle.begin_close() {
            BeginClose::NotOpen => Ok(()),
            BeginClose::AlreadyRequested => {
                self.lifecycle.wait_closed().await;
                Ok(())
            }
            BeginClose::Run => self.close_task().await,
            BeginClose::Drain => {
                self.lifecycle.wait_drained().await;
                self.close_task().await
            }
        }
    }

    /// Fire-and-forget close.
    pub fn abort(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.close(&CancellationToken::new()).await {
                warn!(handle_id = this.id, error = %e, "close failed during abort");
            }
        });
    }

    async fn close_task(&self) -> Result<(), ManagerError> {
        let result = self.owner.on_close_handle(self).await;
        if let Err(e) = &result {
            warn!(handle_id = self.id, error = %e, "manager handle close failed");
        }
        self.lifecycle.finish_close();
        result.map_err(|source| ManagerError::Container { source })
    }
}

impl std::fmt::Debug for LogManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManagerHandle")
            .field("id", &self.id)
            .field("partition_id", &self.partition_id)
            .field("replica_id", &self.replica_id)
            .finish_non_exhaustive()
    }
}
