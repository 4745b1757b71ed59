use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Weak,
    },
};

use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    common::LogCreationFlags,
    container::{ContainerError, LogContainer, LogStream},
    lifecycle::{ActivityGuard, BeginClose, ServiceLifecycle},
    logical_log::{LogicalLog, LogicalLogError, OpenReason},
    manager::LogManager,
};

/// How many times a stream open is retried when the container reports a transient
/// sharing violation.
const STREAM_OPEN_RETRY_LIMIT: u32 = 3;

/// Error that occurred during calls to [`PhysicalLog`] or [`PhysicalLogHandle`].
#[derive(Debug, Snafu)]
pub enum PhysicalLogError {
    /// The physical log or handle has been closed; the operation was not started.
    #[snafu(display("physical log is closed"))]
    Closed,

    /// Cooperative cancellation was observed at a suspension point.
    #[snafu(display("operation was cancelled"))]
    Cancelled,

    /// A live logical log with this id already exists in the container.
    #[snafu(display("logical log {} already exists", id))]
    Collision { id: Uuid },

    /// The underlying container failed the operation.
    #[snafu(display("container error: {}", source))]
    Container { source: ContainerError },

    /// The child logical log failed to open.
    #[snafu(display("logical log open failed: {}", source))]
    LogicalLog { source: LogicalLogError },
}

impl PhysicalLogError {
    pub fn is_collision(&self) -> bool {
        matches!(self, PhysicalLogError::Collision { .. })
    }
}

struct HandleEntry {
    #[allow(dead_code)]
    handle: Weak<PhysicalLogHandle>,
    /// Wrapper activity representing this handle; released when the entry is removed.
    _activity: ActivityGuard,
}

pub(crate) struct LogicalLogEntry {
    log: Weak<LogicalLog>,
    stream: Arc<dyn LogStream>,
    /// Wrapper activity representing this logical log; released when the entry is
    /// removed.
    _activity: ActivityGuard,
}

#[derive(Default)]
struct Tables {
    handles: HashMap<i64, HandleEntry>,
    logical_logs: HashMap<Uuid, LogicalLogEntry>,
}

/// Wrapper around one open physical log container.
///
/// Tracks the container's live logical logs (strong stream references, weak log
/// references) and outstanding handles (weak).  The underlying container is closed
/// exactly once, when the last of either kind goes away.
pub struct PhysicalLog {
    manager: Arc<LogManager>,
    id: Uuid,
    path: PathBuf,
    container: Arc<dyn LogContainer>,
    next_handle_id: AtomicI64,
    tables: tokio::sync::Mutex<Tables>,
    lifecycle: Arc<ServiceLifecycle>,
}

impl PhysicalLog {
    pub(crate) fn new(
        manager: Arc<LogManager>,
        id: Uuid,
        path: PathBuf,
        container: Arc<dyn LogContainer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            id,
            path,
            container,
            next_handle_id: AtomicI64::new(0),
            tables: tokio::sync::Mutex::new(Tables::default()),
            lifecycle: ServiceLifecycle::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn path(&self) -> &PathBuf {
        &self.path
    }

    pub(crate) fn container(&self) -> &Arc<dyn LogContainer> {
        &self.container
    }

    pub(crate) fn open(&self) {
        self.lifecycle.open();
    }

    #[cfg(test)]
    pub(crate) async fn handle_count(&self) -> usize {
        self.tables.lock().await.handles.len()
    }

    #[cfg(test)]
    pub(crate) async fn logical_log_count(&self) -> usize {
        self.tables.lock().await.logical_logs.len()
    }

    /// Allocates a new handle to this physical log.
    pub(crate) async fn get_handle(
        self: &Arc<Self>,
        _token: &CancellationToken,
    ) -> Result<Arc<PhysicalLogHandle>, PhysicalLogError> {
        // Activity representing the handle; released when the handle reports closure
        // in `on_close_handle`.
        let activity = self
            .lifecycle
            .try_acquire_activity()
            .ok_or(PhysicalLogError::Closed)?;

        let mut tables = self.tables.lock().await;

        let id = self.next_handle_id.fetch_add(1, Ordering::AcqRel);
        let handle = PhysicalLogHandle::new(Arc::clone(&self.manager), Arc::clone(self), id);
        tables.handles.insert(
            id,
            HandleEntry {
                handle: Arc::downgrade(&handle),
                _activity: activity,
            },
        );

        Ok(handle)
    }

    /// Closes the container and the wrapper itself once both tables are empty.
    async fn close_if_empty(&self, tables: &Tables) -> Result<bool, ContainerError> {
        if !tables.handles.is_empty() || !tables.logical_logs.is_empty() {
            return Ok(false);
        }

        let close_result = self.container.close().await;
        if let Err(e) = &close_result {
            warn!(
                container_id = %self.id,
                error = %e,
                "failed to close underlying container when last consumer closed"
            );
        }

        match self.lifecycle.begin_close() {
            BeginClose::Run => self.lifecycle.finish_close(),
            BeginClose::Drain => {
                // A late consumer may still hold an activity while waiting for the
                // table lock this caller holds; finish the close off to the side.
                let lifecycle = Arc::clone(&self.lifecycle);
                tokio::spawn(async move {
                    lifecycle.wait_drained().await;
                    lifecycle.finish_close();
                });
            }
            BeginClose::AlreadyRequested | BeginClose::NotOpen => {}
        }

        close_result.map(|_| true)
    }

    /// Removes a closing handle; returns whether it was the last consumer.
    pub(crate) async fn on_close_handle(
        &self,
        handle_id: i64,
    ) -> Result<bool, ContainerError> {
        let mut tables = self.tables.lock().await;

        let entry = tables.handles.remove(&handle_id);
        assert!(entry.is_some(), "handle {} missing from handle table", handle_id);
        drop(entry);

        self.close_if_empty(&tables).await
    }

    /// Closes a logical log's underlying stream and removes it; returns whether it was
    /// the last consumer.
    pub(crate) async fn on_close_logical_log(
        &self,
        log: &LogicalLog,
    ) -> Result<bool, ContainerError> {
        let mut tables = self.tables.lock().await;

        let entry = tables
            .logical_logs
            .get(&log.id())
            .expect("logical log missing from log table");

        if let Err(e) = entry.stream.close().await {
            if e.is_not_found() {
                // A delete may have raced ahead of the close.
                warn!(
                    container_id = %self.id,
                    log_id = %log.id(),
                    error = %e,
                    "underlying stream already gone at close"
                );
            } else {
                error!(
                    container_id = %self.id,
                    log_id = %log.id(),
                    error = %e,
                    "failed to close underlying stream"
                );
                return Err(e);
            }
        }

        tables.logical_logs.remove(&log.id());

        self.close_if_empty(&tables).await
    }

    /// Creates a stream in the container and opens a logical log over it.
    pub(crate) async fn on_create_and_open_logical_log(
        self: &Arc<Self>,
        owning_handle_id: i64,
        id: Uuid,
        alias: Option<&str>,
        path: Option<&std::path::Path>,
        maximum_size: i64,
        maximum_block_size: u32,
        flags: LogCreationFlags,
        token: &CancellationToken,
    ) -> Result<Arc<LogicalLog>, PhysicalLogError> {
        // Activity representing the logical log; released when it reports closure in
        // `on_close_logical_log`.
        let activity = self
            .lifecycle
            .try_acquire_activity()
            .ok_or(PhysicalLogError::Closed)?;

        let mut tables = self.tables.lock().await;

        if let Some(entry) = tables.logical_logs.get(&id) {
            if entry.log.upgrade().is_some() {
                info!(
                    container_id = %self.id,
                    log_id = %id,
                    "rejecting create of logical log, a live log with this id exists"
                );
                return Err(PhysicalLogError::Collision { id });
            }
            // The previous consumer is gone but never closed; its entry is stale.
            tables.logical_logs.remove(&id);
        }

        let stream = self
            .container
            .create_stream(id, alias, path, maximum_size, maximum_block_size, flags)
            .await
            .context(ContainerSnafu)?;

        let log = LogicalLog::new(
            Arc::clone(&self.manager),
            self.id,
            owning_handle_id,
            id,
            Arc::clone(&stream),
        );

        if let Err(open_error) = log.open(OpenReason::Create, token).await {
            error!(
                container_id = %self.id,
                log_id = %id,
                error = %open_error,
                "failed to open newly created logical log"
            );

            // Roll back: close what was opened, delete the stream just created.
            if let Err(e) = stream.close().await {
                warn!(container_id = %self.id, log_id = %id, error = %e,
                    "failed to close stream while compensating for create failure");
            }
            if let Err(e) = self.container.delete_stream(id).await {
                warn!(container_id = %self.id, log_id = %id, error = %e,
                    "failed to delete stream while compensating for create failure");
            }
            return Err(PhysicalLogError::LogicalLog { source: open_error });
        }

        tables.logical_logs.insert(
            id,
            LogicalLogEntry {
                log: Arc::downgrade(&log),
                stream,
                _activity: activity,
            },
        );

        info!(container_id = %self.id, log_id = %id, "created logical log");
        Ok(log)
    }

    /// Opens an existing stream in the container and recovers a logical log over it.
    pub(crate) async fn on_open_logical_log(
        self: &Arc<Self>,
        owning_handle_id: i64,
        id: Uuid,
        token: &CancellationToken,
    ) -> Result<Arc<LogicalLog>, PhysicalLogError> {
        let activity = self
            .lifecycle
            .try_acquire_activity()
            .ok_or(PhysicalLogError::Closed)?;

        let mut tables = self.tables.lock().await;

        if let Some(entry) = tables.logical_logs.get(&id) {
            if entry.log.upgrade().is_some() {
                info!(
                    container_id = %self.id,
                    log_id = %id,
                    "rejecting open of logical log, a live log with this id exists"
                );
                return Err(PhysicalLogError::Collision { id });
            }
            tables.logical_logs.remove(&id);
        }

        // Retry transient sharing violations: a concurrent close may still be letting
        // go of the stream.
        let mut attempts = 0;
        let stream = loop {
            match self.container.open_stream(id).await {
                Ok(stream) => break stream,
                Err(e) if e.is_sharing_violation() => {
                    attempts += 1;
                    if attempts == STREAM_OPEN_RETRY_LIMIT {
                        warn!(
                            container_id = %self.id,
                            log_id = %id,
                            error = %e,
                            "exhausted retries opening log stream"
                        );
                        return Err(PhysicalLogError::Container { source: e });
                    }
                }
                Err(e) => {
                    warn!(
                        container_id = %self.id,
                        log_id = %id,
                        error = %e,
                        "failed to open log stream"
                    );
                    return Err(PhysicalLogError::Container { source: e });
                }
            }
        };

        let log = LogicalLog::new(
            Arc::clone(&self.manager),
            self.id,
            owning_handle_id,
            id,
            Arc::clone(&stream),
        );

        if let Err(open_error) = log.open(OpenReason::Recover, token).await {
            warn!(
                container_id = %self.id,
                log_id = %id,
                error = %open_error,
                "failed to recover logical log"
            );
            if let Err(e) = stream.close().await {
                warn!(container_id = %self.id, log_id = %id, error = %e,
                    "failed to close stream while compensating for open failure");
            }
            return Err(PhysicalLogError::LogicalLog { source: open_error });
        }

        tables.logical_logs.insert(
            id,
            LogicalLogEntry {
                log: Arc::downgrade(&log),
                stream,
                _activity: activity,
            },
        );

        info!(container_id = %self.id, log_id = %id, "opened logical log");
        Ok(log)
    }

    pub(crate) async fn delete_logical_log_only(&self, id: Uuid) -> Result<(), PhysicalLogError> {
        self.container
            .delete_stream(id)
            .await
            .context(ContainerSnafu)
    }

    /// Swaps a new stream in under the primary alias while preserving the previous one
    /// under the backup alias.
    ///
    /// On completion: the backup alias names the previous primary, the primary alias
    /// names the stream previously under the source alias, and the stream the backup
    /// alias used to name is deleted.
    pub(crate) async fn on_replace_alias_logs(
        &self,
        source_alias: &str,
        primary_alias: &str,
        backup_alias: &str,
    ) -> Result<(), PhysicalLogError> {
        let _tables = self.tables.lock().await;

        let primary_id = self
            .container
            .resolve_alias(primary_alias)
            .await
            .context(ContainerSnafu)?;
        let source_id = self
            .container
            .resolve_alias(source_alias)
            .await
            .context(ContainerSnafu)?;

        info!(
            container_id = %self.id,
            source_alias,
            %source_id,
            primary_alias,
            %primary_id,
            backup_alias,
            "replacing alias logs"
        );

        let old_backup_id = match self.container.resolve_alias(backup_alias).await {
            Ok(id) => Some(id),
            // The backup alias may legitimately not exist yet.
            Err(e) if e.is_not_found() => {
                info!(container_id = %self.id, backup_alias, "backup alias not found");
                None
            }
            Err(e) => return Err(PhysicalLogError::Container { source: e }),
        };

        if old_backup_id != Some(primary_id) {
            if let Some(old_backup_id) = old_backup_id {
                match self.container.delete_stream(old_backup_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        info!(
                            container_id = %self.id,
                            backup_alias,
                            stream_id = %old_backup_id,
                            "backup stream already gone"
                        );
                    }
                    Err(e) => return Err(PhysicalLogError::Container { source: e }),
                }
            }
        }

        self.container
            .assign_alias(backup_alias, primary_id)
            .await
            .context(ContainerSnafu)?;
        self.container
            .assign_alias(primary_alias, source_id)
            .await
            .context(ContainerSnafu)?;

        Ok(())
    }

    /// Recovers the alias rotation after a crash: resolves the primary alias, and if it
    /// is missing promotes the backup alias back to primary.
    pub(crate) async fn on_recover_alias_logs(
        &self,
        _source_alias: &str,
        primary_alias: &str,
        backup_alias: &str,
    ) -> Result<Uuid, PhysicalLogError> {
        match self.container.resolve_alias(primary_alias).await {
            Ok(id) => Ok(id),
            Err(e) if e.is_not_found() => {
                // The rotation failed between retiring the old primary and assigning
                // the new one; fall back to the backup.
                let backup_id = self
                    .container
                    .resolve_alias(backup_alias)
                    .await
                    .context(ContainerSnafu)?;
                self.container
                    .assign_alias(primary_alias, backup_id)
                    .await
                    .context(ContainerSnafu)?;
                Ok(backup_id)
            }
            Err(e) => Err(PhysicalLogError::Container { source: e }),
        }
    }
}

impl std::fmt::Debug for PhysicalLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalLog")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

/// A consumer's handle to a [`PhysicalLog`].
///
/// Handles are shared by consumers; the wrapper holds only a weak reference, so the
/// last consumer drop (via `close`) drives teardown deterministically.
pub struct PhysicalLogHandle {
    manager: Arc<LogManager>,
    owner: Arc<PhysicalLog>,
    id: i64,
    lifecycle: Arc<ServiceLifecycle>,
}

impl PhysicalLogHandle {
    fn new(manager: Arc<LogManager>, owner: Arc<PhysicalLog>, id: i64) -> Arc<Self> {
        let lifecycle = ServiceLifecycle::new();
        lifecycle.open();
        Arc::new(Self {
            manager,
            owner,
            id,
            lifecycle,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner.id()
    }

    pub(crate) fn owner(&self) -> &Arc<PhysicalLog> {
        &self.owner
    }

    /// Whether the handle is open and the underlying container can service operations.
    pub fn is_functional(&self) -> bool {
        match self.lifecycle.try_acquire_activity() {
            Some(_activity) => self.owner.container.is_functional(),
            None => false,
        }
    }

    fn acquire_activity(&self) -> Result<ActivityGuard, PhysicalLogError> {
        self.lifecycle
            .try_acquire_activity()
            .ok_or(PhysicalLogError::Closed)
    }

    /// Creates a new logical log in the container and opens it.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_and_open_logical_log(
        &self,
        logical_log_id: Uuid,
        alias: Option<&str>,
        path: Option<&std::path::Path>,
        maximum_size: i64,
        maximum_block_size: u32,
        flags: LogCreationFlags,
        token: &CancellationToken,
    ) -> Result<Arc<LogicalLog>, PhysicalLogError> {
        let _activity = self.acquire_activity()?;
        self.owner
            .on_create_and_open_logical_log(
                self.id,
                logical_log_id,
                alias,
                path,
                maximum_size,
                maximum_block_size,
                flags,
                token,
            )
            .await
    }

    /// Opens an existing logical log in recovery mode.
    pub async fn open_logical_log(
        &self,
        logical_log_id: Uuid,
        token: &CancellationToken,
    ) -> Result<Arc<LogicalLog>, PhysicalLogError> {
        let _activity = self.acquire_activity()?;
        self.owner
            .on_open_logical_log(self.id, logical_log_id, token)
            .await
    }

    /// Deletes a logical log; when it was the container's last stream, the container
    /// itself is deleted as well.
    pub async fn delete_logical_log(
        &self,
        logical_log_id: Uuid,
        token: &CancellationToken,
    ) -> Result<(), PhysicalLogError> {
        let _activity = self.acquire_activity()?;
        self.manager
            .delete_logical_log_and_maybe_delete_physical_log(self, logical_log_id, token)
            .await
    }

    /// Deletes a logical log's stream without considering the container.
    pub async fn delete_logical_log_only(
        &self,
        logical_log_id: Uuid,
        _token: &CancellationToken,
    ) -> Result<(), PhysicalLogError> {
        let _activity = self.acquire_activity()?;
        self.owner.delete_logical_log_only(logical_log_id).await
    }

    pub async fn assign_alias(
        &self,
        logical_log_id: Uuid,
        alias: &str,
        _token: &CancellationToken,
    ) -> Result<(), PhysicalLogError> {
        let _activity = self.acquire_activity()?;
        self.owner
            .container
            .assign_alias(alias, logical_log_id)
            .await
            .context(ContainerSnafu)
    }

    pub async fn resolve_alias(
        &self,
        alias: &str,
        _token: &CancellationToken,
    ) -> Result<Uuid, PhysicalLogError> {
        let _activity = self.acquire_activity()?;
        self.owner
            .container
            .resolve_alias(alias)
            .await
            .context(ContainerSnafu)
    }

    pub async fn remove_alias(
        &self,
        alias: &str,
        _token: &CancellationToken,
    ) -> Result<(), PhysicalLogError> {
        let _activity = self.acquire_activity()?;
        self.owner
            .container
            .remove_alias(alias)
            .await
            .context(ContainerSnafu)
    }

    /// 3-way alias rotation; see [`PhysicalLog::on_replace_alias_logs`].
    pub async fn replace_alias_logs(
        &self,
        source_alias: &str,
        primary_alias: &str,
        backup_alias: &str,
        _token: &CancellationToken,
    ) -> Result<(), PhysicalLogError> {
        let _activity = self.acquire_activity()?;
        self.owner
            .on_replace_alias_logs(source_alias, primary_alias, backup_alias)
            .await
    }

    /// Recovers from a crash mid-rotation; see [`PhysicalLog::on_recover_alias_logs`].
    pub async fn recover_alias_logs(
        &self,
        source_alias: &str,
        primary_alias: &str,
        backup_alias: &str,
        _token: &CancellationToken,
    ) -> Result<Uuid, PhysicalLogError> {
        let _activity = self.acquire_activity()?;
        self.owner
            .on_recover_alias_logs(source_alias, primary_alias, backup_alias)
            .await
    }

    /// Closes this handle; the last close of a physical log's consumers closes the
    /// container.
    pub async fn close(&self, _token: &CancellationToken) -> Result<(), PhysicalLogError> {
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

    async fn close_task(&self) -> Result<(), PhysicalLogError> {
        let result = self.manager.on_physical_log_handle_close(self).await;
        if let Err(e) = &result {
            warn!(handle_id = self.id, error = %e, "parent close propagation failed");
        }
        self.lifecycle.finish_close();
        result.map_err(|source| PhysicalLogError::Container { source })
    }
}

impl std::fmt::Debug for PhysicalLogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalLogHandle")
            .field("id", &self.id)
            .field("owner_id", &self.owner.id())
            .finish_non_exhaustive()
    }
}
