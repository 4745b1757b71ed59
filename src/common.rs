use std::path::{Path, PathBuf};

use snafu::Snafu;
use uuid::Uuid;

/// Default cap on a single multi-record read, used when the container does not report
/// one of its own.
pub const DEFAULT_MAXIMUM_READ_RECORD_SIZE: u32 = 1024 * 1024;

/// Default maximum size of a single sealed record, applied when shared-log settings are
/// built without one.
pub const DEFAULT_MAXIMUM_RECORD_SIZE: u32 = 16 * 1024 * 1024;

/// Default capacity of a shared-log container.
pub const DEFAULT_SHARED_LOG_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Default number of streams a shared-log container will host.
pub const DEFAULT_MAXIMUM_NUMBER_STREAMS: u32 = 3 * 512;

// The staging log is deliberately small: it stands in for the shared system log on a
// single replica, not for the replica's full data set.
pub(crate) const STAGING_LOG_SIZE: u64 = 256 * 1024 * 1024;
pub(crate) const STAGING_LOG_STREAMS: u32 = 256;
pub(crate) const STAGING_LOG_EXTENSION: &str = "stlog";

/// Longest container path accepted, leaving room for a trailing null on platforms whose
/// drivers require one.
pub(crate) const MAX_PATHNAME_LENGTH: usize = 259;

/// Requests against this well-known container id are redirected to the per-replica
/// staging log when the manager is running in-process.
pub const DEFAULT_APPLICATION_SHARED_LOG_ID: Uuid =
    Uuid::from_u128(0x3ca2_ccda_dd0f_49c8_a741_62aa_c0d4_eb62);

/// Which container binding the manager uses.
///
/// `Default` resolves per platform: out-of-proc where a log driver can exist, in-proc
/// everywhere else.  An out-of-proc open that reports the driver missing transparently
/// downgrades the manager to in-proc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogManagerMode {
    Default,
    InProc,
    OutOfProc,
}

impl LogManagerMode {
    pub(crate) fn resolve(self) -> LogManagerMode {
        match self {
            LogManagerMode::Default => {
                if cfg!(windows) {
                    LogManagerMode::OutOfProc
                } else {
                    LogManagerMode::InProc
                }
            }
            other => other,
        }
    }
}

/// Allocation policy for newly created containers and streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogCreationFlags {
    UseNonSparseFile = 0,
    UseSparseFile = 1,
}

impl Default for LogCreationFlags {
    fn default() -> Self {
        LogCreationFlags::UseNonSparseFile
    }
}

/// Origin for read-cursor seeks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Begin,
    Current,
    End,
}

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Settings for the default shared-log container used by the no-argument create/open/
/// delete calls on a manager handle.
#[derive(Debug, Clone)]
pub struct SharedLogSettings {
    pub(crate) path: PathBuf,
    pub(crate) container_id: Uuid,
    pub(crate) log_size: u64,
    pub(crate) maximum_number_streams: u32,
    pub(crate) maximum_record_size: u32,
    pub(crate) creation_flags: LogCreationFlags,
}

impl SharedLogSettings {
    pub fn builder<P: AsRef<Path>>(path: P, container_id: Uuid) -> SharedLogSettingsBuilder {
        SharedLogSettingsBuilder {
            path: path.as_ref().to_path_buf(),
            container_id,
            log_size: None,
            maximum_number_streams: None,
            maximum_record_size: None,
            creation_flags: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn container_id(&self) -> Uuid {
        self.container_id
    }
}

/// Builder for [`SharedLogSettings`].
#[derive(Debug, Clone)]
pub struct SharedLogSettingsBuilder {
    path: PathBuf,
    container_id: Uuid,
    log_size: Option<u64>,
    maximum_number_streams: Option<u32>,
    maximum_record_size: Option<u32>,
    creation_flags: Option<LogCreationFlags>,
}

impl SharedLogSettingsBuilder {
    /// Sets the total capacity, in bytes, of the shared-log container.
    ///
    /// Defaults to 8GB.
    pub fn log_size(mut self, amount: u64) -> Self {
        self.log_size = Some(amount);
        self
    }

    /// Sets the maximum number of streams the container will host.
    ///
    /// Defaults to 1536.
    pub fn maximum_number_streams(mut self, count: u32) -> Self {
        self.maximum_number_streams = Some(count);
        self
    }

    /// Sets the maximum size, in bytes, of a single sealed record.
    ///
    /// Defaults to 16MB.
    pub fn maximum_record_size(mut self, amount: u32) -> Self {
        self.maximum_record_size = Some(amount);
        self
    }

    /// Sets the allocation policy for the container file.
    ///
    /// Defaults to non-sparse.
    pub fn creation_flags(mut self, flags: LogCreationFlags) -> Self {
        self.creation_flags = Some(flags);
        self
    }

    /// Consumes this builder and constructs a `SharedLogSettings`.
    pub fn build(self) -> Result<SharedLogSettings, BuildError> {
        let log_size = self.log_size.unwrap_or(DEFAULT_SHARED_LOG_SIZE);
        let maximum_number_streams = self
            .maximum_number_streams
            .unwrap_or(DEFAULT_MAXIMUM_NUMBER_STREAMS);
        let maximum_record_size = self
            .maximum_record_size
            .unwrap_or(DEFAULT_MAXIMUM_RECORD_SIZE);
        let creation_flags = self.creation_flags.unwrap_or_default();

        if self.path.as_os_str().is_empty() {
            return Err(BuildError::InvalidParameter {
                param_name: "path",
                reason: "cannot be empty".to_string(),
            });
        }

        if self.path.as_os_str().len() > MAX_PATHNAME_LENGTH {
            return Err(BuildError::InvalidParameter {
                param_name: "path",
                reason: format!("cannot exceed {} characters", MAX_PATHNAME_LENGTH),
            });
        }

        if log_size == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "log_size",
                reason: "cannot be zero".to_string(),
            });
        }

        if maximum_number_streams == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "maximum_number_streams",
                reason: "cannot be zero".to_string(),
            });
        }

        if maximum_record_size as u64 > log_size {
            return Err(BuildError::InvalidParameter {
                param_name: "maximum_record_size",
                reason: format!("must not exceed the log size of {} bytes", log_size),
            });
        }

        Ok(SharedLogSettings {
            path: self.path,
            container_id: self.container_id,
            log_size,
            maximum_number_streams,
            maximum_record_size,
            creation_flags,
        })
    }
}

/// Derives the per-replica staging log path:
/// `<work_dir>/<partition_id>_<replica_id>.stlog`.
pub(crate) fn staging_log_path(
    work_directory: &Path,
    partition_id: Uuid,
    replica_id: i64,
) -> PathBuf {
    work_directory.join(format!(
        "{}_{}.{}",
        partition_id.as_hyphenated(),
        replica_id,
        STAGING_LOG_EXTENSION
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let settings = SharedLogSettings::builder("/tmp/shared.log", Uuid::nil())
            .build()
            .expect("defaults should validate");
        assert_eq!(settings.log_size, DEFAULT_SHARED_LOG_SIZE);
        assert_eq!(settings.maximum_number_streams, DEFAULT_MAXIMUM_NUMBER_STREAMS);
        assert_eq!(settings.maximum_record_size, DEFAULT_MAXIMUM_RECORD_SIZE);
    }

    #[test]
    fn builder_rejects_zero_sizes() {
        let result = SharedLogSettings::builder("/tmp/shared.log", Uuid::nil())
            .log_size(0)
            .build();
        assert!(matches!(result, Err(BuildError::InvalidParameter { param_name, .. }) if param_name == "log_size"));
    }

    #[test]
    fn staging_path_uses_partition_and_replica() {
        let partition = Uuid::from_u128(1);
        let path = staging_log_path(Path::new("/work"), partition, 42);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_42.stlog"));
        assert!(name.starts_with("00000000-"));
    }
}
