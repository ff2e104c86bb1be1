//! Queue pair options and controller limits.
//!
//! All values have defaults. Override via environment variables (prefixed
//! `NVMF_RDMA_`) or with the `with_*` setters.

use crate::error::{Error, Result};

use super::capsule::compute_command_capsule_size;
use super::connect::{DYNAMIC_CONTROLLER_ID, QueueId};

/// Default submission queue depth.
pub const DEFAULT_SUBMISSION_QUEUE_SIZE: u16 = 32;

/// Default number of completions drained per poll.
pub const DEFAULT_POLL_BATCH_SIZE: usize = 32;

/// Which kind of queue a queue pair serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// Admin queue (queue id 0). Connects with a dynamic controller id and
    /// carries the keep-alive timeout.
    Admin,
    /// I/O queue with the given non-zero queue id. Connects to the
    /// controller id the admin queue was assigned.
    Io(QueueId),
}

impl QueueRole {
    /// The queue id this role connects.
    pub fn queue_id(self) -> QueueId {
        match self {
            QueueRole::Admin => QueueId::ADMIN,
            QueueRole::Io(id) => id,
        }
    }
}

impl Default for QueueRole {
    fn default() -> Self {
        QueueRole::Io(QueueId::new(1))
    }
}

/// Limits and identity advertised by (or assigned to) the controller.
///
/// Normally filled from Identify Controller data and the admin queue's
/// connect response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerInfo {
    /// Controller id assigned on the admin queue connect
    pub controller_id: u16,
    /// Host NQN sent in the connect data
    pub host_nqn: String,
    /// Host identifier sent in the connect data
    pub host_id: [u8; 16],
    /// Maximum SGL data block descriptors per command (MSDBD, 0 = no limit)
    pub max_sgl_data_block_descriptors: u8,
    /// In-capsule data offset in bytes (ICDOFF)
    pub in_capsule_data_offset: usize,
    /// I/O queue command capsule supported size in bytes (IOCCSZ)
    pub io_command_capsule_size: usize,
}

impl ControllerInfo {
    /// Info for a host that has not connected an admin queue yet.
    pub fn new(host_nqn: impl Into<String>) -> Self {
        Self {
            controller_id: DYNAMIC_CONTROLLER_ID,
            host_nqn: host_nqn.into(),
            ..Default::default()
        }
    }

    /// Set the controller id.
    pub fn with_controller_id(mut self, id: u16) -> Self {
        self.controller_id = id;
        self
    }

    /// Set the host identifier.
    pub fn with_host_id(mut self, host_id: [u8; 16]) -> Self {
        self.host_id = host_id;
        self
    }

    /// Set the maximum SGL data block descriptors.
    pub fn with_max_sgl_data_block_descriptors(mut self, msdbd: u8) -> Self {
        self.max_sgl_data_block_descriptors = msdbd;
        self
    }

    /// Set the in-capsule data offset.
    pub fn with_in_capsule_data_offset(mut self, offset: usize) -> Self {
        self.in_capsule_data_offset = offset;
        self
    }

    /// Set the I/O command capsule supported size.
    pub fn with_io_command_capsule_size(mut self, size: usize) -> Self {
        self.io_command_capsule_size = size;
        self
    }
}

/// Queue pair options.
///
/// Configure queue pair geometry when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePairOpts {
    /// Admin or I/O queue
    pub role: QueueRole,
    /// Submission queue depth; also the number of command identifiers
    pub submission_queue_size: u16,
    /// SGL descriptors carried after the SQE
    pub additional_sgls: usize,
    /// In-capsule data bytes per command
    pub in_capsule_data_size: usize,
    /// Maximum inline send size requested from the transport
    pub max_inline_size: usize,
    /// Keep-alive timeout in ms (admin queue only, 0 = disabled)
    pub keep_alive_timeout_ms: u32,
    /// Completions drained per poll
    pub poll_batch_size: usize,
}

impl Default for QueuePairOpts {
    fn default() -> Self {
        Self {
            role: QueueRole::default(),
            submission_queue_size: DEFAULT_SUBMISSION_QUEUE_SIZE,
            additional_sgls: 0,
            in_capsule_data_size: 0,
            max_inline_size: 0,
            keep_alive_timeout_ms: 0,
            poll_batch_size: DEFAULT_POLL_BATCH_SIZE,
        }
    }
}

impl QueuePairOpts {
    /// Options for the admin queue.
    pub fn admin() -> Self {
        Self::default().with_role(QueueRole::Admin)
    }

    /// Options for I/O queue `queue_id`.
    pub fn io(queue_id: u16) -> Self {
        Self::default().with_role(QueueRole::Io(QueueId::new(queue_id)))
    }

    /// Load options from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `NVMF_RDMA_SQ_SIZE`
    /// - `NVMF_RDMA_ADDITIONAL_SGLS`
    /// - `NVMF_RDMA_IN_CAPSULE_DATA_SIZE`
    /// - `NVMF_RDMA_MAX_INLINE_SIZE`
    /// - `NVMF_RDMA_KEEP_ALIVE_TIMEOUT_MS`
    /// - `NVMF_RDMA_POLL_BATCH_SIZE`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::default();

        if let Some(n) = lookup("NVMF_RDMA_SQ_SIZE").and_then(|v| v.parse().ok()) {
            opts.submission_queue_size = n;
        }
        if let Some(n) = lookup("NVMF_RDMA_ADDITIONAL_SGLS").and_then(|v| v.parse().ok()) {
            opts.additional_sgls = n;
        }
        if let Some(n) = lookup("NVMF_RDMA_IN_CAPSULE_DATA_SIZE").and_then(|v| v.parse().ok()) {
            opts.in_capsule_data_size = n;
        }
        if let Some(n) = lookup("NVMF_RDMA_MAX_INLINE_SIZE").and_then(|v| v.parse().ok()) {
            opts.max_inline_size = n;
        }
        if let Some(n) = lookup("NVMF_RDMA_KEEP_ALIVE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            opts.keep_alive_timeout_ms = n;
        }
        if let Some(n) = lookup("NVMF_RDMA_POLL_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            opts.poll_batch_size = n;
        }

        opts
    }

    /// Set the queue role.
    pub fn with_role(mut self, role: QueueRole) -> Self {
        self.role = role;
        self
    }

    /// Set the submission queue depth.
    pub fn with_submission_queue_size(mut self, size: u16) -> Self {
        self.submission_queue_size = size;
        self
    }

    /// Set the number of additional SGL descriptors.
    pub fn with_additional_sgls(mut self, n: usize) -> Self {
        self.additional_sgls = n;
        self
    }

    /// Set the in-capsule data size.
    pub fn with_in_capsule_data_size(mut self, size: usize) -> Self {
        self.in_capsule_data_size = size;
        self
    }

    /// Set the maximum inline send size.
    pub fn with_max_inline_size(mut self, size: usize) -> Self {
        self.max_inline_size = size;
        self
    }

    /// Set the keep-alive timeout.
    pub fn with_keep_alive_timeout_ms(mut self, ms: u32) -> Self {
        self.keep_alive_timeout_ms = ms;
        self
    }

    /// Set the poll batch size.
    pub fn with_poll_batch_size(mut self, n: usize) -> Self {
        self.poll_batch_size = n;
        self
    }

    /// Check the options against controller limits and compute the
    /// largest command capsule this queue pair will send.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if:
    /// - the submission queue size or poll batch size is zero
    /// - an I/O role names queue 0
    /// - an admin role asks for additional SGLs or in-capsule data
    /// - the additional SGLs plus SGL1 exceed the controller's MSDBD
    /// - the capsule size exceeds the controller's IOCCSZ
    pub fn max_command_capsule_size(&self, ctrl: &ControllerInfo) -> Result<usize> {
        if self.submission_queue_size == 0 {
            return Err(Error::InvalidArgument(
                "submission queue size must be > 0".to_string(),
            ));
        }
        if self.poll_batch_size == 0 {
            return Err(Error::InvalidArgument("poll batch size must be > 0".to_string()));
        }

        match self.role {
            QueueRole::Admin => {
                if self.additional_sgls > 0 || self.in_capsule_data_size > 0 {
                    return Err(Error::InvalidArgument(
                        "admin queue carries no additional SGLs or in-capsule data".to_string(),
                    ));
                }
            }
            QueueRole::Io(id) if id.is_admin() => {
                return Err(Error::InvalidArgument(
                    "I/O queue id must be non-zero".to_string(),
                ));
            }
            QueueRole::Io(_) => {}
        }

        let msdbd = usize::from(ctrl.max_sgl_data_block_descriptors);
        if self.additional_sgls > 0 && msdbd != 0 && self.additional_sgls + 1 > msdbd {
            return Err(Error::InvalidArgument(format!(
                "Controller only supports {} additional SGLs not {}",
                msdbd - 1,
                self.additional_sgls
            )));
        }

        if self.in_capsule_data_size == 0 {
            return Ok(compute_command_capsule_size(self.additional_sgls, 0, 0));
        }

        let size = compute_command_capsule_size(
            self.additional_sgls,
            ctrl.in_capsule_data_offset,
            self.in_capsule_data_size,
        );
        if size > ctrl.io_command_capsule_size {
            return Err(Error::InvalidArgument(format!(
                "Command capsule size {} too large, max supported size is {}",
                size, ctrl.io_command_capsule_size
            )));
        }
        Ok(size)
    }
}
