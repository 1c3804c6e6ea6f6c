use serde::{Deserialize, Serialize};

use crate::error::ParamsyncError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_send_queue_capacity() -> usize {
    20
}

fn default_geo_need_push_nums() -> usize {
    100
}

fn default_trainer_nums() -> usize {
    1
}

// ---------------------------------------------------------------------------
// CommConfig
// ---------------------------------------------------------------------------

/// Tunables for both communicator modes.
///
/// Hosts typically deserialize this from a JSON fragment of their own
/// configuration; every field has a default so an empty object `{}` is a
/// valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CommConfig {
    /// Capacity of each per-variable send queue. Producers block when full.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Concurrent send workers. Defaults to `max(1, |send map|)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_pool_size: Option<usize>,

    /// Concurrent recv workers. Defaults to `max(1, |recv map|)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_pool_size: Option<usize>,

    /// GEO mode: local steps accumulated before a push/pull round.
    #[serde(default = "default_geo_need_push_nums")]
    pub geo_need_push_nums: usize,

    /// GEO mode: total trainer count; deltas are divided by this before
    /// being shipped.
    #[serde(default = "default_trainer_nums")]
    pub trainer_nums: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue_capacity(),
            send_pool_size: None,
            recv_pool_size: None,
            geo_need_push_nums: default_geo_need_push_nums(),
            trainer_nums: default_trainer_nums(),
        }
    }
}

impl CommConfig {
    /// Reject configurations the communicator cannot run with.
    pub fn validate(&self) -> Result<(), ParamsyncError> {
        if self.send_queue_capacity == 0 {
            return Err(ParamsyncError::Config(
                "send_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.geo_need_push_nums == 0 {
            return Err(ParamsyncError::Config(
                "geo_need_push_nums must be greater than 0".to_string(),
            ));
        }
        if self.trainer_nums == 0 {
            return Err(ParamsyncError::Config(
                "trainer_nums must be greater than 0".to_string(),
            ));
        }
        if self.send_pool_size == Some(0) || self.recv_pool_size == Some(0) {
            return Err(ParamsyncError::Config(
                "thread pool sizes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective send pool width for `tracked` send-tracked variables.
    pub fn send_pool_size_for(&self, tracked: usize) -> usize {
        self.send_pool_size.unwrap_or_else(|| tracked.max(1))
    }

    /// Effective recv pool width for `tracked` recv-tracked variables.
    pub fn recv_pool_size_for(&self, tracked: usize) -> usize {
        self.recv_pool_size.unwrap_or_else(|| tracked.max(1))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
