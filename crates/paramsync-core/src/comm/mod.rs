pub mod async_mode;
pub mod geo;
pub mod receiver;
pub mod sender;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

pub use async_mode::AsyncCommunicator;
pub use geo::{GeoCommunicator, SparseIdsMap};

use crate::config::CommConfig;
use crate::error::ParamsyncError;
use crate::rpc::client::RpcClient;
use crate::rpc::{RpcCtxMap, VarInfo};
use crate::tensor::Scope;

// ---------------------------------------------------------------------------
// CommStatus
// ---------------------------------------------------------------------------

/// Lifecycle state shared by both communicator modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommStatus {
    /// Constructed but not yet started.
    #[default]
    Created,
    /// Dispatchers are live.
    Running,
    /// Shutdown has begun; dispatchers are draining.
    Stopping,
    /// Fully shut down. A stopped communicator cannot be restarted.
    Stopped,
}

impl std::fmt::Display for CommStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommStatus::Created => "created",
            CommStatus::Running => "running",
            CommStatus::Stopping => "stopping",
            CommStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Communicator
// ---------------------------------------------------------------------------

/// A mode-erased handle over the two communicator strategies.
///
/// Embedders that can thread a handle through their call graph should hold
/// one of these (or the concrete type) directly; `init_async`/`init_geo`
/// additionally register the first-created handle process-wide for hosts
/// that need singleton lookup.
pub enum Communicator {
    Async(AsyncCommunicator),
    Geo(GeoCommunicator),
}

impl Communicator {
    pub fn start(&self) -> Result<(), ParamsyncError> {
        match self {
            Communicator::Async(c) => c.start(),
            Communicator::Geo(c) => c.start(),
        }
    }

    pub async fn stop(&self) {
        match self {
            Communicator::Async(c) => c.stop().await,
            Communicator::Geo(c) => c.stop().await,
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Communicator::Async(c) => c.is_running(),
            Communicator::Geo(c) => c.is_running(),
        }
    }

    pub fn status(&self) -> CommStatus {
        match self {
            Communicator::Async(c) => c.status(),
            Communicator::Geo(c) => c.status(),
        }
    }

    /// Async-mode gradient send. Rejected in GEO mode.
    pub async fn send(&self, var_name: &str, scope: &Scope) -> Result<(), ParamsyncError> {
        match self {
            Communicator::Async(c) => c.send(var_name, scope).await,
            Communicator::Geo(_) => Err(ParamsyncError::Invariant(
                "send is not available in geo mode; use geo_send".to_string(),
            )),
        }
    }

    /// GEO-mode step recording. Rejected in async mode.
    pub async fn geo_send(
        &self,
        sparse_names: &[String],
        sparse_tables: &[String],
        scope: &Scope,
    ) -> Result<(), ParamsyncError> {
        match self {
            Communicator::Geo(c) => c.geo_send(sparse_names, sparse_tables, scope).await,
            Communicator::Async(_) => Err(ParamsyncError::Invariant(
                "geo_send is not available in async mode; use send".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide handle
// ---------------------------------------------------------------------------

static INSTANCE: OnceLock<Arc<Communicator>> = OnceLock::new();

/// Create the process-wide async-mode communicator.
///
/// The first successful call wins; every later call, of either variant,
/// returns the existing handle with its arguments ignored. Concurrent
/// first calls race to create and exactly one construction is kept.
pub fn init_async(
    client: Arc<dyn RpcClient>,
    recv_scope: Arc<Scope>,
    send_ctxs: RpcCtxMap,
    recv_ctxs: RpcCtxMap,
    config: CommConfig,
) -> Result<Arc<Communicator>, ParamsyncError> {
    if let Some(existing) = INSTANCE.get() {
        return Ok(Arc::clone(existing));
    }
    let comm = Arc::new(Communicator::Async(AsyncCommunicator::new(
        client, recv_scope, send_ctxs, recv_ctxs, config,
    )?));
    Ok(Arc::clone(INSTANCE.get_or_init(|| comm)))
}

/// Create the process-wide GEO-mode communicator. Same once-only rules as
/// [`init_async`]; `trainers` and `geo_need_push_nums` override the
/// corresponding config fields.
pub fn init_geo(
    client: Arc<dyn RpcClient>,
    training_scope: Arc<Scope>,
    vars_info: HashMap<String, VarInfo>,
    trainers: usize,
    geo_need_push_nums: usize,
    config: CommConfig,
) -> Result<Arc<Communicator>, ParamsyncError> {
    if let Some(existing) = INSTANCE.get() {
        return Ok(Arc::clone(existing));
    }
    let config = CommConfig {
        trainer_nums: trainers,
        geo_need_push_nums,
        ..config
    };
    let comm = Arc::new(Communicator::Geo(GeoCommunicator::new(
        client,
        training_scope,
        vars_info,
        config,
    )?));
    Ok(Arc::clone(INSTANCE.get_or_init(|| comm)))
}

/// The process-wide handle, if one has been initialized.
pub fn instance() -> Option<Arc<Communicator>> {
    INSTANCE.get().map(Arc::clone)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
