use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::comm::receiver::recv_param;
use crate::comm::sender::send_var;
use crate::comm::CommStatus;
use crate::config::CommConfig;
use crate::error::ParamsyncError;
use crate::queue::SendQueue;
use crate::rpc::client::RpcClient;
use crate::rpc::{var_to_delta_var, RpcCtxMap, VarInfo};
use crate::tensor::{DenseTensor, Scope, SparseRows, Variable};

/// Variable name -> set of touched row indices, recorded per local step.
pub type SparseIdsMap = HashMap<String, HashSet<i64>>;

// ---------------------------------------------------------------------------
// GeoCommunicator
// ---------------------------------------------------------------------------

/// The delta-synchronization mode.
///
/// Instead of shipping a gradient per step, the compute loop calls
/// `geo_send` after each local optimizer step; the call records which
/// sparse rows were touched and counts steps. Every `geo_need_push_nums`
/// steps the recorded id-maps move into a bounded queue, and a background
/// round computes per-variable parameter deltas against the baseline
/// captured at the last pull, ships them, pulls the authoritative values
/// back and realigns both the training parameters and the baseline.
pub struct GeoCommunicator {
    shared: Arc<GeoShared>,
    config: CommConfig,
    push_queue: Arc<SendQueue<SparseIdsMap>>,
    pending: Mutex<Vec<SparseIdsMap>>,
    have_push: AtomicUsize,
    status: RwLock<CommStatus>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for GeoCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoCommunicator").finish_non_exhaustive()
    }
}

/// Everything a geo update round needs, shared with the background task.
struct GeoShared {
    /// Variable name -> whether its updates are sparse row updates.
    var_list: HashMap<String, bool>,
    /// Keyed by variable name; each value describes the `.delta` send.
    send_ctxs: RpcCtxMap,
    /// Keyed by variable name; describes the authoritative pull.
    recv_ctxs: RpcCtxMap,
    /// External, authoritative local parameters.
    training: Arc<Scope>,
    /// Baseline captured at the last pull; deltas are measured against it.
    old: Arc<Scope>,
    /// Scratch for computed deltas, staged under `<var>.delta`.
    delta: Arc<Scope>,
    /// Scratch for freshly pulled values before they are applied.
    pserver: Arc<Scope>,
    client: Arc<dyn RpcClient>,
    trainer_nums: usize,
}

impl GeoCommunicator {
    /// Derives the delta-send and recv contexts from `vars_info` and seeds
    /// the baseline scopes by deep-copying every tracked parameter. The
    /// baseline must be captured before the compute loop mutates anything,
    /// so seeding is eager.
    pub fn new(
        client: Arc<dyn RpcClient>,
        training_scope: Arc<Scope>,
        vars_info: HashMap<String, VarInfo>,
        config: CommConfig,
    ) -> Result<Self, ParamsyncError> {
        config.validate()?;
        if vars_info.is_empty() {
            return Err(ParamsyncError::Config(
                "geo variable descriptor map is empty".to_string(),
            ));
        }

        let mut var_list = HashMap::with_capacity(vars_info.len());
        let mut send_ctxs = RpcCtxMap::with_capacity(vars_info.len());
        let mut recv_ctxs = RpcCtxMap::with_capacity(vars_info.len());
        let old = Arc::new(Scope::new());
        let pserver = Arc::new(Scope::new());

        for (name, info) in &vars_info {
            let send_ctx = info.delta_send_context(name);
            send_ctx.validate()?;
            let recv_ctx = info.recv_context(name);
            recv_ctx.validate()?;
            debug!("geo context for {name}:\n{recv_ctx}");
            send_ctxs.insert(name.clone(), send_ctx);
            recv_ctxs.insert(name.clone(), recv_ctx);
            var_list.insert(name.clone(), info.is_sparse);

            let Some(param) = training_scope.get(name) else {
                return Err(ParamsyncError::Config(format!(
                    "geo variable {name} is missing from the training scope"
                )));
            };
            if !param.is_dense() {
                return Err(ParamsyncError::Config(format!(
                    "geo variable {name} must have dense storage; sparse refers to its \
                     update representation"
                )));
            }
            old.set(name.clone(), param.clone());
            pserver.set(name.clone(), param);
        }

        let push_queue = Arc::new(SendQueue::new(config.geo_need_push_nums)?);

        Ok(Self {
            shared: Arc::new(GeoShared {
                var_list,
                send_ctxs,
                recv_ctxs,
                training: training_scope,
                old,
                delta: Arc::new(Scope::new()),
                pserver,
                client,
                trainer_nums: config.trainer_nums,
            }),
            config,
            push_queue,
            pending: Mutex::new(Vec::new()),
            have_push: AtomicUsize::new(0),
            status: RwLock::new(CommStatus::Created),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background update loop. One-shot, like the async mode.
    pub fn start(&self) -> Result<(), ParamsyncError> {
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            if *status != CommStatus::Created {
                return Err(ParamsyncError::Invariant(format!(
                    "communicator cannot start from the {status} state"
                )));
            }
            *status = CommStatus::Running;
        }
        let worker = tokio::spawn(run_geo_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.push_queue),
            self.config.geo_need_push_nums,
            self.cancel.clone(),
        ));
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker);
        info!(
            vars = self.shared.var_list.len(),
            trainer_nums = self.shared.trainer_nums,
            geo_need_push_nums = self.config.geo_need_push_nums,
            "geo communicator started"
        );
        Ok(())
    }

    /// Record one local step: for each named sparse variable, the row ids
    /// its lookup tensor references in `scope`. Once `geo_need_push_nums`
    /// steps have accumulated, the recorded maps move into the push queue
    /// and the step counter resets.
    pub async fn geo_send(
        &self,
        sparse_names: &[String],
        sparse_tables: &[String],
        scope: &Scope,
    ) -> Result<(), ParamsyncError> {
        if !self.is_running() {
            return Err(ParamsyncError::Invariant(
                "geo_send requires a running communicator".to_string(),
            ));
        }
        if sparse_names.len() != sparse_tables.len() {
            return Err(ParamsyncError::Invariant(format!(
                "{} sparse names but {} lookup tables",
                sparse_names.len(),
                sparse_tables.len()
            )));
        }

        let mut ids_map = SparseIdsMap::new();
        for (name, table) in sparse_names.iter().zip(sparse_tables) {
            if !self.shared.var_list.contains_key(name) {
                return Err(ParamsyncError::Invariant(format!(
                    "variable {name} is not geo-tracked"
                )));
            }
            let Some(var) = scope.get(table) else {
                return Err(ParamsyncError::Invariant(format!(
                    "lookup table {table} not found in scope"
                )));
            };
            let Variable::Sparse(s) = var else {
                return Err(ParamsyncError::Invariant(format!(
                    "lookup table {table} must be a sparse-rows value"
                )));
            };
            ids_map
                .entry(name.clone())
                .or_default()
                .extend(s.row_indices().iter().copied());
        }

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ids_map);

        let have = self.have_push.fetch_add(1, Ordering::SeqCst) + 1;
        if have >= self.config.geo_need_push_nums {
            let batches: Vec<SparseIdsMap> = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.drain(..).collect()
            };
            self.have_push.store(0, Ordering::SeqCst);
            for batch in batches {
                if !self.push_queue.push(batch).await {
                    break; // shutting down; the rest is discarded
                }
            }
        }
        Ok(())
    }

    /// Cooperative shutdown, mirroring the async mode.
    pub async fn stop(&self) {
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            if matches!(*status, CommStatus::Stopping | CommStatus::Stopped) {
                return;
            }
            *status = CommStatus::Stopping;
        }
        self.cancel.cancel();
        self.push_queue.close();

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.await;
        }

        let dropped = self.push_queue.drain().len();
        if dropped > 0 {
            debug!(dropped, "discarded queued id batches on stop");
        }

        *self.status.write().unwrap_or_else(|e| e.into_inner()) = CommStatus::Stopped;
        info!("geo communicator stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.status.read().unwrap_or_else(|e| e.into_inner()) == CommStatus::Running
    }

    pub fn status(&self) -> CommStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn old_scope(&self) -> &Arc<Scope> {
        &self.shared.old
    }
}

// ---------------------------------------------------------------------------
// Background update loop
// ---------------------------------------------------------------------------

/// Drain up to one push-threshold's worth of id batches, then run one
/// update task per tracked variable in parallel and wait for the round.
async fn run_geo_loop(
    shared: Arc<GeoShared>,
    push_queue: Arc<SendQueue<SparseIdsMap>>,
    geo_need_push_nums: usize,
    cancel: CancellationToken,
) {
    loop {
        let Some(first) = push_queue.pop().await else {
            break; // poisoned
        };
        let mut batch = vec![first];
        while batch.len() < geo_need_push_nums {
            match push_queue.try_pop() {
                Some(ids_map) => batch.push(ids_map),
                None => break,
            }
        }

        let mut round: JoinSet<()> = JoinSet::new();
        for (name, &is_sparse) in &shared.var_list {
            // Union the touched ids across the drained batches.
            let ids: HashSet<i64> = if is_sparse {
                batch
                    .iter()
                    .filter_map(|m| m.get(name))
                    .flatten()
                    .copied()
                    .collect()
            } else {
                HashSet::new()
            };
            if is_sparse && ids.is_empty() {
                continue; // nothing touched this round
            }
            let shared = Arc::clone(&shared);
            let name = name.clone();
            round.spawn(async move {
                if let Err(err) = update_var(&shared, &name, is_sparse, &ids).await {
                    warn!(var = %name, error = %err, "geo update round failed");
                }
            });
        }
        while round.join_next().await.is_some() {}

        if cancel.is_cancelled() {
            break;
        }
    }
    debug!("geo update loop exited");
}

/// One variable's update round: delta -> ship -> pull -> apply.
async fn update_var(
    shared: &GeoShared,
    name: &str,
    is_sparse: bool,
    ids: &HashSet<i64>,
) -> Result<(), ParamsyncError> {
    let delta_name = var_to_delta_var(name);
    let scale = shared.trainer_nums as f32;

    let Some(Variable::Dense(train_t)) = shared.training.get(name) else {
        return Err(ParamsyncError::Invariant(format!(
            "geo variable {name} is missing from the training scope or not dense"
        )));
    };
    let Some(Variable::Dense(old_t)) = shared.old.get(name) else {
        return Err(ParamsyncError::Invariant(format!(
            "baseline for {name} is missing"
        )));
    };
    if old_t.shape() != train_t.shape() {
        return Err(ParamsyncError::Invariant(format!(
            "baseline for {name} has shape [{}, {}] but training has [{}, {}]",
            old_t.rows(),
            old_t.cols(),
            train_t.rows(),
            train_t.cols()
        )));
    }

    // Delta since the last pull, scaled down by the trainer count.
    let sorted_ids: Vec<i64> = {
        let mut v: Vec<i64> = ids.iter().copied().collect();
        v.sort_unstable();
        v
    };
    let delta_var = if !is_sparse {
        let data = train_t
            .data()
            .iter()
            .zip(old_t.data())
            .map(|(t, o)| (t - o) / scale)
            .collect();
        Variable::Dense(DenseTensor::new(train_t.rows(), train_t.cols(), data)?)
    } else {
        let mut delta = SparseRows::new(train_t.rows() as i64, train_t.cols());
        for &row in &sorted_ids {
            let r = row as usize;
            if row < 0 || r >= train_t.rows() {
                return Err(ParamsyncError::Invariant(format!(
                    "touched row {row} of {name} is outside the table height {}",
                    train_t.rows()
                )));
            }
            let values: Vec<f32> = train_t
                .row(r)
                .iter()
                .zip(old_t.row(r))
                .map(|(t, o)| (t - o) / scale)
                .collect();
            delta.push_row(row, &values)?;
        }
        Variable::Sparse(delta)
    };
    shared.delta.set(delta_name, delta_var.clone());
    debug!(var = %name, sparse = is_sparse, touched = sorted_ids.len(), "shipping geo delta");

    // Ship the delta across the variable's shards, then pull the
    // authoritative values back, bypassing any barrier.
    let send_ctx = shared.send_ctxs.get(name).ok_or_else(|| {
        ParamsyncError::Invariant(format!("no delta send context for {name}"))
    })?;
    send_var(send_ctx, &delta_var, &shared.delta, &shared.client).await?;

    let recv_ctx = shared.recv_ctxs.get(name).ok_or_else(|| {
        ParamsyncError::Invariant(format!("no recv context for {name}"))
    })?;
    recv_param(recv_ctx, &shared.pserver, &shared.client, false).await?;

    // Apply: realign training and the baseline with the pulled values.
    let Some(Variable::Dense(pulled)) = shared.pserver.get(name) else {
        return Err(ParamsyncError::Invariant(format!(
            "pulled value for {name} is missing or not dense"
        )));
    };
    if !is_sparse {
        shared
            .training
            .set(name.to_string(), Variable::Dense(pulled.clone()));
        shared.old.set(name.to_string(), Variable::Dense(pulled));
    } else {
        for scope in [&shared.training, &shared.old] {
            scope.update(name, |var| {
                if let Variable::Dense(t) = var {
                    for &row in &sorted_ids {
                        let r = row as usize;
                        t.row_mut(r).copy_from_slice(pulled.row(r));
                    }
                }
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
