use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::comm::receiver::recv_param;
use crate::comm::sender::send_param;
use crate::comm::CommStatus;
use crate::config::CommConfig;
use crate::error::ParamsyncError;
use crate::queue::SendQueue;
use crate::rpc::client::RpcClient;
use crate::rpc::RpcCtxMap;
use crate::tensor::{Scope, Variable};

/// Pause between dispatcher scans when there is nothing to do.
const DISPATCH_IDLE: Duration = Duration::from_millis(2);

// ---------------------------------------------------------------------------
// AsyncCommunicator
// ---------------------------------------------------------------------------

/// The per-step gradient shipping mode.
///
/// `send()` snapshots a variable into its bounded queue; a background send
/// dispatcher drains the queues through a capped worker pool, merging each
/// backlog and fanning the result out across pserver shards. Every
/// successful send pass bumps a shared gradient counter; when it reaches
/// the number of send-tracked variables, the recv dispatcher resets it and
/// pulls every recv-tracked variable back into the shared recv scope.
pub struct AsyncCommunicator {
    send_ctxs: RpcCtxMap,
    recv_ctxs: RpcCtxMap,
    recv_scope: Arc<Scope>,
    send_scope: Arc<Scope>,
    client: Arc<dyn RpcClient>,
    config: CommConfig,
    queues: RwLock<HashMap<String, Arc<SendQueue<Variable>>>>,
    grad_count: Arc<AtomicUsize>,
    status: RwLock<CommStatus>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AsyncCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCommunicator").finish_non_exhaustive()
    }
}

impl AsyncCommunicator {
    /// Validates the config and every context up front; descriptor problems
    /// are init-time errors, never runtime surprises.
    pub fn new(
        client: Arc<dyn RpcClient>,
        recv_scope: Arc<Scope>,
        send_ctxs: RpcCtxMap,
        recv_ctxs: RpcCtxMap,
        config: CommConfig,
    ) -> Result<Self, ParamsyncError> {
        config.validate()?;
        if send_ctxs.is_empty() {
            return Err(ParamsyncError::Config(
                "send context map is empty".to_string(),
            ));
        }
        for ctx in send_ctxs.values().chain(recv_ctxs.values()) {
            ctx.validate()?;
            debug!("registered context:\n{ctx}");
        }
        if recv_ctxs.is_empty() {
            warn!("recv context map is empty; receive passes will only reset the counter");
        }
        Ok(Self {
            send_ctxs,
            recv_ctxs,
            recv_scope,
            send_scope: Arc::new(Scope::new()),
            client,
            config,
            queues: RwLock::new(HashMap::new()),
            grad_count: Arc::new(AtomicUsize::new(0)),
            status: RwLock::new(CommStatus::Created),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Materialize the send queues and spawn both dispatcher tasks.
    ///
    /// May only be called once, from within a Tokio runtime; a communicator
    /// that has run cannot be restarted.
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

        let mut queues = HashMap::with_capacity(self.send_ctxs.len());
        for name in self.send_ctxs.keys() {
            queues.insert(
                name.clone(),
                Arc::new(SendQueue::new(self.config.send_queue_capacity)?),
            );
        }
        *self.queues.write().unwrap_or_else(|e| e.into_inner()) = queues.clone();

        let send_task = tokio::spawn(run_send_dispatcher(
            self.send_ctxs.clone(),
            queues,
            Arc::clone(&self.send_scope),
            Arc::clone(&self.client),
            Arc::clone(&self.grad_count),
            self.config.send_pool_size_for(self.send_ctxs.len()),
            self.cancel.clone(),
        ));
        let recv_task = tokio::spawn(run_recv_dispatcher(
            self.recv_ctxs.clone(),
            Arc::clone(&self.recv_scope),
            Arc::clone(&self.client),
            Arc::clone(&self.grad_count),
            self.send_ctxs.len(),
            self.config.recv_pool_size_for(self.recv_ctxs.len()),
            self.cancel.clone(),
        ));
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([send_task, recv_task]);

        info!(
            send_vars = self.send_ctxs.len(),
            recv_vars = self.recv_ctxs.len(),
            queue_capacity = self.config.send_queue_capacity,
            "async communicator started"
        );
        Ok(())
    }

    /// Snapshot `scope[var_name]` and enqueue it for the send dispatcher.
    ///
    /// Blocks while the variable's queue is full. During shutdown the
    /// snapshot is silently dropped.
    pub async fn send(&self, var_name: &str, scope: &Scope) -> Result<(), ParamsyncError> {
        let queue = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(var_name)
            .cloned();
        let Some(queue) = queue else {
            return Err(ParamsyncError::Invariant(format!(
                "no send queue for {var_name}; the variable is not send-tracked or the \
                 communicator has not been started"
            )));
        };
        let Some(snapshot) = scope.get(var_name) else {
            return Err(ParamsyncError::Invariant(format!(
                "variable {var_name} not found in the scope passed to send"
            )));
        };
        if !queue.push(snapshot).await {
            debug!(var = %var_name, "snapshot dropped: communicator is shutting down");
        }
        Ok(())
    }

    /// Cooperative shutdown: poison every queue, join the dispatchers, and
    /// discard whatever was still queued.
    pub async fn stop(&self) {
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            if matches!(*status, CommStatus::Stopping | CommStatus::Stopped) {
                return;
            }
            *status = CommStatus::Stopping;
        }
        self.cancel.cancel();
        for queue in self.queues.read().unwrap_or_else(|e| e.into_inner()).values() {
            queue.close();
        }

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.await;
        }

        let mut dropped = 0;
        for queue in self.queues.read().unwrap_or_else(|e| e.into_inner()).values() {
            dropped += queue.drain().len();
        }
        if dropped > 0 {
            debug!(dropped, "discarded queued snapshots on stop");
        }

        *self.status.write().unwrap_or_else(|e| e.into_inner()) = CommStatus::Stopped;
        info!("async communicator stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.status.read().unwrap_or_else(|e| e.into_inner()) == CommStatus::Running
    }

    pub fn status(&self) -> CommStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn grad_count(&self) -> usize {
        self.grad_count.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Dispatchers
// ---------------------------------------------------------------------------

/// Scan every send queue; submit a sender task for each non-empty one and
/// wait for the wave to finish before scanning again.
async fn run_send_dispatcher(
    send_ctxs: RpcCtxMap,
    queues: HashMap<String, Arc<SendQueue<Variable>>>,
    send_scope: Arc<Scope>,
    client: Arc<dyn RpcClient>,
    grad_count: Arc<AtomicUsize>,
    pool_size: usize,
    cancel: CancellationToken,
) {
    let limiter = Arc::new(Semaphore::new(pool_size));
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let mut wave: JoinSet<()> = JoinSet::new();
        for (name, ctx) in &send_ctxs {
            let Some(queue) = queues.get(name) else {
                continue;
            };
            if queue.is_empty() {
                continue;
            }
            let ctx = ctx.clone();
            let queue = Arc::clone(queue);
            let scope = Arc::clone(&send_scope);
            let client = Arc::clone(&client);
            let grad_count = Arc::clone(&grad_count);
            let limiter = Arc::clone(&limiter);
            wave.spawn(async move {
                let Ok(_permit) = limiter.acquire_owned().await else {
                    return;
                };
                match send_param(&ctx, &queue, &scope, &client).await {
                    Ok(true) => {
                        grad_count.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(false) => {} // queue poisoned; shutting down
                    Err(err) => {
                        warn!(var = %ctx.var_name, error = %err, "send pass failed");
                    }
                }
            });
        }
        let idle = wave.is_empty();
        while wave.join_next().await.is_some() {}
        if idle {
            tokio::select! {
                _ = sleep(DISPATCH_IDLE) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }
    debug!("send dispatcher exited");
}

/// Wait for the gradient counter to reach one increment per send-tracked
/// variable, reset it, and pull every recv-tracked variable.
async fn run_recv_dispatcher(
    recv_ctxs: RpcCtxMap,
    recv_scope: Arc<Scope>,
    client: Arc<dyn RpcClient>,
    grad_count: Arc<AtomicUsize>,
    threshold: usize,
    pool_size: usize,
    cancel: CancellationToken,
) {
    let limiter = Arc::new(Semaphore::new(pool_size));
    loop {
        loop {
            if cancel.is_cancelled() {
                debug!("recv dispatcher exited");
                return;
            }
            if grad_count.load(Ordering::SeqCst) >= threshold {
                break;
            }
            tokio::select! {
                _ = sleep(DISPATCH_IDLE) => {}
                _ = cancel.cancelled() => {}
            }
        }
        // Reset at the start of the pass: sends completing during the pass
        // count toward the next trigger.
        grad_count.store(0, Ordering::SeqCst);

        let mut wave: JoinSet<()> = JoinSet::new();
        for ctx in recv_ctxs.values() {
            let ctx = ctx.clone();
            let scope = Arc::clone(&recv_scope);
            let client = Arc::clone(&client);
            let limiter = Arc::clone(&limiter);
            wave.spawn(async move {
                let Ok(_permit) = limiter.acquire_owned().await else {
                    return;
                };
                if let Err(err) = recv_param(&ctx, &scope, &client, true).await {
                    warn!(var = %ctx.var_name, error = %err, "recv pass failed");
                }
            });
        }
        while wave.join_next().await.is_some() {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::loopback::LoopbackClient;
    use crate::rpc::CommContext;
    use crate::tensor::DenseTensor;
    use std::time::Instant;

    fn dense_rows(rows: &[Vec<f32>]) -> Variable {
        Variable::Dense(DenseTensor::from_rows(rows).unwrap())
    }

    fn unsplit_ctx(name: &str, rows: i64) -> CommContext {
        CommContext::new(
            name,
            vec![name.to_string()],
            vec!["e0".to_string()],
            vec![rows],
            vec![name.to_string()],
            0,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    fn communicator(
        loopback: &Arc<LoopbackClient>,
        send_ctxs: RpcCtxMap,
        recv_ctxs: RpcCtxMap,
        recv_scope: Arc<Scope>,
        config: CommConfig,
    ) -> AsyncCommunicator {
        let client: Arc<dyn RpcClient> = Arc::clone(loopback) as Arc<dyn RpcClient>;
        AsyncCommunicator::new(client, recv_scope, send_ctxs, recv_ctxs, config).unwrap()
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[test]
    fn empty_send_map_is_a_config_error() {
        let loopback = Arc::new(LoopbackClient::new());
        let client: Arc<dyn RpcClient> = loopback;
        let err = AsyncCommunicator::new(
            client,
            Arc::new(Scope::new()),
            RpcCtxMap::new(),
            RpcCtxMap::new(),
            CommConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ParamsyncError::Config(_)));
    }

    #[test]
    fn invalid_context_is_rejected_at_init() {
        let loopback = Arc::new(LoopbackClient::new());
        let client: Arc<dyn RpcClient> = loopback;
        let mut ctx = unsplit_ctx("w", 4);
        ctx.height_sections = vec![4, 4]; // length mismatch
        let mut send_ctxs = RpcCtxMap::new();
        send_ctxs.insert("w".to_string(), ctx);
        let err = AsyncCommunicator::new(
            client,
            Arc::new(Scope::new()),
            send_ctxs,
            RpcCtxMap::new(),
            CommConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ParamsyncError::Config(_)));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn start_is_rejected_after_first_success() {
        let loopback = Arc::new(LoopbackClient::new());
        let mut send_ctxs = RpcCtxMap::new();
        send_ctxs.insert("w".to_string(), unsplit_ctx("w", 1));
        let comm = communicator(
            &loopback,
            send_ctxs,
            RpcCtxMap::new(),
            Arc::new(Scope::new()),
            CommConfig::default(),
        );

        assert_eq!(comm.status(), CommStatus::Created);
        comm.start().unwrap();
        assert!(comm.is_running());
        assert!(comm.start().is_err());

        comm.stop().await;
        assert_eq!(comm.status(), CommStatus::Stopped);
        assert!(!comm.is_running());
        // a stopped communicator cannot be restarted
        assert!(comm.start().is_err());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let loopback = Arc::new(LoopbackClient::new());
        let mut send_ctxs = RpcCtxMap::new();
        send_ctxs.insert("w".to_string(), unsplit_ctx("w", 1));
        let comm = communicator(
            &loopback,
            send_ctxs,
            RpcCtxMap::new(),
            Arc::new(Scope::new()),
            CommConfig::default(),
        );
        comm.start().unwrap();
        comm.stop().await;
        comm.stop().await;
        assert_eq!(comm.status(), CommStatus::Stopped);
    }

    #[tokio::test]
    async fn send_before_start_is_an_invariant_violation() {
        let loopback = Arc::new(LoopbackClient::new());
        let mut send_ctxs = RpcCtxMap::new();
        send_ctxs.insert("w".to_string(), unsplit_ctx("w", 1));
        let comm = communicator(
            &loopback,
            send_ctxs,
            RpcCtxMap::new(),
            Arc::new(Scope::new()),
            CommConfig::default(),
        );
        let scope = Scope::new();
        scope.set("w", dense_rows(&[vec![1.0]]));
        let err = comm.send("w", &scope).await.unwrap_err();
        assert!(matches!(err, ParamsyncError::Invariant(_)));
    }

    #[tokio::test]
    async fn send_of_untracked_variable_is_rejected() {
        let loopback = Arc::new(LoopbackClient::new());
        let mut send_ctxs = RpcCtxMap::new();
        send_ctxs.insert("w".to_string(), unsplit_ctx("w", 1));
        let comm = communicator(
            &loopback,
            send_ctxs,
            RpcCtxMap::new(),
            Arc::new(Scope::new()),
            CommConfig::default(),
        );
        comm.start().unwrap();
        let scope = Scope::new();
        scope.set("other", dense_rows(&[vec![1.0]]));
        assert!(comm.send("other", &scope).await.is_err());
        comm.stop().await;
    }

    // -----------------------------------------------------------------------
    // End to end: single-shard dense echo
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn single_shard_dense_echo() {
        let loopback = Arc::new(LoopbackClient::new());
        let ctx = unsplit_ctx("w", 4);
        let mut send_ctxs = RpcCtxMap::new();
        send_ctxs.insert("w".to_string(), ctx.clone());
        let mut recv_ctxs = RpcCtxMap::new();
        recv_ctxs.insert("w".to_string(), ctx);

        let recv_scope = Arc::new(Scope::new());
        recv_scope.set("w", Variable::Dense(DenseTensor::zeros(4, 2)));

        let comm = communicator(
            &loopback,
            send_ctxs,
            recv_ctxs,
            Arc::clone(&recv_scope),
            CommConfig::default(),
        );
        comm.start().unwrap();

        let sent = dense_rows(&[
            vec![1.0, 1.0],
            vec![2.0, 2.0],
            vec![3.0, 3.0],
            vec![4.0, 4.0],
        ]);
        let trainer_scope = Scope::new();
        trainer_scope.set("w", sent.clone());
        comm.send("w", &trainer_scope).await.unwrap();

        // one send == |send map|, so a recv pass pulls the echo back
        wait_until(|| recv_scope.get("w") == Some(sent.clone())).await;
        comm.stop().await;
    }

    // -----------------------------------------------------------------------
    // End to end: merge-sum under pressure
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn merge_sum_under_queue_pressure() {
        let loopback = Arc::new(LoopbackClient::new());
        // Ship the gradient as a delta so the loopback pserver accumulates:
        // however the dispatcher batches the three snapshots, the stored
        // total must equal their sum.
        loopback.seed("e0", "g", dense_rows(&[vec![0.0]]));
        let mut send_ctxs = RpcCtxMap::new();
        send_ctxs.insert("g.delta".to_string(), unsplit_ctx("g.delta", 1));

        let comm = communicator(
            &loopback,
            send_ctxs,
            RpcCtxMap::new(),
            Arc::new(Scope::new()),
            CommConfig {
                send_queue_capacity: 2,
                ..CommConfig::default()
            },
        );
        comm.start().unwrap();

        let trainer_scope = Scope::new();
        for grad in [1.0f32, 2.0, 4.0] {
            trainer_scope.set("g.delta", dense_rows(&[vec![grad]]));
            comm.send("g.delta", &trainer_scope).await.unwrap();
        }

        wait_until(|| {
            loopback.stored("e0", "g") == Some(dense_rows(&[vec![7.0]]))
        })
        .await;
        comm.stop().await;
    }

    // -----------------------------------------------------------------------
    // Dispatcher trigger
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn recv_waits_for_one_increment_per_send_tracked_variable() {
        let loopback = Arc::new(LoopbackClient::new());
        loopback.seed("e0", "p", dense_rows(&[vec![42.0]]));

        let mut send_ctxs = RpcCtxMap::new();
        send_ctxs.insert("a".to_string(), unsplit_ctx("a", 1));
        send_ctxs.insert("b".to_string(), unsplit_ctx("b", 1));
        let mut recv_ctxs = RpcCtxMap::new();
        recv_ctxs.insert("p".to_string(), unsplit_ctx("p", 1));

        let recv_scope = Arc::new(Scope::new());
        recv_scope.set("p", dense_rows(&[vec![0.0]]));

        let comm = communicator(
            &loopback,
            send_ctxs,
            recv_ctxs,
            Arc::clone(&recv_scope),
            CommConfig::default(),
        );
        comm.start().unwrap();

        let trainer_scope = Scope::new();
        trainer_scope.set("a", dense_rows(&[vec![1.0]]));
        trainer_scope.set("b", dense_rows(&[vec![1.0]]));

        // One of two tracked variables sent: below threshold, no recv pass.
        comm.send("a", &trainer_scope).await.unwrap();
        wait_until(|| comm.grad_count() == 1).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(recv_scope.get("p"), Some(dense_rows(&[vec![0.0]])));

        // Second variable reaches the threshold; the pass resets the counter
        // and pulls the parameter.
        comm.send("b", &trainer_scope).await.unwrap();
        wait_until(|| recv_scope.get("p") == Some(dense_rows(&[vec![42.0]]))).await;
        wait_until(|| comm.grad_count() == 0).await;
        comm.stop().await;
    }

    // -----------------------------------------------------------------------
    // RPC failure does not advance the counter
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failed_send_pass_does_not_advance_the_counter() {
        let loopback = Arc::new(LoopbackClient::new());
        loopback.inject_failure("e0", "w");

        // A second tracked variable that is never sent keeps the recv
        // trigger threshold out of reach, so the counter is observable.
        let mut send_ctxs = RpcCtxMap::new();
        send_ctxs.insert("w".to_string(), unsplit_ctx("w", 1));
        send_ctxs.insert("idle".to_string(), unsplit_ctx("idle", 1));

        let comm = communicator(
            &loopback,
            send_ctxs,
            RpcCtxMap::new(),
            Arc::new(Scope::new()),
            CommConfig::default(),
        );
        comm.start().unwrap();

        let trainer_scope = Scope::new();
        trainer_scope.set("w", dense_rows(&[vec![1.0]]));
        comm.send("w", &trainer_scope).await.unwrap();

        // The pass fails, the snapshot is discarded, the counter stays put.
        wait_until(|| loopback.sends_to("e0", "w") == 0 && comm.grad_count() == 0).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(comm.grad_count(), 0);

        // The next successful send increments by exactly 1.
        loopback.clear_failure("e0", "w");
        comm.send("w", &trainer_scope).await.unwrap();
        wait_until(|| comm.grad_count() == 1).await;
        comm.stop().await;
    }
}
