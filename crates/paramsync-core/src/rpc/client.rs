use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::rpc::CommContext;
use crate::tensor::Scope;

// ---------------------------------------------------------------------------
// WaitHandle
// ---------------------------------------------------------------------------

/// Completion token for an in-flight RPC.
///
/// `wait()` resolves to `true` on success and `false` on failure; a dropped
/// sender (transport task died) also reads as failure.
pub struct WaitHandle {
    rx: oneshot::Receiver<bool>,
}

impl WaitHandle {
    /// Run `fut` on the runtime and complete the handle with its result.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
        Self { rx }
    }

    /// An already-completed handle.
    pub fn ready(ok: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(ok);
        Self { rx }
    }

    pub async fn wait(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

/// The abstract transport the communicator fans out over.
///
/// Implementations are injected at init; the core never opens sockets.
/// All three calls are fire-and-collect: they return immediately and the
/// caller gathers the handles, usually with `join_all`.
pub trait RpcClient: Send + Sync {
    /// Ship `scope[var_name]` to `endpoint`.
    fn async_send(
        &self,
        endpoint: &str,
        ctx: &CommContext,
        scope: &Arc<Scope>,
        var_name: &str,
    ) -> WaitHandle;

    /// Fetch `in_name` from `endpoint` into `scope[out_name]`, observing the
    /// transport's synchronization barrier.
    fn async_get(
        &self,
        endpoint: &str,
        ctx: &CommContext,
        scope: &Arc<Scope>,
        in_name: &str,
        out_name: &str,
    ) -> WaitHandle;

    /// Like `async_get`, bypassing the barrier.
    fn async_get_no_barrier(
        &self,
        endpoint: &str,
        ctx: &CommContext,
        scope: &Arc<Scope>,
        in_name: &str,
        out_name: &str,
    ) -> WaitHandle;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
