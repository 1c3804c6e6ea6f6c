use std::sync::Arc;

use futures_util::future::join_all;
use tracing::debug;

use crate::error::ParamsyncError;
use crate::queue::SendQueue;
use crate::rpc::client::RpcClient;
use crate::rpc::CommContext;
use crate::tensor::merge::merge_vars;
use crate::tensor::split::split_var;
use crate::tensor::{Scope, Variable};

// ---------------------------------------------------------------------------
// Per-variable send pass
// ---------------------------------------------------------------------------

/// Drain, merge and ship one batch for a single variable.
///
/// Blocks for the first snapshot, then opportunistically drains up to the
/// queue's current size so bursts collapse into one merged send. Returns
/// `Ok(true)` when a batch was shipped, `Ok(false)` when the queue was
/// poisoned (shutdown). On an RPC failure the whole batch is discarded
/// (the next gradient supersedes it) and the error is returned so the
/// caller skips the gradient-counter increment.
pub(crate) async fn send_param(
    ctx: &CommContext,
    queue: &SendQueue<Variable>,
    send_scope: &Arc<Scope>,
    client: &Arc<dyn RpcClient>,
) -> Result<bool, ParamsyncError> {
    let Some(first) = queue.pop().await else {
        return Ok(false);
    };
    let mut batch = vec![first];
    let pending = queue.len();
    for _ in 0..pending {
        match queue.try_pop() {
            Some(snapshot) => batch.push(snapshot),
            None => break,
        }
    }

    debug!(var = %ctx.var_name, batch = batch.len(), "merging gradient batch");
    let merged = merge_vars(&ctx.var_name, &batch, ctx.merge_add)?;
    send_var(ctx, &merged, send_scope, client).await?;
    Ok(true)
}

/// Split `var` by the context's height sections, stage each slice in
/// `staging_scope` under its wire name, and fan out one async send per
/// `(slice, endpoint)`; all handles are awaited together and any failure
/// fails the pass.
pub(crate) async fn send_var(
    ctx: &CommContext,
    var: &Variable,
    staging_scope: &Arc<Scope>,
    client: &Arc<dyn RpcClient>,
) -> Result<(), ParamsyncError> {
    let slices = split_var(var, &ctx.height_sections)?;

    let mut handles = Vec::with_capacity(slices.len());
    for (i, slice) in slices.into_iter().enumerate() {
        let slice_name = &ctx.splited_varnames[i];
        staging_scope.set(slice_name.clone(), slice);
        handles.push(client.async_send(&ctx.endpoints[i], ctx, staging_scope, slice_name));
    }

    let results = join_all(handles.into_iter().map(|h| h.wait())).await;
    for (i, ok) in results.iter().enumerate() {
        if !*ok {
            return Err(ParamsyncError::Rpc(format!(
                "send of {} to {} failed",
                ctx.splited_varnames[i], ctx.endpoints[i]
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::loopback::LoopbackClient;
    use crate::tensor::DenseTensor;

    fn two_shard_ctx() -> CommContext {
        CommContext::new(
            "w",
            vec!["w.block0".to_string(), "w.block1".to_string()],
            vec!["e0".to_string(), "e1".to_string()],
            vec![2, 3],
            vec!["w".to_string()],
            0,
        )
    }

    fn dense_rows(rows: &[Vec<f32>]) -> Variable {
        Variable::Dense(DenseTensor::from_rows(rows).unwrap())
    }

    #[tokio::test]
    async fn send_pass_merges_the_whole_backlog() {
        let client: Arc<dyn RpcClient> = Arc::new(LoopbackClient::new());
        let queue = SendQueue::new(4).unwrap();
        let scope = Arc::new(Scope::new());
        let ctx = CommContext::new(
            "g",
            vec!["g".to_string()],
            vec!["e0".to_string()],
            vec![1],
            vec!["g".to_string()],
            0,
        );

        assert!(queue.push(dense_rows(&[vec![1.0]])).await);
        assert!(queue.push(dense_rows(&[vec![2.0]])).await);
        assert!(queue.push(dense_rows(&[vec![4.0]])).await);

        let shipped = send_param(&ctx, &queue, &scope, &client).await.unwrap();
        assert!(shipped);
        assert!(queue.is_empty());

        // staged slice in the send scope is the merged sum
        assert_eq!(scope.get("g").unwrap(), dense_rows(&[vec![7.0]]));
    }

    #[tokio::test]
    async fn send_fans_out_row_ranges_per_endpoint() {
        let loopback = Arc::new(LoopbackClient::new());
        let client: Arc<dyn RpcClient> = loopback.clone();
        let scope = Arc::new(Scope::new());
        let ctx = two_shard_ctx();

        let merged = dense_rows(&[
            vec![0.0],
            vec![1.0],
            vec![2.0],
            vec![3.0],
            vec![4.0],
        ]);
        send_var(&ctx, &merged, &scope, &client).await.unwrap();

        assert_eq!(
            loopback.stored("e0", "w.block0").unwrap(),
            dense_rows(&[vec![0.0], vec![1.0]])
        );
        assert_eq!(
            loopback.stored("e1", "w.block1").unwrap(),
            dense_rows(&[vec![2.0], vec![3.0], vec![4.0]])
        );
        assert_eq!(loopback.sends_to("e0", "w.block0"), 1);
        assert_eq!(loopback.sends_to("e1", "w.block1"), 1);
    }

    #[tokio::test]
    async fn any_failed_shard_fails_the_pass() {
        let loopback = Arc::new(LoopbackClient::new());
        loopback.inject_failure("e1", "w.block1");
        let client: Arc<dyn RpcClient> = loopback.clone();
        let scope = Arc::new(Scope::new());

        let merged = dense_rows(&std::array::from_fn::<_, 5, _>(|_| vec![0.0]));
        let err = send_var(&two_shard_ctx(), &merged, &scope, &client)
            .await
            .unwrap_err();
        assert!(matches!(err, ParamsyncError::Rpc(_)));
        assert!(err.to_string().contains("w.block1"));
    }

    #[tokio::test]
    async fn poisoned_queue_ends_the_pass_without_error() {
        let client: Arc<dyn RpcClient> = Arc::new(LoopbackClient::new());
        let queue: SendQueue<Variable> = SendQueue::new(2).unwrap();
        queue.close();
        let scope = Arc::new(Scope::new());
        let shipped = send_param(&two_shard_ctx(), &queue, &scope, &client)
            .await
            .unwrap();
        assert!(!shipped);
    }

    #[tokio::test]
    async fn sparse_batch_is_bucketed_by_shard() {
        let loopback = Arc::new(LoopbackClient::new());
        let client: Arc<dyn RpcClient> = loopback.clone();
        let scope = Arc::new(Scope::new());
        let ctx = two_shard_ctx();

        let mut s = crate::tensor::SparseRows::new(5, 1);
        s.push_row(1, &[10.0]).unwrap();
        s.push_row(4, &[20.0]).unwrap();
        send_var(&ctx, &Variable::Sparse(s), &scope, &client)
            .await
            .unwrap();

        let shard0 = loopback.stored("e0", "w.block0").unwrap();
        assert_eq!(shard0.as_sparse().unwrap().row_indices(), &[1]);
        let shard1 = loopback.stored("e1", "w.block1").unwrap();
        assert_eq!(shard1.as_sparse().unwrap().row_indices(), &[2]);
        assert_eq!(shard1.as_sparse().unwrap().value_row(0), &[20.0]);
    }
}
