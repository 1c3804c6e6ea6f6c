use std::sync::Arc;

use futures_util::future::join_all;
use tracing::debug;

use crate::error::ParamsyncError;
use crate::rpc::client::RpcClient;
use crate::rpc::CommContext;
use crate::tensor::split::flatten_dense;
use crate::tensor::{DenseTensor, Scope, Variable};

// ---------------------------------------------------------------------------
// Per-variable recv pass
// ---------------------------------------------------------------------------

/// Fetch every shard of a variable and reassemble it into the recv scope.
///
/// Unsplit variables take the short path: one no-barrier get straight into
/// the destination. Otherwise all slices are fetched in parallel into a
/// temporary scope (`barrier` selects the barriered get), flattened along
/// the row axis in shard order, and scattered into the origin variables;
/// the origins' total element count must consume the flattened buffer
/// exactly.
pub(crate) async fn recv_param(
    ctx: &CommContext,
    recv_scope: &Arc<Scope>,
    client: &Arc<dyn RpcClient>,
    barrier: bool,
) -> Result<(), ParamsyncError> {
    if ctx.splited_varnames.len() == 1 && ctx.origin_varnames.len() == 1 {
        let name = &ctx.origin_varnames[0];
        debug!(var = %name, endpoint = %ctx.endpoints[0], "recv unsplit variable");
        let ok = client
            .async_get_no_barrier(&ctx.endpoints[0], ctx, recv_scope, name, name)
            .wait()
            .await;
        if !ok {
            return Err(ParamsyncError::Rpc(format!(
                "get of {name} from {} failed",
                ctx.endpoints[0]
            )));
        }
        return Ok(());
    }

    let local = Arc::new(Scope::new());
    let mut handles = Vec::with_capacity(ctx.shard_count());
    for i in 0..ctx.shard_count() {
        let slice_name = &ctx.splited_varnames[i];
        let handle = if barrier {
            client.async_get(&ctx.endpoints[i], ctx, &local, slice_name, slice_name)
        } else {
            client.async_get_no_barrier(&ctx.endpoints[i], ctx, &local, slice_name, slice_name)
        };
        handles.push(handle);
    }

    let results = join_all(handles.into_iter().map(|h| h.wait())).await;
    for (i, ok) in results.iter().enumerate() {
        if !*ok {
            return Err(ParamsyncError::Rpc(format!(
                "get of {} from {} failed",
                ctx.splited_varnames[i], ctx.endpoints[i]
            )));
        }
    }

    // Reassemble: slices arrive dense; concatenate them in shard order.
    let mut slices = Vec::with_capacity(ctx.shard_count());
    for slice_name in &ctx.splited_varnames {
        let var = local.get(slice_name).ok_or_else(|| {
            ParamsyncError::Invariant(format!("received slice {slice_name} is missing"))
        })?;
        match var {
            Variable::Dense(t) => slices.push(t),
            Variable::Sparse(_) => {
                return Err(ParamsyncError::Invariant(format!(
                    "received slice {slice_name} is sparse; only dense parameters can be \
                     reassembled"
                )))
            }
        }
    }
    let flat = flatten_dense(&slices)?;

    // Scatter consecutive element ranges into the origin variables.
    let total = flat.numel();
    let mut offset = 0usize;
    for origin in &ctx.origin_varnames {
        let Some(Variable::Dense(dst)) = recv_scope.get(origin) else {
            return Err(ParamsyncError::Invariant(format!(
                "origin variable {origin} is missing from the recv scope or not dense"
            )));
        };
        let count = dst.numel();
        if offset + count > total {
            return Err(ParamsyncError::Invariant(format!(
                "reassembled {} has {total} elements but its origins require more",
                ctx.var_name
            )));
        }
        let chunk = flat.data()[offset..offset + count].to_vec();
        recv_scope.set(
            origin.clone(),
            Variable::Dense(DenseTensor::new(dst.rows(), dst.cols(), chunk)?),
        );
        offset += count;
    }
    if offset != total {
        return Err(ParamsyncError::Invariant(format!(
            "reassembled {} has {total} elements but its origins consume only {offset}",
            ctx.var_name
        )));
    }

    debug!(var = %ctx.var_name, shards = ctx.shard_count(), "recv pass complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
