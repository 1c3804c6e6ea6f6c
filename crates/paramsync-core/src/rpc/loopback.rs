use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::rpc::client::{RpcClient, WaitHandle};
use crate::rpc::{delta_var_to_var, CommContext, DELTA_SUFFIX};
use crate::tensor::{Scope, Variable};

// ---------------------------------------------------------------------------
// LoopbackClient
// ---------------------------------------------------------------------------

type Key = (String, String);

/// An in-process transport backed by a shared `(endpoint, varname)` store.
///
/// Sends of `*.delta` variables are applied additively to the parameter
/// stored under the stripped name (dense add, sparse scatter-add), the way
/// a GEO pserver treats delta tensors; all other sends overwrite. Gets
/// serve clones of stored values. Failures can be injected per key.
#[derive(Debug, Default)]
pub struct LoopbackClient {
    store: RwLock<HashMap<Key, Variable>>,
    failures: RwLock<HashSet<Key>>,
    send_counts: RwLock<HashMap<Key, usize>>,
}

impl LoopbackClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a pserver shard, as if a previous run had populated it.
    pub fn seed(&self, endpoint: &str, name: &str, var: Variable) {
        self.store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key(endpoint, name), var);
    }

    /// The value currently stored for `(endpoint, name)`.
    pub fn stored(&self, endpoint: &str, name: &str) -> Option<Variable> {
        self.store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(endpoint, name))
            .cloned()
    }

    /// Make every future operation on `(endpoint, name)` fail.
    pub fn inject_failure(&self, endpoint: &str, name: &str) {
        self.failures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key(endpoint, name));
    }

    pub fn clear_failure(&self, endpoint: &str, name: &str) {
        self.failures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key(endpoint, name));
    }

    /// How many sends have landed on `(endpoint, name)`.
    pub fn sends_to(&self, endpoint: &str, name: &str) -> usize {
        self.send_counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(endpoint, name))
            .copied()
            .unwrap_or(0)
    }

    fn is_failed(&self, k: &Key) -> bool {
        self.failures
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(k)
    }

    /// Apply one send to the store. Delta variables accumulate into the
    /// stripped-name parameter; everything else overwrites.
    fn apply_send(&self, endpoint: &str, var_name: &str, var: Variable) -> bool {
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        if !var_name.ends_with(DELTA_SUFFIX) {
            store.insert(key(endpoint, var_name), var);
            return true;
        }

        let param_key = key(endpoint, delta_var_to_var(var_name));
        let Some(Variable::Dense(param)) = store.get_mut(&param_key) else {
            debug!(endpoint, var_name, "delta sent for an unknown parameter");
            return false;
        };
        match var {
            Variable::Dense(delta) => {
                if delta.shape() != param.shape() {
                    return false;
                }
                for (p, d) in param.data_mut().iter_mut().zip(delta.data()) {
                    *p += d;
                }
                true
            }
            Variable::Sparse(delta) => {
                for (i, &row) in delta.row_indices().iter().enumerate() {
                    let r = row as usize;
                    if row < 0 || r >= param.rows() || delta.cols() != param.cols() {
                        return false;
                    }
                    for (p, d) in param.row_mut(r).iter_mut().zip(delta.value_row(i)) {
                        *p += d;
                    }
                }
                true
            }
        }
    }

    fn get_into(&self, endpoint: &str, scope: &Scope, in_name: &str, out_name: &str) -> bool {
        let k = key(endpoint, in_name);
        if self.is_failed(&k) {
            return false;
        }
        let stored = self
            .store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&k)
            .cloned();
        match stored {
            Some(var) => {
                scope.set(out_name, var);
                true
            }
            None => false,
        }
    }
}

fn key(endpoint: &str, name: &str) -> Key {
    (endpoint.to_string(), name.to_string())
}

impl RpcClient for LoopbackClient {
    fn async_send(
        &self,
        endpoint: &str,
        _ctx: &CommContext,
        scope: &Arc<Scope>,
        var_name: &str,
    ) -> WaitHandle {
        let k = key(endpoint, var_name);
        if self.is_failed(&k) {
            return WaitHandle::ready(false);
        }
        let Some(var) = scope.get(var_name) else {
            return WaitHandle::ready(false);
        };
        *self
            .send_counts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(k)
            .or_insert(0) += 1;
        WaitHandle::ready(self.apply_send(endpoint, var_name, var))
    }

    fn async_get(
        &self,
        endpoint: &str,
        ctx: &CommContext,
        scope: &Arc<Scope>,
        in_name: &str,
        out_name: &str,
    ) -> WaitHandle {
        // In-process there is nothing to barrier against.
        self.async_get_no_barrier(endpoint, ctx, scope, in_name, out_name)
    }

    fn async_get_no_barrier(
        &self,
        endpoint: &str,
        _ctx: &CommContext,
        scope: &Arc<Scope>,
        in_name: &str,
        out_name: &str,
    ) -> WaitHandle {
        WaitHandle::ready(self.get_into(endpoint, scope, in_name, out_name))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
