pub mod client;
pub mod loopback;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ParamsyncError;

// ---------------------------------------------------------------------------
// Delta naming
// ---------------------------------------------------------------------------

/// Suffix appended to a variable name to form its GEO delta counterpart.
pub const DELTA_SUFFIX: &str = ".delta";

/// `w` -> `w.delta`
pub fn var_to_delta_var(name: &str) -> String {
    format!("{name}{DELTA_SUFFIX}")
}

/// `w.delta` -> `w`; names without the suffix pass through unchanged.
pub fn delta_var_to_var(name: &str) -> &str {
    name.strip_suffix(DELTA_SUFFIX).unwrap_or(name)
}

// ---------------------------------------------------------------------------
// CommContext
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// The per-variable slicing descriptor: where each row-range shard of the
/// variable lives and under what name it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CommContext {
    /// Merged/display name of the variable.
    pub var_name: String,
    /// Wire name of each shard; same length as `endpoints`.
    pub splited_varnames: Vec<String>,
    /// `host:port` of the pserver owning each shard. Not interpreted here.
    pub endpoints: Vec<String>,
    /// Row count of each shard; sums to the logical row count.
    pub height_sections: Vec<i64>,
    /// Pre-slice source variables, flattened together on receive.
    pub origin_varnames: Vec<String>,
    #[serde(default)]
    pub trainer_id: usize,
    /// Merge semantics for queued snapshots: plain sum when true,
    /// averaged when false.
    #[serde(default = "default_true")]
    pub merge_add: bool,
    /// Whether sends for this variable go through a bounded queue.
    #[serde(default = "default_true")]
    pub use_send_queue: bool,
}

impl CommContext {
    pub fn new(
        var_name: impl Into<String>,
        splited_varnames: Vec<String>,
        endpoints: Vec<String>,
        height_sections: Vec<i64>,
        origin_varnames: Vec<String>,
        trainer_id: usize,
    ) -> Self {
        Self {
            var_name: var_name.into(),
            splited_varnames,
            endpoints,
            height_sections,
            origin_varnames,
            trainer_id,
            merge_add: true,
            use_send_queue: true,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Sum of the height sections: the logical row count of the variable.
    pub fn total_height(&self) -> i64 {
        self.height_sections.iter().sum()
    }

    /// Enforce the descriptor invariants at init time.
    pub fn validate(&self) -> Result<(), ParamsyncError> {
        if self.splited_varnames.is_empty() {
            return Err(ParamsyncError::Config(format!(
                "context for {} has no shards",
                self.var_name
            )));
        }
        if self.splited_varnames.len() != self.endpoints.len()
            || self.splited_varnames.len() != self.height_sections.len()
        {
            return Err(ParamsyncError::Config(format!(
                "context for {} has mismatched lengths: {} slice names, {} endpoints, {} sections",
                self.var_name,
                self.splited_varnames.len(),
                self.endpoints.len(),
                self.height_sections.len()
            )));
        }
        if self.origin_varnames.is_empty() {
            return Err(ParamsyncError::Config(format!(
                "context for {} has no origin variables",
                self.var_name
            )));
        }
        if self.height_sections.iter().any(|&s| s <= 0) {
            return Err(ParamsyncError::Config(format!(
                "context for {} has non-positive height sections: {:?}",
                self.var_name, self.height_sections
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for CommContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "merged_var: {} trainer_id: {}",
            self.var_name, self.trainer_id
        )?;
        for i in 0..self.splited_varnames.len() {
            writeln!(
                f,
                "slice varname: {} ep: {} section: {}",
                self.splited_varnames[i], self.endpoints[i], self.height_sections[i]
            )?;
        }
        write!(f, "origin varnames: {}", self.origin_varnames.join(" "))
    }
}

/// Variable name -> slicing descriptor. Two instances exist per
/// communicator: one for the send path, one for the recv path.
pub type RpcCtxMap = HashMap<String, CommContext>;

// ---------------------------------------------------------------------------
// VarInfo (GEO descriptor input)
// ---------------------------------------------------------------------------

/// The split descriptor a host supplies per variable in GEO mode, from
/// which both the `.delta` send contexts and the recv contexts are derived.
///
/// For an unsplit variable the single entry of `param_names` is the
/// variable name itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VarInfo {
    /// Wire name of each parameter shard.
    pub param_names: Vec<String>,
    /// Endpoint owning each shard.
    pub endpoints: Vec<String>,
    /// Row count of each shard.
    pub sections: Vec<i64>,
    /// Pre-slice sources; defaults to the variable's own name.
    #[serde(default)]
    pub origin_varnames: Vec<String>,
    /// True when updates to the variable are sparse row updates.
    #[serde(default)]
    pub is_sparse: bool,
}

impl VarInfo {
    /// The recv-side context for variable `name`.
    pub fn recv_context(&self, name: &str) -> CommContext {
        let origins = if self.origin_varnames.is_empty() {
            vec![name.to_string()]
        } else {
            self.origin_varnames.clone()
        };
        CommContext::new(
            name,
            self.param_names.clone(),
            self.endpoints.clone(),
            self.sections.clone(),
            origins,
            0,
        )
    }

    /// The send-side context for variable `name`'s delta: every name gains
    /// the delta suffix so pservers can resolve the target parameter.
    pub fn delta_send_context(&self, name: &str) -> CommContext {
        let delta_name = var_to_delta_var(name);
        CommContext::new(
            delta_name.clone(),
            self.param_names.iter().map(|p| var_to_delta_var(p)).collect(),
            self.endpoints.clone(),
            self.sections.clone(),
            vec![delta_name],
            0,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
