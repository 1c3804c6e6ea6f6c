use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::Rng;
use tokio::time::sleep;

use paramsync_core::{
    AsyncCommunicator, CommConfig, CommContext, DenseTensor, GeoCommunicator, LoopbackClient,
    RpcClient, RpcCtxMap, Scope, VarInfo, Variable,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Drive the communicator against the in-process loopback transport with a
/// synthetic training loop and verify what comes back.
#[derive(Debug, Parser)]
#[command(name = "paramsync-cli")]
struct Cli {
    /// Number of tracked variables.
    #[arg(long, default_value_t = 2)]
    vars: usize,

    /// Number of pserver shards per variable.
    #[arg(long, default_value_t = 2)]
    shards: usize,

    /// Rows per variable.
    #[arg(long, default_value_t = 8)]
    rows: usize,

    /// Columns per variable.
    #[arg(long, default_value_t = 4)]
    cols: usize,

    /// Simulated training steps.
    #[arg(long, default_value_t = 20)]
    steps: usize,

    /// Send queue capacity.
    #[arg(long, default_value_t = 20)]
    queue_capacity: usize,

    /// Run the GEO-SGD mode instead of per-step gradient shipping.
    #[arg(long)]
    geo: bool,

    /// GEO: total trainer count (delta divisor).
    #[arg(long, default_value_t = 1)]
    trainers: usize,

    /// GEO: local steps between push/pull rounds.
    #[arg(long, default_value_t = 5)]
    push_nums: usize,

    /// Print the effective config as JSON and exit.
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.vars == 0 || cli.rows < cli.shards.max(1) || cli.shards == 0 {
        eprintln!("error: need vars >= 1, shards >= 1 and rows >= shards");
        return ExitCode::FAILURE;
    }

    let config = CommConfig {
        send_queue_capacity: cli.queue_capacity,
        geo_need_push_nums: cli.push_nums,
        trainer_nums: cli.trainers,
        ..CommConfig::default()
    };
    if cli.show_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    let outcome = if cli.geo {
        run_geo(&cli, config).await
    } else {
        run_async(&cli, config).await
    };
    match outcome {
        Ok(()) => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Err(msg) => {
            eprintln!("failed: {msg}");
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

fn var_name(i: usize) -> String {
    format!("w{i}")
}

fn endpoints(shards: usize) -> Vec<String> {
    (0..shards).map(|i| format!("127.0.0.1:{}", 6000 + i)).collect()
}

/// Distribute `rows` across `shards`, remainder on the leading shards.
fn sections(rows: usize, shards: usize) -> Vec<i64> {
    let base = rows / shards;
    let extra = rows % shards;
    (0..shards)
        .map(|i| (base + usize::from(i < extra)) as i64)
        .collect()
}

/// Shard wire names; an unsplit variable keeps its own name.
fn shard_names(name: &str, shards: usize) -> Vec<String> {
    if shards == 1 {
        vec![name.to_string()]
    } else {
        (0..shards).map(|i| format!("{name}.block{i}")).collect()
    }
}

fn random_tensor(rows: usize, cols: usize) -> DenseTensor {
    let mut rng = rand::thread_rng();
    let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    DenseTensor::new(rows, cols, data).expect("generated data matches the shape")
}

// ---------------------------------------------------------------------------
// Async mode
// ---------------------------------------------------------------------------

async fn run_async(cli: &Cli, config: CommConfig) -> Result<(), String> {
    let loopback = Arc::new(LoopbackClient::new());
    let client: Arc<dyn RpcClient> = loopback.clone();
    let eps = endpoints(cli.shards);
    let secs = sections(cli.rows, cli.shards);

    let mut send_ctxs = RpcCtxMap::new();
    let mut recv_ctxs = RpcCtxMap::new();
    let recv_scope = Arc::new(Scope::new());
    for i in 0..cli.vars {
        let name = var_name(i);
        let ctx = CommContext::new(
            name.clone(),
            shard_names(&name, cli.shards),
            eps.clone(),
            secs.clone(),
            vec![name.clone()],
            0,
        );
        send_ctxs.insert(name.clone(), ctx.clone());
        recv_ctxs.insert(name.clone(), ctx);
        recv_scope.set(name, Variable::Dense(DenseTensor::zeros(cli.rows, cli.cols)));
    }

    let comm = AsyncCommunicator::new(
        client,
        Arc::clone(&recv_scope),
        send_ctxs,
        recv_ctxs,
        config,
    )
    .map_err(|e| e.to_string())?;
    comm.start().map_err(|e| e.to_string())?;

    let trainer_scope = Scope::new();
    for step in 0..cli.steps {
        let mut sent = Vec::with_capacity(cli.vars);
        for i in 0..cli.vars {
            let name = var_name(i);
            let grad = Variable::Dense(random_tensor(cli.rows, cli.cols));
            trainer_scope.set(name.clone(), grad.clone());
            comm.send(&name, &trainer_scope)
                .await
                .map_err(|e| e.to_string())?;
            sent.push((name, grad));
        }
        // One send per tracked variable reaches the recv trigger; wait for
        // the echo so each round's batch stays a single snapshot.
        wait_until(Duration::from_secs(5), || {
            sent.iter().all(|(name, grad)| {
                recv_scope.get(name).as_ref() == Some(grad)
            })
        })
        .await
        .map_err(|_| format!("step {step}: parameters were not echoed back in time"))?;
    }

    comm.stop().await;
    let total_sends: usize = (0..cli.vars)
        .map(|i| {
            let name = var_name(i);
            shard_names(&name, cli.shards)
                .iter()
                .zip(&eps)
                .map(|(shard, ep)| loopback.sends_to(ep, shard))
                .sum::<usize>()
        })
        .sum();
    println!(
        "async mode: {} vars x {} steps over {} shards, {} shard sends",
        cli.vars, cli.steps, cli.shards, total_sends
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// GEO mode
// ---------------------------------------------------------------------------

async fn run_geo(cli: &Cli, config: CommConfig) -> Result<(), String> {
    let loopback = Arc::new(LoopbackClient::new());
    let client: Arc<dyn RpcClient> = loopback.clone();
    let eps = endpoints(cli.shards);
    let secs = sections(cli.rows, cli.shards);

    let training = Arc::new(Scope::new());
    let mut vars_info = HashMap::new();
    for i in 0..cli.vars {
        let name = var_name(i);
        let initial = random_tensor(cli.rows, cli.cols);
        // Seed the pserver shards with the same initial parameter.
        let mut offset = 0usize;
        for (shard, (ep, &rows)) in shard_names(&name, cli.shards)
            .iter()
            .zip(eps.iter().zip(&secs))
        {
            let rows = rows as usize;
            let slice = initial.data()[offset * cli.cols..(offset + rows) * cli.cols].to_vec();
            let tensor = DenseTensor::new(rows, cli.cols, slice)
                .expect("section slice matches the shard shape");
            loopback.seed(ep, shard, Variable::Dense(tensor));
            offset += rows;
        }
        training.set(name.clone(), Variable::Dense(initial));
        vars_info.insert(
            name.clone(),
            VarInfo {
                param_names: shard_names(&name, cli.shards),
                endpoints: eps.clone(),
                sections: secs.clone(),
                origin_varnames: vec![],
                is_sparse: false,
            },
        );
    }

    let comm = GeoCommunicator::new(client, Arc::clone(&training), vars_info, config)
        .map_err(|e| e.to_string())?;
    comm.start().map_err(|e| e.to_string())?;

    let scope = Scope::new();
    for _ in 0..cli.steps {
        // Local optimizer step: drift every parameter a little.
        for i in 0..cli.vars {
            training.update(&var_name(i), |var| {
                if let Variable::Dense(t) = var {
                    let mut rng = rand::thread_rng();
                    for x in t.data_mut() {
                        *x += rng.gen_range(-0.1..0.1);
                    }
                }
            });
        }
        comm.geo_send(&[], &[], &scope).await.map_err(|e| e.to_string())?;
    }

    // Flush the tail: reach one more push threshold so the last drift ships.
    for _ in 0..cli.push_nums {
        comm.geo_send(&[], &[], &scope).await.map_err(|e| e.to_string())?;
    }

    // After the rounds settle, the local parameters, the baseline and the
    // pserver shards all agree.
    wait_until(Duration::from_secs(10), || {
        (0..cli.vars).all(|i| {
            let name = var_name(i);
            let Some(Variable::Dense(local)) = training.get(&name) else {
                return false;
            };
            let mut remote = Vec::with_capacity(cli.rows * cli.cols);
            for (shard, ep) in shard_names(&name, cli.shards).iter().zip(&eps) {
                match loopback.stored(ep, shard) {
                    Some(Variable::Dense(t)) => remote.extend_from_slice(t.data()),
                    _ => return false,
                }
            }
            local.data() == remote.as_slice()
        })
    })
    .await
    .map_err(|_| "training scope and pserver shards did not converge".to_string())?;

    comm.stop().await;
    println!(
        "geo mode: {} vars x {} steps, push every {} steps, {} trainers: converged",
        cli.vars, cli.steps, cli.push_nums, cli.trainers
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> Result<(), ()> {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return Err(());
        }
        sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
