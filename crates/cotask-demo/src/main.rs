use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use cotask::{Batcher, Executor, ExecutorConfig, Task, TaskError, WorkerPool, sync_wait};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const USAGE: &str = "\
Usage: cotask-demo <scenario> [options]

Scenarios:
  batch      Coalesce requests through a batcher
  chain      Await a long chain of tasks
  failure    Propagate a failure through nested tasks
  offload    Run blocking work on the worker pool
  timeout    Race a slow task against a timer

Options:
  --size <n>       Seal batches at this many inputs [default: 4]
  --count <n>      Number of batch requests [default: 10]
  --depth <n>      Chain depth [default: 10000]
  --path <file>    File to read in the offload scenario
  --limit-ms <n>   Timeout in milliseconds [default: 20]
  --threads <n>    Worker pool threads [default: 2]

Executor policies come from COTASK_START, COTASK_RESUME and
COTASK_STALL_TIMEOUT_MS.";

#[derive(Debug)]
struct Options {
    scenario: String,
    size: usize,
    count: u64,
    depth: u64,
    path: Option<PathBuf>,
    limit: Duration,
    threads: usize,
}

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    match run(&options) {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: JSON serialization failed: {e}");
                process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("COTASK_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("cotask={level},cotask_demo={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut scenario: Option<String> = None;
    let mut options = Options {
        scenario: String::new(),
        size: 4,
        count: 10,
        depth: 10_000,
        path: None,
        limit: Duration::from_millis(20),
        threads: 2,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            flag @ ("--size" | "--count" | "--depth" | "--limit-ms" | "--threads") => {
                i += 1;
                let raw = args.get(i).ok_or(format!("{flag} requires a value"))?;
                let n: u64 = raw
                    .parse()
                    .map_err(|_| format!("{flag} expects a number, got '{raw}'"))?;
                match flag {
                    "--size" => options.size = usize::try_from(n).map_err(|e| e.to_string())?,
                    "--count" => options.count = n,
                    "--depth" => options.depth = n,
                    "--limit-ms" => options.limit = Duration::from_millis(n),
                    _ => options.threads = usize::try_from(n).map_err(|e| e.to_string())?,
                }
            }
            "--path" => {
                i += 1;
                options.path = Some(PathBuf::from(args.get(i).ok_or("--path requires a value")?));
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if scenario.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                scenario = Some(arg.to_string());
            }
        }
        i += 1;
    }

    options.scenario = scenario.ok_or("missing required argument: <scenario>")?;
    if options.size == 0 {
        return Err("--size must be at least 1".to_string());
    }
    Ok(options)
}

fn run(options: &Options) -> anyhow::Result<Value> {
    let config = ExecutorConfig::from_env();
    tracing::info!(scenario = %options.scenario, ?config, "Running scenario");
    let executor = Executor::new(config.clone());

    let result = match options.scenario.as_str() {
        "batch" => batch(&executor, options.size, options.count)?,
        "chain" => chain(&executor, options.depth)?,
        "failure" => failure(&executor)?,
        "offload" => offload(&executor, options.threads, options.path.as_deref())?,
        "timeout" => timeout(&executor, options.threads, options.limit)?,
        other => anyhow::bail!("unknown scenario '{other}'"),
    };

    Ok(json!({
        "scenario": options.scenario,
        "config": config,
        "result": result,
        "executor": executor.stats(),
    }))
}

fn batch(executor: &Executor, size: usize, count: u64) -> anyhow::Result<Value> {
    let batcher = Batcher::from_fn(|inputs: Vec<u64>| {
        tracing::debug!(inputs = inputs.len(), "Bulk squaring");
        inputs.iter().map(|x| x * x).collect()
    })
    .with_predicate(move |inputs| inputs.len() >= size);

    let tasks: Vec<Task<u64>> = (0..count)
        .map(|i| {
            let batcher = batcher.clone();
            executor.spawn(async move { batcher.request(i).await })
        })
        .collect();

    executor.run_available();
    // Leftovers that never reached the seal size.
    batcher.maybe_execute(true);

    let outputs = tasks
        .into_iter()
        .map(|task| sync_wait(executor, task))
        .collect::<Result<Vec<_>, _>>()
        .context("batched request failed")?;

    Ok(json!({ "outputs": outputs, "batches": batcher.stats() }))
}

fn build_chain(executor: &Executor, depth: u64) -> Task<u64> {
    let mut task = executor.create(async { Ok::<_, TaskError>(0) });
    for _ in 0..depth {
        let prev = task;
        task = executor.create(async move { Ok::<_, TaskError>(prev.await? + 1) });
    }
    task
}

fn chain(executor: &Executor, depth: u64) -> anyhow::Result<Value> {
    let root = build_chain(executor, depth);
    let value = sync_wait(executor, root).context("chain failed")?;
    Ok(json!({ "depth": depth, "value": value }))
}

fn failure(executor: &Executor) -> anyhow::Result<Value> {
    let exec = executor.clone();
    let root = executor.create(async move {
        let inner = exec.create(async { Err::<u64, _>(anyhow::anyhow!("sensor offline")) });
        let reading = inner.await?;
        Ok::<_, TaskError>(reading + 1)
    });

    match sync_wait(executor, root) {
        Ok(value) => anyhow::bail!("expected a failure, got {value}"),
        Err(err) => Ok(json!({ "error": err.to_string() })),
    }
}

fn offload(executor: &Executor, threads: usize, path: Option<&Path>) -> anyhow::Result<Value> {
    let pool = WorkerPool::new(threads).context("failed to start worker pool")?;

    let result = match path {
        Some(path) => {
            let task = executor.spawn(pool.read_to_string(path));
            let contents = sync_wait(executor, task)
                .with_context(|| format!("failed to read {}", path.display()))?;
            json!({
                "path": path.display().to_string(),
                "bytes": contents.len(),
                "lines": contents.lines().count(),
            })
        }
        None => {
            let tasks: Vec<Task<u64>> = (1..=threads as u64)
                .map(|n| executor.spawn(pool.offload(move || Ok((1..=n * 1_000_000).sum()))))
                .collect();
            let sums = tasks
                .into_iter()
                .map(|task| sync_wait(executor, task))
                .collect::<Result<Vec<_>, _>>()?;
            json!({ "sums": sums })
        }
    };

    pool.shutdown(Duration::from_secs(1));
    Ok(result)
}

fn timeout(executor: &Executor, threads: usize, limit: Duration) -> anyhow::Result<Value> {
    let pool = Rc::new(WorkerPool::new(threads).context("failed to start worker pool")?);

    let slow = {
        let pool = Rc::clone(&pool);
        executor.create(async move {
            pool.sleep(Duration::from_millis(50)).await?;
            Ok::<_, TaskError>("finished")
        })
    };
    let guarded = {
        let pool = Rc::clone(&pool);
        executor.create(async move { pool.timeout(limit, slow).await })
    };

    let outcome = match sync_wait(executor, guarded) {
        Ok(value) => json!({ "timed_out": false, "value": value }),
        Err(TaskError::TimedOut(after)) => {
            json!({ "timed_out": true, "after_ms": after.as_millis() as u64 })
        }
        Err(err) => return Err(err.into()),
    };
    Ok(json!({ "limit_ms": limit.as_millis() as u64, "outcome": outcome }))
}
