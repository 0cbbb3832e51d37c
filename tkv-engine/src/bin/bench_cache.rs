//! # Local Cache Benchmark
//!
//! Purpose: Measure read, write and sweep throughput of `LocalCache` with a
//! reproducible workload, so changes to the map layout or the sweeper can be
//! compared run over run.
//!
//! Usage: `bench_cache [keys] [ops] [value_size] [threads]`
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Fixed PRNG seeds per thread.
//! 2. **Setup Off the Clock**: Keys and values are built before timing starts.
//! 3. **Manual Sweeps**: The background sweeper is disabled; sweeps are timed explicitly.

use std::env;
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use tkv_engine::{LocalCache, LocalCacheConfig, SweepPolicy};

const DEFAULT_KEY_COUNT: usize = 1 << 16;
const DEFAULT_OP_COUNT: usize = 1_000_000;
const DEFAULT_VALUE_SIZE: usize = 128;
const DEFAULT_THREADS: usize = 4;

struct BenchConfig {
    key_count: usize,
    op_count: usize,
    value_size: usize,
    threads: usize,
}

impl BenchConfig {
    fn from_args() -> Result<Self> {
        let mut args = env::args().skip(1);
        let config = BenchConfig {
            key_count: parse_usize(args.next(), DEFAULT_KEY_COUNT).context("invalid key count")?,
            op_count: parse_usize(args.next(), DEFAULT_OP_COUNT).context("invalid op count")?,
            value_size: parse_usize(args.next(), DEFAULT_VALUE_SIZE).context("invalid value size")?,
            threads: parse_usize(args.next(), DEFAULT_THREADS).context("invalid thread count")?,
        };
        Ok(BenchConfig {
            key_count: config.key_count.max(1),
            threads: config.threads.max(1),
            ..config
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> Result<usize> {
    match value {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(fallback),
    }
}

/// XorShift keeps the key sequence reproducible without pulling in `rand`.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, len: usize) -> usize {
        (self.next_u64() % len as u64) as usize
    }
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops.max(1) as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("bench_cache failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args()?;
    let cache = Arc::new(LocalCache::with_config(LocalCacheConfig {
        auto_sweep: false,
        ..LocalCacheConfig::default()
    }));

    let keys: Arc<Vec<String>> = Arc::new((0..config.key_count).map(|idx| format!("bench:{idx:08}")).collect());
    let value = "x".repeat(config.value_size);

    for key in keys.iter() {
        cache.set(key.clone(), value.clone(), -1, true)?;
    }

    println!(
        "keys={}, ops={}, value_size={}, threads={}",
        config.key_count, config.op_count, config.value_size, config.threads
    );

    let per_thread = config.op_count / config.threads;
    let total = per_thread * config.threads;

    let start = Instant::now();
    run_threads(config.threads, |seed| {
        let cache = Arc::clone(&cache);
        let keys = Arc::clone(&keys);
        move || -> Result<()> {
            let mut rng = XorShift64::new(seed);
            for _ in 0..per_thread {
                let key = &keys[rng.next_index(keys.len())];
                black_box(cache.get::<String>(key)?);
            }
            Ok(())
        }
    })?;
    report("GET", total, start.elapsed());

    let start = Instant::now();
    run_threads(config.threads, |seed| {
        let cache = Arc::clone(&cache);
        let keys = Arc::clone(&keys);
        let value = value.clone();
        move || -> Result<()> {
            let mut rng = XorShift64::new(seed ^ 0x0FED_CBA9_8765_4321);
            for _ in 0..per_thread {
                let key = &keys[rng.next_index(keys.len())];
                cache.set(key.clone(), value.clone(), 1, true)?;
            }
            Ok(())
        }
    })?;
    report("SET", total, start.elapsed());

    // Every TTL written above is one second; sweep as if it has passed.
    let entries = cache.len();
    let start = Instant::now();
    let swept = cache.purge(SweepPolicy::OnlyExpired, Instant::now() + Duration::from_secs(2));
    report("SWEEP", entries, start.elapsed());
    println!("swept: expired={}, shed={}, remaining={}", swept.expired, swept.shed, cache.len());

    Ok(())
}

fn run_threads<B, W>(threads: usize, mut build: B) -> Result<()>
where
    B: FnMut(u64) -> W,
    W: FnOnce() -> Result<()> + Send + 'static,
{
    let handles: Vec<_> = (0..threads)
        .map(|idx| std::thread::spawn(build(0x1234_5678_9ABC_DEF0 ^ idx as u64)))
        .collect();
    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("bench worker panicked"))??;
    }
    Ok(())
}
