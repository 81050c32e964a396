use crossbeam_utils::thread::scope;
use rand::prelude::*;
use std::cmp::max;
use std::path::Path;
use std::sync::{mpsc, Arc, Barrier};
use std::thread::available_parallelism;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

use concurrent_bst::config::bench::{setup, Config, Op, Perf, DS};
use concurrent_bst::{ConcurrentSet, FineGrainedBst, IdentityKey, LockFreeBst};

#[cfg(target_os = "linux")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config, output) = setup(
        Path::new(file!())
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
            .unwrap(),
    );
    info!(%config, "starting");

    let prefill_threads = available_parallelism().map(|v| v.get()).unwrap_or(1);
    let perf = match config.ds {
        DS::FineGrained => {
            let set = &FineGrainedBst::with_key_fn(IdentityKey);
            bench_set(&config, set, prefill_threads, || 0)
        }
        DS::LockFree => {
            let capacity = max(config.threads, prefill_threads);
            let set = &LockFreeBst::with_key_fn_and_threads(IdentityKey, capacity);
            bench_set(&config, set, prefill_threads, || set.domain().garbage())
        }
    };
    output.write_record(&config, &perf);
    info!(%perf, "finished");
}

/// Inserts `config.prefill` distinct random keys, split among `threads` threads.
fn prefill<S: ConcurrentSet<u64> + Send + Sync>(config: &Config, set: &S, threads: usize) {
    let start = Instant::now();
    scope(|s| {
        for t in 0..threads {
            s.spawn(move |_| {
                let mut handle = set.handle();
                let rng = &mut rand::thread_rng();
                let count = config.prefill / threads + usize::from(t < config.prefill % threads);
                let mut inserted = 0;
                while inserted < count {
                    if set.insert(&mut handle, config.key_dist.sample(rng)) {
                        inserted += 1;
                    }
                }
            });
        }
    })
    .unwrap();
    info!(
        threads,
        elements = set.len(),
        elapsed = ?start.elapsed(),
        "prefilled"
    );
}

fn bench_set<S, G>(config: &Config, set: &S, prefill_threads: usize, garbage: G) -> Perf
where
    S: ConcurrentSet<u64> + Send + Sync,
    G: Fn() -> usize + Sync,
{
    prefill(config, set, prefill_threads);

    let aux_thread = usize::from(config.sampling);
    let barrier = &Arc::new(Barrier::new(config.threads + aux_thread));
    let (ops_sender, ops_receiver) = mpsc::channel();
    let (mem_sender, mem_receiver) = mpsc::channel();
    let garbage = &garbage;

    scope(|s| {
        // sampling thread
        if config.sampling {
            let mem_sender = mem_sender.clone();
            s.spawn(move |_| {
                let mut samples = 0usize;
                let mut acc = 0usize;
                let mut peak = 0usize;
                let mut garb_acc = 0usize;
                let mut garb_peak = 0usize;
                barrier.clone().wait();

                let start = Instant::now();
                let mut next_sampling = start + config.sampling_period;
                while start.elapsed() < config.duration {
                    let now = Instant::now();
                    if now > next_sampling {
                        let allocated = config.mem_sampler.sample();
                        samples += 1;

                        acc += allocated;
                        peak = max(peak, allocated);

                        let garbages = garbage();
                        garb_acc += garbages;
                        garb_peak = max(garb_peak, garbages);

                        next_sampling = now + config.sampling_period;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }

                let samples = max(samples, 1);
                mem_sender
                    .send((peak, acc / samples, garb_peak, garb_acc / samples))
                    .unwrap();
            });
        } else {
            mem_sender.send((0, 0, 0, 0)).unwrap();
        }

        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let mut rng = &mut rand::thread_rng();
                let mut handle = set.handle();
                barrier.clone().wait();
                let start = Instant::now();

                while start.elapsed() < config.duration {
                    let key = config.key_dist.sample(rng);
                    match Op::OPS[config.op_dist.sample(&mut rng)] {
                        Op::Get => {
                            set.find(&mut handle, &key);
                        }
                        Op::Insert => {
                            set.insert(&mut handle, key);
                        }
                        Op::Remove => {
                            set.remove(&mut handle, &key);
                        }
                    }
                    ops += 1;
                }

                ops_sender.send(ops).unwrap();
            });
        }
    })
    .unwrap();

    let mut ops = 0;
    for _ in 0..config.threads {
        let local_ops = ops_receiver.recv().unwrap();
        ops += local_ops;
    }
    let ops_per_sec = ops / config.interval;
    let (peak_mem, avg_mem, peak_garb, avg_garb) = mem_receiver.recv().unwrap();
    Perf {
        ops_per_sec,
        peak_mem,
        avg_mem,
        peak_garb,
        avg_garb,
    }
}
