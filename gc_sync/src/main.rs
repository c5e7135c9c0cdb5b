use clap::Parser as ClapParser;
use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use gc_sync::{
    CollectionContext, GcPhase, ObjectSpace, Resolved, Runtime,
    RuntimeCreateInfo, RuntimeSettings, TriggerCause, TriggerGcType,
};

/// Alternating to-space bases for the relocation pass.
const TO_SPACES: [usize; 2] = [0x1000_0000_0000, 0x2000_0000_0000];

#[derive(ClapParser, Debug)]
#[command(
    author,
    version,
    about = "Drives mutators against a stop-the-world relocating collector",
    long_about = None
)]
struct Cli {
    #[arg(
        long,
        help = "Collector worker threads (default: cores - 1, at most 8)"
    )]
    workers: Option<usize>,

    #[arg(
        long,
        default_value_t = 4,
        help = "Mutator threads polling safe points"
    )]
    mutators: usize,

    #[arg(
        long,
        default_value_t = 100_000,
        help = "Object headers in the relocated space"
    )]
    objects: usize,

    #[arg(long, default_value_t = 32_768, help = "Bytes per dispatcher batch")]
    batch: usize,

    #[arg(long, default_value_t = 20, help = "Collections to trigger")]
    cycles: usize,

    #[arg(long, default_value_t = 5, help = "Milliseconds between collections")]
    interval: u64,

    #[arg(long, help = "Start with collection disabled")]
    disable_gc: bool,
}

/// Retires the previous cycle's forwarding, then forwards everything to the
/// other to-space. Between pauses mutators resolve through the read barrier.
fn relocation_phase(space: Arc<ObjectSpace>, batch_bytes: usize) -> GcPhase {
    let mut forwarded_once = false;
    Box::new(move |ctx: &CollectionContext<'_>| {
        let threads = ctx.pool.total_thread_num();
        if forwarded_once {
            space.retire(ctx.pool, threads, batch_bytes);
        }
        let to_base = TO_SPACES[(ctx.cycle % 2) as usize];
        let stats = space.forward(ctx.pool, threads, batch_bytes, to_base);
        forwarded_once = true;
        log::debug!(
            "gc #{}: forwarded {} objects in {} batches to {to_base:#x}",
            ctx.cycle,
            stats.forwarded,
            stats.batches
        );
    })
}

#[derive(Debug, Default)]
struct ReadCounts {
    original: AtomicU64,
    forwarded: AtomicU64,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();
    let cli = Cli::parse();

    let mut settings = RuntimeSettings {
        batch_bytes: cli.batch,
        gc_enabled: !cli.disable_gc,
        ..RuntimeSettings::default()
    };
    if let Some(workers) = cli.workers {
        settings.worker_threads = workers;
    }

    let space = ObjectSpace::new(cli.objects);
    let phase = relocation_phase(Arc::clone(&space), settings.batch_bytes);
    let runtime = match Runtime::new(RuntimeCreateInfo {
        settings,
        phase: Some(phase),
    }) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Invalid settings: {}", err);
            process::exit(2);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(ReadCounts::default());
    let mutators: Vec<_> = (0..cli.mutators)
        .map(|i| {
            let proxy = runtime.new_proxy();
            let space = Arc::clone(&space);
            let stop = Arc::clone(&stop);
            let reads = Arc::clone(&reads);
            thread::Builder::new()
                .name(format!("mutator-{i}"))
                .spawn(move || {
                    proxy.start();
                    let mut seed = 0x9e37_79b9_7f4a_7c15_u64 ^ i as u64;
                    let mut iterations = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        seed = seed
                            .wrapping_mul(6_364_136_223_846_793_005)
                            .wrapping_add(1_442_695_040_888_963_407);
                        let index = (seed >> 33) as usize % space.len().max(1);
                        if let Some(object) = space.get(index) {
                            let counter = match object.read_barrier() {
                                Resolved::Original => &reads.original,
                                Resolved::Forwarded(_) => &reads.forwarded,
                            };
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        iterations += 1;
                        if iterations % 4096 == 0 {
                            let _native = proxy.enter_native();
                            thread::sleep(Duration::from_micros(50));
                        }
                        proxy.safepoint();
                    }
                })
                .expect("spawn mutator")
        })
        .collect();

    let start = Instant::now();
    for i in 0..cli.cycles {
        thread::sleep(Duration::from_millis(cli.interval));
        let gc_type = if i % 4 == 3 {
            TriggerGcType::Full
        } else {
            TriggerGcType::Young
        };
        runtime.heap().collect_garbage(gc_type, TriggerCause::Other);
    }
    stop.store(true, Ordering::Relaxed);
    for handle in mutators {
        if handle.join().is_err() {
            eprintln!("A mutator thread panicked");
        }
    }

    let stats = runtime.stats();
    println!(
        "== gc_sync: {} mutators, {} objects, {:?} ==",
        cli.mutators,
        cli.objects,
        start.elapsed()
    );
    print!("{}", stats);
    println!(
        "reads: {} original, {} forwarded",
        reads.original.load(Ordering::Relaxed),
        reads.forwarded.load(Ordering::Relaxed)
    );
}
