extern crate clap;
extern crate vector_rx;

use {
    clap::Parser,
    std::{
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    },
    vector_rx::{
        buffer::BufferHandle,
        chain::chain_len,
        config::RxConfig,
        device::NextNode,
        provision::{Provisioner, RingProvisioner},
        rx_loop::{rx_loop, RxStats, RxWorker},
        BufferPool, TraceLog,
    },
};

#[derive(Parser, Debug)]
#[command(author, version, about = "receive from shared-memory slot rings", long_about = None)]
struct Opt {
    /// sub-rings on the device, one producer thread each
    #[arg(short, long, default_value = "2")]
    rings: usize,

    #[arg(long, default_value = "1024")]
    slots: u32,

    #[arg(long, default_value = "2048")]
    slot_size: u16,

    #[arg(long, default_value = "4096")]
    pool_buffers: usize,

    /// frames pushed per producer burst
    #[arg(long, default_value = "32")]
    burst: usize,

    #[arg(long, default_value = "1")]
    producer_cpu: usize,

    #[arg(long, default_value = "2")]
    cpu: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();
    if opt.slot_size < 64 {
        return Err("slot size must be at least 64 bytes".into());
    }

    let mut cfg = RxConfig::default();
    cfg.pool_buffers = opt.pool_buffers;
    cfg.ring.rings = opt.rings;
    cfg.ring.slots = opt.slots;
    cfg.ring.slot_size = opt.slot_size;
    cfg.validate()?;

    let mut worker = RxWorker::new(&cfg, Arc::new(TraceLog::new()))?;
    let mut prov = RingProvisioner::from_config(&cfg);
    let dev = prov.open("ring0")?;
    let producers = prov.take_producers(dev.ready)?;
    let id = worker.add_device(dev.into_device())?;

    let exit = Arc::new(AtomicBool::new(false));
    {
        let exit = exit.clone();
        ctrlc::set_handler(move || exit.store(true, Ordering::Relaxed))?;
    }

    println!(
        "{} rings x {} slots of {} bytes, rx on cpu {}",
        opt.rings, opt.slots, opt.slot_size, opt.cpu
    );

    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    let pushed = Arc::new(AtomicU64::new(0));
    let full = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = producers
        .into_iter()
        .enumerate()
        .map(|(i, mut producer)| {
            let exit = exit.clone();
            let pushed = pushed.clone();
            let full = full.clone();
            let core = core_ids.get(opt.producer_cpu + i).copied();
            let burst = opt.burst;
            let max_len = usize::from(opt.slot_size);
            thread::spawn(move || {
                if let Some(core) = core {
                    core_affinity::set_for_current(core);
                }
                let payload: Vec<u8> = (0..max_len).map(|b| (b ^ i) as u8).collect();
                let mut len = 64;
                while !exit.load(Ordering::Relaxed) {
                    let mut n = 0;
                    for _ in 0..burst {
                        len = 64 + (len * 5 + 11) % (max_len - 63);
                        if !producer.push(&payload[..len]) {
                            full.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        n += 1;
                    }
                    if n > 0 {
                        pushed.fetch_add(n, Ordering::Relaxed);
                        let _ = producer.notify();
                    } else {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let stats = Arc::new(RxStats::default());
    let bytes = Arc::new(AtomicU64::new(0));
    let reporter = {
        let exit = exit.clone();
        let stats = stats.clone();
        let bytes = bytes.clone();
        let pushed = pushed.clone();
        thread::spawn(move || {
            let start = Instant::now();
            while !exit.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                let secs = start.elapsed().as_secs_f64();
                println!(
                    "pushed {} ring-full {} frames {} ({:.0}/s, {:.1} MB/s)",
                    pushed.load(Ordering::Relaxed),
                    full.load(Ordering::Relaxed),
                    stats.frames.load(Ordering::Relaxed),
                    stats.frames.load(Ordering::Relaxed) as f64 / secs,
                    bytes.load(Ordering::Relaxed) as f64 / secs / 1e6,
                );
            }
        })
    };

    let mut graph = |pool: &mut BufferPool, _next: NextNode, heads: &[BufferHandle]| {
        for &h in heads {
            bytes.fetch_add(chain_len(pool, h) as u64, Ordering::Relaxed);
            pool.release_chain(h);
        }
    };
    rx_loop(Some(opt.cpu), false, &mut worker, &mut graph, stats, exit)?;

    for h in handles {
        let _ = h.join();
    }
    let _ = reporter.join();

    if let Some(c) = worker.scheduler.counters(id) {
        println!("{id}: {:?}", c.snapshot());
    }
    println!("pool: {:?}", worker.pool.stats());

    Ok(())
}
