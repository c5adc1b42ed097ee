extern crate clap;
extern crate vector_rx;

use {
    clap::Parser,
    std::{
        path::PathBuf,
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
        provision::{Provisioner, SeqpacketProvisioner},
        rx_loop::{rx_loop, RxStats, RxWorker},
        BufferPool, TraceLog,
    },
};

#[derive(Parser, Debug)]
#[command(author, version, about = "receive from seqpacket devices", long_about = None)]
struct Opt {
    /// yaml config; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "4")]
    devices: usize,

    #[arg(long)]
    mtu: Option<usize>,

    #[arg(long)]
    buffer_size: Option<usize>,

    /// frames each injector sends per second
    #[arg(long, default_value = "100000")]
    rate: u64,

    /// pin the rx loop; defaults to the last core
    #[arg(long)]
    cpu: Option<usize>,

    #[arg(long)]
    realtime: bool,

    /// trace log records, dumped on exit
    #[arg(long, default_value = "0")]
    trace_records: usize,

    #[arg(long, default_value = "16")]
    trace_budget: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();

    let mut cfg = match &opt.config {
        Some(path) => RxConfig::load(path)?,
        None => RxConfig::default(),
    };
    if let Some(mtu) = opt.mtu {
        cfg.mtu_bytes = mtu;
    }
    if let Some(size) = opt.buffer_size {
        cfg.buffer_size = size;
    }
    if opt.trace_records > 0 {
        cfg.trace.records = opt.trace_records;
        cfg.trace.enabled = true;
        cfg.trace_budget = opt.trace_budget;
    }
    cfg.validate()?;

    let trace = Arc::new(TraceLog::new());
    cfg.apply_trace(&trace)?;

    let cpu = opt.cpu.or_else(|| {
        core_affinity::get_core_ids().and_then(|ids| ids.last().map(|id| id.id))
    });

    let mut worker = RxWorker::new(&cfg, trace.clone())?;
    let mut prov = SeqpacketProvisioner::from_config(&cfg);
    let mut injectors = Vec::new();
    for i in 0..opt.devices {
        let dev = prov.open(&format!("sp{i}"))?;
        injectors.push(prov.injector(dev.ready)?);
        worker.add_device(dev.into_device())?;
    }

    let exit = Arc::new(AtomicBool::new(false));
    {
        let exit = exit.clone();
        ctrlc::set_handler(move || exit.store(true, Ordering::Relaxed))?;
    }

    println!(
        "{} devices, mtu {} over {}-byte buffers, rx on cpu {:?}",
        opt.devices, cfg.mtu_bytes, cfg.buffer_size, cpu
    );

    let sent = Arc::new(AtomicU64::new(0));
    let senders: Vec<_> = injectors
        .into_iter()
        .enumerate()
        .map(|(i, inj)| {
            let exit = exit.clone();
            let sent = sent.clone();
            let mtu = cfg.mtu_bytes.max(64);
            let interval = Duration::from_nanos(1_000_000_000 / opt.rate.max(1));
            thread::spawn(move || {
                let payload: Vec<u8> = (0..mtu).map(|b| b as u8).collect();
                let mut len = 60 + i * 97;
                while !exit.load(Ordering::Relaxed) {
                    len = 60 + (len * 7 + 13) % (mtu - 59);
                    if inj.send(&payload[..len]).is_ok() {
                        sent.fetch_add(1, Ordering::Relaxed);
                    }
                    thread::sleep(interval);
                }
            })
        })
        .collect();

    let stats = Arc::new(RxStats::default());
    let received = Arc::new(AtomicU64::new(0));
    let bytes = Arc::new(AtomicU64::new(0));

    let reporter = {
        let exit = exit.clone();
        let stats = stats.clone();
        let received = received.clone();
        let bytes = bytes.clone();
        let sent = sent.clone();
        thread::spawn(move || {
            let start = Instant::now();
            while !exit.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                let secs = start.elapsed().as_secs_f64();
                println!(
                    "sent {} received {} ({:.0} frames/s, {:.1} MB/s), cycles {}",
                    sent.load(Ordering::Relaxed),
                    received.load(Ordering::Relaxed),
                    received.load(Ordering::Relaxed) as f64 / secs,
                    bytes.load(Ordering::Relaxed) as f64 / secs / 1e6,
                    stats.cycles.load(Ordering::Relaxed),
                );
            }
        })
    };

    let mut graph = |pool: &mut BufferPool, _next: NextNode, heads: &[BufferHandle]| {
        for &h in heads {
            bytes.fetch_add(chain_len(pool, h) as u64, Ordering::Relaxed);
            pool.release_chain(h);
        }
        received.fetch_add(heads.len() as u64, Ordering::Relaxed);
    };
    rx_loop(cpu, opt.realtime, &mut worker, &mut graph, stats, exit)?;

    for s in senders {
        let _ = s.join();
    }
    let _ = reporter.join();

    for d in worker.scheduler.devices() {
        if let Some(c) = worker.scheduler.counters(d.id) {
            println!("{} {}: {:?}", d.id, d.name, c.snapshot());
        }
    }
    println!("pool: {:?}", worker.pool.stats());

    if trace.capacity() > 0 {
        trace.stop();
        println!("{}", TraceLog::render(&trace.dump(None, None)));
    }

    Ok(())
}
