mod workload;

use std::{fs::File, io::BufWriter, path::PathBuf, sync::Arc, thread, time::Duration};

use rand::{rngs::StdRng, SeedableRng};
use structopt::StructOpt;
use trace_agent::{Agent, AgentConfig, StreamSink};

use self::workload::{Program, Stats, Worker};

/// Runs random, balanced call trees through a real agent.
#[derive(StructOpt)]
struct Args {
    /// Collector address, `host:port`.
    #[structopt(long, env = "TRACE_COLLECTOR")]
    collector: Option<String>,
    /// Raw metapackets are written here when no collector is given.
    #[structopt(long)]
    capture: Option<PathBuf>,
    /// Types of the generated program, for `trace-collector --types`.
    #[structopt(long)]
    types: Option<PathBuf>,
    #[structopt(long, default_value = "4")]
    threads: u32,
    #[structopt(long, default_value = "64")]
    trees: usize,
    #[structopt(long, default_value = "6")]
    max_depth: usize,
    #[structopt(long, default_value = "8")]
    steps: usize,
    #[structopt(long)]
    seed: Option<u64>,
    /// Gives the collector time to push monitoring modes.
    #[structopt(long, default_value = "0")]
    delay_ms: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let Args {
        collector,
        capture,
        types,
        threads,
        trees,
        max_depth,
        steps,
        seed,
        delay_ms,
    } = Args::from_args();

    let defs = workload::types(steps);
    if let Some(path) = types {
        serde_json::to_writer_pretty(File::create(path)?, &defs)?;
    }
    let program = Program::new(&defs)?;

    let config = AgentConfig::from_env()?;
    let agent = match (collector, capture) {
        (Some(addr), _) => {
            log::info!("connect to {addr}");
            Agent::connect(addr.as_str(), config)?
        }
        (None, Some(path)) => {
            let file = BufWriter::new(File::create(path)?);
            let sink = Arc::new(StreamSink::new(file, config.chunk_size));
            Agent::new(config, sink)?
        }
        (None, None) => anyhow::bail!("either --collector or --capture is required"),
    };
    if delay_ms != 0 {
        thread::sleep(Duration::from_millis(delay_ms));
    }

    let seed = seed.unwrap_or_else(rand::random);
    log::info!("seed {seed}, {threads} threads, {trees} trees each");

    let mut total = Stats::default();
    thread::scope(|s| {
        let (agent, program) = (&agent, &program);
        let handles = (0..threads)
            .map(|index| {
                let rng = StdRng::seed_from_u64(seed.wrapping_add(u64::from(index)));
                s.spawn(move || Worker::new(agent, program, index + 1, rng, max_depth).run(trees))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            match handle.join() {
                Ok(stats) => total.add(&stats),
                Err(_) => log::error!("worker thread panic, this is a bug, must not happen"),
            }
        }
    });

    agent.flush()?;
    agent.end()?;
    log::info!("done: {total}");
    Ok(())
}
