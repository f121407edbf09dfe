use std::{
    fs::File,
    io::{self, Write},
    net::TcpListener,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
};

use structopt::StructOpt;
use trace_collector::{
    spawn_acceptor, CollectorConfig, Input, JsonStore, Receiver, ScopeFilter, TypeDef,
};

#[derive(StructOpt)]
struct Args {
    #[structopt(long, env = "TRACE_PORT", default_value = "8457")]
    port: u16,
    /// Trace records as JSON lines, stdout if not given.
    #[structopt(long, env = "TRACE_OUTPUT")]
    output: Option<PathBuf>,
    #[structopt(long, env = "TRACE_SCOPE", default_value = "")]
    scope: ScopeFilter,
    #[structopt(long, env = "TRACE_ROOT_TYPE", default_value = "java.lang.Object")]
    root_type: String,
    /// JSON array of types loaded before any producer connects.
    #[structopt(long)]
    types: Option<PathBuf>,
    /// Types and units with their final modes are written here on exit.
    #[structopt(long)]
    catalog: Option<PathBuf>,
}

fn init_logger() {
    env_logger::Builder::new()
        .format(|buf, record| {
            use std::time::SystemTime;
            use time::OffsetDateTime;

            let (hour, minute, second, micro) = OffsetDateTime::from(SystemTime::now())
                .time()
                .as_hms_micro();
            writeln!(
                buf,
                "{hour:02}:{minute:02}:{second:02}.{micro:06} [{}] {}",
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logger();

    let Args {
        port,
        output,
        scope,
        root_type,
        types,
        catalog,
    } = Args::from_args();

    let config = CollectorConfig {
        root_type,
        scope,
        ..CollectorConfig::default()
    };
    let output: Box<dyn Write + Send> = match &output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };

    let (tx, rx) = mpsc::channel();
    if let Some(path) = types {
        let defs = serde_json::from_reader::<_, Vec<TypeDef>>(File::open(path)?)?;
        log::info!("load {} types", defs.len());
        for def in defs {
            tx.send(Input::LoadType(def))
                .map_err(|_| anyhow::anyhow!("receiver input is closed"))?;
        }
    }
    let mut receiver = Receiver::new(config, Box::new(JsonStore::new(output)), rx)?
        .with_observer(|session, result| match result {
            Ok(stats) => log::info!("session {} from {}: {stats}", session.id(), session.peer()),
            Err(err) => log::error!("session {} from {}: {err}", session.id(), session.peer()),
        });

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        let user_handler = move || {
            log::info!("ctrlc");
            running.store(false, Ordering::SeqCst);
        };
        ctrlc::set_handler(user_handler)?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))?;
    log::info!("listen on {}", listener.local_addr()?);
    let acceptor = spawn_acceptor(listener, tx, running.clone())?;

    let receiver_thread = thread::Builder::new()
        .name("trace-receiver".to_owned())
        .spawn(move || {
            receiver.run(&running);
            receiver
        })?;
    let receiver = match receiver_thread.join() {
        Ok(v) => v,
        Err(_) => anyhow::bail!("receiver thread panic, this is a bug, must not happen"),
    };
    if acceptor.join().is_err() {
        log::error!("acceptor thread panic, this is a bug, must not happen");
    }

    if let Some(path) = catalog {
        let catalog = receiver.catalog();
        let dump = serde_json::json!({
            "types": catalog.types().filter(|t| t.loaded).collect::<Vec<_>>(),
            "units": catalog.units().collect::<Vec<_>>(),
        });
        serde_json::to_writer_pretty(File::create(path)?, &dump)?;
    }
    log::info!("terminated");
    Ok(())
}
