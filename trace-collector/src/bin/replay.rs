use std::{
    fs::File,
    io::{self, Read, Write},
    path::PathBuf,
};

use structopt::StructOpt;
use trace_collector::{
    CollectorConfig, Cx, JsonStore, ScopeFilter, ScopeGraph, Session, StructureCatalog, TypeDef,
};

/// Decodes a capture file, the raw metapackets a producer wrote.
#[derive(StructOpt)]
struct Args {
    #[structopt(long)]
    input: PathBuf,
    /// Trace records as JSON lines, stdout if not given.
    #[structopt(long)]
    output: Option<PathBuf>,
    /// JSON array of types the producer had loaded.
    #[structopt(long)]
    types: Option<PathBuf>,
    #[structopt(long, default_value = "")]
    scope: ScopeFilter,
    #[structopt(long, default_value = "java.lang.Object")]
    root_type: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let Args {
        input,
        output,
        types,
        scope,
        root_type,
    } = Args::from_args();
    let config = CollectorConfig {
        root_type,
        scope,
        ..CollectorConfig::default()
    };
    config.validate()?;

    let mut catalog = StructureCatalog::default();
    let mut graph = ScopeGraph::new(&mut catalog, &config.root_type, config.scope.clone());
    if let Some(path) = types {
        let defs = serde_json::from_reader::<_, Vec<TypeDef>>(File::open(path)?)?;
        for def in &defs {
            graph.load_type(&mut catalog, def)?;
        }
        log::info!("loaded {} types, {} mode changes", defs.len(), graph.drain_changes().len());
    }

    let output: Box<dyn Write> = match &output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut store = JsonStore::new(output);
    let mut session = Session::new(1, input.display().to_string(), config.max_packet_size);
    let mut cx = Cx {
        catalog: &mut catalog,
        store: &mut store,
    };
    session.start(&mut cx)?;

    let mut file = File::open(&input)?;
    let mut buf = vec![0; config.read_buffer];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if let Err(err) = session.on_data(&buf[..n], &mut cx) {
            log::error!("{err}");
            session.finish(&mut cx).ok();
            return Err(err.into());
        }
    }
    let stats = session.finish(&mut cx)?;
    log::info!("{} records, {stats}", store.written());
    Ok(())
}
