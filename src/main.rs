use anyhow::{Context, Result};
use clap::Parser;
use flowaudit::cli::{Cli, OutputFormat};
use flowaudit::dispatcher::AuditDispatcher;
use flowaudit::modules::{ModuleMap, ModuleResolver, NoModules};
use flowaudit::records::{JsonLinesWriter, RecordWriter, TracingWriter};
use flowaudit::replay::{load_script, Replayer};
use std::fs::File;
use std::io::{self, BufWriter};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_writer(args: &Cli) -> Result<Box<dyn RecordWriter>> {
    match (args.format, &args.output) {
        (OutputFormat::Log, _) => Ok(Box::new(TracingWriter)),
        (OutputFormat::Json, Some(path)) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Ok(Box::new(JsonLinesWriter::new(BufWriter::new(file))))
        }
        (OutputFormat::Json, None) => Ok(Box::new(JsonLinesWriter::new(io::stdout()))),
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let options = args.audit_options()?;
    let resolver: Arc<dyn ModuleResolver> = match &args.modules {
        Some(path) => Arc::new(ModuleMap::from_file(path)?),
        None => Arc::new(NoModules),
    };
    let events = load_script(&args.script)?;
    let writer = open_writer(&args)?;

    let mut replay = Replayer::new(AuditDispatcher::new(options, resolver, writer));
    replay.run(events)?;
    let stats = replay.finish();

    if args.summary {
        stats.print_summary();
    }

    Ok(())
}
