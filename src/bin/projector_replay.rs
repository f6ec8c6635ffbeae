//! projector_replay — apply a JSON-lines event file to the projections.
//!
//! Without `--database-url` the events are applied to in-memory tables
//! (a dry run) and the resulting rows are printed. With a database URL the
//! engine resumes from the positions persisted in
//! `<schema>.current_sequences` and writes to PostgreSQL.
//!
//! ```text
//! projector_replay events.jsonl --print-sql
//! DATABASE_URL=postgres://... projector_replay events.jsonl --apply-ddl
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pg_projector::executor::StatementExecutor;
use pg_projector::projection;
use pg_projector::{
    EngineConfig, Event, MemoryExecutor, PgExecutor, ProjectionRegistry, Projector,
    ProjectorError, SequenceTracker, WorkerPool,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "projector_replay", version, about)]
struct Args {
    /// Events, one JSON object per line.
    events: PathBuf,

    /// Engine configuration (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// PostgreSQL connection string. Omit for an in-memory dry run.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Create the projection schema and tables before replaying.
    #[arg(long)]
    apply_ddl: bool,

    /// Print the statements each event reduces to instead of applying them.
    #[arg(long)]
    print_sql: bool,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

async fn read_events(path: &PathBuf) -> Result<Vec<Event>, ProjectorError> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        ProjectorError::InvalidConfig(format!("cannot open {}: {e}", path.display()))
    })?;
    let mut lines = BufReader::new(file).lines();
    let mut events = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ProjectorError::InternalError(e.to_string()))?
    {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).map_err(|e| {
            ProjectorError::InvalidPayload {
                event_type: format!("line {line_no}"),
                reason: e.to_string(),
            }
        })?;
        events.push(event);
    }
    Ok(events)
}

fn print_sql(registry: &ProjectionRegistry, events: &[Event]) -> Result<(), ProjectorError> {
    for event in events {
        println!(
            "-- {} {} seq={}",
            event.event_type,
            event.aggregate_key(),
            event.sequence
        );
        for projection in registry.interested(event) {
            for stmt in projection.reduce(event)? {
                println!("{};", stmt.sql());
                println!("--   args: {}", serde_json::to_string(stmt.args()).unwrap_or_default());
            }
        }
    }
    Ok(())
}

async fn replay(projector: Arc<Projector>, events: Vec<Event>) -> Result<usize, ProjectorError> {
    let pool = WorkerPool::start(Arc::clone(&projector));
    let mut pending = Vec::with_capacity(events.len());
    for event in events {
        pending.push(pool.submit(event).await?);
    }

    let mut failures = 0;
    for p in pending {
        let results = p
            .await
            .map_err(|_| ProjectorError::InternalError("lane dropped an event".into()))?;
        for r in results {
            if let Err(e) = &r.result {
                warn!(projection = %r.projection, error = %e, "event not applied");
                failures += 1;
            }
        }
    }
    pool.shutdown().await?;
    Ok(failures)
}

async fn run(args: Args) -> Result<usize, ProjectorError> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let schema = config.projection_schema.clone();
    let registry = ProjectionRegistry::standard(&schema)?;
    let events = read_events(&args.events).await?;
    info!(events = events.len(), path = %args.events.display(), "events loaded");

    if args.print_sql {
        print_sql(&registry, &events)?;
        return Ok(0);
    }

    match &args.database_url {
        None => {
            let memory = Arc::new(MemoryExecutor::for_registry(&registry, &schema));
            let executor: Arc<dyn StatementExecutor> = memory.clone();
            let projector = Arc::new(Projector::new(registry, executor, config)?);
            let failures = replay(Arc::clone(&projector), events).await?;
            println!(
                "{}",
                serde_json::json!({ "stats": projector.stats(), "tables": memory.snapshot() })
            );
            Ok(failures)
        }
        Some(url) => {
            let (pg, connection) = PgExecutor::connect(url).await?;
            if args.apply_ddl {
                pg.apply_ddl(&projection::ddl(&registry, &schema)).await?;
                info!(schema = %schema, "projection tables created");
            }
            let tracker = Arc::new(SequenceTracker::with_positions(
                pg.load_positions(&schema).await?,
            ));
            let projector = Arc::new(Projector::with_tracker(
                registry,
                Arc::new(pg),
                tracker,
                config,
            )?);
            let failures = replay(Arc::clone(&projector), events).await?;
            println!("{}", serde_json::json!({ "stats": projector.stats() }));
            drop(projector);
            connection.abort();
            Ok(failures)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format);

    match run(args).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failures) => {
            warn!(failures, "replay finished with failures");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, kind = %e.kind(), "replay aborted");
            ExitCode::FAILURE
        }
    }
}
