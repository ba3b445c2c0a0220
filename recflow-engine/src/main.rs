//! recflow - write replay tool
//!
//! Reads newline-delimited JSON write requests, runs each through the
//! pipeline engine via the ingress streams and prints one JSON result line
//! per request on stdout.
//!
//! Input lines:
//! ```text
//! {"kind":"entity","id":"s1","data":{"tempo":120,"energy":0.8}}
//! {"kind":"relation","entity_id":"s1","user_id":"u1","data":{"weight":2}}
//! ```
//!
//! Requests enter the ingress in file order, so lines touching the same key
//! apply in that order. Consecutive requests of the same kind run
//! concurrently; a relation line always sees every entity line before it
//! (and vice versa). Exits non-zero if any request failed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use recflow_common::config::{load_config, StorageBackend, TomlConfig};
use recflow_common::events::EventBus;
use recflow_common::logging::init_logging;
use recflow_engine::storage::{MemoryStorage, SqliteStorage, Storage};
use futures::StreamExt;
use recflow_engine::{
    builtin, EngineConfig, EntityWrite, Ingress, IngressConfig, IngressHandle, IngressOutput,
    PipelineEngine, PipelineWrite, PluginRegistry, RelationWrite,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info};

/// Command-line arguments for recflow
#[derive(Parser, Debug)]
#[command(name = "recflow")]
#[command(about = "Replay entity and relation writes through the recflow pipelines")]
#[command(version)]
struct Args {
    /// Configuration file (overrides RECFLOW_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the configured storage backend)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Entity type the writes belong to
    #[arg(short = 't', long, default_value = "item")]
    entity_type: String,

    /// NDJSON input file (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,
}

/// One input line
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ReplayRecord {
    Entity(EntityWrite),
    Relation(RelationWrite),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.logging).context("Failed to initialize logging")?;

    info!("Starting recflow v{}", env!("CARGO_PKG_VERSION"));
    info!(entity_type = %args.entity_type, "Replaying writes");

    let storage = open_storage(&config, args.database.clone()).await?;

    let mut registry = PluginRegistry::new();
    builtin::register_numeric_plugins(&mut registry, &args.entity_type);
    registry
        .validate()
        .context("Plugin registry is incomplete")?;

    let event_bus = EventBus::new(256);
    spawn_event_logger(&event_bus);

    let engine = Arc::new(
        PipelineEngine::new(storage, registry, EngineConfig::from(&config.engine))
            .with_events(event_bus),
    );

    let ingress_config = IngressConfig::from(&config.ingress);
    let mut entities = Lane::new(
        "entity",
        Ingress::<EntityWrite>::spawn(Arc::clone(&engine), args.entity_type.clone(), ingress_config),
    );
    let mut relations = Lane::new(
        "relation",
        Ingress::<RelationWrite>::spawn(Arc::clone(&engine), args.entity_type.clone(), ingress_config),
    );

    let summary = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            replay(file, &mut entities, &mut relations, ingress_config).await?
        }
        None => replay(tokio::io::stdin(), &mut entities, &mut relations, ingress_config).await?,
    };

    info!(
        total = summary.total,
        failed = summary.failed,
        "Replay complete"
    );

    if summary.failed > 0 {
        anyhow::bail!("{} of {} writes failed", summary.failed, summary.total);
    }
    Ok(())
}

async fn open_storage(config: &TomlConfig, database: Option<PathBuf>) -> Result<Arc<dyn Storage>> {
    let sqlite_path = match (database, config.storage.backend) {
        (Some(path), _) => Some(path),
        (None, StorageBackend::Sqlite) => Some(
            config
                .storage
                .database_path
                .clone()
                .context("storage.database_path is required for the sqlite backend")?,
        ),
        (None, StorageBackend::Memory) => None,
    };

    match sqlite_path {
        Some(path) => {
            info!("Database: {}", path.display());
            let storage = SqliteStorage::open(&path)
                .await
                .with_context(|| format!("Failed to open database {}", path.display()))?;
            Ok(Arc::new(storage))
        }
        None => {
            info!("Using in-memory storage");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

fn spawn_event_logger(event_bus: &EventBus) {
    let mut events = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(event = ?event, "Pipeline event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event logger lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[derive(Debug, Default)]
struct Summary {
    total: usize,
    failed: usize,
}

/// One ingress plus the tickets still waiting for a result
struct Lane<W: PipelineWrite> {
    kind: &'static str,
    handle: IngressHandle<W>,
    output: IngressOutput<W::Output>,
    /// ticket -> input line number
    pending: HashMap<u64, usize>,
}

impl<W> Lane<W>
where
    W: PipelineWrite,
    W::Output: Serialize,
{
    fn new(kind: &'static str, ingress: Ingress<W>) -> Self {
        let (handle, output) = ingress.split();
        Self {
            kind,
            handle,
            output,
            pending: HashMap::new(),
        }
    }

    /// Enqueue in input order; the Key Serializer keeps that order per key
    async fn submit(&mut self, write: W, line_no: usize) -> Result<()> {
        let ticket = self
            .handle
            .submit(write)
            .await
            .with_context(|| format!("Failed to submit line {}", line_no))?;
        self.pending.insert(ticket, line_no);
        Ok(())
    }

    async fn settle_one(&mut self, summary: &mut Summary) -> Result<()> {
        let completed = self
            .output
            .next()
            .await
            .with_context(|| format!("{} ingress stopped early", self.kind))?;
        let line_no = self
            .pending
            .remove(&completed.ticket)
            .with_context(|| format!("Unexpected ticket {}", completed.ticket))?;

        let mut line = serde_json::json!({"line": line_no, "kind": self.kind});
        let ok = completed.result.is_ok();
        line["ok"] = serde_json::Value::Bool(ok);
        match completed.result {
            Ok(record) => {
                line[self.kind] =
                    serde_json::to_value(record).context("Failed to encode result")?
            }
            Err(e) => line["error"] = serde_json::Value::String(e.to_string()),
        }
        print_line(&line, ok, summary);
        Ok(())
    }

    async fn settle_all(&mut self, summary: &mut Summary) -> Result<()> {
        while !self.pending.is_empty() {
            self.settle_one(summary).await?;
        }
        Ok(())
    }
}

async fn replay<R>(
    input: R,
    entities: &mut Lane<EntityWrite>,
    relations: &mut Lane<RelationWrite>,
    config: IngressConfig,
) -> Result<Summary>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut summary = Summary::default();
    // Bounded so a full output buffer never blocks the next submit
    let max_pending = config.buffer_size + config.concurrency;
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        summary.total += 1;

        match serde_json::from_str::<ReplayRecord>(&line) {
            Ok(ReplayRecord::Entity(write)) => {
                // Barrier: every earlier relation line finishes first
                relations.settle_all(&mut summary).await?;
                if entities.pending.len() >= max_pending {
                    entities.settle_one(&mut summary).await?;
                }
                entities.submit(write, line_no).await?;
            }
            Ok(ReplayRecord::Relation(write)) => {
                entities.settle_all(&mut summary).await?;
                if relations.pending.len() >= max_pending {
                    relations.settle_one(&mut summary).await?;
                }
                relations.submit(write, line_no).await?;
            }
            Err(e) => {
                let line = serde_json::json!({
                    "line": line_no,
                    "ok": false,
                    "error": format!("invalid request: {}", e),
                });
                print_line(&line, false, &mut summary);
            }
        }
    }

    entities.settle_all(&mut summary).await?;
    relations.settle_all(&mut summary).await?;
    Ok(summary)
}

fn print_line(line: &serde_json::Value, ok: bool, summary: &mut Summary) {
    if !ok {
        summary.failed += 1;
    }
    println!("{}", line);
}
