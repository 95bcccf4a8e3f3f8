use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use entity_store::{default_db_path, EntityDb};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sync_engine::{
    ActorId, ActorProfile, ActorRuntime, CanonicalStore, ConflictId, EntityId, EntityKind,
    EntityView, LocalTransport, MemoryStore, Payload, SyncConfig, SyncCoordinator, UiEvent,
    VectorClock,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fieldsync-cli")]
#[command(about = "FieldSync CLI - Inspect and exercise the offline sync engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration (JSON). Defaults apply when the file is missing.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker, an admin and a client against one coordinator
    Simulate {
        /// Entity database path
        #[arg(long)]
        db: Option<PathBuf>,

        /// Keep canonical state in memory instead of the database
        #[arg(long)]
        memory: bool,

        /// Random delivery delay per request, in milliseconds
        #[arg(long)]
        jitter_ms: Option<u64>,

        /// Entity to edit (a fresh task id by default)
        #[arg(long)]
        entity: Option<String>,
    },

    /// Show canonical entity state
    Inspect {
        #[arg(long)]
        db: Option<PathBuf>,

        /// Only this entity
        #[arg(short, long)]
        entity: Option<String>,
    },

    /// List pending conflicts awaiting review
    Conflicts {
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Clear a reviewed conflict, keeping the merged value
    AckConflict {
        #[arg(long)]
        db: Option<PathBuf>,

        #[arg(short, long)]
        entity: String,

        /// Conflict id as printed by `conflicts`
        conflict: String,
    },

    /// Show the archived mutations of an entity
    History {
        #[arg(long)]
        db: Option<PathBuf>,

        #[arg(short, long)]
        entity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fieldsync_cli={0},sync_engine={0},entity_store={0}", default_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Commands::Simulate {
            db,
            memory,
            jitter_ms,
            entity,
        } => simulate_command(config, db, memory, jitter_ms, entity).await,
        Commands::Inspect { db, entity } => inspect_command(db, entity).await,
        Commands::Conflicts { db } => conflicts_command(db).await,
        Commands::AckConflict {
            db,
            entity,
            conflict,
        } => ack_conflict_command(config, db, entity, conflict).await,
        Commands::History { db, entity } => history_command(db, entity).await,
    }
}

fn open_db(path: Option<PathBuf>) -> Result<Arc<EntityDb>> {
    let path = path.unwrap_or_else(default_db_path);
    let db = EntityDb::open_or_create(&path)
        .with_context(|| format!("failed to open entity store at {}", path.display()))?;
    Ok(Arc::new(db))
}

fn fields(pairs: &[(&str, Value)]) -> Payload {
    pairs
        .iter()
        .map(|(field, value)| (field.to_string(), value.clone()))
        .collect()
}

#[derive(Serialize)]
struct ActorReport {
    actor: ActorId,
    clock: VectorClock,
    entities: Vec<EntityView>,
    failed: usize,
}

async fn simulate_command(
    config: SyncConfig,
    db: Option<PathBuf>,
    memory: bool,
    jitter_ms: Option<u64>,
    entity: Option<String>,
) -> Result<()> {
    let store: Arc<dyn CanonicalStore> = if memory {
        Arc::new(MemoryStore::new())
    } else {
        open_db(db)?
    };

    let coordinator = Arc::new(SyncCoordinator::new(store, &config));
    coordinator.restore_server_clock().await?;
    coordinator.register_actor(ActorProfile::worker("worker-1"));
    coordinator.register_actor(ActorProfile::admin("admin-1"));
    coordinator.register_actor(ActorProfile::client("client-1"));

    let transport = || {
        let transport = LocalTransport::new(Arc::clone(&coordinator));
        match jitter_ms {
            Some(ms) => transport.with_jitter(Duration::from_millis(ms)),
            None => transport,
        }
    };

    let (worker, worker_events) =
        ActorRuntime::start(ActorId::from("worker-1"), transport(), &config).await?;
    let (admin, admin_events) =
        ActorRuntime::start(ActorId::from("admin-1"), transport(), &config).await?;
    let (client, client_events) =
        ActorRuntime::start(ActorId::from("client-1"), transport(), &config).await?;

    let entity = entity.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("task-{}", &id[..8])
    });
    info!("simulating edits on {}", entity);

    // The worker is in the field without coverage while the admin reassigns the task.
    worker.set_online(false);
    worker
        .edit(
            entity.as_str(),
            EntityKind::Task,
            fields(&[("status", json!("done")), ("notes", json!("replaced pump seal"))]),
        )
        .await?;
    admin
        .edit(
            entity.as_str(),
            EntityKind::Task,
            fields(&[("status", json!("cancelled")), ("priority", json!("high"))]),
        )
        .await?;
    admin.settled().await;

    worker.set_online(true);
    worker.settled().await;

    client
        .edit(entity.as_str(), EntityKind::Task, fields(&[("status", json!("reopened"))]))
        .await?;
    client.settled().await;

    // Let the last pushes reach every listener.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut reports = Vec::new();
    for runtime in [&worker, &admin, &client] {
        reports.push(ActorReport {
            actor: runtime.actor_id().clone(),
            clock: runtime.clock(),
            entities: runtime.entities(),
            failed: runtime.failed_entries().len(),
        });
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);

    for (runtime, events) in [(&worker, worker_events), (&admin, admin_events), (&client, client_events)] {
        log_events(runtime.actor_id(), events);
    }

    let conflicts = coordinator.pending_conflicts(&EntityId::new(entity.as_str())).await?;
    println!("\n{} pending conflict(s) on {}", conflicts.len(), entity);
    for conflict in &conflicts {
        print_conflict(&entity, conflict);
    }

    worker.shutdown().await;
    admin.shutdown().await;
    client.shutdown().await;
    Ok(())
}

fn log_events(actor: &ActorId, mut events: mpsc::UnboundedReceiver<UiEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            UiEvent::MutationRejected { entry, reason } => {
                warn!(actor = %entry.record.actor_id, mutation = %entry.id(), "rejected: {}", reason)
            }
            UiEvent::MutationFailed { entry } => {
                warn!(actor = %entry.record.actor_id, mutation = %entry.id(), "gave up after {} attempts", entry.attempts)
            }
            UiEvent::ConflictsChanged { entity_id, conflicts } => {
                info!(%actor, entity = %entity_id, open = conflicts.len(), "dashboard conflicts changed")
            }
            other => tracing::debug!(%actor, ?other, "ui event"),
        }
    }
}

fn print_conflict(entity: &str, conflict: &sync_engine::PendingConflict) {
    println!("  {} {}.{}", conflict.id, entity, conflict.field);
    for (index, write) in conflict.candidates.iter().enumerate() {
        let marker = if index == 0 { "*" } else { " " };
        println!(
            "    {} {} = {} (at {})",
            marker,
            write.actor_id,
            write.value,
            write.produced_at.format("%Y-%m-%d %H:%M:%S%.3f")
        );
    }
}

async fn inspect_command(db: Option<PathBuf>, entity: Option<String>) -> Result<()> {
    let db = open_db(db)?;

    let versions = match entity {
        Some(id) => db
            .load_version(&id)?
            .map(|version| vec![version])
            .ok_or_else(|| anyhow!("entity {} not found", id))?,
        None => db.list_versions()?,
    };

    if versions.is_empty() {
        println!("No entities stored");
        return Ok(());
    }

    for version in versions {
        println!(
            "{} [{}] {:?} clock={} conflicts={}",
            version.entity_id,
            version.entity_kind,
            version.state(),
            version.current_clock,
            version.pending_conflicts.len()
        );
        println!("{}", serde_json::to_string_pretty(&version.current_payload)?);
    }

    Ok(())
}

async fn conflicts_command(db: Option<PathBuf>) -> Result<()> {
    let db = open_db(db)?;
    let contested = db.contested_ids()?;

    if contested.is_empty() {
        println!("No pending conflicts");
        return Ok(());
    }

    for entity_id in contested {
        let Some(version) = db.load_version(entity_id.as_str())? else {
            continue;
        };
        for conflict in &version.pending_conflicts {
            print_conflict(entity_id.as_str(), conflict);
        }
    }

    Ok(())
}

async fn ack_conflict_command(
    config: SyncConfig,
    db: Option<PathBuf>,
    entity: String,
    conflict: String,
) -> Result<()> {
    let conflict_id = uuid::Uuid::parse_str(&conflict)
        .map(ConflictId)
        .with_context(|| format!("invalid conflict id {}", conflict))?;

    let coordinator = SyncCoordinator::new(open_db(db)?, &config);
    let cleared = coordinator
        .acknowledge_conflict(&EntityId::new(entity.as_str()), conflict_id)
        .await?;

    println!(
        "Acknowledged conflict on {}.{}, keeping {}",
        entity,
        cleared.field,
        cleared.winner().map(|write| write.value.to_string()).unwrap_or_default()
    );
    Ok(())
}

async fn history_command(db: Option<PathBuf>, entity: String) -> Result<()> {
    let db = open_db(db)?;
    let history = db.load_archive(&entity)?;

    if history.is_empty() {
        println!("No archived mutations for {}", entity);
        return Ok(());
    }

    for entry in history {
        println!(
            "{} {:<12} {} by {} clock={} {}",
            entry.archived_at.format("%Y-%m-%d %H:%M:%S"),
            entry.outcome.as_str(),
            entry.record.id,
            entry.record.actor_id,
            entry.record.clock,
            serde_json::to_string(&entry.record.payload)?
        );
    }

    Ok(())
}
