use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sea_orm::DatabaseConnection;
use sea_orm_migration::MigratorTrait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use commerce_sync::config::AppConfig;
use commerce_sync::database::connection::establish_connection;
use commerce_sync::database::migrate::{migrate_database, MigrateDirection};
use commerce_sync::database::migrations::Migrator;
use commerce_sync::jobs::{
    JobQueue, JobService, JobStore, LocalOutputStorage, Submission, SyncPayload, SyncRequest,
    WebhookPayload,
};
use commerce_sync::services::{
    relational_schema, MappingValidatorService, SchemaCacheService, SchemaGraphService,
};
use commerce_sync::sync::{GraphqlRecordSource, SyncJobHandler};
use commerce_sync::writer::DatabaseWriter;

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    #[clap(short, long, global = true)]
    log_level: Option<String>,
    /// YAML configuration file
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Db {
        #[clap(subcommand)]
        command: DbCommands,
    },
    /// Print the schema graph of a connection as JSON
    Graph {
        #[clap(long)]
        connection: String,
    },
    /// Validate the field mappings of a connection
    Validate {
        #[clap(long)]
        connection: String,
        #[clap(long)]
        entity: Option<String>,
    },
    Enqueue {
        #[clap(subcommand)]
        command: EnqueueCommands,
    },
    Cancel {
        #[clap(long)]
        job_id: String,
    },
    Status {
        #[clap(long)]
        job_id: String,
    },
    /// Run the job workers until interrupted
    Worker,
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    Init,
    Migrate {
        #[clap(subcommand)]
        direction: MigrateDirection,
    },
}

#[derive(Subcommand, Debug)]
enum EnqueueCommands {
    Sync {
        /// Defaults to a fresh UUID
        #[clap(long)]
        job_id: Option<String>,
        #[clap(long)]
        connection: String,
        #[clap(long)]
        entity: String,
        #[clap(long)]
        delete_stale: bool,
    },
    Webhook {
        #[clap(long)]
        job_id: Option<String>,
        #[clap(long)]
        connection: String,
        #[clap(long)]
        topic: String,
        /// File holding the webhook body
        #[clap(long)]
        payload: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(&args.log_level);
    let config = AppConfig::load(args.config.as_deref())?;

    match args.command {
        Commands::Db { command } => match command {
            DbCommands::Init => {
                info!("Initializing database: {}", config.database.url);
                migrate_database(&config.database, MigrateDirection::Up).await?;
            }
            DbCommands::Migrate { direction } => {
                info!("Running database migration: {:?}", direction);
                migrate_database(&config.database, direction).await?;
            }
        },
        Commands::Graph { connection } => {
            let db = open_database(&config).await?;
            let service = SchemaGraphService::new(SchemaCacheService::new(db));
            match service.build_graph(&connection).await? {
                Some(graph) => println!("{}", serde_json::to_string_pretty(&graph)?),
                None => bail!("No cached schema for connection {}", connection),
            }
        }
        Commands::Validate { connection, entity } => {
            let db = open_database(&config).await?;
            let relational = relational_schema::discover(&db).await?;
            let service = MappingValidatorService::new(SchemaCacheService::new(db));
            let result = service
                .validate_connection(&connection, entity.as_deref(), Some(&relational))
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.valid {
                bail!("Mapping configuration has {} error(s)", result.errors.len());
            }
        }
        Commands::Enqueue { command } => {
            let db = open_database(&config).await?;
            let service = build_service(&config, db).await?;
            service.initialize().await;
            let submission = match command {
                EnqueueCommands::Sync {
                    job_id,
                    connection,
                    entity,
                    delete_stale,
                } => {
                    service
                        .submit(&SyncRequest::Entity(SyncPayload {
                            job_id: job_id.unwrap_or_else(new_job_id),
                            connection_id: connection,
                            entity_type: entity,
                            delete_stale,
                        }))
                        .await?
                }
                EnqueueCommands::Webhook {
                    job_id,
                    connection,
                    topic,
                    payload,
                } => {
                    let body = std::fs::read_to_string(&payload)
                        .with_context(|| format!("Failed to read {}", payload.display()))?;
                    service
                        .submit(&SyncRequest::Webhook(WebhookPayload {
                            job_id: job_id.unwrap_or_else(new_job_id),
                            connection_id: connection,
                            topic,
                            payload: serde_json::from_str(&body)?,
                        }))
                        .await?
                }
            };
            match submission {
                Submission::Queued {
                    job_id,
                    newly_queued,
                } => {
                    if newly_queued {
                        println!("Queued job {}", job_id);
                    } else {
                        println!("Job {} is already queued", job_id);
                    }
                }
                Submission::Inline(outcome) => println!("Ran inline: {:?}", outcome),
            }
            service.shutdown().await;
        }
        Commands::Cancel { job_id } => {
            let db = open_database(&config).await?;
            let store = JobStore::new(db);
            if store.cancel(&job_id).await? {
                println!("Cancelled job {}", job_id);
            } else {
                println!("Job {} already finished", job_id);
            }
        }
        Commands::Status { job_id } => {
            let db = open_database(&config).await?;
            let job = JobStore::new(db).require(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Worker => {
            let db = open_database(&config).await?;
            let service = build_service(&config, db).await?;
            if !service.initialize().await {
                bail!("Job broker is not reachable, workers cannot start");
            }

            let workers = service.start_workers().await;
            if workers.is_empty() {
                bail!("No job handlers are configured");
            }
            let maintenance = {
                let service = service.clone();
                tokio::spawn(async move { service.run_maintenance().await })
            };

            shutdown_signal().await;
            info!("Shutdown signal received");
            service.shutdown().await;
            for worker in workers {
                if let Err(e) = worker.await {
                    warn!("Worker task ended abnormally: {}", e);
                }
            }
            maintenance.await?;
        }
    }

    Ok(())
}

fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

async fn open_database(config: &AppConfig) -> Result<DatabaseConnection> {
    let db = establish_connection(&config.database).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Wires the job service. Families without a usable handler are left out.
async fn build_service(config: &AppConfig, db: DatabaseConnection) -> Result<Arc<JobService>> {
    let queue = Arc::new(JobQueue::new(Some(config.broker_url().to_string())));
    let store = JobStore::new(db.clone()).with_ttl_hours(config.queue.job_ttl_hours);
    let storage = Arc::new(LocalOutputStorage::new(config.storage.output_dir.clone()));
    let mut service = JobService::new(queue, store, storage, config.queue.clone());

    match GraphqlRecordSource::from_config(&config.remote) {
        Ok(source) => {
            let relational = relational_schema::discover(&db).await?;
            let handler = SyncJobHandler::new(
                SchemaCacheService::new(db.clone()),
                DatabaseWriter::for_connection(db),
                Arc::new(source),
            )
            .with_relational_schema(relational)
            .with_chunk_size(config.writer.chunk_size);
            service = service.with_handler(Arc::new(handler));
        }
        Err(e) => warn!("Sync jobs disabled: {:#}", e),
    }

    Ok(Arc::new(service))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn setup_logging(log_level: &Option<String>) {
    let log_level = match log_level
        .as_ref()
        .unwrap_or(&"info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sqlx=warn,{}", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
