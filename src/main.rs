//! CLI de TuneFlow.
//!
//! `serve` corre el Job Manager como daemon (recuperación, dispatcher,
//! chequeo de salud de la réplica y mantenimiento periódico) hasta Ctrl-C.
//! El resto de los subcomandos son operaciones puntuales que imprimen JSON.

use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use tune_domain::{JobFilter, JobStatus, JobType, OperationClass};
use tuneflow_rust::{check_sql, AppConfig, AppError, Service};
use uuid::Uuid;

/// Benchmark en sandbox y aplicación segura de recomendaciones de tuning.
#[derive(Parser, Debug)]
#[command(name = "tuneflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Corre el dispatcher de jobs hasta Ctrl-C.
    Serve,
    /// Encola un benchmark y espera su resultado.
    Benchmark {
        recommendation_id: String,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Aplica el `sql_fix` de una recomendación.
    Apply {
        recommendation_id: String,
        /// Ejecutar como job durable en lugar de llamada directa.
        #[arg(long, default_value_t = false)]
        queued: bool,
    },
    /// Revierte un cambio aplicado.
    Rollback {
        recommendation_id: String,
        #[arg(long, default_value_t = false)]
        queued: bool,
    },
    /// Consulta y mantenimiento de jobs.
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
    /// Últimas entradas del audit trail.
    Audit {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Cambios aplicados (activos y revertidos).
    Changes,
    /// Estado del cambio de una recomendación.
    ChangeStatus { recommendation_id: String },
    /// Elimina sandboxes huérfanos y namespaces de apply vencidos.
    Reap {
        /// Edad máxima de los namespaces de apply; por defecto la configurada.
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Valida un SQL contra el allow-list y muestra su rollback derivado.
    CheckSql { sql: String },
    /// Estado del selector de destinos.
    Targets,
}

#[derive(Subcommand, Debug)]
enum JobCommand {
    Status { id: Uuid },
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long)]
        recommendation: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Cancela un job encolado o en curso.
    Cancel { id: Uuid },
    /// Borra jobs terminales más viejos que la retención.
    Cleanup {
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

fn parse_status(raw: &str) -> Result<JobStatus, String> {
    JobStatus::from_str(raw).map_err(|e| e.to_string())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr))
                                  .with(filter)
                                  .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("tuneflow:failed err={e}");
            eprintln!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(command: Command) -> Result<(), AppError> {
    if let Command::CheckSql { sql } = &command {
        return print_json(&check_sql(sql));
    }
    let config = AppConfig::from_env()?;
    let service = Service::connect(config).await?;
    match command {
        Command::Serve => serve(Arc::new(service)).await,
        Command::Benchmark { recommendation_id, timeout_secs } => {
            let job = service.submit_and_wait(&recommendation_id, JobType::Benchmark, Duration::from_secs(timeout_secs))
                             .await?;
            print_json(&job)
        }
        Command::Apply { recommendation_id, queued: false } => print_json(&service.apply.apply(&recommendation_id).await?),
        Command::Rollback { recommendation_id, queued: false } => {
            print_json(&service.apply.rollback(&recommendation_id).await?)
        }
        Command::Apply { recommendation_id, queued: true } => {
            print_json(&service.submit_and_wait(&recommendation_id, JobType::Apply, Duration::from_secs(600)).await?)
        }
        Command::Rollback { recommendation_id, queued: true } => {
            print_json(&service.submit_and_wait(&recommendation_id, JobType::Rollback, Duration::from_secs(600)).await?)
        }
        Command::Job { command } => job_command(&service, command).await,
        Command::Audit { limit } => print_json(&service.apply.audit_trail(limit).await?),
        Command::Changes => print_json(&service.apply.applied_changes().await?),
        Command::ChangeStatus { recommendation_id } => print_json(&service.apply.change_status(&recommendation_id).await?),
        Command::Reap { max_age_secs } => {
            let orphans = service.schemas.reap_orphans().await?;
            let max_age = max_age_secs.map(Duration::from_secs).unwrap_or(service.config.sandbox_max_age);
            let apply_schemas = service.apply.reap_old_sandboxes(max_age).await?;
            print_json(&serde_json::json!({ "orphans_reaped": orphans, "apply_schemas_reaped": apply_schemas }))
        }
        Command::Targets => {
            let read = service.targets.select_target(OperationClass::Read).await;
            let mutate = service.targets.select_target(OperationClass::Mutate).await;
            print_json(&serde_json::json!({
                "status": service.targets.status().await,
                "read": read.kind,
                "mutate": mutate.kind,
            }))
        }
        Command::CheckSql { sql } => print_json(&check_sql(&sql)),
    }
}

async fn job_command(service: &Service, command: JobCommand) -> Result<(), AppError> {
    match command {
        JobCommand::Status { id } => print_json(&service.jobs.status(id).await?),
        JobCommand::List { status, recommendation, limit } => {
            let filter = JobFilter { status, recommendation_id: recommendation, limit: Some(limit) };
            print_json(&service.jobs.list(filter).await?)
        }
        JobCommand::Cancel { id } => print_json(&serde_json::json!({ "job_id": id, "cancelled": service.jobs.cancel(id).await? })),
        JobCommand::Cleanup { older_than_hours } => {
            let age = older_than_hours.map(|h| Duration::from_secs(h * 3600)).unwrap_or(service.config.job_retention);
            print_json(&serde_json::json!({ "removed": service.jobs.cleanup_older_than(age).await? }))
        }
    }
}

async fn serve(service: Arc<Service>) -> Result<(), AppError> {
    let report = service.jobs.recover().await?;
    info!("serve:recovered interrupted={} requeued={}", report.interrupted, report.requeued);
    if let Err(e) = service.schemas.reap_orphans().await {
        warn!("serve:startup_reap_skipped err={e}");
    }
    service.jobs.start();

    let token = CancellationToken::new();
    let health = Arc::clone(&service.targets).spawn_health_loop(token.clone());
    let maintenance = Arc::clone(&service).spawn_maintenance_loop(token.clone());
    info!("serve:ready environment={}", service.config.environment);

    tokio::signal::ctrl_c().await?;
    info!("serve:shutdown_requested");
    token.cancel();
    service.jobs.stop().await;
    for handle in [health, maintenance] {
        if let Err(e) = handle.await {
            warn!("serve:background_task_failed err={e}");
        }
    }
    info!("serve:stopped");
    Ok(())
}
