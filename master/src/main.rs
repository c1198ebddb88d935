mod aggregator;
mod backend;
mod config;
mod dispatcher;
mod error;
mod lifecycle;
mod pipeline;
mod retry;
mod task_list;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ecco_common::{
    load_grouping_dir, parse_job_file, resolve_job_lines, GroupingStore, JobLog, JobSpec,
    LocalStore,
};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::backend::HttpBackend;
use crate::config::Config;
use crate::pipeline::{Backends, Pipeline};
use crate::retry::{JobRunner, RetryController, RetryRound};

#[derive(Parser)]
#[command(name = "ecco-master")]
#[command(about = "Orquestador de generación de gránulos ECCO")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Corre los jobs del archivo y después las rondas de reintento
    Run {
        #[arg(long, value_name = "ARCHIVO")]
        jobs: PathBuf,
        #[arg(long, value_name = "ARCHIVO")]
        config: Option<PathBuf>,
        #[arg(long, value_name = "NOMBRE")]
        run_name: Option<String>,
    },
    /// Sólo construye y escribe las listas de tareas
    Tasks {
        #[arg(long, value_name = "ARCHIVO")]
        jobs: PathBuf,
        #[arg(long, value_name = "ARCHIVO")]
        config: Option<PathBuf>,
        #[arg(long, value_name = "NOMBRE")]
        run_name: Option<String>,
    },
    /// Reintenta los time steps fallidos de un job log guardado
    Retry {
        #[arg(long, value_name = "ARCHIVO")]
        job_log: PathBuf,
        #[arg(long, value_name = "ARCHIVO")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ecco_master=debug,reqwest=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    // Ctrl-C corta el sondeo; lo ya enviado sigue corriendo en el backend
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C recibido, cortando el sondeo");
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Commands::Run {
            jobs,
            config,
            run_name,
        } => run(&jobs, config.as_deref(), run_name, cancel).await,
        Commands::Tasks {
            jobs,
            config,
            run_name,
        } => tasks(&jobs, config.as_deref(), run_name),
        Commands::Retry { job_log, config } => retry(&job_log, config.as_deref(), cancel).await,
    };

    // todo lo que llega acá es fatal
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn default_run_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &id[..8])
}

fn read_jobs(path: &Path, groupings: &dyn GroupingStore) -> Result<Vec<JobSpec>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer el archivo de jobs {}", path.display()))?;
    let file = parse_job_file(&text);
    for (line, e) in &file.rejected {
        warn!("{}:{}: línea ignorada: {}", path.display(), line, e);
    }
    let jobs = resolve_job_lines(&file.lines, groupings);
    info!("{} jobs leídos de {}", jobs.len(), path.display());
    Ok(jobs)
}

fn ask_operator(summary: String) -> bool {
    println!("{}", summary);
    print!("¿Enviar? [s/N] ");
    let _ = io::stdout().flush();

    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(
        answer.trim().to_lowercase().as_str(),
        "s" | "si" | "sí" | "y" | "yes"
    )
}

fn build_pipeline(config: Arc<Config>, cancel: CancellationToken) -> Result<Pipeline> {
    let groupings = load_grouping_dir(&config.grouping_dir).with_context(|| {
        format!(
            "no se pudieron cargar las agrupaciones de {}",
            config.grouping_dir.display()
        )
    })?;
    let http = Arc::new(HttpBackend::new(config.host_url.clone()));
    let backends = Backends {
        groupings: Arc::new(groupings),
        store: Arc::new(LocalStore),
        compute: http.clone(),
        images: http.clone(),
        logs: http,
    };

    let pipeline = Pipeline::new(config.clone(), backends, cancel);
    if config.require_confirmation {
        return Ok(pipeline.with_confirmation(Arc::new(ask_operator)));
    }
    Ok(pipeline)
}

fn print_rounds(rounds: &[RetryRound]) {
    for round in rounds {
        println!(
            "Reintento {}: {} time steps reintentados",
            round.round_number,
            round.source_failures.len()
        );
        println!("{}", round.resulting_job_log.summary());
        if !round.remaining_failures.is_empty() {
            println!("Quedan {} time steps pendientes", round.remaining_failures.len());
        }
    }
}

async fn run(
    jobs_path: &Path,
    config_path: Option<&Path>,
    run_name: Option<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let config = Arc::new(Config::load(config_path)?);
    let pipeline = build_pipeline(config.clone(), cancel.clone())?;
    let jobs = read_jobs(jobs_path, pipeline.groupings())?;

    let run_name = run_name
        .or_else(|| config.run_name.clone())
        .unwrap_or_else(default_run_name);
    let log = pipeline.run_jobs(&jobs, &run_name).await?;
    println!("{}", log.summary());

    if cancel.is_cancelled() {
        info!("corrida cancelada, no se reintenta");
        return Ok(());
    }
    let rounds = RetryController::new(config.max_retry_rounds)
        .retry(&log, &pipeline)
        .await?;
    print_rounds(&rounds);
    Ok(())
}

fn tasks(jobs_path: &Path, config_path: Option<&Path>, run_name: Option<String>) -> Result<()> {
    let config = Arc::new(Config::load(config_path)?);
    let pipeline = build_pipeline(config.clone(), CancellationToken::new())?;
    let jobs = read_jobs(jobs_path, pipeline.groupings())?;

    let run_name = run_name
        .or_else(|| config.run_name.clone())
        .unwrap_or_else(default_run_name);
    let written = pipeline.write_task_lists(&jobs, &run_name);
    for (job, count) in &written {
        println!("{}: {} tareas", job, count);
    }
    println!(
        "{} listas escritas en {}",
        written.len(),
        config.task_list_dir.join(&run_name).display()
    );
    Ok(())
}

async fn retry(job_log: &Path, config_path: Option<&Path>, cancel: CancellationToken) -> Result<()> {
    let config = Arc::new(Config::load(config_path)?);
    let log = JobLog::load(job_log)?;
    println!("{}", log.summary());

    let pipeline = build_pipeline(config.clone(), cancel)?;
    let rounds = RetryController::new(config.max_retry_rounds)
        .retry(&log, &pipeline)
        .await?;
    if log.time_steps_failed.is_empty() {
        println!("No hay time steps fallidos para reintentar");
    } else if rounds.is_empty() {
        println!("Reintento cancelado, no se corrió ninguna ronda");
    }
    print_rounds(&rounds);
    Ok(())
}
