mod report;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ecco_common::api::FunctionConfiguration;
use ecco_common::JobLog;
use reqwest::Client;
use std::{
    env,
    path::{Path, PathBuf},
};

/// URL del host de funciones.
/// - Local: default http://localhost:9090
fn host_base_url() -> String {
    env::var("HOST_URL").unwrap_or_else(|_| "http://localhost:9090".to_string())
}

#[derive(Parser)]
#[command(name = "ecco-client")]
#[command(about = "Consultas de sólo lectura sobre corridas y funciones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resumen, costo por memoria e invocaciones de un job log
    Status {
        #[arg(long, value_name = "ARCHIVO")]
        job_log: PathBuf,
    },
    /// Time steps fallidos agrupados por job
    Failures {
        #[arg(long, value_name = "ARCHIVO")]
        job_log: PathBuf,
    },
    /// Funciones registradas en el host
    Functions,
}

fn load(path: &Path) -> Result<JobLog> {
    JobLog::load(path).with_context(|| format!("no se pudo leer el job log {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status { job_log } => {
            print!("{}", report::format_status(&load(&job_log)?));
        }
        Commands::Failures { job_log } => {
            print!("{}", report::format_failures(&load(&job_log)?));
        }
        Commands::Functions => {
            let url = format!("{}/api/v1/functions", host_base_url());
            let resp = Client::new().get(&url).send().await?;

            if resp.status().is_success() {
                let functions: Vec<FunctionConfiguration> = resp.json().await?;
                print!("{}", report::format_functions(&functions));
            } else {
                println!("El host respondió {} en {}", resp.status(), url);
            }
        }
    }

    Ok(())
}
