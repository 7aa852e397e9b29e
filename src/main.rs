use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod builder;
mod estimator;
mod models;
mod report;
mod server;
mod store;
mod terms;
mod workbook;

#[derive(Parser)]
#[command(name = "nasooh-early-warning")]
#[command(about = "Next-term GPA and academic risk predictions for students", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict next-term GPA and risk from each student's latest completed term
    Predict {
        /// Spreadsheet of term records (xlsx, xls, ods or csv)
        #[arg(long)]
        input: PathBuf,
        /// Sheet name, matched case-insensitively
        #[arg(long, default_value = "Term_Summary")]
        sheet: String,
        /// Directory holding the regressor, the classifier and config.json
        #[arg(long, alias = "models_dir", default_value = "models")]
        models_dir: PathBuf,
        #[arg(long, default_value = "predictions_next_term.csv")]
        out: PathBuf,
    },
    /// Serve the web page and the prediction lookup API
    Serve {
        #[arg(long, env = "NASOOH_HOST", default_value = "127.0.0.1")]
        host: String,
        #[arg(long, env = "NASOOH_PORT", default_value_t = 5000)]
        port: u16,
        /// Directory served as static files
        #[arg(long, env = "NASOOH_STATIC_DIR", default_value = ".")]
        static_dir: PathBuf,
        /// Page served at `/`, relative to the static directory
        #[arg(long, default_value = "nasooh.html")]
        index: String,
        /// Predictions CSV; defaults to predictions_next_term.csv in the static directory
        #[arg(long, env = "NASOOH_PREDICTIONS")]
        predictions: Option<PathBuf>,
    },
    /// Generate a markdown report from a predictions CSV
    Report {
        #[arg(long, default_value = "predictions_next_term.csv")]
        predictions: PathBuf,
        #[arg(long, default_value = "risk_report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::from_default_env().add_directive("nasooh_early_warning=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Predict {
            input,
            sheet,
            models_dir,
            out,
        } => {
            let options = builder::PredictOptions {
                input,
                sheet,
                models_dir,
                out,
            };
            builder::run(&options)
                .with_context(|| format!("prediction run for {} failed", options.input.display()))?;
            println!("Wrote: {}", options.out.display());
        }
        Commands::Serve {
            host,
            port,
            static_dir,
            index,
            predictions,
        } => {
            let predictions =
                predictions.unwrap_or_else(|| static_dir.join("predictions_next_term.csv"));
            let config = server::ServerConfig {
                host,
                port,
                static_dir,
                index,
                predictions,
            };
            server::serve(config).await?;
        }
        Commands::Report {
            predictions,
            out,
            limit,
        } => {
            let table = store::PredictionTable::load(&predictions)?;
            let students = table.students();
            let report = report::build_report(
                &predictions.display().to_string(),
                chrono::Utc::now().date_naive(),
                &students,
                limit,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
