use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "feedpipe",
    about = "feedpipe — streaming response transforms with pooled engines",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a file through the pipeline as if an upstream handler produced it.
    ///
    /// The pipeline output goes to stdout; a summary goes to stderr.
    Run {
        /// Pipeline configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// File whose contents the producer responds with
        #[arg(short, long)]
        input: PathBuf,
        /// Status the producer responds with
        #[arg(long, default_value_t = 200)]
        status: u16,
        /// Content type the producer declares
        #[arg(long)]
        content_type: Option<String>,
        /// Request header, repeatable
        #[arg(long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,
        /// Transform parameter overriding the configured ones, repeatable
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Request URI
        #[arg(long, default_value = "/")]
        uri: String,
        /// Request method
        #[arg(long, default_value = "GET")]
        method: String,
        /// Summary format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Validate a configuration file and compile its definition
    Check {
        #[arg(short, long)]
        config: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print an annotated example configuration
    ExampleConfig,
}

fn init_tracing(json_logs: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("feedpipe=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command {
        Commands::Run {
            config,
            input,
            status,
            content_type,
            headers,
            params,
            uri,
            method,
            format,
        } => {
            let args = commands::run::RunArgs {
                config,
                input,
                status,
                content_type,
                headers,
                params,
                uri,
                method,
            };
            commands::run::run(&args, &format).await
        }
        Commands::Check { config, format } => commands::check::check(&config, &format),
        Commands::ExampleConfig => {
            print!("{}", feedpipe_core::PipelineConfig::example());
            Ok(())
        }
    }
}
