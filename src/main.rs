//! adpipe - CLI entry point

mod cli;
mod commands;

use anyhow::Result;
use clap::{CommandFactory, FromArgMatches};
use tracing_subscriber::EnvFilter;

use cli::{build_cli_styles, Cli, Commands, ConfigCommands};
use commands::chunks::ChunksArgs;
use commands::run::RunArgs;

/// Version string: the package version, plus the git commit for dev builds.
fn version() -> &'static str {
    #[cfg(not(feature = "release"))]
    {
        concat!(env!("CARGO_PKG_VERSION"), " (", env!("VERGEN_GIT_SHA"), ")")
    }
    #[cfg(feature = "release")]
    {
        env!("CARGO_PKG_VERSION")
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("adpipe=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let matches = Cli::command()
        .styles(build_cli_styles())
        .version(version())
        .get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    init_tracing();

    match cli.command {
        Commands::Chunks {
            start,
            end,
            earliest,
            latest,
            count,
            chunk_size,
            span,
        } => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::chunks::handle(
                &config,
                ChunksArgs {
                    start,
                    end,
                    earliest,
                    latest,
                    count,
                    chunk_size,
                    span,
                },
            )
        }
        Commands::Run {
            job_id,
            data,
            time_field,
            fields,
            start,
            end,
            process_args,
        } => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::run::handle(
                config,
                RunArgs {
                    job_id,
                    data,
                    time_field,
                    fields,
                    start,
                    end,
                    process_args,
                },
            )
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => {
                let config = commands::load_config(cli.config.as_deref())?;
                commands::config::handle_show(&config)
            }
            ConfigCommands::Path => commands::config::handle_path(cli.config.as_deref()),
        },
    }
}
