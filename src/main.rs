use bayer_drizzle::cli::{Cli, Commands};
use bayer_drizzle::commands::{classify_frames, inspect, master_dark, stack};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Stack {
            root,
            options,
            report,
        } => {
            stack(&root, &options, report.as_deref())?;
        }
        Commands::Classify { root, format } => {
            classify_frames(&root, &format)?;
        }
        Commands::MasterDark {
            root,
            output,
            sky,
            verbose,
        } => {
            master_dark(&root, output.as_deref(), &sky, verbose)?;
        }
        Commands::Inspect {
            path,
            verbose,
            format,
        } => {
            inspect(&path, verbose, &format)?;
        }
    }

    Ok(())
}
