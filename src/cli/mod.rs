//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::core::config::Config;
use crate::relay;

#[derive(Parser)]
#[command(name = "parloir")]
#[command(about = "A streaming chat relay and terminal client for site-chat widgets")]
#[command(
    long_about = "Parloir relays a site-chat widget's conversations to an OpenAI-compatible \
provider. The relay owns the provider credentials and the system prompt; widgets \
only ever see a single route that answers with a stream of typed frames.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    Provider API key (optional for keyless local providers)\n\
  RUST_LOG          Log filter, overriding the built-in default\n\n\
Run without a subcommand to start the relay."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the config file (defaults to the platform config directory)
    #[arg(short = 'c', long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server (default)
    Serve {
        /// Bind address, overriding the configured one
        #[arg(short, long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Talk to a running relay from the terminal
    Chat {
        /// Widget endpoint, overriding the configured one
        #[arg(short, long, value_name = "URL")]
        endpoint: Option<String>,
    },
    /// Print the active configuration as TOML
    Config {
        /// Write the default config file if none exists yet
        #[arg(long)]
        init: bool,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    match args.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => {
            init_tracing("info")?;
            let mut relay_config = config.relay;
            if let Some(bind) = bind {
                relay_config.bind = bind;
            }
            relay::serve(relay_config).await
        }
        Commands::Chat { endpoint } => {
            init_tracing("warn")?;
            let mut widget_config = config.widget;
            if let Some(endpoint) = endpoint {
                widget_config.endpoint = endpoint;
            }
            chat::run_chat(widget_config).await
        }
        Commands::Config { init } => {
            if init {
                let path = args.config.clone().unwrap_or_else(Config::default_path);
                if path.exists() {
                    println!("Config already exists at {}", path.display());
                } else {
                    config.save_to_path(&path)?;
                    println!("Wrote default config to {}", path.display());
                }
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(())
        }
    }
}

fn init_tracing(level: &str) -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(format!("parloir={level}").parse()?),
        )
        .init();
    Ok(())
}
