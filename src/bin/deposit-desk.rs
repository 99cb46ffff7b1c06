use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deposit_desk::bin_utils::config::{DeskConfig, KeyConfig, RateConfig};
use deposit_desk::bin_utils::logging::init_logging;
use deposit_desk::bin_utils::{Service, build_desk, import_users};
use deposit_desk::runtime::{Shutdown, install_signal_handlers};
use tokio::io::BufReader;

#[derive(Parser)]
#[command(name = "deposit-desk", about = "Custodial BTC deposit and withdrawal desk")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve `<user_id> <message>` lines from stdin and poll deposits in the background
    Run {
        #[command(flatten)]
        config: DeskConfig,

        /// CSV file with `user,card_number` rows to register before serving
        #[arg(long)]
        users: Option<PathBuf>,
    },
    /// Print the current local-currency price of 1 BTC
    Rate {
        #[command(flatten)]
        config: RateConfig,
    },
    /// Print the deposit address at a derivation index
    Derive {
        #[command(flatten)]
        key: KeyConfig,

        index: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env file is fine, the environment may carry everything
    let _ = dotenv::dotenv();
    init_logging();

    match Cli::parse().command {
        Command::Run { config, users } => run(config, users).await,
        Command::Rate { config } => {
            let client = config.http_client()?;
            let rate = config
                .rate_service(&client)
                .rate()
                .await
                .context("Failed to fetch the exchange rate")?;
            println!("1 BTC = {rate} {}", config.fiat_currency.to_uppercase());
            Ok(())
        }
        Command::Derive { key, index } => {
            let derived = key.deriver()?.derive(index)?;
            println!("{}", derived.address);
            Ok(())
        }
    }
}

async fn run(config: DeskConfig, users: Option<PathBuf>) -> Result<()> {
    let desk = Arc::new(build_desk(&config)?);
    if let Some(path) = users {
        let file = File::open(&path)
            .with_context(|| format!("Failed to open `{}`", path.display()))?;
        import_users(&desk, file)?;
    }

    let shutdown = Shutdown::new();
    install_signal_handlers(&shutdown);
    let watcher = tokio::spawn(desk.watcher().run(shutdown.clone()));

    let mut stdout = tokio::io::stdout();
    let service = Service {
        desk,
        input: BufReader::new(tokio::io::stdin()),
        output: &mut stdout,
        error_printer: Box::new(|line, err| eprintln!("Error at line {line}: {err}")),
        shutdown: shutdown.clone(),
    };
    let served = service.run().await;

    shutdown.trigger();
    watcher.await.context("Deposit watcher panicked")?;
    served
}
