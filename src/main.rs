use std::env;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use ride_escrow::replay::Replay;
use ride_escrow::script::{read_commands, write_bookings};
use ride_escrow::{Engine, EngineConfig, LedgerGateway, MemoryStore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::WARN.into()))
        .with_writer(io::stderr)
        .init();

    let Some(path) = env::args().nth(1) else {
        error!("usage: ride-escrow <script.csv>");
        return ExitCode::FAILURE;
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let commands = match read_commands(&path) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let store = Arc::new(MemoryStore::with_capacity(config.bus_capacity));
    let mut replay = Replay::new(Engine::new(store, config), Arc::new(LedgerGateway::new()));
    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);

    tokio::task::spawn_blocking(move || {
        for result in commands {
            match result {
                Ok(command) => {
                    if cmd_sender.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    replay.run(ReceiverStream::new(cmd_receiver)).await;

    let rows = replay.bookings().await;
    let report = rows.iter().map(|(ride, booking)| (ride.as_str(), booking));
    if let Err(e) = write_bookings(io::stdout().lock(), report) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
