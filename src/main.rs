use std::process::ExitCode;

use tracing::{error, warn};

use subflow::config::{Settings, load_config};
use subflow::create_client;
use subflow::receiver::{self, ReceiveError};
use subflow::utils::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.logging.level);

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("Exiting.");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<(), ReceiveError> {
    let client = create_client(settings.client_options())?;
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    receiver::run(&client, &settings, ctrl_c).await
}
