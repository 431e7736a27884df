use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use airwave::handlers;
use airwave::radio::{Collaborators, Station};
use airwave::Config;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Airwave stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> airwave::Result<()> {
    let config = Arc::new(Config::from_env());
    info!("============================================================");
    info!("Airwave - synchronized request radio");
    info!("Work directory: {}", config.work_dir.display());
    info!("Catalog: {}", config.catalog_file.display());
    info!("============================================================");

    let collaborators = Collaborators::from_config(&config).await?;
    let station = Station::new(config.clone(), collaborators);
    let mut pipeline = station.start().await?;

    let address = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&address).await?;
    info!("Listening on http://{}", address);

    let server = axum::serve(listener, handlers::router(station));
    tokio::select! {
        served = server => {
            served?;
            info!("Server shut down");
            Ok(())
        }
        finished = &mut pipeline => match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(fatal)) => Err(fatal.into()),
            Err(e) => Err(airwave::AppError::Storage(format!("broadcast pipeline panicked: {e}"))),
        },
    }
}
