//! holiday-replica: change-notification runtime of one holiday-service replica
//!
//! Resolves which replica this process is, connects to the broker, and
//! consumes holiday and colaborator-id changes published by every replica.
//!
//! ## Architecture
//! ```text
//! [replica A] --publish--> (logs, fanout) --+--> repl1-holiday --> [replica 1]
//!                                           +--> repl1-colab   --> [replica 1]
//!                                           +--> repl2-holiday --> [replica 2]
//!                                           +--> ...
//! ```
//!
//! ## Configuration
//! - `--replicaName=<name>`: replica identity (else `connection_strings.replicaName`)
//! - HOLIDAY_CONFIG: path to a YAML config file (default: ./config.yaml)
//! - HOLIDAY__BROKER__HOSTNAME etc.: override any config key
//! - HOLIDAY_LOG: log filter (default: info)

use tracing::{info, warn};

use holiday_bus::bus::init_connection;
use holiday_bus::config::{Config, ReplicaConfig};
use holiday_bus::consumer::LogHandler;
use holiday_bus::replica::ReplicaHost;
use holiday_bus::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let args: Vec<String> = std::env::args().collect();
    let replica = ReplicaConfig::resolve(&args, &config)?;

    info!(
        replica = %replica.replica_name,
        port = replica.port,
        broker = %config.broker.hostname,
        exchange = %config.messaging.exchange,
        "holiday-replica starting"
    );

    let connection = init_connection(&config.messaging, &config.broker).await?;

    let started = ReplicaHost::builder(replica, config.messaging.clone())
        .on_holiday_change(LogHandler::new("holiday"))
        .on_colaborator_id_change(LogHandler::new("colaborator-id"))
        .start(connection.clone())
        .await;
    let host = match started {
        Ok(host) => host,
        Err(e) => {
            if let Err(close_err) = connection.shutdown().await {
                warn!(error = %close_err, "Failed to close broker connection");
            }
            return Err(e.into());
        }
    };

    info!("holiday-replica started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    host.shutdown().await?;
    Ok(())
}
