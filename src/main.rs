mod config;
mod logging;
mod modbus_dtu;
mod rumqttc_wrapper;

use std::sync::Arc;
use std::time::Duration;

use config::Config;
use dtu2mqtt::home_assistant::HassMqtt;
use dtu2mqtt::mqtt_wrapper::MqttWrapper;
use dtu2mqtt::production::ProductionTracker;
use dtu2mqtt::query_job::QueryJob;
use log::{error, info};
use modbus_dtu::ModbusTcpDtu;
use rumqttc_wrapper::RumqttcWrapper;

fn main() {
    let config = Config::load();
    logging::init_logger(config.debug());
    info!("Running revision: {}", env!("GIT_HASH"));

    if std::env::args().len() > 1 {
        error!("Arguments passed. Tool is configured by config.toml in its path");
    }
    if !config.is_valid() {
        error!("config.toml is missing a DTU host or a valid MQTT broker");
        std::process::exit(1);
    }

    info!("DTU host: {}:{}", config.dtu_host, config.dtu_port());
    info!(
        "query period: {}s, reset hour: {}",
        config.query_period(),
        config.reset_hour()
    );

    let tracker = ProductionTracker::new(
        config.activity_check.unwrap_or_default(),
        config.reset_hour(),
        config.reset_heuristic.unwrap_or_default(),
    );
    let builder = HassMqtt::new(&config.home_assistant, tracker);
    let publisher = RumqttcWrapper::new(&config.mqtt, "-ha");
    let client = ModbusTcpDtu::new(&config.dtu_host, config.dtu_port(), config.modbus_unit_id());
    let job = Arc::new(QueryJob::new(builder, publisher, client));

    run_scheduler(job, Duration::from_secs(config.query_period()));
}

/// Fire the query job on a fixed period until a termination signal arrives,
/// then let the in-flight cycle finish before exiting. The timer keeps its
/// schedule regardless of cycle duration; the job itself drops overlapping
/// triggers.
#[tokio::main(flavor = "current_thread")]
async fn run_scheduler(job: Arc<QueryJob<RumqttcWrapper, ModbusTcpDtu>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("begin polling");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let job = job.clone();
                tokio::task::spawn_blocking(move || job.execute());
            }
            _ = shutdown_signal() => break,
        }
    }

    info!("waiting for the current cycle to finish");
    let job = job.clone();
    if tokio::task::spawn_blocking(move || job.wait_idle()).await.is_err() {
        error!("in-flight cycle panicked during shutdown");
    }
    info!("done polling");
}

/// Completes on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
