use std::sync::Arc;

use ble_orchestrator::config::Config;
use ble_orchestrator::ipc::IpcServer;
use ble_orchestrator::service::Service;
use ble_orchestrator::watchdog::SystemAdapterControl;
use ble_orchestrator_driver::btleplug_driver::BtleplugDriver;
use ble_orchestrator_driver::BleDriver;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    init_tracing(&config);

    info!(
        socket = %config.socket_path,
        scan_adapter = %config.scan_adapter,
        connect_adapter = %config.connect_adapter,
        "starting ble-orchestrator"
    );

    let scan_driver: Arc<dyn BleDriver> = Arc::new(BtleplugDriver::new(config.scan_adapter.clone()).await?);
    let connect_driver: Arc<dyn BleDriver> = Arc::new(BtleplugDriver::new(config.connect_adapter.clone()).await?);

    let (service, notification_events) = Service::new(
        config.clone(),
        scan_driver,
        connect_driver,
        Box::new(SystemAdapterControl),
    )
    .await?;

    let ipc = IpcServer::new(config.clone(), service.clone());
    let (ipc_stop_tx, ipc_stop_rx) = watch::channel(false);
    let ipc_handle = tokio::spawn(ipc.run(notification_events, ipc_stop_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping ble-orchestrator");

    let _ = ipc_stop_tx.send(true);
    match tokio::time::timeout(std::time::Duration::from_secs(5), ipc_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "IPC server exited with error"),
        Ok(Err(e)) => error!(error = %e, "IPC server task panicked"),
        Err(_) => error!("IPC server did not stop within bound"),
    }

    service.shutdown().await;
    info!("ble-orchestrator stopped cleanly");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
