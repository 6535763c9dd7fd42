mod api;
mod config;
mod http;
mod metrics;
mod provision;
mod schedule;
mod state;
mod telemetry;

use api::{HttpVmApi, VmApi};
use axum::serve;
use clap::Parser;
use config::Config;
use metrics::Metrics;
use provision::clipboard::Clipboard;
use provision::store::SessionStore;
use provision::ProvisioningManager;
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry::{DetailRegistry, FleetSource, TelemetryLoop, TelemetryView};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "vmconsole")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = match cfg.listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        api_base_url = %cfg.api_base(),
        refresh_interval_secs = cfg.telemetry.refresh_interval_secs,
        "запуск vmconsole"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let api: Arc<dyn VmApi> = Arc::new(HttpVmApi::new(cfg.api_base(), &cfg.user_agent));

    let fleet = TelemetryLoop::start(
        TelemetryView::new(
            FleetSource::new(api.clone()),
            metrics.clone(),
            cfg.telemetry.manual_refresh_min_visible(),
        ),
        cfg.telemetry.refresh_interval(),
    );

    let store = SessionStore::new(cfg.provisioning.state_file.clone());
    info!(state_file = %store.path().display(), "файл сессии подключения");
    let provisioning = ProvisioningManager::new(
        api.clone(),
        store,
        Clipboard::from_config(&cfg.clipboard),
        fleet.trigger(),
        metrics.clone(),
        &cfg.provisioning,
    );
    let phase = provisioning.resume().await;
    info!(?phase, "состояние подключения восстановлено");

    let details = DetailRegistry::new(api, metrics.clone(), &cfg.telemetry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let app_state = http::HttpAppState {
            metrics,
            fleet: fleet.view().clone(),
            fleet_trigger: fleet.trigger(),
            details: details.clone(),
            provisioning: provisioning.clone(),
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(app_state);
            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться сигнала завершения");
    }
    info!("получен сигнал завершения");

    let _ = shutdown_tx.send(true);
    let _ = http_task.await;

    fleet.stop().await;
    details.stop_all().await;
    provisioning.shutdown().await;
    info!("vmconsole остановлен");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
