mod collectors;
mod config;
mod http;
mod metrics;
mod payload;
mod platform;
mod publisher;
mod scheduler;
mod state;

use axum::serve;
use clap::Parser;
use config::{Config, ConfigFile};
use metrics::Metrics;
use publisher::{Publisher, RECONNECT_DELAY};
use scheduler::{Cycle, SnapshotSink, HEAVY_INTERVAL};
use state::SnapshotStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostpulse")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./hostpulse.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// overrides broker_url from the file
    #[arg(long)]
    broker_url: Option<String>,
    /// overrides light_interval_ms, e.g. `500ms` or `2s`
    #[arg(long, value_parser = humantime::parse_duration)]
    light_interval: Option<Duration>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_or_create(&cli.config) {
        Ok((cfg, file)) => {
            match file {
                ConfigFile::Created => {
                    info!(path = %cli.config, "создан файл конфигурации со значениями по умолчанию")
                }
                ConfigFile::Merged => {
                    info!(path = %cli.config, "в файл конфигурации добавлены недостающие параметры")
                }
                ConfigFile::Existing => {}
            }
            cfg
        }
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if let Some(url) = cli.broker_url {
        cfg.broker_url = url;
    }
    if let Some(interval) = cli.light_interval {
        cfg.light_interval_ms = interval.as_millis() as u64;
    }
    let broker_url = match cfg.validate().and_then(|_| cfg.broker_url()) {
        Ok(url) => url,
        Err(err) => {
            error!(error = %err, "некорректные параметры запуска");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        broker = %broker_url,
        light_interval_ms = cfg.light_interval_ms,
        "запуск hostpulse"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    // cycles start only once platform detection is done
    let facts = platform::detect().await;
    let store = SnapshotStore::new(facts.identity(), facts.default_interface.clone());
    let publisher = Publisher::new(metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let app = http::build_router(
            metrics.clone(),
            store.clone(),
            publisher.clone(),
            cfg.restrict_to_admin,
        );
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

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

    let publisher_task = tokio::spawn(publisher.clone().run(
        broker_url,
        RECONNECT_DELAY,
        shutdown_rx.clone(),
    ));

    let light = Cycle::new(
        "light",
        collectors::light_set(&facts, &store),
        metrics.clone(),
    );
    let heavy = Cycle::new(
        "heavy",
        collectors::heavy_set(&facts, &store, cfg.top_processes),
        metrics.clone(),
    );
    info!(
        light = light.len(),
        heavy = heavy.len(),
        "сборщики метрик зарегистрированы"
    );

    let sink: Arc<dyn SnapshotSink> = publisher;
    let light_task = tokio::spawn(scheduler::run_light(
        light,
        cfg.light_interval(),
        store.clone(),
        sink,
        shutdown_rx.clone(),
    ));
    let heavy_task = tokio::spawn(scheduler::run_heavy(
        heavy,
        HEAVY_INTERVAL,
        shutdown_rx,
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = light_task.await;
    let _ = heavy_task.await;
    let _ = publisher_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
