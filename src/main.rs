use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use victron_ble_mqtt::config::{Options, Settings};
use victron_ble_mqtt::scanner::RealRadio;
use victron_ble_mqtt::scheduler;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr; `RUST_LOG` overrides the configured level.
fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
    token.cancel();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    // A missing .env is fine; settings may come from the environment alone.
    let dotenv = dotenvy::dotenv();

    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_ERROR);
        }
    };

    init_tracing(&options.log_level);
    if let Err(e) = dotenv
        && !e.not_found()
    {
        warn!(error = %e, "failed to load .env file");
    }

    let backend = options.backend;
    let settings = match Settings::try_from(options) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(EXIT_ERROR);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %settings.binding.identity,
        broker = %settings.mqtt.host,
        %backend,
        "starting victron-ble-mqtt"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let radio = RealRadio::new(backend);
    match scheduler::run(settings, &radio, cancel).await {
        Ok(()) => {
            info!("stopped");
            std::process::exit(EXIT_SUCCESS)
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            std::process::exit(EXIT_ERROR);
        }
    }
}
