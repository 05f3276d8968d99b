use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use media_converter::config::{self, AppResources, Args, ConfigFile, Sidecars};
use media_converter::orchestrator::Orchestrator;
use media_converter::server;
use media_converter::tracing::init_tracer;

#[tokio::main]
async fn main() {
    Args::parse().apply_configuration();
    if let Err(err) = AppResources::initiate() {
        panic!("Could not initiate app resources: {err}");
    }
    init_tracer(tracing::Level::INFO);

    match ConfigFile::open_and_read().await {
        Ok(toml) => config::CONFIG.apply_toml_settings(toml),
        Err(err) => tracing::warn!("Running without config file: {err:#}"),
    }

    let sidecars = match Sidecars::locate() {
        Ok(sidecars) => sidecars,
        Err(err) => {
            tracing::error!("{err}");
            tracing::error!("Refusing to start without the ffmpeg/ffprobe sidecars");
            std::process::exit(1);
        }
    };
    tracing::info!("Using ffmpeg: {}", sidecars.ffmpeg.display());
    tracing::info!("Using ffprobe: {}", sidecars.ffprobe.display());

    // Warm the capability cache so the UI's first query is instant.
    media_converter::ffmpeg::available_encoders().await;

    let config::MaxConcurrency(max_concurrency) = config::CONFIG.get_value();
    let orchestrator = Orchestrator::new(max_concurrency);

    let config::Port(port) = config::CONFIG.get_value();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind server address");
    tracing::info!("Listening on {addr}");

    axum::serve(listener, server::router(orchestrator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .expect("serve http");
}
