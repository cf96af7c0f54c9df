use std::{net::SocketAddr, sync::Arc};

use actix_web::{App, HttpServer};
use castmesh::{
    config::RelayConfig, registry::StreamRegistry, signaling::endpoint::RelayEndpoint,
    transport::WebRTCApi,
};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("Invalid configuration: {}", err);
            std::process::exit(2);
        }
    };
    let api = match WebRTCApi::new(&config.webrtc) {
        Ok(api) => api,
        Err(err) => {
            tracing::error!("Failed to set up WebRTC: {}", err);
            std::process::exit(2);
        }
    };

    let registry = StreamRegistry::new(&config, Arc::new(api));
    if let Some(port) = config.initial_rtp_port {
        match registry.create(Some(port)).await {
            Ok(port) => tracing::info!("Listening for RTP on {}:{}", config.address, port),
            Err(err) => tracing::error!("Failed to create stream on {}: {}", port, err),
        }
    }

    let endpoint = RelayEndpoint::new(registry.clone());
    let addr = SocketAddr::new(config.address, config.signaling_port);
    tracing::info!("Signaling server listening on {}", addr);

    let result = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .configure(|cfg| endpoint.clone().configure(cfg))
    })
    .bind(addr)?
    .run()
    .await;

    registry.close().await;
    result
}
