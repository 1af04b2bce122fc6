pub mod config;
pub mod controller;
pub mod error;
pub mod logger;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::RelayConfig;
pub use controller::{AttemptOutcome, AttemptReport, SessionController};
pub use error::{RelayError, RelayResult};
pub use peer::{MediaKind, Role, SessionDescription};
pub use registry::SessionRegistry;
pub use retry::RetryPolicy;
pub use signaling::SignalingClient;

use peer::WebRtcEngine;
use std::sync::Arc;
use tracing::info;

/// Поднимает ретрансляцию захвата и крутит цикл попыток звонка
pub async fn run(
    role: Role,
    server: &str,
    host_id: &str,
    config: RelayConfig,
) -> RelayResult<()> {
    let config = Arc::new(config);
    let registry = Arc::new(SessionRegistry::new());
    let engine = Arc::new(WebRtcEngine::new(&config)?);

    for kind in [MediaKind::Audio, MediaKind::Video] {
        let socket =
            relay::bind_capture(config.capture_addr(kind), config.capture_recv_buffer).await?;
        tokio::spawn(relay::run_capture_fan_out(
            registry.clone(),
            kind,
            socket,
            config.capture_buffer_size,
            config.capture_error_pause,
        ));
    }

    let signaling = SignalingClient::new(
        server,
        host_id,
        RetryPolicy::unbounded(config.poll_interval),
    );
    info!("starting as {role}, signalling via {server}");

    SessionController::new(role, engine, registry, signaling, config)
        .run()
        .await
}
