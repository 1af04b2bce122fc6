use meetup_relay_lib::{logger, RelayConfig, Role};
use tracing::info;

const USAGE: &str = "usage: meetup-relay {host|guest} <signalingServerURL> <hostId>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (role, server, host_id) = match args.as_slice() {
        [role, server, host_id] => match role.parse::<Role>() {
            Ok(role) => (role, server.clone(), host_id.clone()),
            Err(_) => {
                eprintln!("{USAGE}");
                return Ok(());
            }
        },
        _ => {
            eprintln!("{USAGE}");
            return Ok(());
        }
    };

    logger::init();
    tokio::spawn(exit_on_signal());

    let config = RelayConfig::from_env()?;
    meetup_relay_lib::run(role, &server, &host_id, config).await?;
    Ok(())
}

/// SIGINT / SIGTERM: выходим сразу, без дренажа
async fn exit_on_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("terminating");
    std::process::exit(0);
}
