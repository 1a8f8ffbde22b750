//! `relay-tunnel` binary: parses the CLI surface, builds a
//! [`RelayTunnelClient`], drives it through connect/authenticate/
//! create_tunnel/start_heartbeat, then waits for a shutdown signal.

use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use relay_tunnel_client::client::RelayTunnelClient;
use relay_tunnel_client::metrics::NoopMetrics;

#[path = "../cli.rs"]
mod cli;

use cli::{build_auth_strategy, init_tracing, load_config, Cli, ExitCode};

#[tokio::main]
async fn main() -> ProcessExitCode {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return to_process_code(ExitCode::ConfigError);
        }
    };

    let token = match args.token.clone() {
        Some(token) => token,
        None => {
            error!("no bearer token supplied (--token or CLOUDBRIDGE_JWT_TOKEN)");
            return to_process_code(ExitCode::ConfigError);
        }
    };

    let auth_strategy = match build_auth_strategy(&config).await {
        Ok(strategy) => strategy,
        Err(e) => {
            error!(error = %e, "failed to build auth strategy");
            return to_process_code(ExitCode::ConfigError);
        }
    };

    let client = RelayTunnelClient::new(config, auth_strategy, Arc::new(NoopMetrics));

    if let Err(e) = client.connect().await {
        error!(error = %e, "failed to connect to relay");
        return to_process_code(ExitCode::TransportFailure);
    }

    if let Err(e) = client.authenticate(token).await {
        error!(error = %e, "authentication failed");
        client.close().await;
        return to_process_code(ExitCode::AuthenticationFailure);
    }

    if let Err(e) = client
        .create_tunnel(args.tunnel_id.clone(), args.local_port, args.remote_host.clone(), args.remote_port)
        .await
    {
        error!(error = %e, "tunnel creation failed");
        client.close().await;
        return to_process_code(ExitCode::TunnelCreationFailure);
    }

    if let Err(e) = client.start_heartbeat().await {
        error!(error = %e, "failed to start heartbeat");
        client.close().await;
        return to_process_code(ExitCode::TransportFailure);
    }

    info!(
        tunnel_id = args.tunnel_id,
        local_port = args.local_port,
        remote = format!("{}:{}", args.remote_host, args.remote_port),
        "tunnel established, serving until shutdown"
    );

    wait_for_shutdown().await;
    info!("shutdown signal received, closing");
    client.close().await;
    to_process_code(ExitCode::Success)
}

/// Waits for Ctrl+C, or SIGTERM on unix, whichever comes first.
async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn to_process_code(code: ExitCode) -> ProcessExitCode {
    ProcessExitCode::from(code as u8)
}
