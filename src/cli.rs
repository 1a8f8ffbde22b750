//! Binary-side configuration loading and CLI surface.
//!
//! Kept out of the library core (`lib.rs`): the core receives an
//! already-built [`ClientConfig`] and never re-reads files itself. This
//! module is the thin wrapper that does that reading, layering a
//! `clap::Parser` struct for CLI/env overrides on top of a
//! `serde`-deserializable file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use relay_tunnel_client::auth::{AuthStrategy, HmacStrategy, KeySetStrategy};
use relay_tunnel_client::config::{AuthConfig, ClientConfig};

/// `relay-tunnel` CLI surface.
#[derive(Parser, Debug)]
#[command(name = "relay-tunnel", version, about = "Relay-tunneling client")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Bearer token. May also be supplied via `CLOUDBRIDGE_JWT_TOKEN`.
    #[arg(long, env = "CLOUDBRIDGE_JWT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Tunnel id to register after authenticating.
    #[arg(long = "tunnel-id")]
    pub tunnel_id: String,

    #[arg(long = "local-port")]
    pub local_port: u16,

    #[arg(long = "remote-host")]
    pub remote_host: String,

    #[arg(long = "remote-port")]
    pub remote_port: u16,

    /// Enable debug-level logging.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    ConfigError = 1,
    AuthenticationFailure = 2,
    TransportFailure = 3,
    TunnelCreationFailure = 4,
}

pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Read and parse the TOML config file into the core's `ClientConfig`,
/// then run its own `validate()`.
pub fn load_config(path: &Path) -> anyhow::Result<ClientConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
    let config: ClientConfig = toml::from_str(&text)
        .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

/// Build the configured [`AuthStrategy`], fetching the JWKS document now
/// if the `keyset` auth kind is configured.
pub async fn build_auth_strategy(
    config: &ClientConfig,
) -> anyhow::Result<Option<Arc<dyn AuthStrategy>>> {
    match &config.auth {
        AuthConfig::Hmac { secret } => Ok(Some(Arc::new(HmacStrategy::new(secret)) as Arc<dyn AuthStrategy>)),
        AuthConfig::Keyset { server_url, realm, client_id, jwks_url } => {
            let strategy =
                KeySetStrategy::fetch(server_url, realm, client_id, jwks_url.as_deref()).await?;
            Ok(Some(Arc::new(strategy) as Arc<dyn AuthStrategy>))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_rejects_missing_file() {
        let err = load_config(Path::new("/nonexistent/relay-tunnel.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn load_config_parses_and_validates() {
        let mut file = tempfile_toml(
            r#"
            [relay]
            host = "127.0.0.1"
            port = 18080
            connect_timeout = 10

            [tls]
            enabled = false
            verify_cert = true

            [auth]
            type = "hmac"
            secret = "s"

            [retry]
            max_retries = 2
            backoff_multiplier = 2.0
            max_backoff = 1
            initial_delay = 10

            [heartbeat]
            interval = 30
            response_timeout = 5
            max_missed = 3

            [limits]
            "#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.relay.host, "127.0.0.1");
        file.flush().ok();
    }

    fn tempfile_toml(contents: &str) -> NamedFile {
        let mut path = std::env::temp_dir();
        path.push(format!("relay-tunnel-cli-test-{}.toml", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        NamedFile { path, file: f }
    }

    struct NamedFile {
        path: PathBuf,
        file: std::fs::File,
    }

    impl NamedFile {
        fn path(&self) -> &Path {
            &self.path
        }
        fn flush(&mut self) -> std::io::Result<()> {
            std::io::Write::flush(&mut self.file)
        }
    }

    impl Drop for NamedFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
