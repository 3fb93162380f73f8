//! Headless runner of the OMOMatrix session engine.
//!
//! Resumes the stored session, or logs in when none is stored, then logs the
//! notification feed until interrupted. It is meant for diagnosing a
//! homeserver or an account without the desktop interface.
//!
//! # Configuration
//!
//! ```yaml
//! homeserver: "https://matrix.org"
//! device_name: "OMOMatrix"
//! sync:
//!   timeout_ms: 30000
//! store:
//!   passphrase: "your-store-passphrase"
//! ```
//!
//! Any value can be overridden with `OMOMATRIX_` environment variables, `__`
//! separating nested keys:
//!
//! ```bash
//! export OMOMATRIX_STORE__PASSPHRASE="secret"
//! omomatrix --config config.yaml --data ./data --cache ./cache --username alice
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (default: `info`)
//! - `OMOMATRIX_PASSWORD` - Password used when no session is stored

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};

use omomatrix::{Config, EngineError, Notification, SessionManager, SessionState};

/// Command-line arguments.
///
/// # Examples
///
/// ```bash
/// omomatrix --config config.yaml --data ./data --cache ./cache
/// ```
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "omomatrix.yaml")]
    config: String,

    /// Directory of the encrypted session, key and room stores.
    ///
    /// It holds access tokens and encryption keys: keep it private.
    #[arg(short, long)]
    data: PathBuf,

    /// Directory of the avatar cache.
    #[arg(long)]
    cache: PathBuf,

    /// Homeserver to log in to, overrides the configuration.
    #[arg(long)]
    homeserver: Option<String>,

    /// Account to log in with when no session is stored.
    #[arg(short, long)]
    username: Option<String>,

    #[arg(long, env = "OMOMATRIX_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Put logger at info level by default
    let env = Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    info!("starting omomatrix {}", env!("CARGO_PKG_VERSION"));
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config file {}", args.config))?;
    let homeserver = args.homeserver.clone().or_else(|| config.homeserver.clone());
    let manager = SessionManager::new(config, &args.data, &args.cache);
    let mut feed = manager.notifications();

    match manager.resume().await {
        Ok(()) => info!("session resumed"),
        Err(EngineError::NotLoggedIn) => {
            let (Some(homeserver), Some(username), Some(password)) =
                (homeserver, args.username.as_deref(), args.password.as_deref())
            else {
                bail!("no stored session: a homeserver, --username and a password are required");
            };
            manager.login(&homeserver, username, password).await?;
        }
        Err(e) => return Err(e).context("cannot resume the stored session"),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = feed.recv() => match notification {
                Some(Notification::SecurityWarning(warning)) => warn!("{:?}", warning),
                Some(Notification::StateChanged(
                    state @ (SessionState::AuthFailed(_) | SessionState::Fatal(_)),
                )) => {
                    error!("session ended: {:?}", state);
                    break;
                }
                Some(notification) => info!("{:?}", notification),
                None => break,
            },
        }
    }

    manager.shutdown().await;
    info!("bye");
    Ok(())
}
