//! Pitchside command-line client
//!
//! Thin front end over `SessionManager`:
//! 1. Loads config and restores the persisted session
//! 2. Optionally starts proactive token refresh
//! 3. Runs one command through the authenticated client
//!
//! Logs go to stderr as JSON; command output goes to stdout.

mod config;

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use pitchside_auth::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
use pitchside_session::{RefreshOutcome, SessionManager, SessionState, spawn_refresh_task};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{HttpTransport, RequestDescriptor};

use crate::config::Config;

/// Backend path for account deletion
const ACCOUNT_PATH: &str = "/users/me";

const USAGE: &str = "usage: pitchside [--config <path>] <command>

commands:
  login <email>            sign in (password from PITCHSIDE_PASSWORD or stdin)
  register <email> <name>  create an account and sign in
  logout                   forget the local session
  whoami                   print the signed-in user
  status                   print the session state
  refresh                  refresh the access token now
  get <path>               GET an API path with the session token
  delete-account           delete the account and sign out";

/// A parsed command line.
#[derive(Debug, PartialEq)]
enum Command {
    Login { email: String },
    Register { email: String, name: String },
    Logout,
    WhoAmI,
    Status,
    Refresh,
    Get { path: String },
    DeleteAccount,
}

/// Split `args` (without the program name) into the config flag and command.
fn parse_args(args: &[String]) -> Result<(Option<String>, Command)> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config requires a path")?;
            config = Some(path.clone());
        } else {
            rest.push(arg.as_str());
        }
    }

    let command = match rest.as_slice() {
        ["login", email] => Command::Login {
            email: email.to_string(),
        },
        ["register", email, name] => Command::Register {
            email: email.to_string(),
            name: name.to_string(),
        },
        ["logout"] => Command::Logout,
        ["whoami"] => Command::WhoAmI,
        ["status"] => Command::Status,
        ["refresh"] => Command::Refresh,
        ["get", path] => Command::Get {
            path: path.to_string(),
        },
        ["delete-account"] => Command::DeleteAccount,
        _ => bail!("{USAGE}"),
    };
    Ok((config, command))
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var("PITCHSIDE_PASSWORD") {
        return Ok(password);
    }
    eprint!("password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(manager: &SessionManager, command: Command) -> Result<()> {
    match command {
        Command::Login { email } => {
            let password = read_password()?;
            let user = manager.login(&email, &password).await?;
            print_json(&user)?;
        }
        Command::Register { email, name } => {
            let password = read_password()?;
            let profile = serde_json::json!({
                "email": email,
                "password": password,
                "name": name,
            });
            let user = manager.register(&profile).await?;
            print_json(&user)?;
        }
        Command::Logout => {
            manager.logout();
            println!("signed out");
        }
        Command::WhoAmI => match manager.current_user() {
            Some(user) => print_json(&user)?,
            None => bail!("not signed in"),
        },
        Command::Status => {
            let record = manager.credentials();
            let expires_at = record.access_token().and_then(pitchside_auth::token_expiry);
            print_json(&serde_json::json!({
                "state": manager.current_state().label(),
                "user": record.user().map(|u| u.id.as_str()),
                "access_token_expires_at": expires_at,
            }))?;
        }
        Command::Refresh => match manager.refresh().await {
            RefreshOutcome::Refreshed => println!("refreshed"),
            RefreshOutcome::Failed(failure) => bail!("refresh failed: {failure:?}"),
        },
        Command::Get { path } => {
            let body: serde_json::Value = manager
                .client()
                .send_json(RequestDescriptor::get(path))
                .await?;
            print_json(&body)?;
        }
        Command::DeleteAccount => {
            if !manager.is_authenticated() {
                bail!("not signed in");
            }
            manager
                .client()
                .send(RequestDescriptor::delete(ACCOUNT_PATH))
                .await?;
            manager.confirm_account_deletion();
            println!("account deleted");
        }
    }

    if let SessionState::Unauthenticated { reason } = manager.current_state() {
        info!(?reason, "session is signed out");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_config_path, command) = parse_args(&args)?;

    let config_path = Config::resolve_path(cli_config_path.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        storage_path = %config.session.storage_path.display(),
        headers = config.headers.len(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let transport = Arc::new(HttpTransport::new(
        http,
        config.api.base_url.clone(),
        config.timeout(),
        &config.headers,
    ));
    // An unreadable session file must not stop the client: run signed out
    // without persistence and let the user sign in again.
    let storage: Arc<dyn KeyValueStore> =
        match FileKeyValueStore::open(config.session.storage_path.clone()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(
                    path = %config.session.storage_path.display(),
                    error = %e,
                    "session storage unreadable, continuing without persistence"
                );
                Arc::new(MemoryKeyValueStore::new())
            }
        };

    let manager = Arc::new(SessionManager::new(transport, storage));
    let restored = manager.restore();
    info!(?restored, state = manager.current_state().label(), "session restored");

    let refresher = config.background_refresh_interval().map(|interval| {
        spawn_refresh_task(manager.clone(), interval, config.refresh_threshold())
    });

    let result = run(&manager, command).await;

    if let Some(handle) = refresher {
        handle.abort();
    }
    if let Err(e) = &result {
        warn!(error = %e, "command failed");
    }
    result
}
