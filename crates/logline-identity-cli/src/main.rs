mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use logline_identity::{App, AppOptions, AuthRegistry, KeyEndpoints, ServiceAccountKey};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "logline-identity", about = "Mint, verify and revoke identity credentials")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Service-account key file. Defaults to $GOOGLE_APPLICATION_CREDENTIALS.
    #[arg(long, global = true)]
    credentials: Option<PathBuf>,

    /// Project id. Defaults to $GOOGLE_CLOUD_PROJECT or the key file's project.
    #[arg(long, global = true)]
    project: Option<String>,

    /// Identity Toolkit base URL
    #[arg(long, global = true)]
    toolkit_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Mint a custom token for a user
    MintToken {
        uid: String,
        /// Developer claims as a JSON object, e.g. '{"role":"admin"}'
        #[arg(long)]
        claims: Option<String>,
    },
    /// Verify a custom token minted with the configured service account
    VerifyCustomToken { token: String },
    /// Verify an ID token
    VerifyIdToken {
        token: String,
        #[arg(long)]
        check_revoked: bool,
    },
    /// Exchange an ID token for a session cookie
    CreateSessionCookie {
        id_token: String,
        /// Cookie lifetime (e.g. "30m", "12h", "5d"), between 5m and 14d
        #[arg(long, default_value = "5d")]
        ttl: String,
        /// Print a Set-Cookie header instead of the bare cookie
        #[arg(long)]
        set_cookie: bool,
    },
    /// Verify a session cookie
    VerifySessionCookie {
        cookie: String,
        #[arg(long)]
        check_revoked: bool,
    },
    /// Look up an account by uid or email
    GetUser {
        uid: Option<String>,
        #[arg(long, conflicts_with = "uid")]
        email: Option<String>,
    },
    /// Revoke every refresh token and session of a user
    Revoke { uid: String },
    /// Delete an account
    DeleteUser { uid: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn app_options(cli: &Cli) -> anyhow::Result<AppOptions> {
    let mut opts = match &cli.credentials {
        Some(path) => AppOptions::with_service_account(
            ServiceAccountKey::from_file(path)
                .with_context(|| format!("loading credentials from {}", path.display()))?,
        ),
        None => AppOptions::from_env().context("loading credentials from the environment")?,
    };
    if let Some(project) = &cli.project {
        opts.project_id.clone_from(project);
    }
    if let Some(url) = &cli.toolkit_url {
        opts.identity_toolkit_url.clone_from(url);
    }
    Ok(opts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let opts = app_options(&cli)?;
    tracing::debug!(
        target: "identity.cli",
        project = %opts.project_id,
        toolkit_url = %opts.identity_toolkit_url,
        "app options resolved"
    );
    let registry = AuthRegistry::new(&KeyEndpoints::default())?;
    let auth = registry.get(&App::default_app(opts));

    commands::run(&auth, cli.command, cli.json).await
}

/// Print `value` as JSON in `--json` mode, else `text`.
pub fn pout(json_mode: bool, value: serde_json::Value, text: &str) -> anyhow::Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{text}");
    }
    Ok(())
}
