use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libshare_server::store::audit::{
    AuditLogEntry, ACTION_AUDIT_CLEAR, ACTION_CONFIG_UPDATE, ACTION_SECRET_RESET,
    ACTION_USER_CREATE, ACTION_USER_DELETE, ACTION_USER_UPDATE, DEFAULT_LIMIT,
};
use libshare_server::store::{ConfigPatch, NewUser, Permission, UserPatch};
use libshare_server::{AppState, RemoteLibraryConnection, RemoteToken};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "libshare", about = "Share a media library with other installations", version)]
struct Cli {
    /// Directory holding the sharing state ($LIBSHARE_DATA_DIR)
    #[arg(long, env = "LIBSHARE_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sharing endpoint
    Serve {
        /// Host to bind (default: $LIBSHARE_HOST or 0.0.0.0)
        #[arg(long, env = "LIBSHARE_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on (default: the configured port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show or change the sharing configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Manage the host secret
    #[command(subcommand)]
    Secret(SecretCommand),
    /// Manage shared users
    #[command(subcommand)]
    User(UserCommand),
    /// Inspect the audit trail
    #[command(subcommand)]
    Audit(AuditCommand),
    /// Check that a remote library is reachable
    Probe {
        /// Base URL of the remote installation
        url: String,
        /// `user:access` pair, or a bare access token
        #[arg(long, env = "LIBSHARE_TOKEN")]
        token: String,
        /// User token to pair with a bare access token
        #[arg(long, default_value = "")]
        user_token: String,
        #[arg(long, default_value = "5")]
        retries: u32,
        /// Delay between attempts e.g. 500ms, 2s
        #[arg(long, default_value = "1s")]
        delay: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the configuration (host secret masked)
    Show {
        #[arg(long)]
        reveal_secret: bool,
    },
    /// Change configuration fields
    Set {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        port: Option<u16>,
        /// Replace the IP allowlist (repeatable; pass none with --clear-ips)
        #[arg(long = "allow-ip")]
        allow_ips: Vec<String>,
        #[arg(long)]
        clear_ips: bool,
        /// Replace the proxies whose X-Forwarded-* headers are trusted (repeatable)
        #[arg(long = "trusted-proxy")]
        trusted_proxies: Vec<String>,
        #[arg(long)]
        clear_proxies: bool,
        #[arg(long)]
        max_connections: Option<usize>,
        #[arg(long)]
        max_upload_size: Option<u64>,
        #[arg(long)]
        max_upload_rate: Option<u64>,
        #[arg(long)]
        audit: Option<bool>,
        #[arg(long)]
        require_https: Option<bool>,
        #[arg(long)]
        ssl_cert: Option<PathBuf>,
        #[arg(long)]
        ssl_key: Option<PathBuf>,
        #[arg(long)]
        library: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SecretCommand {
    /// Generate a new host secret
    Reset,
}

#[derive(Subcommand)]
enum UserCommand {
    /// Enroll a remote identity and print its access token
    Add {
        /// Token the remote installation identifies itself with
        user_token: String,
        #[arg(long)]
        nickname: String,
        /// READ_ONLY, DOWNLOAD, UPLOAD, EDIT or FULL (repeatable)
        #[arg(long = "permission", default_value = "READ_ONLY")]
        permissions: Vec<String>,
        #[arg(long)]
        hardware_id: Option<String>,
    },
    /// List shared users
    List,
    /// Flip one permission on a user
    Toggle { id: String, permission: String },
    /// Allow a user to connect again
    Activate { id: String },
    /// Stop a user from connecting without deleting it
    Deactivate { id: String },
    /// Delete a user
    Remove { id: String },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Show recent entries, newest first
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },
    /// Delete every entry
    Clear,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LIBSHARE_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            libshare_server::run(libshare_server::ServerOptions {
                host,
                port,
                data_dir: cli.data_dir,
            })
            .await
        }
        Commands::Probe {
            url,
            token,
            user_token,
            retries,
            delay,
        } => cmd_probe(url, token, &user_token, retries, &delay).await,
        Commands::Config(cmd) => cmd_config(&open_state(cli.data_dir)?, cmd),
        Commands::Secret(SecretCommand::Reset) => cmd_secret_reset(&open_state(cli.data_dir)?),
        Commands::User(cmd) => cmd_user(&open_state(cli.data_dir)?, cmd),
        Commands::Audit(cmd) => cmd_audit(&open_state(cli.data_dir)?, cmd),
    }
}

fn open_state(data_dir: Option<PathBuf>) -> Result<AppState> {
    let dir = libshare_server::dirs::data_dir(data_dir.as_deref())?;
    Ok(AppState::open(&dir))
}

/// Entry for a change made from this CLI rather than by a remote peer.
fn operator_log(action: &str, resource_type: &str) -> AuditLogEntry {
    AuditLogEntry::new("local", "operator", action, resource_type, "local", true)
}

// ── Command implementations ───────────────────────────────────────────────────

fn cmd_config(state: &AppState, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { reveal_secret } => {
            let mut cfg = state.config.get_config();
            if !reveal_secret {
                let prefix = cfg.host_secret.get(..8).unwrap_or_default();
                cfg.host_secret = format!("{prefix}…");
            }
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        ConfigCommand::Set {
            enabled,
            port,
            allow_ips,
            clear_ips,
            trusted_proxies,
            clear_proxies,
            max_connections,
            max_upload_size,
            max_upload_rate,
            audit,
            require_https,
            ssl_cert,
            ssl_key,
            library,
        } => {
            let allowed_ips = replace_set(allow_ips, clear_ips);
            let trusted_proxies = replace_set(trusted_proxies, clear_proxies);
            let patch = ConfigPatch {
                is_enabled: enabled,
                port,
                allowed_ips,
                trusted_proxies,
                max_connections,
                max_upload_size,
                max_upload_rate,
                enable_audit_log: audit,
                require_https,
                ssl_cert_path: ssl_cert.map(Some),
                ssl_key_path: ssl_key.map(Some),
                publish_library_path: library.map(Some),
                ..Default::default()
            };
            state.config.update_config(patch);
            state
                .audit
                .add_log(operator_log(ACTION_CONFIG_UPDATE, "config"));
            println!("✓ configuration saved");
        }
    }
    Ok(())
}

/// `None` leaves the set as is; `clear` empties it.
fn replace_set(values: Vec<String>, clear: bool) -> Option<BTreeSet<String>> {
    if clear {
        Some(BTreeSet::new())
    } else if values.is_empty() {
        None
    } else {
        Some(values.into_iter().collect())
    }
}

fn cmd_secret_reset(state: &AppState) -> Result<()> {
    let secret = state.config.reset_host_secret();
    state
        .audit
        .add_log(operator_log(ACTION_SECRET_RESET, "config"));
    println!("{secret}");
    eprintln!(
        "warning: tokens encrypted with the previous secret can no longer be read; \
         affected users must be enrolled again"
    );
    Ok(())
}

fn parse_permission(s: &str) -> Result<Permission> {
    Permission::from_str(s).with_context(|| {
        format!("unknown permission {s:?} (expected READ_ONLY, DOWNLOAD, UPLOAD, EDIT or FULL)")
    })
}

fn cmd_user(state: &AppState, cmd: UserCommand) -> Result<()> {
    match cmd {
        UserCommand::Add {
            user_token,
            nickname,
            permissions,
            hardware_id,
        } => {
            let mut candidate = NewUser::new(user_token, nickname);
            candidate.permissions = permissions
                .iter()
                .map(|p| parse_permission(p))
                .collect::<Result<_>>()?;
            if candidate.permissions.contains(&Permission::Full) {
                candidate.permissions.extend(Permission::ALL);
            }
            candidate.hardware_id = hardware_id;

            let user = state.users.add_user(candidate);
            state.audit.add_log(
                operator_log(ACTION_USER_CREATE, "user").with_resource(user.id.clone()),
            );
            println!("id:           {}", user.id);
            println!("access token: {}", user.access_token);
            println!("(the access token is shown only once)");
        }
        UserCommand::List => {
            let users = state.users.list_users();
            if users.is_empty() {
                println!("(no shared users)");
            }
            for u in &users {
                let perms: Vec<&str> = u.permissions.iter().map(Permission::as_str).collect();
                println!(
                    "  {}\t{}\t{}\t{}",
                    u.id,
                    u.nickname,
                    perms.join(","),
                    if u.is_active { "active" } else { "inactive" }
                );
            }
        }
        UserCommand::Toggle { id, permission } => {
            let perm = parse_permission(&permission)?;
            let user = state
                .users
                .toggle_permission(&id, perm)
                .with_context(|| format!("no user with id {id}"))?;
            state.audit.add_log(
                operator_log(ACTION_USER_UPDATE, "user")
                    .with_resource(id)
                    .with_details(serde_json::json!({ "permissions": user.permissions })),
            );
            let perms: Vec<&str> = user.permissions.iter().map(Permission::as_str).collect();
            println!("{}", perms.join(","));
        }
        UserCommand::Activate { id } => set_active(state, id, true)?,
        UserCommand::Deactivate { id } => set_active(state, id, false)?,
        UserCommand::Remove { id } => {
            if !state.users.delete_user(&id) {
                anyhow::bail!("no user with id {id}");
            }
            state
                .audit
                .add_log(operator_log(ACTION_USER_DELETE, "user").with_resource(id.clone()));
            println!("✓ removed {id}");
        }
    }
    Ok(())
}

fn set_active(state: &AppState, id: String, active: bool) -> Result<()> {
    let patch = UserPatch {
        is_active: Some(active),
        ..Default::default()
    };
    state
        .users
        .update_user(&id, patch)
        .with_context(|| format!("no user with id {id}"))?;
    state.audit.add_log(
        operator_log(ACTION_USER_UPDATE, "user")
            .with_resource(id.clone())
            .with_details(serde_json::json!({ "isActive": active })),
    );
    println!("✓ {id} {}", if active { "activated" } else { "deactivated" });
    Ok(())
}

fn cmd_audit(state: &AppState, cmd: AuditCommand) -> Result<()> {
    match cmd {
        AuditCommand::List { user, limit } => {
            let logs = match user {
                Some(id) => state.audit.get_logs_by_user(&id, limit),
                None => state.audit.get_logs(limit),
            };
            if logs.is_empty() {
                println!("(no audit entries)");
            }
            for e in &logs {
                println!(
                    "  {} {} {} {} {}",
                    e.timestamp,
                    if e.success { "ok  " } else { "FAIL" },
                    e.action,
                    e.ip_address,
                    e.nickname
                );
            }
        }
        AuditCommand::Clear => {
            state.audit.clear_logs();
            state
                .audit
                .add_log(operator_log(ACTION_AUDIT_CLEAR, "audit"));
            println!("✓ audit log cleared");
        }
    }
    Ok(())
}

async fn cmd_probe(
    url: String,
    token: String,
    user_token: &str,
    retries: u32,
    delay: &str,
) -> Result<()> {
    let delay: humantime::Duration = delay
        .parse()
        .with_context(|| format!("invalid duration: {delay}"))?;

    let remote = RemoteLibraryConnection {
        url,
        token: RemoteToken::Combined(token),
        name: String::new(),
        last_connected_at: None,
    };

    match libshare_server::probe_health(&remote, user_token, Some(retries), Some(delay.into()))
        .await
    {
        Some(working) => {
            println!("{working}");
            Ok(())
        }
        None => anyhow::bail!("could not connect to {}", remote.url),
    }
}
