use clap::{ Parser, Subcommand };
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Backend Args ---
    /// Base URL of the backend REST API (e.g., http://localhost:8000/api)
    #[arg(long, env = "CHAT_API_BASE", default_value = "http://localhost:8000/api", global = true)]
    pub api_base: String,

    /// Base URL of the WebSocket server. Derived from the API base when not set
    /// (http://host/api -> ws://host/ws).
    #[arg(long, env = "CHAT_WS_BASE", global = true)]
    pub ws_base: Option<String>,

    // --- Session Args ---
    /// Username used to sign in
    #[arg(short = 'u', long, env = "CHAT_USERNAME", default_value = "", global = true)]
    pub username: String,

    /// Password used to sign in
    #[arg(short = 'p', long, env = "CHAT_PASSWORD", default_value = "", hide_env_values = true, global = true)]
    pub password: String,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a new account with the configured username and password
    Register {
        #[arg(long)]
        email: String,
    },
    /// Sign in and show the session user
    Login,
    /// List the other members you can chat with
    Users,
    /// Show or edit your profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Open a live chat with another member
    Chat {
        /// Username of the person to chat with
        peer: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProfileAction {
    Show,
    Update {
        /// New username
        #[arg(long = "new-username")]
        username: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        bio: Option<String>,
        /// Image file to upload as the avatar
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
}

impl Args {
    pub fn ws_base(&self) -> String {
        self.ws_base
            .as_deref()
            .map(str::trim)
            .filter(|base| !base.is_empty())
            .map(|base| base.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_ws_base(&self.api_base))
    }
}

/// `http(s)://host[/api]` -> `ws(s)://host/ws`.
pub fn derive_ws_base(api_base: &str) -> String {
    let trimmed = api_base.trim().trim_end_matches('/');
    let origin = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    let origin = match origin.strip_prefix("http") {
        Some(rest) => format!("ws{}", rest),
        None => origin.to_string(),
    };
    format!("{}/ws", origin)
}
