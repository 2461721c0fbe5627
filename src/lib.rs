pub mod api;
pub mod cli;
pub mod console;
pub mod live;
pub mod models;
pub mod transport;

use api::{ ApiError, BackendClient };
use cli::{ Args, Command, ProfileAction };
use log::{ info, warn };
use models::account::{ Credentials, ProfileUpdate, Registration, UserSummary };
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let ws_base = args.ws_base();
    info!("--- Core Configuration ---");
    info!("API Base: {}", args.api_base);
    info!("WebSocket Base: {}", ws_base);
    info!("Username: {}", if args.username.is_empty() { "(not set)" } else { args.username.as_str() });
    info!("-------------------------");

    let client = Arc::new(BackendClient::new(&args.api_base)?);

    match &args.command {
        Command::Register { email } => {
            require_credentials(&args)?;
            let registered = client.register(&Registration {
                username: args.username.clone(),
                email: email.clone(),
                password: args.password.clone(),
            }).await?;
            println!("Registered {} <{}>. You can now log in.", registered.username, registered.email);
        }
        Command::Login => {
            sign_in(&client, &args).await?;
            // Round-trip the session cookie before reporting success.
            let me = client.me().await?;
            println!("Signed in as {} <{}>", me.username, me.email);
        }
        Command::Users => {
            let me = sign_in(&client, &args).await?;
            let users = client.users().await?;
            console::print_directory(&users, &me.username);
        }
        Command::Profile { action: ProfileAction::Show } => {
            sign_in(&client, &args).await?;
            console::print_profile(&client.profile().await?);
        }
        Command::Profile { action: ProfileAction::Update { username, email, bio, avatar } } => {
            sign_in(&client, &args).await?;
            let current = client.profile().await?;
            let mut update = ProfileUpdate::from_profile(&current);
            if let Some(username) = username {
                update.username = username.clone();
            }
            if let Some(email) = email {
                update.email = email.clone();
            }
            if let Some(bio) = bio {
                update.bio = bio.clone();
            }
            update.avatar = avatar.clone();
            let saved = client.update_profile(&update).await?;
            println!("Profile saved.");
            console::print_profile(&saved);
        }
        Command::Chat { peer } => {
            let me = sign_in(&client, &args).await?;
            if peer == &me.username {
                return Err("Pick someone other than yourself to chat with".into());
            }
            let result = console::run_chat(Arc::clone(&client), &me, peer, &ws_base).await;
            if let Err(e) = client.logout().await {
                warn!("Logout failed: {}", e);
            }
            result?;
        }
    }

    Ok(())
}

fn require_credentials(args: &Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    if args.username.trim().is_empty() || args.password.is_empty() {
        return Err("Both --username and --password (or CHAT_USERNAME / CHAT_PASSWORD) are required".into());
    }
    Ok(())
}

async fn sign_in(
    client: &BackendClient,
    args: &Args
) -> Result<UserSummary, Box<dyn Error + Send + Sync>> {
    require_credentials(args)?;
    let credentials = Credentials {
        username: args.username.trim().to_string(),
        password: args.password.clone(),
    };
    match client.login(&credentials).await {
        Ok(user) => Ok(user),
        Err(e) => Err(format!("Login failed: {}", login_failure_reason(&e)).into()),
    }
}

fn login_failure_reason(e: &ApiError) -> String {
    match e.detail() {
        Some(detail) => detail.to_string(),
        None if e.is_unauthorized() => "the server rejected these credentials".to_string(),
        None => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_failure_prefers_server_detail() {
        let with_detail = ApiError::Status {
            status: reqwest::StatusCode::BAD_REQUEST,
            detail: Some("Invalid credentials".to_string()),
        };
        assert_eq!(login_failure_reason(&with_detail), "Invalid credentials");

        let forbidden = ApiError::Status { status: reqwest::StatusCode::FORBIDDEN, detail: None };
        assert_eq!(login_failure_reason(&forbidden), "the server rejected these credentials");

        let unavailable = ApiError::Status {
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            detail: None,
        };
        assert_eq!(login_failure_reason(&unavailable), unavailable.to_string());
    }
}
