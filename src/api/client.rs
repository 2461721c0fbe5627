use async_trait::async_trait;
use log::{ debug, info };
use reqwest::cookie::{ CookieStore, Jar };
use reqwest::multipart::{ Form, Part };
use reqwest::{ Client as HttpClient, Response };
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use url::Url;

use super::{ extract_detail, ApiError, MessageApi };
use crate::models::account::{
    Credentials,
    Profile,
    ProfileUpdate,
    RegisteredUser,
    Registration,
    UserSummary,
};
use crate::models::chat::{ Message, OutgoingMessage };

/// Session-authenticated REST client. The cookie jar is shared with the live channel handshake.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: HttpClient,
    base: Url,
    jar: Arc<Jar>,
}

impl BackendClient {
    pub fn new(api_base: &str) -> Result<Self, ApiError> {
        let mut base = api_base.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)?;
        let jar = Arc::new(Jar::default());
        let http = HttpClient::builder().cookie_provider(Arc::clone(&jar)).build()?;
        Ok(Self { http, base, jar })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `Cookie` header value for the current session, if one has been established.
    pub fn session_cookie(&self) -> Option<String> {
        self.jar
            .cookies(&self.base)
            .and_then(|value| value.to_str().ok().map(str::to_owned))
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base.join(path)?)
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = extract_detail(&body);
        debug!("Request failed with {}: {}", status, body);
        Err(ApiError::Status { status, detail })
    }

    pub async fn me(&self) -> Result<UserSummary, ApiError> {
        let response = self.http.get(self.endpoint("accounts/me/")?).send().await?;
        Self::read_json(response).await
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<UserSummary, ApiError> {
        let response = self.http
            .post(self.endpoint("accounts/login/")?)
            .json(credentials)
            .send().await?;
        let user: UserSummary = Self::read_json(response).await?;
        info!("Logged in as {}", user.username);
        Ok(user)
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        let response = self.http.post(self.endpoint("accounts/logout/")?).send().await?;
        Self::check_status(response).await?;
        info!("Logged out");
        Ok(())
    }

    pub async fn register(&self, registration: &Registration) -> Result<RegisteredUser, ApiError> {
        let response = self.http
            .post(self.endpoint("accounts/register/")?)
            .json(registration)
            .send().await?;
        Self::read_json(response).await
    }

    pub async fn profile(&self) -> Result<Profile, ApiError> {
        let response = self.http.get(self.endpoint("accounts/profile/")?).send().await?;
        Self::read_json(response).await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<Profile, ApiError> {
        let mut form = Form::new()
            .text("username", update.username.clone())
            .text("email", update.email.clone())
            .text("bio", update.bio.clone());
        if let Some(path) = &update.avatar {
            form = form.part("avatar", avatar_part(path).await?);
        }
        let response = self.http
            .put(self.endpoint("accounts/profile/")?)
            .multipart(form)
            .send().await?;
        Self::read_json(response).await
    }

    pub async fn users(&self) -> Result<Vec<UserSummary>, ApiError> {
        let response = self.http.get(self.endpoint("accounts/users/")?).send().await?;
        Self::read_json(response).await
    }

    fn messages_endpoint(&self, room: &str) -> Result<Url, ApiError> {
        self.endpoint(&format!("chat/messages/{}/", room))
    }
}

async fn avatar_part(path: &Path) -> Result<Part, ApiError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| ApiError::Avatar {
        path: path.display().to_string(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "avatar".to_string());
    Ok(Part::bytes(bytes).file_name(file_name))
}

#[async_trait]
impl MessageApi for BackendClient {
    async fn fetch_messages(&self, room: &str) -> Result<Vec<Message>, ApiError> {
        let response = self.http.get(self.messages_endpoint(room)?).send().await?;
        Self::read_json(response).await
    }

    async fn post_message(
        &self,
        room: &str,
        message: &OutgoingMessage
    ) -> Result<Message, ApiError> {
        let response = self.http
            .post(self.messages_endpoint(room)?)
            .json(message)
            .send().await?;
        Self::read_json(response).await
    }
}
