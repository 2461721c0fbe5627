use serde::{ Serialize, Deserialize };
use std::path::PathBuf;

/// Entry of the user directory, also returned by login and `accounts/me/`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl UserSummary {
    pub fn avatar_url(&self) -> Option<&str> {
        self.avatar.as_deref().filter(|url| !url.is_empty())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RegisteredUser {
    pub username: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Fields sent as multipart form data to `PUT accounts/profile/`.
#[derive(Clone, Debug, Default)]
pub struct ProfileUpdate {
    pub username: String,
    pub email: String,
    pub bio: String,
    pub avatar: Option<PathBuf>,
}

impl ProfileUpdate {
    /// Starts an update from the current profile so untouched fields are resent as-is.
    pub fn from_profile(profile: &Profile) -> Self {
        Self {
            username: profile.username.clone(),
            email: profile.email.clone(),
            bio: profile.bio.clone().unwrap_or_default(),
            avatar: None,
        }
    }
}
