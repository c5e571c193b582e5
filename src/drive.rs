// src/drive.rs

use crate::config::{StorageBackend, StorageSection};
use async_trait::async_trait;
use google_drive3::DriveHub;
use google_drive3::api::{File, Scope};
use google_drive3::common::GetToken;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use yup_oauth2::authorized_user::AuthorizedUserSecret;
use yup_oauth2::{AuthorizedUserAuthenticator, ServiceAccountAuthenticator};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("drive API error: {0}")]
    Drive(#[from] google_drive3::Error),
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("not a file: {0}")]
    InvalidPath(PathBuf),
    #[error("drive did not return a file id for {0}")]
    MissingFileId(String),
}

/// Publishes a local file and returns a shareable link to it.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn upload(&self, path: &Path, folder: Option<&str>) -> Result<String, StorageError>;
}

fn file_name(path: &Path) -> Result<String, StorageError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| StorageError::InvalidPath(path.to_path_buf()))
}

pub fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

/// Copies files under a local directory; `folder` becomes a subdirectory.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn upload(&self, path: &Path, folder: Option<&str>) -> Result<String, StorageError> {
        let name = file_name(path)?;
        let dir = match folder {
            Some(folder) => self.root.join(folder),
            None => self.root.clone(),
        };
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(&name);
        tokio::fs::copy(path, &dest).await?;
        let absolute = tokio::fs::canonicalize(&dest).await?;
        info!(file = %name, dest = %absolute.display(), "File published locally");
        Ok(format!("file://{}", absolute.display()))
    }
}

/// How the Drive hub obtains access tokens.
pub enum DriveCredentials {
    /// Service-account key file.
    ServiceAccount(PathBuf),
    /// OAuth client plus a user's refresh token.
    AuthorizedUser(AuthorizedUserSecret),
}

impl DriveCredentials {
    /// A configured key file wins; otherwise the refresh token named by
    /// `refresh_token_env`, looked up through `lookup`.
    pub fn resolve(
        section: &StorageSection,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, StorageError> {
        if let Some(key) = section
            .service_account_key
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            return Ok(Self::ServiceAccount(PathBuf::from(key)));
        }

        let Some(refresh_token) = lookup(&section.refresh_token_env).filter(|t| !t.trim().is_empty())
        else {
            return Err(StorageError::Auth(format!(
                "set storage.service_account_key or {}",
                section.refresh_token_env
            )));
        };
        if section.client_id.is_empty() || section.client_secret.is_empty() {
            return Err(StorageError::Auth(
                "storage.client_id and storage.client_secret are required with a refresh token"
                    .to_string(),
            ));
        }
        let secret: AuthorizedUserSecret = serde_json::from_value(json!({
            "type": "authorized_user",
            "client_id": section.client_id,
            "client_secret": section.client_secret,
            "refresh_token": refresh_token,
        }))
        .map_err(|e| StorageError::Auth(format!("invalid OAuth client: {e}")))?;
        Ok(Self::AuthorizedUser(secret))
    }
}

type Connector = HttpsConnector<HttpConnector>;

fn drive_hub<A: GetToken + 'static>(auth: A) -> DriveHub<Connector> {
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .build(),
        );
    DriveHub::new(client, auth)
}

/// Google Drive v3 uploads into shared or personal drives.
pub struct DriveStorage {
    hub: DriveHub<Connector>,
}

impl DriveStorage {
    pub fn new(hub: DriveHub<Connector>) -> Self {
        Self { hub }
    }

    pub async fn connect(credentials: DriveCredentials) -> Result<Self, StorageError> {
        let hub = match credentials {
            DriveCredentials::ServiceAccount(path) => {
                let key = yup_oauth2::read_service_account_key(&path)
                    .await
                    .map_err(|e| {
                        StorageError::Auth(format!(
                            "cannot read service account key {}: {e}",
                            path.display()
                        ))
                    })?;
                info!(account = %key.client_email, "Drive authorized as service account");
                drive_hub(ServiceAccountAuthenticator::builder(key).build().await?)
            }
            DriveCredentials::AuthorizedUser(secret) => {
                info!("Drive authorized with a user refresh token");
                drive_hub(AuthorizedUserAuthenticator::builder(secret).build().await?)
            }
        };
        Ok(Self::new(hub))
    }
}

#[async_trait]
impl FileStorage for DriveStorage {
    async fn upload(&self, path: &Path, folder: Option<&str>) -> Result<String, StorageError> {
        let name = file_name(path)?;
        let content = std::fs::File::open(path)?;
        let mime = mime_type(path)
            .parse()
            .map_err(|_| StorageError::InvalidPath(path.to_path_buf()))?;
        let metadata = File {
            name: Some(name.clone()),
            parents: folder.map(|f| vec![f.to_string()]),
            ..Default::default()
        };
        debug!(file = %name, folder = ?folder, "Uploading to Drive");

        let (_, created) = self
            .hub
            .files()
            .create(metadata)
            .supports_all_drives(true)
            .param("fields", "id")
            .add_scope(Scope::Full)
            .upload(content, mime)
            .await?;

        let id = created.id.ok_or_else(|| StorageError::MissingFileId(name.clone()))?;
        info!(file = %name, file_id = %id, "File uploaded to Drive");
        Ok(format!("https://drive.google.com/file/d/{id}/view"))
    }
}

pub async fn build_storage(section: &StorageSection) -> Result<Arc<dyn FileStorage>, StorageError> {
    match section.backend {
        StorageBackend::Local => {
            info!(dir = %section.local_dir, "Publishing files to a local directory");
            Ok(Arc::new(LocalStorage::new(&section.local_dir)))
        }
        StorageBackend::Drive => {
            let credentials = DriveCredentials::resolve(section, |key| std::env::var(key).ok())?;
            info!("Publishing files to Google Drive");
            Ok(Arc::new(DriveStorage::connect(credentials).await?))
        }
    }
}
