//! File-backed credential store: one directory per phone under a root.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::{domain::PhoneKey, errors::Error, messaging::port::CredentialStore, Result};

const CREDS_FILE: &str = "creds.json";

#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn session_dir(&self, phone: &PhoneKey) -> Result<PathBuf> {
        let dir = self.root.join(phone.as_str());
        if fs::metadata(&dir).await.is_ok_and(|md| !md.is_dir()) {
            return Err(Error::InvalidPath {
                path: dir,
                reason: "exists and is not a directory".to_string(),
            });
        }
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn save(&self, phone: &PhoneKey, creds: &serde_json::Value) -> Result<()> {
        let dir = self.session_dir(phone).await?;
        let path = dir.join(CREDS_FILE);
        let tmp = dir.join(format!(".{CREDS_FILE}.tmp"));

        // Write-then-rename so a crash never leaves a torn file behind.
        let data = serde_json::to_vec_pretty(creds)?;
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;

        debug!(phone = %phone, path = %path.display(), "credentials saved");
        Ok(())
    }
}
