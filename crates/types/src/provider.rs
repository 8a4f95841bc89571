//! Storage provider identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies an external storage provider a backup target can be linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Dropbox,
    GoogleDrive,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::StowageError;

    /// Parse a provider name or well-known alias into a [`Provider`].
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::UnknownProvider`] if the string does not match
    /// any known provider name or alias.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dropbox" => Ok(Self::Dropbox),
            "google_drive" | "google-drive" | "gdrive" | "googledrive" => Ok(Self::GoogleDrive),
            other => Err(crate::StowageError::UnknownProvider(other.to_string())),
        }
    }
}

impl Provider {
    /// Returns all known provider variants.
    #[must_use]
    pub fn all() -> &'static [Self] {
        &[Self::Dropbox, Self::GoogleDrive]
    }

    /// The canonical lowercase name, also used as the storage key prefix.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dropbox => "dropbox",
            Self::GoogleDrive => "google_drive",
        }
    }
}
