//! Service token shared between the chatdesk front end and the server.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::{Error, Result};

/// Service token for front end to backend communication
#[derive(Debug, Clone)]
pub struct ServiceToken {
    /// Random 256-bit token
    pub token: [u8; 32],
}

impl ServiceToken {
    /// Generate a new service token
    pub fn generate() -> Self {
        Self {
            token: rand::random(),
        }
    }

    /// Base64 form sent in the `Authorization: Bearer` header
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.token)
    }

    /// Write token to file with restricted permissions (0600)
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.encoded())?;
        fs::set_permissions(path, Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Read token from file
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let encoded = fs::read_to_string(path)?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Other(format!("Invalid token encoding: {}", e)))?;

        let token: [u8; 32] = decoded.try_into().map_err(|_| Error::InvalidToken)?;

        Ok(Self { token })
    }

    /// Reuse the token on disk, or generate and persist a fresh one
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::read_from_file(path);
        }
        let token = Self::generate();
        token.write_to_file(path)?;
        Ok(token)
    }

    /// Verify a token matches
    pub fn verify(&self, candidate: &[u8]) -> bool {
        candidate == self.token
    }
}
