use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Everything the Repository Provider needs to clone, open and pull the tracked branch.
///
/// Built once by the CLI (YAML plus environment secrets) and checked with
/// [`GitConfig::validate`] before any repository work starts.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub username: String,
    pub password: Option<String>,
    pub public_key_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    /// Colon separated hex digest of the remote host key, e.g. `aa:bb:..`.
    pub fingerprint: Option<String>,
    pub pull_dir: PathBuf,
    pub url: String,
    pub branch: String,
    pub remote: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            username: "git2consul".to_string(),
            password: None,
            public_key_path: None,
            private_key_path: None,
            passphrase: None,
            fingerprint: None,
            pull_dir: PathBuf::from("/var/git2consul/data"),
            url: String::new(),
            branch: "master".to_string(),
            remote: "origin".to_string(),
        }
    }
}

impl fmt::Debug for GitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("public_key_path", &self.public_key_path)
            .field("private_key_path", &self.private_key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("fingerprint", &self.fingerprint)
            .field("pull_dir", &self.pull_dir)
            .field("url", &self.url)
            .field("branch", &self.branch)
            .field("remote", &self.remote)
            .finish()
    }
}

impl GitConfig {
    /// Checks the settings once so later stages can rely on them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() && !self.pull_dir.exists() {
            return Err(ConfigError::Missing("git.url"));
        }
        if self.pull_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("git.pull_dir"));
        }
        if self.branch.trim().is_empty() {
            return Err(ConfigError::Missing("git.branch"));
        }
        if self.remote.trim().is_empty() {
            return Err(ConfigError::Missing("git.remote"));
        }
        if self.private_key_path.is_some() && self.public_key_path.is_none() {
            return Err(ConfigError::IncompleteKeyPair);
        }
        self.fingerprint_bytes()?;
        Ok(())
    }

    /// Picks exactly one credential strategy; a password wins over a key pair.
    pub fn credentials(&self) -> Credentials {
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            return Credentials::UserPass {
                username: self.username.clone(),
                password: password.to_string(),
            };
        }
        if let Some(private_key) = &self.private_key_path {
            return Credentials::SshKey {
                username: self.username.clone(),
                public_key: self.public_key_path.clone(),
                private_key: private_key.clone(),
                passphrase: self.passphrase.clone().filter(|p| !p.is_empty()),
            };
        }
        Credentials::Default
    }

    pub fn fingerprint_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        match self.fingerprint.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => parse_fingerprint(raw).map(Some),
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            url = %self.url,
            branch = %self.branch,
            remote = %self.remote,
            pull_dir = %self.pull_dir.display(),
            "Loaded git config"
        );
        debug!(?self, "Git config loaded (full debug)");
    }
}

/// The credential strategy handed to libgit2 callbacks.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    UserPass {
        username: String,
        password: String,
    },
    SshKey {
        username: String,
        public_key: Option<PathBuf>,
        private_key: PathBuf,
        passphrase: Option<String>,
    },
    Default,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::UserPass { username, .. } => f
                .debug_struct("UserPass")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::SshKey {
                username,
                public_key,
                private_key,
                ..
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("public_key", public_key)
                .field("private_key", private_key)
                .finish_non_exhaustive(),
            Credentials::Default => f.write_str("Default"),
        }
    }
}

/// Parses `aa:bb:cc` style digests. Only MD5 (16 bytes) and SHA-256 (32 bytes) lengths
/// are accepted since those are what libgit2 reports for ssh host keys.
pub fn parse_fingerprint(raw: &str) -> Result<Vec<u8>, ConfigError> {
    let bytes = raw
        .trim()
        .split(':')
        .map(|part| {
            if part.len() != 2 {
                return Err(ConfigError::Fingerprint(format!(
                    "segment {part:?} is not two hex digits"
                )));
            }
            u8::from_str_radix(part, 16)
                .map_err(|e| ConfigError::Fingerprint(format!("segment {part:?}: {e}")))
        })
        .collect::<Result<Vec<u8>, _>>()?;
    match bytes.len() {
        16 | 32 => Ok(bytes),
        n => Err(ConfigError::Fingerprint(format!(
            "expected 16 or 32 bytes, got {n}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GitConfig {
        GitConfig {
            url: "https://example.com/repo.git".into(),
            ..GitConfig::default()
        }
    }

    #[test]
    fn password_overrides_key_pair() {
        let cfg = GitConfig {
            password: Some("hunter2".into()),
            public_key_path: Some("/keys/id_rsa.pub".into()),
            private_key_path: Some("/keys/id_rsa".into()),
            ..config()
        };
        assert!(matches!(cfg.credentials(), Credentials::UserPass { .. }));
    }

    #[test]
    fn key_pair_used_without_password() {
        let cfg = GitConfig {
            password: Some(String::new()),
            public_key_path: Some("/keys/id_rsa.pub".into()),
            private_key_path: Some("/keys/id_rsa".into()),
            ..config()
        };
        match cfg.credentials() {
            Credentials::SshKey { private_key, .. } => {
                assert_eq!(private_key, PathBuf::from("/keys/id_rsa"))
            }
            other => panic!("expected ssh key credentials, got {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_default_credentials() {
        assert_eq!(config().credentials(), Credentials::Default);
    }

    #[test]
    fn parses_md5_fingerprint() {
        let raw = "16:27:ac:a5:76:28:2d:36:63:1b:56:4d:eb:df:a6:48";
        let bytes = parse_fingerprint(raw).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 0x16);
        assert_eq!(bytes[15], 0x48);
    }

    #[test]
    fn rejects_malformed_fingerprint() {
        assert!(parse_fingerprint("zz:01").is_err());
        assert!(parse_fingerprint("01:02:03").is_err());
        assert!(parse_fingerprint("abc").is_err());
    }

    #[test]
    fn validate_requires_url_for_fresh_clone() {
        let cfg = GitConfig {
            pull_dir: "/definitely/not/here".into(),
            ..GitConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Missing("git.url")));
    }

    #[test]
    fn validate_rejects_private_key_without_public_key() {
        let cfg = GitConfig {
            private_key_path: Some("/keys/id_rsa".into()),
            ..config()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::IncompleteKeyPair));
    }

    #[test]
    fn debug_redacts_secrets() {
        let cfg = GitConfig {
            password: Some("hunter2".into()),
            ..config()
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
        let creds = format!("{:?}", cfg.credentials());
        assert!(!creds.contains("hunter2"));
    }
}
