//! Mirror credentials.
//!
//! Credentials live in a project's `meta:/credentials.json` as a JSON array
//! of tagged objects. A mirror names its credential explicitly through
//! `credentialId`, or the engine picks the first enabled credential whose
//! host pattern matches the remote host.
use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type")]
pub enum CredentialKind {
    None,
    #[serde(rename_all = "camelCase")]
    Password { username: String, password: String },
    #[serde(rename_all = "camelCase")]
    PublicKey {
        username: String,
        public_key: String,
        private_key: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AccessToken { token: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Regular expressions over remote host names, consulted when a mirror
    /// does not name a credential.
    #[serde(default)]
    pub hostname_patterns: Vec<String>,
    #[serde(flatten)]
    pub kind: CredentialKind,
}

fn default_true() -> bool {
    true
}

impl Credential {
    fn matches_host(&self, host: &str) -> bool {
        self.hostname_patterns.iter().any(|pattern| {
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(host),
                Err(e) => {
                    log::warn!("bad hostname pattern '{}' of credential {}: {}", pattern, self.id, e);
                    false
                }
            }
        })
    }
}

/// Picks the credential for a mirror: by id when given, by host pattern
/// otherwise.
pub(crate) fn resolve<'a>(
    credentials: &'a [Credential],
    credential_id: Option<&str>,
    host: &str,
) -> Result<&'a Credential, Error> {
    match credential_id {
        Some(id) => credentials
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::Mirror(format!("no credential with id {}", id))),
        None => credentials
            .iter()
            .filter(|c| c.enabled)
            .find(|c| c.matches_host(host))
            .ok_or_else(|| Error::Mirror(format!("no credential matches host {}", host))),
    }
}

/// Remote callbacks authenticating with `credential`.
pub(crate) fn remote_callbacks(credential: Option<&Credential>) -> git2::RemoteCallbacks<'static> {
    let kind = credential.map(|c| c.kind.clone());
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, _allowed| match &kind {
        None | Some(CredentialKind::None) => git2::Cred::default(),
        Some(CredentialKind::Password { username, password }) => {
            git2::Cred::userpass_plaintext(username, password)
        }
        Some(CredentialKind::AccessToken { token }) => {
            git2::Cred::userpass_plaintext(username_from_url.unwrap_or("token"), token)
        }
        Some(CredentialKind::PublicKey {
            username,
            public_key,
            private_key,
            passphrase,
        }) => git2::Cred::ssh_key_from_memory(
            username,
            Some(public_key),
            private_key,
            passphrase.as_deref(),
        ),
    });
    callbacks
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn credentials() -> Vec<Credential> {
        serde_json::from_value(json!([
            {
                "id": "github-token",
                "type": "ACCESS_TOKEN",
                "token": "t0ken",
                "hostnamePatterns": ["^github\\.com$"]
            },
            {
                "id": "corp-password",
                "type": "PASSWORD",
                "username": "mirror",
                "password": "hunter2",
                "hostnamePatterns": [".*\\.corp\\.example\\.com$"]
            },
            {
                "id": "disabled",
                "type": "NONE",
                "enabled": false,
                "hostnamePatterns": [".*"]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn test_tagged_shape() {
        let creds = credentials();
        assert_eq!(
            creds[0].kind,
            CredentialKind::AccessToken {
                token: "t0ken".to_string()
            }
        );
        assert!(creds[0].enabled);
        assert!(!creds[2].enabled);
    }

    #[test]
    fn test_resolve_by_id() {
        let creds = credentials();
        let c = resolve(&creds, Some("corp-password"), "anything").unwrap();
        assert_eq!(c.id, "corp-password");
        assert!(resolve(&creds, Some("nope"), "anything").is_err());
    }

    #[test]
    fn test_resolve_by_host_pattern() {
        let creds = credentials();
        let c = resolve(&creds, None, "github.com").unwrap();
        assert_eq!(c.id, "github-token");
        let c = resolve(&creds, None, "git.corp.example.com").unwrap();
        assert_eq!(c.id, "corp-password");
        // The catch-all credential is disabled, so an unknown host fails.
        assert!(matches!(
            resolve(&creds, None, "unknown.example.org"),
            Err(Error::Mirror(_))
        ));
    }
}
