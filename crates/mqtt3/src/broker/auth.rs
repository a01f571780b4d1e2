//! Credential checks for incoming connections
//!
//! The broker only consults the [`AuthProvider`] trait; which provider is used
//! follows from [`AuthConfig`].

use super::config::AuthConfig;
use crate::protocol::{ConnectPacket, ConnectReturnCode};
use crate::{MqttError, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, Salt, SaltString};
use argon2::Argon2;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Authentication result from an auth provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub authenticated: bool,
    /// Sent in the CONNACK when authentication fails.
    pub return_code: ConnectReturnCode,
    pub user_id: Option<String>,
}

impl AuthResult {
    #[must_use]
    pub fn success() -> Self {
        Self {
            authenticated: true,
            return_code: ConnectReturnCode::Accepted,
            user_id: None,
        }
    }

    #[must_use]
    pub fn success_with_user(user_id: String) -> Self {
        Self {
            authenticated: true,
            return_code: ConnectReturnCode::Accepted,
            user_id: Some(user_id),
        }
    }

    #[must_use]
    pub fn fail(return_code: ConnectReturnCode) -> Self {
        Self {
            authenticated: false,
            return_code,
            user_id: None,
        }
    }
}

pub type AuthFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub trait AuthProvider: Send + Sync {
    /// Authenticate a client connection
    ///
    /// # Errors
    ///
    /// Returns an error if the check itself fails; a rejected client is an
    /// `Ok` result with `authenticated == false`.
    fn authenticate<'a>(
        &'a self,
        connect: &'a ConnectPacket,
        client_addr: SocketAddr,
    ) -> AuthFuture<'a, AuthResult>;

    fn authorize_publish<'a>(
        &'a self,
        client_id: &'a str,
        user_id: Option<&'a str>,
        topic: &'a str,
    ) -> AuthFuture<'a, bool>;

    fn authorize_subscribe<'a>(
        &'a self,
        client_id: &'a str,
        user_id: Option<&'a str>,
        topic_filter: &'a str,
    ) -> AuthFuture<'a, bool>;
}

/// Accepts every client and every topic.
#[derive(Debug, Clone, Default)]
pub struct AllowAllAuthProvider;

impl AuthProvider for AllowAllAuthProvider {
    fn authenticate<'a>(
        &'a self,
        _connect: &'a ConnectPacket,
        _client_addr: SocketAddr,
    ) -> AuthFuture<'a, AuthResult> {
        Box::pin(async move { Ok(AuthResult::success()) })
    }

    fn authorize_publish<'a>(
        &'a self,
        _client_id: &'a str,
        _user_id: Option<&'a str>,
        _topic: &'a str,
    ) -> AuthFuture<'a, bool> {
        Box::pin(async move { Ok(true) })
    }

    fn authorize_subscribe<'a>(
        &'a self,
        _client_id: &'a str,
        _user_id: Option<&'a str>,
        _topic_filter: &'a str,
    ) -> AuthFuture<'a, bool> {
        Box::pin(async move { Ok(true) })
    }
}

/// Username/password provider backed by Argon2 hashes.
#[derive(Debug)]
pub struct PasswordAuthProvider {
    users: Arc<RwLock<HashMap<String, String>>>,
    password_file: Option<PathBuf>,
    allow_anonymous: bool,
}

impl Default for PasswordAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordAuthProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            password_file: None,
            allow_anonymous: false,
        }
    }

    /// Loads `username:password_hash` lines from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let provider = Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            password_file: Some(path.as_ref().to_path_buf()),
            allow_anonymous: false,
        };
        provider.load_password_file().await?;
        Ok(provider)
    }

    #[must_use]
    pub fn with_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    /// Loads or reloads the password file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read
    pub async fn load_password_file(&self) -> Result<()> {
        let Some(ref path) = self.password_file else {
            return Ok(());
        };

        let content = fs::read_to_string(path).await.map_err(|e| {
            MqttError::Configuration(format!(
                "Failed to read password file {}: {}",
                path.display(),
                e
            ))
        })?;

        let users = parse_password_file(&content);
        let count = users.len();
        *self.users.write().await = users;

        info!("Loaded {} users from password file: {}", count, path.display());
        Ok(())
    }

    /// Adds a user with a plaintext password, hashing it with Argon2.
    ///
    /// # Errors
    ///
    /// Returns an error if hashing fails
    pub async fn add_user(&self, username: String, password: &str) -> Result<()> {
        let password_hash = Self::hash_password(password)?;
        self.users.write().await.insert(username, password_hash);
        Ok(())
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Hashes a password with a random salt.
    ///
    /// # Errors
    ///
    /// Returns an error if salt generation or hashing fails
    pub fn hash_password(password: &str) -> Result<String> {
        let mut bytes = [0u8; Salt::RECOMMENDED_LENGTH];
        getrandom::fill(&mut bytes).map_err(|e| {
            error!("Failed to generate random salt: {}", e);
            MqttError::AuthenticationFailed
        })?;
        let salt = SaltString::encode_b64(&bytes).map_err(|e| {
            error!("Failed to encode salt: {}", e);
            MqttError::AuthenticationFailed
        })?;
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| {
                error!("Failed to hash password: {}", e);
                MqttError::AuthenticationFailed
            })
    }

    /// # Errors
    ///
    /// Returns an error if `hash` is not a valid PHC string
    pub fn verify_password(password: &[u8], hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| {
            error!("Failed to parse password hash: {}", e);
            MqttError::AuthenticationFailed
        })?;
        Ok(Argon2::default()
            .verify_password(password, &parsed_hash)
            .is_ok())
    }
}

/// Parses `username:hash` lines, skipping blanks, comments and bad lines.
pub fn parse_password_file(content: &str) -> HashMap<String, String> {
    let mut users = HashMap::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((username, hash)) = line.split_once(':') else {
            warn!(
                "Invalid format in password file at line {}: {}",
                index + 1,
                line
            );
            continue;
        };
        let username = username.trim();
        if username.is_empty() {
            warn!("Empty username in password file at line {}", index + 1);
            continue;
        }
        users.insert(username.to_string(), hash.trim().to_string());
    }
    users
}

impl AuthProvider for PasswordAuthProvider {
    fn authenticate<'a>(
        &'a self,
        connect: &'a ConnectPacket,
        _client_addr: SocketAddr,
    ) -> AuthFuture<'a, AuthResult> {
        Box::pin(async move {
            let (Some(username), Some(password)) = (&connect.username, &connect.password) else {
                if self.allow_anonymous && connect.username.is_none() {
                    debug!("Anonymous connection allowed");
                    return Ok(AuthResult::success());
                }
                return Ok(AuthResult::fail(ConnectReturnCode::BadUsernameOrPassword));
            };

            let users = self.users.read().await;
            let Some(password_hash) = users.get(username) else {
                warn!("Authentication failed for user: {username} (user not found)");
                return Ok(AuthResult::fail(ConnectReturnCode::BadUsernameOrPassword));
            };

            match Self::verify_password(password, password_hash) {
                Ok(true) => {
                    debug!("Authentication successful for user: {username}");
                    Ok(AuthResult::success_with_user(username.clone()))
                }
                Ok(false) => {
                    warn!("Authentication failed for user: {username} (wrong password)");
                    Ok(AuthResult::fail(ConnectReturnCode::BadUsernameOrPassword))
                }
                Err(e) => {
                    error!("Argon2 verification error for user {username}: {e}");
                    Ok(AuthResult::fail(ConnectReturnCode::NotAuthorized))
                }
            }
        })
    }

    fn authorize_publish<'a>(
        &'a self,
        _client_id: &'a str,
        _user_id: Option<&'a str>,
        _topic: &'a str,
    ) -> AuthFuture<'a, bool> {
        Box::pin(async move { Ok(true) })
    }

    fn authorize_subscribe<'a>(
        &'a self,
        _client_id: &'a str,
        _user_id: Option<&'a str>,
        _topic_filter: &'a str,
    ) -> AuthFuture<'a, bool> {
        Box::pin(async move { Ok(true) })
    }
}

/// Builds the provider selected by `config`.
///
/// # Errors
///
/// Returns an error if the password file cannot be loaded
pub async fn create_auth_provider(config: &AuthConfig) -> Result<Arc<dyn AuthProvider>> {
    match config.password_file {
        Some(ref path) => {
            let provider = PasswordAuthProvider::from_file(path)
                .await?
                .with_anonymous(config.allow_anonymous);
            Ok(Arc::new(provider))
        }
        None if config.allow_anonymous => Ok(Arc::new(AllowAllAuthProvider)),
        None => Err(MqttError::Configuration(
            "anonymous access disabled but no password file configured".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn addr() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[tokio::test]
    async fn test_allow_all_provider() {
        let provider = AllowAllAuthProvider;
        let connect = ConnectPacket::new("test-client");

        let result = provider.authenticate(&connect, addr()).await.unwrap();
        assert!(result.authenticated);
        assert_eq!(result.return_code, ConnectReturnCode::Accepted);
        assert!(provider
            .authorize_publish("test-client", None, "a/b")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_password_provider() {
        let provider = PasswordAuthProvider::new();
        provider.add_user("alice".to_string(), "secret").await.unwrap();
        assert_eq!(provider.user_count().await, 1);

        let good = ConnectPacket::new("c1").with_credentials("alice", b"secret");
        let result = provider.authenticate(&good, addr()).await.unwrap();
        assert!(result.authenticated);
        assert_eq!(result.user_id.as_deref(), Some("alice"));

        let bad = ConnectPacket::new("c1").with_credentials("alice", b"nope");
        let result = provider.authenticate(&bad, addr()).await.unwrap();
        assert!(!result.authenticated);
        assert_eq!(result.return_code, ConnectReturnCode::BadUsernameOrPassword);

        let unknown = ConnectPacket::new("c1").with_credentials("bob", b"secret");
        assert!(!provider.authenticate(&unknown, addr()).await.unwrap().authenticated);
    }

    #[tokio::test]
    async fn test_anonymous_toggle() {
        let anonymous = ConnectPacket::new("c1");

        let strict = PasswordAuthProvider::new();
        assert!(!strict.authenticate(&anonymous, addr()).await.unwrap().authenticated);

        let relaxed = PasswordAuthProvider::new().with_anonymous(true);
        assert!(relaxed.authenticate(&anonymous, addr()).await.unwrap().authenticated);
    }

    #[tokio::test]
    async fn test_from_file() {
        let hash = PasswordAuthProvider::hash_password("pw").unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# users").unwrap();
        writeln!(file, "carol:{hash}").unwrap();
        writeln!(file, "malformed-line").unwrap();
        writeln!(file).unwrap();

        let provider = PasswordAuthProvider::from_file(file.path()).await.unwrap();
        assert_eq!(provider.user_count().await, 1);

        let connect = ConnectPacket::new("c").with_credentials("carol", b"pw");
        assert!(provider.authenticate(&connect, addr()).await.unwrap().authenticated);
    }

    #[test]
    fn test_parse_password_file() {
        let users = parse_password_file("a:h1\n:h2\nb : h3 \n#c:h4\n");
        assert_eq!(users.len(), 2);
        assert_eq!(users.get("b").map(String::as_str), Some("h3"));
    }

    #[tokio::test]
    async fn test_create_provider() {
        assert!(create_auth_provider(&AuthConfig::default()).await.is_ok());
        let strict = AuthConfig::default().with_allow_anonymous(false);
        assert!(create_auth_provider(&strict).await.is_err());
    }
}
