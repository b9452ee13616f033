//! Authentication and role-based access control.
//!
//! Two credential forms: HTTP Basic (and Bolt HELLO/LOGON, which carries the
//! same principal/credentials pair) and bearer tokens issued by
//! `/auth/token`. Passwords are stored as SHA-256 digests; tokens are opaque
//! uuids with a TTL. When auth is disabled every request runs as an
//! anonymous admin — the default for embedded and development use.

pub mod audit;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::config::AuthConfig;
use crate::{Error, Result};

/// Coarse permission classes checked at the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    Admin,
}

/// Roles map to permission sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Writer,
    Reader,
}

impl Role {
    pub fn allows(self, permission: Permission) -> bool {
        match self {
            Role::Admin => true,
            Role::Writer => matches!(permission, Permission::Read | Permission::Write),
            Role::Reader => matches!(permission, Permission::Read),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub roles: Vec<Role>,
    /// True when auth is disabled and the caller was not actually verified.
    pub anonymous: bool,
}

impl Identity {
    fn anonymous() -> Self {
        Self {
            username: "anonymous".into(),
            roles: vec![Role::Admin],
            anonymous: true,
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.roles.iter().any(|r| r.allows(permission))
    }
}

struct UserRecord {
    password_hash: String,
    roles: Vec<Role>,
}

struct TokenRecord {
    username: String,
    expires_at: Instant,
}

/// The authentication service shared by both listeners.
pub struct AuthService {
    enabled: bool,
    users: RwLock<HashMap<String, UserRecord>>,
    tokens: DashMap<String, TokenRecord>,
    token_ttl: Duration,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = HashMap::new();
        if config.enabled {
            if let Some((username, password)) = config.default_account.split_once(':') {
                users.insert(
                    username.to_owned(),
                    UserRecord {
                        password_hash: hash_password(password),
                        roles: vec![Role::Admin],
                    },
                );
            }
        }
        Self {
            enabled: config.enabled,
            users: RwLock::new(users),
            tokens: DashMap::new(),
            token_ttl: Duration::from_secs(config.token_ttl_secs),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn add_user(&self, username: &str, password: &str, roles: Vec<Role>) {
        self.users.write().insert(
            username.to_owned(),
            UserRecord { password_hash: hash_password(password), roles },
        );
    }

    /// Verify a username/password pair.
    pub fn authenticate_basic(&self, username: &str, password: &str) -> Result<Identity> {
        if !self.enabled {
            return Ok(Identity::anonymous());
        }
        let users = self.users.read();
        let record = users
            .get(username)
            .ok_or_else(|| Error::AuthnFailed("unknown user".into()))?;
        if record.password_hash != hash_password(password) {
            return Err(Error::AuthnFailed("invalid credentials".into()));
        }
        Ok(Identity {
            username: username.to_owned(),
            roles: record.roles.clone(),
            anonymous: false,
        })
    }

    /// Exchange credentials for a bearer token.
    pub fn issue_token(&self, username: &str, password: &str) -> Result<(String, Duration)> {
        let identity = self.authenticate_basic(username, password)?;
        let token = uuid::Uuid::new_v4().to_string();
        self.tokens.insert(
            token.clone(),
            TokenRecord {
                username: identity.username,
                expires_at: Instant::now() + self.token_ttl,
            },
        );
        Ok((token, self.token_ttl))
    }

    pub fn authenticate_bearer(&self, token: &str) -> Result<Identity> {
        if !self.enabled {
            return Ok(Identity::anonymous());
        }
        let record = self
            .tokens
            .get(token)
            .ok_or_else(|| Error::AuthnFailed("unknown token".into()))?;
        if record.expires_at < Instant::now() {
            drop(record);
            self.tokens.remove(token);
            return Err(Error::AuthnFailed("token expired".into()));
        }
        let username = record.username.clone();
        drop(record);
        let users = self.users.read();
        let user = users
            .get(&username)
            .ok_or_else(|| Error::AuthnFailed("user removed".into()))?;
        Ok(Identity {
            username,
            roles: user.roles.clone(),
            anonymous: false,
        })
    }

    pub fn revoke_token(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Resolve an `Authorization` header value (Basic or Bearer).
    pub fn authenticate_header(&self, header: Option<&str>) -> Result<Identity> {
        if !self.enabled {
            return Ok(Identity::anonymous());
        }
        let header = header.ok_or_else(|| Error::AuthnFailed("missing credentials".into()))?;
        if let Some(token) = header.strip_prefix("Bearer ") {
            return self.authenticate_bearer(token.trim());
        }
        if let Some(encoded) = header.strip_prefix("Basic ") {
            let decoded = BASE64
                .decode(encoded.trim())
                .map_err(|_| Error::AuthnFailed("malformed Basic credentials".into()))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| Error::AuthnFailed("malformed Basic credentials".into()))?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or_else(|| Error::AuthnFailed("malformed Basic credentials".into()))?;
            return self.authenticate_basic(username, password);
        }
        Err(Error::AuthnFailed("unsupported authorization scheme".into()))
    }

    /// Enforce a permission; the caller supplies the audited action name.
    pub fn authorize(&self, identity: &Identity, permission: Permission) -> Result<()> {
        if identity.can(permission) {
            Ok(())
        } else {
            Err(Error::AuthzDenied(format!(
                "user '{}' lacks {:?} permission",
                identity.username, permission
            )))
        }
    }
}

fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_service() -> AuthService {
        AuthService::new(&AuthConfig {
            enabled: true,
            default_account: "neo4j:password".into(),
            token_ttl_secs: 3600,
        })
    }

    #[test]
    fn test_disabled_auth_is_anonymous_admin() {
        let service = AuthService::new(&AuthConfig::default());
        let identity = service.authenticate_header(None).unwrap();
        assert!(identity.anonymous);
        assert!(identity.can(Permission::Admin));
    }

    #[test]
    fn test_basic_auth() {
        let service = enabled_service();
        assert!(service.authenticate_basic("neo4j", "password").is_ok());
        assert!(service.authenticate_basic("neo4j", "wrong").is_err());
        assert!(service.authenticate_basic("nobody", "password").is_err());
    }

    #[test]
    fn test_basic_header_roundtrip() {
        let service = enabled_service();
        let header = format!("Basic {}", BASE64.encode("neo4j:password"));
        let identity = service.authenticate_header(Some(&header)).unwrap();
        assert_eq!(identity.username, "neo4j");
        assert!(!identity.anonymous);
    }

    #[test]
    fn test_token_lifecycle() {
        let service = enabled_service();
        let (token, _ttl) = service.issue_token("neo4j", "password").unwrap();
        let identity = service
            .authenticate_header(Some(&format!("Bearer {token}")))
            .unwrap();
        assert_eq!(identity.username, "neo4j");

        service.revoke_token(&token);
        assert!(service.authenticate_bearer(&token).is_err());
    }

    #[test]
    fn test_role_permissions() {
        let service = enabled_service();
        service.add_user("reporter", "secret", vec![Role::Reader]);
        let identity = service.authenticate_basic("reporter", "secret").unwrap();
        assert!(identity.can(Permission::Read));
        assert!(!identity.can(Permission::Write));
        assert!(service.authorize(&identity, Permission::Write).is_err());
    }
}
