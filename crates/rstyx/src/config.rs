//! Server configuration.
//!
//! Built in code with `Default` and the `with_*` setters and handed to the
//! server behind an `Arc`.

use std::collections::HashMap;

use crate::{
    auth::{
        des::{self, Key},
        dh::DhParams,
    },
    fcall::IOHDRSZ,
};

/// Authentication settings, used by both ends of an exchange.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Refuse attach without an authenticated credential.
    pub required: bool,
    /// Our identity: the server's authid, or the client's user name.
    pub id: String,
    /// Authentication domain offered by the server.
    pub domain: String,
    /// Key derived from the shared password.
    pub key: Option<Key>,
    /// Protocols offered or accepted, in preference order.
    pub protocols: Vec<String>,
    /// Channel algorithm the server asks for after authentication.
    pub security: Option<String>,
    pub dh: DhParams,
    /// Known users and their groups.
    pub users: HashMap<String, Vec<String>>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            required: false,
            id: String::new(),
            domain: String::new(),
            key: None,
            protocols: vec!["p9sk1".to_owned(), "p9sk2".to_owned()],
            security: None,
            dh: DhParams::default(),
            users: HashMap::new(),
        }
    }
}

impl AuthConfig {
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_owned();
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_owned();
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.key = Some(des::passtokey(password));
        self
    }

    pub fn with_protocols(mut self, protocols: &[&str]) -> Self {
        self.protocols = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_security(mut self, alg: Option<&str>) -> Self {
        self.security = alg.map(str::to_owned);
        self
    }

    pub fn with_user(mut self, user: &str, groups: &[&str]) -> Self {
        self.users.insert(
            user.to_owned(),
            groups.iter().map(|g| g.to_string()).collect(),
        );
        self
    }

    /// Groups recorded for `user`, empty when unknown.
    pub fn groups_of(&self, user: &str) -> Vec<String> {
        self.users.get(user).cloned().unwrap_or_default()
    }

    /// Whether any authentication protocol can run.
    pub fn is_enabled(&self) -> bool {
        self.key.is_some() && !self.protocols.is_empty()
    }
}

/// Settings of one server.
#[derive(Clone, Debug)]
pub struct Config {
    /// Largest message size offered in version negotiation.
    pub msize: u32,
    /// Connections served at once; further accepts wait.
    pub max_sessions: usize,
    /// Dialect registry key, or `None` to detect it from the first message.
    pub dialect: Option<String>,
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            msize: 8192 + IOHDRSZ,
            max_sessions: 64,
            dialect: None,
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    pub fn with_msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    pub fn with_max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = n.max(1);
        self
    }

    pub fn with_dialect(mut self, name: &str) -> Self {
        self.dialect = Some(name.to_owned());
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders() {
        let cfg = Config::default()
            .with_msize(16384)
            .with_max_sessions(0)
            .with_dialect("styx")
            .with_auth(
                AuthConfig::default()
                    .with_required(true)
                    .with_password("pw")
                    .with_user("glenda", &["sys", "adm"]),
            );
        assert_eq!(cfg.msize, 16384);
        assert_eq!(cfg.max_sessions, 1);
        assert_eq!(cfg.dialect.as_deref(), Some("styx"));
        assert!(cfg.auth.required && cfg.auth.is_enabled());
        assert_eq!(cfg.auth.groups_of("glenda"), vec!["sys", "adm"]);
        assert!(cfg.auth.groups_of("nobody").is_empty());
        assert!(!AuthConfig::default().is_enabled());
    }
}
