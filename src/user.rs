//! User records and the lookup callback invoked after authentication.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;

use crate::{auth::ConnMeta, error::ServerError};

/// An account record shaped after a Unix passwd entry. Immutable once
/// produced by the lookup callback. The uid/gid fields stay textual until
/// a child process is spawned, where a non-numeric value refuses the
/// request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password_flag: String,
    pub uid: String,
    pub gid: String,
    pub gecos: String,
    pub home_dir: String,
    pub shell: String,
    pub extensions: HashMap<String, String>,
}

impl User {
    /// Numeric uid/gid for spawning children under this account.
    pub fn credentials(&self) -> Result<(u32, u32), ServerError> {
        let uid = self
            .uid
            .parse::<u32>()
            .map_err(|_| ServerError::InvalidCredentials(self.username.clone()))?;
        let gid = self
            .gid
            .parse::<u32>()
            .map_err(|_| ServerError::InvalidCredentials(self.username.clone()))?;
        Ok((uid, gid))
    }
}

/// Accept only names safe to hand to `login`: `[A-Za-z_][A-Za-z0-9_-]*`.
pub fn valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Resolve the account record for an authenticated connection. A lookup
/// failure closes the connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn lookup(&self, meta: &ConnMeta) -> color_eyre::Result<User>;
}

/// Lookup against a passwd-format file, `/etc/passwd` by default.
pub struct UnixUserLookup {
    passwd_path: PathBuf,
}

pub const PASSWD_PATH: &str = "/etc/passwd";

impl Default for UnixUserLookup {
    fn default() -> Self {
        UnixUserLookup {
            passwd_path: PathBuf::from(PASSWD_PATH),
        }
    }
}

impl UnixUserLookup {
    pub fn new(passwd_path: impl Into<PathBuf>) -> Self {
        UnixUserLookup {
            passwd_path: passwd_path.into(),
        }
    }

    fn find_in(content: &str, username: &str) -> Result<User, ServerError> {
        content
            .lines()
            .filter_map(parse_passwd_line)
            .find(|user| user.username == username)
            .ok_or_else(|| ServerError::UserNotFound(username.into()))
    }
}

#[async_trait]
impl UserLookup for UnixUserLookup {
    async fn lookup(&self, meta: &ConnMeta) -> color_eyre::Result<User> {
        let content = tokio::fs::read_to_string(&self.passwd_path)
            .await
            .map_err(|error| ServerError::PermissionDenied(error.to_string()))?;
        Ok(Self::find_in(&content, &meta.username)?)
    }
}

fn parse_passwd_line(line: &str) -> Option<User> {
    let mut fields = line.split(':');
    let user = User {
        username: fields.next()?.to_string(),
        password_flag: fields.next()?.to_string(),
        uid: fields.next()?.to_string(),
        gid: fields.next()?.to_string(),
        gecos: fields.next()?.to_string(),
        home_dir: fields.next()?.to_string(),
        shell: fields.next()?.to_string(),
        extensions: HashMap::new(),
    };
    // A record has exactly seven fields.
    if fields.next().is_some() {
        return None;
    }
    Some(user)
}

#[cfg(test)]
mod tests {
    use super::{parse_passwd_line, valid_username, UnixUserLookup};
    use crate::error::ServerError;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
alice:x:1000:1000:Alice:/home/alice:/bin/zsh";

    #[test]
    fn parses_complete_records() {
        let user = parse_passwd_line("alice:x:1000:1000:Alice:/home/alice:/bin/zsh").unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.uid, "1000");
        assert_eq!(user.gid, "1000");
        assert_eq!(user.home_dir, "/home/alice");
        assert_eq!(user.shell, "/bin/zsh");
        assert_eq!(user.credentials().unwrap(), (1000, 1000));
    }

    #[test]
    fn rejects_malformed_records() {
        assert!(parse_passwd_line("alice:x:1000").is_none());
        assert!(parse_passwd_line("a:b:c:d:e:f:g:h").is_none());
    }

    #[test]
    fn finds_user_by_name() {
        let user = UnixUserLookup::find_in(PASSWD, "alice").unwrap();
        assert_eq!(user.uid, "1000");
        let missing = UnixUserLookup::find_in(PASSWD, "mallory");
        assert!(matches!(missing, Err(ServerError::UserNotFound(_))));
    }

    #[test]
    fn non_numeric_uid_is_rejected() {
        let user = parse_passwd_line("svc:x:abc:100:svc:/:/bin/false").unwrap();
        assert!(matches!(
            user.credentials(),
            Err(ServerError::InvalidCredentials(_))
        ));
    }

    #[test]
    fn username_validation() {
        assert!(valid_username("alice"));
        assert!(valid_username("_daemon"));
        assert!(valid_username("web-user_2"));
        assert!(!valid_username(""));
        assert!(!valid_username("2fast"));
        assert!(!valid_username("alice;reboot"));
        assert!(!valid_username("-f"));
        assert!(!valid_username("a b"));
    }
}
