//! Resolution of `user[:group]` specifications into numeric ids.

use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RuntimeError;

/// Account used when no user specification is given.
pub const DEFAULT_USER: &str = "nobody";

/// The uid/gid pair the daemon drops privileges to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// Create credentials from raw ids.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Parse a `user`, `user:group`, `uid` or `uid:gid` specification.
    ///
    /// An absent or empty specification resolves to the `nobody` account.
    /// Numeric parts are taken as-is without consulting the user database.
    pub fn parse(spec: Option<&str>) -> Result<Self, RuntimeError> {
        let spec = spec.map(str::trim).unwrap_or_default();
        if spec.is_empty() {
            return Self::parse(Some(DEFAULT_USER));
        }

        let (user_part, group_part) = match spec.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (spec, None),
        };
        if user_part.is_empty() {
            return Err(RuntimeError::InvalidArgument(format!(
                "missing user in '{}'",
                spec
            )));
        }

        let (uid, gid) = match group_part {
            None => resolve_user(user_part)?,
            Some("") => {
                return Err(RuntimeError::InvalidArgument(format!(
                    "missing group in '{}'",
                    spec
                )))
            }
            // The primary group is not needed, so a numeric uid skips the
            // user database entirely.
            Some(group) => (resolve_uid(user_part)?, resolve_group(group)?),
        };

        debug!("Resolved '{}' to uid {} gid {}", spec, uid, gid);
        Ok(Self { uid, gid })
    }

    /// The user id as a nix type.
    pub fn user(&self) -> Uid {
        Uid::from_raw(self.uid)
    }

    /// The group id as a nix type.
    pub fn group(&self) -> Gid {
        Gid::from_raw(self.gid)
    }
}

impl std::fmt::Display for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Resolve a user part to its uid and primary gid.
fn resolve_user(user: &str) -> Result<(u32, u32), RuntimeError> {
    if let Ok(uid) = user.parse::<u32>() {
        // A bare uid with no passwd entry falls back to gid == uid.
        let gid = User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.gid.as_raw())
            .unwrap_or(uid);
        return Ok((uid, gid));
    }

    let entry = lookup_user(user)?;
    Ok((entry.uid.as_raw(), entry.gid.as_raw()))
}

fn resolve_uid(user: &str) -> Result<u32, RuntimeError> {
    match user.parse::<u32>() {
        Ok(uid) => Ok(uid),
        Err(_) => Ok(lookup_user(user)?.uid.as_raw()),
    }
}

fn lookup_user(name: &str) -> Result<User, RuntimeError> {
    match User::from_name(name) {
        Ok(Some(entry)) => Ok(entry),
        Ok(None) => Err(RuntimeError::UnknownUser(name.to_string())),
        Err(e) => Err(RuntimeError::UserLookup(format!("{}: {}", name, e))),
    }
}

fn resolve_group(group: &str) -> Result<u32, RuntimeError> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }

    match Group::from_name(group) {
        Ok(Some(entry)) => Ok(entry.gid.as_raw()),
        Ok(None) => Err(RuntimeError::UnknownGroup(group.to_string())),
        Err(e) => Err(RuntimeError::UserLookup(format!("{}: {}", group, e))),
    }
}

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod tests;
