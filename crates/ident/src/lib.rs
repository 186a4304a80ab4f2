//! Identity resolution and impersonation for credentialed launches.
//!
//! A launcher that may run a child under another account validates the
//! account when it is configured, not when the child is spawned: the caller
//! learns about a failed logon before any pipes or process groups exist.
//! [`resolve`] performs that validation and produces a [`Token`], which can
//! later be assumed for the duration of a spawn ([`Token::impersonate`]) or
//! adopted permanently by the child between fork and exec ([`Token::adopt`]).

use log::warn;
use nix::{
    errno::Errno,
    unistd::{Gid, Uid, User, initgroups, setegid, seteuid, setgid, setuid},
};
use std::{error, ffi::CString, fmt};

/// Errors validating or assuming an identity.
#[derive(Debug)]
pub enum Error {
    /// The name does not resolve to an account on this host.
    Unknown(String),

    /// The caller lacks the privilege to assume the account.
    Denied(String),

    /// The underlying syscall failed.
    Os(Errno),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unknown(name) => write!(f, "No such identity: {name}"),
            Self::Denied(name) => write!(f, "Not permitted to assume identity: {name}"),
            Self::Os(errno) => write!(f, "Identity lookup failed: {errno}"),
        }
    }
}
impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Os(errno) => Some(errno),
            _ => None,
        }
    }
}

/// A validated identity, ready to be assumed.
#[derive(Debug, Clone)]
pub struct Token {
    /// The account name the token was resolved from.
    name: String,

    /// The account's user id.
    uid: Uid,

    /// The account's primary group id.
    gid: Gid,
}

/// Resolve `name` to a [`Token`], verifying the caller may assume it.
///
/// Resolution succeeds only when the caller is privileged or the account is
/// the caller's own; anything else is the moral equivalent of a failed
/// logon and reports [`Error::Denied`].
pub fn resolve(name: &str) -> Result<Token, Error> {
    let user = User::from_name(name)
        .map_err(Error::Os)?
        .ok_or_else(|| Error::Unknown(name.into()))?;

    if !Uid::effective().is_root() && user.uid != Uid::effective() {
        return Err(Error::Denied(name.into()));
    }

    Ok(Token {
        name: user.name,
        uid: user.uid,
        gid: user.gid,
    })
}

impl Token {
    /// The account name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The account's user id.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The account's primary group id.
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Assume the identity for the calling process, returning a [`Guard`]
    /// that reverts to the previous effective ids when dropped.
    ///
    /// Only the effective ids change; the saved set keeps the original
    /// privilege so the revert (and a child's [`Token::adopt`]) remain
    /// possible. Callers must serialize: concurrent impersonations from
    /// multiple threads observe each other's effective ids.
    pub fn impersonate(&self) -> Result<Guard, Error> {
        let saved = Guard {
            uid: Uid::effective(),
            gid: Gid::effective(),
        };

        setegid(self.gid).map_err(Error::Os)?;
        if let Err(errno) = seteuid(self.uid) {
            if let Err(undo) = setegid(saved.gid) {
                warn!("failed to revert group after partial impersonation: {undo}");
            }
            return Err(Error::Os(errno));
        }
        Ok(saved)
    }

    /// Permanently switch the calling process to this identity: supplementary
    /// groups, primary group, then user, in that order. Meant for the child
    /// between fork and exec; there is no way back afterwards.
    pub fn adopt(&self) -> Result<(), Errno> {
        // A scoped impersonation in the parent leaves the original privilege
        // in the saved set; reclaim it so the group switches are permitted.
        let _ = seteuid(Uid::from_raw(0));

        if Uid::effective().is_root() {
            let name = CString::new(self.name.as_str()).map_err(|_| Errno::EINVAL)?;
            initgroups(&name, self.gid)?;
        }
        setgid(self.gid)?;
        setuid(self.uid)?;
        Ok(())
    }
}

/// Reverts an impersonation when dropped, on every exit path of the scope
/// that holds it.
#[derive(Debug)]
pub struct Guard {
    /// Effective user id to restore.
    uid: Uid,

    /// Effective group id to restore.
    gid: Gid,
}
impl Drop for Guard {
    fn drop(&mut self) {
        if let Err(errno) = seteuid(self.uid) {
            warn!("failed to revert impersonation to uid {}: {errno}", self.uid);
        }
        if let Err(errno) = setegid(self.gid) {
            warn!("failed to revert impersonation to gid {}: {errno}", self.gid);
        }
    }
}
