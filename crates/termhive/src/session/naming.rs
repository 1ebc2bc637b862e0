//! Deterministic tmux names derived from session ids.
//!
//! A SHA-256 of the caller's id keeps names short, filesystem-safe and
//! collision-resistant; a sanitized slug of the id is appended to the session
//! name so `tmux ls` stays readable.

use sha2::{Digest, Sha256};

/// Prefix of every tmux session name created by termhive.
pub const SESSION_PREFIX: &str = "termhive-";

/// Prefix of every socket file created by termhive.
pub const SOCKET_PREFIX: &str = "th-";

/// Extension of socket files.
pub const SOCKET_SUFFIX: &str = ".sock";

/// Name of the shared tmux configuration file.
pub const CONFIG_FILE_NAME: &str = "tmux.conf";

/// Hex digits of the digest used in session names.
const SESSION_HASH_LEN: usize = 12;

/// Hex digits of the digest used in socket names.
const SOCKET_HASH_LEN: usize = 16;

/// Maximum length of the readable slug.
const SLUG_MAX_LEN: usize = 16;

/// tmux names derived from one session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedNames {
    /// tmux session name, `termhive-<hash>-<slug>`.
    pub session_name: String,
    /// Socket file name, `th-<hash>.sock`.
    pub socket_file: String,
}

impl DerivedNames {
    /// Derives names for `session_id`.
    pub fn for_session(session_id: &str) -> Self {
        let digest = hex::encode(Sha256::digest(session_id.as_bytes()));
        let slug = slug(session_id);

        let session_name = if slug.is_empty() {
            format!("{SESSION_PREFIX}{}", &digest[..SESSION_HASH_LEN])
        } else {
            format!("{SESSION_PREFIX}{}-{slug}", &digest[..SESSION_HASH_LEN])
        };
        let socket_file = format!(
            "{SOCKET_PREFIX}{}{SOCKET_SUFFIX}",
            &digest[..SOCKET_HASH_LEN]
        );

        Self {
            session_name,
            socket_file,
        }
    }
}

/// Returns true for socket file names created by termhive.
pub fn is_socket_file(name: &str) -> bool {
    name.starts_with(SOCKET_PREFIX) && name.ends_with(SOCKET_SUFFIX)
}

/// Returns true for tmux session names created by termhive.
pub fn is_session_name(name: &str) -> bool {
    name.starts_with(SESSION_PREFIX)
}

/// Keeps `[A-Za-z0-9_-]`, maps everything else to `_`, truncates.
///
/// tmux rejects `.` and `:` in session names, so they never survive.
fn slug(session_id: &str) -> String {
    session_id
        .chars()
        .take(SLUG_MAX_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
