//! Join token binding and persistence
//!
//! A raw secret on its own proves nothing about the server a client talks to.
//! Binding it to the SHA-256 of the server CA lets a joining node check, out
//! of band, that the CA it is presented with is the one that issued the token,
//! so a token replayed against an impostor server is detectable.
//!
//! Bound form: `K10<hex(sha256(ca))>::<secret>`.
//! Unbound form (no CA): `K10<secret>`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use aws_lc_rs::digest::{digest, SHA256};
use rand::RngCore;
use tracing::warn;

use crate::{Error, Result};

/// Prefix carried by every formatted token
pub const TOKEN_PREFIX: &str = "K10";

/// Separator between the CA digest and the secret
pub const TOKEN_SEPARATOR: &str = "::";

/// File name of the persisted node-join token inside the data directory
pub const NODE_TOKEN_FILE: &str = "node-token";

/// Hex-encoded SHA-256 of the root-of-trust material
pub fn ca_hash(root_of_trust: &str) -> String {
    hex::encode(digest(&SHA256, root_of_trust.as_bytes()).as_ref())
}

/// Bind a raw secret to the server CA
///
/// - empty secret: returns an empty string, a token is never made from nothing
/// - empty CA: returns the unbound `K10<secret>` form
/// - otherwise: `K10<hex(sha256(ca))>::<secret>`
pub fn format_token(secret: &str, root_of_trust: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }

    if root_of_trust.is_empty() {
        warn!("CA material unavailable, issuing token without CA binding");
        return format!("{TOKEN_PREFIX}{secret}");
    }

    format!(
        "{TOKEN_PREFIX}{}{TOKEN_SEPARATOR}{secret}",
        ca_hash(root_of_trust)
    )
}

/// A formatted token split back into its parts
#[derive(Clone, PartialEq, Eq)]
pub struct ParsedToken {
    /// Hex CA digest, present for bound tokens
    pub ca_hash: Option<String>,
    /// The raw secret
    pub secret: String,
}

impl ParsedToken {
    /// Check a server CA against the digest embedded in the token
    ///
    /// Unbound tokens cannot be checked and always return `false`.
    pub fn verify_ca(&self, root_of_trust: &str) -> bool {
        match &self.ca_hash {
            Some(expected) => *expected == ca_hash(root_of_trust),
            None => false,
        }
    }
}

impl std::fmt::Debug for ParsedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the secret in debug output
        f.debug_struct("ParsedToken")
            .field("ca_hash", &self.ca_hash)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Split a formatted token into CA digest and secret
///
/// Anything without the `K10` prefix is treated as a bare secret.
pub fn parse_token(token: &str) -> ParsedToken {
    let Some(rest) = token.strip_prefix(TOKEN_PREFIX) else {
        return ParsedToken {
            ca_hash: None,
            secret: token.to_string(),
        };
    };

    match rest.split_once(TOKEN_SEPARATOR) {
        Some((hash, secret))
            if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            ParsedToken {
                ca_hash: Some(hash.to_ascii_lowercase()),
                secret: secret.to_string(),
            }
        }
        _ => ParsedToken {
            ca_hash: None,
            secret: rest.to_string(),
        },
    }
}

/// Generate a random raw secret (32 bytes, hex encoded)
pub fn generate_secret() -> String {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// File-backed token persistence
///
/// Tokens are written owner read/write only. The file is first created under
/// a temporary name with mode 0600 and then renamed over the target, so the
/// secret is never readable by others, not even between write and chmod.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenStore;

impl TokenStore {
    /// Write `token` plus a trailing newline to `path`
    ///
    /// An empty token is a no-op.
    pub fn persist(token: &str, path: &Path) -> Result<()> {
        if token.is_empty() {
            return Ok(());
        }

        let tmp = temp_path(path);
        let result = write_private(&tmp, format!("{token}\n").as_bytes())
            .and_then(|()| fs::rename(&tmp, path).map_err(|e| Error::io(path, e)));

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    /// Read a token back, trimming surrounding whitespace
    pub fn read(path: &Path) -> Result<String> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(content.trim().to_string())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "token".to_string());
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

/// Create (or truncate) `path` with mode 0600 and write `data`
pub(crate) fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|e| Error::io(path, e))?;

    // mode() only applies on creation; tighten a pre-existing file too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io(path, e))?;
    }

    file.write_all(data)
        .and_then(|()| file.sync_all())
        .map_err(|e| Error::io(path, e))
}
