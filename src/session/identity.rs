//! Request-scoped authentication claims.
//!
//! The login flow lives outside the bridge; it leaves its result in
//! signed cookies that ride along with the WebSocket upgrade request. The
//! claims are attached to each inbound call instead of the connection, so a
//! procedure always sees the credentials of the request that carried it.
//!
//! # Signed Cookies
//!
//! Claim cookies carry an HMAC-SHA256 signature over the cookie name, the
//! value and the time of signing:
//!
//! ```text
//! 2|1:0|10:1700000000|18:user_auth_username|8:YWxpY2U=|<hex signature>
//! ```
//!
//! Every field is `<length>:<bytes>`; the value is base64. A cookie whose
//! signature, name or age does not check out is ignored, as are plain
//! unsigned cookies.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Cookie holding the authenticated user name.
pub const USERNAME_COOKIE: &str = "user_auth_username";

/// Cookie holding the authentication method.
pub const AUTH_METHOD_COOKIE: &str = "user_auth_method";

/// Default lifetime of a signed cookie.
pub const DEFAULT_COOKIE_MAX_AGE: Duration = Duration::from_secs(31 * 24 * 60 * 60);

/// Format version prefix of a signed cookie.
const FORMAT_PREFIX: &str = "2|";

/// Key version written into new cookies.
const KEY_VERSION: &str = "0";

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// SecureCookie
// ============================================================================

/// Signs and verifies cookie values with a shared secret.
#[derive(Clone)]
pub struct SecureCookie {
    /// Keyed MAC, cloned per use.
    mac: HmacSha256,
    /// Cookies signed longer ago are rejected.
    max_age: Duration,
}

impl fmt::Debug for SecureCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureCookie")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl SecureCookie {
    /// Creates a signer for `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret is empty.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::config("cookie secret must not be empty"));
        }

        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::config(format!("invalid cookie secret: {e}")))?;

        Ok(Self {
            mac,
            max_age: DEFAULT_COOKIE_MAX_AGE,
        })
    }

    /// Sets how long a signed cookie stays valid.
    #[inline]
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Returns how long a signed cookie stays valid.
    #[inline]
    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Signs a cookie value with the current time.
    #[must_use]
    pub fn sign(&self, name: &str, value: &str) -> String {
        self.sign_at(name, value, unix_now())
    }

    /// Signs a cookie value as of `timestamp` (seconds since the epoch).
    #[must_use]
    pub fn sign_at(&self, name: &str, value: &str, timestamp: u64) -> String {
        let encoded = STANDARD.encode(value);
        let to_sign = format!(
            "{FORMAT_PREFIX}{}{}{}{}",
            field(KEY_VERSION),
            field(&timestamp.to_string()),
            field(name),
            field(&encoded),
        );
        let signature = self.signature(&to_sign);
        format!("{to_sign}{signature}")
    }

    /// Returns the value of a signed cookie, or `None` if it does not verify.
    #[must_use]
    pub fn verify(&self, name: &str, raw: &str) -> Option<String> {
        self.verify_at(name, raw, unix_now())
    }

    fn verify_at(&self, name: &str, raw: &str, now: u64) -> Option<String> {
        let raw = raw.trim_matches('"');
        let rest = raw.strip_prefix(FORMAT_PREFIX)?;

        let (_key_version, rest) = take_field(rest)?;
        let (timestamp, rest) = take_field(rest)?;
        let (name_field, rest) = take_field(rest)?;
        let (value_field, signature) = take_field(rest)?;

        let signed = raw.get(..raw.len() - signature.len())?;
        let signature = hex::decode(signature).ok()?;
        let mut mac = self.mac.clone();
        mac.update(signed.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            debug!(cookie = name, "Cookie signature mismatch");
            return None;
        }

        if name_field != name {
            return None;
        }

        let timestamp: u64 = timestamp.parse().ok()?;
        if timestamp < now.saturating_sub(self.max_age.as_secs()) {
            debug!(cookie = name, timestamp, "Cookie expired");
            return None;
        }

        let value = STANDARD.decode(value_field).ok()?;
        String::from_utf8(value).ok()
    }

    /// Hex HMAC-SHA256 of `payload`.
    fn signature(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// `<length>:<value>|`
fn field(value: &str) -> String {
    format!("{}:{value}|", value.len())
}

/// Splits one `<length>:<value>|` field off the front of `input`.
fn take_field(input: &str) -> Option<(&str, &str)> {
    let (len, rest) = input.split_once(':')?;
    let len: usize = len.parse().ok()?;
    let value = rest.get(..len)?;
    let rest = rest.get(len..)?.strip_prefix('|')?;
    Some((value, rest))
}

/// Current wall clock in whole seconds.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// ============================================================================
// Identity
// ============================================================================

/// Authentication claims of an inbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated user name.
    pub username: Option<String>,
    /// How the user authenticated (e.g. `ldap`, `oauth2`).
    pub auth_method: Option<String>,
}

impl Identity {
    /// Extracts verified claims from a `Cookie` header value.
    ///
    /// Returns `None` when no claim cookie carries a valid signature.
    #[must_use]
    pub fn from_cookie_header(header: &str, cookies: &SecureCookie) -> Option<Self> {
        let mut identity = Self::default();

        for pair in header.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            let name = name.trim();
            let slot = match name {
                USERNAME_COOKIE => &mut identity.username,
                AUTH_METHOD_COOKIE => &mut identity.auth_method,
                _ => continue,
            };
            if let Some(value) = cookies.verify(name, value.trim())
                && !value.is_empty()
            {
                *slot = Some(value);
            }
        }

        (identity.username.is_some() || identity.auth_method.is_some()).then_some(identity)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SecureCookie {
        SecureCookie::new("61oETzKXQAGaYdkL5gEmGeJJFuYh7EQnp2XdTP1o").expect("secret")
    }

    #[test]
    fn test_sign_layout() {
        let cookie = signer().sign_at(USERNAME_COOKIE, "alice", 1_700_000_000);
        assert!(cookie.starts_with("2|1:0|10:1700000000|18:user_auth_username|8:YWxpY2U=|"));

        let signature = cookie.rsplit('|').next().unwrap_or_default();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_signed_value() {
        let cookies = signer();
        let cookie = cookies.sign(USERNAME_COOKIE, "alice");
        assert_eq!(cookies.verify(USERNAME_COOKIE, &cookie).as_deref(), Some("alice"));

        let quoted = format!("\"{cookie}\"");
        assert_eq!(cookies.verify(USERNAME_COOKIE, &quoted).as_deref(), Some("alice"));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let cookies = signer();
        let cookie = cookies.sign(USERNAME_COOKIE, "alice");

        let forged = cookie.replace("8:YWxpY2U=", "8:bWFsbG9y");
        assert_eq!(cookies.verify(USERNAME_COOKIE, &forged), None);

        let other_key = SecureCookie::new("another secret").expect("secret");
        assert_eq!(other_key.verify(USERNAME_COOKIE, &cookie), None);

        assert_eq!(cookies.verify(USERNAME_COOKIE, "alice"), None);
        assert_eq!(cookies.verify(USERNAME_COOKIE, "2|1:0|garbage"), None);
        assert_eq!(cookies.verify(USERNAME_COOKIE, ""), None);
    }

    #[test]
    fn test_verify_rejects_other_cookie_name() {
        let cookies = signer();
        let method = cookies.sign(AUTH_METHOD_COOKIE, "alice");
        assert_eq!(cookies.verify(USERNAME_COOKIE, &method), None);
    }

    #[test]
    fn test_verify_rejects_expired() {
        let cookies = signer().with_max_age(Duration::from_secs(60));
        let cookie = cookies.sign_at(USERNAME_COOKIE, "alice", 1_000);

        assert_eq!(
            cookies.verify_at(USERNAME_COOKIE, &cookie, 1_050).as_deref(),
            Some("alice")
        );
        assert_eq!(cookies.verify_at(USERNAME_COOKIE, &cookie, 1_061), None);
    }

    #[test]
    fn test_empty_secret_rejected() {
        let err = SecureCookie::new("").expect_err("empty secret");
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_from_cookie_header() {
        let cookies = signer();
        let header = format!(
            "theme=dark; {USERNAME_COOKIE}={}; {AUTH_METHOD_COOKIE}=\"{}\"",
            cookies.sign(USERNAME_COOKIE, "alice"),
            cookies.sign(AUTH_METHOD_COOKIE, "ldap"),
        );
        let identity = Identity::from_cookie_header(&header, &cookies).expect("claims present");

        assert_eq!(identity.username.as_deref(), Some("alice"));
        assert_eq!(identity.auth_method.as_deref(), Some("ldap"));
    }

    #[test]
    fn test_unsigned_cookies_give_no_identity() {
        let cookies = signer();
        assert_eq!(
            Identity::from_cookie_header("user_auth_username=alice; user_auth_method=ldap", &cookies),
            None
        );
        assert_eq!(Identity::from_cookie_header("theme=dark", &cookies), None);
        assert_eq!(Identity::from_cookie_header("", &cookies), None);
    }

    #[test]
    fn test_forged_claim_dropped_valid_claim_kept() {
        let cookies = signer();
        let header = format!(
            "{USERNAME_COOKIE}=admin; {AUTH_METHOD_COOKIE}={}",
            cookies.sign(AUTH_METHOD_COOKIE, "ldap"),
        );
        let identity = Identity::from_cookie_header(&header, &cookies).expect("method verifies");

        assert_eq!(identity.username, None);
        assert_eq!(identity.auth_method.as_deref(), Some("ldap"));
    }
}
