use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// The identifier of the reserved platform-wide scope
pub const PLATFORM_SCOPE: &str = "platform";

/// A credential scope
///
/// Token state for one scope never affects another. One scope,
/// [`PLATFORM_SCOPE`], stands for the platform-wide identity; every other
/// scope names a tenant application.
#[braid(serde)]
pub struct Scope;

impl Scope {
    /// The reserved platform-wide scope
    pub fn platform() -> Self {
        Self::from_static(PLATFORM_SCOPE)
    }
}

impl ScopeRef {
    /// Whether this is the reserved platform-wide scope
    pub fn is_platform(&self) -> bool {
        self.as_str() == PLATFORM_SCOPE
    }
}

/// An access token, as handed to outbound calls in a bearer header
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A client ID
#[braid(serde)]
pub struct ClientId;

/// A client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

limited_reveal!(ClientSecretRef: "CLIENT SECRET", 5);

/// A legacy application key
#[braid(serde)]
pub struct AppKey;

/// A legacy application secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct AppSecret;

limited_reveal!(AppSecretRef: "APP SECRET", 5);

/// A bearer value delegated by a signed-in user
#[braid(serde, debug = "owned", display = "owned")]
pub struct DelegatedToken;

limited_reveal!(DelegatedTokenRef: "DELEGATED TOKEN", 5);
