//! A wrapper for the registry signing secret.
//!
//! The wrapper keeps the secret out of debug output and zeroizes the
//! backing memory on drop. Use [`Secret::revealed`] to get the
//! underlying value.

use std::{borrow::Cow, fmt, ops::Deref};

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A registry-wide signing secret, or any other semi-secret string.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// An empty secret, distinct from "no secret loaded yet".
    pub fn empty() -> Self {
        Secret(Cow::Borrowed(""))
    }

    /// Whether this secret holds no value.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Expose the underlying value of this secret.
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }

    #[allow(clippy::should_implement_trait)]
    /// Construct a secret from a string slice.
    pub fn from_str(s: &str) -> Self {
        Secret(s.to_owned().into())
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

/// Tiny wrapper struct to indicate that the inner object should
/// be directly printed in fmt::Debug implementations.
struct DirectDebug<D>(D);

impl<D> fmt::Debug for DirectDebug<D>
where
    D: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&DirectDebug("****")).finish()
    }
}

impl From<Cow<'static, str>> for Secret {
    fn from(inner: Cow<'static, str>) -> Self {
        Secret(inner)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}
