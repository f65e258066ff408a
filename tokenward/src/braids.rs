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
                    limited_reveal(&self.0, &mut *f, $default)
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

const MASK_EDGE: usize = 4;

/// Renders a credential with only its first and last few characters visible
///
/// Values too short to keep a hidden middle of at least eight characters are
/// fully redacted, so no eight-character run of the original ever survives.
pub fn mask_secret(unprotected: &str) -> String {
    let chars: Vec<char> = unprotected.chars().collect();
    if chars.len() < MASK_EDGE * 2 + 8 {
        return "***".to_owned();
    }

    let head: String = chars[..MASK_EDGE].iter().collect();
    let tail: String = chars[chars.len() - MASK_EDGE..].iter().collect();
    format!("{head}…{tail}")
}

/// A client ID
#[braid(serde)]
pub struct ClientId;

/// A client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

limited_reveal!(ClientSecretRef: "CLIENT SECRET", 5);

/// An access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

limited_reveal!(RefreshTokenRef: "REFRESH TOKEN", 5);

/// The end user a token record belongs to
#[braid(serde)]
pub struct SubjectId;

impl SubjectId {
    /// The fixed subject used when only a single identity is tracked
    pub fn single_identity() -> Self {
        Self::from_static("__single_identity__")
    }
}

/// The identity source that issued a token
#[braid(serde)]
pub struct ProviderId;

impl Default for ProviderId {
    fn default() -> Self {
        Self::from_static("default")
    }
}

impl AccessTokenRef {
    /// A masked rendering safe for logs and published events
    pub fn masked(&self) -> String {
        mask_secret(self.as_str())
    }
}

impl RefreshTokenRef {
    /// A masked rendering safe for logs and published events
    pub fn masked(&self) -> String {
        mask_secret(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_tokens_by_default() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn alternate_debug_reveals_a_prefix() {
        let token = RefreshToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:#?}", token), "\"abcd…\"");
    }

    #[test]
    fn mask_keeps_edges_only() {
        assert_eq!(
            mask_secret("abcdefghijklmnopqrstuvwxyz"),
            "abcd…wxyz".to_owned()
        );
    }

    #[test]
    fn mask_fully_redacts_short_values() {
        assert_eq!(mask_secret("short-token"), "***");
        assert_eq!(mask_secret(""), "***");
    }

    #[test]
    fn single_identity_subject_is_stable() {
        assert_eq!(SubjectId::single_identity(), SubjectId::single_identity());
        assert_eq!(ProviderId::default().as_str(), "default");
    }
}
