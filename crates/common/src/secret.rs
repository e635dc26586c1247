//! Secret wrapper and masking for upstream API keys

use std::fmt;
use zeroize::Zeroize;

/// Rendering used for secrets too short to partially reveal.
const MASK_PLACEHOLDER: &str = "***";

/// Number of leading characters kept by [`mask`].
const MASK_PREFIX_CHARS: usize = 6;

/// Number of trailing characters kept by [`mask`].
const MASK_SUFFIX_CHARS: usize = 4;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Display-safe rendering of the secret, see [`mask`].
    pub fn masked(&self) -> String {
        mask(&self.0)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Mask an API key for logs and statistics.
///
/// Keys of ten characters or fewer collapse to `***`. Longer
/// keys keep their first six and last four characters around a `...`
/// separator, so the middle of the key never appears in the output.
///
/// Lengths are counted in characters, not bytes.
pub fn mask(secret: &str) -> String {
    let len = secret.chars().count();
    if len <= MASK_PREFIX_CHARS + MASK_SUFFIX_CHARS {
        return MASK_PLACEHOLDER.to_string();
    }
    let prefix: String = secret.chars().take(MASK_PREFIX_CHARS).collect();
    let suffix: String = secret.chars().skip(len - MASK_SUFFIX_CHARS).collect();
    format!("{prefix}...{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_redacts_debug() {
        let secret = Secret::new(String::from("nvapi-1234567890abcdef"));
        let debug = format!("{:?}", secret);
        assert_eq!(debug, "[REDACTED]");
        assert!(!debug.contains("nvapi"));
    }

    #[test]
    fn test_secret_redacts_display() {
        let secret = Secret::new(String::from("nvapi-1234567890abcdef"));
        assert_eq!(secret.to_string(), "[REDACTED]");
    }

    #[test]
    fn test_secret_exposes_value() {
        let secret = Secret::new(String::from("my-api-key"));
        assert_eq!(secret.expose(), "my-api-key");
    }

    #[test]
    fn mask_keeps_prefix_and_suffix() {
        assert_eq!(mask("nvapi-1234567890abcdef"), "nvapi-...cdef");
        assert_eq!(mask("nvapi-very-long-api-key-here"), "nvapi-...here");
    }

    #[test]
    fn mask_short_keys_use_placeholder() {
        assert_eq!(mask("short"), "***");
        assert_eq!(mask(""), "***");
        // exactly ten characters is still too short to reveal anything
        assert_eq!(mask("0123456789"), "***");
    }

    #[test]
    fn mask_eleven_characters_reveals_ends_only() {
        assert_eq!(mask("abcdefXghij"), "abcdef...ghij");
    }

    #[test]
    fn mask_never_contains_middle() {
        let key = "nvapi-AAAA-SECRET-MIDDLE-BBBB-zzzz";
        let masked = mask(key);
        assert!(!masked.contains("SECRET"));
        assert!(!masked.contains("MIDDLE"));
        assert!(masked.starts_with("nvapi-"));
        assert!(masked.ends_with("zzzz"));
    }

    #[test]
    fn mask_counts_characters_not_bytes() {
        // multi-byte characters must not cause a slicing panic
        let key = "ключ-0123456789-ёжик";
        let masked = mask(key);
        assert!(masked.starts_with("ключ-0"));
        assert!(masked.ends_with("ёжик"));
    }

    #[test]
    fn secret_masked_delegates_to_mask() {
        let secret = Secret::new(String::from("nvapi-1234567890abcdef"));
        assert_eq!(secret.masked(), "nvapi-...cdef");
    }
}
