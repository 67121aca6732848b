//! Identifier normalization.
//!
//! Normalization maps a raw identifier to the canonical form used for
//! candidate lookup. Production normalizers (E.164 with carrier metadata,
//! transliteration) live outside this crate and plug in through
//! [`Normalizer`]; [`BasicNormalizer`] covers the common shapes well enough
//! for embedding and tests.

use std::sync::OnceLock;

use regex::Regex;

use crate::claim::{IdentityKind, Platform};

/// Maps raw identifiers to canonical values.
///
/// Returning `None` (or an empty string) marks the value as unnormalized: it
/// is stored but never matched against other claims.
pub trait Normalizer: Send + Sync {
    /// Normalizes `raw` observed on `platform` as an identifier of `kind`.
    fn normalize(&self, platform: &Platform, kind: IdentityKind, raw: &str) -> Option<String>;
}

static EMAIL_SHAPE: OnceLock<Option<Regex>> = OnceLock::new();
static ANGLE_ADDR: OnceLock<Option<Regex>> = OnceLock::new();
static PHONE_SHAPE: OnceLock<Option<Regex>> = OnceLock::new();
static WHITESPACE: OnceLock<Option<Regex>> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

const INVALID_MEMORY_URL_CHARS: [char; 5] = ['<', '>', '"', '|', '?'];

/// Regex-based reference normalizer.
///
/// # Examples
///
/// ```
/// use principal_graph::{BasicNormalizer, IdentityKind, Normalizer, Platform};
///
/// let n = BasicNormalizer::default();
/// let email = Platform::new("email").unwrap();
/// assert_eq!(
///     n.normalize(&email, IdentityKind::Email, "Bob <Bob@Example.COM>").as_deref(),
///     Some("bob@example.com")
/// );
/// assert_eq!(
///     n.normalize(&email, IdentityKind::Phone, "(415) 555-2671").as_deref(),
///     Some("+14155552671")
/// );
/// ```
#[derive(Debug, Clone)]
pub struct BasicNormalizer {
    country_code: String,
}

impl BasicNormalizer {
    /// Creates a normalizer that assumes `country_code` (digits, no `+`) for
    /// ten-digit national phone numbers.
    #[must_use]
    pub fn with_country_code(country_code: impl Into<String>) -> Self {
        let country_code: String = country_code
            .into()
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        Self { country_code }
    }

    /// The assumed country calling code.
    #[must_use]
    pub fn country_code(&self) -> &str {
        &self.country_code
    }

    fn email(raw: &str) -> Option<String> {
        let mut value = raw.trim().to_lowercase();
        if value.contains('<') && value.contains('>') {
            if let Some(inner) = compiled(&ANGLE_ADDR, r"<([^>]+)>")
                .and_then(|re| re.captures(&value))
                .and_then(|caps| caps.get(1))
            {
                value = inner.as_str().trim().to_string();
            }
        }
        let shape = compiled(&EMAIL_SHAPE, r"^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$")?;
        shape.is_match(&value).then_some(value)
    }

    fn phone(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        let shape = compiled(&PHONE_SHAPE, r"^\+?[0-9\s().\-]+$")?;
        if !shape.is_match(raw) {
            return None;
        }
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

        let international = if raw.starts_with('+') {
            digits
        } else if let Some(rest) = digits.strip_prefix("00") {
            rest.to_string()
        } else if digits.len() == 10 && !self.country_code.is_empty() {
            format!("{}{digits}", self.country_code)
        } else if digits.len() == self.country_code.len() + 10
            && digits.starts_with(&self.country_code)
        {
            digits
        } else {
            return None;
        };

        (7..=15)
            .contains(&international.len())
            .then(|| format!("+{international}"))
    }

    fn name(raw: &str) -> Option<String> {
        let lowered = raw.to_lowercase();
        let collapsed = match compiled(&WHITESPACE, r"\s+") {
            Some(re) => re.replace_all(&lowered, " ").trim().to_string(),
            None => lowered.split_whitespace().collect::<Vec<_>>().join(" "),
        };
        (!collapsed.is_empty()).then_some(collapsed)
    }

    fn memory_url(raw: &str) -> Option<String> {
        let cleaned = raw.trim();
        let path = match cleaned.strip_prefix("memory://") {
            Some(path) => path,
            None => cleaned.trim_start_matches('/'),
        };
        if path.is_empty()
            || path.contains("://")
            || path.contains("//")
            || path.chars().any(char::is_whitespace)
            || path.chars().any(|c| INVALID_MEMORY_URL_CHARS.contains(&c))
        {
            return None;
        }
        let path = path.trim_matches('/');
        (!path.is_empty()).then(|| format!("memory://{path}"))
    }

    fn opaque(raw: &str) -> Option<String> {
        let value = raw.trim().to_lowercase();
        (!value.is_empty()).then_some(value)
    }
}

impl Default for BasicNormalizer {
    fn default() -> Self {
        Self::with_country_code("1")
    }
}

impl Normalizer for BasicNormalizer {
    fn normalize(&self, _platform: &Platform, kind: IdentityKind, raw: &str) -> Option<String> {
        match kind {
            IdentityKind::Email => Self::email(raw),
            IdentityKind::Phone => self.phone(raw),
            IdentityKind::DisplayName | IdentityKind::Alias => Self::name(raw),
            IdentityKind::MemoryUrl => Self::memory_url(raw),
            IdentityKind::Username | IdentityKind::ContactId | IdentityKind::PersonUuid => {
                Self::opaque(raw)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(kind: IdentityKind, raw: &str) -> Option<String> {
        BasicNormalizer::default().normalize(&Platform::new("test").unwrap(), kind, raw)
    }

    #[test]
    fn test_email() {
        assert_eq!(
            norm(IdentityKind::Email, "  John.Doe@EXAMPLE.com ").as_deref(),
            Some("john.doe@example.com")
        );
        assert_eq!(
            norm(IdentityKind::Email, "Name <john@example.com>").as_deref(),
            Some("john@example.com")
        );
        assert_eq!(norm(IdentityKind::Email, "not an email"), None);
        assert_eq!(norm(IdentityKind::Email, "a@b"), None);
    }

    #[test]
    fn test_phone() {
        assert_eq!(
            norm(IdentityKind::Phone, "(415) 555-2671").as_deref(),
            Some("+14155552671")
        );
        assert_eq!(
            norm(IdentityKind::Phone, "1-415-555-2671").as_deref(),
            Some("+14155552671")
        );
        assert_eq!(
            norm(IdentityKind::Phone, "+44 20 7183 8750").as_deref(),
            Some("+442071838750")
        );
        assert_eq!(
            norm(IdentityKind::Phone, "0044 20 7183 8750").as_deref(),
            Some("+442071838750")
        );
        assert_eq!(norm(IdentityKind::Phone, "555-CALL-NOW"), None);
        assert_eq!(norm(IdentityKind::Phone, "12345"), None);
        assert_eq!(norm(IdentityKind::Phone, "+1234567890123456"), None);
    }

    #[test]
    fn test_phone_uses_configured_country_code() {
        let n = BasicNormalizer::with_country_code("+44");
        assert_eq!(n.country_code(), "44");
        let p = Platform::new("test").unwrap();
        assert_eq!(
            n.normalize(&p, IdentityKind::Phone, "2071838750").as_deref(),
            Some("+442071838750")
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(
            norm(IdentityKind::DisplayName, "  John   DOE  ").as_deref(),
            Some("john doe")
        );
        assert_eq!(norm(IdentityKind::Alias, "李明").as_deref(), Some("李明"));
        assert_eq!(norm(IdentityKind::DisplayName, "   "), None);
    }

    #[test]
    fn test_memory_url() {
        assert_eq!(
            norm(IdentityKind::MemoryUrl, "people/ada-lovelace").as_deref(),
            Some("memory://people/ada-lovelace")
        );
        assert_eq!(
            norm(IdentityKind::MemoryUrl, "memory://people/ada/").as_deref(),
            Some("memory://people/ada")
        );
        assert_eq!(norm(IdentityKind::MemoryUrl, "memory://a//b"), None);
        assert_eq!(norm(IdentityKind::MemoryUrl, "memory://a b"), None);
        assert_eq!(norm(IdentityKind::MemoryUrl, "memory://what?"), None);
        assert_eq!(norm(IdentityKind::MemoryUrl, "memory://"), None);
    }

    #[test]
    fn test_opaque_identifiers() {
        assert_eq!(
            norm(IdentityKind::Username, "  @GraceH ").as_deref(),
            Some("@graceh")
        );
        assert_eq!(
            norm(IdentityKind::ContactId, "ABC-123").as_deref(),
            Some("abc-123")
        );
        assert_eq!(norm(IdentityKind::PersonUuid, " "), None);
    }
}
