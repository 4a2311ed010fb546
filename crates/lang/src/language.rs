use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{LangError, Result};

/// A language-region tag such as `en-US` or `es-ES`.
///
/// Tags are normalized on construction: the primary subtag is lowercased,
/// two-letter region subtags are uppercased and `_` separators become `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Language(String);

impl Language {
    pub fn new(tag: impl AsRef<str>) -> Result<Self> {
        let raw = tag.as_ref().trim();
        let mut parts = raw.split(['-', '_']);

        let primary = parts.next().unwrap_or_default();
        if !(2..=3).contains(&primary.len()) || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(LangError::InvalidTag(raw.to_string()));
        }

        let mut normalized = primary.to_ascii_lowercase();
        for part in parts {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(LangError::InvalidTag(raw.to_string()));
            }
            normalized.push('-');
            if part.len() == 2 {
                normalized.push_str(&part.to_ascii_uppercase());
            } else {
                normalized.push_str(part);
            }
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase primary subtag (`es` for `es-MX`).
    pub fn primary(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }

    /// Whether both tags name the same language regardless of region.
    pub fn same_primary(&self, other: &Language) -> bool {
        self.primary() == other.primary()
    }

    pub fn english() -> Self {
        Self("en-US".to_string())
    }

    pub fn spanish() -> Self {
        Self("es-ES".to_string())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Language {
    type Err = LangError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Language {
    type Error = LangError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Language> for String {
    fn from(value: Language) -> Self {
        value.0
    }
}

/// The two languages active in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguagePair {
    /// Language spoken by the person holding this device.
    pub local: Language,
    /// Language spoken by the other party.
    pub remote: Language,
}

impl Default for LanguagePair {
    fn default() -> Self {
        Self {
            local: Language::english(),
            remote: Language::spanish(),
        }
    }
}

impl LanguagePair {
    pub fn new(local: Language, remote: Language) -> Result<Self> {
        let pair = Self { local, remote };
        pair.validate()?;
        Ok(pair)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local.same_primary(&self.remote) {
            return Err(LangError::DegeneratePair(self.local.primary().to_string()));
        }
        Ok(())
    }

    /// The language a phrase in `lang` is translated into.
    ///
    /// Anything that is not the local language is rendered for the local
    /// listener.
    pub fn other(&self, lang: &Language) -> &Language {
        if lang.same_primary(&self.local) {
            &self.remote
        } else {
            &self.local
        }
    }

    pub fn contains(&self, lang: &Language) -> bool {
        lang.same_primary(&self.local) || lang.same_primary(&self.remote)
    }

    pub fn languages(&self) -> [&Language; 2] {
        [&self.local, &self.remote]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_tags() {
        assert_eq!(Language::new("en_us").unwrap().as_str(), "en-US");
        assert_eq!(Language::new("ES-mx").unwrap().as_str(), "es-MX");
        assert_eq!(Language::new("zh-Hant-TW").unwrap().as_str(), "zh-Hant-TW");
        assert_eq!(Language::new("es-419").unwrap().primary(), "es");
    }

    #[test]
    fn test_rejects_invalid_tags() {
        assert!(Language::new("").is_err());
        assert!(Language::new("english").is_err());
        assert!(Language::new("en--US").is_err());
        assert!(Language::new("e1").is_err());
    }

    #[test]
    fn test_serde_as_plain_string() {
        let lang: Language = serde_json::from_str("\"es_es\"").unwrap();
        assert_eq!(lang, Language::spanish());
        assert_eq!(serde_json::to_string(&lang).unwrap(), "\"es-ES\"");
        assert!(serde_json::from_str::<Language>("\"??\"").is_err());
    }

    #[test]
    fn test_pair_other() {
        let pair = LanguagePair::default();
        let mexican = Language::new("es-MX").unwrap();
        assert_eq!(pair.other(&Language::english()), &Language::spanish());
        assert_eq!(pair.other(&mexican), &Language::english());
        assert!(pair.contains(&mexican));
        assert!(!pair.contains(&Language::new("fr-FR").unwrap()));
    }

    #[test]
    fn test_degenerate_pair() {
        let result = LanguagePair::new(Language::english(), Language::new("en-GB").unwrap());
        assert_eq!(result, Err(LangError::DegeneratePair("en".to_string())));
    }
}
