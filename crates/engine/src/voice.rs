use std::collections::BTreeMap;
use std::fmt;

use parley_lang::Language;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoiceId(pub String);

impl VoiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Voice selection per language.
///
/// Resolution order: explicit override, then stored preference (only if
/// still installed), then the synthesizer's best match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub overrides: BTreeMap<Language, VoiceId>,
    pub preferences: BTreeMap<Language, VoiceId>,
}

impl VoiceSettings {
    pub fn resolve(&self, language: &Language, available: &[VoiceId]) -> Option<VoiceId> {
        if let Some(voice) = lookup(&self.overrides, language) {
            return Some(voice.clone());
        }
        if let Some(voice) = lookup(&self.preferences, language) {
            if available.contains(voice) {
                return Some(voice.clone());
            }
            tracing::debug!(language = %language, voice = %voice, "stored voice not installed");
        }
        available.first().cloned()
    }
}

/// Exact tag first, then any entry with the same primary language.
fn lookup<'a>(map: &'a BTreeMap<Language, VoiceId>, language: &Language) -> Option<&'a VoiceId> {
    map.get(language).or_else(|| {
        map.iter()
            .find(|(lang, _)| lang.same_primary(language))
            .map(|(_, voice)| voice)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(id: &str) -> VoiceId {
        VoiceId::new(id)
    }

    #[test]
    fn test_override_wins() {
        let mut settings = VoiceSettings::default();
        settings.overrides.insert(Language::spanish(), voice("monica"));
        settings.preferences.insert(Language::spanish(), voice("jorge"));
        let resolved = settings.resolve(&Language::spanish(), &[voice("jorge")]);
        assert_eq!(resolved, Some(voice("monica")));
    }

    #[test]
    fn test_preference_must_be_installed() {
        let mut settings = VoiceSettings::default();
        settings.preferences.insert(Language::english(), voice("alex"));
        assert_eq!(
            settings.resolve(&Language::english(), &[voice("samantha"), voice("alex")]),
            Some(voice("alex"))
        );
        assert_eq!(
            settings.resolve(&Language::english(), &[voice("samantha")]),
            Some(voice("samantha"))
        );
        assert_eq!(settings.resolve(&Language::english(), &[]), None);
    }

    #[test]
    fn test_primary_language_match() {
        let mut settings = VoiceSettings::default();
        settings.overrides.insert(Language::new("es-MX").unwrap(), voice("paulina"));
        assert_eq!(
            settings.resolve(&Language::spanish(), &[]),
            Some(voice("paulina"))
        );
    }

    #[test]
    fn test_serializes_with_language_keys() {
        let mut settings = VoiceSettings::default();
        settings.preferences.insert(Language::spanish(), voice("jorge"));
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(json, r#"{"overrides":{},"preferences":{"es-ES":"jorge"}}"#);
        let back: VoiceSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }
}
