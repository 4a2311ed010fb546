use std::collections::HashSet;

use parley_lang::tokenize;

/// Words spoken aloud while the floor was held.
///
/// Text captured during that time is compared against them at capture
/// resume: if most of it is our own output, it is an echo.
#[derive(Debug, Default)]
pub struct EchoFilter {
    spoken: HashSet<String>,
}

impl EchoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, spoken_text: &str) {
        self.spoken.extend(tokenize(spoken_text));
    }

    /// Fraction of `heard` tokens that were spoken during the floor.
    pub fn overlap(&self, heard: &str) -> f32 {
        let tokens = tokenize(heard);
        if tokens.is_empty() || self.spoken.is_empty() {
            return 0.0;
        }
        let hits = tokens.iter().filter(|t| self.spoken.contains(*t)).count();
        hits as f32 / tokens.len() as f32
    }

    pub fn is_echo(&self, heard: &str, threshold: f32) -> bool {
        !self.spoken.is_empty() && self.overlap(heard) >= threshold
    }

    pub fn clear(&mut self) {
        self.spoken.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.spoken.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_output_is_echo() {
        let mut filter = EchoFilter::new();
        filter.record("Hola, ¿cómo estás?");
        assert!(filter.is_echo("hola como estás", 0.6));
        assert!(!filter.is_echo("I am fine thanks", 0.6));
    }

    #[test]
    fn test_empty_filter_never_matches() {
        let filter = EchoFilter::new();
        assert_eq!(filter.overlap("anything at all"), 0.0);
        assert!(!filter.is_echo("", 0.0));
    }
}
