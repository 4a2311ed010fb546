use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::lexicon::{lexicon_for, tokenize};
use crate::{Language, LanguagePair};

const HISTORY_LEN: usize = 3;

/// Tunables for the per-utterance language vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoterSettings {
    /// Half-life of the exponential score decay.
    pub half_life_ms: u64,
    /// Multiplier applied to the recognizer's own confidence.
    pub recognizer_weight: f32,
    /// Bonus for a language whose special characters appear in the text.
    pub diacritic_bonus: f32,
    /// Bonus for the language with the higher stopword-hit ratio.
    pub stopword_bonus: f32,
    /// Priors for the languages locked in the last three utterances, most
    /// recent first.
    pub continuity_priors: [f32; HISTORY_LEN],
    /// Bias toward the side expected to answer after local speech output.
    pub next_speaker_bias: f32,
    /// Normalized margin under which the decision falls back to the most
    /// recently locked language.
    pub min_decision_margin: f32,
}

impl Default for VoterSettings {
    fn default() -> Self {
        Self {
            half_life_ms: 2800,
            recognizer_weight: 0.2,
            diacritic_bonus: 0.25,
            stopword_bonus: 0.15,
            continuity_priors: [0.20, 0.10, 0.05],
            next_speaker_bias: 0.20,
            min_decision_margin: 0.15,
        }
    }
}

impl VoterSettings {
    pub fn half_life(&self) -> Duration {
        Duration::from_millis(self.half_life_ms)
    }
}

/// Outcome of the commit-time vote.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageDecision {
    pub language: Language,
    /// `(top - second) / (top + second)`, zero when there is no evidence.
    pub margin: f32,
    /// `top / (top + second)`.
    pub confidence: f32,
    /// True when the margin was too thin and the previous lock was reused.
    pub fell_back: bool,
}

/// Decaying per-language scores for the utterance in progress.
///
/// Scores are reset at every utterance start; the history of locked
/// languages survives across utterances and feeds the continuity prior.
#[derive(Debug)]
pub struct LanguageVoter {
    settings: VoterSettings,
    pair: LanguagePair,
    scores: Vec<(Language, f32)>,
    updated_at: Option<Instant>,
    last_text: String,
    history: VecDeque<Language>,
}

impl LanguageVoter {
    pub fn new(pair: LanguagePair, settings: VoterSettings) -> Self {
        let scores = pair.languages().into_iter().map(|l| (l.clone(), 0.0)).collect();
        Self {
            settings,
            pair,
            scores,
            updated_at: None,
            last_text: String::new(),
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn pair(&self) -> &LanguagePair {
        &self.pair
    }

    /// Reset scores for a new utterance and seed them with the continuity
    /// prior and, after local speech output, the expected next speaker.
    pub fn begin_utterance(&mut self, now: Instant, expected_next: Option<&Language>) {
        for (_, score) in &mut self.scores {
            *score = 0.0;
        }
        self.updated_at = Some(now);
        self.last_text.clear();

        let priors = self.settings.continuity_priors;
        let history: Vec<Language> = self.history.iter().cloned().collect();
        for (lang, prior) in history.iter().zip(priors) {
            self.add(lang, prior);
        }
        if let Some(lang) = expected_next {
            self.add(lang, self.settings.next_speaker_bias);
        }

        tracing::trace!(
            history = history.len(),
            expected_next = expected_next.map(Language::as_str),
            "voter reset"
        );
    }

    /// Score one transcript update.
    ///
    /// Returns false when the text did not change since the previous
    /// update; repeated partials carry no new evidence.
    pub fn observe(
        &mut self,
        now: Instant,
        text: &str,
        recognized: Option<&Language>,
        confidence: f32,
    ) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == self.last_text {
            return false;
        }
        self.last_text = trimmed.to_string();
        self.decay_to(now);

        if let Some(lang) = recognized {
            let weight = self.settings.recognizer_weight * confidence.clamp(0.0, 1.0);
            self.add(lang, weight);
        }

        let tokens = tokenize(trimmed);
        let mut best_ratio: Option<(Language, f32)> = None;
        let mut tied = false;
        let languages: Vec<Language> = self.scores.iter().map(|(l, _)| l.clone()).collect();
        for lang in languages {
            let Some(lexicon) = lexicon_for(&lang) else {
                continue;
            };
            if lexicon.has_special_chars(trimmed) {
                self.add(&lang, self.settings.diacritic_bonus);
            }
            let ratio = lexicon.stopword_ratio(&tokens);
            match &best_ratio {
                Some((_, best)) if (ratio - best).abs() < f32::EPSILON => tied = true,
                Some((_, best)) if ratio < *best => {}
                _ => {
                    tied = false;
                    best_ratio = Some((lang, ratio));
                }
            }
        }
        if let Some((lang, ratio)) = best_ratio {
            if !tied && ratio > 0.0 {
                self.add(&lang, self.settings.stopword_bonus);
            }
        }
        true
    }

    /// Current scores decayed to `now`, without mutating state.
    pub fn scores(&self, now: Instant) -> Vec<(Language, f32)> {
        let factor = self.decay_factor(now);
        self.scores.iter().map(|(l, s)| (l.clone(), s * factor)).collect()
    }

    /// Leading language and its normalized margin over the runner-up.
    pub fn leader(&self, now: Instant) -> (Language, f32) {
        let (top, top_score, second_score) = self.ranked(now);
        (top, margin(top_score, second_score))
    }

    /// Commit-time decision. Records the result in the lock history.
    pub fn decide(&mut self, now: Instant) -> LanguageDecision {
        let (top, top_score, second_score) = self.ranked(now);
        let margin = margin(top_score, second_score);
        let total = top_score + second_score;
        let confidence = if total > 0.0 { top_score / total } else { 0.0 };

        let (language, fell_back) = match self.history.front() {
            Some(previous) if margin < self.settings.min_decision_margin => {
                (previous.clone(), !previous.same_primary(&top))
            }
            _ => (top, false),
        };

        self.history.push_front(language.clone());
        self.history.truncate(HISTORY_LEN);

        tracing::debug!(
            language = %language,
            margin,
            confidence,
            fell_back,
            "language decided"
        );

        LanguageDecision {
            language,
            margin,
            confidence,
            fell_back,
        }
    }

    /// Most recently locked language, if any utterance was decided yet.
    pub fn last_locked(&self) -> Option<&Language> {
        self.history.front()
    }

    fn ranked(&self, now: Instant) -> (Language, f32, f32) {
        let mut scored = self.scores(now);
        // Stable sort keeps the local language first on ties.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        let second = scored.get(1).map(|(_, s)| *s).unwrap_or(0.0);
        match scored.into_iter().next() {
            Some((lang, top)) => (lang, top, second),
            None => (self.pair.local.clone(), 0.0, 0.0),
        }
    }

    fn add(&mut self, lang: &Language, amount: f32) {
        if let Some((_, score)) = self.scores.iter_mut().find(|(l, _)| l.same_primary(lang)) {
            *score += amount;
        }
    }

    fn decay_factor(&self, now: Instant) -> f32 {
        let Some(updated_at) = self.updated_at else {
            return 1.0;
        };
        let half_life = self.settings.half_life().as_secs_f32();
        if half_life <= 0.0 {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(updated_at).as_secs_f32();
        0.5_f32.powf(elapsed / half_life)
    }

    fn decay_to(&mut self, now: Instant) {
        let factor = self.decay_factor(now);
        for (_, score) in &mut self.scores {
            *score *= factor;
        }
        self.updated_at = Some(now);
    }
}

fn margin(top: f32, second: f32) -> f32 {
    let total = top + second;
    if total > 0.0 {
        (top - second) / total
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voter() -> LanguageVoter {
        LanguageVoter::new(LanguagePair::default(), VoterSettings::default())
    }

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    #[tokio::test(start_paused = true)]
    async fn test_spanish_greeting_overrides_english_continuity() {
        let mut voter = voter();
        let start = Instant::now();

        // Previous utterance was English.
        voter.begin_utterance(start, None);
        voter.observe(at(start, 300), "good morning to you", Some(&Language::english()), 0.9);
        assert_eq!(voter.decide(at(start, 1000)).language, Language::english());

        let start = at(start, 2000);
        voter.begin_utterance(start, None);
        let (leader, _) = voter.leader(start);
        assert_eq!(leader, Language::english());

        voter.observe(at(start, 600), "Hola", None, 0.0);
        voter.observe(at(start, 1300), "Hola, ¿cómo estás?", None, 0.0);

        let (leader, margin) = voter.leader(at(start, 1300));
        assert_eq!(leader, Language::spanish());
        assert!(margin > 0.30, "margin was {margin}");

        let decision = voter.decide(at(start, 1300));
        assert_eq!(decision.language, Language::spanish());
        assert!(!decision.fell_back);
        assert!(decision.confidence > 0.5);
        assert_eq!(voter.last_locked(), Some(&Language::spanish()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_partial_is_not_scored_twice() {
        let mut voter = voter();
        let now = Instant::now();
        voter.begin_utterance(now, None);

        assert!(voter.observe(now, "¿qué tal?", None, 0.0));
        let first = voter.scores(now);
        assert!(!voter.observe(now, "¿qué tal? ", None, 0.0));
        assert_eq!(voter.scores(now), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scores_decay_by_half_life() {
        let mut voter = voter();
        let now = Instant::now();
        voter.begin_utterance(now, Some(&Language::spanish()));

        let spanish = |v: &LanguageVoter, t| {
            v.scores(t)
                .into_iter()
                .find(|(l, _)| *l == Language::spanish())
                .map(|(_, s)| s)
                .unwrap()
        };
        assert!((spanish(&voter, now) - 0.20).abs() < 1e-6);
        let later = at(now, 2800);
        assert!((spanish(&voter, later) - 0.10).abs() < 1e-4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thin_margin_falls_back_to_previous_lock() {
        let mut voter = voter();
        let now = Instant::now();

        voter.begin_utterance(now, None);
        voter.observe(now, "hola amigo", None, 0.0);
        assert_eq!(voter.decide(now).language, Language::spanish());

        // en 0.15 (interjection) vs es 0.20 (continuity): margin 0.14
        let next = at(now, 100);
        voter.begin_utterance(next, None);
        voter.observe(next, "okay", None, 0.0);
        let decision = voter.decide(next);
        assert_eq!(decision.language, Language::spanish());
        assert!(!decision.fell_back);
        assert!(decision.margin < 0.15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_reported_when_leader_differs() {
        let settings = VoterSettings {
            min_decision_margin: 0.5,
            ..VoterSettings::default()
        };
        let mut voter = LanguageVoter::new(LanguagePair::default(), settings);
        let now = Instant::now();

        voter.begin_utterance(now, None);
        voter.observe(now, "¡hola!", None, 0.0);
        assert_eq!(voter.decide(now).language, Language::spanish());

        voter.begin_utterance(now, None);
        // es 0.20 prior; en gets stopword 0.15 plus recognizer 0.2
        voter.observe(now, "the plan", Some(&Language::english()), 1.0);
        let decision = voter.decide(now);
        assert_eq!(decision.language, Language::spanish());
        assert!(decision.fell_back);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_evidence_defaults_to_local() {
        let mut voter = voter();
        let now = Instant::now();
        voter.begin_utterance(now, None);
        let decision = voter.decide(now);
        assert_eq!(decision.language, Language::english());
        assert_eq!(decision.margin, 0.0);
        assert_eq!(decision.confidence, 0.0);
    }
}
