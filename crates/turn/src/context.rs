use std::time::Duration;

use parley_events::CommitReason;
use parley_lang::{lexicon_for, tokenize, trailing_token, Language, LanguageDecision};
use tokio::time::Instant;

/// State of one in-progress utterance.
///
/// Created empty when the previous utterance commits or capture
/// (re)starts; the utterance itself begins with its first words. Once a
/// language is locked it stays locked until the context is dropped.
#[derive(Debug)]
pub struct TurnContext {
    utterance: u64,
    text: String,
    /// Text from recognition segments that ended without a commit, such as
    /// one cut short by a locale retarget.
    carried: String,
    started_at: Option<Instant>,
    last_growth: Option<Instant>,
    locked: Option<LanguageDecision>,
    /// Prefix already delivered to peers by early streaming.
    streamed: String,
    filler_deferred: bool,
    committed: bool,
}

impl TurnContext {
    pub fn new(utterance: u64) -> Self {
        Self {
            utterance,
            text: String::new(),
            carried: String::new(),
            started_at: None,
            last_growth: None,
            locked: None,
            streamed: String::new(),
            filler_deferred: false,
            committed: false,
        }
    }

    pub fn utterance(&self) -> u64 {
        self.utterance
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn last_growth(&self) -> Option<Instant> {
        self.last_growth
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Take the latest text of the current recognition segment.
    ///
    /// Returns true when the utterance text changed.
    pub fn absorb(&mut self, segment: &str, now: Instant) -> bool {
        let segment = segment.trim();
        let text = match (self.carried.is_empty(), segment.is_empty()) {
            (true, _) => segment.to_string(),
            (false, true) => self.carried.clone(),
            (false, false) => format!("{} {}", self.carried, segment),
        };
        if text == self.text {
            return false;
        }
        self.text = text;
        if self.started_at.is_none() && !self.text.is_empty() {
            self.started_at = Some(now);
        }
        self.last_growth = Some(now);
        true
    }

    /// The recognition segment ended without a commit; keep its text as a
    /// prefix for the next one.
    pub fn carry_segment(&mut self) {
        self.carried = self.text.clone();
    }

    /// Lock the language. A second call keeps the first lock.
    pub fn lock(&mut self, decision: LanguageDecision) -> &LanguageDecision {
        self.locked.get_or_insert(decision)
    }

    pub fn locked(&self) -> Option<&LanguageDecision> {
        self.locked.as_ref()
    }

    pub fn locked_language(&self) -> Option<&Language> {
        self.locked.as_ref().map(|d| &d.language)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map_or(Duration::ZERO, |start| now.saturating_duration_since(start))
    }

    pub fn since_growth(&self, now: Instant) -> Duration {
        self.last_growth
            .map_or(Duration::ZERO, |at| now.saturating_duration_since(at))
    }

    pub fn ends_sentence(&self) -> bool {
        self.text
            .trim_end_matches(['"', '\'', ')', '»', '”'])
            .ends_with(['.', '?', '!', '…'])
    }

    /// Which commit boundary, if any, has been reached.
    pub fn boundary(
        &self,
        now: Instant,
        stable_cutoff: Duration,
        hard_cap: Duration,
    ) -> Option<CommitReason> {
        if !self.is_started() || self.committed {
            return None;
        }
        if self.elapsed(now) >= hard_cap {
            Some(CommitReason::HardCap)
        } else if self.ends_sentence() {
            Some(CommitReason::Punctuation)
        } else if self.since_growth(now) >= stable_cutoff {
            Some(CommitReason::StablePause)
        } else {
            None
        }
    }

    /// Whether the commit should wait once more because the text ends in
    /// a conjunction or filler of `language`. Only the first call can
    /// return true.
    pub fn defer_for_filler(&mut self, language: &Language) -> bool {
        if self.filler_deferred {
            return false;
        }
        let Some(lexicon) = lexicon_for(language) else {
            return false;
        };
        let Some(last) = trailing_token(&self.text) else {
            return false;
        };
        if lexicon.is_filler(&last) {
            self.filler_deferred = true;
            return true;
        }
        false
    }

    /// Text not yet delivered to peers.
    ///
    /// When the recognizer has since revised the streamed words, the whole
    /// text is returned so nothing is lost.
    pub fn unsent_tail(&self) -> &str {
        strip_word_prefix(&self.text, &self.streamed).trim()
    }

    /// Whether the unsent text ends at a clause boundary with enough words
    /// to be worth sending ahead of the commit.
    pub fn early_stream_ready(&self, min_words: usize) -> bool {
        let tail = self.unsent_tail();
        tail.ends_with([',', ';', ':']) && tokenize(tail).len() >= min_words
    }

    pub fn mark_streamed(&mut self) {
        self.streamed = self.text.clone();
    }

    pub fn has_streamed(&self) -> bool {
        !self.streamed.is_empty()
    }

    pub fn mark_committed(&mut self) {
        self.committed = true;
    }
}

/// The part of `raw` after the words of `prefix`, or all of `raw` when
/// they do not line up.
///
/// Recognizers re-send the whole segment on every update and may re-case
/// or re-punctuate earlier words, so the prefix is matched word by word.
pub(crate) fn strip_word_prefix<'a>(raw: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return raw;
    }
    if let Some(rest) = raw.strip_prefix(prefix) {
        return rest.trim_start();
    }
    let words = tokenize(prefix);
    let mut expected = words.iter().peekable();
    let mut rest = raw.trim_start();
    while let Some(want) = expected.peek() {
        if rest.is_empty() {
            break;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (word, after) = rest.split_at(end);
        match tokenize(word).first() {
            Some(token) if token == *want => {
                expected.next();
            }
            Some(_) => return raw,
            None => {}
        }
        rest = after.trim_start();
    }
    if expected.peek().is_some() {
        return raw;
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUTOFF: Duration = Duration::from_millis(1300);
    const CAP: Duration = Duration::from_millis(7000);

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    fn decision(language: Language) -> LanguageDecision {
        LanguageDecision {
            language,
            margin: 0.5,
            confidence: 0.75,
            fell_back: false,
        }
    }

    #[test]
    fn test_utterance_starts_with_first_words() {
        let t0 = Instant::now();
        let mut ctx = TurnContext::new(1);
        assert!(!ctx.absorb("  ", t0));
        assert!(!ctx.is_started());
        assert!(ctx.absorb("hello", at(t0, 200)));
        assert_eq!(ctx.started_at(), Some(at(t0, 200)));
        assert!(!ctx.absorb("hello ", at(t0, 400)));
        assert_eq!(ctx.last_growth(), Some(at(t0, 200)));
    }

    #[test]
    fn test_boundaries() {
        let t0 = Instant::now();
        let mut ctx = TurnContext::new(1);
        ctx.absorb("where is the station", t0);
        assert_eq!(ctx.boundary(at(t0, 500), CUTOFF, CAP), None);
        assert_eq!(
            ctx.boundary(at(t0, 1300), CUTOFF, CAP),
            Some(CommitReason::StablePause)
        );

        ctx.absorb("where is the station?", at(t0, 1400));
        assert_eq!(
            ctx.boundary(at(t0, 1400), CUTOFF, CAP),
            Some(CommitReason::Punctuation)
        );
        assert_eq!(
            ctx.boundary(at(t0, 7000), CUTOFF, CAP),
            Some(CommitReason::HardCap)
        );

        ctx.mark_committed();
        assert_eq!(ctx.boundary(at(t0, 9000), CUTOFF, CAP), None);
    }

    #[test]
    fn test_quoted_sentence_end() {
        let mut ctx = TurnContext::new(1);
        ctx.absorb("he said \"stop.\"", Instant::now());
        assert!(ctx.ends_sentence());
    }

    #[test]
    fn test_filler_defers_once() {
        let mut ctx = TurnContext::new(1);
        ctx.absorb("quiero ir al mercado y", Instant::now());
        assert!(ctx.defer_for_filler(&Language::spanish()));
        assert!(!ctx.defer_for_filler(&Language::spanish()));

        let mut ctx = TurnContext::new(2);
        ctx.absorb("I want to go to the market and", Instant::now());
        assert!(!ctx.defer_for_filler(&Language::spanish()));
        assert!(ctx.defer_for_filler(&Language::english()));
    }

    #[test]
    fn test_lock_is_sticky() {
        let mut ctx = TurnContext::new(1);
        ctx.lock(decision(Language::english()));
        let kept = ctx.lock(decision(Language::spanish()));
        assert_eq!(kept.language, Language::english());
        assert_eq!(ctx.locked_language(), Some(&Language::english()));
    }

    #[test]
    fn test_carried_segment_prefixes_new_text() {
        let t0 = Instant::now();
        let mut ctx = TurnContext::new(1);
        ctx.absorb("hola cómo", t0);
        ctx.carry_segment();
        assert!(!ctx.absorb("", at(t0, 100)));
        assert!(ctx.absorb("estás", at(t0, 200)));
        assert_eq!(ctx.text(), "hola cómo estás");
    }

    #[test]
    fn test_strip_word_prefix_exact() {
        assert_eq!(strip_word_prefix("hello there. how are", "hello there."), "how are");
        assert_eq!(strip_word_prefix("anything", ""), "anything");
    }

    #[test]
    fn test_strip_word_prefix_tolerates_repunctuation() {
        assert_eq!(
            strip_word_prefix("Hello there, how are you", "hello there"),
            "how are you"
        );
    }

    #[test]
    fn test_strip_word_prefix_keeps_revised_text() {
        assert_eq!(strip_word_prefix("yellow hair", "hello there"), "yellow hair");
        assert_eq!(strip_word_prefix("hello", "hello there"), "hello");
    }

    #[test]
    fn test_unsent_tail_survives_recase_and_repunctuation() {
        let mut ctx = TurnContext::new(1);
        ctx.absorb("bueno pues mira,", Instant::now());
        ctx.mark_streamed();
        ctx.absorb("Bueno, pues mira, vamos a la playa.", Instant::now());
        assert_eq!(ctx.unsent_tail(), "vamos a la playa.");
    }

    #[test]
    fn test_unsent_tail_is_whole_text_after_revision() {
        let mut ctx = TurnContext::new(1);
        ctx.absorb("so when you get to the big station,", Instant::now());
        ctx.mark_streamed();
        ctx.absorb(
            "So when you get to the station, turn left at the light.",
            Instant::now(),
        );
        assert_eq!(
            ctx.unsent_tail(),
            "So when you get to the station, turn left at the light."
        );

        let mut ctx = TurnContext::new(2);
        ctx.absorb("bueno pues mira,", Instant::now());
        ctx.mark_streamed();
        ctx.absorb("Bueno, pues mirá, vamos a la playa.", Instant::now());
        assert_eq!(ctx.unsent_tail(), "Bueno, pues mirá, vamos a la playa.");
    }

    #[test]
    fn test_unsent_tail_after_streaming() {
        let mut ctx = TurnContext::new(1);
        ctx.absorb("when you get to the station,", Instant::now());
        assert!(ctx.early_stream_ready(4));
        ctx.mark_streamed();
        assert_eq!(ctx.unsent_tail(), "");
        ctx.absorb("when you get to the station, turn left.", Instant::now());
        assert_eq!(ctx.unsent_tail(), "turn left.");
        assert!(!ctx.early_stream_ready(4));
    }
}
