//! Terminal stand-ins for the platform engines.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_engine::{
    PeerId, Recognizer, RecognizerError, RecognizerSink, SpeechOutcome, StopBoundary,
    SynthesisError, Synthesizer, TranscriptUpdate, TranslateError, Translator, Transport,
    TransportError, VoiceId,
};
use parley_events::{topics, EventBus};
use parley_lang::{tokenize, Language};
use tokio::sync::Notify;

/// Typed lines stand in for recognized speech.
///
/// A line ending in `...` continues the current segment as a partial
/// result; any other line completes it.
#[derive(Default)]
pub struct StdinRecognizer {
    state: Mutex<Capture>,
}

#[derive(Default)]
struct Capture {
    sink: Option<RecognizerSink>,
    segment: String,
}

impl StdinRecognizer {
    /// Returns false when capture is not running.
    pub fn hear(&self, line: &str) -> bool {
        let mut state = self.state.lock();
        let Some(sink) = state.sink.clone() else {
            return false;
        };
        let (words, is_final) = match line.strip_suffix("...") {
            Some(partial) => (partial.trim(), false),
            None => (line.trim(), true),
        };
        if !words.is_empty() {
            if !state.segment.is_empty() {
                state.segment.push(' ');
            }
            state.segment.push_str(words);
        }
        let update = if is_final {
            TranscriptUpdate::finished(std::mem::take(&mut state.segment))
        } else {
            TranscriptUpdate::partial(state.segment.clone())
        };
        sink.update(update)
    }
}

#[async_trait]
impl Recognizer for StdinRecognizer {
    fn name(&self) -> &str {
        "stdin"
    }

    async fn start(&self, locale: &Language, sink: RecognizerSink) -> Result<(), RecognizerError> {
        let mut state = self.state.lock();
        state.sink = Some(sink);
        state.segment.clear();
        tracing::debug!(%locale, "stdin capture started");
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock();
        state.sink = None;
        state.segment.clear();
    }
}

const GLOSSARY: &[(&str, &str)] = &[
    ("hello", "hola"),
    ("goodbye", "adiós"),
    ("thanks", "gracias"),
    ("please", "por favor"),
    ("yes", "sí"),
    ("no", "no"),
    ("where", "dónde"),
    ("is", "está"),
    ("the", "el"),
    ("station", "estación"),
    ("beach", "playa"),
    ("museum", "museo"),
    ("how", "cómo"),
    ("are", "estás"),
    ("you", "tú"),
    ("good", "bueno"),
    ("morning", "mañana"),
    ("today", "hoy"),
    ("now", "ahora"),
    ("want", "quiero"),
    ("go", "ir"),
    ("i", "yo"),
    ("we", "nosotros"),
    ("and", "y"),
    ("with", "con"),
    ("water", "agua"),
    ("coffee", "café"),
    ("friend", "amigo"),
    ("very", "muy"),
    ("well", "bien"),
];

/// Word-for-word glossary between English and Spanish. Words without an
/// entry pass through; a phrase with no known word fails to translate.
pub struct GlossaryTranslator;

impl GlossaryTranslator {
    fn lookup(word: &str, to_spanish: bool) -> Option<&'static str> {
        GLOSSARY.iter().find_map(|(en, es)| {
            if to_spanish && *en == word {
                Some(*es)
            } else if !to_spanish && *es == word {
                Some(*en)
            } else {
                None
            }
        })
    }
}

#[async_trait]
impl Translator for GlossaryTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &Language,
        target: &Language,
    ) -> Result<String, TranslateError> {
        let to_spanish = match (source.primary(), target.primary()) {
            ("en", "es") => true,
            ("es", "en") => false,
            _ => {
                return Err(TranslateError::UnsupportedPair {
                    from: source.clone(),
                    to: target.clone(),
                })
            }
        };

        let mut known = 0;
        let words: Vec<String> = tokenize(text)
            .into_iter()
            .map(|word| match Self::lookup(&word, to_spanish) {
                Some(translated) => {
                    known += 1;
                    translated.to_string()
                }
                None => word,
            })
            .collect();
        if known == 0 {
            return Err(TranslateError::Failed("no glossary entry".to_string()));
        }
        Ok(words.join(" "))
    }
}

/// Prints what would be spoken and takes time proportional to its length.
#[derive(Default)]
pub struct ConsoleSynthesizer {
    stop: Notify,
}

#[async_trait]
impl Synthesizer for ConsoleSynthesizer {
    async fn speak(
        &self,
        text: &str,
        language: &Language,
        voice: Option<&VoiceId>,
    ) -> Result<SpeechOutcome, SynthesisError> {
        let voice = voice.map_or("default", |v| v.0.as_str());
        println!("  >> [{language} / {voice}] {text}");
        let words = text.split_whitespace().count().max(1) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(250 * words)) => Ok(SpeechOutcome::Completed),
            _ = self.stop.notified() => Ok(SpeechOutcome::Interrupted),
        }
    }

    fn stop(&self, _boundary: StopBoundary) {
        self.stop.notify_waiters();
    }

    fn voices(&self, language: &Language) -> Vec<VoiceId> {
        vec![VoiceId::new(format!("console-{}", language.primary()))]
    }
}

/// No peer link; peer messages are dropped.
pub struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn send(&self, _payload: &[u8], _reliable: bool) -> Result<(), TransportError> {
        Err(TransportError::NoPeers)
    }

    fn peers(&self) -> Vec<PeerId> {
        Vec::new()
    }

    async fn rediscover(&self) {}
}

/// Prints the on-screen transcript and user notices.
pub struct ConsoleBus;

impl EventBus for ConsoleBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        let field = |key: &str| payload[key].as_str().unwrap_or_default().to_string();
        match topic {
            topics::TRANSCRIPT_DISPLAY => {
                println!("  [{}] {}", field("language"), field("display_text"));
            }
            topics::TRANSCRIPT_REVISED => println!("  (revised) {}", field("text")),
            topics::NOTICE_FATAL | topics::NOTICE_UNTRANSLATED | topics::NOTICE_TRANSPORT_FROZEN => {
                println!("  ! {}", field("message"));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_glossary_translates_known_words() {
        let translated = GlossaryTranslator
            .translate("Where is the station?", &Language::english(), &Language::spanish())
            .await
            .unwrap();
        assert_eq!(translated, "dónde está el estación");

        let err = GlossaryTranslator
            .translate("zzz", &Language::spanish(), &Language::english())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::Failed(_)));
    }

    #[tokio::test]
    async fn test_stdin_segments_accumulate_until_final() {
        let recognizer = StdinRecognizer::default();
        assert!(!recognizer.hear("hello"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        recognizer
            .start(&Language::english(), RecognizerSink::new(1, tx))
            .await
            .unwrap();
        assert!(recognizer.hear("where is..."));
        assert!(recognizer.hear("the station"));

        let texts: Vec<(String, bool)> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|m| match m.event {
                parley_engine::RecognizerEvent::Update(u) => Some((u.text, u.is_final)),
                parley_engine::RecognizerEvent::Error(_) => None,
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                ("where is".to_string(), false),
                ("where is the station".to_string(), true),
            ]
        );
    }
}
