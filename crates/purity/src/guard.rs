use std::sync::Arc;

use parley_engine::Translator;
use parley_lang::Language;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::score::{foreign_spans, purity, span_text, splice, tag};
use crate::PuritySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Purity was already above the threshold.
    Clean,
    /// Repair brought purity above the threshold.
    Repaired,
    /// Both passes ran and purity stayed low; the best text is used.
    BestEffort,
    /// The latency budget ran out; repair continues in the background.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairReport {
    pub text: String,
    pub purity: f32,
    pub initial_purity: f32,
    pub selective_passes: u8,
    pub full_retries: u8,
    pub outcome: RepairOutcome,
}

/// Result of guarding one translation.
#[derive(Debug)]
pub struct Guarded {
    pub report: RepairReport,
    /// Background repair, present when the outcome is `Deferred`. Its report
    /// is for the on-screen transcript only.
    pub pending: Option<JoinHandle<RepairReport>>,
}

/// Bounded repair of translations that still contain source-language words.
///
/// At most one selective pass over the foreign spans and one full
/// re-translation run per phrase, however low purity stays.
#[derive(Clone)]
pub struct PurityGuard {
    translator: Arc<dyn Translator>,
    settings: PuritySettings,
}

struct Job {
    translator: Arc<dyn Translator>,
    min_purity: f32,
    source_text: String,
    source: Language,
    target: Language,
}

impl PurityGuard {
    pub fn new(translator: Arc<dyn Translator>, settings: PuritySettings) -> Self {
        Self {
            translator,
            settings,
        }
    }

    pub fn settings(&self) -> &PuritySettings {
        &self.settings
    }

    /// Check `translated` and repair it if needed, without running past
    /// `deadline`.
    pub async fn guard(
        &self,
        source_text: &str,
        translated: &str,
        source: &Language,
        target: &Language,
        deadline: Instant,
    ) -> Guarded {
        let initial_purity = purity(&tag(translated, source, target));
        if initial_purity >= self.settings.min_purity {
            return Guarded {
                report: RepairReport {
                    text: translated.to_string(),
                    purity: initial_purity,
                    initial_purity,
                    selective_passes: 0,
                    full_retries: 0,
                    outcome: RepairOutcome::Clean,
                },
                pending: None,
            };
        }

        tracing::debug!(
            purity = initial_purity,
            min_purity = self.settings.min_purity,
            "translation below purity threshold"
        );

        let job = Job {
            translator: Arc::clone(&self.translator),
            min_purity: self.settings.min_purity,
            source_text: source_text.to_string(),
            source: source.clone(),
            target: target.clone(),
        };
        let best_available = translated.to_string();
        let mut handle = tokio::spawn(job.run(best_available.clone(), initial_purity));

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(report) => Guarded { report, pending: None },
                Err(e) => {
                    tracing::warn!(error = %e, "purity repair task failed");
                    Guarded {
                        report: deferred(best_available, initial_purity),
                        pending: None,
                    }
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!("purity repair over latency budget, deferring");
                Guarded {
                    report: deferred(best_available, initial_purity),
                    pending: Some(handle),
                }
            }
        }
    }
}

fn deferred(text: String, purity: f32) -> RepairReport {
    RepairReport {
        text,
        purity,
        initial_purity: purity,
        selective_passes: 0,
        full_retries: 0,
        outcome: RepairOutcome::Deferred,
    }
}

impl Job {
    async fn run(self, translated: String, initial_purity: f32) -> RepairReport {
        let mut best = translated.clone();
        let mut best_purity = initial_purity;
        let mut report = RepairReport {
            text: String::new(),
            purity: 0.0,
            initial_purity,
            selective_passes: 0,
            full_retries: 0,
            outcome: RepairOutcome::BestEffort,
        };

        report.selective_passes = 1;
        if let Some(repaired) = self.selective(&translated).await {
            let p = self.purity(&repaired);
            if p >= best_purity {
                best = repaired;
                best_purity = p;
            }
        }

        if best_purity < self.min_purity {
            report.full_retries = 1;
            match self
                .translator
                .translate(&self.source_text, &self.source, &self.target)
                .await
            {
                Ok(full) => {
                    let p = self.purity(&full);
                    if p >= best_purity {
                        best = full;
                        best_purity = p;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "full re-translation failed"),
            }
        }

        report.outcome = if best_purity >= self.min_purity {
            RepairOutcome::Repaired
        } else {
            RepairOutcome::BestEffort
        };
        report.text = best;
        report.purity = best_purity;

        tracing::debug!(
            purity = report.purity,
            selective_passes = report.selective_passes,
            full_retries = report.full_retries,
            outcome = ?report.outcome,
            "purity repair finished"
        );
        report
    }

    /// Re-translate only the foreign spans, one per line in a single call.
    async fn selective(&self, translated: &str) -> Option<String> {
        let tokens = tag(translated, &self.source, &self.target);
        let spans = foreign_spans(&tokens);
        if spans.is_empty() {
            return None;
        }
        let request = spans
            .iter()
            .map(|span| span_text(&tokens, span))
            .collect::<Vec<_>>()
            .join("\n");

        let response = match self
            .translator
            .translate(&request, &self.source, &self.target)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, spans = spans.len(), "span re-translation failed");
                return None;
            }
        };

        let replacements: Vec<String> = response.lines().map(str::to_string).collect();
        if replacements.len() != spans.len() {
            tracing::debug!(
                expected = spans.len(),
                got = replacements.len(),
                "span re-translation changed line count"
            );
            return None;
        }
        Some(splice(&tokens, &spans, &replacements))
    }

    fn purity(&self, text: &str) -> f32 {
        purity(&tag(text, &self.source, &self.target))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use parley_engine::TranslateError;

    use super::*;

    #[derive(Default)]
    struct ScriptedTranslator {
        responses: HashMap<String, String>,
        fallback: Option<String>,
        delay: Duration,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTranslator {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Translator for ScriptedTranslator {
        async fn translate(
            &self,
            text: &str,
            _source: &Language,
            _target: &Language,
        ) -> Result<String, TranslateError> {
            self.calls.lock().push(text.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.responses
                .get(text)
                .or(self.fallback.as_ref())
                .cloned()
                .ok_or_else(|| TranslateError::Failed("no script".into()))
        }
    }

    fn guard(translator: Arc<ScriptedTranslator>) -> PurityGuard {
        PurityGuard::new(translator, PuritySettings::default())
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_translation_is_untouched() {
        let translator = Arc::new(ScriptedTranslator::default());
        let guarded = guard(translator.clone())
            .guard(
                "Good morning",
                "Buenos días",
                &Language::english(),
                &Language::spanish(),
                later(),
            )
            .await;
        assert_eq!(guarded.report.outcome, RepairOutcome::Clean);
        assert_eq!(guarded.report.text, "Buenos días");
        assert!(translator.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_selective_span_repair() {
        let translator = Arc::new(ScriptedTranslator {
            responses: HashMap::from([("how are tu".to_string(), "¿cómo estás?".to_string())]),
            ..Default::default()
        });
        let guarded = guard(translator.clone())
            .guard(
                "Hey, how are you?",
                "Hola how are tu",
                &Language::english(),
                &Language::spanish(),
                later(),
            )
            .await;

        let report = guarded.report;
        assert_eq!(report.text, "Hola, ¿cómo estás?");
        assert_eq!(report.outcome, RepairOutcome::Repaired);
        assert_eq!(report.selective_passes, 1);
        assert_eq!(report.full_retries, 0);
        assert!(report.initial_purity < 0.75);
        assert!(report.purity >= 0.75);
        assert_eq!(translator.calls(), vec!["how are tu".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_is_bounded_when_purity_stays_zero() {
        let translator = Arc::new(ScriptedTranslator {
            fallback: Some("how are you".to_string()),
            ..Default::default()
        });
        let guarded = guard(translator.clone())
            .guard(
                "How are you?",
                "how are you",
                &Language::english(),
                &Language::spanish(),
                later(),
            )
            .await;

        assert_eq!(guarded.report.outcome, RepairOutcome::BestEffort);
        assert_eq!(guarded.report.purity, 0.0);
        assert_eq!(guarded.report.selective_passes, 1);
        assert_eq!(guarded.report.full_retries, 1);
        assert_eq!(translator.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_retry_after_failed_selective_pass() {
        let translator = Arc::new(ScriptedTranslator {
            responses: HashMap::from([(
                "I want the menu".to_string(),
                "Quiero el menú".to_string(),
            )]),
            ..Default::default()
        });
        let guarded = guard(translator.clone())
            .guard(
                "I want the menu",
                "I want the menú",
                &Language::english(),
                &Language::spanish(),
                later(),
            )
            .await;

        assert_eq!(guarded.report.text, "Quiero el menú");
        assert_eq!(guarded.report.outcome, RepairOutcome::Repaired);
        assert_eq!(guarded.report.full_retries, 1);
        assert_eq!(translator.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_budget_speaks_best_available_and_defers() {
        let translator = Arc::new(ScriptedTranslator {
            responses: HashMap::from([("how are tu".to_string(), "¿cómo estás?".to_string())]),
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let deadline = Instant::now() + Duration::from_millis(100);
        let guarded = guard(translator.clone())
            .guard(
                "Hey, how are you?",
                "Hola how are tu",
                &Language::english(),
                &Language::spanish(),
                deadline,
            )
            .await;

        assert_eq!(guarded.report.outcome, RepairOutcome::Deferred);
        assert_eq!(guarded.report.text, "Hola how are tu");
        let background = guarded.pending.unwrap().await.unwrap();
        assert_eq!(background.text, "Hola, ¿cómo estás?");
        assert_eq!(background.outcome, RepairOutcome::Repaired);
    }
}
