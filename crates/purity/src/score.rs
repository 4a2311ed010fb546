//! Token tagging, purity scoring and span splicing.

use std::ops::Range;

use parley_lang::{lexicon_for, Language, Lexicon};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    /// Known to belong to the target language.
    Target,
    /// Known to belong to the source language only.
    Foreign,
    /// Numbers, dates, currency, URLs and proper nouns; never translated.
    Passthrough,
    /// Not in either lexicon; assumed to be target vocabulary.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedToken<'a> {
    /// The word as it appears in the text, punctuation included.
    pub word: &'a str,
    pub normalized: String,
    pub class: TokenClass,
    pub pronoun: bool,
}

fn is_edge_punctuation(c: char) -> bool {
    c.is_ascii_punctuation() || matches!(c, '¿' | '¡' | '«' | '»' | '“' | '”' | '‘' | '’' | '…')
}

fn ends_sentence(word: &str) -> bool {
    word.trim_end_matches(['"', '\'', ')', '”', '’'])
        .ends_with(['.', '!', '?'])
}

fn is_url(token: &str) -> bool {
    if token.contains("://") || token.starts_with("www.") || token.contains('@') {
        return true;
    }
    let mut parts = token.split('.');
    match (parts.next(), parts.next_back()) {
        (Some(host), Some(tld)) => {
            !host.is_empty() && (2..=6).contains(&tld.len()) && tld.chars().all(char::is_alphabetic)
        }
        _ => false,
    }
}

fn is_numeric_like(word: &str) -> bool {
    word.chars().any(|c| c.is_ascii_digit())
        || word.chars().any(|c| matches!(c, '$' | '€' | '£' | '¥' | '%'))
}

/// Tag each whitespace-separated word of `text` by language.
pub fn tag<'a>(text: &'a str, source: &Language, target: &Language) -> Vec<TaggedToken<'a>> {
    let source_lex = lexicon_for(source);
    let target_lex = lexicon_for(target);
    let knows = |lex: Option<&Lexicon>, token: &str| lex.is_some_and(|l| l.knows(token));
    let special =
        |lex: Option<&Lexicon>, word: &str| lex.is_some_and(|l| l.has_special_chars(word));

    let mut tokens = Vec::new();
    let mut previous: Option<&str> = None;
    for word in text.split_whitespace() {
        let normalized = word.trim_matches(is_edge_punctuation).to_lowercase();
        let known = knows(target_lex, &normalized) || knows(source_lex, &normalized);
        let pronoun = [source_lex, target_lex]
            .into_iter()
            .flatten()
            .any(|l| l.is_pronoun(&normalized));

        let sentence_start = previous.map_or(true, ends_sentence);
        let capitalized = word
            .trim_start_matches(is_edge_punctuation)
            .chars()
            .next()
            .is_some_and(char::is_uppercase);

        let class = if normalized.is_empty()
            || is_numeric_like(word)
            || is_url(&normalized)
            || (capitalized && !sentence_start && !known)
        {
            TokenClass::Passthrough
        } else if knows(target_lex, &normalized) || special(target_lex, word) {
            TokenClass::Target
        } else if knows(source_lex, &normalized) || special(source_lex, word) {
            TokenClass::Foreign
        } else {
            TokenClass::Unknown
        };

        tokens.push(TaggedToken {
            word,
            normalized,
            class,
            pronoun,
        });
        previous = Some(word);
    }
    tokens
}

/// Share of non-passthrough tokens that are not foreign. Text with nothing
/// to judge is pure.
pub fn purity(tokens: &[TaggedToken<'_>]) -> f32 {
    let judged = tokens
        .iter()
        .filter(|t| t.class != TokenClass::Passthrough)
        .count();
    if judged == 0 {
        return 1.0;
    }
    let foreign = tokens
        .iter()
        .filter(|t| t.class == TokenClass::Foreign)
        .count();
    (judged - foreign) as f32 / judged as f32
}

/// Purity of `text` translated from `source` into `target`.
pub fn score(text: &str, source: &Language, target: &Language) -> f32 {
    purity(&tag(text, source, target))
}

/// Word ranges that need re-translation.
///
/// Runs of foreign tokens, merged across a single unknown word, and widened
/// to take in adjacent pronouns, which must be translated with their verb.
pub fn foreign_spans(tokens: &[TaggedToken<'_>]) -> Vec<Range<usize>> {
    let mut runs: Vec<Range<usize>> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if token.class != TokenClass::Foreign {
            continue;
        }
        match runs.last_mut() {
            Some(run) if run.end == i => run.end = i + 1,
            Some(run) if run.end + 1 == i && tokens[run.end].class == TokenClass::Unknown => {
                run.end = i + 1
            }
            _ => runs.push(i..i + 1),
        }
    }

    let absorbable = |t: &TaggedToken<'_>| t.pronoun && t.class != TokenClass::Passthrough;
    let mut spans: Vec<Range<usize>> = Vec::with_capacity(runs.len());
    for mut run in runs {
        while run.start > 0 && absorbable(&tokens[run.start - 1]) {
            run.start -= 1;
        }
        while run.end < tokens.len() && absorbable(&tokens[run.end]) {
            run.end += 1;
        }
        match spans.last_mut() {
            Some(last) if last.end >= run.start => last.end = last.end.max(run.end),
            _ => spans.push(run),
        }
    }
    spans
}

/// Text of a span with the outer punctuation removed, as sent to the
/// translator.
pub fn span_text(tokens: &[TaggedToken<'_>], span: &Range<usize>) -> String {
    let joined = tokens[span.clone()]
        .iter()
        .map(|t| t.word)
        .collect::<Vec<_>>()
        .join(" ");
    joined.trim_matches(is_edge_punctuation).to_string()
}

/// Rebuild the text with each span replaced.
///
/// The span's own outer punctuation is kept unless the replacement brings
/// its own, and a comma is added before a replacement that opens with an
/// inverted mark when the preceding word has no punctuation.
pub fn splice(
    tokens: &[TaggedToken<'_>],
    spans: &[Range<usize>],
    replacements: &[String],
) -> String {
    let mut words: Vec<String> = Vec::with_capacity(tokens.len());
    let mut next = 0;
    for (span, replacement) in spans.iter().zip(replacements) {
        words.extend(tokens[next..span.start].iter().map(|t| t.word.to_string()));
        next = span.end;

        let replacement = replacement.trim();
        if replacement.is_empty() {
            continue;
        }
        let original_first = tokens[span.start].word;
        let original_last = tokens[span.end - 1].word;
        let lead: String = original_first
            .chars()
            .take_while(|c| is_edge_punctuation(*c))
            .collect();
        let trail: String = {
            let rev: Vec<char> = original_last
                .chars()
                .rev()
                .take_while(|c| is_edge_punctuation(*c))
                .collect();
            rev.into_iter().rev().collect()
        };

        let opens_inverted = replacement.starts_with(['¿', '¡']);
        if opens_inverted {
            if let Some(prev) = words.last_mut() {
                if !prev.ends_with(is_edge_punctuation) {
                    prev.push(',');
                }
            }
        }

        let mut piece = String::new();
        if !replacement.starts_with(is_edge_punctuation) {
            piece.push_str(&lead);
        }
        piece.push_str(replacement);
        if !replacement.ends_with(is_edge_punctuation) {
            piece.push_str(&trail);
        }
        words.push(piece);
    }
    words.extend(tokens[next..].iter().map(|t| t.word.to_string()));
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn en() -> Language {
        Language::english()
    }

    fn es() -> Language {
        Language::spanish()
    }

    fn classes(text: &str) -> Vec<TokenClass> {
        tag(text, &en(), &es()).into_iter().map(|t| t.class).collect()
    }

    #[test]
    fn test_mixed_phrase_is_impure() {
        let tokens = tag("Hola how are tu", &en(), &es());
        assert_eq!(
            tokens.iter().map(|t| t.class).collect::<Vec<_>>(),
            vec![
                TokenClass::Target,
                TokenClass::Foreign,
                TokenClass::Foreign,
                TokenClass::Target
            ]
        );
        assert!((purity(&tokens) - 0.5).abs() < 1e-6);
        assert!(score("Hola, ¿cómo estás?", &en(), &es()) >= 0.99);
    }

    #[test]
    fn test_passthrough_whitelist() {
        use TokenClass::*;
        assert_eq!(
            classes("Nos vemos con Michael el 12/05 a las 10:30"),
            vec![
                Target,
                Unknown,
                Target,
                Passthrough,
                Target,
                Passthrough,
                Target,
                Target,
                Passthrough
            ]
        );
        assert_eq!(
            classes("cuesta $20 en example.com"),
            vec![Unknown, Passthrough, Target, Passthrough]
        );
        // Sentence-initial capitals are not proper nouns.
        assert_eq!(classes("The perro"), vec![Foreign, Unknown]);
    }

    #[test]
    fn test_pronouns_are_not_passthrough() {
        let tokens = tag("gracias, I want it", &en(), &es());
        assert_eq!(tokens[1].class, TokenClass::Foreign);
        assert!(tokens[1].pronoun);
        assert_eq!(foreign_spans(&tokens), vec![1..4]);
    }

    #[test]
    fn test_spans_absorb_adjacent_pronouns() {
        let tokens = tag("Hola how are tu", &en(), &es());
        let spans = foreign_spans(&tokens);
        assert_eq!(spans, vec![1..4]);
        assert_eq!(span_text(&tokens, &spans[0]), "how are tu");
    }

    #[test]
    fn test_spans_merge_across_one_unknown_word() {
        let tokens = tag("vamos the big house hoy", &en(), &es());
        // "big" is unknown, "house" is unknown: only "the" is foreign.
        assert_eq!(foreign_spans(&tokens), vec![1..2]);
        let tokens = tag("vamos to big the casa", &en(), &es());
        assert_eq!(foreign_spans(&tokens), vec![1..4]);
    }

    #[test]
    fn test_splice_adds_comma_before_inverted_mark() {
        let tokens = tag("Hola how are tu", &en(), &es());
        let spans = foreign_spans(&tokens);
        let out = splice(&tokens, &spans, &["¿cómo estás?".to_string()]);
        assert_eq!(out, "Hola, ¿cómo estás?");
    }

    #[test]
    fn test_splice_keeps_outer_punctuation() {
        let tokens = tag("Bueno, thank you.", &en(), &es());
        let spans = foreign_spans(&tokens);
        assert_eq!(spans, vec![1..3]);
        assert_eq!(span_text(&tokens, &spans[0]), "thank you");
        let out = splice(&tokens, &spans, &["gracias".to_string()]);
        assert_eq!(out, "Bueno, gracias.");
    }

    #[test]
    fn test_empty_text_is_pure() {
        assert_eq!(score("", &en(), &es()), 1.0);
        assert_eq!(score("42 $5", &en(), &es()), 1.0);
    }
}
