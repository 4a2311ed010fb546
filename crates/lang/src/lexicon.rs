//! Small per-language word lists used by the voter, commit deferral and
//! purity repair.
//!
//! These are heuristics, not dictionaries: function words, greetings and
//! the most frequent verbs are enough to tell two languages apart inside a
//! short utterance.

use crate::Language;

/// Static vocabulary for one language.
#[derive(Debug)]
pub struct Lexicon {
    pub primary: &'static str,
    stopwords: &'static [&'static str],
    special_chars: &'static [char],
    /// Conjunctions and hesitations that signal a clause is still going.
    fillers: &'static [&'static str],
    pronouns: &'static [&'static str],
    interjections: &'static [&'static str],
}

static ENGLISH: Lexicon = Lexicon {
    primary: "en",
    stopwords: &[
        "the", "a", "an", "and", "or", "but", "of", "to", "in", "on", "at", "for", "with", "from",
        "by", "about", "is", "are", "was", "were", "be", "been", "am", "do", "does", "did", "have",
        "has", "had", "will", "would", "can", "could", "should", "this", "that", "these", "those",
        "what", "where", "when", "why", "how", "who", "which", "not", "yes", "there", "here",
        "very", "just", "so", "if", "then", "than", "too", "also", "some", "any", "all", "my",
        "your", "his", "its", "our", "their", "good", "thanks", "thank", "please", "going",
        "want", "like", "know", "think", "today", "tomorrow", "now", "no",
    ],
    special_chars: &[],
    fillers: &[
        "and", "but", "or", "so", "because", "then", "um", "uh", "er", "like", "the", "a", "an",
        "to", "of", "with", "that", "if",
    ],
    pronouns: &[
        "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them", "myself",
        "yourself",
    ],
    interjections: &["hey", "hi", "hello", "oh", "ah", "wow", "okay", "ok", "well", "bye"],
};

static SPANISH: Lexicon = Lexicon {
    primary: "es",
    stopwords: &[
        "el", "la", "los", "las", "un", "una", "unos", "unas", "y", "o", "a", "pero", "de", "del",
        "al", "en", "con", "por", "para", "sin", "sobre", "es", "son", "era", "fue", "ser",
        "estar", "está", "están", "estás", "estoy", "estamos", "hay", "tengo", "tiene", "tienes",
        "que", "qué", "cómo", "como", "dónde", "donde", "cuándo", "cuando", "porque", "por qué",
        "quién", "cuál", "sí", "muy", "más", "también", "ya", "aquí", "allí", "este", "esta",
        "eso", "esto", "mi", "mis", "su", "sus", "nuestro", "bien", "gracias", "buenos", "buenas",
        "días", "hoy", "mañana", "ahora", "quiero", "puedo", "vamos", "no", "se", "he",
    ],
    special_chars: &['á', 'é', 'í', 'ó', 'ú', 'ñ', 'ü', '¿', '¡'],
    fillers: &[
        "y", "pero", "o", "porque", "entonces", "pues", "eh", "este", "que", "de", "el", "la",
        "los", "las", "un", "una", "con", "si",
    ],
    pronouns: &[
        "yo", "tú", "tu", "él", "ella", "usted", "nosotros", "nosotras", "vosotros", "ustedes",
        "ellos", "ellas", "me", "te", "le", "les", "nos", "os", "lo", "conmigo", "contigo",
    ],
    interjections: &["hola", "oye", "ay", "vaya", "adiós", "vale", "bueno", "venga", "claro"],
};

/// Lexicon for the language's primary subtag, if one is bundled.
pub fn lexicon_for(lang: &Language) -> Option<&'static Lexicon> {
    match lang.primary() {
        "en" => Some(&ENGLISH),
        "es" => Some(&SPANISH),
        _ => None,
    }
}

impl Lexicon {
    pub fn is_stopword(&self, token: &str) -> bool {
        self.stopwords.contains(&token)
    }

    pub fn is_filler(&self, token: &str) -> bool {
        self.fillers.contains(&token)
    }

    pub fn is_pronoun(&self, token: &str) -> bool {
        self.pronouns.contains(&token)
    }

    pub fn is_interjection(&self, token: &str) -> bool {
        self.interjections.contains(&token)
    }

    /// Whether the token is part of this language's marker vocabulary.
    pub fn knows(&self, token: &str) -> bool {
        self.is_stopword(token)
            || self.is_pronoun(token)
            || self.is_interjection(token)
            || self.is_filler(token)
    }

    /// Whether the text contains a character specific to this language.
    pub fn has_special_chars(&self, text: &str) -> bool {
        !self.special_chars.is_empty() && text.chars().any(|c| self.special_chars.contains(&c))
    }

    /// Fraction of tokens that are marker words of this language.
    pub fn stopword_ratio<S: AsRef<str>>(&self, tokens: &[S]) -> f32 {
        if tokens.is_empty() {
            return 0.0;
        }
        let hits = tokens
            .iter()
            .filter(|t| {
                let t = t.as_ref();
                self.is_stopword(t) || self.is_pronoun(t) || self.is_interjection(t)
            })
            .count();
        hits as f32 / tokens.len() as f32
    }
}

fn is_edge_punctuation(c: char) -> bool {
    c.is_ascii_punctuation() || matches!(c, '¿' | '¡' | '«' | '»' | '“' | '”' | '‘' | '’' | '…')
}

/// Lowercase words with surrounding punctuation stripped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(is_edge_punctuation).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Last word of the text, normalized like `tokenize`.
pub fn trailing_token(text: &str) -> Option<String> {
    text.split_whitespace()
        .rev()
        .map(|w| w.trim_matches(is_edge_punctuation).to_lowercase())
        .find(|w| !w.is_empty())
}
