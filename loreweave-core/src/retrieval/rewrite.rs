//! Query rewriting before retrieval.

use crate::generation::TextGenerator;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Synonyms appended per matched query word.
const MAX_SYNONYMS_PER_WORD: usize = 3;

/// Transforms a query before it reaches the retrievers.
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(&self, query: &str) -> String;
}

static FANTASY_SYNONYMS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let entries: &[(&str, &[&str])] = &[
        ("wizard", &["mage", "sorcerer", "wizardry"]),
        ("mage", &["wizard", "sorcerer"]),
        ("sword", &["blade", "weapon"]),
        ("king", &["ruler", "lord", "throne"]),
        ("castle", &["fortress", "keep", "citadel"]),
        ("forest", &["woods", "wood"]),
        ("elf", &["elves", "elven"]),
        ("dwarf", &["dwarves", "dwarven"]),
        ("dragon", &["wyrm", "drake"]),
        ("ring", &["rings"]),
        ("talk", &["speak", "ask", "say"]),
        ("speak", &["talk", "say"]),
        ("ask", &["question", "inquire"]),
        ("attack", &["fight", "strike", "battle"]),
        ("fight", &["battle", "attack"]),
        ("go", &["travel", "walk"]),
        ("road", &["path", "way"]),
        ("magic", &["spell", "sorcery", "enchantment"]),
        ("spell", &["magic", "enchantment"]),
        ("journey", &["quest", "travel"]),
    ];
    entries.iter().copied().collect()
});

/// Expands a query with domain synonyms.
pub struct SynonymRewriter {
    synonyms: HashMap<String, Vec<String>>,
}

impl SynonymRewriter {
    /// Rewriter using the built-in fantasy vocabulary.
    pub fn new() -> Self {
        let synonyms = FANTASY_SYNONYMS
            .iter()
            .map(|(word, list)| {
                (
                    (*word).to_string(),
                    list.iter().map(|s| (*s).to_string()).collect(),
                )
            })
            .collect();
        Self { synonyms }
    }

    /// Rewriter using a custom synonym table.
    pub fn with_table(synonyms: HashMap<String, Vec<String>>) -> Self {
        Self { synonyms }
    }

    /// Append synonyms of recognised words, skipping anything already present.
    pub fn expand(&self, query: &str) -> String {
        let words: Vec<String> = query
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect();

        let mut additions: Vec<&str> = Vec::new();
        for word in &words {
            let Some(list) = self.synonyms.get(word) else {
                continue;
            };
            for synonym in list.iter().take(MAX_SYNONYMS_PER_WORD) {
                let present = words.iter().any(|w| w == synonym)
                    || additions.iter().any(|a| *a == synonym.as_str());
                if !present {
                    additions.push(synonym);
                }
            }
        }

        if additions.is_empty() {
            query.to_string()
        } else {
            format!("{} {}", query, additions.join(" "))
        }
    }
}

impl Default for SynonymRewriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryRewriter for SynonymRewriter {
    async fn rewrite(&self, query: &str) -> String {
        let expanded = self.expand(query);
        debug!(original = %query, expanded = %expanded, "expanded query");
        expanded
    }
}

const REWRITE_SYSTEM_PROMPT: &str = "You rewrite search queries for a passage retrieval system over a fantasy novel corpus. Reply with the rewritten query only, on one line, with no commentary.";

/// Asks a text generator to rewrite the query. Falls back to the input.
pub struct LlmRewriter {
    generator: Arc<dyn TextGenerator>,
}

impl LlmRewriter {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl QueryRewriter for LlmRewriter {
    async fn rewrite(&self, query: &str) -> String {
        let prompt = format!(
            "Rewrite the following query for better information retrieval. Keep names and key nouns.\n\nQuery: {query}"
        );
        match self
            .generator
            .generate(&prompt, Some(REWRITE_SYSTEM_PROMPT))
            .await
        {
            Ok(text) => {
                let rewritten = text.lines().next().unwrap_or("").trim();
                if rewritten.is_empty() {
                    query.to_string()
                } else {
                    rewritten.to_string()
                }
            }
            Err(e) => {
                warn!(error = %e, "query rewrite failed, using original query");
                query.to_string()
            }
        }
    }
}
