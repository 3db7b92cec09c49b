//! Query preprocessing: normalization, query-type detection, keyword and
//! candidate-entity extraction for retrieval seeding.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Definition,
    Method,
    Reason,
    Comparison,
    General,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryType::Definition => "definition",
            QueryType::Method => "method",
            QueryType::Reason => "reason",
            QueryType::Comparison => "comparison",
            QueryType::General => "general",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedQuery {
    pub original: String,
    pub normalized: String,
    /// Lowercased ASCII terms and CJK segments, stopwords removed
    pub keywords: Vec<String>,
    /// Candidate entity mentions (capitalized phrases, CJK segments)
    pub entities: Vec<String>,
    pub query_type: QueryType,
    /// How sure the query-type detection is
    pub confidence: f32,
    /// Phrasings the graph and keyword channels search: the normalized
    /// query, the keyword combination, then longer entity mentions
    pub search_queries: Vec<String>,
}

const PATTERN_CONFIDENCE: f32 = 0.9;
const KEYWORD_CONFIDENCE: f32 = 0.7;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const MAX_SEARCH_QUERIES: usize = 5;
/// Entity mentions this short are too ambiguous to search on their own
const MIN_ENTITY_QUERY_CHARS: usize = 3;

macro_rules! lazy_regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($pattern).ok());
    };
}

lazy_regex!(WHITESPACE, r"\s+");
lazy_regex!(ASCII_TOKEN, r"[A-Za-z0-9][A-Za-z0-9_+#.\-]*[A-Za-z0-9+#]|[A-Za-z0-9]");
lazy_regex!(CJK_RUN, r"[\p{Han}]+");
lazy_regex!(CAPITALIZED_PHRASE, r"\b[A-Z][A-Za-z0-9]*(?:\s+[A-Z][A-Za-z0-9]*)*");

/// Strong patterns, checked in order
static TYPE_PATTERNS: LazyLock<Vec<(QueryType, Option<Regex>)>> = LazyLock::new(|| {
    [
        (
            QueryType::Comparison,
            r"(?i)\b(vs\.?|versus|compared? (to|with)|difference between)\b|区别|对比|比较",
        ),
        (
            QueryType::Definition,
            r"(?i)^(what\s+(is|are)|what's|define|definition of)\b|是什么|什么是",
        ),
        (
            QueryType::Method,
            r"(?i)^how\s+(do|does|to|can|should|is|are)\b|如何|怎么",
        ),
        (QueryType::Reason, r"(?i)^why\b|为什么"),
    ]
    .into_iter()
    .map(|(query_type, pattern)| (query_type, Regex::new(pattern).ok()))
    .collect()
});

/// Weaker single-word cues
static TYPE_CUES: &[(QueryType, &[&str])] = &[
    (QueryType::Definition, &["what", "define", "meaning", "什么", "定义", "含义"]),
    (QueryType::Method, &["how", "steps", "method", "方法", "步骤"]),
    (QueryType::Reason, &["why", "cause", "reason", "原因"]),
];

/// Colloquial forms rewritten before matching
static REPLACEMENTS: &[(&str, &str)] = &[
    ("？", "?"),
    ("！", "!"),
    ("是啥", "是什么"),
    ("咋样", "怎么样"),
    ("咋办", "怎么办"),
    ("啥意思", "什么意思"),
];

pub static QUERY_STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "do", "does", "did", "of", "in",
    "on", "for", "to", "and", "or", "with", "by", "from", "about", "between", "what",
    "what's", "how", "why", "which", "who", "when", "where", "can", "could", "should",
    "would", "will", "me", "tell", "explain", "please", "i", "you", "it", "this", "that",
    "vs", "versus", "difference", "compare", "compared",
];

/// CJK function words removed from Han runs; longest first
static CJK_STOPWORDS: &[&str] = &[
    "为什么", "是什么", "什么是", "怎么样", "怎么", "如何", "什么", "哪些", "一个", "没有",
    "自己", "的", "了", "在", "是", "我", "有", "和", "与", "就", "不", "都", "也", "很",
    "吗", "呢", "啊", "这", "那",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProcessor;

impl QueryProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn process(&self, query: &str) -> ProcessedQuery {
        let normalized = normalize(query);
        let (query_type, confidence) = classify(&normalized);
        let cjk_segments = cjk_segments(&normalized);

        let mut keywords = Vec::new();
        if let Some(token) = ASCII_TOKEN.as_ref() {
            for m in token.find_iter(&normalized) {
                let word = m.as_str().to_lowercase();
                if word.chars().count() > 1 && !QUERY_STOPWORDS.contains(&word.as_str()) {
                    push_unique(&mut keywords, word);
                }
            }
        }
        for segment in &cjk_segments {
            push_unique(&mut keywords, segment.clone());
        }

        let mut entities = Vec::new();
        if let Some(phrase) = CAPITALIZED_PHRASE.as_ref() {
            for m in phrase.find_iter(&normalized) {
                let words: Vec<&str> = m
                    .as_str()
                    .split_whitespace()
                    .skip_while(|w| QUERY_STOPWORDS.contains(&w.to_lowercase().as_str()))
                    .collect();
                if !words.is_empty() {
                    push_unique(&mut entities, words.join(" "));
                }
            }
        }
        for segment in cjk_segments {
            push_unique(&mut entities, segment);
        }

        let search_queries = search_queries(&normalized, &keywords, &entities);
        ProcessedQuery {
            original: query.to_string(),
            normalized,
            keywords,
            entities,
            query_type,
            confidence,
            search_queries,
        }
    }
}

fn normalize(query: &str) -> String {
    let mut normalized = match WHITESPACE.as_ref() {
        Some(ws) => ws.replace_all(query.trim(), " ").into_owned(),
        None => query.trim().to_string(),
    };
    for (from, to) in REPLACEMENTS {
        if normalized.contains(from) {
            normalized = normalized.replace(from, to);
        }
    }
    normalized
}

fn classify(query: &str) -> (QueryType, f32) {
    for (query_type, pattern) in TYPE_PATTERNS.iter() {
        if pattern.as_ref().is_some_and(|p| p.is_match(query)) {
            return (*query_type, PATTERN_CONFIDENCE);
        }
    }

    let lower = query.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    for (query_type, cues) in TYPE_CUES {
        let hit = cues.iter().any(|cue| {
            if cue.is_ascii() {
                words.contains(cue)
            } else {
                lower.contains(cue)
            }
        });
        if hit {
            return (*query_type, KEYWORD_CONFIDENCE);
        }
    }
    (QueryType::General, DEFAULT_CONFIDENCE)
}

/// Han runs split on function words, keeping segments of two or more chars
fn cjk_segments(query: &str) -> Vec<String> {
    let Some(run) = CJK_RUN.as_ref() else {
        return Vec::new();
    };
    let mut segments = Vec::new();
    for m in run.find_iter(query) {
        let mut text = m.as_str().to_string();
        for stop in CJK_STOPWORDS {
            text = text.replace(stop, " ");
        }
        for segment in text.split_whitespace() {
            if segment.chars().count() >= 2 {
                push_unique(&mut segments, segment.to_string());
            }
        }
    }
    segments
}

fn search_queries(normalized: &str, keywords: &[String], entities: &[String]) -> Vec<String> {
    let mut queries = Vec::new();
    if !normalized.is_empty() {
        queries.push(normalized.to_string());
    }
    if keywords.len() > 1 {
        push_unique(&mut queries, keywords.join(" "));
    }
    for entity in entities {
        if entity.chars().count() >= MIN_ENTITY_QUERY_CHARS {
            push_unique(&mut queries, entity.clone());
        }
    }
    queries.truncate(MAX_SEARCH_QUERIES);
    queries
}

fn push_unique(items: &mut Vec<String>, item: String) {
    if !items.contains(&item) {
        items.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let q = QueryProcessor::new().process("  PyTorch   是啥？ ");
        assert_eq!(q.normalized, "PyTorch 是什么?");
        assert_eq!(q.original, "  PyTorch   是啥？ ");
    }

    #[test]
    fn test_query_types() {
        let p = QueryProcessor::new();
        assert_eq!(p.process("What is PyTorch?").query_type, QueryType::Definition);
        assert_eq!(p.process("What is PyTorch?").confidence, 0.9);
        assert_eq!(p.process("How do I train a model").query_type, QueryType::Method);
        assert_eq!(p.process("Why did Meta open source it").query_type, QueryType::Reason);
        assert_eq!(
            p.process("What is the difference between PyTorch and JAX").query_type,
            QueryType::Comparison
        );
        assert_eq!(p.process("神经网络如何训练").query_type, QueryType::Method);

        let weak = p.process("PyTorch meaning");
        assert_eq!((weak.query_type, weak.confidence), (QueryType::Definition, 0.7));

        let general = p.process("PyTorch release notes");
        assert_eq!((general.query_type, general.confidence), (QueryType::General, 0.5));
    }

    #[test]
    fn test_keywords_and_entities() {
        let q = QueryProcessor::new().process("How does Meta use PyTorch for 神经网络的训练?");
        assert_eq!(q.keywords, vec!["meta", "use", "pytorch", "神经网络", "训练"]);
        assert_eq!(q.entities, vec!["Meta", "PyTorch", "神经网络", "训练"]);
    }

    #[test]
    fn test_leading_question_words_are_not_entities() {
        let q = QueryProcessor::new().process("What Is Deep Learning");
        assert_eq!(q.entities, vec!["Deep Learning"]);
    }

    #[test]
    fn test_search_queries() {
        let q = QueryProcessor::new().process("How does Meta use PyTorch for 神经网络的训练?");
        assert_eq!(
            q.search_queries,
            vec![
                "How does Meta use PyTorch for 神经网络的训练?",
                "meta use pytorch 神经网络 训练",
                "Meta",
                "PyTorch",
                "神经网络",
            ]
        );

        // A bare entity name collapses to a single phrasing
        let single = QueryProcessor::new().process("PyTorch");
        assert_eq!(single.search_queries, vec!["PyTorch"]);

        assert!(QueryProcessor::new().process("   ").search_queries.is_empty());
    }

    #[test]
    fn test_technical_tokens_survive() {
        let q = QueryProcessor::new().process("node.js vs c++");
        assert!(q.keywords.contains(&"node.js".to_string()));
        assert!(q.keywords.contains(&"c++".to_string()));
    }
}
