//! Domain-aware extraction templates.
//!
//! Templates are plain data. [`select_template`] picks one from the
//! document's detected domain, falling back to lexical cues in the chunk
//! text and finally to the generic template.

use std::fmt;

/// Minimum distinct cue hits before lexical selection overrides the default
const MIN_CUE_HITS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    Technology,
    Business,
    Academic,
    Generic,
}

impl TemplateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateKind::Technology => "technology",
            TemplateKind::Business => "business",
            TemplateKind::Academic => "academic",
            TemplateKind::Generic => "generic",
        }
    }

    pub fn template(self) -> &'static ExtractionTemplate {
        TEMPLATES
            .iter()
            .find(|template| template.kind == self)
            .unwrap_or(&GENERIC)
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct ExtractionTemplate {
    pub kind: TemplateKind,
    /// Substrings of a detected domain name that select this template
    pub domains: &'static [&'static str],
    /// Lowercase terms whose presence in the text suggests this template
    pub cues: &'static [&'static str],
    /// Extra guidance inserted into the extraction instruction
    pub focus: &'static str,
}

const GENERIC: ExtractionTemplate = ExtractionTemplate {
    kind: TemplateKind::Generic,
    domains: &[],
    cues: &[],
    focus: "Extract the people, organizations, places, concepts and events the text \
            talks about, and how they relate to each other.",
};

/// Specialized templates in selection priority order, then the fallback
pub static TEMPLATES: &[ExtractionTemplate] = &[
    ExtractionTemplate {
        kind: TemplateKind::Technology,
        domains: &["tech", "software", "computer", "engineering", "ai", "技术", "计算机"],
        cues: &[
            "framework", "library", "api", "algorithm", "software", "model", "neural",
            "database", "protocol", "programming", "open source", "gpu", "框架", "算法",
            "模型", "神经网络", "软件", "技术",
        ],
        focus: "Focus on technologies, frameworks, libraries, algorithms and the \
                organizations that build them. Capture dependencies, support and \
                implementation relations between technologies.",
    },
    ExtractionTemplate {
        kind: TemplateKind::Business,
        domains: &["business", "finance", "market", "commerce", "economic", "商业", "金融"],
        cues: &[
            "company", "revenue", "market", "acquisition", "ceo", "investor", "customer",
            "product", "profit", "shares", "startup", "公司", "市场", "收购", "投资",
        ],
        focus: "Focus on companies, executives, products, markets and deals. Capture \
                ownership, employment, partnership and competition relations.",
    },
    ExtractionTemplate {
        kind: TemplateKind::Academic,
        domains: &["academic", "research", "science", "education", "学术", "科研"],
        cues: &[
            "paper", "study", "research", "university", "experiment", "hypothesis",
            "journal", "professor", "theory", "dataset", "论文", "研究", "大学", "实验",
        ],
        focus: "Focus on researchers, institutions, publications, methods and findings. \
                Capture authorship, affiliation, citation and evaluation relations.",
    },
    GENERIC,
];

/// Pick the extraction template for a chunk. Total: always returns a
/// template, [`TemplateKind::Generic`] when nothing matches.
pub fn select_template(domain: Option<&str>, text: &str) -> TemplateKind {
    let specialized = TEMPLATES
        .iter()
        .filter(|template| template.kind != TemplateKind::Generic);

    if let Some(domain) = domain.map(|d| d.trim().to_lowercase()).filter(|d| !d.is_empty()) {
        let by_domain = specialized.clone().find(|template| {
            template.domains.iter().any(|alias| matches_domain(&domain, alias))
        });
        if let Some(template) = by_domain {
            return template.kind;
        }
    }

    let text = text.to_lowercase();
    let mut best = (TemplateKind::Generic, 0usize);
    for template in specialized {
        let hits = template.cues.iter().filter(|cue| text.contains(*cue)).count();
        if hits >= MIN_CUE_HITS && hits > best.1 {
            best = (template.kind, hits);
        }
    }
    best.0
}

/// Short ASCII aliases like "ai" must match a whole word of the domain
fn matches_domain(domain: &str, alias: &str) -> bool {
    if alias.len() <= 2 && alias.is_ascii() {
        domain
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == alias)
    } else {
        domain.contains(alias)
    }
}
