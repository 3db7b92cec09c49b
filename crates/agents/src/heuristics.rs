//! Data tables for dynamic entity creation: noise filtering and type
//! inference. Kept as plain tables so they can be tested and extended
//! without touching the resolver.

use kgfusion_core::{Entity, Schema, DEFAULT_ENTITY_TYPE};

/// Keywords that suggest an entity type when they appear in a name
#[derive(Debug)]
pub struct TypeRule {
    pub entity_type: &'static str,
    /// Lowercase; ASCII keywords match whole words, others match substrings
    pub keywords: &'static [&'static str],
}

/// Checked in order; the first matching rule wins
pub static TYPE_RULES: &[TypeRule] = &[
    TypeRule {
        entity_type: "person",
        keywords: &[
            "mr", "mrs", "ms", "dr", "prof", "professor", "doctor", "engineer", "scientist",
            "researcher", "ceo", "cto", "founder", "president", "director", "manager",
            "author", "teacher", "student", "教授", "博士", "先生", "女士", "工程师", "经理",
            "老师", "学生",
        ],
    },
    TypeRule {
        entity_type: "organization",
        keywords: &[
            "inc", "corp", "corporation", "company", "co", "ltd", "llc", "group",
            "foundation", "institute", "university", "college", "lab", "labs", "agency",
            "association", "team", "公司", "集团", "大学", "学院", "研究院", "研究所",
            "协会", "实验室",
        ],
    },
    TypeRule {
        entity_type: "location",
        keywords: &[
            "city", "country", "province", "state", "county", "river", "lake", "mountain",
            "island", "street", "road", "valley", "bay", "市", "省", "县", "国", "河", "山",
            "湖", "岛", "路",
        ],
    },
];

/// Names that are never worth an entity on their own
pub static STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "of", "to", "in", "on", "at", "by", "for",
    "with", "from", "as", "is", "are", "was", "were", "be", "been", "it", "its", "this",
    "that", "these", "those", "he", "she", "they", "them", "we", "us", "you", "i", "me",
    "my", "our", "their", "his", "her", "which", "who", "what", "there", "here", "thing",
    "things", "something", "someone", "anything", "everything", "other", "others",
    "etc", "none", "null", "unknown", "n/a", "的", "了", "是", "在", "和", "与", "这",
    "那", "它", "他", "她", "他们", "我们", "你们", "这个", "那个", "其他", "东西",
];

/// Too short or on the stopword list
pub fn is_noise(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.chars().count() < 2 {
        return true;
    }
    let lower = trimmed.to_lowercase();
    let normalized = Entity::normalize(trimmed);
    normalized.is_empty()
        || STOPWORDS
            .iter()
            .any(|stop| *stop == lower || *stop == normalized)
}

/// Infer a type from keywords in the name. Falls back to the default type,
/// and also when the inferred type is not allowed by `schema`.
pub fn infer_type(name: &str, schema: &Schema) -> String {
    let lower = name.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    TYPE_RULES
        .iter()
        .find(|rule| {
            rule.keywords.iter().any(|keyword| {
                if keyword.is_ascii() {
                    words.contains(keyword)
                } else {
                    lower.contains(keyword)
                }
            })
        })
        .map(|rule| rule.entity_type)
        .filter(|entity_type| schema.has_node_type(entity_type))
        .unwrap_or(DEFAULT_ENTITY_TYPE)
        .to_string()
}

/// Whether `context` mentions one of the schema's type or relation names
pub fn has_schema_cue(context: &str, schema: &Schema) -> bool {
    let context = context.to_lowercase();
    schema
        .node_types()
        .iter()
        .chain(schema.relation_types())
        .map(|term| term.to_lowercase().replace('_', " "))
        .any(|term| !term.is_empty() && context.contains(&term))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_filter() {
        assert!(is_noise("X"));
        assert!(is_noise("  "));
        assert!(is_noise("The"));
        assert!(is_noise("they"));
        assert!(is_noise("这个"));
        assert!(is_noise("!!"));
        assert!(!is_noise("Meta"));
        assert!(!is_noise("AI"));
        assert!(!is_noise("神经网络"));
    }

    #[test]
    fn test_type_inference() {
        let schema = Schema::base();
        assert_eq!(infer_type("Professor Li", &schema), "person");
        assert_eq!(infer_type("Acme Corp", &schema), "organization");
        assert_eq!(infer_type("清华大学", &schema), "organization");
        assert_eq!(infer_type("Lake Tahoe", &schema), "location");
        assert_eq!(infer_type("神经网络", &schema), "concept");
        // "corporate" is not the whole word "corp"
        assert_eq!(infer_type("Corporate culture", &schema), "concept");
    }

    #[test]
    fn test_inferred_type_must_be_in_schema() {
        let schema = Schema::new(
            ["technology", "concept"],
            ["uses"],
            Vec::<String>::new(),
            Default::default(),
        );
        assert_eq!(infer_type("Acme Corp", &schema), DEFAULT_ENTITY_TYPE);
    }

    #[test]
    fn test_schema_cue() {
        let schema = Schema::base();
        assert!(has_schema_cue("She works for a small technology firm", &schema));
        assert!(has_schema_cue("it is part of the kernel", &schema));
        assert!(!has_schema_cue("小猫在睡觉", &schema));
    }
}
