//! Text helpers shared by the DDL parser, the AST processor and the
//! lineage extractor: Cypher escaping, identifier parsing, name-case
//! policy, token estimation and LLM response cleanup.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Identifier case policy applied uniformly across DDL, AST and lineage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameCase {
    #[default]
    Original,
    Uppercase,
    Lowercase,
}

impl NameCase {
    pub fn apply(&self, name: &str) -> String {
        match self {
            Self::Original => name.to_string(),
            Self::Uppercase => name.to_uppercase(),
            Self::Lowercase => name.to_lowercase(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "uppercase" => Self::Uppercase,
            "lowercase" => Self::Lowercase,
            _ => Self::Original,
        }
    }
}

/// Escape a string for inlining into a single-quoted Cypher literal
pub fn escape_for_cypher(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Rough token estimate used for batch planning. Four characters per
/// token tracks the common BPE tokenizers closely enough for budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Split a possibly-qualified, possibly-quoted table identifier into
/// (schema, table). `"SALES"."ORDERS"` -> (Some("SALES"), "ORDERS").
pub fn parse_table_identifier(qualified: &str) -> (Option<String>, String) {
    let unquote = |part: &str| part.trim().trim_matches('"').trim_matches('`').to_string();

    let cleaned = qualified.trim();
    match cleaned.rsplit_once('.') {
        Some((schema, name)) => {
            let schema = unquote(schema);
            let name = unquote(name);
            if schema.is_empty() { (None, name) } else { (Some(schema), name) }
        }
        None => (None, unquote(cleaned)),
    }
}

static CODE_FENCE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").unwrap());
static TRAILING_COMMA_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Strip code-fence wrappers and trailing commas from an LLM response so
/// it parses as JSON. Providers wrap JSON in fences even when asked not to.
pub fn clean_llm_json(content: &str) -> String {
    let unfenced = match CODE_FENCE_REGEX.captures(content) {
        Some(cap) => cap.get(1).map(|m| m.as_str()).unwrap_or(content),
        None => content.trim(),
    };
    TRAILING_COMMA_REGEX.replace_all(unfenced, "$1").into_owned()
}

/// Dice coefficient over character bigrams, used for fuzzy FK candidate
/// matching between column names. Case-insensitive; 1.0 for identical.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.to_lowercase().chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };

    let a_grams = bigrams(a);
    let b_grams = bigrams(b);
    if a_grams.is_empty() || b_grams.is_empty() {
        return if a.eq_ignore_ascii_case(b) { 1.0 } else { 0.0 };
    }

    let mut b_pool = b_grams.clone();
    let mut matches = 0usize;
    for gram in &a_grams {
        if let Some(pos) = b_pool.iter().position(|g| g == gram) {
            b_pool.swap_remove(pos);
            matches += 1;
        }
    }
    (2.0 * matches as f64) / (a_grams.len() + b_grams.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_for_cypher() {
        assert_eq!(escape_for_cypher("it's"), "it\\'s");
        assert_eq!(escape_for_cypher("a\\b"), "a\\\\b");
        assert_eq!(escape_for_cypher("plain"), "plain");
    }

    #[test]
    fn test_name_case() {
        assert_eq!(NameCase::Uppercase.apply("orders"), "ORDERS");
        assert_eq!(NameCase::Lowercase.apply("ORDERS"), "orders");
        assert_eq!(NameCase::Original.apply("Orders"), "Orders");
        assert_eq!(NameCase::parse("UPPERCASE"), NameCase::Uppercase);
        assert_eq!(NameCase::parse("unknown"), NameCase::Original);
    }

    #[test]
    fn test_parse_table_identifier() {
        assert_eq!(
            parse_table_identifier("sales.orders"),
            (Some("sales".to_string()), "orders".to_string())
        );
        assert_eq!(
            parse_table_identifier("\"SALES\".\"ORDERS\""),
            (Some("SALES".to_string()), "ORDERS".to_string())
        );
        assert_eq!(parse_table_identifier("orders"), (None, "orders".to_string()));
    }

    #[test]
    fn test_clean_llm_json_fences_and_commas() {
        let fenced = "```json\n{\"analysis\": [1, 2,]}\n```";
        assert_eq!(clean_llm_json(fenced), "{\"analysis\": [1, 2]}");

        let trailing = "{\"a\": 1,}";
        assert_eq!(clean_llm_json(trailing), "{\"a\": 1}");

        let plain = "  {\"a\": 1}  ";
        assert_eq!(clean_llm_json(plain), "{\"a\": 1}");
    }

    #[test]
    fn test_name_similarity() {
        assert!(name_similarity("customer_id", "customer_id") > 0.99);
        assert!(name_similarity("customer_id", "cust_id") > 0.5);
        assert!(name_similarity("customer_id", "order_date") < 0.4);
        assert_eq!(name_similarity("a", "b"), 0.0);
        assert_eq!(name_similarity("a", "A"), 1.0);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
