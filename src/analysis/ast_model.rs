//! Pre-parsed AST input model
//!
//! The pipeline does not parse PL/SQL itself; it consumes AST trees
//! produced upstream and stored as JSON next to the analysis output
//! (`<base>/analysis/<directory>/<basename>.json`). Each node carries its
//! syntactic kind, 1-based line span and children; unit nodes
//! (PROCEDURE/FUNCTION/TRIGGER) may carry a name and parameter list.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AstRoot {
    #[serde(default)]
    pub children: Vec<AstNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AstNode {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub children: Vec<AstNode>,
    #[serde(default)]
    pub parameters: Vec<AstParameter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AstParameter {
    pub name: String,
    #[serde(default)]
    pub dtype: String,
    /// IN, OUT or IN_OUT; defaults to IN when the parser omits it
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "IN".to_string()
}

impl AstRoot {
    /// Maximum endLine across top-level children; the file's last line
    pub fn last_line(&self) -> u32 {
        self.children.iter().map(|c| c.end_line).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_ast() {
        let json = r#"{
            "children": [
                {
                    "type": "PROCEDURE",
                    "name": "sp_a",
                    "startLine": 1,
                    "endLine": 6,
                    "parameters": [{"name": "p", "dtype": "NUMBER"}],
                    "children": [
                        {"type": "SELECT", "startLine": 3, "endLine": 4}
                    ]
                }
            ]
        }"#;
        let root: AstRoot = serde_json::from_str(json).unwrap();
        assert_eq!(root.last_line(), 6);
        let proc = &root.children[0];
        assert_eq!(proc.node_type, "PROCEDURE");
        assert_eq!(proc.parameters[0].mode, "IN");
        assert_eq!(proc.children[0].node_type, "SELECT");
    }

    #[test]
    fn test_empty_ast() {
        let root: AstRoot = serde_json::from_str("{}").unwrap();
        assert_eq!(root.last_line(), 0);
        assert!(root.children.is_empty());
    }
}
