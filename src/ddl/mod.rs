//! DDL parsing and the in-memory metadata catalog Phase 1 reads.
//!
//! Identifier folding follows the warehouse convention the rest of the
//! graph relies on: unquoted table and column names fold to uppercase,
//! schema names fold to lowercase, `db` is always lowercase, and column
//! fqns are always the lowercased `schema.table.column`. The `name_case`
//! option then forces table/column case when set to uppercase/lowercase.

pub mod parser;

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::utils::NameCase;

pub use parser::{ParsedColumn, ParsedDdl, ParsedForeignKey, ParsedTable, parse_ddl};

/// Fold a schema identifier to its canonical (lowercase) form
pub fn fold_schema(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Fold a table or column identifier: uppercase by default, overridden by
/// an explicit name-case policy.
pub fn fold_object_name(raw: &str, name_case: NameCase) -> String {
    let trimmed = raw.trim();
    match name_case {
        NameCase::Original | NameCase::Uppercase => trimmed.to_uppercase(),
        NameCase::Lowercase => trimmed.to_lowercase(),
    }
}

/// Lowercase fqn from already-folded parts
pub fn column_fqn(schema: &str, table: &str, column: &str) -> String {
    [schema, table, column]
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, Default)]
pub struct DdlColumnMeta {
    pub dtype: String,
    pub nullable: bool,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct DdlTableMeta {
    pub description: String,
    /// Folded column name -> metadata
    pub columns: HashMap<String, DdlColumnMeta>,
    pub original_schema: String,
    pub original_name: String,
}

/// Phase 0 output consumed by Phase 1: the schema set (for default-schema
/// resolution) and per-table column metadata (for static-graph
/// enrichment). Shared read-mostly across concurrent file tasks.
#[derive(Debug, Default)]
pub struct DdlCatalog {
    schemas: RwLock<HashSet<String>>,
    tables: DashMap<(String, String), DdlTableMeta>,
}

impl DdlCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_schema(&self, schema: &str) {
        if schema.is_empty() || schema.eq_ignore_ascii_case("public") {
            return;
        }
        self.schemas
            .write()
            .expect("schema set poisoned")
            .insert(schema.to_string());
    }

    pub fn schemas(&self) -> HashSet<String> {
        self.schemas.read().expect("schema set poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn insert_table(&self, schema: &str, table: &str, meta: DdlTableMeta) {
        self.tables.insert((schema.to_lowercase(), table.to_lowercase()), meta);
    }

    pub fn table(&self, schema: &str, table: &str) -> Option<DdlTableMeta> {
        self.tables
            .get(&(schema.to_lowercase(), table.to_lowercase()))
            .map(|entry| entry.value().clone())
    }

    /// Resolve a file's default schema from its directory path: the
    /// deepest folder matching a known DDL schema (case-insensitive),
    /// else the deepest folder, else `public`.
    pub fn resolve_default_schema(&self, directory: &str) -> String {
        let normalized = directory.replace('\\', "/");
        let parts: Vec<String> = normalized
            .split('/')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();

        if parts.is_empty() {
            return "public".to_string();
        }

        let schemas = self.schemas.read().expect("schema set poisoned");
        if !schemas.is_empty() {
            let by_lower: HashMap<String, &String> =
                schemas.iter().map(|s| (s.to_lowercase(), s)).collect();
            for folder in parts.iter().rev() {
                if let Some(matched) = by_lower.get(&folder.to_lowercase()) {
                    return (*matched).clone();
                }
            }
        }

        fold_schema(&parts[parts.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_policies() {
        assert_eq!(fold_schema("SALES"), "sales");
        assert_eq!(fold_object_name("orders", NameCase::Original), "ORDERS");
        assert_eq!(fold_object_name("ORDERS", NameCase::Lowercase), "orders");
        assert_eq!(column_fqn("sales", "ORDERS", "ID"), "sales.orders.id");
    }

    #[test]
    fn test_resolve_default_schema_prefers_known_schema() {
        let catalog = DdlCatalog::new();
        catalog.add_schema("hr");
        assert_eq!(catalog.resolve_default_schema("src/HR/procs"), "hr");
    }

    #[test]
    fn test_resolve_default_schema_falls_back_to_deepest_folder() {
        let catalog = DdlCatalog::new();
        assert_eq!(catalog.resolve_default_schema("src/Finance"), "finance");
    }

    #[test]
    fn test_resolve_default_schema_empty_path() {
        let catalog = DdlCatalog::new();
        assert_eq!(catalog.resolve_default_schema(""), "public");
    }

    #[test]
    fn test_catalog_lookup_is_case_insensitive() {
        let catalog = DdlCatalog::new();
        catalog.insert_table(
            "sales",
            "ORDERS",
            DdlTableMeta { description: "Orders".into(), ..Default::default() },
        );
        assert!(catalog.table("SALES", "orders").is_some());
        assert!(catalog.table("sales", "missing").is_none());
    }

}
