//! Static DDL parser
//!
//! Regex-based, deliberately not a full SQL parser: the job is to be fast
//! and deterministic and to tolerate hand-written dialects. Extracts, per
//! `CREATE TABLE`/`CREATE VIEW`: schema, name, table type, column list
//! (name, dtype, nullable, inline comment), primary keys, and declared
//! foreign keys, plus `COMMENT ON TABLE/COLUMN` statements.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::{AnalyzerError, AnalyzerResult, parse_table_identifier};

#[derive(Debug, Clone, Default)]
pub struct ParsedDdl {
    pub tables: Vec<ParsedTable>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTable {
    pub schema: Option<String>,
    pub name: String,
    pub comment: String,
    /// BASE TABLE or VIEW
    pub table_type: String,
    pub columns: Vec<ParsedColumn>,
    /// Uppercased column names
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ParsedForeignKey>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedColumn {
    pub name: String,
    pub dtype: String,
    pub nullable: bool,
    pub comment: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedForeignKey {
    pub column: String,
    pub ref_schema: Option<String>,
    pub ref_table: String,
    pub ref_column: String,
}

static CREATE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\bCREATE\s+(?:OR\s+REPLACE\s+)?(TABLE|VIEW)\s+(?:IF\s+NOT\s+EXISTS\s+)?([A-Za-z0-9_"$.]+)"#)
        .unwrap()
});

static COMMENT_ON_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bCOMMENT\s+ON\s+TABLE\s+([A-Za-z0-9_"$.]+)\s+IS\s+'((?:[^']|'')*)'"#)
        .unwrap()
});

static COMMENT_ON_COLUMN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bCOMMENT\s+ON\s+COLUMN\s+([A-Za-z0-9_"$.]+)\s+IS\s+'((?:[^']|'')*)'"#)
        .unwrap()
});

static COLUMN_DEF_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)^"?([A-Za-z0-9_$]+)"?\s+([A-Za-z]\w*(?:\s*\(\s*\d+(?:\s*,\s*\d+)?\s*\))?(?:\s+with(?:out)?\s+time\s+zone)?)(.*)$"#)
        .unwrap()
});

static REFERENCES_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bREFERENCES\s+([A-Za-z0-9_"$.]+)(?:\s*\(\s*"?([A-Za-z0-9_$]+)"?\s*\))?"#)
        .unwrap()
});

static CONSTRAINT_PK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bPRIMARY\s+KEY\s*\(([^)]*)\)").unwrap());

static CONSTRAINT_FK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\bFOREIGN\s+KEY\s*\(\s*"?([A-Za-z0-9_$]+)"?\s*\)\s*REFERENCES\s+([A-Za-z0-9_"$.]+)(?:\s*\(\s*"?([A-Za-z0-9_$]+)"?\s*\))?"#)
        .unwrap()
});

static INLINE_COMMENT_ATTR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bCOMMENT\s+'((?:[^']|'')*)'"#).unwrap());

static LINE_COMMENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)--([^\r\n]*)$").unwrap());

/// Parse a DDL document. Hard syntax problems (an unterminated column
/// list) abort; unknown statements are ignored.
pub fn parse_ddl(content: &str) -> AnalyzerResult<ParsedDdl> {
    let mut tables: Vec<ParsedTable> = Vec::new();

    for cap in CREATE_REGEX.captures_iter(content) {
        let kind = cap.get(1).map(|m| m.as_str().to_uppercase()).unwrap_or_default();
        let identifier = cap.get(2).map(|m| m.as_str()).unwrap_or_default();
        let (schema, name) = parse_table_identifier(identifier);
        if name.is_empty() {
            continue;
        }

        let mut table = ParsedTable {
            schema,
            name,
            table_type: if kind == "VIEW" { "VIEW".to_string() } else { "BASE TABLE".to_string() },
            ..Default::default()
        };

        if kind == "TABLE" {
            let after = &content[cap.get(0).map(|m| m.end()).unwrap_or(0)..];
            if after.trim_start().to_uppercase().starts_with("AS ") {
                // CREATE TABLE ... AS SELECT: no column list to parse
                tables.push(table);
                continue;
            }
            // CREATE TABLE AS SELECT and friends carry no column list; a
            // semicolon before any paren means the next paren belongs to
            // another statement.
            let open = match (after.find('('), after.find(';')) {
                (Some(open), Some(semi)) if open < semi => open,
                (Some(open), None) => open,
                _ => {
                    tables.push(table);
                    continue;
                }
            };
            let body = extract_balanced(&after[open..]).ok_or_else(|| {
                AnalyzerError::Analysis(format!(
                    "unterminated column list for table {}",
                    table.name
                ))
            })?;
            parse_column_body(body, &mut table);
        }

        tables.push(table);
    }

    apply_comment_statements(content, &mut tables);
    Ok(ParsedDdl { tables })
}

/// Return the text inside the first balanced parenthesis pair, or None
/// when the list never closes.
fn extract_balanced(text: &str) -> Option<&str> {
    debug_assert!(text.starts_with('('));
    let mut depth = 0usize;
    for (idx, ch) in text.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[1..idx]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_column_body(body: &str, table: &mut ParsedTable) {
    // One-column-per-line `-- comment` trailers attach to the column on
    // that line; strip them before splitting so they never leak into the
    // next definition.
    let mut line_comments: Vec<(String, String)> = Vec::new();
    for line in body.lines() {
        if let Some(pos) = line.find("--") {
            let before = line[..pos].trim().trim_start_matches('"');
            let comment = line[pos + 2..].trim().to_string();
            if let Some(first_word) = before.split_whitespace().next() {
                let column = first_word.trim_matches('"').trim_matches(',').to_string();
                if !column.is_empty() && !comment.is_empty() {
                    line_comments.push((column.to_uppercase(), comment));
                }
            }
        }
    }
    let body = LINE_COMMENT_REGEX.replace_all(body, "");

    for definition in split_top_level(&body) {
        let definition = definition.trim();
        if definition.is_empty() {
            continue;
        }

        let upper = definition.to_uppercase();
        if upper.starts_with("PRIMARY KEY") || upper.starts_with("CONSTRAINT") {
            if let Some(pk) = CONSTRAINT_PK_REGEX.captures(definition) {
                for col in pk[1].split(',') {
                    let col = col.trim().trim_matches('"');
                    if !col.is_empty() {
                        table.primary_keys.push(col.to_uppercase());
                    }
                }
            }
            if let Some(fk) = CONSTRAINT_FK_REGEX.captures(definition) {
                push_foreign_key(table, &fk[1], &fk[2], fk.get(3).map(|m| m.as_str()));
            }
            continue;
        }
        if upper.starts_with("FOREIGN KEY") {
            if let Some(fk) = CONSTRAINT_FK_REGEX.captures(definition) {
                push_foreign_key(table, &fk[1], &fk[2], fk.get(3).map(|m| m.as_str()));
            }
            continue;
        }
        if upper.starts_with("UNIQUE") || upper.starts_with("CHECK") || upper.starts_with("KEY ") {
            continue;
        }

        let Some(col) = COLUMN_DEF_REGEX.captures(definition) else {
            continue;
        };
        let name = col[1].to_string();
        let dtype = col[2].split_whitespace().collect::<Vec<_>>().join(" ");
        let rest = col.get(3).map(|m| m.as_str()).unwrap_or("");
        let rest_upper = rest.to_uppercase();

        let mut column = ParsedColumn {
            name: name.clone(),
            dtype,
            nullable: !rest_upper.contains("NOT NULL"),
            comment: String::new(),
        };

        if let Some(attr) = INLINE_COMMENT_ATTR_REGEX.captures(rest) {
            column.comment = attr[1].replace("''", "'");
        }
        if let Some((_, comment)) =
            line_comments.iter().find(|(c, _)| *c == name.to_uppercase())
        {
            if column.comment.is_empty() {
                column.comment = comment.clone();
            }
        }

        if rest_upper.contains("PRIMARY KEY") {
            table.primary_keys.push(name.to_uppercase());
        }

        if let Some(fk) = REFERENCES_REGEX.captures(rest) {
            push_foreign_key(table, &name, &fk[1], fk.get(2).map(|m| m.as_str()));
        }

        table.columns.push(column);
    }
}

fn push_foreign_key(table: &mut ParsedTable, column: &str, target: &str, ref_col: Option<&str>) {
    let (ref_schema, ref_table, ref_column) = match ref_col {
        // REFERENCES schema.table(col)
        Some(col) => {
            let (schema, name) = parse_table_identifier(target);
            (schema, name, col.to_string())
        }
        // REFERENCES schema.table.col
        None => {
            let (qualified, col) = match target.rsplit_once('.') {
                Some((left, col)) => (left, col),
                None => return,
            };
            let (schema, name) = parse_table_identifier(qualified);
            (schema, name, col.trim_matches('"').to_string())
        }
    };

    if ref_table.is_empty() || ref_column.is_empty() {
        return;
    }
    table.foreign_keys.push(ParsedForeignKey {
        column: column.trim_matches('"').to_string(),
        ref_schema,
        ref_table,
        ref_column,
    });
}

/// Split on commas outside parentheses
fn split_top_level(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;

    for ch in body.chars() {
        match ch {
            '\'' => {
                in_string = !in_string;
                current.push(ch);
            }
            '(' if !in_string => {
                depth += 1;
                current.push(ch);
            }
            ')' if !in_string => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 && !in_string => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn apply_comment_statements(content: &str, tables: &mut [ParsedTable]) {
    for cap in COMMENT_ON_TABLE_REGEX.captures_iter(content) {
        let (schema, name) = parse_table_identifier(&cap[1]);
        let comment = cap[2].replace("''", "'");
        for table in tables.iter_mut() {
            if table.name.eq_ignore_ascii_case(&name)
                && schema
                    .as_deref()
                    .is_none_or(|s| table.schema.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(s)))
            {
                table.comment = comment.clone();
            }
        }
    }

    for cap in COMMENT_ON_COLUMN_REGEX.captures_iter(content) {
        let full = cap[1].to_string();
        let comment = cap[2].replace("''", "'");
        let Some((qualified, column_name)) = full.rsplit_once('.') else {
            continue;
        };
        let (schema, name) = parse_table_identifier(qualified);
        let column_name = column_name.trim_matches('"');
        for table in tables.iter_mut() {
            if !table.name.eq_ignore_ascii_case(&name) {
                continue;
            }
            if let Some(s) = &schema
                && !table.schema.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(s))
            {
                continue;
            }
            for column in table.columns.iter_mut() {
                if column.name.eq_ignore_ascii_case(column_name) && column.comment.is_empty() {
                    column.comment = comment.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_with_inline_fk_and_comment_on() {
        let ddl = r#"
            CREATE TABLE sales.orders(
                id NUMBER PRIMARY KEY,
                customer_id NUMBER REFERENCES sales.customers.id
            );
            COMMENT ON TABLE sales.orders IS 'Orders';
        "#;
        let parsed = parse_ddl(ddl).unwrap();
        assert_eq!(parsed.tables.len(), 1);

        let table = &parsed.tables[0];
        assert_eq!(table.schema.as_deref(), Some("sales"));
        assert_eq!(table.name, "orders");
        assert_eq!(table.comment, "Orders");
        assert_eq!(table.table_type, "BASE TABLE");
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.primary_keys, vec!["ID"]);

        let fk = &table.foreign_keys[0];
        assert_eq!(fk.column, "customer_id");
        assert_eq!(fk.ref_schema.as_deref(), Some("sales"));
        assert_eq!(fk.ref_table, "customers");
        assert_eq!(fk.ref_column, "id");
    }

    #[test]
    fn test_parse_parenthesised_references() {
        let ddl = "CREATE TABLE t (a INT REFERENCES s.other(b));";
        let parsed = parse_ddl(ddl).unwrap();
        let fk = &parsed.tables[0].foreign_keys[0];
        assert_eq!(fk.ref_schema.as_deref(), Some("s"));
        assert_eq!(fk.ref_table, "other");
        assert_eq!(fk.ref_column, "b");
    }

    #[test]
    fn test_parse_constraint_clauses() {
        let ddl = r#"
            CREATE TABLE app.users (
                id NUMBER(10) NOT NULL,
                org_id NUMBER,
                CONSTRAINT users_pk PRIMARY KEY (id),
                CONSTRAINT users_org_fk FOREIGN KEY (org_id) REFERENCES app.orgs(id)
            );
        "#;
        let parsed = parse_ddl(ddl).unwrap();
        let table = &parsed.tables[0];
        assert_eq!(table.primary_keys, vec!["ID"]);
        assert_eq!(table.columns.len(), 2);
        assert!(!table.columns[0].nullable);
        assert!(table.columns[1].nullable);
        assert_eq!(table.foreign_keys[0].column, "org_id");
        assert_eq!(table.foreign_keys[0].ref_table, "orgs");
    }

    #[test]
    fn test_parse_line_comments_attach_to_columns() {
        let ddl = "CREATE TABLE t (\n  id NUMBER, -- surrogate key\n  nm VARCHAR2(30)\n);";
        let parsed = parse_ddl(ddl).unwrap();
        let table = &parsed.tables[0];
        assert_eq!(table.columns[0].comment, "surrogate key");
        assert_eq!(table.columns[1].comment, "");
    }

    #[test]
    fn test_parse_mysql_style_comment_attribute() {
        let ddl = "CREATE TABLE t (id INT COMMENT 'the id');";
        let parsed = parse_ddl(ddl).unwrap();
        assert_eq!(parsed.tables[0].columns[0].comment, "the id");
    }

    #[test]
    fn test_parse_view_without_columns() {
        let ddl = "CREATE VIEW sales.v_orders AS SELECT * FROM sales.orders;";
        let parsed = parse_ddl(ddl).unwrap();
        let table = &parsed.tables[0];
        assert_eq!(table.table_type, "VIEW");
        assert_eq!(table.name, "v_orders");
        assert!(table.columns.is_empty());
    }

    #[test]
    fn test_parse_table_without_schema() {
        let ddl = "CREATE TABLE plain (a INT);";
        let parsed = parse_ddl(ddl).unwrap();
        assert!(parsed.tables[0].schema.is_none());
        assert_eq!(parsed.tables[0].name, "plain");
    }

    #[test]
    fn test_comment_on_column() {
        let ddl = r#"
            CREATE TABLE s.t (c1 INT);
            COMMENT ON COLUMN s.t.c1 IS 'first column';
        "#;
        let parsed = parse_ddl(ddl).unwrap();
        assert_eq!(parsed.tables[0].columns[0].comment, "first column");
    }

    #[test]
    fn test_create_table_as_select_has_no_columns() {
        let ddl = "CREATE TABLE s.copy AS SELECT f(x) FROM s.orig;";
        let parsed = parse_ddl(ddl).unwrap();
        assert_eq!(parsed.tables[0].name, "copy");
        assert!(parsed.tables[0].columns.is_empty());
    }

    #[test]
    fn test_unterminated_column_list_is_error() {
        let ddl = "CREATE TABLE broken (a INT,";
        assert!(parse_ddl(ddl).is_err());
    }

    #[test]
    fn test_decimal_precision_dtype() {
        let ddl = "CREATE TABLE t (amount NUMBER(12, 2) NOT NULL);";
        let parsed = parse_ddl(ddl).unwrap();
        let column = &parsed.tables[0].columns[0];
        assert!(column.dtype.to_uppercase().starts_with("NUMBER"));
        assert!(!column.nullable);
    }
}
