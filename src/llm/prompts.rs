//! Prompt builders for the analysis scenarios
//!
//! Each function returns (system, user) prompt pairs. Responses are
//! always requested as JSON documents; the shapes are the ones
//! `llm::models` parses.

/// Per-batch statement analysis: summaries plus structured table/call
/// references for every node in the batch, in input order.
pub fn batch_analysis(code: &str, context: &str, dialect: &str, locale: &str) -> (String, String) {
    let system = format!(
        "You are a senior {dialect} engineer documenting legacy stored procedures. \
         For each numbered code block you receive, produce one entry in an `analysis` array, \
         in the same order as the blocks. Each entry is an object with: \
         `startLine`, `endLine`, `summary` (one or two sentences, in {locale}), \
         `tables` (array of {{\"name\", \"access\": \"read\"|\"write\"|\"execute\", \
         \"columns\", \"db_link\"}} for every table the block touches), and \
         `calls` (array of {{\"name\", \"scope\": \"internal\"|\"external\"}} for every \
         procedure or function invocation). \
         When the batch contains DML statements, also produce a `tableAnalysis` array of \
         {{\"table\", \"summary\"}} describing what the statements do to each table. \
         Respond with a single JSON object, no prose."
    );

    let user = if context.trim().is_empty() {
        format!("[CODE]\n{code}\n[/CODE]")
    } else {
        format!("{context}\n[CODE]\n{code}\n[/CODE]")
    };

    (system, user)
}

/// Parent context extraction: a short description of what a control-flow
/// skeleton means, threaded into child prompts later.
pub fn parent_context(skeleton: &str, ancestor_context: &str, locale: &str) -> (String, String) {
    let system = format!(
        "You summarise the surrounding logic of a code block. The input is a skeleton \
         where inner blocks are collapsed to `....`. Describe, in {locale} and at most \
         three sentences, the conditions, loop variables and aliases a reader needs to \
         understand code nested inside this skeleton. \
         Respond as JSON: {{\"context\": \"...\"}}."
    );

    let user = if ancestor_context.trim().is_empty() {
        format!("[SKELETON]\n{skeleton}\n[/SKELETON]")
    } else {
        format!("{ancestor_context}\n[SKELETON]\n{skeleton}\n[/SKELETON]")
    };

    (system, user)
}

/// Summarise one chunk of accumulated statement summaries of a unit
pub fn chunk_summary(unit_name: &str, chunk: &str, locale: &str) -> (String, String) {
    let system = format!(
        "You condense statement-level summaries of the stored procedure `{unit_name}` \
         into a short paragraph in {locale}. Keep business meaning, drop line numbers. \
         Respond as JSON: {{\"summary\": \"...\"}}."
    );
    (system, format!("[SUMMARIES]\n{chunk}\n[/SUMMARIES]"))
}

/// Merge several chunk summaries into the unit-level summary
pub fn merge_summaries(unit_name: &str, parts: &[String], locale: &str) -> (String, String) {
    let system = format!(
        "You merge partial summaries of the stored procedure `{unit_name}` into one \
         coherent description in {locale}, at most one paragraph. \
         Respond as JSON: {{\"summary\": \"...\"}}."
    );
    (system, format!("[PARTS]\n{}\n[/PARTS]", parts.join("\n---\n")))
}

/// Turn DML summaries touching a table into an enriched table description
pub fn table_summary(table: &str, dml_summaries: &[String], locale: &str) -> (String, String) {
    let system = format!(
        "You describe the database table `{table}` from the DML statements that touch it. \
         Respond as JSON in {locale}: {{\"description\": \"one sentence\", \
         \"detailDescription\": \"a few sentences covering how the table is read and written\"}}."
    );
    (system, format!("[DML SUMMARIES]\n{}\n[/DML SUMMARIES]", dml_summaries.join("\n")))
}

/// Phase 3.5: describe a table and its columns from sampled rows
pub fn sample_description(
    table: &str,
    schema: &str,
    sample_rows: &str,
    columns_info: &str,
    locale: &str,
) -> (String, String) {
    let system = format!(
        "You are documenting the table {schema}.{table} from a handful of sampled rows \
         and its column metadata. Infer what the table stores and what each column means. \
         Respond as JSON in {locale}: {{\"tableDescription\": \"...\", \
         \"columns\": [{{\"name\": \"...\", \"description\": \"...\"}}]}}. \
         Only include columns you can say something meaningful about."
    );

    let user = format!(
        "[COLUMNS]\n{columns_info}\n[/COLUMNS]\n[SAMPLE ROWS]\n{sample_rows}\n[/SAMPLE ROWS]"
    );
    (system, user)
}
