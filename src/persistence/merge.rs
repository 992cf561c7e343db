//! Declarative per-column merge policy for idempotent upserts.
//!
//! Each projected table declares, column by column, what happens when a
//! row with the same natural key is written again. The policy renders the
//! `INSERT .. ON CONFLICT .. DO UPDATE` statement and can also be evaluated
//! in memory, so the rules are testable without a database.
//!
//! [`MergeRule::Union`] columns are not merged in SQL. The upsert keeps the
//! stored object and returns it; the caller applies [`MergeRule::resolve`]
//! and writes the result back in the same transaction.

use serde_json::Value;

use crate::models::trace::JsonMap;

/// What a re-ingested value does to the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Natural-key or identity column; never updated after insert.
    Keep,
    /// Incoming value always wins, including zero.
    Overwrite,
    /// Incoming value wins only when it is present and non-empty.
    Coalesce,
    /// Shallow JSON object union; non-empty incoming keys replace the
    /// stored value whole, stored keys are never removed.
    Union,
}

impl MergeRule {
    /// SQL expression assigned to `column` in the `DO UPDATE SET` clause.
    ///
    /// Returns `None` for [`MergeRule::Keep`]. A [`MergeRule::Union`] column
    /// keeps its stored value here; see [`MergePolicy::union_update_sql`].
    #[must_use]
    pub fn assignment(self, table: &str, column: &str) -> Option<String> {
        match self {
            Self::Keep => None,
            Self::Overwrite => Some(format!("{column} = excluded.{column}")),
            Self::Coalesce => Some(format!(
                "{column} = COALESCE(NULLIF(excluded.{column}, ''), {table}.{column})"
            )),
            Self::Union => Some(format!("{column} = {table}.{column}")),
        }
    }

    /// Evaluate the rule in memory against stored and incoming JSON values.
    ///
    /// `Value::Null` stands for SQL `NULL`.
    #[must_use]
    pub fn resolve(self, stored: &Value, incoming: &Value) -> Value {
        match self {
            Self::Keep => stored.clone(),
            Self::Overwrite => incoming.clone(),
            Self::Coalesce => {
                if is_empty(incoming) {
                    stored.clone()
                } else {
                    incoming.clone()
                }
            }
            Self::Union => {
                let mut merged = stored.as_object().cloned().unwrap_or_default();
                if let Some(incoming) = incoming.as_object() {
                    for (key, value) in incoming {
                        if !is_empty(value) {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                }
                Value::Object(merged)
            }
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Drop null and empty-string entries so a union never blanks stored keys.
#[must_use]
pub fn strip_empty(map: JsonMap) -> JsonMap {
    map.into_iter().filter(|(_, value)| !is_empty(value)).collect()
}

/// Merge rule for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMerge {
    /// Column name.
    pub column: &'static str,
    /// Rule applied on conflict.
    pub rule: MergeRule,
}

const fn col(column: &'static str, rule: MergeRule) -> ColumnMerge {
    ColumnMerge { column, rule }
}

/// Upsert policy for one table.
#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    /// Table name.
    pub table: &'static str,
    /// Natural-key columns named in `ON CONFLICT`.
    pub conflict_key: &'static [&'static str],
    /// Every inserted column, in bind order.
    pub columns: &'static [ColumnMerge],
}

impl MergePolicy {
    /// Rule declared for `column`, if the column belongs to the policy.
    #[must_use]
    pub fn rule_for(&self, column: &str) -> Option<MergeRule> {
        self.columns
            .iter()
            .find(|c| c.column == column)
            .map(|c| c.rule)
    }

    /// The column merged with [`MergeRule::Union`], if any.
    #[must_use]
    pub fn union_column(&self) -> Option<&'static str> {
        self.columns
            .iter()
            .find(|c| c.rule == MergeRule::Union && !self.conflict_key.contains(&c.column))
            .map(|c| c.column)
    }

    /// Statement writing the resolved union value: `?1` is the JSON, `?2`
    /// the row id.
    #[must_use]
    pub fn union_update_sql(&self) -> Option<String> {
        self.union_column().map(|column| {
            format!(
                "UPDATE {table} SET {column} = ?1 WHERE id = ?2",
                table = self.table
            )
        })
    }

    /// Render the upsert statement.
    ///
    /// Placeholders `?1..?n` follow the order of [`MergePolicy::columns`].
    /// The statement returns the surviving row's `id` followed by the
    /// stored value of the union column (or `'{}'` without one).
    #[must_use]
    pub fn upsert_sql(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.column).collect();
        let placeholders: Vec<String> = (1..=self.columns.len()).map(|i| format!("?{i}")).collect();
        let assignments: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !self.conflict_key.contains(&c.column))
            .filter_map(|c| c.rule.assignment(self.table, c.column))
            .collect();

        let returned = self.union_column().unwrap_or("'{}'");

        format!(
            "INSERT INTO {table} ({names}) VALUES ({placeholders}) \
             ON CONFLICT({key}) DO UPDATE SET {assignments} RETURNING id, {returned}",
            table = self.table,
            names = names.join(", "),
            placeholders = placeholders.join(", "),
            key = self.conflict_key.join(", "),
            assignments = assignments.join(", "),
        )
    }

    /// Evaluate the policy in memory for one stored row and one incoming row.
    ///
    /// Columns missing from either side are treated as `NULL`.
    #[must_use]
    pub fn merge_rows(&self, stored: &JsonMap, incoming: &JsonMap) -> JsonMap {
        self.columns
            .iter()
            .map(|c| {
                let before = stored.get(c.column).unwrap_or(&Value::Null);
                let after = incoming.get(c.column).unwrap_or(&Value::Null);
                let rule = if self.conflict_key.contains(&c.column) {
                    MergeRule::Keep
                } else {
                    c.rule
                };
                (c.column.to_owned(), rule.resolve(before, after))
            })
            .collect()
    }
}

use MergeRule::{Coalesce, Keep, Overwrite, Union};

/// One row per assistant turn.
pub const TRACE_POLICY: MergePolicy = MergePolicy {
    table: "trace",
    conflict_key: &["tenant_id", "external_trace_id"],
    columns: &[
        col("id", Keep),
        col("tenant_id", Keep),
        col("session_id", Keep),
        col("message_id", Overwrite),
        col("external_trace_id", Keep),
        col("trace_url", Coalesce),
        col("status", Overwrite),
        col("generation_ms", Overwrite),
        col("thinking", Coalesce),
        col("observation_reason", Coalesce),
        col("metadata", Union),
        col("created_at", Keep),
        col("updated_at", Overwrite),
    ],
};

/// One row per provider call attempt.
pub const GENERATION_POLICY: MergePolicy = MergePolicy {
    table: "trace_generation",
    conflict_key: &["tenant_id", "trace_ref_id", "external_generation_id"],
    columns: &[
        col("id", Keep),
        col("tenant_id", Keep),
        col("trace_ref_id", Keep),
        col("external_generation_id", Keep),
        col("request_id", Coalesce),
        col("model", Coalesce),
        col("provider", Coalesce),
        col("finish_reason", Coalesce),
        col("prompt_tokens", Overwrite),
        col("completion_tokens", Overwrite),
        col("total_tokens", Overwrite),
        col("cached_tokens", Overwrite),
        col("cost", Overwrite),
        col("latency_ms", Overwrite),
        col("input_text", Coalesce),
        col("output_text", Coalesce),
        col("thinking", Coalesce),
        col("observation_reason", Coalesce),
        col("metadata", Union),
        col("started_at", Coalesce),
        col("completed_at", Coalesce),
        col("created_at", Keep),
    ],
};

/// One row per tool execution or sub-step.
pub const SPAN_POLICY: MergePolicy = MergePolicy {
    table: "trace_span",
    conflict_key: &["tenant_id", "trace_ref_id", "external_span_id"],
    columns: &[
        col("id", Keep),
        col("tenant_id", Keep),
        col("trace_ref_id", Keep),
        col("external_span_id", Keep),
        col("parent_external_span_id", Coalesce),
        col("generation_external_id", Coalesce),
        col("name", Overwrite),
        col("type", Overwrite),
        col("status", Overwrite),
        col("level", Coalesce),
        col("call_id", Coalesce),
        col("tool_name", Coalesce),
        col("input_text", Coalesce),
        col("output_text", Coalesce),
        col("error_text", Coalesce),
        col("duration_ms", Overwrite),
        col("attributes", Union),
        col("started_at", Coalesce),
        col("completed_at", Coalesce),
        col("created_at", Keep),
    ],
};

/// One row per point-in-time event.
pub const EVENT_POLICY: MergePolicy = MergePolicy {
    table: "trace_event",
    conflict_key: &["tenant_id", "trace_ref_id", "external_event_id"],
    columns: &[
        col("id", Keep),
        col("tenant_id", Keep),
        col("trace_ref_id", Keep),
        col("external_event_id", Keep),
        col("name", Overwrite),
        col("type", Overwrite),
        col("level", Coalesce),
        col("message", Coalesce),
        col("reason", Coalesce),
        col("span_external_id", Coalesce),
        col("generation_external_id", Coalesce),
        col("attributes", Union),
        col("timestamp", Coalesce),
        col("created_at", Keep),
    ],
};
