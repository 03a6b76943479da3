//! Compilation of filter/sort/search requests into parameterized SQL.
//!
//! Field and table names come from the validated index descriptor; every
//! user-supplied value travels as a bind parameter.

use serde_json::Value;

use crate::{
    Error, Result,
    index::{IndexDescriptor, IndexValue},
    value::render,
};

/// Page window of a query or scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitOffset {
    /// Maximum number of rows returned.
    pub limit: u64,
    /// Number of rows skipped.
    pub offset: u64,
}

impl LimitOffset {
    /// Builds a page window.
    pub fn new(limit: u64, offset: u64) -> Self {
        Self { limit, offset }
    }
}

/// Comparison operator of a filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// `=`
    Eq,
    /// `!=`
    Neq,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `LIKE`, with the literal wrapped in `%…%`.
    Like,
    /// `IN`, over a sequence of strings.
    In,
}

impl Comparator {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Like => "like",
            Self::In => "in",
        }
    }
}

/// One filter condition against an index field.
#[derive(Debug, Clone)]
pub struct Condition {
    /// The index field name.
    pub field: String,
    /// The comparison operator.
    pub comparator: Comparator,
    /// The literal; scalars only, except a string array for [`Comparator::In`].
    pub value: Value,
}

impl Condition {
    /// Builds a condition.
    pub fn new(field: impl Into<String>, comparator: Comparator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            comparator,
            value: value.into(),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

impl SortOrder {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One sort term; terms apply in order.
#[derive(Debug, Clone)]
pub struct Sort {
    /// The index field name.
    pub field: String,
    /// The direction.
    pub order: SortOrder,
}

impl Sort {
    /// Ascending sort on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    /// Descending sort on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

/// Substring search over a set of fields.
///
/// The value is tokenized by whitespace; every token must appear in at least
/// one of the fields.
#[derive(Debug, Clone)]
pub struct Search {
    /// The index fields searched.
    pub fields: Vec<String>,
    /// The raw search input.
    pub value: String,
}

impl Search {
    /// Builds a search over the given fields.
    pub fn new(value: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            value: value.into(),
        }
    }
}

/// A filter/sort/search/pagination request against one index.
#[derive(Debug, Clone)]
pub struct Query {
    /// Page window.
    pub limit_offset: LimitOffset,
    /// Filter conditions, AND-ed.
    pub conditions: Vec<Condition>,
    /// Sort terms, applied in order; empty leaves natural key order.
    pub sorts: Vec<Sort>,
    /// Optional substring search.
    pub search: Option<Search>,
}

impl Query {
    /// Builds an unfiltered query for a page window.
    pub fn new(limit_offset: LimitOffset) -> Self {
        Self {
            limit_offset,
            conditions: Vec::new(),
            sorts: Vec::new(),
            search: None,
        }
    }

    /// Adds a filter condition.
    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Adds a sort term.
    #[must_use]
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sorts.push(sort);
        self
    }

    /// Sets the substring search.
    #[must_use]
    pub fn search(mut self, search: Search) -> Self {
        self.search = Some(search);
        self
    }
}

/// A compiled statement with its ordered bind values.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Compiled {
    pub(crate) sql: String,
    pub(crate) args: Vec<IndexValue>,
}

/// Compiles a key query: `SELECT key FROM <table> [WHERE …] [ORDER BY …]
/// LIMIT ? OFFSET ?`.
pub(crate) fn compile_keys(descriptor: &IndexDescriptor, query: &Query) -> Result<Compiled> {
    let mut wheres = Vec::new();
    let mut args = Vec::new();

    compile_conditions(descriptor, &query.conditions, &mut wheres, &mut args)?;

    if let Some(search) = &query.search {
        compile_search(descriptor, search, &mut wheres, &mut args)?;
    }

    let mut order_bys = Vec::new();
    for sort in &query.sorts {
        if !descriptor.contains_field(&sort.field) {
            return Err(Error::UnknownField(sort.field.clone()));
        }
        order_bys.push(format!("{} {}", sort.field, sort.order.sql()));
    }

    let mut sql = format!("SELECT key FROM {}", descriptor.table_name);
    if !wheres.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&wheres.join(" AND "));
    }
    if !order_bys.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_bys.join(", "));
    }
    sql.push_str(" LIMIT ? OFFSET ?;");
    args.push(IndexValue::Integer(query.limit_offset.limit as i64));
    args.push(IndexValue::Integer(query.limit_offset.offset as i64));

    Ok(Compiled { sql, args })
}

/// Compiles a distinct projection of one field, optionally filtered.
pub(crate) fn compile_distinct(
    descriptor: &IndexDescriptor,
    field: &str,
    conditions: &[Condition],
) -> Result<Compiled> {
    if !descriptor.contains_field(field) {
        return Err(Error::UnknownField(field.to_string()));
    }
    let mut wheres = Vec::new();
    let mut args = Vec::new();
    compile_conditions(descriptor, conditions, &mut wheres, &mut args)?;

    let mut sql = format!("SELECT DISTINCT {field} FROM {}", descriptor.table_name);
    if !wheres.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&wheres.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY {field} ASC;"));
    Ok(Compiled { sql, args })
}

fn compile_conditions(
    descriptor: &IndexDescriptor,
    conditions: &[Condition],
    wheres: &mut Vec<String>,
    args: &mut Vec<IndexValue>,
) -> Result<()> {
    for condition in conditions {
        if !descriptor.contains_field(&condition.field) {
            return Err(Error::UnknownField(condition.field.clone()));
        }
        match condition.comparator {
            Comparator::In => {
                let Value::Array(items) = &condition.value else {
                    return Err(Error::UnencodableValue(condition.field.clone()));
                };
                let mut placeholders = Vec::with_capacity(items.len());
                for item in items {
                    let Value::String(s) = item else {
                        return Err(Error::UnencodableValue(condition.field.clone()));
                    };
                    placeholders.push("?");
                    args.push(IndexValue::Text(s.clone()));
                }
                wheres.push(format!(
                    "{} IN ({})",
                    condition.field,
                    placeholders.join(", ")
                ));
            }
            Comparator::Like => {
                args.push(IndexValue::Text(format!("%{}%", filter_literal(condition)?)));
                wheres.push(format!("{} like ?", condition.field));
            }
            comparator => {
                args.push(filter_value(condition)?);
                wheres.push(format!("{} {} ?", condition.field, comparator.sql()));
            }
        }
    }
    Ok(())
}

/// Renders a scalar condition literal; records and sequences have no
/// canonical string form here.
fn filter_literal(condition: &Condition) -> Result<String> {
    match &condition.value {
        Value::Object(_) | Value::Array(_) => {
            Err(Error::UnencodableValue(condition.field.clone()))
        }
        v => Ok(render(v)),
    }
}

fn filter_value(condition: &Condition) -> Result<IndexValue> {
    match &condition.value {
        Value::Null => Ok(IndexValue::Null),
        Value::Bool(b) => Ok((*b).into()),
        Value::Number(n) => Ok(n
            .as_i64()
            .map_or_else(|| IndexValue::Real(n.as_f64().unwrap_or_default()), IndexValue::Integer)),
        Value::String(s) => Ok(s.as_str().into()),
        Value::Object(_) | Value::Array(_) => {
            Err(Error::UnencodableValue(condition.field.clone()))
        }
    }
}

fn compile_search(
    descriptor: &IndexDescriptor,
    search: &Search,
    wheres: &mut Vec<String>,
    args: &mut Vec<IndexValue>,
) -> Result<()> {
    if search.fields.is_empty() || search.value.trim().is_empty() {
        return Ok(());
    }
    for field in &search.fields {
        if !descriptor.contains_field(field) {
            return Err(Error::UnknownField(field.clone()));
        }
    }

    let mut tokens: Vec<&str> = Vec::new();
    for token in search.value.split_whitespace() {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }

    let mut token_clauses = Vec::with_capacity(tokens.len());
    for token in tokens {
        let mut field_clauses = Vec::with_capacity(search.fields.len());
        for field in &search.fields {
            field_clauses.push(format!("({field} like ?)"));
            args.push(IndexValue::Text(format!("%{token}%")));
        }
        token_clauses.push(format!("({})", field_clauses.join(" OR ")));
    }
    wheres.push(format!("({})", token_clauses.join(" AND ")));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexFieldDescriptor, IndexFieldType};
    use serde_json::json;

    fn descriptor() -> IndexDescriptor {
        IndexDescriptor::new(
            "b",
            "ix",
            vec![
                IndexFieldDescriptor {
                    name: "name".into(),
                    path: "name".into(),
                    field_type: IndexFieldType::Str,
                },
                IndexFieldDescriptor {
                    name: "value".into(),
                    path: "value".into(),
                    field_type: IndexFieldType::Str,
                },
                IndexFieldDescriptor {
                    name: "count".into(),
                    path: "count".into(),
                    field_type: IndexFieldType::Int,
                },
            ],
        )
    }

    #[test]
    fn compiles_conditions_and_pagination() {
        let q = Query::new(LimitOffset::new(50, 10))
            .condition(Condition::new("name", Comparator::Eq, "n1"))
            .condition(Condition::new("count", Comparator::Gte, 3));
        let compiled = compile_keys(&descriptor(), &q).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT key FROM _index_b_ix WHERE name = ? AND count >= ? LIMIT ? OFFSET ?;"
        );
        assert_eq!(
            compiled.args,
            vec![
                IndexValue::Text("n1".into()),
                IndexValue::Integer(3),
                IndexValue::Integer(50),
                IndexValue::Integer(10),
            ]
        );
    }

    #[test]
    fn compiles_in_and_like() {
        let q = Query::new(LimitOffset::new(10, 0))
            .condition(Condition::new("name", Comparator::In, json!(["n1", "n5"])))
            .condition(Condition::new("value", Comparator::Like, "v0"));
        let compiled = compile_keys(&descriptor(), &q).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT key FROM _index_b_ix WHERE name IN (?, ?) AND value like ? LIMIT ? OFFSET ?;"
        );
        assert_eq!(compiled.args[2], IndexValue::Text("%v0%".into()));
    }

    #[test]
    fn search_tokens_are_deduped_and_conjoined() {
        let q = Query::new(LimitOffset::new(10, 0)).search(Search::new(
            "  foo bar  foo ",
            ["name", "value"],
        ));
        let compiled = compile_keys(&descriptor(), &q).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT key FROM _index_b_ix WHERE (((name like ?) OR (value like ?)) AND ((name like ?) OR (value like ?))) LIMIT ? OFFSET ?;"
        );
        assert_eq!(compiled.args[0], IndexValue::Text("%foo%".into()));
        assert_eq!(compiled.args[2], IndexValue::Text("%bar%".into()));
    }

    #[test]
    fn sorts_apply_in_order() {
        let q = Query::new(LimitOffset::new(10, 0))
            .sort(Sort::asc("name"))
            .sort(Sort::desc("count"));
        let compiled = compile_keys(&descriptor(), &q).unwrap();
        assert!(compiled.sql.contains("ORDER BY name ASC, count DESC"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let q = Query::new(LimitOffset::new(10, 0))
            .condition(Condition::new("nope", Comparator::Eq, "x"));
        assert!(matches!(
            compile_keys(&descriptor(), &q),
            Err(Error::UnknownField(f)) if f == "nope"
        ));

        let q = Query::new(LimitOffset::new(10, 0)).sort(Sort::asc("nope"));
        assert!(matches!(
            compile_keys(&descriptor(), &q),
            Err(Error::UnknownField(_))
        ));
    }

    #[test]
    fn compound_filter_values_are_unencodable() {
        let q = Query::new(LimitOffset::new(10, 0)).condition(Condition::new(
            "name",
            Comparator::Eq,
            json!({"nested": true}),
        ));
        assert!(matches!(
            compile_keys(&descriptor(), &q),
            Err(Error::UnencodableValue(_))
        ));

        let q = Query::new(LimitOffset::new(10, 0)).condition(Condition::new(
            "name",
            Comparator::In,
            json!([1, 2]),
        ));
        assert!(matches!(
            compile_keys(&descriptor(), &q),
            Err(Error::UnencodableValue(_))
        ));
    }

    #[test]
    fn distinct_projects_one_field() {
        let compiled = compile_distinct(&descriptor(), "name", &[]).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT DISTINCT name FROM _index_b_ix ORDER BY name ASC;"
        );

        let compiled = compile_distinct(
            &descriptor(),
            "name",
            &[Condition::new("count", Comparator::Gt, 1)],
        )
        .unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT DISTINCT name FROM _index_b_ix WHERE count > ? ORDER BY name ASC;"
        );
    }
}
