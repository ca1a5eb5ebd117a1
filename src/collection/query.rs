// # Query trees and the filter pipeline
//
// The external boundary accepts a nested JSON query map over the operators
// `$eq`, `$gt`, `$gte`, `$lt`, `$lte`, `$and`, `$or`. A bare
// `{"field": value}` is shorthand for `$eq`; an object with several keys is
// an implicit `$and`. The engine only picks an index scan when the root is
// a single equality on an indexed field; everything else flows through a
// table scan feeding the filter, which feeds the optional sort/skip/limit
// stages.

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{project_field, Document};
use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    fn parse(op: &str) -> Result<Self> {
        match op {
            "$eq" => Ok(CmpOp::Eq),
            "$gt" => Ok(CmpOp::Gt),
            "$gte" => Ok(CmpOp::Gte),
            "$lt" => Ok(CmpOp::Lt),
            "$lte" => Ok(CmpOp::Lte),
            other => Err(DbError::InvalidArgument(format!(
                "unknown operator {}",
                other
            ))),
        }
    }
}

/// A parsed query tree.
#[derive(Debug, Clone)]
pub enum QueryExpr {
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
    And(Vec<QueryExpr>),
    Or(Vec<QueryExpr>),
}

impl QueryExpr {
    /// Parse the external query map.
    pub fn parse(query: &Value) -> Result<Self> {
        let map = query.as_object().ok_or_else(|| {
            DbError::InvalidArgument("query must be an object".to_string())
        })?;

        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            clauses.push(Self::parse_clause(key, value)?);
        }
        match clauses.len() {
            0 => Err(DbError::InvalidArgument("empty query".to_string())),
            1 => Ok(clauses.swap_remove(0)),
            _ => Ok(QueryExpr::And(clauses)),
        }
    }

    fn parse_clause(key: &str, value: &Value) -> Result<Self> {
        match key {
            "$and" | "$or" => {
                let items = value.as_array().ok_or_else(|| {
                    DbError::InvalidArgument(format!("{} expects an array", key))
                })?;
                let sub = items.iter().map(Self::parse).collect::<Result<Vec<_>>>()?;
                if sub.is_empty() {
                    return Err(DbError::InvalidArgument(format!("{} is empty", key)));
                }
                Ok(if key == "$and" {
                    QueryExpr::And(sub)
                } else {
                    QueryExpr::Or(sub)
                })
            }
            op if op.starts_with('$') => Err(DbError::InvalidArgument(format!(
                "unknown operator {}",
                op
            ))),
            field => match value {
                Value::Object(ops) => {
                    let mut clauses = Vec::with_capacity(ops.len());
                    for (op, operand) in ops {
                        if operand.is_object() || operand.is_array() {
                            return Err(DbError::InvalidArgument(
                                "comparison operand must be a scalar".to_string(),
                            ));
                        }
                        clauses.push(QueryExpr::Cmp {
                            field: field.to_string(),
                            op: CmpOp::parse(op)?,
                            value: operand.clone(),
                        });
                    }
                    match clauses.len() {
                        0 => Err(DbError::InvalidArgument(format!(
                            "no operator for field {}",
                            field
                        ))),
                        1 => Ok(clauses.swap_remove(0)),
                        _ => Ok(QueryExpr::And(clauses)),
                    }
                }
                Value::Array(_) => Err(DbError::InvalidArgument(
                    "field value must be a scalar".to_string(),
                )),
                scalar => Ok(QueryExpr::Cmp {
                    field: field.to_string(),
                    op: CmpOp::Eq,
                    value: scalar.clone(),
                }),
            },
        }
    }

    /// When the whole query is one equality on a field, an index scan can
    /// serve it.
    pub fn as_single_equality(&self) -> Option<(&str, &Value)> {
        match self {
            QueryExpr::Cmp {
                field,
                op: CmpOp::Eq,
                value,
            } => Some((field.as_str(), value)),
            _ => None,
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            QueryExpr::Cmp { field, op, value } => {
                let Some(actual) = project_field(doc, field) else {
                    return false;
                };
                match compare_scalars(actual, value) {
                    Some(ordering) => match op {
                        CmpOp::Eq => ordering == Ordering::Equal,
                        CmpOp::Gt => ordering == Ordering::Greater,
                        CmpOp::Gte => ordering != Ordering::Less,
                        CmpOp::Lt => ordering == Ordering::Less,
                        CmpOp::Lte => ordering != Ordering::Greater,
                    },
                    None => false,
                }
            }
            QueryExpr::And(sub) => sub.iter().all(|q| q.matches(doc)),
            QueryExpr::Or(sub) => sub.iter().any(|q| q.matches(doc)),
        }
    }
}

/// Compare two scalars: numbers numerically, strings lexicographically,
/// booleans and null by equality only. Mismatched types do not compare.
pub fn compare_scalars(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => (x == y).then_some(Ordering::Equal),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Sort/skip/limit stages applied after filtering.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

/// Run the post-filter stages over the matching documents.
pub fn apply_options(mut docs: Vec<Document>, opts: &FindOptions) -> Vec<Document> {
    if let Some((field, order)) = &opts.sort {
        docs.sort_by(|a, b| {
            let ordering = match (project_field(a, field), project_field(b, field)) {
                (Some(x), Some(y)) => compare_scalars(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });
    }
    docs.into_iter()
        .skip(opts.skip.unwrap_or(0))
        .take(opts.limit.unwrap_or(usize::MAX))
        .collect()
}
