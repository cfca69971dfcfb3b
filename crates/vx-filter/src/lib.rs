#![forbid(unsafe_code)]

//! Storage-side filter pushdown.
//!
//! [`translate_filter`] lowers the server-knowable part of a filter tree into a
//! [`FilterPredicate`]; [`render_where`] turns that into a SQL `WHERE` clause. Anything a server
//! cannot know (`now()`, viewport aggregates, animations) stays on the GPU.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use vx_expr::{CompareOp, ExprArena, ExprId, ExprKind, LogicalOp};
use vx_types::Value;

/// A literal as it appears in a pushed-down predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Number(f64),
    Text(String),
}

impl FilterValue {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(v) => v.is_finite().then_some(Self::Number(*v)),
            Value::Category(c) => Some(Self::Text(c.clone())),
            // Dates are epoch milliseconds here, which a timestamp column would not compare against.
            Value::Date(_) | Value::Color(_) => None,
        }
    }

    fn to_sql(&self) -> String {
        match self {
            Self::Number(v) => format!("{v}"),
            Self::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operand {
    Property { property: String },
    Value { value: FilterValue },
}

impl Operand {
    fn to_sql(&self) -> String {
        match self {
            Self::Property { property } => quote_identifier(property),
            Self::Value { value } => value.to_sql(),
        }
    }
}

/// A predicate a data source can evaluate itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FilterPredicate {
    Between {
        property: String,
        lower: f64,
        upper: f64,
    },
    In {
        property: String,
        values: Vec<FilterValue>,
    },
    NotIn {
        property: String,
        values: Vec<FilterValue>,
    },
    LessThan {
        left: Operand,
        right: Operand,
    },
    LessThanOrEqualTo {
        left: Operand,
        right: Operand,
    },
    GreaterThan {
        left: Operand,
        right: Operand,
    },
    GreaterThanOrEqualTo {
        left: Operand,
        right: Operand,
    },
    Equals {
        left: Operand,
        right: Operand,
    },
    NotEquals {
        left: Operand,
        right: Operand,
    },
    And {
        left: Box<FilterPredicate>,
        right: Box<FilterPredicate>,
    },
    Or {
        left: Box<FilterPredicate>,
        right: Box<FilterPredicate>,
    },
}

impl FilterPredicate {
    fn comparison(op: CompareOp, left: Operand, right: Operand) -> Self {
        match op {
            CompareOp::Lt => Self::LessThan { left, right },
            CompareOp::Le => Self::LessThanOrEqualTo { left, right },
            CompareOp::Gt => Self::GreaterThan { left, right },
            CompareOp::Ge => Self::GreaterThanOrEqualTo { left, right },
            CompareOp::Eq => Self::Equals { left, right },
            CompareOp::Ne => Self::NotEquals { left, right },
        }
    }

    /// SQL text of the predicate, without the `WHERE`.
    #[must_use]
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        self.write_sql(&mut out);
        out
    }

    fn write_sql(&self, out: &mut String) {
        let compare = |out: &mut String, left: &Operand, symbol: &str, right: &Operand| {
            let _ = write!(out, "{} {symbol} {}", left.to_sql(), right.to_sql());
        };
        let list = |values: &[FilterValue]| {
            values
                .iter()
                .map(FilterValue::to_sql)
                .collect::<Vec<_>>()
                .join(",")
        };
        match self {
            Self::Between {
                property,
                lower,
                upper,
            } => {
                let _ = write!(
                    out,
                    "{} BETWEEN {lower} AND {upper}",
                    quote_identifier(property)
                );
            }
            Self::In { property, values } => {
                let _ = write!(out, "{} IN ({})", quote_identifier(property), list(values));
            }
            Self::NotIn { property, values } => {
                let _ = write!(
                    out,
                    "{} NOT IN ({})",
                    quote_identifier(property),
                    list(values)
                );
            }
            Self::LessThan { left, right } => compare(out, left, "<", right),
            Self::LessThanOrEqualTo { left, right } => compare(out, left, "<=", right),
            Self::GreaterThan { left, right } => compare(out, left, ">", right),
            Self::GreaterThanOrEqualTo { left, right } => compare(out, left, ">=", right),
            Self::Equals { left, right } => compare(out, left, "=", right),
            Self::NotEquals { left, right } => compare(out, left, "<>", right),
            Self::And { left, right } | Self::Or { left, right } => {
                let joiner = if matches!(self, Self::And { .. }) {
                    "AND"
                } else {
                    "OR"
                };
                out.push('(');
                left.write_sql(out);
                let _ = write!(out, ") {joiner} (");
                right.write_sql(out);
                out.push(')');
            }
        }
    }
}

/// Identifiers with any non-lowercase character are double-quoted.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    if name == name.to_lowercase() {
        name.to_owned()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// `WHERE (<predicate>)`, or the empty string when nothing can be pushed down.
#[must_use]
pub fn render_where(predicate: Option<&FilterPredicate>) -> String {
    match predicate {
        Some(predicate) => format!("WHERE ({})", predicate.to_sql()),
        None => String::new(),
    }
}

/// Lowers the pushable part of a filter tree. `root` may be a filter root or any subtree.
///
/// Conjunctions keep whichever sides translate; disjunctions need both. A blend is followed
/// to its final side only when an animation drives it.
#[must_use]
pub fn translate_filter(arena: &ExprArena, root: ExprId) -> Option<FilterPredicate> {
    match arena.kind(root) {
        ExprKind::Root { input, .. } => translate_filter(arena, *input),
        ExprKind::Logical { op, left, right } => {
            let l = translate_filter(arena, *left);
            let r = translate_filter(arena, *right);
            match (op, l, r) {
                (LogicalOp::And, Some(l), Some(r)) => Some(FilterPredicate::And {
                    left: Box::new(l),
                    right: Box::new(r),
                }),
                (LogicalOp::And, Some(side), None) | (LogicalOp::And, None, Some(side)) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(node = %root, "dropping client-only side of conjunction");
                    Some(side)
                }
                (LogicalOp::Or, Some(l), Some(r)) => Some(FilterPredicate::Or {
                    left: Box::new(l),
                    right: Box::new(r),
                }),
                _ => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(node = %root, "subtree is not pushable");
                    None
                }
            }
        }
        ExprKind::Between {
            input,
            lower,
            upper,
        } => {
            let property = property_name(arena, *input)?;
            let lower = number_constant(arena, *lower)?;
            let upper = number_constant(arena, *upper)?;
            Some(FilterPredicate::Between {
                property,
                lower,
                upper,
            })
        }
        ExprKind::In {
            input,
            values,
            negated,
        } => {
            let property = property_name(arena, *input)?;
            if values.is_empty() {
                return None;
            }
            let values = values
                .iter()
                .map(|v| constant(arena, *v))
                .collect::<Option<Vec<_>>>()?;
            Some(if *negated {
                FilterPredicate::NotIn { property, values }
            } else {
                FilterPredicate::In { property, values }
            })
        }
        ExprKind::Compare { op, left, right } => {
            let left = operand(arena, *left)?;
            let right = operand(arena, *right)?;
            let has_property = [&left, &right]
                .iter()
                .any(|o| matches!(o, Operand::Property { .. }));
            has_property.then(|| FilterPredicate::comparison(*op, left, right))
        }
        ExprKind::Blend { to, mix, .. } if arena.is_animation_mix(*mix) => {
            translate_filter(arena, *to)
        }
        _ => None,
    }
}

fn property_name(arena: &ExprArena, id: ExprId) -> Option<String> {
    match arena.kind(id) {
        ExprKind::Property { name } => Some(name.clone()),
        _ => None,
    }
}

fn constant(arena: &ExprArena, id: ExprId) -> Option<FilterValue> {
    match arena.kind(id) {
        ExprKind::Constant(value) => FilterValue::from_value(value),
        _ => None,
    }
}

fn number_constant(arena: &ExprArena, id: ExprId) -> Option<f64> {
    match constant(arena, id)? {
        FilterValue::Number(v) => Some(v),
        FilterValue::Text(_) => None,
    }
}

fn operand(arena: &ExprArena, id: ExprId) -> Option<Operand> {
    if let Some(property) = property_name(arena, id) {
        return Some(Operand::Property { property });
    }
    constant(arena, id).map(|value| Operand::Value { value })
}
