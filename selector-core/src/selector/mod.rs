//! Query selector AST and its whitelist decoder.
//!
//! The wire shape is a plain JSON object:
//!
//! ```json
//! {"$or": [{"a": {"$eq": 1}}, {"b": {"$gte": 2, "$lt": 5}}]}
//! ```
//!
//! Decoding is closed over a fixed operator set; any key outside that set
//! fails with `InvalidExpression`.

#[cfg(test)]
mod tests;

use serde_json::{Map, Value};

use crate::error::{SelectorError, SelectorResult};
use crate::expression::QueryExpression;
use crate::value::{TValue, TYPE_NAMES};

/// Field name that refers to the element itself inside `$every`/`$some`
pub const ELEMENT_FIELD: &str = "$";

/// Maximum length of a `$pattern` regex source
const MAX_PATTERN_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionalType {
    And,
    Or,
    Nor,
}

impl ConditionalType {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$and" => Some(ConditionalType::And),
            "$or" => Some(ConditionalType::Or),
            "$nor" => Some(ConditionalType::Nor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionalType::And => "$and",
            ConditionalType::Or => "$or",
            ConditionalType::Nor => "$nor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl ComparisonOp {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$eq" => Some(ComparisonOp::Eq),
            "$ne" => Some(ComparisonOp::Ne),
            "$lt" => Some(ComparisonOp::Lt),
            "$lte" => Some(ComparisonOp::Lte),
            "$gt" => Some(ComparisonOp::Gt),
            "$gte" => Some(ComparisonOp::Gte),
            _ => None,
        }
    }

    /// SQL operator text
    pub fn sql_operator(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::Lte => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Gte => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipOp {
    In,
    Nin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Subset,
    Superset,
    Intersect,
}

/// `$pattern` argument
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Plain string: substring containment
    Contains(String),
    /// `{"$regex": source, "$options": flags}`
    Regex { source: String, flags: String },
}

impl Pattern {
    fn decode(value: &Value) -> SelectorResult<Pattern> {
        match value {
            Value::String(s) => Ok(Pattern::Contains(s.clone())),
            Value::Object(map) => {
                let source = map
                    .get("$regex")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SelectorError::expression("$pattern regex requires $regex"))?;
                let flags = match map.get("$options") {
                    None => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(_) => return Err(SelectorError::expression("$options must be a string")),
                };
                if map.keys().any(|k| k != "$regex" && k != "$options") {
                    return Err(SelectorError::expression("unknown key in $pattern"));
                }
                let pattern = Pattern::Regex {
                    source: source.to_string(),
                    flags,
                };
                pattern.to_regex()?;
                Ok(pattern)
            }
            _ => Err(SelectorError::expression("$pattern requires a string or regex")),
        }
    }

    /// Compile with the length guard used for all user-supplied patterns.
    pub fn to_regex(&self) -> SelectorResult<regex::Regex> {
        let (source, flags) = match self {
            Pattern::Contains(text) => (regex::escape(text), String::new()),
            Pattern::Regex { source, flags } => (source.clone(), flags.clone()),
        };
        if source.len() > MAX_PATTERN_LEN {
            return Err(SelectorError::expression("pattern too long (max 1000 chars)"));
        }
        let mut builder = regex::RegexBuilder::new(&source);
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                other => {
                    return Err(SelectorError::expression(format!("unsupported regex flag '{}'", other)))
                }
            };
        }
        builder
            .build()
            .map_err(|e| SelectorError::expression(format!("invalid regex: {}", e)))
    }
}

/// Operator applied to a single field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldExpression {
    Comparison { op: ComparisonOp, value: TValue },
    Membership { op: MembershipOp, values: Vec<TValue> },
    Set { op: SetOp, values: Vec<TValue> },
    Not(Box<FieldExpression>),
    Type(Vec<String>),
    Pattern(Pattern),
    Size(u64),
    Every(Box<QuerySelector>),
    Some(Box<QuerySelector>),
}

impl FieldExpression {
    /// Decode an operator object; one expression per operator key.
    pub fn decode_all(map: &Map<String, Value>) -> SelectorResult<Vec<FieldExpression>> {
        if map.is_empty() {
            return Err(SelectorError::expression("empty field selector"));
        }
        map.iter().map(|(key, value)| Self::decode(key, value)).collect()
    }

    pub fn decode(key: &str, value: &Value) -> SelectorResult<FieldExpression> {
        if let Some(op) = ComparisonOp::from_key(key) {
            let value = TValue::from_json(value)?;
            if !value.is_scalar() {
                return Err(SelectorError::expression(format!("{} requires a scalar value", key)));
            }
            return Ok(FieldExpression::Comparison { op, value });
        }

        match key {
            "$in" | "$nin" => {
                let values = decode_array(key, value)?;
                if values.iter().any(|v| !v.is_scalar()) {
                    return Err(SelectorError::expression(format!("{} requires scalar elements", key)));
                }
                let op = if key == "$in" { MembershipOp::In } else { MembershipOp::Nin };
                Ok(FieldExpression::Membership { op, values })
            }
            "$subset" | "$superset" | "$intersect" => {
                let op = match key {
                    "$subset" => SetOp::Subset,
                    "$superset" => SetOp::Superset,
                    _ => SetOp::Intersect,
                };
                Ok(FieldExpression::Set {
                    op,
                    values: decode_array(key, value)?,
                })
            }
            "$not" => {
                let inner = value
                    .as_object()
                    .filter(|m| m.len() == 1)
                    .ok_or_else(|| SelectorError::expression("$not requires exactly one operator"))?;
                let (inner_key, inner_value) = inner
                    .iter()
                    .next()
                    .ok_or_else(|| SelectorError::expression("$not requires exactly one operator"))?;
                Ok(FieldExpression::Not(Box::new(Self::decode(inner_key, inner_value)?)))
            }
            "$type" => {
                let names: Vec<String> = match value {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) => items
                        .iter()
                        .map(|item| {
                            item.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| SelectorError::expression("$type requires strings"))
                        })
                        .collect::<SelectorResult<_>>()?,
                    _ => return Err(SelectorError::expression("$type requires a string or list")),
                };
                if let Some(bad) = names.iter().find(|n| !TYPE_NAMES.contains(&n.as_str())) {
                    return Err(SelectorError::expression(format!("unknown type '{}'", bad)));
                }
                Ok(FieldExpression::Type(names))
            }
            "$pattern" => Ok(FieldExpression::Pattern(Pattern::decode(value)?)),
            "$size" => {
                let size = value
                    .as_f64()
                    .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                    .ok_or_else(|| SelectorError::expression("$size requires a non-negative integer"))?;
                Ok(FieldExpression::Size(size as u64))
            }
            "$every" | "$some" => {
                if !value.is_object() {
                    return Err(SelectorError::expression(format!("{} requires a selector", key)));
                }
                let selector = Box::new(QuerySelector::decode(value, true)?);
                if key == "$every" {
                    Ok(FieldExpression::Every(selector))
                } else {
                    Ok(FieldExpression::Some(selector))
                }
            }
            other => Err(SelectorError::expression(format!("unknown operator '{}'", other))),
        }
    }

    fn simplify(self) -> FieldExpression {
        match self {
            FieldExpression::Not(inner) => FieldExpression::Not(Box::new(inner.simplify())),
            FieldExpression::Every(selector) => FieldExpression::Every(Box::new(selector.simplify())),
            FieldExpression::Some(selector) => FieldExpression::Some(Box::new(selector.simplify())),
            other => other,
        }
    }

    /// Paths touched below the field, relative to it
    fn sub_key_paths(&self) -> Vec<String> {
        match self {
            FieldExpression::Not(inner) => inner.sub_key_paths(),
            FieldExpression::Every(selector) | FieldExpression::Some(selector) => selector.key_paths(),
            _ => Vec::new(),
        }
    }
}

fn decode_array(key: &str, value: &Value) -> SelectorResult<Vec<TValue>> {
    value
        .as_array()
        .ok_or_else(|| SelectorError::expression(format!("{} requires a list", key)))?
        .iter()
        .map(TValue::from_json)
        .collect()
}

/// Selector tree
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySelector {
    Conditional {
        kind: ConditionalType,
        exprs: Vec<QuerySelector>,
    },
    Field {
        field: String,
        expr: FieldExpression,
    },
    Expression(QueryExpression),
}

impl Default for QuerySelector {
    /// Empty `$and`, which matches everything
    fn default() -> Self {
        QuerySelector::Conditional {
            kind: ConditionalType::And,
            exprs: Vec::new(),
        }
    }
}

impl QuerySelector {
    /// Decode one selector object or a list of them (implicitly ANDed).
    ///
    /// `allow_element_field` enables the `"$"` key used inside
    /// `$every`/`$some` to address the array element itself.
    pub fn decode(selector: &Value, allow_element_field: bool) -> SelectorResult<QuerySelector> {
        let mut exprs = Vec::new();
        match selector {
            Value::Array(items) => {
                for item in items {
                    Self::decode_object(item, allow_element_field, &mut exprs)?;
                }
            }
            other => Self::decode_object(other, allow_element_field, &mut exprs)?,
        }
        if exprs.len() == 1 {
            if let Some(only) = exprs.pop() {
                return Ok(only);
            }
        }
        Ok(QuerySelector::Conditional {
            kind: ConditionalType::And,
            exprs,
        })
    }

    fn decode_object(
        selector: &Value,
        allow_element_field: bool,
        out: &mut Vec<QuerySelector>,
    ) -> SelectorResult<()> {
        let map = match selector {
            Value::Object(map) => map,
            Value::Null => return Ok(()),
            _ => return Err(SelectorError::expression("selector must be an object")),
        };

        for (key, value) in map {
            if let Some(kind) = ConditionalType::from_key(key) {
                let items = value
                    .as_array()
                    .ok_or_else(|| SelectorError::expression(format!("{} requires a list", key)))?;
                let exprs = items
                    .iter()
                    .map(|item| Self::decode(item, allow_element_field))
                    .collect::<SelectorResult<Vec<_>>>()?;
                out.push(QuerySelector::Conditional { kind, exprs });
            } else if key == "$expr" {
                out.push(QuerySelector::Expression(QueryExpression::decode(value)?));
            } else if (key == ELEMENT_FIELD && allow_element_field)
                || (!key.starts_with('$') && !key.is_empty())
            {
                let operators = value
                    .as_object()
                    .ok_or_else(|| SelectorError::expression(format!("invalid selector for '{}'", key)))?;
                for expr in FieldExpression::decode_all(operators)? {
                    out.push(QuerySelector::Field {
                        field: key.clone(),
                        expr,
                    });
                }
            } else {
                return Err(SelectorError::expression(format!("invalid key '{}'", key)));
            }
        }
        Ok(())
    }

    /// Collapse single-child `$and`/`$or` and flatten nested conditionals of
    /// the same type. `$nor` never collapses nor flattens. Idempotent.
    pub fn simplify(self) -> QuerySelector {
        match self {
            QuerySelector::Conditional { kind, exprs } => {
                let mut flat = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    match expr.simplify() {
                        QuerySelector::Conditional { kind: inner_kind, exprs: inner }
                            if inner_kind == kind && kind != ConditionalType::Nor =>
                        {
                            flat.extend(inner)
                        }
                        other => flat.push(other),
                    }
                }
                if kind != ConditionalType::Nor && flat.len() == 1 {
                    if let Some(only) = flat.pop() {
                        return only;
                    }
                }
                QuerySelector::Conditional { kind, exprs: flat }
            }
            QuerySelector::Field { field, expr } => QuerySelector::Field {
                field,
                expr: expr.simplify(),
            },
            expression => expression,
        }
    }

    /// AND this selector with others, keeping `self` first.
    pub fn and(self, others: impl IntoIterator<Item = QuerySelector>) -> QuerySelector {
        let mut exprs = vec![self];
        exprs.extend(others);
        QuerySelector::Conditional {
            kind: ConditionalType::And,
            exprs,
        }
        .simplify()
    }

    /// True for a selector that matches every row (`$and` of nothing)
    pub fn is_empty(&self) -> bool {
        matches!(self, QuerySelector::Conditional { kind: ConditionalType::And, exprs } if exprs.is_empty())
    }

    /// Every field path read by this selector, in first-seen order.
    pub fn key_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_key_paths(&mut paths);
        paths
    }

    fn collect_key_paths(&self, out: &mut Vec<String>) {
        let push = |path: String, out: &mut Vec<String>| {
            if !out.contains(&path) {
                out.push(path);
            }
        };
        match self {
            QuerySelector::Conditional { exprs, .. } => {
                for expr in exprs {
                    expr.collect_key_paths(out);
                }
            }
            QuerySelector::Field { field, expr } => {
                if field == ELEMENT_FIELD {
                    for sub in expr.sub_key_paths() {
                        push(sub, out);
                    }
                } else {
                    push(field.clone(), out);
                    for sub in expr.sub_key_paths() {
                        push(format!("{}.{}", field, sub), out);
                    }
                }
            }
            QuerySelector::Expression(expr) => {
                for path in expr.key_paths() {
                    push(path, out);
                }
            }
        }
    }
}
