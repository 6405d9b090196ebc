// query.rs - Closed query/aggregation algebra and its in-memory evaluator
//
// Query/aggregation structures are closed algebraic sums (§9 Design Notes);
// the evaluator is the single place that interprets them against an
// in-memory entity slice.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::entity::Entity;

/// Logical filter tree over field comparisons.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Nin { field: String, values: Vec<Value> },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    Exists { field: String, exists: bool },
    Regex { field: String, pattern: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortDirection {
    Ascending = 1,
    Descending = -1,
}

/// A query: filter + sort (ordered, field precedence matters) + projection + window.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub filter: Option<Filter>,
    /// Ordered field -> direction; order of the vec is sort precedence.
    pub sort: Vec<(String, SortDirection)>,
    pub fields: Vec<String>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// A query is "bounded" when it carries `skip` or `limit`; bounded pulls
    /// may not delete entities outside their window (§4.8) and never use
    /// delta-set (§9 (c)).
    pub fn is_bounded(&self) -> bool {
        self.skip.is_some() || self.limit.is_some()
    }

    /// Stable, process-independent serialization used as the CachedQuery key (§3).
    pub fn canonical(&self) -> String {
        canonical_json(&serde_json::to_value(self).expect("Query always serializes"))
    }

    /// Query-string fragments for the wire protocol (§6): `query`, `sort`, `fields`, `skip`, `limit`.
    pub fn to_query_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(filter) = &self.filter {
            params.push((
                "query".to_string(),
                serde_json::to_string(filter).expect("Filter always serializes"),
            ));
        }
        if !self.sort.is_empty() {
            let sort_obj: serde_json::Map<String, Value> = self
                .sort
                .iter()
                .map(|(f, d)| (f.clone(), Value::from(*d as i32)))
                .collect();
            params.push((
                "sort".to_string(),
                serde_json::to_string(&sort_obj).expect("sort map always serializes"),
            ));
        }
        if !self.fields.is_empty() {
            params.push(("fields".to_string(), self.fields.join(",")));
        }
        if let Some(skip) = self.skip {
            params.push(("skip".to_string(), skip.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

/// Recursively sorts object keys so two semantically-equal JSON values
/// serialize identically regardless of construction order or process.
fn canonical_json(value: &Value) -> String {
    fn sort_value(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut sorted = serde_json::Map::new();
                for (k, v) in entries {
                    sorted.insert(k.clone(), sort_value(v));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
            other => other.clone(),
        }
    }
    sort_value(value).to_string()
}

fn field_value<'a>(entity: &'a Entity, field: &str) -> Option<&'a Value> {
    entity.get(field)
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Evaluates a single filter node against one entity.
pub fn matches(entity: &Entity, filter: &Filter) -> bool {
    match filter {
        Filter::Eq { field, value } => field_value(entity, field) == Some(value),
        Filter::Ne { field, value } => field_value(entity, field) != Some(value),
        Filter::In { field, values } => field_value(entity, field)
            .map(|v| values.contains(v))
            .unwrap_or(false),
        Filter::Nin { field, values } => !field_value(entity, field)
            .map(|v| values.contains(v))
            .unwrap_or(false),
        Filter::Gt { field, value } => field_value(entity, field)
            .and_then(|v| compare_values(v, value))
            .map(|o| o == Ordering::Greater)
            .unwrap_or(false),
        Filter::Gte { field, value } => field_value(entity, field)
            .and_then(|v| compare_values(v, value))
            .map(|o| o != Ordering::Less)
            .unwrap_or(false),
        Filter::Lt { field, value } => field_value(entity, field)
            .and_then(|v| compare_values(v, value))
            .map(|o| o == Ordering::Less)
            .unwrap_or(false),
        Filter::Lte { field, value } => field_value(entity, field)
            .and_then(|v| compare_values(v, value))
            .map(|o| o != Ordering::Greater)
            .unwrap_or(false),
        Filter::Exists { field, exists } => entity.contains_key(field) == *exists,
        Filter::Regex { field, pattern } => field_value(entity, field)
            .and_then(Value::as_str)
            .map(|s| regex_lite_matches(pattern, s))
            .unwrap_or(false),
        Filter::And(filters) => filters.iter().all(|f| matches(entity, f)),
        Filter::Or(filters) => filters.iter().any(|f| matches(entity, f)),
        Filter::Not(inner) => !matches(entity, inner),
    }
}

/// Minimal substring/prefix/suffix matcher covering the common `$regex` shapes
/// (`^prefix`, `suffix$`, plain substring) without pulling in a regex engine
/// for the core's in-memory evaluator; the server applies the full regex.
fn regex_lite_matches(pattern: &str, haystack: &str) -> bool {
    if let Some(rest) = pattern.strip_prefix('^') {
        if let Some(body) = rest.strip_suffix('$') {
            return haystack == body;
        }
        return haystack.starts_with(rest);
    }
    if let Some(body) = pattern.strip_suffix('$') {
        return haystack.ends_with(body);
    }
    haystack.contains(pattern)
}

/// Applies filter, sort, skip, limit, and field projection, in that order (§4.2).
pub fn evaluate<'a>(entities: impl IntoIterator<Item = &'a Entity>, query: &Query) -> Vec<Entity> {
    let mut results: Vec<&Entity> = entities
        .into_iter()
        .filter(|e| query.filter.as_ref().map(|f| matches(e, f)).unwrap_or(true))
        .collect();

    for (field, direction) in query.sort.iter().rev() {
        results.sort_by(|a, b| {
            let ord = match (field_value(a, field), field_value(b, field)) {
                (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            match direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            }
        });
    }

    let skip = query.skip.unwrap_or(0);
    let windowed: Vec<&Entity> = if skip >= results.len() {
        Vec::new()
    } else {
        let end = query
            .limit
            .map(|l| (skip + l).min(results.len()))
            .unwrap_or(results.len());
        results[skip..end].to_vec()
    };

    windowed
        .into_iter()
        .map(|e| project(e, &query.fields))
        .collect()
}

fn project(entity: &Entity, fields: &[String]) -> Entity {
    if fields.is_empty() {
        return entity.clone();
    }
    let mut projected = Entity::new();
    for field in fields {
        if let Some(value) = entity.get(field) {
            projected.insert(field.clone(), value.clone());
        }
    }
    // `_id` always survives projection so callers can still address the entity.
    if let Some(id) = entity.get("_id") {
        projected.entry("_id".to_string()).or_insert_with(|| id.clone());
    }
    projected
}

/// Reduce operation applied per group in a [`Aggregation`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reduce", rename_all = "snake_case")]
pub enum ReduceOp {
    Count,
    Sum { field: String },
    Min { field: String },
    Max { field: String },
    Avg { field: String },
}

/// Grouping aggregation (§4.2 `group`): filter, group by one or more keys, reduce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Aggregation {
    pub filter: Option<Filter>,
    pub group_by: Vec<String>,
    pub reduce: ReduceOp,
}

/// One evaluated group: the grouping key values plus the reduced result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupResult {
    pub key: serde_json::Map<String, Value>,
    pub result: Value,
}

/// Evaluates an aggregation in-memory over a full entity slice.
pub fn evaluate_aggregation<'a>(
    entities: impl IntoIterator<Item = &'a Entity>,
    aggregation: &Aggregation,
) -> Vec<GroupResult> {
    let filtered: Vec<&Entity> = entities
        .into_iter()
        .filter(|e| {
            aggregation
                .filter
                .as_ref()
                .map(|f| matches(e, f))
                .unwrap_or(true)
        })
        .collect();

    let mut groups: Vec<(serde_json::Map<String, Value>, Vec<&Entity>)> = Vec::new();
    for entity in filtered {
        let key: serde_json::Map<String, Value> = aggregation
            .group_by
            .iter()
            .map(|field| (field.clone(), entity.get(field).cloned().unwrap_or(Value::Null)))
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(entity),
            None => groups.push((key, vec![entity])),
        }
    }

    groups
        .into_iter()
        .map(|(key, members)| GroupResult {
            key,
            result: reduce(&aggregation.reduce, &members),
        })
        .collect()
}

fn reduce(op: &ReduceOp, members: &[&Entity]) -> Value {
    match op {
        ReduceOp::Count => Value::from(members.len()),
        ReduceOp::Sum { field } => Value::from(numeric_values(members, field).sum::<f64>()),
        ReduceOp::Min { field } => numeric_values(members, field)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v))))
            .map(Value::from)
            .unwrap_or(Value::Null),
        ReduceOp::Max { field } => numeric_values(members, field)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
            .map(Value::from)
            .unwrap_or(Value::Null),
        ReduceOp::Avg { field } => {
            let values: Vec<f64> = numeric_values(members, field).collect();
            if values.is_empty() {
                Value::Null
            } else {
                Value::from(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
    }
}

fn numeric_values<'a>(members: &'a [&'a Entity], field: &'a str) -> impl Iterator<Item = f64> + 'a {
    members
        .iter()
        .filter_map(move |e| e.get(field).and_then(Value::as_f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str, age: i64) -> Entity {
        let mut e = Entity::new();
        e.insert("_id".into(), json!(id));
        e.insert("age".into(), json!(age));
        e
    }

    #[test]
    fn canonical_serialization_is_key_order_independent() {
        let q1 = Query::new().with_filter(Filter::Eq {
            field: "a".into(),
            value: json!(1),
        });
        let mut q2 = q1.clone();
        q2.fields = vec![]; // identical content, different construction path
        assert_eq!(q1.canonical(), q2.canonical());
    }

    #[test]
    fn filter_and_or_not() {
        let e = entity("1", 30);
        let gt25 = Filter::Gt {
            field: "age".into(),
            value: json!(25),
        };
        let lt20 = Filter::Lt {
            field: "age".into(),
            value: json!(20),
        };
        assert!(matches(&e, &gt25));
        assert!(!matches(&e, &lt20));
        assert!(matches(&e, &Filter::Or(vec![gt25.clone(), lt20.clone()])));
        assert!(!matches(&e, &Filter::And(vec![gt25.clone(), lt20.clone()])));
        assert!(matches(&e, &Filter::Not(Box::new(lt20))));
    }

    #[test]
    fn sort_skip_limit_order() {
        let entities = vec![entity("a", 3), entity("b", 1), entity("c", 2)];
        let query = Query::new()
            .with_sort("age", SortDirection::Ascending)
            .with_skip(1)
            .with_limit(1);
        let result = evaluate(entities.iter(), &query);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].get("_id").unwrap(), "c");
    }

    #[test]
    fn projection_always_keeps_id() {
        let entities = vec![entity("a", 3)];
        let mut query = Query::new();
        query.fields = vec!["age".to_string()];
        let result = evaluate(entities.iter(), &query);
        assert_eq!(result[0].get("_id").unwrap(), "a");
        assert_eq!(result[0].get("age").unwrap(), 3);
        assert_eq!(result[0].len(), 2);
    }

    #[test]
    fn aggregation_groups_and_reduces() {
        let mut a = entity("a", 10);
        a.insert("team".into(), json!("x"));
        let mut b = entity("b", 20);
        b.insert("team".into(), json!("x"));
        let mut c = entity("c", 5);
        c.insert("team".into(), json!("y"));

        let agg = Aggregation {
            filter: None,
            group_by: vec!["team".into()],
            reduce: ReduceOp::Sum { field: "age".into() },
        };
        let groups = evaluate_aggregation([&a, &b, &c], &agg);
        assert_eq!(groups.len(), 2);
        let x = groups.iter().find(|g| g.key["team"] == json!("x")).unwrap();
        assert_eq!(x.result, json!(30.0));
    }
}
