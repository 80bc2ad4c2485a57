//! Statement assembly with bound parameters, and span tag filters

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::Param;
use crate::{Error, Result};

/// Builds a statement from fragments; every value goes through [`QueryBuilder::bind`]
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    sql: String,
    params: Vec<Param>,
}

impl QueryBuilder {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append statement text that carries no placeholder
    pub fn push(&mut self, fragment: &str) -> &mut Self {
        self.sql.push_str(fragment);
        self
    }

    /// Append a fragment with one `?` and its value
    pub fn bind(&mut self, fragment: &str, param: impl Into<Param>) -> &mut Self {
        self.sql.push_str(fragment);
        self.params.push(param.into());
        self
    }

    /// Append a fragment with several `?` and their values, in order
    pub fn bind_all(&mut self, fragment: &str, params: Vec<Param>) -> &mut Self {
        self.sql.push_str(fragment);
        self.params.extend(params);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn build(self) -> (String, Vec<Param>) {
        (self.sql, self.params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagOperator {
    Equals,
    Contains,
    Regex,
    IsNotNull,
}

impl std::str::FromStr for TagOperator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "equals" => Ok(TagOperator::Equals),
            "contains" => Ok(TagOperator::Contains),
            "regex" => Ok(TagOperator::Regex),
            "isnotnull" => Ok(TagOperator::IsNotNull),
            other => Err(Error::Validation(format!("tag operator {} not supported", other))),
        }
    }
}

/// A tag filter as it arrives in the `tags` request parameter
#[derive(Debug, Clone, Deserialize)]
pub struct TagQuery {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub operator: String,
}

/// A validated span tag filter
#[derive(Debug, Clone)]
pub enum TagFilter {
    /// `error=true`: the span's status marks an error, whatever its tags say
    ErrorStatus,
    Equals { key: String, value: String },
    Contains { key: String, value: String },
    Regex { key: String, pattern: Regex },
    IsNotNull { key: String },
}

impl TagFilter {
    pub fn new(key: &str, value: &str, operator: &str) -> Result<Self> {
        if key == "error" && value == "true" {
            return Ok(TagFilter::ErrorStatus);
        }
        if key.is_empty() {
            return Err(Error::Validation("tag filter without key".to_string()));
        }

        let key = key.to_string();
        Ok(match operator.parse::<TagOperator>()? {
            TagOperator::Equals => TagFilter::Equals {
                key,
                value: value.to_string(),
            },
            TagOperator::Contains => TagFilter::Contains {
                key,
                value: value.to_string(),
            },
            TagOperator::Regex => TagFilter::Regex {
                key,
                pattern: Regex::new(value)
                    .map_err(|e| Error::Validation(format!("invalid tag regex '{}': {}", value, e)))?,
            },
            TagOperator::IsNotNull => TagFilter::IsNotNull { key },
        })
    }

    /// Parse the JSON-encoded `tags` parameter; blank means no filter
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let queries: Vec<TagQuery> = serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("error in parsing tags {}: {}", raw, e)))?;
        queries
            .iter()
            .map(|q| TagFilter::new(&q.key, &q.value, &q.operator))
            .collect()
    }

    /// Append this filter as an `AND` condition
    pub fn apply(&self, query: &mut QueryBuilder) {
        match self {
            TagFilter::ErrorStatus => {
                query.push(" AND (has(tags, 'error:true') OR statusCode >= 500 OR statusCode = 2)");
            }
            TagFilter::Equals { key, value } => {
                query.bind(" AND has(tags, ?)", format!("{}:{}", key, value));
            }
            TagFilter::Contains { key, value } => {
                query.bind_all(
                    " AND tagsValues[indexOf(tagsKeys, ?)] ILIKE ?",
                    vec![Param::from(key.as_str()), Param::from(like_pattern(value))],
                );
            }
            TagFilter::Regex { key, pattern } => {
                query.bind_all(
                    " AND match(tagsValues[indexOf(tagsKeys, ?)], ?)",
                    vec![Param::from(key.as_str()), Param::from(pattern.as_str())],
                );
            }
            TagFilter::IsNotNull { key } => {
                query.bind(" AND has(tagsKeys, ?)", key.as_str());
            }
        }
    }
}

/// `%value%` with the value's own wildcards escaped
fn like_pattern(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len() + 2);
    pattern.push('%');
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::placeholder_positions;

    fn applied(key: &str, value: &str, operator: &str) -> (String, Vec<Param>) {
        let mut query = QueryBuilder::new("SELECT spanID FROM t WHERE 1 = 1");
        TagFilter::new(key, value, operator).unwrap().apply(&mut query);
        let (sql, params) = query.build();
        assert_eq!(placeholder_positions(&sql).len(), params.len());
        (sql, params)
    }

    #[test]
    fn test_equals_binds_key_value_pair() {
        let (sql, params) = applied("http.method", "GET", "equals");
        assert_eq!(sql, "SELECT spanID FROM t WHERE 1 = 1 AND has(tags, ?)");
        assert_eq!(params, vec![Param::from("http.method:GET")]);
    }

    #[test]
    fn test_contains_escapes_like_wildcards() {
        let (sql, params) = applied("http.url", r"50%_off\now", "contains");
        assert_eq!(
            sql,
            "SELECT spanID FROM t WHERE 1 = 1 AND tagsValues[indexOf(tagsKeys, ?)] ILIKE ?"
        );
        assert_eq!(
            params,
            vec![Param::from("http.url"), Param::from(r"%50\%\_off\\now%")]
        );
    }

    #[test]
    fn test_regex_binds_pattern() {
        let (sql, params) = applied("http.url", r"/users/\d+$", "regex");
        assert_eq!(
            sql,
            "SELECT spanID FROM t WHERE 1 = 1 AND match(tagsValues[indexOf(tagsKeys, ?)], ?)"
        );
        assert_eq!(params, vec![Param::from("http.url"), Param::from(r"/users/\d+$")]);
    }

    #[test]
    fn test_isnotnull_checks_key_presence() {
        let (sql, params) = applied("peer.service", "", "isnotnull");
        assert_eq!(sql, "SELECT spanID FROM t WHERE 1 = 1 AND has(tagsKeys, ?)");
        assert_eq!(params, vec![Param::from("peer.service")]);
    }

    #[test]
    fn test_error_true_means_error_status() {
        let filter = TagFilter::new("error", "true", "equals").unwrap();
        assert!(matches!(filter, TagFilter::ErrorStatus));

        let (sql, params) = applied("error", "true", "contains");
        assert_eq!(
            sql,
            "SELECT spanID FROM t WHERE 1 = 1 AND (has(tags, 'error:true') OR statusCode >= 500 OR statusCode = 2)"
        );
        assert!(params.is_empty());

        // Any other error value is an ordinary tag filter
        let (sql, params) = applied("error", "false", "equals");
        assert!(sql.ends_with(" AND has(tags, ?)"));
        assert_eq!(params, vec![Param::from("error:false")]);
    }

    #[test]
    fn test_filters_chain_in_order() {
        let mut query = QueryBuilder::new("SELECT spanID FROM t WHERE serviceName = ?");
        query.bind("", "frontend");
        for filter in TagFilter::parse_list(
            r#"[{"key":"http.method","value":"POST","operator":"equals"},{"key":"db","operator":"isnotnull"}]"#,
        )
        .unwrap()
        {
            filter.apply(&mut query);
        }

        assert_eq!(
            query.sql(),
            "SELECT spanID FROM t WHERE serviceName = ? AND has(tags, ?) AND has(tagsKeys, ?)"
        );
        assert_eq!(
            query.params(),
            &[Param::from("frontend"), Param::from("http.method:POST"), Param::from("db")]
        );
    }

    #[test]
    fn test_rejects_unknown_operator_and_bad_regex() {
        assert!(matches!(TagFilter::new("k", "v", "startswith"), Err(Error::Validation(_))));
        assert!(matches!(TagFilter::new("k", "(", "regex"), Err(Error::Validation(_))));
        assert!(matches!(TagFilter::new("", "v", "equals"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_parse_list() {
        let filters = TagFilter::parse_list(
            r#"[{"key":"http.url","value":"/health","operator":"contains"},{"key":"error","value":"true","operator":"equals"}]"#,
        )
        .unwrap();
        assert_eq!(filters.len(), 2);
        assert!(TagFilter::parse_list("").unwrap().is_empty());
        assert!(matches!(TagFilter::parse_list("{not json"), Err(Error::Validation(_))));
    }
}
