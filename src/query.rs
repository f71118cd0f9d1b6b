//! Read-only queries.
//!
//! A [`QuerySpec`] is a query string plus named parameters. Parameters are
//! shipped next to the query and substituted by the store; they are never
//! spliced into the text. The [`QueryBuilder`] offers a typed way to produce
//! such specs: every literal becomes a generated `$pN` parameter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigHandle;
use crate::document::Document;
use crate::error::QueryError;
use crate::protocol::{Consistency, Params, Request, RequestFrame, Response};
use crate::transport::Transport;

/// A query string and the parameters it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub query: String,
    #[serde(default)]
    pub params: Params,
}

impl QuerySpec {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Params::new(),
        }
    }

    /// Bind a parameter, referenced in the query as `$name`.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    /// Check that every `$name` in the query has a bound value.
    pub fn validate(&self) -> Result<(), QueryError> {
        for name in referenced_params(&self.query)? {
            if !self.params.contains_key(&name) {
                return Err(QueryError::UnknownParameter(name));
            }
        }
        Ok(())
    }
}

impl From<&str> for QuerySpec {
    fn from(query: &str) -> Self {
        QuerySpec::new(query)
    }
}

impl From<String> for QuerySpec {
    fn from(query: String) -> Self {
        QuerySpec::new(query)
    }
}

/// Names of all `$parameters` referenced outside string literals, in order
/// of first appearance.
pub fn referenced_params(query: &str) -> Result<Vec<String>, QueryError> {
    let chars: Vec<char> = query.chars().collect();
    let mut names: Vec<String> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            quote @ ('"' | '\'') => {
                let start = i;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(QueryError::SyntaxError {
                                position: start,
                                message: "unterminated string literal".to_string(),
                            })
                        }
                        Some('\\') => i += 2,
                        Some(c) if *c == quote => break,
                        Some(_) => i += 1,
                    }
                }
                i += 1;
            }
            '$' => {
                let start = i;
                i += 1;
                while matches!(chars.get(i), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
                    i += 1;
                }
                if i == start + 1 || chars[start + 1].is_ascii_digit() {
                    return Err(QueryError::SyntaxError {
                        position: start,
                        message: "expected parameter name after $".to_string(),
                    });
                }
                let name: String = chars[start + 1..i].iter().collect();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            _ => i += 1,
        }
    }
    Ok(names)
}

/// Per-call settings for a read.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// `true` reads from the cached view (lower latency, eventually
    /// consistent), `false` from the authoritative one. Defaults to the
    /// client's `use_cdn` setting.
    pub use_cached_view: Option<bool>,
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn cached(mut self, yes: bool) -> Self {
        self.use_cached_view = Some(yes);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Runs read-only requests through a [`Transport`].
#[derive(Clone)]
pub struct QueryExecutor {
    transport: Arc<dyn Transport>,
    config: ConfigHandle,
}

impl QueryExecutor {
    pub fn new(transport: Arc<dyn Transport>, config: ConfigHandle) -> Self {
        Self { transport, config }
    }

    /// Run a query, returning raw result rows.
    pub async fn fetch(
        &self,
        spec: &QuerySpec,
        options: FetchOptions,
    ) -> Result<Vec<Value>, QueryError> {
        spec.validate()?;
        let config = self.config.get();
        let consistency = if options.use_cached_view.unwrap_or(config.use_cdn) {
            Consistency::Cached
        } else {
            Consistency::Authoritative
        };
        let request = Request::Query {
            query: spec.query.clone(),
            params: spec.params.clone(),
            consistency,
        };
        match self
            .call(config.dataset, request, options.timeout.unwrap_or(config.timeout))
            .await?
        {
            Response::QueryResult { result } => Ok(result),
            Response::Error(err) => Err(err.into()),
            other => Err(unexpected("query", &other)),
        }
    }

    /// Run a query and decode each row.
    pub async fn fetch_as<T: DeserializeOwned>(
        &self,
        spec: &QuerySpec,
        options: FetchOptions,
    ) -> Result<Vec<T>, QueryError> {
        self.fetch(spec, options)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(|e| QueryError::Decode(e.to_string())))
            .collect()
    }

    /// Fetch documents by id. The result lines up with `ids`; missing
    /// documents come back as `None`. Always authoritative.
    pub async fn get_documents(&self, ids: &[String]) -> Result<Vec<Option<Document>>, QueryError> {
        let config = self.config.get();
        let request = Request::GetDocuments { ids: ids.to_vec() };
        match self.call(config.dataset, request, config.timeout).await? {
            Response::Documents { documents } if documents.len() == ids.len() => Ok(documents),
            Response::Documents { documents } => Err(QueryError::TransportFailure(format!(
                "asked for {} documents, got {}",
                ids.len(),
                documents.len()
            ))),
            Response::Error(err) => Err(err.into()),
            other => Err(unexpected("getDocuments", &other)),
        }
    }

    async fn call(
        &self,
        dataset: String,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, QueryError> {
        let frame = RequestFrame::new(dataset, request);
        debug!("sending {} request {}", frame.request.name(), frame.id);
        let response = tokio::time::timeout(timeout, self.transport.send(frame))
            .await
            .map_err(|_| QueryError::TransportFailure(format!("timed out after {:?}", timeout)))??;
        Ok(response)
    }
}

impl fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor").finish_non_exhaustive()
    }
}

fn unexpected(request: &str, response: &Response) -> QueryError {
    QueryError::TransportFailure(format!("unexpected response to {}: {:?}", request, response))
}

/// Sort direction
#[derive(Debug, Clone, Copy)]
pub enum SortDir {
    Asc,
    Desc,
}

impl fmt::Display for SortDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDir::Asc => write!(f, "asc"),
            SortDir::Desc => write!(f, "desc"),
        }
    }
}

/// Filter condition for queries
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    Defined(String, bool),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

/// Hands out `$p0`, `$p1`, ... and records their values.
#[derive(Debug, Default)]
struct Binder {
    params: Params,
}

impl Binder {
    fn bind(&mut self, value: Value) -> String {
        let name = format!("p{}", self.params.len());
        self.params.insert(name.clone(), value);
        format!("${}", name)
    }
}

impl Filter {
    fn compile(&self, binder: &mut Binder) -> String {
        match self {
            Filter::Eq(field, value) => format!("{} == {}", field, binder.bind(value.clone())),
            Filter::Ne(field, value) => format!("{} != {}", field, binder.bind(value.clone())),
            Filter::Gt(field, value) => format!("{} > {}", field, binder.bind(value.clone())),
            Filter::Gte(field, value) => format!("{} >= {}", field, binder.bind(value.clone())),
            Filter::Lt(field, value) => format!("{} < {}", field, binder.bind(value.clone())),
            Filter::Lte(field, value) => format!("{} <= {}", field, binder.bind(value.clone())),
            Filter::In(field, values) => {
                format!("{} in {}", field, binder.bind(Value::Array(values.clone())))
            }
            Filter::NotIn(field, values) => {
                format!("!({} in {})", field, binder.bind(Value::Array(values.clone())))
            }
            Filter::Defined(field, value) => {
                if *value {
                    format!("defined({})", field)
                } else {
                    format!("!defined({})", field)
                }
            }
            Filter::And(conditions) => {
                let parts: Vec<String> = conditions.iter().map(|c| c.compile(binder)).collect();
                format!("({})", parts.join(" && "))
            }
            Filter::Or(conditions) => {
                let parts: Vec<String> = conditions.iter().map(|c| c.compile(binder)).collect();
                format!("({})", parts.join(" || "))
            }
            Filter::Not(condition) => {
                format!("!({})", condition.compile(binder))
            }
        }
    }

    /// Compile into a bare filter expression, e.g. for [`listen`](crate::PineDB::listen).
    pub fn to_spec(&self) -> QuerySpec {
        let mut binder = Binder::default();
        let query = self.compile(&mut binder);
        QuerySpec {
            query,
            params: binder.params,
        }
    }
}

/// Field expression builder for fluent filter construction
pub struct Field {
    name: String,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn eq(self, value: impl Into<Value>) -> Filter {
        Filter::Eq(self.name, value.into())
    }

    pub fn ne(self, value: impl Into<Value>) -> Filter {
        Filter::Ne(self.name, value.into())
    }

    pub fn gt(self, value: impl Into<Value>) -> Filter {
        Filter::Gt(self.name, value.into())
    }

    pub fn gte(self, value: impl Into<Value>) -> Filter {
        Filter::Gte(self.name, value.into())
    }

    pub fn lt(self, value: impl Into<Value>) -> Filter {
        Filter::Lt(self.name, value.into())
    }

    pub fn lte(self, value: impl Into<Value>) -> Filter {
        Filter::Lte(self.name, value.into())
    }

    pub fn is_in(self, values: Vec<Value>) -> Filter {
        Filter::In(self.name, values)
    }

    pub fn not_in(self, values: Vec<Value>) -> Filter {
        Filter::NotIn(self.name, values)
    }

    pub fn defined(self, value: bool) -> Filter {
        Filter::Defined(self.name, value)
    }
}

/// Create a field expression
pub fn field(name: impl Into<String>) -> Field {
    Field::new(name)
}

/// Combine filters with AND
pub fn and(filters: Vec<Filter>) -> Filter {
    Filter::And(filters)
}

/// Combine filters with OR
pub fn or(filters: Vec<Filter>) -> Filter {
    Filter::Or(filters)
}

/// Negate a filter
pub fn not(filter: Filter) -> Filter {
    Filter::Not(Box::new(filter))
}

/// Query builder producing parameterised [`QuerySpec`]s.
///
/// # Example
/// ```
/// use pinedb::query::{QueryBuilder, field, SortDir};
///
/// let spec = QueryBuilder::of_type("bike")
///     .find(field("seats").gte(2))
///     .order("name", SortDir::Asc)
///     .limit(10)
///     .project(["name", "seats"])
///     .build();
/// assert_eq!(
///     spec.query,
///     "*[_type == $p0 && seats >= $p1] | order(name asc) [0...10] {name, seats}"
/// );
/// ```
pub struct QueryBuilder {
    filters: Vec<Filter>,
    order: Vec<(String, SortDir)>,
    limit_value: Option<usize>,
    skip_value: Option<usize>,
    projection: Vec<String>,
}

impl QueryBuilder {
    /// Query over every document in the dataset
    pub fn all() -> Self {
        Self {
            filters: Vec::new(),
            order: Vec::new(),
            limit_value: None,
            skip_value: None,
            projection: Vec::new(),
        }
    }

    /// Query over documents of one type
    pub fn of_type(doc_type: impl Into<String>) -> Self {
        let doc_type: String = doc_type.into();
        Self::all().find(field("_type").eq(doc_type))
    }

    /// Add a filter condition; multiple conditions are ANDed
    pub fn find(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sort by field
    pub fn order(mut self, field: impl Into<String>, direction: SortDir) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    /// Limit number of results
    pub fn limit(mut self, n: usize) -> Self {
        self.limit_value = Some(n);
        self
    }

    /// Skip results (offset)
    pub fn skip(mut self, n: usize) -> Self {
        self.skip_value = Some(n);
        self
    }

    /// Only return the listed fields
    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn build(&self) -> QuerySpec {
        let mut binder = Binder::default();
        let parts: Vec<String> = self.filters.iter().map(|f| f.compile(&mut binder)).collect();
        let mut query = if parts.is_empty() {
            "*".to_string()
        } else {
            format!("*[{}]", parts.join(" && "))
        };

        if !self.order.is_empty() {
            let keys: Vec<String> = self
                .order
                .iter()
                .map(|(field, dir)| format!("{} {}", field, dir))
                .collect();
            query.push_str(&format!(" | order({})", keys.join(", ")));
        }

        if self.limit_value.is_some() || self.skip_value.is_some() {
            let start = self.skip_value.unwrap_or(0);
            match self.limit_value {
                Some(limit) => {
                    query.push_str(&format!(" [{}...{}]", start, start.saturating_add(limit)))
                }
                None => query.push_str(&format!(" [{}...]", start)),
            }
        }

        if !self.projection.is_empty() {
            query.push_str(&format!(" {{{}}}", self.projection.join(", ")));
        }

        QuerySpec {
            query,
            params: binder.params,
        }
    }
}

impl fmt::Display for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build().query)
    }
}
