//! Uniform search query grammar.
//!
//! The same textual form is used for builds, repos, logs, and artifacts:
//!
//! ```text
//! term [in:field ...] [field:[op]value ...] [sort:field-{asc|desc}] [kind:K]
//! ```
//!
//! Operators are matched longest-first (`>=` before `>`). Quoted terms
//! allow embedded whitespace and escaped quotes. Pagination is carried
//! separately as an opaque keyset cursor plus a bounded limit.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::limits::limits;

/// Comparison operators for field filters, longest spelling first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Ge,
    Le,
    Ne,
    Gt,
    Lt,
    Eq,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Eq => "=",
        }
    }

    /// Strip the operator from the front of a filter value. Longest-first:
    /// `>=` must win over `>`.
    fn split(value: &str) -> (CompareOp, &str) {
        for op in [CompareOp::Ge, CompareOp::Le, CompareOp::Ne] {
            if let Some(rest) = value.strip_prefix(op.as_str()) {
                return (op, rest);
            }
        }
        for op in [CompareOp::Gt, CompareOp::Lt, CompareOp::Eq] {
            if let Some(rest) = value.strip_prefix(op.as_str()) {
                return (op, rest);
            }
        }
        (CompareOp::Eq, value)
    }
}

/// One `field op value` predicate. Filters on distinct fields are AND'd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: CompareOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

/// A parsed search query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Free-text term; multiple bare words are joined with single spaces.
    pub term: Option<String>,
    /// Fields the term is constrained to. Empty means all text-indexed
    /// fields of the resource kind.
    pub in_fields: Vec<String>,
    pub filters: Vec<FieldFilter>,
    pub sort: Option<Sort>,
    pub kind: Option<String>,
}

impl Query {
    pub fn parse(input: &str) -> Result<Query> {
        parse(input)
    }

    /// The sort actually applied: explicit sort, or the per-kind default
    /// of newest-first.
    pub fn effective_sort(&self) -> Sort {
        self.sort.clone().unwrap_or(Sort {
            field: "created_at".to_string(),
            direction: SortDirection::Desc,
        })
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(term) = &self.term {
            parts.push(quote_term(term));
        }
        for field in &self.in_fields {
            parts.push(format!("in:{field}"));
        }
        for filter in &self.filters {
            // An equality value starting with an operator character needs
            // the explicit `=` so it does not re-parse as that operator.
            let op = match filter.op {
                CompareOp::Eq
                    if filter
                        .value
                        .starts_with(['>', '<', '!', '=']) =>
                {
                    "=".to_string()
                }
                CompareOp::Eq => String::new(),
                other => other.as_str().to_string(),
            };
            parts.push(format!("{}:{}{}", filter.field, op, quote_value(&filter.value)));
        }
        if let Some(sort) = &self.sort {
            parts.push(format!("sort:{}-{}", sort.field, sort.direction.as_str()));
        }
        if let Some(kind) = &self.kind {
            parts.push(format!("kind:{kind}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Pagination: opaque cursor plus a bounded page size.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub cursor: Option<Cursor>,
    pub limit: Option<usize>,
}

impl Page {
    /// The effective page size, clamped to the configured maximum.
    pub fn effective_limit(&self) -> usize {
        let max = limits().max_page_size;
        self.limit.map_or(max, |l| l.min(max).max(1))
    }
}

/// Keyset cursor: the sort key of the boundary row plus direction. Opaque
/// on the wire (hex-encoded JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub sort_field: String,
    /// Sort-key value of the last row of the previous page.
    pub boundary_value: String,
    /// Id of the boundary row, the tie-breaker.
    pub boundary_id: String,
    pub direction: SortDirection,
}

impl Cursor {
    pub fn encode(&self) -> String {
        // Serialization of a plain struct cannot fail.
        hex::encode(serde_json::to_vec(self).expect("cursor serializes"))
    }

    pub fn decode(token: &str) -> Result<Cursor> {
        let bytes = hex::decode(token)
            .map_err(|_| Error::ValidationFailed("malformed cursor".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| Error::ValidationFailed("malformed cursor".to_string()))
    }
}

/// Fluent construction of queries; every query it can produce satisfies
/// `parse(q.to_string()) == q`.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.query.term = Some(term.into());
        self
    }

    pub fn in_field(mut self, field: impl Into<String>) -> Self {
        self.query.in_fields.push(field.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        self.query.filters.push(FieldFilter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.query.sort = Some(Sort {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.query.kind = Some(kind.into());
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}

fn is_field_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn quote_term(term: &str) -> String {
    // A term word containing a colon or quote would re-parse as a filter
    // or break tokenization; emit it quoted. Bare spaces are fine: the
    // words re-join on parse.
    if term.contains(':') || term.contains('"') || term.is_empty() {
        format!("\"{}\"", term.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        term.to_string()
    }
}

fn quote_value(value: &str) -> String {
    if value.contains(char::is_whitespace) || value.contains('"') || value.is_empty() {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// One lexed token. A token that *begins* with a quote is always a term
/// word, never a filter; a quote later in the token (a quoted filter
/// value) only affects whitespace handling.
#[derive(Debug)]
struct Token {
    text: String,
    quoted: bool,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' if !in_quotes => {
                in_quotes = true;
                if current.is_empty() {
                    quoted = true;
                }
            }
            '"' => in_quotes = false,
            '\\' if in_quotes => match chars.next() {
                Some(escaped @ ('"' | '\\')) => current.push(escaped),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => {
                    return Err(Error::ValidationFailed(
                        "dangling escape in query".to_string(),
                    ));
                }
            },
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        quoted,
                    });
                    quoted = false;
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(Error::ValidationFailed(
            "unterminated quote in query".to_string(),
        ));
    }
    if !current.is_empty() || quoted {
        tokens.push(Token {
            text: current,
            quoted,
        });
    }
    Ok(tokens)
}

fn parse(input: &str) -> Result<Query> {
    let mut query = Query::default();
    let mut term_words: Vec<String> = Vec::new();

    for token in tokenize(input)? {
        if token.quoted {
            term_words.push(token.text);
            continue;
        }
        if let Some(field) = token.text.strip_prefix("in:") {
            if !is_field_name(field) {
                return Err(Error::ValidationFailed(format!(
                    "invalid in: field {field:?}"
                )));
            }
            query.in_fields.push(field.to_string());
            continue;
        }
        if let Some(spec) = token.text.strip_prefix("sort:") {
            let (field, dir) = spec.rsplit_once('-').ok_or_else(|| {
                Error::ValidationFailed(format!("invalid sort spec {spec:?}"))
            })?;
            let direction = match dir {
                "asc" => SortDirection::Asc,
                "desc" => SortDirection::Desc,
                other => {
                    return Err(Error::ValidationFailed(format!(
                        "invalid sort direction {other:?}"
                    )));
                }
            };
            if query.sort.is_some() {
                return Err(Error::ValidationFailed(
                    "multiple sort clauses".to_string(),
                ));
            }
            query.sort = Some(Sort {
                field: field.to_string(),
                direction,
            });
            continue;
        }
        if let Some(kind) = token.text.strip_prefix("kind:") {
            query.kind = Some(kind.to_string());
            continue;
        }
        if let Some((field, raw_value)) = token.text.split_once(':') {
            if is_field_name(field) {
                let (op, value) = CompareOp::split(raw_value);
                query.filters.push(FieldFilter {
                    field: field.to_string(),
                    op,
                    value: value.to_string(),
                });
                continue;
            }
        }
        term_words.push(token.text);
    }

    if !term_words.is_empty() {
        query.term = Some(term_words.join(" "));
    }
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_grammar() {
        let q = Query::parse("deb foo in:name size:>=1048576 kind:artifact sort:size-asc").unwrap();
        assert_eq!(q.term.as_deref(), Some("deb foo"));
        assert_eq!(q.in_fields, vec!["name"]);
        assert_eq!(
            q.filters,
            vec![FieldFilter {
                field: "size".into(),
                op: CompareOp::Ge,
                value: "1048576".into(),
            }]
        );
        assert_eq!(q.kind.as_deref(), Some("artifact"));
        assert_eq!(
            q.sort,
            Some(Sort {
                field: "size".into(),
                direction: SortDirection::Asc,
            })
        );
    }

    #[test]
    fn serialize_then_parse_is_identity() {
        let q = QueryBuilder::new()
            .term("deb foo")
            .in_field("name")
            .filter("size", CompareOp::Ge, "1048576")
            .kind("artifact")
            .sort("size", SortDirection::Asc)
            .build();
        let text = q.to_string();
        assert_eq!(Query::parse(&text).unwrap(), q);
    }

    #[test]
    fn operators_match_longest_first() {
        let q = Query::parse("size:>=10").unwrap();
        assert_eq!(q.filters[0].op, CompareOp::Ge);
        let q = Query::parse("size:>10").unwrap();
        assert_eq!(q.filters[0].op, CompareOp::Gt);
        let q = Query::parse("size:!=10").unwrap();
        assert_eq!(q.filters[0].op, CompareOp::Ne);
        let q = Query::parse("status:queued").unwrap();
        assert_eq!(q.filters[0].op, CompareOp::Eq);
        assert_eq!(q.filters[0].value, "queued");
    }

    #[test]
    fn explicit_equals_is_accepted() {
        let q = Query::parse("status:=queued").unwrap();
        assert_eq!(q.filters[0].op, CompareOp::Eq);
        assert_eq!(q.filters[0].value, "queued");
    }

    #[test]
    fn quoted_terms_keep_whitespace_and_escapes() {
        let q = Query::parse(r#""hello world" tail"#).unwrap();
        assert_eq!(q.term.as_deref(), Some("hello world tail"));
        let q = Query::parse(r#""say \"hi\"""#).unwrap();
        assert_eq!(q.term.as_deref(), Some(r#"say "hi""#));
    }

    #[test]
    fn quoted_token_is_never_a_filter() {
        let q = Query::parse(r#""in:name""#).unwrap();
        assert_eq!(q.term.as_deref(), Some("in:name"));
        assert!(q.in_fields.is_empty());
        // And it survives a round trip.
        assert_eq!(Query::parse(&q.to_string()).unwrap(), q);
    }

    #[test]
    fn equality_values_with_operator_prefixes_round_trip() {
        let q = QueryBuilder::new()
            .filter("note", CompareOp::Eq, ">important")
            .build();
        assert_eq!(Query::parse(&q.to_string()).unwrap(), q);
    }

    #[test]
    fn quoted_filter_value_keeps_whitespace() {
        let q = Query::parse(r#"name:"foo bar""#).unwrap();
        assert_eq!(q.filters[0].field, "name");
        assert_eq!(q.filters[0].op, CompareOp::Eq);
        assert_eq!(q.filters[0].value, "foo bar");
        assert_eq!(Query::parse(&q.to_string()).unwrap(), q);
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(Query::parse(r#""dangling"#).is_err());
    }

    #[test]
    fn multiple_sorts_are_rejected() {
        assert!(Query::parse("sort:a-asc sort:b-desc").is_err());
    }

    #[test]
    fn default_sort_is_newest_first() {
        let q = Query::parse("foo").unwrap();
        let sort = q.effective_sort();
        assert_eq!(sort.field, "created_at");
        assert_eq!(sort.direction, SortDirection::Desc);
    }

    #[test]
    fn cursor_round_trips_and_rejects_garbage() {
        let c = Cursor {
            sort_field: "size".into(),
            boundary_value: "1048576".into(),
            boundary_id: "0192f0".into(),
            direction: SortDirection::Asc,
        };
        let token = c.encode();
        assert_eq!(Cursor::decode(&token).unwrap(), c);
        assert!(Cursor::decode("zz-not-hex").is_err());
    }

    #[test]
    fn page_limit_is_clamped() {
        let page = Page {
            cursor: None,
            limit: Some(10_000),
        };
        assert!(page.effective_limit() <= crate::limits::limits().max_page_size);
    }

    #[test]
    fn sort_field_may_contain_hyphens() {
        let q = Query::parse("sort:created-at-desc").unwrap();
        assert_eq!(
            q.sort,
            Some(Sort {
                field: "created-at".into(),
                direction: SortDirection::Desc,
            })
        );
    }
}
