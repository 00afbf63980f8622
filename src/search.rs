//! Contact search: query parsing and the search index client.
//!
//! Queries are parsed and validated against the org's fields before
//! anything is sent to the index, so a bad query fails the operation
//! fast (an unparsable start query marks the start failed and enqueues
//! nothing).

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::assets::OrgAssets;
use crate::error::{FlowhubError, Result};
use crate::models::{ContactId, GroupId};

/// Attributes every contact has, addressable without an org field.
const ATTRIBUTES: &[&str] = &[
    "uuid", "id", "name", "language", "urn", "group", "status", "created_on", "last_seen_on",
];

/// URN schemes addressable as query keys, e.g. `tel = "+125593"`.
const SCHEMES: &[&str] = &["tel", "twitter", "whatsapp", "facebook", "telegram", "mailto"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    NotEq,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    fn parse(op: &str) -> Option<Comparator> {
        match op {
            "=" => Some(Comparator::Eq),
            "!=" => Some(Comparator::NotEq),
            "~" => Some(Comparator::Contains),
            ">" => Some(Comparator::Gt),
            ">=" => Some(Comparator::Gte),
            "<" => Some(Comparator::Lt),
            "<=" => Some(Comparator::Lte),
            _ => None,
        }
    }
}

/// A parsed, field-validated query.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedQuery {
    Condition {
        key: String,
        comparator: Comparator,
        value: String,
    },
    And(Vec<ParsedQuery>),
    Or(Vec<ParsedQuery>),
}

/// Parses and validates a contact query against the org's assets.
/// Unknown properties are an error, never silently ignored.
pub fn parse_query(assets: &OrgAssets, query: &str) -> Result<ParsedQuery> {
    let tokens = tokenize(query)?;
    let mut parser = Parser { tokens, pos: 0 };
    let parsed = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(FlowhubError::Search(format!("unable to parse query: {query}")));
    }
    validate(assets, &parsed)?;
    Ok(parsed)
}

fn validate(assets: &OrgAssets, query: &ParsedQuery) -> Result<()> {
    match query {
        ParsedQuery::Condition { key, .. } => {
            let known = ATTRIBUTES.contains(&key.as_str())
                || SCHEMES.contains(&key.as_str())
                || assets.field_by_key(key).is_some();
            if !known {
                return Err(FlowhubError::Search(format!("unknown property: {key}")));
            }
            Ok(())
        }
        ParsedQuery::And(children) | ParsedQuery::Or(children) => {
            children.iter().try_for_each(|c| validate(assets, c))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Text(String),
    Op(String),
    LParen,
    RParen,
    And,
    Or,
}

fn tokenize(query: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => text.push(c),
                        None => {
                            return Err(FlowhubError::Search("unterminated string".to_string()))
                        }
                    }
                }
                tokens.push(Token::Text(text));
            }
            '=' | '~' => {
                chars.next();
                tokens.push(Token::Op(c.to_string()));
            }
            '!' | '<' | '>' => {
                chars.next();
                let mut op = c.to_string();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    op.push('=');
                }
                tokens.push(Token::Op(op));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "()=~!<>\"".contains(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                match word.to_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Word(word)),
                }
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<ParsedQuery> {
        let mut children = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            ParsedQuery::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<ParsedQuery> {
        let mut children = vec![self.parse_atom()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.next();
                    children.push(self.parse_atom()?);
                }
                // adjacency is an implicit AND
                Some(Token::Word(_)) | Some(Token::Text(_)) | Some(Token::LParen) => {
                    children.push(self.parse_atom()?);
                }
                _ => break,
            }
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            ParsedQuery::And(children)
        })
    }

    fn parse_atom(&mut self) -> Result<ParsedQuery> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if self.next() != Some(Token::RParen) {
                    return Err(FlowhubError::Search("expected closing paren".to_string()));
                }
                Ok(inner)
            }
            Some(Token::Word(word)) => {
                if let Some(Token::Op(_)) = self.peek() {
                    let Some(Token::Op(op)) = self.next() else { unreachable!() };
                    let comparator = Comparator::parse(&op)
                        .ok_or_else(|| FlowhubError::Search(format!("unknown comparator: {op}")))?;
                    let value = match self.next() {
                        Some(Token::Word(v)) | Some(Token::Text(v)) => v,
                        _ => return Err(FlowhubError::Search("expected value".to_string())),
                    };
                    Ok(ParsedQuery::Condition {
                        key: word.to_lowercase(),
                        comparator,
                        value,
                    })
                } else {
                    // a bare word matches on name or URN
                    Ok(ParsedQuery::Condition {
                        key: "name".to_string(),
                        comparator: Comparator::Contains,
                        value: word,
                    })
                }
            }
            Some(Token::Text(text)) => Ok(ParsedQuery::Condition {
                key: "name".to_string(),
                comparator: Comparator::Contains,
                value: text,
            }),
            other => Err(FlowhubError::Search(format!("unexpected token: {other:?}"))),
        }
    }
}

/// Renders a parsed query as the index's query DSL.
pub fn to_index_query(query: &ParsedQuery) -> serde_json::Value {
    match query {
        ParsedQuery::Condition { key, comparator, value } => match comparator {
            Comparator::Eq => json!({"term": {key.as_str(): value}}),
            Comparator::NotEq => json!({"bool": {"must_not": {"term": {key.as_str(): value}}}}),
            Comparator::Contains => json!({"match": {key.as_str(): value}}),
            Comparator::Gt => json!({"range": {key.as_str(): {"gt": value}}}),
            Comparator::Gte => json!({"range": {key.as_str(): {"gte": value}}}),
            Comparator::Lt => json!({"range": {key.as_str(): {"lt": value}}}),
            Comparator::Lte => json!({"range": {key.as_str(): {"lte": value}}}),
        },
        ParsedQuery::And(children) => {
            json!({"bool": {"must": children.iter().map(to_index_query).collect::<Vec<_>>()}})
        }
        ParsedQuery::Or(children) => {
            json!({"bool": {"should": children.iter().map(to_index_query).collect::<Vec<_>>()}})
        }
    }
}

/// The contact search index.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Contact ids matching the query within the org (and group, when
    /// given), in index order.
    async fn contact_ids(
        &self,
        assets: &OrgAssets,
        group_id: Option<GroupId>,
        query: &ParsedQuery,
        limit: i64,
    ) -> Result<Vec<ContactId>>;
}

/// HTTP client for the search index.
pub struct HttpSearchClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSearchClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> HttpSearchClient {
        HttpSearchClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn contact_ids(
        &self,
        assets: &OrgAssets,
        group_id: Option<GroupId>,
        query: &ParsedQuery,
        limit: i64,
    ) -> Result<Vec<ContactId>> {
        let mut must = vec![
            json!({"term": {"org_id": assets.org_id()}}),
            json!({"term": {"is_active": true}}),
            to_index_query(query),
        ];
        if let Some(group_id) = group_id {
            must.push(json!({"term": {"group_ids": group_id}}));
        }

        let body = json!({
            "_source": false,
            "query": {"bool": {"must": must}},
            "sort": [{"id": "asc"}],
            "size": limit,
        });

        debug!(org_id = assets.org_id(), "querying contact index");

        let response = self
            .http
            .post(format!("{}/contacts/_search", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FlowhubError::Search(format!(
                "index returned status {}",
                response.status()
            )));
        }

        let parsed: serde_json::Value = response.json().await?;
        let hits = parsed["hits"]["hits"]
            .as_array()
            .ok_or_else(|| FlowhubError::Search("malformed index response".to_string()))?;

        hits.iter()
            .map(|h| {
                h["_id"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| h["_id"].as_i64())
                    .ok_or_else(|| FlowhubError::Search("malformed hit id".to_string()))
            })
            .collect()
    }
}

/// A canned search client for tests.
#[derive(Default)]
pub struct MockSearchClient {
    responses: std::sync::Mutex<Vec<Vec<ContactId>>>,
}

impl MockSearchClient {
    pub fn new() -> MockSearchClient {
        MockSearchClient::default()
    }

    pub fn add_response(&self, contact_ids: Vec<ContactId>) {
        self.responses.lock().unwrap().push(contact_ids);
    }
}

#[async_trait]
impl SearchClient for MockSearchClient {
    async fn contact_ids(
        &self,
        _assets: &OrgAssets,
        _group_id: Option<GroupId>,
        _query: &ParsedQuery,
        _limit: i64,
    ) -> Result<Vec<ContactId>> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Ok(Vec::new());
        }
        Ok(responses.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::orgs::{Org, OrgConfig};
    use crate::models::Field;
    use uuid::Uuid;

    fn assets_with_field(key: &str) -> OrgAssets {
        let mut assets = OrgAssets::for_tests(Org {
            id: 1,
            name: "Org".to_string(),
            is_active: true,
            config: OrgConfig::default(),
        });
        assets.add_field_for_tests(Field {
            id: 1,
            uuid: Uuid::new_v4(),
            org_id: 1,
            key: key.to_string(),
            name: key.to_string(),
            field_type: "T".to_string(),
        });
        assets
    }

    #[test]
    fn parses_conditions_and_boolean_combinations() {
        let assets = assets_with_field("age");

        let query = parse_query(&assets, r#"name ~ "bob" AND age > 35"#).unwrap();
        assert_eq!(
            query,
            ParsedQuery::And(vec![
                ParsedQuery::Condition {
                    key: "name".to_string(),
                    comparator: Comparator::Contains,
                    value: "bob".to_string(),
                },
                ParsedQuery::Condition {
                    key: "age".to_string(),
                    comparator: Comparator::Gt,
                    value: "35".to_string(),
                },
            ])
        );

        // bare words search names
        let query = parse_query(&assets, "bob").unwrap();
        assert_eq!(
            query,
            ParsedQuery::Condition {
                key: "name".to_string(),
                comparator: Comparator::Contains,
                value: "bob".to_string(),
            }
        );

        // parens and OR
        let query = parse_query(&assets, r#"(age = 1 OR age = 2) AND tel = "+1234""#).unwrap();
        match query {
            ParsedQuery::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn unknown_property_is_an_error() {
        let assets = assets_with_field("age");
        let err = parse_query(&assets, "xyz = 45").unwrap_err();
        assert!(err.to_string().contains("unknown property: xyz"), "{err}");
    }

    #[test]
    fn malformed_queries_error() {
        let assets = assets_with_field("age");
        assert!(parse_query(&assets, r#"name = "unterminated"#).is_err());
        assert!(parse_query(&assets, "(age = 1").is_err());
        assert!(parse_query(&assets, "age =").is_err());
    }

    #[test]
    fn renders_index_dsl() {
        let assets = assets_with_field("age");
        let query = parse_query(&assets, "age >= 18 AND name ~ jo").unwrap();
        let dsl = to_index_query(&query);
        assert_eq!(dsl["bool"]["must"][0]["range"]["age"]["gte"], "18");
        assert_eq!(dsl["bool"]["must"][1]["match"]["name"], "jo");
    }
}
