use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::schema::mapping::parse_metafield_path;
use crate::schema::RemoteEntity;

/// One page of remote records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    /// Cursor of the next page; `None` on the last page
    pub next_cursor: Option<String>,
}

/// Pages through the records of one remote entity.
///
/// Records are JSON objects shaped like the field paths: `seo.title` is read
/// from `{"seo": {"title": ..}}` and `metafields.ns.key` from
/// `{"metafields": {"ns": {"key": ..}}}`.
#[async_trait]
pub trait RemoteRecordSource: Send + Sync {
    async fn fetch_page(
        &self,
        entity: &RemoteEntity,
        fields: &[String],
        cursor: Option<&str>,
    ) -> Result<Page>;
}

#[derive(Default)]
struct Selection(BTreeMap<String, Selection>);

impl Selection {
    fn insert(&mut self, path: &str) {
        let mut node = self;
        for part in path.split('.') {
            node = node.0.entry(part.to_string()).or_default();
        }
    }

    fn render(&self, out: &mut String) {
        for (name, children) in &self.0 {
            out.push(' ');
            out.push_str(name);
            if !children.0.is_empty() {
                out.push_str(" {");
                children.render(out);
                out.push_str(" }");
            }
        }
    }
}

fn metafield_alias(namespace: &str, key: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    };
    format!("mf_{}__{}", sanitize(namespace), sanitize(key))
}

/// Builds the cursor-paged query for `entity` selecting `fields`.
pub fn build_query(entity: &RemoteEntity, fields: &[String]) -> String {
    let mut selection = Selection::default();
    selection.insert("id");
    let mut metafields = Vec::new();
    for field in fields {
        match parse_metafield_path(field) {
            Some((namespace, key)) => metafields.push(format!(
                " {}: metafield(namespace: {}, key: {}) {{ value }}",
                metafield_alias(namespace, key),
                json!(namespace),
                json!(key)
            )),
            None => selection.insert(field),
        }
    }

    let mut nodes = String::new();
    selection.render(&mut nodes);
    metafields.sort();
    metafields.dedup();
    for metafield in metafields {
        nodes.push_str(&metafield);
    }

    format!(
        "query Sync($first: Int!, $after: String) {{ {}(first: $first, after: $after) {{ pageInfo {{ hasNextPage endCursor }} nodes {{{} }} }} }}",
        entity.root_field, nodes
    )
}

/// Moves aliased metafield values into the nested `metafields` object.
pub fn normalize_record(mut node: Value, fields: &[String]) -> Value {
    let Some(object) = node.as_object_mut() else {
        return node;
    };
    let mut metafields = Map::new();
    for field in fields {
        let Some((namespace, key)) = parse_metafield_path(field) else {
            continue;
        };
        let value = object
            .remove(&metafield_alias(namespace, key))
            .and_then(|v| v.get("value").cloned())
            .unwrap_or(Value::Null);
        let namespace_entry = metafields
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(keys) = namespace_entry.as_object_mut() {
            keys.insert(key.to_string(), value);
        }
    }
    if !metafields.is_empty() {
        object.insert("metafields".to_string(), Value::Object(metafields));
    }
    node
}

/// Parses a GraphQL response body into a page of normalized records.
pub fn parse_page(entity: &RemoteEntity, fields: &[String], body: Value) -> Result<Page> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect();
            bail!("GraphQL errors: {}", messages.join("; "));
        }
    }

    let connection = body
        .get("data")
        .and_then(|data| data.get(entity.root_field))
        .ok_or_else(|| anyhow!("Response has no data.{}", entity.root_field))?;
    let records = connection
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|node| normalize_record(node, fields))
        .collect();

    let page_info = connection.get("pageInfo");
    let has_next = page_info
        .and_then(|info| info.get("hasNextPage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next_cursor = if has_next {
        page_info
            .and_then(|info| info.get("endCursor"))
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        None
    };

    Ok(Page {
        records,
        next_cursor,
    })
}

/// Reads records from the platform's GraphQL admin endpoint.
pub struct GraphqlRecordSource {
    client: reqwest::Client,
    endpoint: String,
    token_header: String,
    access_token: Option<String>,
    page_size: usize,
}

impl GraphqlRecordSource {
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let endpoint = config
            .graphql_endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .context("No GraphQL endpoint configured")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            token_header: config.token_header.clone(),
            access_token: config.access_token.clone(),
            page_size: config.page_size.clamp(1, 250),
        })
    }
}

#[async_trait]
impl RemoteRecordSource for GraphqlRecordSource {
    async fn fetch_page(
        &self,
        entity: &RemoteEntity,
        fields: &[String],
        cursor: Option<&str>,
    ) -> Result<Page> {
        let body = json!({
            "query": build_query(entity, fields),
            "variables": { "first": self.page_size, "after": cursor },
        });
        debug!(entity = entity.name, ?cursor, "Fetching remote page");

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.access_token {
            request = request.header(self.token_header.as_str(), token.as_str());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", self.endpoint))?
            .error_for_status()?;
        let body: Value = response.json().await.context("Invalid GraphQL response")?;
        parse_page(entity, fields, body)
    }
}
