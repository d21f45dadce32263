//! Aggregated API documentation
//!
//! Each upstream publishes its own Swagger 2 or OpenAPI 3 document. The
//! aggregator fetches them in order, drops per-operation `security`, merges
//! paths and schemas into one namespace under the configured collision
//! policy and rewrites every `$ref` into `#/components/schemas/`.

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::config::{GatewayConfig, MergePolicy};
use crate::error::GatewayError;

const LEGACY_SCHEMA_PREFIX: &str = "#/definitions/";
const SCHEMA_PREFIX: &str = "#/components/schemas/";
const BEARER_SCHEME: &str = "BearerAuth";

/// Callback for [`walk_mut`]
pub trait Visitor {
    /// Called for every entry of every object, before descending into it
    fn visit_entry(&mut self, key: &str, value: &mut Value);
}

/// Depth-first walk over every object entry and array element of `value`
pub fn walk_mut<V: Visitor + ?Sized>(value: &mut Value, visitor: &mut V) {
    match value {
        Value::Object(object) => {
            for (key, child) in object.iter_mut() {
                visitor.visit_entry(key, child);
                walk_mut(child, visitor);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_mut(item, visitor);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

/// Rewrites `$ref` values from one prefix to another
#[derive(Debug)]
pub struct RefRewriter<'a> {
    from: &'a str,
    to: &'a str,
    /// Number of references rewritten so far
    pub rewritten: usize,
}

impl<'a> RefRewriter<'a> {
    #[must_use]
    pub const fn new(from: &'a str, to: &'a str) -> Self {
        Self {
            from,
            to,
            rewritten: 0,
        }
    }
}

impl Visitor for RefRewriter<'_> {
    fn visit_entry(&mut self, key: &str, value: &mut Value) {
        if key != "$ref" {
            return;
        }
        if let Value::String(reference) = value {
            if let Some(name) = reference.strip_prefix(self.from) {
                *reference = format!("{}{name}", self.to);
                self.rewritten += 1;
            }
        }
    }
}

/// Remove `security` from every operation of every path item
pub fn strip_operation_security(paths: &mut Map<String, Value>) {
    for item in paths.values_mut() {
        let Value::Object(operations) = item else {
            continue;
        };
        for operation in operations.values_mut() {
            if let Value::Object(operation) = operation {
                operation.remove("security");
            }
        }
    }
}

/// Schemas of an OpenAPI 3 (`components.schemas`) or Swagger 2
/// (`definitions`) document
#[must_use]
pub fn extract_schemas(document: &mut Value) -> Map<String, Value> {
    let from_components = document
        .get_mut("components")
        .and_then(|components| components.get_mut("schemas"))
        .and_then(Value::as_object_mut)
        .map(std::mem::take);

    from_components
        .or_else(|| {
            document
                .get_mut("definitions")
                .and_then(Value::as_object_mut)
                .map(std::mem::take)
        })
        .unwrap_or_default()
}

/// Merge `source` into `target` under `policy`
pub fn merge_maps(
    target: &mut Map<String, Value>,
    source: Map<String, Value>,
    policy: MergePolicy,
    kind: &'static str,
    origin: &str,
) -> Result<(), GatewayError> {
    for (key, value) in source {
        if target.contains_key(&key) {
            warn!(kind, key = %key, origin, ?policy, "Duplicate key in upstream API documents");
            match policy {
                MergePolicy::LastWins => {}
                MergePolicy::FirstWins => continue,
                MergePolicy::Reject => return Err(GatewayError::DocMergeConflict { kind, key }),
            }
        }
        target.insert(key, value);
    }
    Ok(())
}

/// Where one upstream document is fetched from
#[derive(Debug, Clone)]
pub struct DocSource {
    pub name: String,
    pub url: String,
}

/// Builds the merged API document on demand; nothing is cached
#[derive(Debug, Clone)]
pub struct DocAggregator {
    client: reqwest::Client,
    sources: Vec<DocSource>,
    policy: MergePolicy,
    title: String,
    version: String,
    server_url: String,
}

impl DocAggregator {
    pub fn from_config(config: &GatewayConfig, client: reqwest::Client) -> Result<Self> {
        let sources = config
            .docs
            .sources
            .iter()
            .map(|name| {
                let base = config
                    .upstreams
                    .get(name)
                    .with_context(|| format!("docs source {name} is not a configured upstream"))?;
                Ok(DocSource {
                    name: name.clone(),
                    url: format!(
                        "{}{}",
                        base.trim_end_matches('/'),
                        config.docs.upstream_doc_path
                    ),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            client,
            sources,
            policy: config.docs.merge_policy,
            title: config.docs.title.clone(),
            version: config.docs.version.clone(),
            server_url: config.docs.server_url.clone(),
        })
    }

    #[must_use]
    pub fn sources(&self) -> &[DocSource] {
        &self.sources
    }

    /// Fetch every source in order and merge them
    pub async fn aggregate(&self) -> Result<Value, GatewayError> {
        let mut documents = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            documents.push((source.name.clone(), self.fetch(source).await?));
        }
        self.merge(documents)
    }

    async fn fetch(&self, source: &DocSource) -> Result<Value, GatewayError> {
        let unavailable = |reason: String| GatewayError::UpstreamDocUnavailable {
            upstream: source.name.clone(),
            reason,
        };

        let response = self
            .client
            .get(&source.url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("{} returned {status}", source.url)));
        }

        let document = response
            .json::<Value>()
            .await
            .map_err(|e| unavailable(format!("invalid document: {e}")))?;
        debug!(upstream = %source.name, "Fetched upstream API document");
        Ok(document)
    }

    /// Merge already fetched `(source name, document)` pairs, in order
    pub fn merge(&self, documents: Vec<(String, Value)>) -> Result<Value, GatewayError> {
        let mut paths = Map::new();
        let mut schemas = Map::new();

        for (origin, mut document) in documents {
            let mut doc_paths = document
                .get_mut("paths")
                .and_then(Value::as_object_mut)
                .map(std::mem::take)
                .unwrap_or_default();
            strip_operation_security(&mut doc_paths);

            merge_maps(&mut paths, doc_paths, self.policy, "path", &origin)?;
            merge_maps(
                &mut schemas,
                extract_schemas(&mut document),
                self.policy,
                "schema",
                &origin,
            )?;
        }

        let mut merged = json!({
            "openapi": "3.0.0",
            "info": {
                "title": self.title,
                "version": self.version,
            },
            "servers": [
                {"url": self.server_url, "description": "API Gateway"}
            ],
            "paths": paths,
            "components": {
                "schemas": schemas,
                "securitySchemes": {
                    BEARER_SCHEME: {
                        "type": "http",
                        "scheme": "bearer",
                        "bearerFormat": "JWT",
                    }
                }
            },
            "security": [{BEARER_SCHEME: []}],
        });

        let mut rewriter = RefRewriter::new(LEGACY_SCHEMA_PREFIX, SCHEMA_PREFIX);
        walk_mut(&mut merged, &mut rewriter);
        debug!(rewritten = rewriter.rewritten, "Merged API documents");

        Ok(merged)
    }
}
