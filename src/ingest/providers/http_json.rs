// src/ingest/providers/http_json.rs
//! Search-style JSON API: one GET with an OR'd identity query, a `max_results`
//! page size and, in cursor mode, a `since_id` lower bound.
//!
//! There is no pagination. A cursor fetch asks for a full page of
//! `MAX_RESULTS_CAP`; if more than that arrived since the watermark, the
//! overflow is never seen, so a full page is logged and counted. Backfill asks
//! for `per_source` per identity, which only bounds each identity when the
//! request names one (the coordinator backfills identities one at a time).
//!
//! Accepted response shapes: `{"data": [...]}` or a bare array. Each item needs
//! `id` (decimal string or integer), an identity field (`author`, `author_id`,
//! `source` or `account`) and optional `text`. Items that fail validation are
//! dropped one by one; a body that is not JSON fails the whole fetch.

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::ids::ItemId;
use crate::ingest::normalize_text;
use crate::ingest::types::{FeedProvider, FetchCursor, FetchRequest, FetchedItem};

/// Largest page the upstream serves in one call.
pub const MAX_RESULTS_CAP: usize = 100;

pub struct HttpJsonProvider {
    name: &'static str,
    endpoint: String,
    url: String,
    query_prefix: String,
    bearer_token: Option<String>,
    client: Client,
}

impl HttpJsonProvider {
    pub fn new(name: &'static str, endpoint: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name,
            endpoint: endpoint.into(),
            url: url.into(),
            query_prefix: "from:".to_string(),
            bearer_token: None,
            client: Client::new(),
        }
    }

    /// Build from config; the bearer token is read from the env var the config names.
    pub fn from_config(name: &'static str, default_endpoint: &str, cfg: &ProviderConfig) -> Self {
        let endpoint = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| default_endpoint.to_string());
        let mut p = Self::new(name, endpoint, cfg.url.clone()).with_query_prefix(&cfg.query_prefix);
        if let Some(var) = &cfg.bearer_token_env {
            match std::env::var(var) {
                Ok(tok) if !tok.trim().is_empty() => p.bearer_token = Some(tok),
                _ => tracing::warn!(provider = name, env = %var, "bearer token env var not set"),
            }
        }
        p
    }

    pub fn with_query_prefix(mut self, prefix: &str) -> Self {
        self.query_prefix = prefix.to_string();
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn build_query(&self, external_ids: &[String]) -> String {
        external_ids
            .iter()
            .map(|id| format!("{}{}", self.query_prefix, id))
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    fn query_params(&self, req: &FetchRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![("query", self.build_query(&req.external_ids))];
        match &req.cursor {
            FetchCursor::Since(id) => {
                params.push(("since_id", id.to_string()));
                params.push(("max_results", MAX_RESULTS_CAP.to_string()));
            }
            FetchCursor::Backfill { per_source } => {
                let n = per_source
                    .saturating_mul(req.external_ids.len().max(1))
                    .clamp(1, MAX_RESULTS_CAP);
                params.push(("max_results", n.to_string()));
            }
        }
        params
    }
}

/// Parse a response body into items, dropping malformed entries individually.
pub fn parse_items(provider: &str, body: &str) -> Result<Vec<FetchedItem>> {
    let root: Value = serde_json::from_str(body)
        .map_err(|e| Error::MalformedPayload(format!("{provider}: response is not JSON: {e}")))?;
    let raw_items = match root {
        Value::Array(v) => v,
        Value::Object(mut m) => match m.remove("data") {
            Some(Value::Array(v)) => v,
            // No results is reported as a missing or null data field.
            None | Some(Value::Null) => Vec::new(),
            Some(other) => {
                return Err(Error::MalformedPayload(format!(
                    "{provider}: 'data' is not an array: {other}"
                )))
            }
        },
        other => {
            return Err(Error::MalformedPayload(format!(
                "{provider}: unexpected response root: {other}"
            )))
        }
    };

    let mut out = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        match parse_item(&raw) {
            Ok(item) => out.push(item),
            Err(e) => {
                tracing::warn!(target: "poll", provider, error = %e, "dropping malformed item");
                counter!("ingest_malformed_items_total", "provider" => provider.to_string())
                    .increment(1);
            }
        }
    }
    Ok(out)
}

fn parse_item(raw: &Value) -> Result<FetchedItem> {
    let id = match raw.get("id") {
        Some(Value::String(s)) => ItemId::parse(s)?,
        Some(Value::Number(n)) if n.is_u64() => ItemId::parse(&n.to_string())?,
        _ => return Err(Error::MalformedPayload(format!("missing or invalid id: {raw}"))),
    };
    let identity = ["author", "author_id", "source", "account"]
        .iter()
        .find_map(|k| raw.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::MalformedPayload(format!("item {id} has no identity field")))?;
    let text = raw
        .get("text")
        .and_then(Value::as_str)
        .map(normalize_text)
        .unwrap_or_default();

    Ok(FetchedItem {
        id,
        source_external_id: identity.to_string(),
        text,
        payload: raw.clone(),
    })
}

#[async_trait]
impl FeedProvider for HttpJsonProvider {
    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<FetchedItem>> {
        let t0 = std::time::Instant::now();
        let mut rb = self.client.get(&self.url).query(&self.query_params(req));
        if let Some(tok) = &self.bearer_token {
            rb = rb.bearer_auth(tok);
        }

        let resp = rb.send().await.map_err(|e| {
            counter!("ingest_provider_errors_total", "provider" => self.name).increment(1);
            Error::provider(&self.endpoint, e)
        })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            counter!("ingest_provider_rate_limited_total", "provider" => self.name).increment(1);
            return Err(Error::ProviderRateLimited {
                endpoint: self.endpoint.clone(),
            });
        }
        if !status.is_success() {
            counter!("ingest_provider_errors_total", "provider" => self.name).increment(1);
            return Err(Error::provider(&self.endpoint, format!("HTTP {status}")));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| Error::provider(&self.endpoint, e))?;
        let items = parse_items(self.name, &body)?;
        if matches!(req.cursor, FetchCursor::Since(_)) && items.len() >= MAX_RESULTS_CAP {
            tracing::warn!(
                target: "poll",
                provider = self.name,
                endpoint = %self.endpoint,
                page = MAX_RESULTS_CAP,
                "cursor page came back full; older new items may be skipped"
            );
            counter!("ingest_full_pages_total", "provider" => self.name).increment(1);
        }

        histogram!("ingest_fetch_ms", "provider" => self.name)
            .record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("ingest_events_total", "provider" => self.name).increment(items.len() as u64);
        Ok(items)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn endpoint_key(&self) -> &str {
        &self.endpoint
    }

    fn query_cost(&self, external_id: &str) -> usize {
        self.query_prefix.len() + external_id.len() + " OR ".len()
    }
}
