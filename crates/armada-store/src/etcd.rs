//! etcd v2 keys API over HTTP.
//!
//! Requests rotate over the configured endpoints; a transport failure or a
//! 5xx answer moves to the next endpoint, and a full pass of failures backs
//! off per [`RetryPolicy`]. Watches are long-poll GETs with `wait=true` and
//! carry no request timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::kv::{Condition, KeyValue, PutOptions, Store, WatchEvent, WatchEventKind};
use crate::retry::RetryPolicy;

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

const CODE_KEY_NOT_FOUND: u32 = 100;
const CODE_TEST_FAILED: u32 = 101;
const CODE_NODE_EXIST: u32 = 105;
const CODE_EVENT_INDEX_CLEARED: u32 = 401;

#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            request_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// [`Store`] backed by an etcd cluster speaking the v2 API.
#[derive(Clone)]
pub struct EtcdStore {
    http: reqwest::Client,
    endpoints: Arc<Vec<String>>,
    next: Arc<AtomicUsize>,
    request_timeout: Duration,
    retry: RetryPolicy,
}

/// One logical request, replayable across endpoints.
struct Call {
    method: Method,
    key: String,
    query: Vec<(&'static str, String)>,
    form: Vec<(&'static str, String)>,
    wait: bool,
}

impl Call {
    fn new(method: Method, key: &str) -> Self {
        Self {
            method,
            key: key.to_string(),
            query: Vec::new(),
            form: Vec::new(),
            wait: false,
        }
    }

    fn query(mut self, name: &'static str, value: impl ToString) -> Self {
        self.query.push((name, value.to_string()));
        self
    }

    fn form(mut self, name: &'static str, value: impl ToString) -> Self {
        self.form.push((name, value.to_string()));
        self
    }
}

struct Reply {
    status: StatusCode,
    index: Option<u64>,
    body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    action: String,
    node: Option<ApiNode>,
    #[serde(rename = "prevNode")]
    prev_node: Option<ApiNode>,
}

#[derive(Debug, Deserialize)]
struct ApiNode {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<ApiNode>,
    #[serde(rename = "createdIndex", default)]
    created_index: u64,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
    ttl: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "errorCode")]
    error_code: u32,
    message: String,
    cause: Option<String>,
    index: Option<u64>,
}

impl EtcdStore {
    pub fn new(config: EtcdConfig) -> StoreResult<Self> {
        if config.endpoints.is_empty() {
            return Err(StoreError::Unavailable("no etcd endpoints configured".to_string()));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let endpoints = config
            .endpoints
            .iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();
        Ok(Self {
            http,
            endpoints: Arc::new(endpoints),
            next: Arc::new(AtomicUsize::new(0)),
            request_timeout: config.request_timeout,
            retry: config.retry,
        })
    }

    async fn execute(&self, call: &Call) -> StoreResult<Reply> {
        self.retry.run(|| self.send_once(call)).await
    }

    /// Try every endpoint once, starting with the last one that worked.
    async fn send_once(&self, call: &Call) -> StoreResult<Reply> {
        let start = self.next.load(Ordering::Relaxed);
        let mut last_err = StoreError::Unavailable("no endpoint tried".to_string());

        for offset in 0..self.endpoints.len() {
            let idx = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[idx];
            let url = format!("{endpoint}/v2/keys{}", key_path(&call.key));

            let mut req = self.http.request(call.method.clone(), &url).query(&call.query);
            if !call.form.is_empty() {
                req = req.form(&call.form);
            }
            if !call.wait {
                req = req.timeout(self.request_timeout);
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_err = if e.is_timeout() {
                        StoreError::Timeout
                    } else {
                        StoreError::Unavailable(e.to_string())
                    };
                    debug!(%endpoint, error = %last_err, "etcd request failed");
                    continue;
                }
            };

            let status = resp.status();
            if status.is_server_error() {
                last_err = StoreError::Unavailable(format!("{endpoint} answered {status}"));
                debug!(%endpoint, %status, "etcd endpoint unhealthy");
                continue;
            }

            let index = resp
                .headers()
                .get(ETCD_INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = match resp.bytes().await {
                Ok(body) => body.to_vec(),
                Err(e) => {
                    last_err = if e.is_timeout() {
                        StoreError::Timeout
                    } else {
                        StoreError::Unavailable(e.to_string())
                    };
                    continue;
                }
            };

            self.next.store(idx, Ordering::Relaxed);
            return Ok(Reply { status, index, body });
        }

        warn!(error = %last_err, "all etcd endpoints failed");
        Err(last_err)
    }

    async fn call(&self, call: Call) -> StoreResult<ApiResponse> {
        let reply = self.execute(&call).await?;
        decode(&call.key, &reply)
    }
}

fn key_path(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn decode(key: &str, reply: &Reply) -> StoreResult<ApiResponse> {
    if reply.status.is_success() {
        return serde_json::from_slice(&reply.body).map_err(|e| StoreError::Malformed(e.to_string()));
    }
    let err: ApiError = serde_json::from_slice(&reply.body).map_err(|e| {
        StoreError::Malformed(format!("status {} with undecodable body: {e}", reply.status))
    })?;
    Err(map_api_error(key, err))
}

fn map_api_error(key: &str, err: ApiError) -> StoreError {
    let subject = err.cause.clone().unwrap_or_else(|| key.to_string());
    match err.error_code {
        CODE_KEY_NOT_FOUND => StoreError::NotFound(subject),
        CODE_NODE_EXIST => StoreError::AlreadyExists(subject),
        CODE_TEST_FAILED => StoreError::CompareFailed {
            key: key.to_string(),
            reason: err.cause.unwrap_or(err.message),
        },
        CODE_EVENT_INDEX_CLEARED => StoreError::IndexCleared(err.index.unwrap_or_default()),
        300..=399 => StoreError::Unavailable(err.message),
        code => StoreError::Malformed(format!("etcd error {code}: {}", err.message)),
    }
}

fn to_key_value(node: &ApiNode) -> StoreResult<KeyValue> {
    Ok(KeyValue {
        key: node
            .key
            .clone()
            .ok_or_else(|| StoreError::Malformed("node without key".to_string()))?,
        value: node.value.clone().unwrap_or_default(),
        create_revision: node.created_index,
        mod_revision: node.modified_index,
        ttl: node.ttl.filter(|t| *t > 0).map(|t| Duration::from_secs(t as u64)),
    })
}

fn flatten(node: &ApiNode, out: &mut Vec<KeyValue>) -> StoreResult<()> {
    if node.dir {
        for child in &node.nodes {
            flatten(child, out)?;
        }
        return Ok(());
    }
    out.push(to_key_value(node)?);
    Ok(())
}

fn to_watch_event(resp: ApiResponse) -> StoreResult<WatchEvent> {
    let kind = match resp.action.as_str() {
        "set" | "create" | "update" | "compareAndSwap" => WatchEventKind::Put,
        "delete" | "compareAndDelete" => WatchEventKind::Delete,
        "expire" => WatchEventKind::Expire,
        other => return Err(StoreError::Malformed(format!("unknown watch action {other:?}"))),
    };
    let node = resp
        .node
        .ok_or_else(|| StoreError::Malformed("watch response without node".to_string()))?;
    Ok(WatchEvent {
        kind,
        key: node.key.clone().unwrap_or_default(),
        value: match kind {
            WatchEventKind::Put => node.value.clone(),
            _ => None,
        },
        previous: resp.prev_node.and_then(|n| n.value),
        revision: node.modified_index,
    })
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs_f64().ceil().max(1.0) as u64
}

#[async_trait]
impl Store for EtcdStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        match self.call(Call::new(Method::GET, key)).await {
            Ok(resp) => resp.node.as_ref().map(to_key_value).transpose(),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let call = Call::new(Method::GET, prefix)
            .query("recursive", true)
            .query("sorted", true);
        let resp = match self.call(call).await {
            Ok(resp) => resp,
            Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out = Vec::new();
        if let Some(node) = &resp.node {
            flatten(node, &mut out)?;
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn put(&self, key: &str, value: &str, opts: PutOptions) -> StoreResult<KeyValue> {
        let mut call = Call::new(Method::PUT, key).form("value", value);
        if let Some(ttl) = opts.ttl {
            call = call.form("ttl", ttl_secs(ttl));
        }
        call = match opts.condition {
            Condition::None => call,
            Condition::Absent => call.query("prevExist", false),
            Condition::Present => call.query("prevExist", true),
            Condition::Value(v) => call.query("prevValue", v),
            Condition::Revision(r) => call.query("prevIndex", r),
        };
        let resp = self.call(call).await?;
        let node = resp
            .node
            .as_ref()
            .ok_or_else(|| StoreError::Malformed("put response without node".to_string()))?;
        to_key_value(node)
    }

    async fn delete(&self, key: &str, condition: Condition) -> StoreResult<KeyValue> {
        let call = match condition {
            Condition::Value(v) => Call::new(Method::DELETE, key).query("prevValue", v),
            Condition::Revision(r) => Call::new(Method::DELETE, key).query("prevIndex", r),
            _ => Call::new(Method::DELETE, key),
        };
        let resp = self.call(call).await?;
        let node = resp
            .node
            .as_ref()
            .ok_or_else(|| StoreError::Malformed("delete response without node".to_string()))?;
        let mut kv = to_key_value(node)?;
        if let Some(prev) = resp.prev_node.as_ref().and_then(|n| n.value.clone()) {
            kv.value = prev;
        }
        Ok(kv)
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let call = Call::new(Method::DELETE, prefix)
            .query("recursive", true)
            .query("dir", true);
        match self.call(call).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn watch(&self, prefix: &str, after_revision: u64) -> StoreResult<WatchEvent> {
        loop {
            let mut call = Call::new(Method::GET, prefix)
                .query("wait", true)
                .query("recursive", true)
                .query("waitIndex", after_revision + 1);
            call.wait = true;

            let reply = self.execute(&call).await?;
            // etcd closes idle long-polls with an empty body.
            if reply.status.is_success() && reply.body.is_empty() {
                continue;
            }
            return to_watch_event(decode(prefix, &reply)?);
        }
    }

    async fn revision(&self) -> StoreResult<u64> {
        let reply = self.execute(&Call::new(Method::GET, "/")).await?;
        reply
            .index
            .ok_or_else(|| StoreError::Malformed(format!("response without {ETCD_INDEX_HEADER}")))
    }
}
