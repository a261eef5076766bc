// src/ingest/transport.rs
//! HTTP seam for feed fetching. Conditional headers pass through verbatim.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub retries: u32,
    pub proxy: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(30),
            retries: 0,
            proxy: None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any entry with the same name in another case.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value.into());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `Retry-After` given in seconds. HTTP-date forms are ignored.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.header("retry-after")?.trim().parse().ok()
    }
}

/// `Err` means no HTTP response was obtained at all (DNS, TLS, timeout, ...).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn request(&self, req: &HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed transport with per-proxy clients and transport-level retries.
pub struct ReqwestTransport {
    direct: Client,
    proxied: Mutex<HashMap<String, Client>>,
    user_agent: String,
    max_body_bytes: usize,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, max_body_bytes: usize) -> Result<Self> {
        let direct = Self::build_client(user_agent, None)?;
        Ok(Self {
            direct,
            proxied: Mutex::new(HashMap::new()),
            user_agent: user_agent.to_string(),
            max_body_bytes,
        })
    }

    fn build_client(user_agent: &str, proxy: Option<&str>) -> Result<Client> {
        let mut b = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(5));
        if let Some(p) = proxy {
            b = b.proxy(reqwest::Proxy::all(p).with_context(|| format!("proxy {p}"))?);
        }
        b.build().context("building http client")
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client> {
        let Some(p) = proxy else {
            return Ok(self.direct.clone());
        };
        let mut map = self
            .proxied
            .lock()
            .map_err(|_| anyhow!("proxy client map poisoned"))?;
        if let Some(c) = map.get(p) {
            return Ok(c.clone());
        }
        let c = Self::build_client(&self.user_agent, Some(p))?;
        map.insert(p.to_string(), c.clone());
        Ok(c)
    }

    async fn send_once(&self, client: &Client, req: &HttpRequest) -> Result<HttpResponse> {
        let mut rb = client
            .request(req.method.clone(), &req.url)
            .timeout(req.timeout);
        for (k, v) in &req.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        let mut rsp = rb.send().await.context("http send")?;

        let status = rsp.status().as_u16();
        let headers = rsp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        if let Some(len) = rsp.content_length() {
            if len as usize > self.max_body_bytes {
                return Err(anyhow!(
                    "response body of {len} bytes exceeds limit of {}",
                    self.max_body_bytes
                ));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = rsp.chunk().await.context("reading body")? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(anyhow!(
                    "response body exceeds limit of {} bytes",
                    self.max_body_bytes
                ));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(&self, req: &HttpRequest) -> Result<HttpResponse> {
        let client = self.client_for(req.proxy.as_deref())?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let res = self.send_once(&client, req).await;
            let retryable = match &res {
                Ok(rsp) => rsp.status >= 500,
                Err(_) => true,
            };
            if retryable && attempt <= req.retries {
                tracing::debug!(url = %req.url, attempt, "transport retry");
                tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1).min(6))).await;
                continue;
            }
            return res;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut req = HttpRequest::get("https://a.test/feed");
        req.headers
            .insert("If-None-Match".to_string(), "\"v1\"".to_string());
        assert_eq!(req.header("if-none-match"), Some("\"v1\""));
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut rsp = HttpResponse {
            status: 503,
            ..Default::default()
        };
        rsp.headers.insert("retry-after".into(), " 120 ".into());
        assert_eq!(rsp.retry_after_secs(), Some(120));
        rsp.headers
            .insert("retry-after".into(), "Wed, 21 Oct 2015 07:28:00 GMT".into());
        assert_eq!(rsp.retry_after_secs(), None);
    }
}
