use crate::fetch::client::HttpClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

/// An [`HttpClient`] wrapper that adds a fixed set of headers to every request.
///
/// Header names and values are validated once at construction so that a bad
/// `--headers` argument fails before any download starts.
pub struct WithHeaders<C> {
    inner: C,
    headers: HeaderMap,
}

impl<C> WithHeaders<C> {
    pub fn new(inner: C, headers: &BTreeMap<String, String>) -> Result<Self> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name:?}"))?;
            let header_value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name:?}"))?;
            map.insert(header_name, header_value);
        }
        Ok(Self { inner, headers: map })
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for WithHeaders<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        for (name, value) in &self.headers {
            req.headers_mut().insert(name.clone(), value.clone());
        }
        self.inner.execute(req).await
    }
}
