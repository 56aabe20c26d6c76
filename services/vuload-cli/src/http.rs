//! HTTP iteration: one request per iteration against the configured target.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use vuload_core::{CheckConfig, CoreError, CoreResult, TargetConfig};
use vuload_engine::{Iteration, IterationContext, IterationResult};

pub struct HttpIteration {
    client: Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<String>,
    checks: CheckConfig,
}

impl HttpIteration {
    pub fn new(target: &TargetConfig) -> CoreResult<Self> {
        let url = Url::parse(&target.url)
            .map_err(|e| CoreError::invalid_config(format!("target.url `{}`: {}", target.url, e)))?;

        let method = Method::from_bytes(target.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| CoreError::invalid_config(format!("target.method `{}` is invalid", target.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CoreError::invalid_config(format!("header `{}`: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CoreError::invalid_config(format!("header `{}`: {}", name, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(target.timeout)
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            method,
            url,
            headers,
            body: target.body.clone(),
            checks: target.checks.clone(),
        })
    }

    fn configured_checks(&self) -> u32 {
        u32::from(self.checks.expect_status.is_some()) + u32::from(self.checks.max_response_time.is_some())
    }

    /// Returns `(passed, failed)` check counts for one response.
    fn apply_checks(&self, status: u16, elapsed: Duration) -> (u32, u32) {
        let results = [
            self.checks.expect_status.map(|expected| status == expected),
            self.checks.max_response_time.map(|max| elapsed < max),
        ];
        results.iter().flatten().fold((0, 0), |(passed, failed), ok| {
            if *ok {
                (passed + 1, failed)
            } else {
                (passed, failed + 1)
            }
        })
    }
}

#[async_trait]
impl Iteration for HttpIteration {
    async fn run(&self, ctx: IterationContext) -> IterationResult {
        let mut request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(vu = ctx.vu_id, iteration = ctx.iteration, error = %err, "request failed");
                return IterationResult::error(describe(&err)).with_checks(0, self.configured_checks());
            }
        };

        let status = response.status().as_u16();
        // Read the whole body so latency covers the full response
        if let Err(err) = response.bytes().await {
            debug!(vu = ctx.vu_id, status, error = %err, "failed to read response body");
            return IterationResult::error(describe(&err)).with_checks(0, self.configured_checks());
        }

        let (passed, failed) = self.apply_checks(status, started.elapsed());
        IterationResult::status(status).with_checks(passed, failed)
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}
