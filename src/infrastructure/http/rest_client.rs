use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, LOCATION};
use reqwest::{Method, Response, StatusCode};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::domain::entities::step::{ApiCall, PROJECT_SUBST, URL_SUBST};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const APPLICATION_JSON: &str = "application/json";

#[derive(Debug, Error)]
pub enum RestError {
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("Invalid HTTP header '{0}'")]
    InvalidHeader(String),

    #[error("Request {method} {url} failed: {source}")]
    Transport {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request {method} {url} returned status {status}")]
    Status {
        method: String,
        url: String,
        status: u16,
    },

    #[error("Asynchronous request {url} returned no Location header")]
    MissingLocation { url: String },

    #[error("Asynchronous request {url} did not complete within {timeout_secs} seconds")]
    AsyncTimeout { url: String, timeout_secs: u64 },

    #[error("Unexpected response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("Cannot build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Cannot encode request body: {0}")]
    Body(#[from] serde_json::Error),
}

impl RestError {
    pub fn url(&self) -> Option<&str> {
        match self {
            RestError::InvalidUrl { url, .. }
            | RestError::Transport { url, .. }
            | RestError::Status { url, .. }
            | RestError::MissingLocation { url }
            | RestError::AsyncTimeout { url, .. }
            | RestError::InvalidResponse { url, .. } => Some(url),
            _ => None,
        }
    }

    /// HTTP status of a terminal non-2xx response
    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Parse a `Name: value` header as given on the command line
pub fn parse_header(header: &str) -> Result<(String, String), RestError> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| RestError::InvalidHeader(header.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(RestError::InvalidHeader(header.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Replace every token with its value; empty values are left alone.
pub fn substitute_tokens(text: &str, substitutions: &BTreeMap<String, String>) -> String {
    substitutions
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .fold(text.to_string(), |acc, (token, value)| acc.replace(token.as_str(), value))
}

/// HTTP client for the indexing service
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: Option<String>,
    headers: BTreeMap<String, String>,
    api_timeout: Option<Duration>,
    async_api_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl RestClient {
    pub fn new() -> Result<Self, RestError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RestError::ClientBuild)?;
        Ok(Self {
            client,
            base_url: None,
            headers: BTreeMap::new(),
            api_timeout: None,
            async_api_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Base URL of the web application; `%URL%` expands to it with a trailing `/`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = Some(base_url);
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_api_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn with_async_api_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.async_api_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// Token map for `project`, including `%URL%` when a base URL is known
    pub fn substitutions(&self, project: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(PROJECT_SUBST.to_string(), project.to_string());
        if let Some(base_url) = &self.base_url {
            map.insert(URL_SUBST.to_string(), base_url.clone());
        }
        map
    }

    /// Perform a configured API call with tokens substituted in the URI and body.
    pub async fn call(
        &self,
        call: &ApiCall,
        substitutions: &BTreeMap<String, String>,
    ) -> Result<Response, RestError> {
        let method = Method::from_bytes(call.normalized_method().as_bytes())
            .map_err(|_| RestError::InvalidMethod(call.method.clone()))?;
        let uri = substitute_tokens(&call.uri, substitutions);
        let body = match &call.data {
            Some(data) => Some(substitute_tokens(&serde_json::to_string(data)?, substitutions)),
            None => None,
        };

        self.request(
            method,
            &uri,
            body,
            &call.headers,
            call.api_timeout.map(Duration::from_secs),
            call.async_api_timeout.map(Duration::from_secs),
        )
        .await
    }

    /// Send a request and follow the asynchronous 202 + Location protocol.
    ///
    /// Timeouts not given here fall back to the ones the client was built with.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<String>,
        extra_headers: &BTreeMap<String, String>,
        timeout: Option<Duration>,
        async_timeout: Option<Duration>,
    ) -> Result<Response, RestError> {
        let url = Url::parse(uri).map_err(|e| RestError::InvalidUrl {
            url: uri.to_string(),
            message: e.to_string(),
        })?;
        let timeout = timeout.or(self.api_timeout);
        let async_timeout = async_timeout.or(self.async_api_timeout);

        let mut headers = self.header_map(extra_headers)?;
        if body.is_some() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        }

        debug!("{} API call: {}", method, url);
        let mut builder = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let response = builder.send().await.map_err(|source| RestError::Transport {
            method: method.to_string(),
            url: url.to_string(),
            source,
        })?;

        let response = if response.status() == StatusCode::ACCEPTED {
            self.wait_for_async_api(&response, &url, &headers, timeout, async_timeout)
                .await?
        } else {
            response
        };

        check_status(&method, response)
    }

    async fn wait_for_async_api(
        &self,
        accepted: &Response,
        url: &Url,
        headers: &HeaderMap,
        timeout: Option<Duration>,
        async_timeout: Option<Duration>,
    ) -> Result<Response, RestError> {
        let location = accepted
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| RestError::MissingLocation { url: url.to_string() })?;
        let status_url = url.join(location).map_err(|e| RestError::InvalidUrl {
            url: location.to_string(),
            message: e.to_string(),
        })?;
        debug!("Asynchronous API call {} accepted, polling {}", url, status_url);

        let started = Instant::now();
        let result = loop {
            if let Some(limit) = async_timeout {
                if started.elapsed() >= limit {
                    break Err(RestError::AsyncTimeout {
                        url: status_url.to_string(),
                        timeout_secs: limit.as_secs(),
                    });
                }
            }
            tokio::time::sleep(self.poll_interval).await;

            let mut builder = self.client.get(status_url.clone()).headers(headers.clone());
            if let Some(timeout) = timeout {
                builder = builder.timeout(timeout);
            }
            match builder.send().await {
                Ok(response) if response.status() == StatusCode::ACCEPTED => {
                    debug!("{} still in progress", status_url);
                }
                Ok(response) => break Ok(response),
                Err(source) => {
                    break Err(RestError::Transport {
                        method: Method::GET.to_string(),
                        url: status_url.to_string(),
                        source,
                    })
                }
            }
        };

        if let Err(RestError::AsyncTimeout { .. }) = &result {
            debug!("Leaving {} in place, the job has not finished", status_url);
            return result;
        }

        // Release the server side state of the job.
        match self.client.delete(status_url.clone()).headers(headers.clone()).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!("DELETE {} returned status {}", status_url, response.status());
            }
            Ok(_) => {}
            Err(e) => warn!("DELETE {} failed: {}", status_url, e),
        }

        result
    }

    fn header_map(&self, extra: &BTreeMap<String, String>) -> Result<HeaderMap, RestError> {
        let mut map = HeaderMap::new();
        for (name, value) in self.headers.iter().chain(extra.iter()) {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RestError::InvalidHeader(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| RestError::InvalidHeader(format!("{}: {}", name, value)))?;
            map.insert(header_name, header_value);
        }
        Ok(map)
    }
}

fn check_status(method: &Method, response: Response) -> Result<Response, RestError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RestError::Status {
            method: method.to_string(),
            url: response.url().to_string(),
            status: response.status().as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RestClient {
        RestClient::new()
            .unwrap()
            .with_base_url(format!("{}/source", server.uri()))
            .with_poll_interval(Duration::from_millis(50))
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Authorization: Bearer abc:def").unwrap(),
            ("Authorization".to_string(), "Bearer abc:def".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_substitute_tokens() {
        let mut map = BTreeMap::new();
        map.insert(PROJECT_SUBST.to_string(), "foo".to_string());
        map.insert(URL_SUBST.to_string(), "http://localhost:8080/source/".to_string());
        assert_eq!(
            substitute_tokens("%URL%api/v1/projects/%PROJECT%/%PROJECT%", &map),
            "http://localhost:8080/source/api/v1/projects/foo/foo"
        );
    }

    #[tokio::test]
    async fn test_call_substitutes_uri_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/source/api/v1/messages"))
            .and(header("content-type", APPLICATION_JSON))
            .and(body_json(serde_json::json!({"tags": ["foo"], "text": "foo is disabled"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let rest = client(&server);
        let call = ApiCall::new("post", "%URL%api/v1/messages")
            .with_data(serde_json::json!({"tags": ["%PROJECT%"], "text": "%PROJECT% is disabled"}));
        let response = rest.call(&call, &rest.substitutions("foo")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_extra_headers_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/projects"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer token".to_string());
        let rest = client(&server).with_headers(headers);
        let call = ApiCall::new("GET", "%URL%api/v1/projects");
        assert!(rest.call(&call, &rest.substitutions("foo")).await.is_ok());
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let rest = client(&server);
        let call = ApiCall::new("DELETE", "%URL%api/v1/projects/foo");
        let err = rest.call(&call, &rest.substitutions("foo")).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_async_api_polls_location_and_deletes() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/source/api/v1/projects/foo/data"))
            .respond_with(ResponseTemplate::new(202).insert_header("Location", "/source/api/v1/status/1"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/status/1"))
            .respond_with(ResponseTemplate::new(202))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/status/1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/source/api/v1/status/1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let rest = client(&server);
        let call = ApiCall::new("DELETE", "%URL%api/v1/projects/%PROJECT%/data");
        let response = rest.call(&call, &rest.substitutions("foo")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_async_api_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/source/api/v1/reindex"))
            .respond_with(ResponseTemplate::new(202).insert_header("Location", "status/7"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let rest = client(&server).with_async_api_timeout(Some(Duration::from_millis(200)));
        let call = ApiCall::new("POST", "%URL%api/v1/reindex");
        let err = rest.call(&call, &rest.substitutions("foo")).await.unwrap_err();
        assert!(matches!(err, RestError::AsyncTimeout { .. }));
    }
}
