use async_trait::async_trait;
use reqwest::{Method, Response};
use std::collections::BTreeMap;
use url::Url;

use super::rest_client::{RestClient, RestError};
use crate::domain::entities::step::ApiCall;

/// Operations of the indexing service used while mirroring.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IndexerApi: Send + Sync {
    /// Names of projects that have been indexed at least once
    async fn list_indexed_projects(&self) -> Result<Vec<String>, RestError>;

    /// Repository paths of a project, relative to the source root
    async fn get_repositories(&self, project: &str) -> Result<Vec<String>, RestError>;

    /// SCM type name of a repository; `None` when the service does not know it
    async fn get_repository_type(&self, repository: &str) -> Result<Option<String>, RestError>;

    async fn is_project_indexed(&self, project: &str) -> Result<bool, RestError>;

    /// Remove index data of a project so that it gets fully reindexed
    async fn delete_project_data(&self, project: &str) -> Result<(), RestError>;

    async fn delete_project(&self, project: &str) -> Result<(), RestError>;

    /// Whether the service knows the project
    async fn has_project(&self, project: &str) -> Result<bool, RestError>;

    async fn get_config_value(&self, name: &str) -> Result<String, RestError>;

    async fn set_config_value(&self, name: &str, value: &str) -> Result<(), RestError>;

    /// Perform a configured API call step on behalf of `project`
    async fn call(&self, call: &ApiCall, project: &str) -> Result<(), RestError>;
}

/// [`IndexerApi`] over the REST interface of the web application
#[derive(Debug, Clone)]
pub struct IndexerClient {
    rest: RestClient,
    base: Url,
}

impl IndexerClient {
    pub const SOURCE_ROOT: &'static str = "sourceRoot";

    pub fn new(rest: RestClient, base_url: &str) -> Result<Self, RestError> {
        let mut base = Url::parse(base_url).map_err(|e| RestError::InvalidUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(RestError::InvalidUrl {
                url: base_url.to_string(),
                message: "not a base URL".to_string(),
            });
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let rest = rest.with_base_url(base.as_str());
        Ok(Self { rest, base })
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url, RestError> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| RestError::InvalidUrl {
                url: self.base.to_string(),
                message: "not a base URL".to_string(),
            })?;
            path.pop_if_empty().extend(["api", "v1"]).extend(segments);
        }
        Ok(url)
    }

    async fn send(&self, method: Method, url: Url, body: Option<String>) -> Result<Response, RestError> {
        let mut headers = BTreeMap::new();
        if body.is_some() {
            headers.insert("Content-Type".to_string(), "text/plain".to_string());
        }
        self.rest
            // client-wide timeouts apply
            .request(method, url.as_str(), body, &headers, None, None)
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, RestError> {
        let display = url.to_string();
        let response = self.send(Method::GET, url, None).await?;
        response.json::<T>().await.map_err(|e| RestError::InvalidResponse {
            url: display,
            message: e.to_string(),
        })
    }

    async fn get_text(&self, url: Url) -> Result<String, RestError> {
        let display = url.to_string();
        let response = self.send(Method::GET, url, None).await?;
        response.text().await.map_err(|e| RestError::InvalidResponse {
            url: display,
            message: e.to_string(),
        })
    }
}

/// The type response is either `type` or `path:type`.
pub fn parse_repository_type(response: &str) -> Option<String> {
    let value = response.trim().trim_matches('"');
    let scm = value.rsplit(':').next().unwrap_or(value).trim();
    if scm.is_empty() || scm.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(scm.to_string())
    }
}

#[async_trait]
impl IndexerApi for IndexerClient {
    async fn list_indexed_projects(&self) -> Result<Vec<String>, RestError> {
        self.get_json(self.api_url(&["projects", "indexed"])?).await
    }

    async fn get_repositories(&self, project: &str) -> Result<Vec<String>, RestError> {
        self.get_json(self.api_url(&["projects", project, "repositories"])?)
            .await
    }

    async fn get_repository_type(&self, repository: &str) -> Result<Option<String>, RestError> {
        let mut url = self.api_url(&["repositories", "property", "type"])?;
        url.query_pairs_mut().append_pair("repository", repository);
        let text = self.get_text(url).await?;
        Ok(parse_repository_type(&text))
    }

    async fn is_project_indexed(&self, project: &str) -> Result<bool, RestError> {
        self.get_json(self.api_url(&["projects", project, "property", "indexed"])?)
            .await
    }

    async fn delete_project_data(&self, project: &str) -> Result<(), RestError> {
        let url = self.api_url(&["projects", project, "data"])?;
        self.send(Method::DELETE, url, None).await.map(|_| ())
    }

    async fn delete_project(&self, project: &str) -> Result<(), RestError> {
        let url = self.api_url(&["projects", project])?;
        self.send(Method::DELETE, url, None).await.map(|_| ())
    }

    async fn has_project(&self, project: &str) -> Result<bool, RestError> {
        let projects: Vec<String> = self.get_json(self.api_url(&["projects"])?).await?;
        Ok(projects.iter().any(|name| name == project))
    }

    async fn get_config_value(&self, name: &str) -> Result<String, RestError> {
        let text = self.get_text(self.api_url(&["configuration", name])?).await?;
        Ok(text.trim().to_string())
    }

    async fn set_config_value(&self, name: &str, value: &str) -> Result<(), RestError> {
        let url = self.api_url(&["configuration", name])?;
        self.send(Method::PUT, url, Some(value.to_string()))
            .await
            .map(|_| ())
    }

    async fn call(&self, call: &ApiCall, project: &str) -> Result<(), RestError> {
        self.rest
            .call(call, &self.rest.substitutions(project))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn indexer(server: &MockServer) -> IndexerClient {
        IndexerClient::new(RestClient::new().unwrap(), &format!("{}/source", server.uri())).unwrap()
    }

    #[test]
    fn test_parse_repository_type() {
        assert_eq!(parse_repository_type("git"), Some("git".to_string()));
        assert_eq!(parse_repository_type("/foo:Mercurial\n"), Some("Mercurial".to_string()));
        assert_eq!(parse_repository_type(""), None);
        assert_eq!(parse_repository_type("/foo:"), None);
    }

    #[tokio::test]
    async fn test_base_url_gets_trailing_slash() {
        let server = MockServer::start().await;
        let client = indexer(&server).await;
        assert_eq!(client.rest().base_url(), Some(format!("{}/source/", server.uri()).as_str()));
    }

    #[tokio::test]
    async fn test_get_repositories() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/projects/foo/repositories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(["/foo", "/foo/lib"])))
            .mount(&server)
            .await;

        let repos = indexer(&server).await.get_repositories("foo").await.unwrap();
        assert_eq!(repos, vec!["/foo".to_string(), "/foo/lib".to_string()]);
    }

    #[tokio::test]
    async fn test_get_repository_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/repositories/property/type"))
            .and(query_param("repository", "/foo"))
            .respond_with(ResponseTemplate::new(200).set_body_string("/foo:git"))
            .mount(&server)
            .await;

        let scm = indexer(&server).await.get_repository_type("/foo").await.unwrap();
        assert_eq!(scm, Some("git".to_string()));
    }

    #[tokio::test]
    async fn test_is_project_indexed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/projects/foo/property/indexed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/projects/bar/property/indexed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("false"))
            .mount(&server)
            .await;

        let client = indexer(&server).await;
        assert!(client.is_project_indexed("foo").await.unwrap());
        assert!(!client.is_project_indexed("bar").await.unwrap());
    }

    #[tokio::test]
    async fn test_project_name_is_path_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/source/api/v1/projects/a%20b/data"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        indexer(&server).await.delete_project_data("a b").await.unwrap();
    }

    #[tokio::test]
    async fn test_configuration_values() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/configuration/sourceRoot"))
            .respond_with(ResponseTemplate::new(200).set_body_string("/var/opengrok/src\n"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/source/api/v1/configuration/hitsPerPage"))
            .and(body_string("50"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = indexer(&server).await;
        assert_eq!(
            client.get_config_value(IndexerClient::SOURCE_ROOT).await.unwrap(),
            "/var/opengrok/src"
        );
        client.set_config_value("hitsPerPage", "50").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_indexed_projects_and_has_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/projects/indexed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(["foo", "bar"])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(["foo", "bar", "new"])))
            .mount(&server)
            .await;

        let client = indexer(&server).await;
        assert_eq!(
            client.list_indexed_projects().await.unwrap(),
            vec!["foo".to_string(), "bar".to_string()]
        );
        assert!(client.has_project("new").await.unwrap());
        assert!(!client.has_project("old").await.unwrap());
    }

    #[tokio::test]
    async fn test_built_in_calls_use_client_async_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/source/api/v1/projects/foo/data"))
            .respond_with(ResponseTemplate::new(202).insert_header("Location", "/source/api/v1/status/3"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/source/api/v1/status/3"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let rest = RestClient::new()
            .unwrap()
            .with_async_api_timeout(Some(std::time::Duration::from_millis(200)))
            .with_poll_interval(std::time::Duration::from_millis(50));
        let client = IndexerClient::new(rest, &format!("{}/source", server.uri())).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(3), client.delete_project_data("foo"))
            .await
            .expect("polling must stop at the async timeout");
        assert!(matches!(result, Err(RestError::AsyncTimeout { .. })));
    }
}
