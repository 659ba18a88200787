use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::scm_interface::{RepositoryOperations, ScmBase, ScmError};
use crate::domain::entities::repository::RepositoryDescriptor;

/// SVN (Subversion) implementation of repository operations
pub struct SvnScm {
    base: ScmBase,
}

impl SvnScm {
    pub fn new(
        descriptor: RepositoryDescriptor,
        cancellation: Option<CancellationToken>,
    ) -> Result<Self, ScmError> {
        Ok(Self {
            base: ScmBase::new(descriptor, cancellation)?,
        })
    }

    /// svn ignores the proxy environment variables, so the proxy from
    /// `http_proxy` is passed as configuration options.
    fn proxy_options(&self) -> Vec<String> {
        let Some(proxy) = self.base.descriptor().env.get("http_proxy") else {
            return Vec::new();
        };
        let Ok(url) = Url::parse(proxy) else {
            return Vec::new();
        };
        let mut options = Vec::new();
        if let Some(host) = url.host_str() {
            options.push("--config-option".to_string());
            options.push(format!("servers:global:http-proxy-host={}", host));
        }
        if let Some(port) = url.port_or_known_default() {
            options.push("--config-option".to_string());
            options.push(format!("servers:global:http-proxy-port={}", port));
        }
        options
    }
}

#[async_trait]
impl RepositoryOperations for SvnScm {
    fn base(&self) -> &ScmBase {
        &self.base
    }

    async fn repo_sync(&self) -> i32 {
        let options = self.proxy_options();
        let mut args: Vec<&str> = options.iter().map(String::as_str).collect();
        args.extend(["update", "--non-interactive"]);
        self.base.run_sync(&args).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::entities::repository::CommandEntry;
    use crate::domain::value_objects::scm_type::ScmType;
    use crate::infrastructure::scm::scm_interface::test_support::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sync_through_proxy() {
        let temp_dir = TempDir::new().unwrap();
        let svn = recording_script(temp_dir.path(), "svn", "exit 0");
        let env = HashMap::from([("http_proxy".to_string(), "http://proxy.example.com:3128".to_string())]);
        let descriptor = RepositoryDescriptor::new(ScmType::Subversion, temp_dir.path(), "proj")
            .with_commands(Some(CommandEntry::Path(svn.display().to_string())))
            .with_env(env);
        let repo = SvnScm::new(descriptor, None).unwrap();

        assert_eq!(repo.sync().await, 0);
        assert_eq!(
            recorded_calls(temp_dir.path()),
            vec![
                "--config-option servers:global:http-proxy-host=proxy.example.com \
                 --config-option servers:global:http-proxy-port=3128 update --non-interactive"
            ]
        );
        assert!(repo.incoming().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_update() {
        let temp_dir = TempDir::new().unwrap();
        let svn = write_script(temp_dir.path(), "svn", "echo 'svn: E155004: locked' >&2\nexit 1");
        let descriptor = RepositoryDescriptor::new(ScmType::Subversion, temp_dir.path(), "proj")
            .with_commands(Some(CommandEntry::Path(svn.display().to_string())));

        assert_eq!(SvnScm::new(descriptor, None).unwrap().sync().await, 1);
    }
}
