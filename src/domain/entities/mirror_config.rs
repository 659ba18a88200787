use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

use crate::common::error::MirrorError;
use crate::common::result::MirrorResult;
use crate::domain::entities::repository::CommandEntry;
use crate::domain::entities::step::Step;
use crate::domain::value_objects::scm_type::ScmType;

/// プロキシ設定を渡す環境変数
pub const PROXY_ENV_VARS: [&str; 4] = ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"];

/// フックの設定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookSettings {
    /// 同期前に実行するフック（hookdirからの相対パス）
    pub pre: Option<String>,
    /// 同期後に実行するフック
    pub post: Option<String>,
}

/// プロジェクト単位の設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProjectSettings {
    #[serde(default)]
    pub disabled: bool,

    #[serde(default, rename = "disabled-reason")]
    pub disabled_reason: Option<String>,

    #[serde(default)]
    #[validate(range(min = 1))]
    pub hook_timeout: Option<u64>,

    #[serde(default)]
    #[validate(range(min = 1))]
    pub command_timeout: Option<u64>,

    /// グローバルのプロキシ設定を使うか
    #[serde(default)]
    pub proxy: bool,

    /// 無視するリポジトリ（プロジェクトルートからの相対パスのglob）
    #[serde(default)]
    pub ignored_repos: Vec<String>,

    #[serde(default)]
    pub hooks: Option<HookSettings>,

    #[serde(default)]
    pub incoming_check: Option<bool>,

    #[serde(default)]
    pub ignore_errors: Option<bool>,

    #[serde(default)]
    pub strip_outgoing: Option<bool>,
}

/// ミラー処理の設定ファイル
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    /// フックを格納するディレクトリ
    #[serde(default)]
    pub hookdir: Option<PathBuf>,

    /// プロキシのURL
    #[serde(default)]
    pub proxy: Option<String>,

    /// バッチモードのログ出力先
    #[serde(default)]
    pub logdir: Option<PathBuf>,

    /// SCMごとのコマンド設定
    #[serde(default)]
    pub commands: BTreeMap<String, CommandEntry>,

    /// プロジェクト名（または正規表現）ごとの設定
    #[serde(default)]
    pub projects: BTreeMap<String, Option<ProjectSettings>>,

    #[serde(default)]
    #[validate(range(min = 1))]
    pub hook_timeout: Option<u64>,

    #[serde(default)]
    #[validate(range(min = 1))]
    pub command_timeout: Option<u64>,

    /// 無効化されたプロジェクトに対して実行するステップ
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub disabled_command: Option<Step>,

    #[serde(default)]
    pub incoming_check: bool,

    #[serde(default)]
    pub ignore_errors: bool,

    #[serde(default)]
    pub strip_outgoing: bool,
}

/// コマンドラインから与えられる上書き設定
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorOverrides {
    pub check_changes: bool,
    pub strip_outgoing: bool,
}

/// 1プロジェクトのミラー処理に必要な設定（解決済み）
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub name: String,
    pub disabled: bool,
    pub disabled_reason: Option<String>,
    pub pre_hook: Option<PathBuf>,
    pub post_hook: Option<PathBuf>,
    pub hook_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
    /// リポジトリのコマンドとフックに渡す環境変数
    pub env: HashMap<String, String>,
    pub ignored_repos: Vec<glob::Pattern>,
    pub check_changes: bool,
    pub strip_outgoing: bool,
    pub ignore_errors: bool,
}

impl ProjectConfig {
    /// 設定のないプロジェクト用のデフォルト
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disabled: false,
            disabled_reason: None,
            pre_hook: None,
            post_hook: None,
            hook_timeout: None,
            command_timeout: None,
            env: HashMap::new(),
            ignored_repos: Vec::new(),
            check_changes: false,
            strip_outgoing: false,
            ignore_errors: false,
        }
    }

    /// プロジェクトルートからの相対パスが無視対象か
    pub fn is_ignored(&self, relative_path: &Path) -> bool {
        self.ignored_repos
            .iter()
            .any(|pattern| pattern.matches_path(relative_path))
    }
}

impl MirrorConfig {
    /// プロジェクト設定を取得（完全一致を優先し、次に正規表現で前方一致）
    pub fn project_settings(&self, project_name: &str) -> Option<&ProjectSettings> {
        if let Some(settings) = self.projects.get(project_name) {
            return settings.as_ref();
        }

        self.projects
            .iter()
            .find(|(pattern, _)| {
                anchored_regex(pattern)
                    .map(|re| re.is_match(project_name))
                    .unwrap_or(false)
            })
            .and_then(|(pattern, settings)| {
                tracing::debug!("Project '{}' matched pattern '{}'", project_name, pattern);
                settings.as_ref()
            })
    }

    /// SCMのコマンド設定を取得
    pub fn command_entry(&self, scm_type: ScmType) -> Option<&CommandEntry> {
        self.commands.iter().find_map(|(key, entry)| {
            match ScmType::from_str(key) {
                Ok(scm) if scm == scm_type => Some(entry),
                _ => None,
            }
        })
    }

    /// 設定の検証。ミラー処理を始める前に呼び出す。
    pub fn check(&self) -> MirrorResult<()> {
        self.validate()?;

        if let Some(logdir) = &self.logdir {
            if !logdir.is_dir() {
                std::fs::create_dir_all(logdir).map_err(|e| {
                    MirrorError::filesystem_error_with_source(
                        "Cannot create log directory",
                        Some(logdir.clone()),
                        e,
                    )
                })?;
            }
        }

        for (scm_name, entry) in &self.commands {
            ScmType::from_str(scm_name).map_err(|e| {
                MirrorError::config_error_with_source(
                    format!("unknown repository type '{}' in commands", scm_name),
                    e,
                )
            })?;
            let unknown = entry.unknown_keys();
            if !unknown.is_empty() {
                return Err(MirrorError::config_error(format!(
                    "unknown command propert(ies) {:?} for '{}'",
                    unknown, scm_name
                )));
            }
        }

        if let Some(step) = &self.disabled_command {
            step.check()?;
        }

        for (project_name, settings) in &self.projects {
            anchored_regex(project_name).map_err(|e| {
                MirrorError::config_error_with_source(
                    format!("Not a valid regular expression: {}", project_name),
                    e,
                )
            })?;

            let Some(settings) = settings else {
                tracing::warn!("Project {} has empty configuration", project_name);
                continue;
            };
            self.check_project(project_name, settings)?;
        }

        Ok(())
    }

    fn check_project(&self, project_name: &str, settings: &ProjectSettings) -> MirrorResult<()> {
        settings.validate()?;

        if settings.proxy && self.proxy.is_none() {
            return Err(MirrorError::config_error(format!(
                "global proxy setting is needed in order to have per-project proxy (project {})",
                project_name
            )));
        }

        if let Some(hooks) = &settings.hooks {
            let hookdir = self.hookdir.as_ref().ok_or_else(|| {
                MirrorError::config_error("Need to have 'hookdir' in the configuration to run hooks")
            })?;
            if !hookdir.is_dir() {
                return Err(MirrorError::config_error(format!(
                    "Not a directory: {}",
                    hookdir.display()
                )));
            }
            for hook in [&hooks.pre, &hooks.post].into_iter().flatten() {
                let hook_path = hookdir.join(hook);
                if !crate::infrastructure::process::is_executable(&hook_path) {
                    return Err(MirrorError::config_error(format!(
                        "hook file {} for project '{}' does not exist or not executable",
                        hook_path.display(),
                        project_name
                    )));
                }
            }
        }

        for pattern in &settings.ignored_repos {
            glob::Pattern::new(pattern).map_err(|e| {
                MirrorError::config_error_with_source(
                    format!("invalid ignored_repos pattern '{}' for project {}", pattern, project_name),
                    e,
                )
            })?;
        }

        Ok(())
    }

    /// グローバル設定・プロジェクト設定・上書き設定を合成する
    pub fn resolve(&self, project_name: &str, overrides: MirrorOverrides) -> MirrorResult<ProjectConfig> {
        let mut config = ProjectConfig::new(project_name);
        let settings = self.project_settings(project_name);

        config.hook_timeout = settings
            .and_then(|s| s.hook_timeout)
            .or(self.hook_timeout)
            .map(Duration::from_secs);
        config.command_timeout = settings
            .and_then(|s| s.command_timeout)
            .or(self.command_timeout)
            .map(Duration::from_secs);
        config.check_changes = overrides.check_changes
            || settings.and_then(|s| s.incoming_check).unwrap_or(self.incoming_check);
        config.strip_outgoing = overrides.strip_outgoing
            || settings.and_then(|s| s.strip_outgoing).unwrap_or(self.strip_outgoing);
        config.ignore_errors = settings
            .and_then(|s| s.ignore_errors)
            .unwrap_or(self.ignore_errors);

        let Some(settings) = settings else {
            return Ok(config);
        };
        tracing::debug!("Project '{}' has specific (non-default) config", project_name);

        config.disabled = settings.disabled;
        config.disabled_reason = settings.disabled_reason.clone();

        if let (Some(hooks), Some(hookdir)) = (&settings.hooks, &self.hookdir) {
            config.pre_hook = hooks.pre.as_ref().map(|hook| hookdir.join(hook));
            config.post_hook = hooks.post.as_ref().map(|hook| hookdir.join(hook));
        }

        if settings.proxy {
            if let Some(proxy) = &self.proxy {
                for var in PROXY_ENV_VARS {
                    config.env.insert(var.to_string(), proxy.clone());
                }
            }
        }

        config.ignored_repos = settings
            .ignored_repos
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern).map_err(|e| {
                    MirrorError::config_error_with_source(
                        format!("invalid ignored_repos pattern '{}'", pattern),
                        e,
                    )
                })
            })
            .collect::<MirrorResult<Vec<_>>>()?;

        Ok(config)
    }
}

fn anchored_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})", pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn parse(yaml: &str) -> MirrorConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_unknown_global_key_rejected() {
        let result = serde_yaml::from_str::<MirrorConfig>("foo: bar\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_project_key_rejected() {
        let yaml = "projects:\n  foo:\n    disabled: true\n    color: blue\n";
        assert!(serde_yaml::from_str::<MirrorConfig>(yaml).is_err());
    }

    #[test]
    fn test_literal_match_wins_over_pattern() {
        let config = parse(
            r#"
projects:
  "foo.*":
    command_timeout: 10
  foobar:
    command_timeout: 20
"#,
        );
        assert_eq!(config.project_settings("foobar").unwrap().command_timeout, Some(20));
        assert_eq!(config.project_settings("foox").unwrap().command_timeout, Some(10));
        assert!(config.project_settings("barfoo").is_none());
    }

    #[test]
    fn test_pattern_is_anchored_at_start() {
        let config = parse("projects:\n  \"bar\":\n    disabled: true\n");
        assert!(config.project_settings("barn").is_some());
        assert!(config.project_settings("rebar").is_none());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let config = parse("projects:\n  \"foo[\":\n    disabled: true\n");
        assert!(config.check().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = parse("command_timeout: 0\n");
        assert!(config.check().is_err());

        let config = parse("projects:\n  foo:\n    hook_timeout: 0\n");
        assert!(config.check().is_err());
    }

    #[test]
    fn test_project_proxy_requires_global_proxy() {
        let config = parse("projects:\n  foo:\n    proxy: true\n");
        assert!(config.check().is_err());

        let config = parse("proxy: http://proxy:3128\nprojects:\n  foo:\n    proxy: true\n");
        assert!(config.check().is_ok());

        let resolved = config.resolve("foo", MirrorOverrides::default()).unwrap();
        for var in PROXY_ENV_VARS {
            assert_eq!(resolved.env.get(var).map(String::as_str), Some("http://proxy:3128"));
        }
    }

    #[test]
    fn test_hooks_require_hookdir() {
        let config = parse("projects:\n  foo:\n    hooks:\n      pre: pre.sh\n");
        assert!(config.check().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_hooks_must_be_executable() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let hook = temp_dir.path().join("pre.sh");
        std::fs::write(&hook, "#!/bin/sh\nexit 0\n").unwrap();

        let yaml = format!(
            "hookdir: {}\nprojects:\n  foo:\n    hooks:\n      pre: pre.sh\n",
            temp_dir.path().display()
        );
        let config = parse(&yaml);
        assert!(config.check().is_err());

        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(config.check().is_ok());

        let resolved = config.resolve("foo", MirrorOverrides::default()).unwrap();
        assert_eq!(resolved.pre_hook, Some(hook));
        assert_eq!(resolved.post_hook, None);
    }

    #[test]
    fn test_logdir_is_created() {
        let temp_dir = TempDir::new().unwrap();
        let logdir = temp_dir.path().join("logs");
        let config = parse(&format!("logdir: {}\n", logdir.display()));
        config.check().unwrap();
        assert!(logdir.is_dir());
    }

    #[test]
    fn test_unknown_command_property_rejected() {
        let config = parse("commands:\n  git:\n    command: /usr/bin/git\n    push: foo\n");
        assert!(config.check().is_err());

        let config = parse("commands:\n  bazaar: /usr/bin/bzr\n");
        assert!(config.check().is_err());

        let config = parse("commands:\n  hg: /opt/bin/hg\n");
        assert!(config.check().is_ok());
        assert!(config.command_entry(ScmType::Mercurial).is_some());
        assert!(config.command_entry(ScmType::Git).is_none());
    }

    #[test]
    fn test_resolve_inherits_and_overrides() {
        let config = parse(
            r#"
command_timeout: 300
hook_timeout: 60
incoming_check: true
projects:
  foo:
    command_timeout: 30
    ignore_errors: true
    incoming_check: false
    ignored_repos: ["vendor/*"]
"#,
        );
        config.check().unwrap();

        let foo = config.resolve("foo", MirrorOverrides::default()).unwrap();
        assert_eq!(foo.command_timeout, Some(Duration::from_secs(30)));
        assert_eq!(foo.hook_timeout, Some(Duration::from_secs(60)));
        assert!(foo.ignore_errors);
        assert!(!foo.check_changes);
        assert!(foo.is_ignored(Path::new("vendor/lib")));
        assert!(!foo.is_ignored(Path::new("src")));

        let forced = config
            .resolve(
                "foo",
                MirrorOverrides {
                    check_changes: true,
                    strip_outgoing: true,
                },
            )
            .unwrap();
        assert!(forced.check_changes);
        assert!(forced.strip_outgoing);

        let other = config.resolve("other", MirrorOverrides::default()).unwrap();
        assert_eq!(other.command_timeout, Some(Duration::from_secs(300)));
        assert!(other.check_changes);
        assert!(!other.ignore_errors);
    }

    #[test]
    fn test_disabled_project() {
        let config = parse(
            r#"
disabled_command:
  call:
    uri: "http://localhost:8080/source/api/v1/messages"
    method: POST
    data:
      tags: ["%PROJECT%"]
      text: "disabled"
projects:
  foo:
    disabled: true
    disabled-reason: "upstream is gone"
"#,
        );
        config.check().unwrap();
        let foo = config.resolve("foo", MirrorOverrides::default()).unwrap();
        assert!(foo.disabled);
        assert_eq!(foo.disabled_reason.as_deref(), Some("upstream is gone"));
        assert!(matches!(config.disabled_command, Some(Step::Call(_))));
    }
}
