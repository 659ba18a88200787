use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::common::error::MirrorError;
use crate::common::result::MirrorResult;

/// プロジェクト名に置換されるトークン
pub const PROJECT_SUBST: &str = "%PROJECT%";

/// インデックスサービスのベースURLに置換されるトークン
pub const URL_SUBST: &str = "%URL%";

const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// ローカルコマンドのステップ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandStep {
    /// 引数ベクタ（先頭が実行ファイル）
    pub args: Vec<String>,

    /// 追加の環境変数
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// リソース制限（例: `RLIMIT_NOFILE: 1024`）
    #[serde(default)]
    pub limits: BTreeMap<String, u64>,

    /// タイムアウト（秒）
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl CommandStep {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            env: HashMap::new(),
            limits: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// インデックスサービスのAPI呼び出しステップ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiCall {
    /// 呼び出し先URI（`%PROJECT%` / `%URL%` を置換可能）
    pub uri: String,

    /// HTTPメソッド
    #[serde(default = "default_method")]
    pub method: String,

    /// リクエストボディ（JSON）
    #[serde(default)]
    pub data: Option<serde_json::Value>,

    /// 追加のHTTPヘッダ
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// リクエストのタイムアウト（秒）
    #[serde(default)]
    pub api_timeout: Option<u64>,

    /// 非同期処理の完了待ちタイムアウト（秒）
    #[serde(default)]
    pub async_api_timeout: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl ApiCall {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: method.into(),
            data: None,
            headers: BTreeMap::new(),
            api_timeout: None,
            async_api_timeout: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// 大文字に正規化したメソッド名
    pub fn normalized_method(&self) -> String {
        self.method.to_uppercase()
    }

    /// インデックスサービスのAPI（`/api/v1/`）宛ての呼び出しか
    pub fn targets_indexer_api(&self) -> bool {
        self.uri.contains("/api/v1/")
    }
}

/// ワークフローの1ステップ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Command(CommandStep),
    Call(ApiCall),
}

impl Step {
    /// 実行前に構造を検証
    pub fn check(&self) -> MirrorResult<()> {
        match self {
            Step::Command(command) => {
                if command.args.is_empty() {
                    return Err(MirrorError::config_error("command step has empty 'args'"));
                }
                if command.timeout == Some(0) {
                    return Err(MirrorError::validation_error(
                        "timeout",
                        "must be at least 1 second",
                        Some(self.to_string()),
                    ));
                }
            }
            Step::Call(call) => {
                if call.uri.trim().is_empty() {
                    return Err(MirrorError::config_error("call step has empty 'uri'"));
                }
                if !HTTP_METHODS.contains(&call.normalized_method().as_str()) {
                    return Err(MirrorError::validation_error(
                        "method",
                        "unknown HTTP method",
                        Some(call.method.clone()),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Command(command) => write!(f, "{}", command.args.join(" ")),
            Step::Call(call) => write!(f, "{} {}", call.normalized_method(), call.uri),
        }
    }
}

/// ステップシーケンスの設定ファイル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// 順に実行するステップ
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub commands: Vec<Step>,

    /// 失敗または中断時に実行するステップ
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub cleanup: Vec<Step>,

    /// エラーを無視するプロジェクト
    #[serde(default)]
    pub ignore_errors: Vec<String>,
}

impl SyncConfig {
    pub fn check(&self) -> MirrorResult<()> {
        if self.commands.is_empty() {
            return Err(MirrorError::config_error("'commands' must not be empty"));
        }
        for step in self.commands.iter().chain(self.cleanup.iter()) {
            step.check()?;
        }
        Ok(())
    }
}
