use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::value_objects::scm_type::ScmType;

/// 引数リスト（単一の文字列またはリスト）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgList {
    One(String),
    Many(Vec<String>),
}

impl ArgList {
    /// 引数ベクタに変換
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            ArgList::One(arg) => vec![arg.clone()],
            ArgList::Many(args) => args.clone(),
        }
    }
}

/// SCMごとのコマンド設定
///
/// 実行ファイルのパスのみ、または `command` / `sync` / `incoming`
/// をキーとするテーブルのいずれか。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandEntry {
    Path(String),
    Table(BTreeMap<String, ArgList>),
}

impl CommandEntry {
    pub const COMMAND_KEY: &'static str = "command";
    pub const SYNC_KEY: &'static str = "sync";
    pub const INCOMING_KEY: &'static str = "incoming";

    /// 許可されていないキーの一覧
    pub fn unknown_keys(&self) -> Vec<&str> {
        match self {
            CommandEntry::Path(_) => Vec::new(),
            CommandEntry::Table(table) => table
                .keys()
                .map(String::as_str)
                .filter(|key| ![Self::COMMAND_KEY, Self::SYNC_KEY, Self::INCOMING_KEY].contains(key))
                .collect(),
        }
    }

    /// 明示的に設定された実行ファイル
    pub fn executable(&self) -> Option<PathBuf> {
        match self {
            CommandEntry::Path(path) => Some(PathBuf::from(path)),
            CommandEntry::Table(table) => table
                .get(Self::COMMAND_KEY)
                .and_then(|args| args.to_vec().into_iter().next())
                .map(PathBuf::from),
        }
    }

    /// 同期コマンドの上書き
    pub fn sync_override(&self) -> Option<Vec<String>> {
        self.override_for(Self::SYNC_KEY)
    }

    /// 差分確認コマンドの上書き
    pub fn incoming_override(&self) -> Option<Vec<String>> {
        self.override_for(Self::INCOMING_KEY)
    }

    fn override_for(&self, key: &str) -> Option<Vec<String>> {
        match self {
            CommandEntry::Path(_) => None,
            CommandEntry::Table(table) => table
                .get(key)
                .map(ArgList::to_vec)
                .filter(|args| !args.is_empty()),
        }
    }
}

/// ミラー対象リポジトリの記述子
///
/// 設定の検証後に一度だけ作られ、以降は変更されない。
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryDescriptor {
    /// SCMの種類
    pub scm_type: ScmType,

    /// 作業コピーの絶対パス
    pub path: PathBuf,

    /// 所属するプロジェクト名
    pub project: String,

    /// コマンド設定（実行ファイルやsync/incomingの上書き）
    pub commands: Option<CommandEntry>,

    /// 子プロセスに追加する環境変数
    pub env: HashMap<String, String>,

    /// コマンドのタイムアウト
    pub timeout: Option<Duration>,
}

impl RepositoryDescriptor {
    /// 新しい記述子を作成
    pub fn new(scm_type: ScmType, path: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            scm_type,
            path: path.into(),
            project: project.into(),
            commands: None,
            env: HashMap::new(),
            timeout: None,
        }
    }

    pub fn with_commands(mut self, commands: Option<CommandEntry>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// 使用する実行ファイル（設定がなければSCMの標準名）
    pub fn executable(&self) -> PathBuf {
        self.commands
            .as_ref()
            .and_then(CommandEntry::executable)
            .unwrap_or_else(|| PathBuf::from(self.scm_type.executable_name()))
    }

    /// 実行ファイルが明示的に設定されているか
    pub fn has_explicit_executable(&self) -> bool {
        self.commands
            .as_ref()
            .and_then(CommandEntry::executable)
            .is_some()
    }

    pub fn sync_override(&self) -> Option<Vec<String>> {
        self.commands.as_ref().and_then(CommandEntry::sync_override)
    }

    pub fn incoming_override(&self) -> Option<Vec<String>> {
        self.commands.as_ref().and_then(CommandEntry::incoming_override)
    }

    /// このリポジトリの処理後に残りのリポジトリをスキップするか
    pub fn is_top_level(&self) -> bool {
        self.scm_type.is_top_level()
    }

    /// パスがプロジェクトのルートと一致するか
    pub fn is_project_root(&self, project_root: &Path) -> bool {
        self.path == project_root
    }
}

impl std::fmt::Display for RepositoryDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
