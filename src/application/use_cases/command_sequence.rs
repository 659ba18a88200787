use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::Outcome;
use crate::domain::entities::step::{ApiCall, CommandStep, Step, PROJECT_SUBST, URL_SUBST};
use crate::infrastructure::http::IndexerApi;
use crate::infrastructure::process::{CommandExecutor, ProcessDescriptor};

/// 出力に含まれるエラーの目印
fn error_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"^ERROR:*\s+").expect("valid error marker pattern"))
}

/// 実行されたステップの記録
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// ステップの表示名（コマンドラインまたは `METHOD uri`）
    pub step: String,

    /// 終了コード（API呼び出しは成功0、失敗1）
    pub code: i32,

    /// 捕捉した出力
    pub output: Vec<String>,
}

impl StepRecord {
    fn is_failure(&self) -> bool {
        self.code != Outcome::SUCCESS_CODE && self.code != Outcome::CONTINUE_CODE
    }

    fn has_error_output(&self) -> bool {
        self.output.iter().any(|line| error_marker().is_match(line))
    }

    fn indented_output(&self, indent: &str) -> String {
        self.output
            .iter()
            .map(|line| format!("{}{}", indent, line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 1プロジェクト分のシーケンス実行結果
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceReport {
    pub project: String,
    pub records: Vec<StepRecord>,
    pub failed: bool,
}

impl SequenceReport {
    /// 実行結果を検査してログに出力する
    ///
    /// `ignore_errors` に含まれるプロジェクトは常に成功。
    /// それ以外は終了コードが0と継続コード以外のステップがあるか、
    /// 出力にエラーの目印が含まれる場合に失敗とする。
    pub fn check(&self, ignore_errors: &[String]) -> Outcome {
        for record in self.records.iter().filter(|r| !r.output.is_empty()) {
            debug!("Output from '{}':\n{}", record.step, record.indented_output(""));
        }

        if ignore_errors.iter().any(|name| name == &self.project) {
            debug!("errors of project '{}' ignored", self.project);
            return Outcome::Success;
        }

        let mut outcome = Outcome::Success;

        let failed: Vec<&StepRecord> = self.records.iter().filter(|r| r.is_failure()).collect();
        if !failed.is_empty() || self.failed {
            outcome = Outcome::Failure;
            error!("processing of project '{}' failed", self.project);
            error!("  failed commands:");
            for record in &failed {
                error!("    '{}': {}", record.step, record.code);
                if !record.output.is_empty() {
                    error!("{}", record.indented_output("      "));
                }
            }
        }

        let errored: Vec<&StepRecord> = self.records.iter().filter(|r| r.has_error_output()).collect();
        if !errored.is_empty() {
            outcome = Outcome::Failure;
            error!("Command output in project '{}' contains errors:", self.project);
            for record in &errored {
                error!("  {}", record.step);
                error!("{}", record.indented_output("    "));
            }
        }

        outcome
    }
}

/// 順序付きステップを1プロジェクトに対して実行するエンジン
///
/// 0は次へ進む。継続コードはシーケンスを止めるが失敗ではない
/// （`driveon` の場合はそのステップを飛ばして続行）。
/// それ以外は失敗としてクリーンアップを実行し停止する。
pub struct CommandSequence {
    project: String,
    steps: Vec<Step>,
    cleanup: Vec<Step>,
    driveon: bool,
    base_url: String,
    env: HashMap<String, String>,
    api: Arc<dyn IndexerApi>,
    cancellation: Option<CancellationToken>,
}

impl CommandSequence {
    pub fn new(project: impl Into<String>, steps: Vec<Step>, api: Arc<dyn IndexerApi>) -> Self {
        Self {
            project: project.into(),
            steps,
            cleanup: Vec::new(),
            driveon: false,
            base_url: String::new(),
            env: HashMap::new(),
            api,
            cancellation: None,
        }
    }

    pub fn with_cleanup(mut self, cleanup: Vec<Step>) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_driveon(mut self, driveon: bool) -> Self {
        self.driveon = driveon;
        self
    }

    /// `%URL%` に代入するベースURL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// 全コマンドステップに渡す環境変数
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Option<CancellationToken>) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// シーケンスを実行する
    pub async fn run(&self) -> SequenceReport {
        let mut report = SequenceReport {
            project: self.project.clone(),
            records: Vec::new(),
            failed: false,
        };

        for step in &self.steps {
            let record = self.run_step(step).await;
            let code = record.code;
            report.records.push(record);

            match code {
                Outcome::SUCCESS_CODE => continue,
                Outcome::CONTINUE_CODE if self.driveon => {
                    debug!(
                        "command '{}' for project {} requested break however \
                         the 'driveon' option is set so driving on.",
                        step, self.project
                    );
                    continue;
                }
                Outcome::CONTINUE_CODE => {
                    debug!("command '{}' for project {} requested break", step, self.project);
                }
                _ => {
                    error!(
                        "command '{}' for project {} failed with code {}, breaking",
                        step, self.project, code
                    );
                    report.failed = true;
                }
            }
            self.run_cleanup().await;
            break;
        }

        report
    }

    async fn run_step(&self, step: &Step) -> StepRecord {
        match step {
            Step::Command(command) => self.run_command(command).await,
            Step::Call(call) => self.run_call(call).await,
        }
    }

    fn process(&self, command: &CommandStep) -> ProcessDescriptor {
        let mut env = self.env.clone();
        env.extend(command.env.clone());
        ProcessDescriptor::new(command.args.clone())
            .with_env(&env)
            .with_resource_limits(&command.limits)
            .with_timeout(command.timeout_duration())
            .with_substitution(PROJECT_SUBST, self.project.clone())
            .with_substitution(URL_SUBST, self.base_url.clone())
            .with_append(vec![self.project.clone()], true)
            .with_cancellation(self.cancellation.clone())
    }

    async fn run_command(&self, command: &CommandStep) -> StepRecord {
        let result = CommandExecutor::execute(&self.process(command)).await;
        let code = match result.exit_code() {
            Some(code) => code,
            None => {
                result.log_error(&format!("command for project {} did not finish", self.project));
                Outcome::FAILURE_CODE
            }
        };
        StepRecord {
            step: result.command_string(),
            code,
            output: result.stdout,
        }
    }

    async fn run_call(&self, call: &ApiCall) -> StepRecord {
        let step = Step::Call(call.clone()).to_string();
        let code = match self.api.call(call, &self.project).await {
            Ok(()) => Outcome::SUCCESS_CODE,
            Err(e) => {
                error!("API call {} failed for project {}: {}", step, self.project, e);
                Outcome::FAILURE_CODE
            }
        };
        StepRecord {
            step,
            code,
            output: Vec::new(),
        }
    }

    /// クリーンアップの失敗はログに残すだけで、元の結果を上書きしない
    async fn run_cleanup(&self) {
        for step in &self.cleanup {
            debug!("Running cleanup command '{}'", step);
            let record = self.run_step(step).await;
            if record.code != Outcome::SUCCESS_CODE {
                error!("cleanup command '{}' failed with code {}", record.step, record.code);
                if !record.output.is_empty() {
                    info!("output: {}", record.indented_output(""));
                }
            }
        }
    }
}
