//! 統合テスト共通のヘルパー

#![allow(dead_code)]

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};

/// テスト対象のバイナリ（環境の影響を受けないようにする）
pub fn repomirror() -> Command {
    let mut cmd = Command::cargo_bin("repomirror").unwrap();
    cmd.env_remove("NO_MIRROR").env_remove("RUST_LOG").arg("--no-color");
    cmd
}

/// 実行可能なシェルスクリプトを作成する
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// テストごとに衝突しないプロジェクト名（ロックファイルがシステム共通のため）
pub fn unique_project(prefix: &str) -> String {
    format!("{}-{}", prefix, std::process::id())
}
