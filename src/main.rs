use std::process::ExitCode;

use repomirror::presentation::cli::CliApp;

#[tokio::main]
async fn main() -> ExitCode {
    let app = CliApp::new();
    app.run().await
}
