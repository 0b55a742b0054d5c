use crate::config::LauncherConfig;
use crate::state::{ServerMode, ServerRecord};
use std::path::Path;

/// Fully derived launch invocation for a server record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
}

/// Derives the launch command for `record` on `port`.
///
/// The invocation is `<program> <module:app> --host <host> --port <port>`
/// plus mode flags:
///
/// * `dev`  — `--reload` (hot-reload)
/// * `prod` — `--workers 4`
/// * `test` — `--log-level warning`
pub fn launch_command(record: &ServerRecord, launcher: &LauncherConfig, port: u16) -> LaunchCommand {
    let mut args = vec![
        find_app_module(&record.path),
        "--host".to_string(),
        launcher.host.clone(),
        "--port".to_string(),
        port.to_string(),
    ];

    match record.mode {
        ServerMode::Dev => args.push("--reload".to_string()),
        ServerMode::Prod => {
            args.push("--workers".to_string());
            args.push("4".to_string());
        }
        ServerMode::Test => {
            args.push("--log-level".to_string());
            args.push("warning".to_string());
        }
    }

    LaunchCommand {
        program: launcher.program.clone(),
        args,
    }
}

/// Finds the app module in a working directory by checking for the
/// conventional entry files, falling back to `main:app`.
fn find_app_module(path: &Path) -> String {
    for filename in ["main.py", "app.py"] {
        if path.join(filename).exists() {
            let stem = filename.trim_end_matches(".py");
            return format!("{}:app", stem);
        }
    }
    "main:app".to_string()
}
