//! Per-host results and process exit codes

use serde::Serialize;
use sshmux_exec::{CommandOutput, ExecError, ExitStatus};

/// Exit code for dial and transport failures (same as ssh)
pub const TRANSPORT_FAILURE: u8 = 255;

/// Exit code from `check` when a host never became reachable
pub const UNREACHABLE: u8 = 2;

/// Outcome of one command on one host, for `--json`
#[derive(Debug, Serialize)]
pub struct HostReport {
    pub host: String,
    pub ok: bool,
    pub exit: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub connect_timeout: bool,
    pub duration_ms: Option<u128>,
}

impl HostReport {
    pub fn new(host: &str, result: &Result<CommandOutput, ExecError>) -> Self {
        match result {
            Ok(output) => Self {
                host: host.to_string(),
                ok: true,
                exit: output.exit.clone(),
                stdout: output.stdout_lossy(),
                stderr: output.stderr_lossy(),
                error: None,
                connect_timeout: false,
                duration_ms: Some(output.duration.as_millis()),
            },
            Err(err) => {
                let (stdout, stderr) = err.partial_output().unwrap_or_default();
                let exit = match err {
                    ExecError::CommandFailed { status, .. } => Some(status.clone()),
                    _ => None,
                };
                Self {
                    host: host.to_string(),
                    ok: false,
                    exit,
                    stdout: String::from_utf8_lossy(stdout).into_owned(),
                    stderr: String::from_utf8_lossy(stderr).into_owned(),
                    error: Some(err.to_string()),
                    connect_timeout: err.is_connect_timeout(),
                    duration_ms: None,
                }
            }
        }
    }
}

/// Exit code for `run`: the first failing host decides
///
/// A remote non-zero status is passed through; anything else that went
/// wrong maps to [`TRANSPORT_FAILURE`].
pub fn run_exit_code(results: &[Result<CommandOutput, ExecError>]) -> u8 {
    results
        .iter()
        .find_map(|result| match result {
            Ok(_) => None,
            Err(ExecError::CommandFailed {
                status: ExitStatus::Code(code),
                ..
            }) => Some(u8::try_from(*code).unwrap_or(1).max(1)),
            Err(ExecError::CommandFailed { .. }) => Some(1),
            Err(_) => Some(TRANSPORT_FAILURE),
        })
        .unwrap_or(0)
}

/// Exit code for `check`: 1 for any hard error, 2 if hosts were only unreachable
pub fn check_exit_code(results: &[Result<(), ExecError>]) -> u8 {
    let errors = results.iter().filter_map(|r| r.as_ref().err());
    let mut code = 0;
    for err in errors {
        if !err.is_connect_timeout() {
            return 1;
        }
        code = UNREACHABLE;
    }
    code
}
