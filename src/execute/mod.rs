//! Method execution
//!
//! Runs a rendered method template with the worktree as working directory.
//! A nonzero exit, death by signal or an expired timeout is a computation
//! failure carrying the method name and parameters.

mod template;

pub use template::MethodTemplate;

use crate::config::schema::ExecutionConfig;
use crate::error::{RemakeError, RemakeResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

/// Max number of output lines kept in failure messages
const ERROR_TAIL_LINES: usize = 50;

/// Tail of a failed method's combined output for error diagnostics
pub(crate) fn error_output_tail(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
    lines[start..].join("\n")
}

/// A completed method run
#[derive(Debug, Clone)]
pub struct Execution {
    pub argv: Vec<String>,
    pub duration: Duration,
}

/// Runs method templates
#[derive(Debug, Clone)]
pub struct Executor {
    shell: String,
    timeout: Option<Duration>,
}

impl Executor {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            timeout: (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs)),
        }
    }

    /// Substitute `parameters` into `template` and run it in `workdir`
    pub async fn run(
        &self,
        method: &str,
        template: &MethodTemplate,
        parameters: &BTreeMap<String, String>,
        workdir: &Path,
    ) -> RemakeResult<Execution> {
        template.check_parameters(method, parameters)?;
        let rendered = template.render(method, parameters)?;

        let argv = if template.use_shell {
            vec![self.shell.clone(), "-c".to_string(), rendered.join(" ")]
        } else {
            rendered
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(RemakeError::specification(method, "empty command"));
        };

        let failed = |reason: String| RemakeError::ComputationFailed {
            method: method.to_string(),
            parameters: parameters.clone(),
            reason,
        };

        info!("Running method {} in {}", method, workdir.display());
        debug!("Command line: {:?}", argv);

        let child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("cannot start {}: {}", program, e)))?;

        let started = Instant::now();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| RemakeError::ComputationTimeout {
                    method: method.to_string(),
                    seconds: limit.as_secs(),
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| failed(format!("waiting for {}: {}", program, e)))?;
        let duration = started.elapsed();

        if !output.status.success() {
            let status = match output.status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            let tail = error_output_tail(
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            );
            let reason = if tail.is_empty() {
                status
            } else {
                format!("{}\n{}", status, tail)
            };
            return Err(failed(reason));
        }

        debug!("Method {} finished in {:?}", method, duration);
        Ok(Execution { argv, duration })
    }
}
