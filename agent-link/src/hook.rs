// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent-side execution of rolling maintenance hooks
//!
//! For each agent-executed stage, the agent invokes one executable at a fixed
//! path with the stage name as its only argument and the operator's payload on
//! stdin.  The hook's exit status decides success.  The hook may print a JSON
//! [`HookResult`] on stdout to report details; anything else printed on stdout
//! (or stderr, if stdout is empty) is taken as the details text.
//!
//! The whole exchange with the hook (feeding it the payload, collecting its
//! output, and waiting for it to exit) is bounded.  If the timeout fires, the
//! child process is killed.

use camino::Utf8PathBuf;
use keel_types::answer::Answer;
use keel_types::answer::AnswerKind;
use keel_types::answer::RollingMaintenanceAnswer;
use keel_types::maintenance::Stage;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::process::Output;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("maintenance hook {path} does not exist")]
    NotFound { path: Utf8PathBuf },

    #[error("failed to spawn maintenance hook {path}")]
    Spawn {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to pass payload to maintenance hook {path}")]
    Stdin {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed waiting for maintenance hook {path}")]
    Wait {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("maintenance hook {path} did not finish within {timeout:?}")]
    Timeout { path: Utf8PathBuf, timeout: Duration },
}

/// Structured result a hook may print on stdout
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HookResult {
    pub success: bool,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub reboot_required: bool,
}

impl HookResult {
    /// Converts this result into the answer the agent sends back
    pub fn into_answer(self) -> Answer {
        let kind = AnswerKind::RollingMaintenance(RollingMaintenanceAnswer {
            finished: true,
            reboot_required: self.reboot_required,
        });
        let answer = if self.success {
            Answer::success(self.details)
        } else {
            Answer::failure(self.details)
        };
        answer.with_kind(kind)
    }
}

/// Runs the rolling maintenance hook on an agent
pub struct HookExecutor {
    log: Logger,
    path: Utf8PathBuf,
    timeout: Duration,
}

impl HookExecutor {
    pub fn new(log: &Logger, path: Utf8PathBuf, timeout: Duration) -> Self {
        let log = log.new(o!(
            "component" => "HookExecutor",
            "hook" => path.to_string(),
        ));
        HookExecutor { log, path, timeout }
    }

    /// Run the hook for `stage`, handing it `payload` on stdin
    pub async fn run(
        &self,
        stage: Stage,
        payload: &str,
    ) -> Result<HookResult, HookError> {
        if !self.path.exists() {
            return Err(HookError::NotFound { path: self.path.clone() });
        }

        debug!(self.log, "running maintenance hook"; "stage" => %stage);
        let mut child = tokio::process::Command::new(&self.path)
            .arg(stage.hook_argument())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| HookError::Spawn { path: self.path.clone(), err })?;

        // Feeding the payload happens under the same timeout as the rest of
        // the exchange: a hook that never reads stdin would otherwise block
        // a large write forever.
        let exchanged = tokio::time::timeout(
            self.timeout,
            self.exchange(&mut child, payload),
        )
        .await;
        let output = match exchanged {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    self.log,
                    "maintenance hook timed out, killing it";
                    "stage" => %stage,
                    "timeout" => ?self.timeout,
                );
                if let Err(err) = child.kill().await {
                    warn!(
                        self.log,
                        "failed to kill maintenance hook";
                        InlineErrorChain::new(&err),
                    );
                }
                return Err(HookError::Timeout {
                    path: self.path.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let exited_ok = output.status.success();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let result = match serde_json::from_str::<HookResult>(&stdout) {
            Ok(reported) => HookResult {
                success: exited_ok && reported.success,
                ..reported
            },
            Err(_) => {
                let details = if stdout.is_empty() { stderr } else { stdout };
                HookResult {
                    success: exited_ok,
                    details,
                    reboot_required: false,
                }
            }
        };

        info!(
            self.log,
            "maintenance hook finished";
            "stage" => %stage,
            "status" => %output.status,
            "success" => result.success,
        );
        Ok(result)
    }

    /// Write `payload` to the hook's stdin while collecting its output, then
    /// wait for it to exit
    async fn exchange(
        &self,
        child: &mut Child,
        payload: &str,
    ) -> Result<Output, HookError> {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            // A hook that exits without reading its payload closes the pipe
            // early.  That's not an error.  Dropping `stdin` afterwards gives
            // the hook its EOF.
            match stdin.write_all(payload.as_bytes()).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    Ok(())
                }
                Err(err) => {
                    Err(HookError::Stdin { path: self.path.clone(), err })
                }
            }
        };
        let wait_error = |err: std::io::Error| HookError::Wait {
            path: self.path.clone(),
            err,
        };

        let ((), stdout, stderr, status) = tokio::try_join!(
            feed,
            async { read_pipe(stdout).await.map_err(wait_error) },
            async { read_pipe(stderr).await.map_err(wait_error) },
            async { child.wait().await.map_err(wait_error) },
        )?;
        Ok(Output { status, stdout, stderr })
    }

    /// Run the hook and express the outcome as an [`Answer`]
    ///
    /// Failing to run the hook at all is a failed answer, not a link error:
    /// the agent did receive and process the command.
    pub async fn answer(&self, stage: Stage, payload: &str) -> Answer {
        match self.run(stage, payload).await {
            Ok(result) => result.into_answer(),
            Err(error) => {
                warn!(
                    self.log,
                    "failed to run maintenance hook";
                    "stage" => %stage,
                    InlineErrorChain::new(&error),
                );
                Answer::failure(InlineErrorChain::new(&error).to_string())
            }
        }
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> Result<Vec<u8>, std::io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
