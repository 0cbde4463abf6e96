//! Post-create provisioners.
//!
//! Provisioner blocks run ordered commands against a freshly created
//! instance. Connection fields and commands may read the new instance's
//! attributes through `${self.<attr>}`.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ConnectionMethod, OnFailure, ProvisionerConfig};
use crate::error::ProvisionerError;
use crate::graph::{lookup, parse_reference, render, Address, Attributes, Reference};

/// Command execution result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The command that ran.
    pub command: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Command output (stdout).
    pub stdout: String,
    /// Command error output (stderr).
    pub stderr: String,
    /// Exit code if available.
    pub exit_code: Option<i32>,
}

/// Runs provisioner commands over a connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisionerExecutor: Send + Sync {
    /// Runs `commands` in order, stopping at the first failure.
    ///
    /// Returns the outputs of every command that succeeded.
    async fn run(
        &self,
        connection: &ConnectionConfig,
        commands: &[String],
    ) -> Result<Vec<CommandOutput>, ProvisionerError>;
}

/// Executes commands on the local machine through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Creates a new local executor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn run_one(command: &str, timeout_secs: u64) -> Result<CommandOutput, ProvisionerError> {
        debug!("Executing local command: {}", command);

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisionerError::CommandFailed {
                command: command.to_string(),
                exit_code: None,
                stderr: e.to_string(),
            })?;

        let limit = Duration::from_secs(timeout_secs);
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ProvisionerError::Timeout {
                command: command.to_string(),
                timeout_secs,
            })?
            .map_err(|e| ProvisionerError::CommandFailed {
                command: command.to_string(),
                exit_code: None,
                stderr: e.to_string(),
            })?;

        Ok(CommandOutput {
            command: command.to_string(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

#[async_trait]
impl ProvisionerExecutor for LocalExecutor {
    async fn run(
        &self,
        connection: &ConnectionConfig,
        commands: &[String],
    ) -> Result<Vec<CommandOutput>, ProvisionerError> {
        if connection.method != ConnectionMethod::Local {
            return Err(ProvisionerError::UnsupportedConnection {
                method: connection.method.to_string(),
            });
        }

        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            let output = Self::run_one(command, connection.timeout_secs).await?;
            if !output.success {
                return Err(ProvisionerError::CommandFailed {
                    command: output.command,
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
            outputs.push(output);
        }
        Ok(outputs)
    }
}

/// Result of running every provisioner block of one instance.
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    /// Outputs of the commands that succeeded.
    pub outputs: Vec<CommandOutput>,
    /// Failures from blocks marked `on_failure: continue`.
    pub ignored: Vec<ProvisionerError>,
    /// The failure that taints the instance, if any.
    pub error: Option<ProvisionerError>,
}

impl ProvisionOutcome {
    /// Returns true if the instance must be recorded as tainted.
    #[must_use]
    pub const fn taints(&self) -> bool {
        self.error.is_some()
    }
}

/// Resolves and runs provisioner blocks.
#[derive(Clone)]
pub struct ProvisionerRunner {
    executor: Arc<dyn ProvisionerExecutor>,
}

impl std::fmt::Debug for ProvisionerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerRunner").finish_non_exhaustive()
    }
}

impl ProvisionerRunner {
    /// Creates a runner on top of an executor.
    #[must_use]
    pub fn new(executor: Arc<dyn ProvisionerExecutor>) -> Self {
        Self { executor }
    }

    /// Runs every block in order against the created instance.
    ///
    /// Stops at the first block whose failure taints the instance.
    pub async fn run_all(
        &self,
        address: &Address,
        provisioners: &[ProvisionerConfig],
        attributes: &Attributes,
    ) -> ProvisionOutcome {
        let mut outcome = ProvisionOutcome::default();

        for (i, block) in provisioners.iter().enumerate() {
            info!("Running provisioner {} of {} for {}", i + 1, provisioners.len(), address);

            let result = match resolve_block(block, attributes) {
                Ok((connection, commands)) => self.executor.run(&connection, &commands).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(outputs) => outcome.outputs.extend(outputs),
                Err(e) if block.on_failure == OnFailure::Continue => {
                    warn!("Provisioner for {} failed, continuing: {}", address, e);
                    outcome.ignored.push(e);
                }
                Err(e) => {
                    warn!("Provisioner for {} failed, instance will be tainted: {}", address, e);
                    outcome.error = Some(e);
                    break;
                }
            }
        }

        outcome
    }
}

fn resolve_block(
    block: &ProvisionerConfig,
    attributes: &Attributes,
) -> Result<(ConnectionConfig, Vec<String>), ProvisionerError> {
    let c = &block.connection;
    let field = |v: &Option<String>| v.as_deref().map(|s| resolve_text(s, attributes)).transpose();

    let connection = ConnectionConfig {
        method: c.method,
        host: field(&c.host)?,
        port: c.port,
        user: field(&c.user)?,
        password: field(&c.password)?,
        private_key: field(&c.private_key)?,
        timeout_secs: c.timeout_secs,
    };

    let commands = block
        .commands
        .iter()
        .map(|cmd| resolve_text(cmd, attributes))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((connection, commands))
}

/// Substitutes `${self.<attr>}` expressions in a string.
fn resolve_text(text: &str, attributes: &Attributes) -> Result<String, ProvisionerError> {
    let mut resolver = |body: &str| match parse_reference(body) {
        Ok(Reference::SelfAttr(path)) => lookup(attributes, &path),
        _ => None,
    };

    let rendered = render(&Value::String(text.to_string()), &mut resolver);
    if !rendered.is_known() {
        return Err(ProvisionerError::Resolution {
            message: format!("cannot resolve {} in '{text}'", rendered.unresolved.join(", ")),
        });
    }

    Ok(match rendered.value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs() -> Attributes {
        Attributes::from([
            ("public_ip".to_string(), json!("10.0.0.5")),
            ("port".to_string(), json!(8080)),
        ])
    }

    fn block(commands: &[&str], on_failure: OnFailure) -> ProvisionerConfig {
        ProvisionerConfig {
            connection: ConnectionConfig::default(),
            commands: commands.iter().map(ToString::to_string).collect(),
            on_failure,
        }
    }

    #[test]
    fn test_resolve_self_reference() {
        let text = resolve_text("curl http://${self.public_ip}:${self.port}/", &attrs()).unwrap();
        assert_eq!(text, "curl http://10.0.0.5:8080/");
        assert_eq!(resolve_text("${self.port}", &attrs()).unwrap(), "8080");
    }

    #[test]
    fn test_resolve_missing_attribute_fails() {
        let err = resolve_text("ping ${self.missing}", &attrs()).unwrap_err();
        assert!(matches!(err, ProvisionerError::Resolution { .. }));
    }

    #[tokio::test]
    async fn test_runner_passes_resolved_commands() {
        let mut executor = MockProvisionerExecutor::new();
        executor
            .expect_run()
            .withf(|_, commands| commands.len() == 1 && commands[0] == "echo 10.0.0.5")
            .times(1)
            .returning(|_, _| Ok(vec![CommandOutput::default()]));

        let runner = ProvisionerRunner::new(Arc::new(executor));
        let outcome = runner
            .run_all(
                &Address::new("null_vm", "web"),
                &[block(&["echo ${self.public_ip}"], OnFailure::Taint)],
                &attrs(),
            )
            .await;

        assert!(!outcome.taints());
        assert_eq!(outcome.outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_runner_failure_taints_and_stops() {
        let mut executor = MockProvisionerExecutor::new();
        executor
            .expect_run()
            .times(1)
            .returning(|_, _| {
                Err(ProvisionerError::CommandFailed {
                    command: "false".into(),
                    exit_code: Some(1),
                    stderr: String::new(),
                })
            });

        let runner = ProvisionerRunner::new(Arc::new(executor));
        let outcome = runner
            .run_all(
                &Address::new("null_vm", "web"),
                &[block(&["false"], OnFailure::Taint), block(&["true"], OnFailure::Taint)],
                &attrs(),
            )
            .await;

        assert!(outcome.taints());
    }

    #[tokio::test]
    async fn test_runner_continue_does_not_taint() {
        let mut executor = MockProvisionerExecutor::new();
        executor.expect_run().times(2).returning(|_, commands| {
            if commands[0] == "false" {
                Err(ProvisionerError::CommandFailed {
                    command: "false".into(),
                    exit_code: Some(1),
                    stderr: String::new(),
                })
            } else {
                Ok(vec![CommandOutput::default()])
            }
        });

        let runner = ProvisionerRunner::new(Arc::new(executor));
        let outcome = runner
            .run_all(
                &Address::new("null_vm", "web"),
                &[block(&["false"], OnFailure::Continue), block(&["true"], OnFailure::Taint)],
                &attrs(),
            )
            .await;

        assert!(!outcome.taints());
        assert_eq!(outcome.ignored.len(), 1);
        assert_eq!(outcome.outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_local_executor_runs_commands() {
        let executor = LocalExecutor::new();
        let outputs = executor
            .run(&ConnectionConfig::default(), &["echo hello".to_string()])
            .await
            .unwrap();
        assert_eq!(outputs[0].stdout.trim(), "hello");
        assert_eq!(outputs[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_local_executor_reports_failure() {
        let executor = LocalExecutor::new();
        let err = executor
            .run(&ConnectionConfig::default(), &["exit 3".to_string(), "echo never".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionerError::CommandFailed { exit_code: Some(3), .. }));
    }

    #[tokio::test]
    async fn test_local_executor_rejects_ssh() {
        let connection = ConnectionConfig {
            method: ConnectionMethod::Ssh,
            host: Some("10.0.0.5".into()),
            ..ConnectionConfig::default()
        };
        let err = LocalExecutor::new()
            .run(&connection, &["true".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionerError::UnsupportedConnection { .. }));
    }
}
