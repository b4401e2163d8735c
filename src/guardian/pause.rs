//! Protocol pause.
//!
//! The guardian only decides *when* to halt deposits. Signing and sending
//! the pause transaction belongs to an external tool, invoked here as a
//! configured command. Without one the guardian runs in dry-run mode and
//! only logs the halt it would have performed.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum PauseError {
    #[error("pause command is empty")]
    EmptyCommand,
    #[error("failed to run pause command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("pause command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

#[async_trait]
pub trait ProtocolPauser: Send + Sync {
    /// Halt deposits. Must be safe to call again while already paused.
    async fn pause(&self) -> Result<(), PauseError>;
}

/// Runs an external executable, e.g. `["pause-deposits", "--network", "mainnet"]`.
pub struct CommandPauser {
    program: String,
    args: Vec<String>,
}

impl CommandPauser {
    pub fn new(command: &[String]) -> Result<Self, PauseError> {
        let (program, args) = command.split_first().ok_or(PauseError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ProtocolPauser for CommandPauser {
    async fn pause(&self) -> Result<(), PauseError> {
        info!(program = %self.program, "executing protocol pause");

        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(status = %output.status, stderr = %stderr, "protocol pause failed");
            return Err(PauseError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }

        info!("protocol paused");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunPauser;

#[async_trait]
impl ProtocolPauser for DryRunPauser {
    async fn pause(&self) -> Result<(), PauseError> {
        error!("DRY RUN: protocol pause required but no pause command is configured");
        Ok(())
    }
}
