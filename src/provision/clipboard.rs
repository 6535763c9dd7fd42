use crate::config::ClipboardConfig;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMethod {
    Primary,
    Fallback,
}

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("ни один способ копирования не сработал")]
    Unavailable,
}

/// Copies text through external clipboard tools: the primary clipboard first,
/// then selection-based tools.
#[derive(Debug, Clone)]
pub struct Clipboard {
    primary: Vec<Vec<String>>,
    fallback: Vec<Vec<String>>,
}

impl Clipboard {
    pub fn new(primary: Vec<Vec<String>>, fallback: Vec<Vec<String>>) -> Self {
        Self { primary, fallback }
    }

    pub fn from_config(cfg: &ClipboardConfig) -> Self {
        Self::new(cfg.primary.clone(), cfg.fallback.clone())
    }

    pub async fn copy(&self, text: &str) -> Result<CopyMethod, ClipboardError> {
        if try_commands(&self.primary, text).await {
            return Ok(CopyMethod::Primary);
        }
        warn!("основной буфер обмена недоступен, пробуем выделение");
        if try_commands(&self.fallback, text).await {
            return Ok(CopyMethod::Fallback);
        }
        Err(ClipboardError::Unavailable)
    }
}

async fn try_commands(commands: &[Vec<String>], text: &str) -> bool {
    for argv in commands {
        match run_with_stdin(argv, text).await {
            Ok(()) => return true,
            Err(err) => debug!(command = ?argv, error = %err, "команда копирования не удалась"),
        }
    }
    false
}

async fn run_with_stdin(argv: &[String], text: &str) -> std::io::Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "пустая команда"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("код завершения {status}"),
        ))
    }
}
