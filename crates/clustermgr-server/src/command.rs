//! External command collaborator.
//!
//! Commands are JSON objects with a `prefix` naming the operation, answered
//! with `(code, outbl, outs)`: zero or a negative errno, a data payload, and a
//! human-readable status line.

use std::time::Duration;

use async_trait::async_trait;
use clustermgr_proto::DaemonType;
use serde_json::{json, Value};

use crate::error::{MgrError, Result};

/// No such entity.
pub const ENOENT: i32 = -2;
/// Invalid argument.
pub const EINVAL: i32 = -22;
/// Command did not finish in time.
pub const ETIMEDOUT: i32 = -110;

/// Reply to one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Zero on success, a negative errno otherwise.
    pub code: i32,
    /// Output payload.
    pub outbl: Vec<u8>,
    /// Status message.
    pub outs: String,
}

impl CommandResult {
    /// A successful reply carrying `outbl`.
    pub fn ok(outbl: impl Into<Vec<u8>>) -> Self {
        Self {
            code: 0,
            outbl: outbl.into(),
            outs: String::new(),
        }
    }

    /// A failed reply.
    pub fn error(code: i32, outs: impl Into<String>) -> Self {
        Self {
            code,
            outbl: Vec::new(),
            outs: outs.into(),
        }
    }

    /// Whether the code is zero.
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// The payload, or [`MgrError::CommandFailed`] for a nonzero code.
    pub fn into_output(self, cmd: &Value) -> Result<Vec<u8>> {
        if self.is_success() {
            Ok(self.outbl)
        } else {
            Err(MgrError::CommandFailed {
                cmd: command_prefix(cmd),
                code: self.code,
                outs: self.outs,
            })
        }
    }
}

/// Something that can execute cluster commands.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs one command to completion.
    async fn run_command(&self, cmd: &Value) -> CommandResult;
}

/// Runs a command with a deadline and maps failures to errors.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    cmd: &Value,
    timeout: Duration,
) -> Result<Vec<u8>> {
    match tokio::time::timeout(timeout, runner.run_command(cmd)).await {
        Ok(result) => result.into_output(cmd),
        Err(_) => Err(MgrError::CommandTimeout {
            cmd: command_prefix(cmd),
            timeout_secs: timeout.as_secs(),
        }),
    }
}

/// Like [`run_checked`], but reports a timeout as an `ETIMEDOUT` reply.
pub async fn run_with_timeout(
    runner: &dyn CommandRunner,
    cmd: &Value,
    timeout: Duration,
) -> CommandResult {
    tokio::time::timeout(timeout, runner.run_command(cmd))
        .await
        .unwrap_or_else(|_| CommandResult::error(ETIMEDOUT, "command timed out"))
}

/// The `prefix` of a command, for logs and errors.
pub fn command_prefix(cmd: &Value) -> String {
    cmd.get("prefix")
        .and_then(Value::as_str)
        .unwrap_or("<no prefix>")
        .to_string()
}

/// `<type> metadata`, for one daemon or all of them.
pub fn metadata_command(daemon_type: DaemonType, id: Option<&str>) -> Value {
    let prefix = format!("{} metadata", daemon_type);
    match id {
        Some(id) => json!({ "prefix": prefix, "id": id }),
        None => json!({ "prefix": prefix }),
    }
}

/// Reads one stored key.
pub fn config_key_get(key: &str) -> Value {
    json!({ "prefix": "config-key get", "key": key })
}

/// Stores one key.
pub fn config_key_put(key: &str, val: &str) -> Value {
    json!({ "prefix": "config-key put", "key": key, "val": val })
}

/// Lists every stored key.
pub fn config_key_list() -> Value {
    json!({ "prefix": "config-key list" })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(CommandResult);

    #[async_trait]
    impl CommandRunner for Fixed {
        async fn run_command(&self, _cmd: &Value) -> CommandResult {
            self.0.clone()
        }
    }

    struct Never;

    #[async_trait]
    impl CommandRunner for Never {
        async fn run_command(&self, _cmd: &Value) -> CommandResult {
            std::future::pending().await
        }
    }

    #[test]
    fn test_builders() {
        assert_eq!(
            metadata_command(DaemonType::Osd, Some("3")),
            json!({"prefix": "osd metadata", "id": "3"})
        );
        assert_eq!(metadata_command(DaemonType::Mon, None), json!({"prefix": "mon metadata"}));
        assert_eq!(command_prefix(&config_key_list()), "config-key list");
        assert_eq!(config_key_put("k", "v")["val"], "v");
        assert_eq!(command_prefix(&json!({})), "<no prefix>");
    }

    #[tokio::test]
    async fn test_run_checked_success_and_failure() {
        let ok = Fixed(CommandResult::ok(b"[]".to_vec()));
        assert_eq!(
            run_checked(&ok, &config_key_list(), Duration::from_secs(1)).await.unwrap(),
            b"[]"
        );

        let failed = Fixed(CommandResult::error(ENOENT, "no such key"));
        let err = run_checked(&failed, &config_key_get("x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MgrError::CommandFailed { code: ENOENT, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let err = run_checked(&Never, &config_key_list(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, MgrError::CommandTimeout { timeout_secs: 30, .. }));

        let r = run_with_timeout(&Never, &config_key_list(), Duration::from_secs(30)).await;
        assert_eq!(r.code, ETIMEDOUT);
    }
}
