//! デバッグ対象への割り込み
//!
//! CDB はパイプ越しに Ctrl+C を受け取れないため、補助プログラム
//! （`win64interrupt.exe <pid>` など）でデバッグ対象にブレークインを起こす。

use crate::Result;
use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// 割り込み用の補助プログラム
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    helper: Option<PathBuf>,
}

impl Interrupter {
    pub fn new(helper: Option<PathBuf>) -> Self {
        Self { helper }
    }

    /// 補助プログラムが設定されているか
    pub fn is_available(&self) -> bool {
        self.helper.is_some()
    }

    /// `helper <pid>` を実行して終了を待つ
    pub fn interrupt(&self, pid: u32) -> Result<()> {
        let helper = self
            .helper
            .as_ref()
            .ok_or_else(|| anyhow!("No interrupt helper configured"))?;
        debug!("Interrupting process {} via {}", pid, helper.display());
        let status = Command::new(helper)
            .arg(pid.to_string())
            .status()
            .with_context(|| format!("Cannot run {}", helper.display()))?;
        if !status.success() {
            return Err(anyhow!(
                "Cannot interrupt process {}: {} exited with {}",
                pid,
                helper.display(),
                status
            ));
        }
        Ok(())
    }
}
