//! CDB プロセスの制御
//!
//! 標準入出力をパイプでつなぎ、標準出力と標準エラー出力をそれぞれ
//! 読み取りスレッドで行に分割してチャネルへ送ります。

use crate::interrupter::Interrupter;
use crate::launch::{LaunchCommand, LaunchError};
use crate::line_buffer::LineBuffer;
use crate::transport::{Transport, TransportEvent};
use crate::Result;
use anyhow::{anyhow, Context};
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// CDB の子プロセス
///
/// イベントは `E: From<TransportEvent>` に変換して送る。
/// 呼び出し側は自分のイベント型で標準入力など別の入力源と合流できる。
pub struct CdbProcess<E> {
    child: Option<Arc<Mutex<Child>>>,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    events: Sender<E>,
    interrupter: Interrupter,
}

impl<E> CdbProcess<E>
where
    E: From<TransportEvent> + Send + 'static,
{
    pub fn new(events: Sender<E>, interrupter: Interrupter) -> Self {
        Self {
            child: None,
            stdin: None,
            pid: None,
            events,
            interrupter,
        }
    }

    /// 標準出力の読み取りループ（別スレッド）
    fn read_stdout(
        mut reader: impl Read,
        child: Arc<Mutex<Child>>,
        events: Sender<E>,
    ) {
        let mut buffer = LineBuffer::new();
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        if events.send(TransportEvent::Line(line).into()).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Error reading CDB output: {}", e);
                    let _ = events.send(TransportEvent::Error(e.to_string()).into());
                    break;
                }
            }
        }
        if let Some(rest) = buffer.flush() {
            let _ = events.send(TransportEvent::Line(rest).into());
        }

        let code = Self::wait_for_exit(&child);
        info!("CDB exited with code {:?}", code);
        let _ = events.send(TransportEvent::Exited { code }.into());
    }

    /// 標準出力が閉じた後、終了コードを回収する
    ///
    /// `kill` がロックを取れるよう、待機中はロックを保持しない。
    fn wait_for_exit(child: &Arc<Mutex<Child>>) -> Option<i32> {
        loop {
            let status = match child.lock() {
                Ok(mut guard) => guard.try_wait(),
                Err(_) => return None,
            };
            match status {
                Ok(Some(status)) => return status.code(),
                Ok(None) => thread::sleep(Duration::from_millis(20)),
                Err(e) => {
                    warn!("Failed to wait for CDB: {}", e);
                    return None;
                }
            }
        }
    }
}

impl<E> Transport for CdbProcess<E>
where
    E: From<TransportEvent> + Send + 'static,
{
    fn start(&mut self, command: &LaunchCommand) -> std::result::Result<(), LaunchError> {
        info!("Launching {}", command.to_user_output());

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.arguments)
            .envs(command.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.working_directory {
            cmd.current_dir(dir);
        }

        let spawn_error = |source| LaunchError::Spawn {
            program: command.to_user_output(),
            source,
        };
        let mut child = cmd.spawn().map_err(spawn_error)?;
        let missing_pipe = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing pipe");
        let stdin = child.stdin.take().ok_or_else(|| spawn_error(missing_pipe()))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_error(missing_pipe()))?;
        let stderr = child.stderr.take().ok_or_else(|| spawn_error(missing_pipe()))?;

        let pid = child.id();
        debug!("CDB running as {}", pid);
        let child = Arc::new(Mutex::new(child));

        let stdout_events = self.events.clone();
        let stdout_child = Arc::clone(&child);
        thread::spawn(move || Self::read_stdout(stdout, stdout_child, stdout_events));

        let stderr_events = self.events.clone();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => {
                        if stderr_events.send(TransportEvent::Stderr(line).into()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.pid = Some(pid);
        Ok(())
    }

    fn write(&mut self, text: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("CDB process is not running"))?;
        stdin
            .write_all(text.as_bytes())
            .and_then(|_| stdin.flush())
            .context("Failed to write to CDB")?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        match &self.child {
            Some(child) => match child.lock() {
                Ok(mut guard) => matches!(guard.try_wait(), Ok(None)),
                Err(_) => false,
            },
            None => false,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&mut self) {
        self.stdin = None;
        if let Some(child) = &self.child {
            if let Ok(mut guard) = child.lock() {
                if let Err(e) = guard.kill() {
                    debug!("Kill failed: {}", e);
                }
            }
        }
    }

    fn interrupt(&mut self, inferior_pid: u32) -> Result<()> {
        self.interrupter.interrupt(inferior_pid)
    }
}
