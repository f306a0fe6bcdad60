//! CDB の起動パラメータとコマンドライン生成

use std::path::PathBuf;
use thiserror::Error;

/// 拡張ライブラリの検索パスを渡す環境変数
pub const EXTENSION_PATH_VARIABLE: &str = "_NT_DEBUGGER_EXTENSION_PATH";

/// デバッグ対象のログを OutputDebugString に流すための環境変数
const LOGGING_TO_CONSOLE_VARIABLE: &str = "QT_LOGGING_TO_CONSOLE";

/// 起動方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// 実行ファイルを CDB 配下で起動する
    StartInternal,
    /// 外部から指定された実行ファイルを起動する
    StartExternal,
    /// 実行中のプロセスにアタッチする
    AttachToLocalProcess,
    /// クラッシュしたプロセスにアタッチする（JIT デバッグ）
    AttachToCrashedProcess,
    /// クラッシュダンプを開く
    AttachToCore,
    /// リモートの CDB サーバに接続する
    AttachToRemoteServer,
}

impl StartMode {
    /// 既存プロセスへのアタッチか（終了時にデタッチする）
    pub fn is_attach(self) -> bool {
        matches!(
            self,
            StartMode::AttachToLocalProcess | StartMode::AttachToCrashedProcess
        )
    }

    pub fn is_remote(self) -> bool {
        self == StartMode::AttachToRemoteServer
    }
}

/// 起動時のエラー
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("There is no CDB executable specified.")]
    NoDebugger,
    #[error("The CDB executable {0} cannot be found.")]
    DebuggerNotFound(PathBuf),
    #[error("Internal error: The extension {0} cannot be found.")]
    ExtensionNotFound(PathBuf),
    #[error("Internal error: Unsupported start mode {0:?}: {1}")]
    UnsupportedStartMode(StartMode, &'static str),
    #[error("Internal error: Cannot start process {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// CDB の起動パラメータ
#[derive(Debug, Clone)]
pub struct LaunchParameters {
    /// cdb.exe
    pub debugger: PathBuf,
    /// 拡張ライブラリ（qtcreatorcdbext.dll）
    pub extension_library: PathBuf,
    pub start_mode: StartMode,
    /// デバッグ対象の実行ファイル
    pub executable: Option<PathBuf>,
    /// デバッグ対象の引数（そのままコマンドラインに付け加える）
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// デバッグ対象の環境変数（空なら親プロセスから継承）
    pub environment: Vec<(String, String)>,
    pub attach_pid: Option<u32>,
    /// `-e` に渡すイベントハンドル
    pub crash_parameter: Option<String>,
    pub core_file: Option<PathBuf>,
    /// `-remote` に渡す接続文字列
    pub remote_channel: Option<String>,
    /// 別コンソールで起動する（`-2`）
    pub use_terminal: bool,
    /// ターミナルスタブが起動したプロセスへのアタッチ（`-pr -pb`）
    pub launched_by_terminal_stub: bool,
    /// 初回の例外でアクセス違反を無視する（`-x`）
    pub ignore_first_chance_access_violation: bool,
    pub source_paths: Vec<String>,
    pub symbol_paths: Vec<String>,
    pub additional_arguments: Vec<String>,
}

impl LaunchParameters {
    pub fn new(debugger: impl Into<PathBuf>, extension_library: impl Into<PathBuf>) -> Self {
        Self {
            debugger: debugger.into(),
            extension_library: extension_library.into(),
            start_mode: StartMode::StartInternal,
            executable: None,
            arguments: Vec::new(),
            working_directory: None,
            environment: Vec::new(),
            attach_pid: None,
            crash_parameter: None,
            core_file: None,
            remote_channel: None,
            use_terminal: false,
            launched_by_terminal_stub: false,
            ignore_first_chance_access_violation: false,
            source_paths: Vec::new(),
            symbol_paths: Vec::new(),
            additional_arguments: Vec::new(),
        }
    }

    /// 拡張ライブラリのファイル名（`-a` と `.load` に渡す）
    ///
    /// Windows 形式のパスをどのホストでも扱えるよう、区切り文字は自前で探す。
    pub fn extension_file_name(&self) -> String {
        let path = self.extension_library.to_string_lossy();
        match path.rfind(['\\', '/']) {
            Some(pos) => path[pos + 1..].to_string(),
            None => path.into_owned(),
        }
    }

    /// 拡張ライブラリのあるディレクトリ
    pub fn extension_directory(&self) -> String {
        let path = self.extension_library.to_string_lossy();
        match path.rfind(['\\', '/']) {
            Some(pos) => path[..pos].to_string(),
            None => String::new(),
        }
    }

    /// CDB の引数を組み立てる（実行ファイル自身は含まない）
    pub fn command_line(&self, extension_command_prefix: &str) -> Result<Vec<String>, LaunchError> {
        let mut args = Vec::new();
        if self.start_mode.is_remote() {
            // 先頭でなければならない
            let channel = self.remote_channel.as_deref().ok_or(LaunchError::UnsupportedStartMode(
                self.start_mode,
                "no remote channel",
            ))?;
            args.push("-remote".to_string());
            args.push(channel.to_string());
        } else {
            args.push(format!("-a{}", self.extension_file_name()));
        }

        args.push("-lines".to_string());
        args.push("-G".to_string());
        args.push("-c".to_string());
        args.push(format!(".idle_cmd {}idle", extension_command_prefix));

        if self.use_terminal {
            args.push("-2".to_string());
        }
        if self.ignore_first_chance_access_violation {
            args.push("-x".to_string());
        }
        if !self.source_paths.is_empty() {
            args.push("-srcpath".to_string());
            args.push(self.source_paths.join(";"));
        }
        args.push("-y".to_string());
        args.push(format!("\"{}\"", self.symbol_paths.join(";")));
        args.extend(self.additional_arguments.iter().cloned());

        match self.start_mode {
            StartMode::StartInternal | StartMode::StartExternal => {
                let executable = self.executable.as_ref().ok_or(LaunchError::UnsupportedStartMode(
                    self.start_mode,
                    "no executable",
                ))?;
                args.push(executable.display().to_string());
                args.extend(self.arguments.iter().cloned());
            }
            StartMode::AttachToRemoteServer => {}
            StartMode::AttachToLocalProcess | StartMode::AttachToCrashedProcess => {
                let pid = self.attach_pid.ok_or(LaunchError::UnsupportedStartMode(
                    self.start_mode,
                    "no process id",
                ))?;
                args.push("-p".to_string());
                args.push(pid.to_string());
                if self.start_mode == StartMode::AttachToCrashedProcess {
                    args.push("-e".to_string());
                    args.push(self.crash_parameter.clone().unwrap_or_default());
                    args.push("-g".to_string());
                } else if self.launched_by_terminal_stub {
                    args.push("-pr".to_string());
                    args.push("-pb".to_string());
                }
            }
            StartMode::AttachToCore => {
                let core = self.core_file.as_ref().ok_or(LaunchError::UnsupportedStartMode(
                    self.start_mode,
                    "no core file",
                ))?;
                args.push("-z".to_string());
                args.push(core.display().to_string());
            }
        }
        Ok(args)
    }

    /// 子プロセスの環境変数を組み立てる
    ///
    /// `inherited_extension_path` は親プロセスの `_NT_DEBUGGER_EXTENSION_PATH`。
    pub fn process_environment(&self, inherited_extension_path: Option<&str>) -> Vec<(String, String)> {
        let mut env = self.environment.clone();

        if !self.use_terminal && !env.iter().any(|(k, _)| k == LOGGING_TO_CONSOLE_VARIABLE) {
            env.push((LOGGING_TO_CONSOLE_VARIABLE.to_string(), "0".to_string()));
        }

        let mut parts = vec![self.extension_directory()];
        if let Some(pos) = env.iter().position(|(k, _)| k == EXTENSION_PATH_VARIABLE) {
            let (_, existing) = env.remove(pos);
            if !existing.is_empty() {
                parts.push(existing);
            }
        }
        if let Some(inherited) = inherited_extension_path.filter(|s| !s.is_empty()) {
            parts.push(inherited.to_string());
        }
        env.push((EXTENSION_PATH_VARIABLE.to_string(), parts.join(";")));
        env
    }

    /// 起動前にファイルの存在を確認する
    pub fn check_files(&self) -> Result<(), LaunchError> {
        if self.debugger.as_os_str().is_empty() {
            return Err(LaunchError::NoDebugger);
        }
        if !self.debugger.is_file() {
            return Err(LaunchError::DebuggerNotFound(self.debugger.clone()));
        }
        if !self.extension_library.is_file() {
            return Err(LaunchError::ExtensionNotFound(self.extension_library.clone()));
        }
        Ok(())
    }

    /// 起動コマンドを組み立てる
    pub fn to_command(&self, extension_command_prefix: &str) -> Result<LaunchCommand, LaunchError> {
        self.check_files()?;
        let inherited = std::env::var(EXTENSION_PATH_VARIABLE).ok();
        Ok(LaunchCommand {
            program: self.debugger.clone(),
            arguments: self.command_line(extension_command_prefix)?,
            environment: self.process_environment(inherited.as_deref()),
            working_directory: self.working_directory.clone(),
        })
    }
}

/// 実際に起動するコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub arguments: Vec<String>,
    /// 追加・上書きする環境変数
    pub environment: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
}

impl LaunchCommand {
    /// ログ表示用のコマンドライン
    pub fn to_user_output(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.arguments {
            out.push(' ');
            if arg.contains(' ') && !arg.starts_with('"') {
                out.push('"');
                out.push_str(arg);
                out.push('"');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}
