//! エンジンの設定と起動パラメータ

use cdbe_mi::SourcePathMapping;
use cdbe_target::LaunchParameters;
pub use cdbe_target::StartMode;

/// ユーザー設定
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// 文字列表示の最大長
    pub max_string_length: u32,
    /// スタックの最大深さ
    pub max_stack_depth: u32,
    /// 初回例外でタスクを作る
    pub first_chance_exception_task_entry: bool,
    /// 2回目の例外でタスクを作る
    pub second_chance_exception_task_entry: bool,
    pub use_debugging_helpers: bool,
    pub sort_struct_members: bool,
    /// 命令単位でステップする
    pub operate_by_instruction: bool,
    pub source_paths: Vec<String>,
    pub symbol_paths: Vec<String>,
    /// `sxe` に渡すイベント名
    pub break_events: Vec<String>,
    pub break_on_crt_dbg_report: bool,
    /// ソースを読んでブレークポイントの行を補正する
    pub breakpoint_correction: bool,
    pub ignore_first_chance_access_violation: bool,
    pub additional_arguments: Vec<String>,
    /// Python ブリッジを使う
    pub use_python_bridge: bool,
    /// 停止ごとにレジスタを取得する
    pub registers_visible: bool,
    /// 停止ごとにモジュール一覧を取得する
    pub modules_visible: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_string_length: 10000,
            max_stack_depth: 1000,
            first_chance_exception_task_entry: false,
            second_chance_exception_task_entry: true,
            use_debugging_helpers: true,
            sort_struct_members: true,
            operate_by_instruction: false,
            source_paths: Vec::new(),
            symbol_paths: Vec::new(),
            break_events: Vec::new(),
            break_on_crt_dbg_report: false,
            breakpoint_correction: true,
            ignore_first_chance_access_violation: false,
            additional_arguments: Vec::new(),
            use_python_bridge: false,
            registers_visible: false,
            modules_visible: false,
        }
    }
}

/// デバッグ対象のツールチェーンのランタイム
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeFlavour {
    Msvc2005,
    Msvc2008,
    Msvc2010,
    Msvc2012,
    Msvc2013,
    Msvc2015,
    Msvc2017,
    Msvc2019,
    MinGw,
    #[default]
    Unknown,
}

impl RuntimeFlavour {
    /// `_CrtDbgReport` を持つ DLL の名前
    pub fn msvc_runtime(self) -> &'static str {
        match self {
            RuntimeFlavour::Msvc2005 => "MSVCR80",
            RuntimeFlavour::Msvc2008 => "MSVCR90",
            RuntimeFlavour::Msvc2010 => "MSVCR100",
            RuntimeFlavour::Msvc2012 => "MSVCR110",
            RuntimeFlavour::Msvc2013 => "MSVCR120",
            RuntimeFlavour::Msvc2015 => "MSVCR140",
            _ => "MSVCRT",
        }
    }

    /// `_CrtDbgReport` にブレークポイントを置けるか
    ///
    /// 2015 以降は UCRT に移っており、エクスポート名が異なる。
    pub fn supports_crt_dbg_report(self) -> bool {
        matches!(
            self,
            RuntimeFlavour::Msvc2005
                | RuntimeFlavour::Msvc2008
                | RuntimeFlavour::Msvc2010
                | RuntimeFlavour::Msvc2012
                | RuntimeFlavour::Msvc2013
        )
    }
}

/// 1回のデバッグセッションの起動パラメータ
#[derive(Debug, Clone)]
pub struct RunParameters {
    pub launch: LaunchParameters,
    /// `main` で止める
    pub break_on_main: bool,
    /// 接続直後に送る CDB コマンド
    pub commands_after_connect: Vec<String>,
    pub source_path_map: Vec<SourcePathMapping>,
    pub runtime_flavour: RuntimeFlavour,
    pub cdb_is_64bit: bool,
}

impl RunParameters {
    pub fn new(launch: LaunchParameters) -> Self {
        Self {
            launch,
            break_on_main: false,
            commands_after_connect: Vec::new(),
            source_path_map: Vec::new(),
            runtime_flavour: RuntimeFlavour::default(),
            cdb_is_64bit: true,
        }
    }

    pub fn start_mode(&self) -> StartMode {
        self.launch.start_mode
    }

    /// 実行ファイル名の最初の `.` までをモジュール名とする
    pub fn executable_module(&self) -> Option<String> {
        let path = self.launch.executable.as_ref()?.to_string_lossy().into_owned();
        let file = match path.rfind(['\\', '/']) {
            Some(pos) => &path[pos + 1..],
            None => path.as_str(),
        };
        let module = file.split('.').next().unwrap_or(file);
        (!module.is_empty()).then(|| module.to_string())
    }

    /// デバッグ対象の環境変数を探す
    pub fn inferior_environment(&self, name: &str) -> Option<&str> {
        self.launch
            .environment
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msvc_runtime() {
        assert_eq!(RuntimeFlavour::Msvc2010.msvc_runtime(), "MSVCR100");
        assert_eq!(RuntimeFlavour::Msvc2019.msvc_runtime(), "MSVCRT");
        assert!(RuntimeFlavour::Msvc2013.supports_crt_dbg_report());
        assert!(!RuntimeFlavour::MinGw.supports_crt_dbg_report());
    }

    #[test]
    fn test_executable_module() {
        let mut launch = LaunchParameters::new("cdb.exe", "ext.dll");
        launch.executable = Some("C:\\work\\my.app.exe".into());
        let params = RunParameters::new(launch);
        assert_eq!(params.executable_module().as_deref(), Some("my"));
    }

    #[test]
    fn test_inferior_environment_is_case_insensitive() {
        let mut launch = LaunchParameters::new("cdb.exe", "ext.dll");
        launch.environment.push(("_nt_symbol_path".into(), "srv*c:\\sym".into()));
        let params = RunParameters::new(launch);
        assert_eq!(params.inferior_environment("_NT_SYMBOL_PATH"), Some("srv*c:\\sym"));
        assert_eq!(params.inferior_environment("_NT_ALT_SYMBOL_PATH"), None);
    }
}
