//! CDB エンジン
//!
//! CDB の出力行と拡張ライブラリの通知を受け取り、状態を進めてコマンドを送ります。
//! 入出力は `Transport` に、表示は `EngineSink` に任せます。
//! イベント駆動で、1つのスレッドから `handle_event` を呼び出して使います。

use crate::breakpoint::BreakpointBook;
use crate::callback::Callback;
use crate::demux::{has_auto_breakpoint_correction, Demux, DemuxEvent};
use crate::disasm::SymbolAddressCache;
use crate::dispatcher::{Dispatcher, Outgoing, Post};
use crate::protocol::{DebuggerCommand, Response, EXTENSION_PREFIX};
use crate::session::{cdb_status_name, EngineState, Phase, SessionContext, StopMode, Wow64State, CDB_STATUS_NO_DEBUGGEE};
use crate::settings::{EngineSettings, RunParameters};
use crate::sink::{EngineSink, LogChannel};
use crate::stack::SourcePathCache;
use crate::Result;
use cdbe_mi::exception::{EXCEPTION_CPP, EXCEPTION_SET_THREAD_NAME, EXCEPTION_WX86_BREAKPOINT};
use cdbe_mi::utils::decode_utf16_hex;
use cdbe_mi::{Frame, MiValue, SourcePathMapping, ThreadList, WinException};
use cdbe_target::{StartMode, Transport, TransportEvent};
use tracing::{debug, info, trace, warn};

/// CDB を操作するエンジン
pub struct CdbEngine<T: Transport, S: EngineSink> {
    pub(crate) transport: T,
    pub(crate) sink: S,
    pub(crate) settings: EngineSettings,
    pub(crate) params: RunParameters,
    pub(crate) state: EngineState,
    pub(crate) session: SessionContext,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) demux: Demux,
    pub(crate) breakpoints: BreakpointBook,
    pub(crate) source_paths: SourcePathCache,
    pub(crate) source_mappings: Vec<SourcePathMapping>,
    pub(crate) symbols: SymbolAddressCache,
    pub(crate) threads: ThreadList,
    pub(crate) frames: Vec<Frame>,
    /// `print(sys.version)` で得たバージョン（`0x030a04` の形）
    pub(crate) python_version: u32,
}

impl<T: Transport, S: EngineSink> CdbEngine<T, S> {
    pub fn new(transport: T, sink: S, settings: EngineSettings, params: RunParameters) -> Result<Self> {
        Ok(Self {
            transport,
            sink,
            settings,
            params,
            state: EngineState::NotReady,
            session: SessionContext::default(),
            dispatcher: Dispatcher::new(),
            demux: Demux::new()?,
            breakpoints: BreakpointBook::new(),
            source_paths: SourcePathCache::new(),
            source_mappings: Vec::new(),
            symbols: SymbolAddressCache::new(),
            threads: ThreadList::default(),
            frames: Vec::new(),
            python_version: 0,
        })
    }

    /// ソースファイルの存在確認を差し替える
    pub fn with_source_path_cache(mut self, cache: SourcePathCache) -> Self {
        self.source_paths = cache;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut EngineSettings {
        &mut self.settings
    }

    pub fn params(&self) -> &RunParameters {
        &self.params
    }

    pub fn breakpoints(&self) -> &BreakpointBook {
        &self.breakpoints
    }

    pub fn threads(&self) -> &ThreadList {
        &self.threads
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn source_mappings(&self) -> &[SourcePathMapping] {
        &self.source_mappings
    }

    pub fn inferior_pid(&self) -> Option<u32> {
        self.session.inferior_pid
    }

    pub fn python_version(&self) -> u32 {
        self.python_version
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// 応答待ちまたは未送信のコマンドがあるか
    pub fn commands_pending(&self) -> bool {
        self.dispatcher.has_pending()
    }

    pub(crate) fn show(&mut self, text: &str, channel: LogChannel) {
        self.sink.show_message(text, channel);
    }

    pub(crate) fn set_state(&mut self, state: EngineState) {
        if self.state == state {
            return;
        }
        debug!("State {:?} -> {:?}", self.state, state);
        self.state = state;
        self.sink.state_changed(state);
    }

    /// セッションごとの状態をすべて初期化する
    pub(crate) fn init(&mut self) {
        self.session = SessionContext::default();
        self.dispatcher.clear();
        self.demux.reset();
        self.source_paths.clear();
        self.symbols.clear();
        self.threads = ThreadList::default();
        self.frames.clear();
        self.python_version = 0;
        self.breakpoints.clear_pending();

        self.source_mappings.clear();
        for mapping in &self.params.source_path_map {
            if !self.source_mappings.contains(mapping) {
                self.source_mappings.push(mapping.clone());
            }
        }
    }

    // ---- コマンド送信 ----

    /// コマンドを送る
    ///
    /// セッションがアクセス可能でなければ、割り込みをかけてから送る。
    pub(crate) fn run_command(&mut self, command: DebuggerCommand) {
        if self.state.phase() == Phase::Terminated || !self.transport.is_running() {
            warn!("Dropping command \"{}\": CDB is not running", command.display_text());
            return;
        }
        if !self.session.accessible {
            let message = format!(
                "Attempt to issue command \"{}\" to non-accessible session ({:?})... interrupting",
                command.display_text(),
                self.state
            );
            self.do_interrupt_inferior(Some(command));
            self.show(&message, LogChannel::Misc);
            return;
        }
        match self.dispatcher.post(command) {
            Post::Write(outgoing) => self.write_outgoing(outgoing),
            Post::Queued => {}
        }
    }

    fn write_outgoing(&mut self, outgoing: Outgoing) {
        if outgoing.too_long {
            self.show(
                "Command is longer than 4096 characters execution will likely fail.",
                LogChannel::Warning,
            );
        }
        self.show(&outgoing.echo, LogChannel::Input);
        if let Err(e) = self.transport.write(&outgoing.text) {
            self.show(&format!("Cannot write command \"{}\": {:#}", outgoing.echo, e), LogChannel::Error);
        }
    }

    /// 組み込みコマンドの完了で送れるようになったコマンドを送る
    pub(crate) fn flush_backlog(&mut self) {
        while self.session.accessible {
            match self.dispatcher.next_backlogged() {
                Some(outgoing) => self.write_outgoing(outgoing),
                None => break,
            }
        }
    }

    // ---- 割り込み ----

    pub(crate) fn can_interrupt_inferior(&self) -> bool {
        !self.params.start_mode().is_remote() && self.session.inferior_pid.is_some()
    }

    /// 割り込みをかける。`deferred` は次の `session_idle` で送る
    pub(crate) fn do_interrupt_inferior(&mut self, deferred: Option<DebuggerCommand>) {
        let request_interrupt = self.session.stop_mode == StopMode::NoStopRequested;
        match deferred {
            Some(command) => {
                self.session.deferred.push(command);
                if !self.session.initial_idle_handled {
                    return;
                }
                if self.session.stop_mode == StopMode::NoStopRequested {
                    self.session.stop_mode = StopMode::Callback;
                }
            }
            None => self.session.stop_mode = StopMode::Interrupt,
        }
        if !request_interrupt {
            return;
        }
        let Some(pid) = self.session.inferior_pid else {
            self.show("Cannot interrupt: the process id is unknown.", LogChannel::Error);
            self.session.stop_mode = StopMode::NoStopRequested;
            self.set_state(EngineState::InferiorStopFailed);
            return;
        };
        self.show(&format!("Interrupting process {}...", pid), LogChannel::Misc);
        match self.transport.interrupt(pid) {
            Ok(()) => self.show(&format!("Interrupted {}", pid), LogChannel::Misc),
            Err(e) => {
                self.show(&format!("{:#}", e), LogChannel::Error);
                self.session.stop_mode = StopMode::NoStopRequested;
                self.set_state(EngineState::InferiorStopFailed);
            }
        }
    }

    // ---- 入力処理 ----

    /// 通信路からのイベントを処理する
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Line(line) => self.handle_line(&line),
            TransportEvent::Stderr(line) => {
                if !self.session.ignore_output {
                    self.show(&line, LogChannel::Error);
                }
            }
            TransportEvent::Error(message) => {
                self.show(&message, LogChannel::Error);
                if self.state == EngineState::SetupRequested {
                    self.handle_setup_failure(&message);
                }
            }
            TransportEvent::Exited { code } => self.process_finished(code),
        }
    }

    /// CDB の標準出力1行を処理する
    pub fn handle_line(&mut self, line: &str) {
        if self.session.ignore_output {
            return;
        }
        trace!("cdb> {}", line);
        let Some(event) = self.demux.feed(line) else {
            return;
        };
        match event {
            DemuxEvent::Extension {
                kind,
                token,
                service,
                payload,
            } => self.handle_extension_message(kind, token, &service, &payload),
            DemuxEvent::BuiltinDone { token, text } => {
                self.show(&text, LogChannel::Misc);
                if let Some(command) = self.dispatcher.complete(token) {
                    if let Some(callback) = command.callback {
                        self.invoke(callback, Response::builtin(token, text));
                    }
                } else {
                    warn!("Output for unknown builtin token {}", token);
                }
                self.flush_backlog();
            }
            DemuxEvent::Version { major, minor } => {
                self.session.auto_breakpoint_correction = has_auto_breakpoint_correction(major, minor);
                info!(
                    "CDB version {}.{}, automatic breakpoint correction: {}",
                    major, minor, self.session.auto_breakpoint_correction
                );
                self.show(line, LogChannel::Misc);
            }
            DemuxEvent::ModuleLoaded(module) => {
                self.show(line, LogChannel::Misc);
                self.show(&format!("Module loaded: {}", module), LogChannel::Status);
            }
            DemuxEvent::Text(text) => self.show(&text, LogChannel::Misc),
        }
    }

    /// 拡張ライブラリの通知
    fn handle_extension_message(&mut self, kind: char, token: i64, service: &str, payload: &str) {
        debug!("Extension message {} {} {} ({} bytes)", kind, token, service, payload.len());
        match service {
            "debuggee_output" => {
                let text = decode_utf16_hex(payload);
                self.show(&text, LogChannel::AppOutput);
                return;
            }
            "event" => {
                if payload.starts_with("Process exited") {
                    self.notify_inferior_exited();
                }
                self.show(payload, LogChannel::Status);
                return;
            }
            "session_accessible" => {
                if !self.session.accessible {
                    self.session.accessible = true;
                    self.handle_session_accessible(payload.trim().parse().unwrap_or(0));
                    self.flush_backlog();
                }
                return;
            }
            "session_inaccessible" => {
                if self.session.accessible {
                    self.session.accessible = false;
                    self.handle_session_inaccessible(payload.trim().parse().unwrap_or(0));
                }
                return;
            }
            "session_idle" => {
                self.handle_session_idle(payload);
                return;
            }
            "exception" => {
                self.handle_exception_notification(payload);
                return;
            }
            _ => {}
        }

        if kind != 'R' && kind != 'N' {
            debug!("Ignoring extension message {} for {}", kind, service);
            return;
        }
        // トークンなしは手で打たれた拡張コマンド
        let Ok(token) = u32::try_from(token) else {
            self.show_script_messages(payload);
            return;
        };
        let Some(command) = self.dispatcher.complete(token) else {
            warn!("Reply for unknown extension token {}", token);
            return;
        };
        let Some(callback) = command.callback else {
            if !payload.is_empty() {
                self.show_script_messages(payload);
            }
            return;
        };
        let response = if kind == 'R' {
            Response::extension_done(token, payload)
        } else {
            Response::extension_error(token, payload)
        };
        // 解析できた応答に含まれる `msg` は処理の前に出す
        if response.is_done() && !response.data.is_scalar() && !matches!(callback, Callback::ScriptMessages) {
            self.show_script_messages(payload);
        }
        self.invoke(callback, response);
    }

    /// `msg` の一覧をログに流す。解析できなければそのまま
    pub(crate) fn show_script_messages(&mut self, message: &str) {
        let Ok(parsed) = cdbe_mi::parse(message) else {
            self.show(message, LogChannel::Misc);
            return;
        };
        let lines: Vec<String> = parsed
            .get("msg")
            .map(|msgs| {
                msgs.iter()
                    .map(|msg| {
                        if msg.name() == "bridgemessage" {
                            msg.str("msg").unwrap_or("").to_string()
                        } else {
                            msg.data().to_string()
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        for line in lines {
            self.show(&line, LogChannel::Misc);
        }
    }

    fn handle_exception_notification(&mut self, payload: &str) {
        let value = cdbe_mi::parse(payload).unwrap_or_else(|_| MiValue::tuple("", Vec::new()));
        let exception = WinException::from_mi(&value);
        if exception.code == EXCEPTION_WX86_BREAKPOINT || exception.code == EXCEPTION_SET_THREAD_NAME {
            return;
        }
        let message = exception.describe(true);
        self.show(&message, LogChannel::Status);
        if exception.code == EXCEPTION_CPP {
            self.show(&format!("{}\n", message), LogChannel::AppOutput);
        }
        if !exception.is_debugger_exception() {
            let channel = if exception.is_fatal() {
                LogChannel::Error
            } else {
                LogChannel::Warning
            };
            let entry = format!(
                "Debugger encountered an exception: {}",
                exception.describe(false).trim()
            );
            self.show(&entry, channel);
        }
    }

    // ---- セッション通知 ----

    fn handle_session_accessible(&mut self, status: u64) {
        if !self.session.has_debuggee || self.state == EngineState::InferiorRunOk {
            return;
        }
        debug!("Session accessible ({}) in {:?}", cdb_status_name(status), self.state);
        match self.state {
            EngineState::EngineShutdownRequested => self.shutdown_engine(),
            EngineState::InferiorShutdownRequested => self.shutdown_inferior(),
            _ => {}
        }
    }

    fn handle_session_inaccessible(&mut self, status: u64) {
        if !self.session.has_debuggee
            || (self.state == EngineState::InferiorRunOk && status != CDB_STATUS_NO_DEBUGGEE)
        {
            return;
        }
        debug!("Session inaccessible ({}) in {:?}", cdb_status_name(status), self.state);
        match self.state {
            EngineState::RunRequested | EngineState::InferiorRunRequested => {
                self.set_state(EngineState::InferiorRunOk);
            }
            EngineState::InferiorRunOk | EngineState::InferiorStopOk => {
                // 終了時のブレークポイント。CDB が自分で終わるのを待つ
                if status == CDB_STATUS_NO_DEBUGGEE {
                    debug!("Lost debuggee");
                    self.session.has_debuggee = false;
                }
            }
            _ => {}
        }
    }

    fn handle_session_idle(&mut self, message: &str) {
        if !self.session.has_debuggee {
            return;
        }
        debug!("Session idle in {:?}", self.state);

        for command in std::mem::take(&mut self.session.deferred) {
            self.run_command(command);
        }

        let stop = cdbe_mi::parse(message).unwrap_or_else(|_| MiValue::tuple("", Vec::new()));
        if !self.session.initial_idle_handled {
            self.handle_initial_session_idle();
            if self.params.start_mode() == StartMode::AttachToCore {
                self.session.core_stop_reason = Some(stop);
            }
            return;
        }
        self.process_stop(&stop, false);
    }

    // ---- 起動 ----

    /// CDB を起動する
    ///
    /// 失敗した場合は `SetupFailed` になり、`EngineSink::setup_failed` で通知する。
    pub fn setup(&mut self) {
        self.init();
        self.set_state(EngineState::SetupRequested);

        if self.params.launch.debugger.as_os_str().is_empty() {
            self.handle_setup_failure("There is no CDB executable specified.");
            return;
        }
        if !self.params.cdb_is_64bit {
            self.session.wow64 = Wow64State::NoWow64;
        }

        let mut launch = self.params.launch.clone();
        launch.source_paths = self.settings.source_paths.clone();
        launch.symbol_paths = self.settings.symbol_paths.clone();
        launch.additional_arguments = self.settings.additional_arguments.clone();
        launch.ignore_first_chance_access_violation = self.settings.ignore_first_chance_access_violation;

        let command = match launch.to_command(EXTENSION_PREFIX) {
            Ok(command) => command,
            Err(e) => {
                self.handle_setup_failure(&e.to_string());
                return;
            }
        };
        self.show(
            &format!(
                "Launching {}\nusing {}.",
                command.to_user_output(),
                launch.extension_library.display()
            ),
            LogChannel::Misc,
        );
        if let Err(e) = self.transport.start(&command) {
            self.handle_setup_failure(&e.to_string());
            return;
        }
        if let Some(pid) = self.transport.pid() {
            self.show(&format!("{} running as {}", launch.debugger.display(), pid), LogChannel::Misc);
        }

        self.session.has_debuggee = true;
        self.session.initial_idle_handled = false;
        // リモートでは idle が来ないが、すぐにコマンドを受け付ける
        if launch.start_mode.is_remote() {
            self.session.accessible = true;
            self.run_command(DebuggerCommand::fire(format!(".load {}", launch.extension_file_name())));
            self.handle_initial_session_idle();
        }
    }

    pub(crate) fn handle_setup_failure(&mut self, message: &str) {
        self.show(message, LogChannel::Error);
        self.sink.setup_failed(message);
        self.set_state(EngineState::SetupFailed);
    }

    // ---- 終了 ----

    /// CDB プロセスが終了した
    pub(crate) fn process_finished(&mut self, code: Option<i32>) {
        let message = match code {
            Some(code) => format!("CDB exited with code {}.", code),
            None => "CDB exited.".to_string(),
        };
        self.show(&message, LogChannel::Misc);
        info!("{}", message);
        self.session.accessible = false;
        self.session.has_debuggee = false;
        self.session.inferior_pid = None;
        self.session.stop_mode = StopMode::NoStopRequested;
        self.session.deferred.clear();
        self.dispatcher.clear();
        self.demux.reset();
        self.set_state(EngineState::Finished);
    }

    /// デバッグ対象が終了した
    pub(crate) fn notify_inferior_exited(&mut self) {
        debug!("Inferior exited in {:?}", self.state);
        if self.state.is_dying() {
            return;
        }
        self.set_state(EngineState::InferiorShutdownFinished);
        self.set_state(EngineState::EngineShutdownRequested);
        self.shutdown_engine();
    }
}
