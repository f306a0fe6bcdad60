//! ユーザー操作
//!
//! 実行制御、データの再取得、ブレークポイント、終了処理。
//! 状態に合わない操作は `EngineError` を返し、何も送りません。

use crate::breakpoint::{
    accepts_breakpoint, add_command, clear_command, enable_command, BreakpointParameters, BreakpointType, ModelId,
};
use crate::callback::Callback;
use crate::disasm::{symbol_name, DisassemblyPlan};
use crate::engine::CdbEngine;
use crate::errors::EngineError;
use crate::line_correction::fix_line_number;
use crate::protocol::{DebuggerCommand, EXTENSION_PREFIX};
use crate::session::{EngineState, Phase, Wow64State};
use crate::sink::{EngineSink, LogChannel};
use cdbe_target::Transport;
use tracing::debug;

type OpResult<T = ()> = std::result::Result<T, EngineError>;

impl<T: Transport, S: EngineSink> CdbEngine<T, S> {
    fn require_stopped(&self, operation: &'static str) -> OpResult {
        if self.state == EngineState::InferiorStopOk {
            Ok(())
        } else {
            Err(EngineError::WrongState {
                operation,
                state: self.state,
            })
        }
    }

    /// 停止中か、ダンプファイルを開いている
    fn require_inspectable(&self, operation: &'static str) -> OpResult {
        match self.state {
            EngineState::InferiorStopOk | EngineState::InferiorUnrunnable => Ok(()),
            state => Err(EngineError::WrongState { operation, state }),
        }
    }

    fn require_session(&self) -> OpResult {
        match self.state.phase() {
            Phase::Terminated | Phase::Error => Err(EngineError::NotRunning),
            _ if self.state == EngineState::NotReady => Err(EngineError::NotRunning),
            _ => Ok(()),
        }
    }

    // ---- 実行制御 ----

    pub fn continue_inferior(&mut self) -> OpResult {
        self.require_stopped("continue")?;
        self.set_state(EngineState::InferiorRunRequested);
        self.do_continue_inferior();
        Ok(())
    }

    pub(crate) fn do_continue_inferior(&mut self) {
        self.run_command(DebuggerCommand::fire("g"));
    }

    pub fn step_in(&mut self, by_instruction: bool) -> OpResult {
        self.require_stopped("step into")?;
        self.execute_step_in(by_instruction);
        Ok(())
    }

    pub(crate) fn execute_step_in(&mut self, by_instruction: bool) {
        self.adjust_operate_by_instruction(by_instruction);
        if !self.session.last_operate_by_instruction {
            self.session.source_step_into = true;
        }
        self.run_command(DebuggerCommand::fire("t"));
        self.set_state(EngineState::InferiorRunRequested);
    }

    pub fn step_over(&mut self, by_instruction: bool) -> OpResult {
        self.require_stopped("step over")?;
        self.adjust_operate_by_instruction(by_instruction);
        self.run_command(DebuggerCommand::fire("p"));
        self.set_state(EngineState::InferiorRunRequested);
        Ok(())
    }

    pub fn step_out(&mut self) -> OpResult {
        self.require_stopped("step out")?;
        self.execute_step_out();
        Ok(())
    }

    pub(crate) fn execute_step_out(&mut self) {
        self.run_command(DebuggerCommand::fire("gu"));
        self.set_state(EngineState::InferiorRunRequested);
    }

    /// 命令単位とソース単位を切り替える（変化したときだけ送る）
    fn adjust_operate_by_instruction(&mut self, by_instruction: bool) {
        if self.session.last_operate_by_instruction == by_instruction {
            return;
        }
        self.session.last_operate_by_instruction = by_instruction;
        let (trace, source) = if by_instruction { ("l-t", "l-s") } else { ("l+t", "l+s") };
        self.run_command(DebuggerCommand::fire(trace));
        self.run_command(DebuggerCommand::fire(source));
    }

    /// 一時的なブレークポイントを置いて再開する
    fn run_to(&mut self, params: BreakpointParameters) -> OpResult {
        self.require_stopped("run to location")?;
        let command = add_command(&params.one_shot(), &self.source_mappings, "");
        self.run_command(DebuggerCommand::builtin(command, Callback::BreakInsert { model_id: None }));
        self.continue_inferior()
    }

    pub fn run_to_line(&mut self, file: &str, line: u32) -> OpResult {
        self.run_to(BreakpointParameters::file_and_line(file, line))
    }

    pub fn run_to_address(&mut self, address: u64) -> OpResult {
        self.run_to(BreakpointParameters::address(address))
    }

    pub fn run_to_function(&mut self, function: &str) -> OpResult {
        self.run_to(BreakpointParameters::function(function))
    }

    /// 行のアドレスを求めてから PC を書き換える
    pub fn jump_to_line(&mut self, file: &str, line: u32) -> OpResult {
        self.require_stopped("jump")?;
        self.run_command(DebuggerCommand::builtin(
            format!("? `{}:{}`", file, line),
            Callback::JumpToLine,
        ));
        Ok(())
    }

    pub fn jump_to(&mut self, address: u64) -> OpResult {
        self.require_stopped("jump")?;
        self.jump_to_address(address);
        Ok(())
    }

    /// PC レジスタを書き換えてジャンプしたことにする
    pub(crate) fn jump_to_address(&mut self, address: u64) {
        let register = if self.params.cdb_is_64bit && self.session.wow64 != Wow64State::Emulated32Stack {
            "rip"
        } else {
            "eip"
        };
        self.run_command(DebuggerCommand::fire(format!("r {}=0x{:x}", register, address)));
    }

    /// 値は10進数か `0x` 付きの16進数
    pub fn set_register_value(&mut self, name: &str, value: &str) -> OpResult {
        self.require_stopped("set register")?;
        self.run_command(DebuggerCommand::fire(format!("r {}={}", name, value)));
        self.reload_registers();
        Ok(())
    }

    pub fn select_thread(&mut self, id: &str) -> OpResult {
        self.require_inspectable("select thread")?;
        self.threads.current_id = Some(id.to_string());
        self.run_command(DebuggerCommand::builtin(format!("~{} s", id), Callback::SelectThread));
        Ok(())
    }

    pub fn create_full_backtrace(&mut self) -> OpResult {
        self.require_inspectable("create backtrace")?;
        self.run_command(DebuggerCommand::builtin("~*kp", Callback::FullBacktrace));
        Ok(())
    }

    /// 入力されたコマンドをそのまま送る
    pub fn execute_debugger_command(&mut self, command: &str) -> OpResult {
        self.require_session()?;
        self.run_command(DebuggerCommand::fire(command));
        Ok(())
    }

    /// 割り込みをかける
    pub fn interrupt_inferior(&mut self) -> OpResult {
        if self.state.phase() != Phase::Running {
            return Err(EngineError::WrongState {
                operation: "interrupt",
                state: self.state,
            });
        }
        if !self.can_interrupt_inferior() {
            // 実行中の状態に戻す
            self.show("Interrupting is not possible in remote sessions.", LogChannel::Error);
            self.set_state(EngineState::InferiorStopOk);
            self.set_state(EngineState::InferiorRunRequested);
            self.set_state(EngineState::InferiorRunOk);
            return Err(EngineError::InterruptImpossible);
        }
        self.set_state(EngineState::InferiorStopRequested);
        self.do_interrupt_inferior(None);
        Ok(())
    }

    // ---- データの再取得 ----

    pub fn reload_threads(&mut self) {
        self.run_command(DebuggerCommand::extension("threads", Callback::Threads));
    }

    pub fn reload_full_stack(&mut self) {
        self.run_command(DebuggerCommand::extension("stack", Callback::Stack).with_args("unlimited"));
    }

    /// 現在のスレッドがわかっているときだけ取得する
    pub fn reload_registers(&mut self) {
        if self.threads.current_id.is_none() {
            debug!("No current thread, not fetching registers");
            return;
        }
        self.run_command(DebuggerCommand::extension("registers", Callback::Registers));
    }

    pub fn reload_modules(&mut self) {
        self.run_command(DebuggerCommand::extension("modules", Callback::Modules));
    }

    pub fn list_breakpoints(&mut self) {
        self.run_command(DebuggerCommand::extension("breakpoints", Callback::Breakpoints).with_args("-v"));
    }

    pub fn fetch_memory(&mut self, address: u64, length: u64) -> OpResult {
        self.require_inspectable("read memory")?;
        self.run_command(
            DebuggerCommand::extension("memory", Callback::Memory { address, length })
                .with_args(format!("{} {}", address, length)),
        );
        Ok(())
    }

    pub fn evaluate_expression(&mut self, expression: &str) -> OpResult {
        self.require_inspectable("evaluate")?;
        let args = if expression.contains(' ') && !expression.starts_with('"') {
            format!("\"{}\"", expression)
        } else {
            expression.to_string()
        };
        self.run_command(
            DebuggerCommand::extension(
                "expression",
                Callback::Evaluate {
                    expression: expression.to_string(),
                },
            )
            .with_args(args),
        );
        Ok(())
    }

    /// 関数名があれば関数全体を、なければアドレスの前後を逆アセンブルする
    pub fn fetch_disassembler(&mut self, address: u64, module: &str, function: &str) -> OpResult {
        self.require_inspectable("disassemble")?;
        if !function.is_empty() {
            self.post_resolve_symbol(module, function, address);
        } else if address != 0 {
            let plan = DisassemblyPlan::around(address);
            self.run_command(DebuggerCommand::builtin(plan.command(), Callback::Disassemble { address }));
        } else {
            debug!("Nothing to disassemble: no address and no function");
        }
        Ok(())
    }

    fn post_resolve_symbol(&mut self, module: &str, function: &str, agent_address: u64) {
        let symbol = symbol_name(module, function);
        let cached = self
            .symbols
            .get(&symbol)
            .filter(|addresses| !addresses.is_empty())
            .map(<[u64]>::to_vec);
        match cached {
            Some(addresses) => {
                self.show(&format!("Using cached addresses for {}.", symbol), LogChannel::Misc);
                self.post_disassembly(&addresses, agent_address, function);
            }
            None => {
                self.show(&format!("Resolving symbol: {}...", symbol), LogChannel::Misc);
                self.run_command(DebuggerCommand::builtin(
                    format!("x {}", symbol),
                    Callback::ResolveSymbol {
                        symbol,
                        agent_address,
                        function: function.to_string(),
                    },
                ));
            }
        }
    }

    // ---- ブレークポイント ----

    /// ブレークポイントを登録する
    ///
    /// セッション開始前なら、最初の `session_idle` でまとめて送る。
    pub fn insert_breakpoint(&mut self, params: BreakpointParameters) -> OpResult<ModelId> {
        if !accepts_breakpoint(params.kind) {
            return Err(EngineError::UnsupportedBreakpoint(params.kind.name()));
        }
        let model_id = self.breakpoints.create(params);
        if self.session.initial_idle_handled && !self.state.is_dying() {
            self.send_breakpoint(model_id);
            self.list_breakpoints();
        }
        Ok(model_id)
    }

    /// `bu`/`bp`/`ba` を送り、未解決として記録する
    pub(crate) fn send_breakpoint(&mut self, model_id: ModelId) {
        let Some(bp) = self.breakpoints.get(model_id) else {
            return;
        };
        let mut params = bp.params.clone();
        let response_id = bp.response_id.clone();
        if !self.session.auto_breakpoint_correction
            && params.kind == BreakpointType::FileAndLine
            && self.settings.breakpoint_correction
        {
            if let Some(file) = &params.file {
                params.line = fix_line_number(file, params.line);
            }
        }
        let command = add_command(&params, &self.source_mappings, &response_id);
        let enabled = params.enabled;
        if let Some(bp) = self.breakpoints.get_mut(model_id) {
            bp.params = params;
        }
        self.run_command(DebuggerCommand::builtin(
            command,
            Callback::BreakInsert {
                model_id: Some(model_id),
            },
        ));
        if !enabled {
            self.run_command(DebuggerCommand::fire(enable_command(&response_id, false)));
        }
        self.breakpoints.mark_pending(model_id);
        debug!("Adding breakpoint {} ({})", model_id, response_id);
    }

    /// ブレークポイントを変更する
    ///
    /// 有効/無効の切り替えだけなら `be`/`bd` を送り、それ以外は消して置き直す。
    pub fn update_breakpoint(&mut self, model_id: ModelId, params: BreakpointParameters) -> OpResult {
        if !accepts_breakpoint(params.kind) {
            return Err(EngineError::UnsupportedBreakpoint(params.kind.name()));
        }
        let session_started = self.session.initial_idle_handled && !self.state.is_dying();
        if !session_started {
            let bp = self
                .breakpoints
                .get_mut(model_id)
                .ok_or(EngineError::UnknownBreakpoint(model_id))?;
            bp.params = params;
            return Ok(());
        }
        let bp = self
            .breakpoints
            .get(model_id)
            .ok_or(EngineError::UnknownBreakpoint(model_id))?;

        if params.enabled != bp.params.enabled {
            let enabled = params.enabled;
            let ids: Vec<String> = if bp.subs.is_empty() {
                vec![bp.response_id.clone()]
            } else {
                bp.subs.iter().map(|sub| sub.response_id.clone()).collect()
            };
            for id in ids {
                self.run_command(DebuggerCommand::fire(enable_command(&id, enabled)));
            }
            if let Some(bp) = self.breakpoints.get_mut(model_id) {
                bp.params.enabled = enabled;
                for sub in &mut bp.subs {
                    sub.params.enabled = enabled;
                }
            }
        } else {
            let clear = clear_command(bp);
            let response_id = bp.response_id.clone();
            self.run_command(DebuggerCommand::fire(clear));
            let command = add_command(&params, &self.source_mappings, &response_id);
            if let Some(bp) = self.breakpoints.get_mut(model_id) {
                bp.params = params;
                bp.subs.clear();
            }
            self.run_command(DebuggerCommand::builtin(
                command,
                Callback::BreakInsert {
                    model_id: Some(model_id),
                },
            ));
            self.breakpoints.mark_pending(model_id);
            self.list_breakpoints();
        }
        if let Some(bp) = self.breakpoints.get(model_id) {
            self.sink.breakpoint_changed(bp);
        }
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, model_id: ModelId) -> OpResult {
        let bp = self
            .breakpoints
            .remove(model_id)
            .ok_or(EngineError::UnknownBreakpoint(model_id))?;
        if self.session.initial_idle_handled && !self.state.is_dying() {
            self.run_command(DebuggerCommand::fire(clear_command(&bp)));
        }
        Ok(())
    }

    // ---- 終了 ----

    /// デバッグ対象を終了（アタッチならデタッチ）し、CDB を終わらせる
    pub fn shutdown(&mut self) {
        match self.state {
            EngineState::EngineShutdownRequested | EngineState::EngineShutdownFinished | EngineState::Finished => {}
            EngineState::NotReady | EngineState::SetupRequested | EngineState::SetupFailed => {
                self.set_state(EngineState::EngineShutdownRequested);
                self.shutdown_engine();
            }
            _ => {
                self.set_state(EngineState::InferiorShutdownRequested);
                self.shutdown_inferior();
            }
        }
    }

    pub(crate) fn shutdown_inferior(&mut self) {
        debug!(
            "Shutting down inferior in {:?}, accessible: {}",
            self.state, self.session.accessible
        );
        if !self.transport.is_running() {
            debug!("CDB already gone");
        } else if self.session.accessible {
            if self.params.start_mode().is_attach() {
                self.detach_debugger();
            }
        } else if self.dispatcher.has_pending() {
            // コマンドが詰まっている
            self.show("Cannot shut down inferior due to pending commands.", LogChannel::Warning);
        } else if !self.can_interrupt_inferior() {
            self.show("Cannot interrupt the inferior.", LogChannel::Warning);
        } else {
            // 止まると session_accessible からもう一度呼ばれる
            self.do_interrupt_inferior(None);
            return;
        }
        self.set_state(EngineState::InferiorShutdownFinished);
        self.set_state(EngineState::EngineShutdownRequested);
        self.shutdown_engine();
    }

    pub(crate) fn shutdown_engine(&mut self) {
        if !self.transport.is_running() {
            self.set_state(EngineState::EngineShutdownFinished);
            self.set_state(EngineState::Finished);
            return;
        }
        // 以降の出力では何もしない
        self.session.ignore_output = true;
        if self.session.accessible && !self.dispatcher.has_pending() {
            if self.params.start_mode().is_attach() {
                self.detach_debugger();
            }
            if self.params.start_mode().is_remote() {
                self.run_command(DebuggerCommand::fire(format!("{}shutdownex", EXTENSION_PREFIX)));
                self.run_command(DebuggerCommand::fire("qq"));
            } else {
                self.run_command(DebuggerCommand::fire("q"));
            }
        } else {
            self.show("Killing CDB.", LogChannel::Misc);
            self.transport.kill();
        }
    }

    fn detach_debugger(&mut self) {
        self.run_command(DebuggerCommand::fire(".detach"));
    }

    /// デバッグ対象から切り離す
    pub fn detach(&mut self) -> OpResult {
        self.require_stopped("detach")?;
        self.detach_debugger();
        Ok(())
    }

    /// CDB を強制終了する
    pub fn abort(&mut self) {
        self.transport.kill();
    }
}
