//! 応答と停止の処理
//!
//! コマンドの応答を `Callback` ごとに振り分け、停止通知から
//! スレッド・スタック・レジスタなどの再取得を組み立てます。

use crate::breakpoint::{add_command, parse_ambiguous_matches, BreakpointParameters, ModelId};
use crate::callback::Callback;
use crate::disasm::{parse_disassembly, parse_symbol_addresses, plan_disassembly};
use crate::engine::CdbEngine;
use crate::parse::parse_evaluated_address;
use crate::protocol::{CommandKind, DebuggerCommand, Response, EXTENSION_PREFIX};
use crate::session::{EngineState, StopMode, Wow64State};
use crate::sink::{EngineSink, LogChannel};
use crate::stack::{parse_stack_trace, StackParse};
use crate::stop::{examine_stop_reason, StopAnalysis, StopContext, StopFlags};
use cdbe_mi::utils::decode_hex;
use cdbe_mi::{parse_breakpoint_report, parse_modules, parse_registers, parse_threads, MiValue};
use cdbe_target::{StartMode, Transport};
use tracing::{debug, info};

/// `crtDbgReport` への停止（アサーション失敗を捕まえる）
const CRT_DBG_REPORT: &str = "_CrtDbgReport";

/// 読み出しに失敗したときに 0 で埋めて返す最大の長さ
const MAX_MEMORY_FILL: u64 = 0x10000;

impl<T: Transport, S: EngineSink> CdbEngine<T, S> {
    /// 応答を処理関数へ渡す
    pub(crate) fn invoke(&mut self, callback: Callback, response: Response) {
        match callback {
            Callback::BreakInsert { model_id } => self.handle_break_insert(&response, model_id),
            Callback::Pid => self.handle_pid(&response),
            Callback::ScriptVersion => self.handle_script_version(&response),
            Callback::ScriptMessages => {
                if response.is_done() {
                    let text = response.text().to_string();
                    if !text.is_empty() {
                        self.show_script_messages(&text);
                    }
                } else {
                    let msg = response.msg().to_string();
                    self.show(&msg, LogChannel::Error);
                }
            }
            Callback::Threads => self.handle_threads(&response),
            Callback::Stack => self.handle_stack_trace(&response),
            Callback::CheckWow64 { stack } => self.handle_check_wow64(&response, &stack),
            Callback::Wow64StackHeader { stack } => self.handle_wow64_stack_header(&response, &stack),
            Callback::SwitchWow64Stack => self.handle_switch_wow64_stack(&response),
            Callback::Breakpoints => self.handle_breakpoints(&response),
            Callback::Modules => self.handle_modules(&response),
            Callback::Registers => self.handle_registers(&response),
            Callback::Expression { model_id, stop_reason } => {
                self.handle_condition_value(&response, model_id, &stop_reason)
            }
            Callback::Evaluate { expression } => {
                if response.is_done() {
                    self.sink.expression_result(&expression, &response.data);
                } else {
                    let msg = response.msg().to_string();
                    self.show(&msg, LogChannel::Error);
                }
            }
            Callback::Memory { address, length } => self.handle_memory(&response, address, length),
            Callback::ResolveSymbol {
                symbol,
                agent_address,
                function,
            } => self.handle_resolve_symbol(&response, &symbol, agent_address, &function),
            Callback::Disassemble { address } => {
                let lines = parse_disassembly(response.text());
                debug!("Disassembled {} lines around 0x{:x}", lines.len(), address);
                self.sink.disassembly(&lines);
            }
            Callback::JumpToLine => {
                if let Some(address) = parse_evaluated_address(response.text().trim()).filter(|a| *a != 0) {
                    self.jump_to_address(address);
                }
            }
            Callback::SelectThread => self.reload_full_stack(),
            Callback::FullBacktrace => self.sink.full_backtrace(response.text()),
        }
    }

    // ---- 起動シーケンス ----

    /// 最初の `session_idle`（リモートでは起動直後）
    pub(crate) fn handle_initial_session_idle(&mut self) {
        self.session.initial_idle_handled = true;

        for command in self.params.commands_after_connect.clone() {
            self.run_command(DebuggerCommand::fire(command));
        }

        if self.params.break_on_main {
            let module = match self.params.start_mode() {
                StartMode::StartInternal | StartMode::StartExternal => self.params.executable_module().unwrap_or_default(),
                _ => String::new(),
            };
            let bp = BreakpointParameters::at_main(module);
            let command = add_command(&bp, &self.source_mappings, "");
            self.run_command(DebuggerCommand::builtin(command, Callback::BreakInsert { model_id: None }));
        }

        // 起動前に登録されたブレークポイントを送る
        let ids: Vec<ModelId> = self.breakpoints.iter().map(|bp| bp.model_id).collect();
        for id in &ids {
            self.send_breakpoint(*id);
        }
        if !ids.is_empty() {
            self.list_breakpoints();
        }

        let mut symbol_paths = self.settings.symbol_paths.clone();
        for variable in ["_NT_ALT_SYMBOL_PATH", "_NT_SYMBOL_PATH"] {
            if let Some(path) = self.params.inferior_environment(variable).filter(|p| !p.is_empty()) {
                symbol_paths.push(path.to_string());
            }
        }
        self.run_command(DebuggerCommand::fire(format!(".sympath \"{}\"", symbol_paths.join(";"))));
        // 公開シンボルテーブルを検索しない
        self.run_command(DebuggerCommand::fire(".symopt+0x8000"));
        // WOW64 の例外と初回ブレークポイントでは止めない
        self.run_command(DebuggerCommand::fire("sxn 0x4000001f"));
        self.run_command(DebuggerCommand::fire("sxn ibp"));
        self.run_command(DebuggerCommand::fire(".asm source_line"));
        self.run_command(DebuggerCommand::fire(format!(
            "{}setparameter maxStringLength={} maxStackDepth={} firstChance={} secondChance={}",
            EXTENSION_PREFIX,
            self.settings.max_string_length,
            self.settings.max_stack_depth,
            u8::from(self.settings.first_chance_exception_task_entry),
            u8::from(self.settings.second_chance_exception_task_entry),
        )));

        if self.settings.use_python_bridge {
            let mut command = DebuggerCommand::new("print(sys.version)", CommandKind::Script);
            command.callback = Some(Callback::ScriptVersion);
            self.run_command(command);
        }

        self.run_command(DebuggerCommand::extension("pid", Callback::Pid));
    }

    fn handle_pid(&mut self, response: &Response) {
        // ダンプファイルでは失敗する
        if response.is_done() {
            match response.text().trim().parse::<u32>() {
                Ok(pid) => {
                    info!("Inferior pid {}", pid);
                    self.session.inferior_pid = Some(pid);
                }
                Err(_) => debug!("Unexpected pid reply \"{}\"", response.text()),
            }
        }
        if response.is_done() || self.params.start_mode() == StartMode::AttachToCore {
            self.set_state(EngineState::RunRequested);
            self.run_engine();
        } else {
            let message = format!("Failed to determine inferior pid: {}", response.msg());
            self.handle_setup_failure(&message);
        }
    }

    fn run_engine(&mut self) {
        for event in self.settings.break_events.clone() {
            self.run_command(DebuggerCommand::fire(format!("sxe {}", event)));
        }
        if self.settings.break_on_crt_dbg_report && self.params.runtime_flavour.supports_crt_dbg_report() {
            let module = self.params.runtime_flavour.msvc_runtime();
            let debug_module = format!("{}D", module);
            let wide = format!("{}W", CRT_DBG_REPORT);
            for (function, module) in [
                (CRT_DBG_REPORT, module),
                (wide.as_str(), module),
                (CRT_DBG_REPORT, debug_module.as_str()),
            ] {
                self.run_command(DebuggerCommand::builtin(
                    format!("bu {}!{}", module, function),
                    Callback::BreakInsert { model_id: None },
                ));
            }
        }
        if self.params.start_mode() == StartMode::AttachToCore {
            self.set_state(EngineState::InferiorUnrunnable);
            match self.session.core_stop_reason.take() {
                Some(stop) => self.process_stop(&stop, false),
                None => self.show("No stop reason recorded for the core file.", LogChannel::Error),
            }
        } else {
            self.do_continue_inferior();
        }
    }

    fn handle_script_version(&mut self, response: &Response) {
        let output = response.data.get("msg").and_then(|msg| msg.children().first()).map(|m| m.data().to_string());
        if !response.is_done() {
            let msg = response.msg().to_string();
            self.show(&msg, LogChannel::Misc);
            return;
        }
        let Some(output) = output else {
            self.show("No output from sys.version", LogChannel::Warning);
            return;
        };
        let first = output.split(' ').next().unwrap_or("");
        let parts: Vec<Option<u32>> = first.split('.').map(|p| p.parse().ok()).collect();
        match parts.as_slice() {
            [Some(major), Some(minor), Some(patch)] => {
                self.python_version = (major << 16) | (minor << 8) | patch;
                info!("Python {}.{}.{} available in CDB", major, minor, patch);
            }
            _ => {
                self.python_version = 0;
                self.show(&format!("Cannot parse sys.version:\n{}", output), LogChannel::Warning);
            }
        }
    }

    // ---- 停止 ----

    /// 停止通知を処理する
    ///
    /// `reentry` は条件式を評価した後の呼び出し。
    pub(crate) fn process_stop(&mut self, stop: &MiValue, reentry: bool) {
        let analysis = {
            let ctx = StopContext {
                shutting_down: self.state.is_dying(),
                already_stopped: self.state == EngineState::InferiorStopOk,
                stop_mode: self.session.stop_mode,
                breakpoints: &self.breakpoints,
                reentry,
            };
            examine_stop_reason(stop, &ctx)
        };
        self.session.stop_mode = StopMode::NoStopRequested;

        let (decision, query) = match analysis {
            StopAnalysis::Decided(decision) => (decision, None),
            StopAnalysis::EvaluateCondition { decision, query } => (decision, Some(query)),
        };
        if let Some(query) = query {
            self.run_command(
                DebuggerCommand::extension(
                    "expression",
                    Callback::Expression {
                        model_id: query.model_id,
                        stop_reason: stop.clone(),
                    },
                )
                .with_args(query.expression),
            );
        }
        if let Some(message) = &decision.breakpoint_message {
            self.show(&format!("{}\n", message), LogChannel::AppOutput);
            self.show(message, LogChannel::Misc);
        }

        let flags = decision.flags;
        if flags.contains(StopFlags::REPORT_LOG) {
            self.show(&decision.message, LogChannel::Misc);
        }
        if flags.contains(StopFlags::REPORT_STATUS) {
            self.show(&decision.message, LogChannel::Status);
        }
        if flags.contains(StopFlags::REPORT_PARSE_ERROR) {
            self.show(&decision.message, LogChannel::Error);
        }
        // トレースポイント、WOW64 など
        if flags.contains(StopFlags::IGNORE_CONTINUE) {
            self.do_continue_inferior();
            return;
        }

        if flags.contains(StopFlags::NOTIFY_STOP) {
            if self.params.start_mode() != StartMode::AttachToCore && !self.state.is_dying() {
                if self.state == EngineState::InferiorStopRequested {
                    debug!("Requested stop");
                } else {
                    debug!("Spontaneous stop in {:?}", self.state);
                }
                self.set_state(EngineState::InferiorStopOk);
            }
            if flags.contains(StopFlags::SHUTDOWN_IN_PROGRESS) {
                self.show("Shutdown request detected...", LogChannel::Misc);
                return;
            }
            let source_step_into = std::mem::take(&mut self.session.source_step_into);
            let mut forced_thread = false;
            if flags.contains(StopFlags::ARTIFICIAL_THREAD) {
                self.show("Switching to main thread...", LogChannel::Misc);
                self.run_command(DebuggerCommand::fire("~0 s"));
                forced_thread = true;
                self.reload_full_stack();
            } else if let Some(stack) = stop.get("stack") {
                match self.apply_stack(stack, source_step_into) {
                    StackParse::StepInto => {
                        let by_instruction = self.session.last_operate_by_instruction;
                        self.execute_step_in(by_instruction);
                        return;
                    }
                    StackParse::StepOut => {
                        self.execute_step_out();
                        return;
                    }
                    StackParse::NeedWow64 | StackParse::Frames { .. } => {}
                }
            } else {
                let error = stop.str("stackerror").unwrap_or("").to_string();
                self.show(&error, LogChannel::Error);
            }

            match stop.get("threads") {
                Some(threads) => {
                    let mut list = parse_threads(threads);
                    if forced_thread {
                        list.current_id = Some("0".to_string());
                    }
                    self.set_threads(list);
                }
                None => {
                    let error = stop.str("threaderror").unwrap_or("").to_string();
                    self.show(&error, LogChannel::Error);
                }
            }

            if self.breakpoints.pending_count() > 0 {
                self.list_breakpoints();
            }
            if self.settings.registers_visible {
                self.reload_registers();
            }
            if self.settings.modules_visible {
                self.reload_modules();
            }
        }

        if flags.contains(StopFlags::SHOW_EXCEPTION_BOX) {
            if let Some(message) = &decision.exception_box {
                self.sink.exception_box(message);
            }
        }
    }

    fn handle_condition_value(&mut self, response: &Response, model_id: ModelId, stop: &MiValue) {
        let value = if response.is_done() {
            response.data.to_i64().unwrap_or(0)
        } else {
            let msg = response.msg().to_string();
            self.show(&msg, LogChannel::Error);
            0
        };
        let name = self
            .breakpoints
            .get(model_id)
            .map(|bp| bp.display_name.clone())
            .unwrap_or_else(|| model_id.to_string());
        if value != 0 {
            self.show(
                &format!(
                    "Value {} obtained from evaluating the condition of breakpoint {}, stopping.",
                    value, name
                ),
                LogChannel::Misc,
            );
            self.process_stop(stop, true);
        } else {
            self.show(
                &format!(
                    "Value 0 obtained from evaluating the condition of breakpoint {}, continuing.",
                    name
                ),
                LogChannel::Misc,
            );
            self.do_continue_inferior();
        }
    }

    // ---- スレッドとスタック ----

    pub(crate) fn set_threads(&mut self, threads: cdbe_mi::ThreadList) {
        self.sink.set_threads(&threads);
        self.threads = threads;
    }

    fn handle_threads(&mut self, response: &Response) {
        if response.is_done() {
            let threads = parse_threads(&response.data);
            self.set_threads(threads);
            self.reload_full_stack();
        } else {
            let msg = response.msg().to_string();
            self.show(&msg, LogChannel::Error);
        }
    }

    /// スタックを解析して表示する。WOW64 が未判定なら判定を始める
    fn apply_stack(&mut self, stack: &MiValue, source_step_into: bool) -> StackParse {
        let result = parse_stack_trace(
            stack,
            self.session.wow64,
            source_step_into,
            &self.source_mappings,
            &mut self.source_paths,
        );
        match &result {
            StackParse::Frames {
                frames,
                incomplete,
                current,
            } => {
                self.sink.set_frames(frames, *incomplete, *current);
                self.frames = frames.clone();
            }
            StackParse::NeedWow64 => {
                self.show("Checking for wow64 subsystem...", LogChannel::Misc);
                self.run_command(DebuggerCommand::builtin(
                    "lm m wow64",
                    Callback::CheckWow64 { stack: stack.clone() },
                ));
            }
            StackParse::StepInto => debug!("Stepped into a jump table, stepping again"),
            StackParse::StepOut => debug!("Stepped into a frame without source, stepping out"),
        }
        result
    }

    fn handle_stack_trace(&mut self, response: &Response) {
        if response.is_done() {
            let stack = response.data.clone();
            self.apply_stack(&stack, false);
        } else {
            let msg = response.msg().to_string();
            self.show(&msg, LogChannel::Error);
        }
    }

    /// `lm m wow64` の結果
    fn handle_check_wow64(&mut self, response: &Response, stack: &MiValue) {
        if response.text().contains("wow64") {
            self.run_command(DebuggerCommand::builtin(
                "k",
                Callback::Wow64StackHeader { stack: stack.clone() },
            ));
            return;
        }
        self.session.wow64 = Wow64State::NoWow64;
        self.apply_stack(stack, false);
    }

    /// `k` のヘッダで CDB が見ているスタックのビット数を判定する
    fn handle_wow64_stack_header(&mut self, response: &Response, stack: &MiValue) {
        for line in response.text().lines() {
            if line.starts_with("ChildEBP") {
                self.session.wow64 = Wow64State::Emulated32Stack;
                self.apply_stack(stack, false);
                return;
            }
            if line.starts_with("Child-SP") {
                self.session.wow64 = Wow64State::Native64Stack;
                self.run_command(DebuggerCommand::builtin("!wow64exts.sw", Callback::SwitchWow64Stack));
                return;
            }
        }
        self.session.wow64 = Wow64State::NoWow64;
        self.apply_stack(stack, false);
    }

    fn handle_switch_wow64_stack(&mut self, response: &Response) {
        self.session.wow64 = match response.text().trim() {
            "Switched to 32bit mode" => Wow64State::Emulated32Stack,
            "Switched to 64bit mode" => Wow64State::Native64Stack,
            _ => Wow64State::NoWow64,
        };
        // モードを切り替えたのでスレッドとスタックを取り直す
        self.run_command(DebuggerCommand::extension("threads", Callback::Threads));
    }

    // ---- ブレークポイント ----

    fn handle_break_insert(&mut self, response: &Response, model_id: Option<ModelId>) {
        let reply = response.text().to_string();
        if reply.is_empty() {
            return;
        }
        for line in reply.split('\n') {
            self.show(line, LogChannel::Misc);
        }
        let Some(matches) = parse_ambiguous_matches(&reply) else {
            return;
        };
        // 行まで実行などの一時的なブレークポイント
        let Some(model_id) = model_id else {
            return;
        };
        for (index, found) in matches.iter().enumerate() {
            let Some(sub) = self.breakpoints.add_sub(model_id, index as u32 + 1, found) else {
                continue;
            };
            let command = add_command(&sub.params, &self.source_mappings, &sub.response_id);
            self.run_command(DebuggerCommand::fire(command));
        }
    }

    fn handle_breakpoints(&mut self, response: &Response) {
        if !response.is_done() {
            let msg = response.msg().to_string();
            self.show(&msg, LogChannel::Error);
            return;
        }
        if !response.data.is_list() {
            self.show("Unable to parse breakpoints reply", LogChannel::Error);
            return;
        }
        let reports: Vec<_> = response.data.iter().map(parse_breakpoint_report).collect();
        let result = self.breakpoints.reconcile(&reports);
        if !result.message.is_empty() {
            self.show(&result.message, LogChannel::Misc);
        }
        for id in result.resolved {
            if let Some(bp) = self.breakpoints.get(id) {
                self.sink.breakpoint_changed(bp);
            }
        }
    }

    // ---- モジュールとレジスタ ----

    fn handle_modules(&mut self, response: &Response) {
        if !response.is_done() {
            let message = format!("Failed to determine modules: {}", response.msg());
            self.show(&message, LogChannel::Error);
            return;
        }
        match parse_modules(&response.data) {
            Some(modules) => self.sink.set_modules(&modules),
            None => self.show("Parse error in modules response.", LogChannel::Error),
        }
    }

    fn handle_registers(&mut self, response: &Response) {
        if !response.is_done() {
            let message = format!("Failed to determine registers: {}", response.msg());
            self.show(&message, LogChannel::Error);
            return;
        }
        match parse_registers(&response.data) {
            Some(registers) => self.sink.set_registers(&registers),
            None => self.show("Parse error in registers response.", LogChannel::Error),
        }
    }

    // ---- メモリと逆アセンブル ----

    fn handle_memory(&mut self, response: &Response, address: u64, length: u64) {
        if response.is_done() {
            match decode_hex(response.text()) {
                Some(data) if data.len() as u64 == length => self.sink.memory_fetched(address, &data),
                _ => debug!("Short memory reply for 0x{:x} ({} bytes)", address, length),
            }
        } else {
            let msg = response.msg().to_string();
            self.show(&msg, LogChannel::Warning);
            if length > MAX_MEMORY_FILL {
                debug!("Not filling {} bytes at 0x{:x} after failed read", length, address);
                return;
            }
            let zeros = vec![0u8; length as usize];
            self.sink.memory_fetched(address, &zeros);
        }
    }

    fn handle_resolve_symbol(&mut self, response: &Response, symbol: &str, agent_address: u64, function: &str) {
        let reply = response.text().to_string();
        if reply.is_empty() {
            self.show(&format!("Symbol resolution failed: {}", response.msg()), LogChannel::Error);
        } else {
            let addresses = parse_symbol_addresses(&reply);
            for address in &addresses {
                self.show(&format!("Obtained 0x{:x} for {}", address, symbol), LogChannel::Misc);
            }
            self.symbols.insert(symbol, addresses);
        }
        let addresses = self.symbols.get(symbol).map(<[u64]>::to_vec).unwrap_or_default();
        self.post_disassembly(&addresses, agent_address, function);
    }

    /// 解決したアドレスから範囲を決めて `u` を送る
    pub(crate) fn post_disassembly(&mut self, addresses: &[u64], agent_address: u64, function: &str) {
        let Some(plan) = plan_disassembly(addresses, agent_address, function) else {
            debug!("Nothing to disassemble for {}", function);
            return;
        };
        if let Some(message) = &plan.message {
            self.show(message, LogChannel::Misc);
        }
        self.run_command(DebuggerCommand::builtin(
            plan.command(),
            Callback::Disassemble { address: plan.start },
        ));
    }
}
