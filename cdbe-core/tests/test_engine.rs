//! エンジンのシナリオテスト
//!
//! CDB の代わりに書き込みを記録するだけの通信路を使い、
//! 拡張ライブラリの通知行を流し込んで送信内容と状態遷移を確かめる。

use cdbe_core::session::Wow64State;
use cdbe_core::{
    Breakpoint, BreakpointParameters, CdbEngine, DisassemblerLine, EngineError, EngineSettings, EngineSink,
    EngineState, Frame, LogChannel, ModelId, RunParameters, StartMode, ThreadList, Transport, TransportEvent,
};
use cdbe_target::{LaunchCommand, LaunchError, LaunchParameters};

#[derive(Default)]
struct MockTransport {
    written: Vec<String>,
    running: bool,
    killed: bool,
    interrupts: Vec<u32>,
    fail_interrupt: bool,
}

impl Transport for MockTransport {
    fn start(&mut self, _command: &LaunchCommand) -> Result<(), LaunchError> {
        self.running = true;
        Ok(())
    }

    fn write(&mut self, text: &str) -> anyhow::Result<()> {
        self.written.push(text.to_string());
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn pid(&self) -> Option<u32> {
        self.running.then_some(4711)
    }

    fn kill(&mut self) {
        self.killed = true;
        self.running = false;
    }

    fn interrupt(&mut self, inferior_pid: u32) -> anyhow::Result<()> {
        if self.fail_interrupt {
            anyhow::bail!("DebugBreakProcess failed");
        }
        self.interrupts.push(inferior_pid);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Vec<(String, LogChannel)>,
    states: Vec<EngineState>,
    threads: Option<ThreadList>,
    frames: Vec<Frame>,
    changed: Vec<ModelId>,
    memory: Vec<(u64, Vec<u8>)>,
    disassembly_calls: usize,
    setup_failure: Option<String>,
}

impl RecordingSink {
    fn has_message(&self, text: &str, channel: LogChannel) -> bool {
        self.messages.iter().any(|(t, c)| t == text && *c == channel)
    }
}

impl EngineSink for RecordingSink {
    fn show_message(&mut self, text: &str, channel: LogChannel) {
        self.messages.push((text.to_string(), channel));
    }

    fn state_changed(&mut self, state: EngineState) {
        self.states.push(state);
    }

    fn set_threads(&mut self, threads: &ThreadList) {
        self.threads = Some(threads.clone());
    }

    fn set_frames(&mut self, frames: &[Frame], _incomplete: bool, _current: Option<usize>) {
        self.frames = frames.to_vec();
    }

    fn breakpoint_changed(&mut self, breakpoint: &Breakpoint) {
        self.changed.push(breakpoint.model_id);
    }

    fn memory_fetched(&mut self, address: u64, data: &[u8]) {
        self.memory.push((address, data.to_vec()));
    }

    fn disassembly(&mut self, _lines: &[DisassemblerLine]) {
        self.disassembly_calls += 1;
    }

    fn setup_failed(&mut self, message: &str) {
        self.setup_failure = Some(message.to_string());
    }
}

type Engine = CdbEngine<MockTransport, RecordingSink>;

const STOP_AT_BREAKPOINT: &str = r#"{reason="breakpoint",breakpointId="100100",threadId="0",stack=[frame={level="0",address="0x401000",function="app!foo",from="app"}],threads={threads=[{id="0",target-id="1a2c",state="stopped"}],current-thread-id="0"}}"#;

const STOP_BY_CTRL_BREAK: &str = r#"{reason="exception",exceptionCode="1073807365",threadId="4"}"#;

fn engine(cdb_is_64bit: bool) -> Engine {
    // 存在確認を通すため、テスト実行ファイル自身を CDB と拡張ライブラリに見立てる
    let exe = std::env::current_exe().unwrap();
    let mut launch = LaunchParameters::new(exe.clone(), exe);
    launch.executable = Some("C:\\work\\app.exe".into());
    let mut params = RunParameters::new(launch);
    params.cdb_is_64bit = cdb_is_64bit;
    CdbEngine::new(MockTransport::default(), RecordingSink::default(), EngineSettings::default(), params).unwrap()
}

fn notify(engine: &mut Engine, kind: char, token: i64, service: &str, payload: &str) {
    engine.handle_line(&format!("<qtcreatorcdbext>|{}|{}|0|{}|{}", kind, token, service, payload));
}

fn reply(engine: &mut Engine, token: u32, service: &str, payload: &str) {
    notify(engine, 'R', i64::from(token), service, payload);
}

fn builtin_reply(engine: &mut Engine, token: u32, text: &str) {
    engine.handle_line(&format!("<token>{}<", token));
    for line in text.lines() {
        engine.handle_line(line);
    }
    engine.handle_line(&format!("<token>{}>", token));
}

/// 最後に送った組み込みコマンドのトークン
fn last_builtin_token(engine: &Engine) -> u32 {
    let text = engine
        .transport()
        .written
        .iter()
        .rev()
        .find(|w| w.starts_with(".echo \"<token>"))
        .expect("No builtin command was written");
    let rest = &text[".echo \"<token>".len()..];
    let end = rest.find('<').unwrap();
    rest[..end].parse().unwrap()
}

/// 最後に送った拡張コマンドのトークン
fn last_extension_token(engine: &Engine, function: &str) -> u32 {
    let prefix = format!("!qtcreatorcdbext.{} -t ", function);
    let text = written(engine)
        .iter()
        .rev()
        .find(|w| w.starts_with(&prefix))
        .expect("No extension command was written");
    let rest = &text[prefix.len()..];
    let end = rest.find('.').unwrap();
    rest[..end].parse().unwrap()
}

fn written(engine: &Engine) -> &[String] {
    &engine.transport().written
}

fn was_written(engine: &Engine, text: &str) -> bool {
    written(engine).iter().any(|w| w == text)
}

/// 起動して最初の idle まで進める
fn start(engine: &mut Engine) {
    engine.setup();
    assert_eq!(engine.state(), EngineState::SetupRequested);
    notify(engine, 'N', -1, "session_accessible", "0");
    notify(engine, 'N', -1, "session_idle", "");
}

/// PID を返して実行中にする
fn run(engine: &mut Engine, pid_token: u32) {
    reply(engine, pid_token, "pid", "1234");
    assert_eq!(engine.state(), EngineState::RunRequested);
    notify(engine, 'N', -1, "session_inaccessible", "1");
    assert_eq!(engine.state(), EngineState::InferiorRunOk);
}

fn stop(engine: &mut Engine, reason: &str) {
    notify(engine, 'N', -1, "session_accessible", "6");
    notify(engine, 'N', -1, "session_idle", reason);
}

#[test]
fn test_startup_sequence() {
    let mut engine = engine(true);
    start(&mut engine);

    assert_eq!(
        written(&engine),
        [
            ".sympath \"\"\n",
            ".symopt+0x8000\n",
            "sxn 0x4000001f\n",
            "sxn ibp\n",
            ".asm source_line\n",
            "!qtcreatorcdbext.setparameter maxStringLength=10000 maxStackDepth=1000 firstChance=0 secondChance=1\n",
            "!qtcreatorcdbext.pid -t 1.0\n",
        ]
    );

    run(&mut engine, 1);
    assert_eq!(written(&engine).last().map(String::as_str), Some("g\n"));
    assert_eq!(engine.inferior_pid(), Some(1234));
    assert_eq!(
        engine.sink().states,
        [
            EngineState::SetupRequested,
            EngineState::RunRequested,
            EngineState::InferiorRunOk
        ]
    );
}

#[test]
fn test_setup_failure_without_debugger() {
    let mut launch = LaunchParameters::new("C:\\nowhere\\cdb.exe", "C:\\nowhere\\ext.dll");
    launch.executable = Some("app.exe".into());
    let mut engine = CdbEngine::new(
        MockTransport::default(),
        RecordingSink::default(),
        EngineSettings::default(),
        RunParameters::new(launch),
    )
    .unwrap();

    engine.setup();
    assert_eq!(engine.state(), EngineState::SetupFailed);
    assert!(engine.sink().setup_failure.is_some());
    assert!(written(&engine).is_empty());

    engine.shutdown();
    assert_eq!(engine.state(), EngineState::Finished);
}

#[test]
fn test_pid_failure_fails_setup() {
    let mut engine = engine(true);
    start(&mut engine);
    notify(&mut engine, 'N', 1, "pid", "Cannot determine pid");

    assert_eq!(engine.state(), EngineState::SetupFailed);
    assert_eq!(
        engine.sink().setup_failure.as_deref(),
        Some("Failed to determine inferior pid: Cannot determine pid")
    );
}

#[test]
fn test_breakpoint_sent_at_initial_idle_and_hit() {
    let mut engine = engine(false);
    let id = engine
        .insert_breakpoint(BreakpointParameters::function("app!foo"))
        .unwrap();
    assert!(written(&engine).is_empty());

    start(&mut engine);
    // 組み込みコマンドの完了まで後続は送られない
    assert_eq!(written(&engine).len(), 1);
    assert!(written(&engine)[0].contains("bu100100 app!foo"));

    builtin_reply(&mut engine, 1, "");
    assert!(was_written(&engine, "!qtcreatorcdbext.breakpoints -t 2.0 -v\n"));
    assert!(was_written(&engine, "!qtcreatorcdbext.pid -t 3.0\n"));

    reply(
        &mut engine,
        2,
        "breakpoints",
        r#"[{id="100100",enabled="true",address="0x401000",module="app",expression="app!foo"}]"#,
    );
    assert_eq!(engine.sink().changed, [id]);
    assert_eq!(engine.breakpoints().pending_count(), 0);

    run(&mut engine, 3);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    assert_eq!(engine.state(), EngineState::InferiorStopOk);
    assert!(engine
        .sink()
        .has_message("Stopped at breakpoint 1 in thread 0.", LogChannel::Status));
    assert_eq!(engine.sink().frames.len(), 1);
    assert_eq!(engine.frames()[0].function, "app!foo");
    assert_eq!(engine.threads().current_id.as_deref(), Some("0"));

    engine.continue_inferior().unwrap();
    assert_eq!(engine.state(), EngineState::InferiorRunRequested);
    assert_eq!(written(&engine).last().map(String::as_str), Some("g\n"));
}

#[test]
fn test_breakpoint_toggle_keeps_pending() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    let id = engine
        .insert_breakpoint(BreakpointParameters::function("app!bar"))
        .unwrap();
    let token = last_builtin_token(&engine);
    builtin_reply(&mut engine, token, "");
    let list_token = last_extension_token(&engine, "breakpoints");

    let mut params = engine.breakpoints().get(id).unwrap().params.clone();
    params.enabled = false;
    engine.update_breakpoint(id, params).unwrap();
    assert_eq!(written(&engine).last().map(String::as_str), Some("bd 100100\n"));
    let bp = engine.breakpoints().get(id).unwrap();
    assert!(!bp.params.enabled);
    // 切り替えだけでは解決しない
    assert!(bp.params.pending);
    assert!(engine.breakpoints().is_pending(id));

    let report = r#"[{id="100100",enabled="false",address="0x402000",module="app",expression="app!bar"}]"#;
    reply(&mut engine, list_token, "breakpoints", report);
    let bp = engine.breakpoints().get(id).unwrap();
    assert!(!bp.params.pending);
    assert_eq!(bp.params.address, 0x402000);
    assert_eq!(engine.breakpoints().pending_count(), 0);
    let resolved = engine.sink().changed.len();

    // 解決済みのものは二度と解決しない
    engine.list_breakpoints();
    let list_token = last_extension_token(&engine, "breakpoints");
    reply(&mut engine, list_token, "breakpoints", report);
    assert_eq!(engine.sink().changed.len(), resolved);
}

#[test]
fn test_breakpoint_readd_clears_sub_breakpoints() {
    let mut engine = engine(false);
    let id = engine
        .insert_breakpoint(BreakpointParameters::function("app!foo"))
        .unwrap();
    start(&mut engine);
    builtin_reply(
        &mut engine,
        1,
        "Matched: app!foo (00000000`00401010)\n\
         Matched: app!foo (00000000`00402000)\n\
         Ambiguous symbol error at 'app!foo'",
    );
    assert_eq!(engine.breakpoints().get(id).unwrap().subs.len(), 2);

    let params = engine.breakpoints().get(id).unwrap().params.clone().with_condition("n > 2");
    engine.update_breakpoint(id, params).unwrap();
    assert!(was_written(&engine, "bc 100100-100102\n"));
    let bp = engine.breakpoints().get(id).unwrap();
    assert!(bp.subs.is_empty());
    assert_eq!(bp.params.condition, "n > 2");
    assert!(engine.breakpoints().is_pending(id));

    let token = last_builtin_token(&engine);
    let open = format!("<token>{}<", token);
    assert!(written(&engine)
        .iter()
        .any(|w| w.contains(&open) && w.contains("bu100100 app!foo")));
    builtin_reply(&mut engine, token, "");
    assert!(written(&engine)
        .last()
        .unwrap()
        .starts_with("!qtcreatorcdbext.breakpoints -t"));
}

#[test]
fn test_remove_pending_breakpoint() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    let id = engine
        .insert_breakpoint(BreakpointParameters::function("app!bar"))
        .unwrap();
    let token = last_builtin_token(&engine);
    builtin_reply(&mut engine, token, "");
    let list_token = last_extension_token(&engine, "breakpoints");
    assert!(engine.breakpoints().is_pending(id));

    engine.remove_breakpoint(id).unwrap();
    assert_eq!(written(&engine).last().map(String::as_str), Some("bc 100100\n"));
    assert!(engine.breakpoints().get(id).is_none());
    assert_eq!(engine.breakpoints().pending_count(), 0);

    // 削除後に届いた一覧では何も変わらない
    reply(
        &mut engine,
        list_token,
        "breakpoints",
        r#"[{id="100100",enabled="true",address="0x402000",module="app",expression="app!bar"}]"#,
    );
    assert!(engine.sink().changed.is_empty());
    assert!(matches!(engine.remove_breakpoint(id), Err(EngineError::UnknownBreakpoint(_))));
}

#[test]
fn test_conditional_breakpoint() {
    let mut engine = engine(false);
    engine
        .insert_breakpoint(BreakpointParameters::function("app!foo").with_condition("i == 5"))
        .unwrap();
    start(&mut engine);
    builtin_reply(&mut engine, 1, "");
    run(&mut engine, 3);

    stop(&mut engine, STOP_AT_BREAKPOINT);
    assert!(was_written(&engine, "!qtcreatorcdbext.expression -t 4.0 \"i == 5\"\n"));
    assert_eq!(engine.state(), EngineState::InferiorRunOk);

    reply(&mut engine, 4, "expression", "0");
    assert_eq!(written(&engine).last().map(String::as_str), Some("g\n"));
    assert_eq!(engine.state(), EngineState::InferiorRunOk);

    notify(&mut engine, 'N', -1, "session_inaccessible", "1");
    stop(&mut engine, STOP_AT_BREAKPOINT);
    reply(&mut engine, 5, "expression", "1");
    assert_eq!(engine.state(), EngineState::InferiorStopOk);
    assert!(engine.sink().has_message(
        "Value 1 obtained from evaluating the condition of breakpoint 1, stopping.",
        LogChannel::Misc
    ));
}

#[test]
fn test_builtin_commands_are_serialized() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    engine.fetch_disassembler(0x401000, "", "").unwrap();
    let token = last_builtin_token(&engine);
    engine.evaluate_expression("i").unwrap();
    assert!(!written(&engine).iter().any(|w| w.contains("expression")));
    assert!(engine.commands_pending());

    builtin_reply(&mut engine, token, "app!foo:\n00000000`00401000 55              push    rbp");
    assert_eq!(engine.sink().disassembly_calls, 1);
    let expected = format!("!qtcreatorcdbext.expression -t {}.0 i\n", token + 1);
    assert!(was_written(&engine, &expected));
}

#[test]
fn test_memory_fetch() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    engine.fetch_memory(0x1000, 5).unwrap();
    assert!(was_written(&engine, "!qtcreatorcdbext.memory -t 2.0 4096 5\n"));
    reply(&mut engine, 2, "memory", "48656c6c6f");
    assert_eq!(engine.sink().memory, [(0x1000, b"Hello".to_vec())]);

    engine.fetch_memory(0x2000, 2).unwrap();
    notify(&mut engine, 'N', 3, "memory", "Cannot read memory");
    assert_eq!(engine.sink().memory[1], (0x2000, vec![0, 0]));
    assert!(engine.sink().has_message("Cannot read memory", LogChannel::Warning));
}

#[test]
fn test_failed_memory_read_is_not_filled_beyond_limit() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    engine.fetch_memory(0x3000, 0x100_0000).unwrap();
    let token = last_extension_token(&engine, "memory");
    notify(&mut engine, 'N', i64::from(token), "memory", "Cannot read memory");
    assert!(engine.sink().memory.is_empty());
    assert!(engine.sink().has_message("Cannot read memory", LogChannel::Warning));
}

#[test]
fn test_script_messages_of_replies_are_shown() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    engine.evaluate_expression("i").unwrap();
    let token = last_extension_token(&engine, "expression");
    reply(&mut engine, token, "expression", r#"value="5",msg=["Evaluated in frame 0"]"#);
    assert!(engine.sink().has_message("Evaluated in frame 0", LogChannel::Misc));
}

#[test]
fn test_no_commands_after_cdb_exit() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);

    engine.handle_event(TransportEvent::Exited { code: None });
    assert_eq!(engine.state(), EngineState::Finished);
    assert_eq!(engine.inferior_pid(), None);

    let count = written(&engine).len();
    engine.reload_modules();
    engine.reload_threads();
    engine.list_breakpoints();
    assert_eq!(written(&engine).len(), count);
    assert!(engine.transport().interrupts.is_empty());
    assert_eq!(engine.state(), EngineState::Finished);
}

#[test]
fn test_interrupt_switches_to_main_thread() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);

    engine.interrupt_inferior().unwrap();
    assert_eq!(engine.state(), EngineState::InferiorStopRequested);
    assert_eq!(engine.transport().interrupts, [1234]);

    stop(&mut engine, STOP_BY_CTRL_BREAK);
    assert_eq!(engine.state(), EngineState::InferiorStopOk);
    assert!(engine.sink().has_message("Interrupted.", LogChannel::Status));
    assert!(was_written(&engine, "~0 s\n"));
    assert!(written(&engine).iter().any(|w| w.starts_with("!qtcreatorcdbext.stack -t") && w.ends_with(" unlimited\n")));
}

#[test]
fn test_interrupt_failure() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);
    engine.transport_mut().fail_interrupt = true;

    engine.interrupt_inferior().unwrap();
    assert_eq!(engine.state(), EngineState::InferiorStopFailed);
    assert!(engine.sink().has_message("DebugBreakProcess failed", LogChannel::Error));
}

#[test]
fn test_interrupt_requires_running_inferior() {
    let mut engine = engine(false);
    assert!(matches!(
        engine.interrupt_inferior(),
        Err(EngineError::WrongState { .. })
    ));
    assert!(matches!(engine.continue_inferior(), Err(EngineError::WrongState { .. })));
}

#[test]
fn test_command_while_running_is_deferred() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);

    engine.reload_modules();
    assert_eq!(engine.transport().interrupts, [1234]);
    assert!(!written(&engine).iter().any(|w| w.contains("modules")));

    stop(&mut engine, STOP_BY_CTRL_BREAK);
    let writes = written(&engine);
    let modules = writes
        .iter()
        .position(|w| w == "!qtcreatorcdbext.modules -t 2.0\n")
        .expect("Deferred command was not sent");
    assert_eq!(writes.last().map(String::as_str), Some("g\n"));
    assert!(modules < writes.len() - 1);
    assert_ne!(engine.state(), EngineState::InferiorStopOk);
}

#[test]
fn test_wow64_detection() {
    let mut engine = engine(true);
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);
    assert!(engine.sink().has_message("Checking for wow64 subsystem...", LogChannel::Misc));
    assert!(written(&engine).last().unwrap().contains("\nlm m wow64\n"));

    let token = last_builtin_token(&engine);
    builtin_reply(
        &mut engine,
        token,
        "start             end                 module name\n00000000`77c30000 00000000`77c6f000   wow64      (deferred)",
    );
    let token = last_builtin_token(&engine);
    assert!(written(&engine).last().unwrap().contains("\nk\n"));

    builtin_reply(
        &mut engine,
        token,
        "Child-SP          RetAddr           Call Site\n00000000`0012fe88 00000000`77c45d09 ntdll!ZwWaitForSingleObject",
    );
    assert_eq!(engine.session().wow64, Wow64State::Native64Stack);
    let token = last_builtin_token(&engine);
    assert!(written(&engine).last().unwrap().contains("\n!wow64exts.sw\n"));

    builtin_reply(&mut engine, token, "Switched to 32bit mode");
    assert_eq!(engine.session().wow64, Wow64State::Emulated32Stack);
    assert!(written(&engine)
        .last()
        .unwrap()
        .starts_with("!qtcreatorcdbext.threads -t"));

    engine.jump_to(0x401000).unwrap();
    assert_eq!(written(&engine).last().map(String::as_str), Some("r eip=0x401000\n"));
}

#[test]
fn test_wow64_detection_with_32bit_stack_header() {
    let mut engine = engine(true);
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    let token = last_builtin_token(&engine);
    builtin_reply(
        &mut engine,
        token,
        "start             end                 module name\n00000000`77c30000 00000000`77c6f000   wow64      (deferred)",
    );
    let token = last_builtin_token(&engine);
    builtin_reply(
        &mut engine,
        token,
        "ChildEBP RetAddr\n0012fe88 77c45d09 ntdll_77c30000!ZwWaitForSingleObject",
    );

    assert_eq!(engine.session().wow64, Wow64State::Emulated32Stack);
    assert!(!written(&engine).iter().any(|w| w.contains("!wow64exts.sw")));
    assert_eq!(engine.sink().frames.len(), 1);
    assert_eq!(engine.state(), EngineState::InferiorStopOk);
}

#[test]
fn test_ambiguous_breakpoint_creates_sub_breakpoints() {
    let mut engine = engine(false);
    let id = engine
        .insert_breakpoint(BreakpointParameters::function("app!foo"))
        .unwrap();
    start(&mut engine);
    builtin_reply(
        &mut engine,
        1,
        "Matched: app!foo+0x1b (00000000`00401010)\n\
         Matched: app!foo (00000000`00402000)\n\
         Matched: app!foo (00000000`00403000)\n\
         Ambiguous symbol error at 'app!foo'",
    );

    let bp = engine.breakpoints().get(id).unwrap();
    let ids: Vec<&str> = bp.subs.iter().map(|s| s.response_id.as_str()).collect();
    assert_eq!(ids, ["100101", "100102", "100103"]);
    assert_eq!(bp.subs[0].params.function, "foo");
    for (sub, address) in ["100101", "100102", "100103"].iter().zip(["0x401010", "0x402000", "0x403000"]) {
        assert!(
            written(&engine).iter().any(|w| w.contains(sub) && w.contains(address)),
            "No add command for sub-breakpoint {}",
            sub
        );
    }
}

#[test]
fn test_debuggee_output_and_script_messages() {
    let mut engine = engine(false);
    start(&mut engine);

    notify(&mut engine, 'N', -1, "debuggee_output", "48006900");
    assert!(engine.sink().has_message("Hi", LogChannel::AppOutput));

    notify(&mut engine, 'R', -1, "script", r#"msg=["hello","world"]"#);
    assert!(engine.sink().has_message("hello", LogChannel::Misc));
    assert!(engine.sink().has_message("world", LogChannel::Misc));
}

#[test]
fn test_shutdown_from_stopped_state() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    engine.shutdown();
    assert_eq!(engine.state(), EngineState::EngineShutdownRequested);
    assert_eq!(written(&engine).last().map(String::as_str), Some("q\n"));
    assert!(!engine.transport().killed);

    // 以降の出力は捨てる
    let count = engine.sink().messages.len();
    engine.handle_line("some trailing output");
    assert_eq!(engine.sink().messages.len(), count);

    engine.handle_event(TransportEvent::Exited { code: Some(0) });
    assert_eq!(engine.state(), EngineState::Finished);
    assert!(engine.sink().has_message("CDB exited with code 0.", LogChannel::Misc));
}

#[test]
fn test_inferior_exit_kills_cdb() {
    let mut engine = engine(false);
    start(&mut engine);
    run(&mut engine, 1);

    notify(&mut engine, 'E', -1, "event", "Process exited");
    assert!(engine.transport().killed);
    assert_eq!(engine.state(), EngineState::EngineShutdownRequested);
    assert!(engine.sink().states.contains(&EngineState::InferiorShutdownFinished));
}

#[test]
fn test_attach_mode_detaches_on_shutdown() {
    let exe = std::env::current_exe().unwrap();
    let mut launch = LaunchParameters::new(exe.clone(), exe);
    launch.start_mode = StartMode::AttachToLocalProcess;
    launch.attach_pid = Some(1234);
    let mut params = RunParameters::new(launch);
    params.cdb_is_64bit = false;
    let mut engine = CdbEngine::new(MockTransport::default(), RecordingSink::default(), EngineSettings::default(), params)
        .unwrap();
    start(&mut engine);
    run(&mut engine, 1);
    stop(&mut engine, STOP_AT_BREAKPOINT);

    engine.shutdown();
    let writes = written(&engine);
    let detach = writes.iter().position(|w| w == ".detach\n").expect("No .detach sent");
    assert!(detach < writes.len() - 1);
    assert_eq!(writes.last().map(String::as_str), Some("q\n"));
}
