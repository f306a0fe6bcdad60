//! cdbe CLI - コマンドラインインターフェース
//!
//! CDB をパイプ越しに操作するデバッガエンジン cdbe の REPL インターフェース

use anyhow::{bail, Result};
use cdbe_core::{
    Breakpoint, BreakpointParameters, CdbEngine, CdbProcess, Command, DisassemblerLine, EngineSettings, EngineSink,
    EngineState, Frame, Location, LogChannel, MiValue, Module, Register, RunParameters, SourcePathMapping, StartMode,
    ThreadList, TransportEvent,
};
use cdbe_target::{Interrupter, LaunchParameters};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::thread;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// cdbe - CDB debugger engine
#[derive(Parser)]
#[command(name = "cdbe")]
#[command(version = "0.1.0")]
#[command(about = "Drive the Windows console debugger (cdb.exe) over pipes", long_about = None)]
struct Cli {
    /// Path to cdb.exe
    #[arg(long, env = "CDB_PATH")]
    cdb: PathBuf,

    /// Path to the CDB extension library (qtcreatorcdbext.dll)
    #[arg(long, env = "CDBE_EXTENSION")]
    extension: PathBuf,

    /// Helper executable used to break into a running inferior
    #[arg(long, env = "CDBE_INTERRUPT_HELPER")]
    interrupt_helper: Option<PathBuf>,

    /// The CDB executable is a 32-bit build
    #[arg(long)]
    cdb_32bit: bool,

    /// Symbol search path entry (repeatable)
    #[arg(long = "symbol-path", env = "CDBE_SYMBOL_PATH", value_delimiter = ';')]
    symbol_paths: Vec<String>,

    /// Source search path entry (repeatable)
    #[arg(long = "source-path")]
    source_paths: Vec<String>,

    /// Source path mapping in the form `local=debugger` (repeatable)
    #[arg(long = "map-source")]
    source_map: Vec<String>,

    /// Event to stop on via `sxe` (repeatable)
    #[arg(long = "break-event")]
    break_events: Vec<String>,

    /// CDB command to run right after connecting (repeatable)
    #[arg(long = "after-connect")]
    commands_after_connect: Vec<String>,

    /// Stop at main
    #[arg(long)]
    break_on_main: bool,

    /// Show commands sent to CDB and debug logs
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: PathBuf,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Process ID to attach to
        pid: u32,
    },

    /// Open a crash dump
    Core {
        /// Path to the dump file
        file: PathBuf,
    },

    /// Connect to a CDB server (`tcp:server=host,port=1234`)
    Remote {
        channel: String,
    },
}

/// メインループに届くイベント
enum Event {
    Transport(TransportEvent),
    Input(String),
    /// Ctrl+C
    Interrupt,
    InputClosed,
}

impl From<TransportEvent> for Event {
    fn from(event: TransportEvent) -> Self {
        Event::Transport(event)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    println!("cdbe - CDB debugger engine");
    println!("Version 0.1.0");
    println!();

    let (events, receiver) = mpsc::channel();
    let process = CdbProcess::new(events.clone(), Interrupter::new(cli.interrupt_helper.clone()));
    let sink = ConsoleSink::new(cli.verbose);
    let mut engine = CdbEngine::new(process, sink, engine_settings(&cli), run_parameters(&cli)?)?;

    engine.setup();
    if engine.state() == EngineState::SetupFailed {
        bail!("Failed to start CDB");
    }
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();
    spawn_input_thread(events);

    for event in receiver {
        match event {
            Event::Transport(event) => engine.handle_event(event),
            Event::Input(line) => {
                if let Err(e) = handle_command(&mut engine, &line) {
                    eprintln!("Error: {:#}", e);
                }
            }
            Event::Interrupt => {
                if let Err(e) = engine.interrupt_inferior() {
                    eprintln!("Error: {}", e);
                }
            }
            Event::InputClosed => engine.shutdown(),
        }
        match engine.state() {
            EngineState::Finished => break,
            EngineState::SetupFailed => {
                engine.shutdown();
                bail!("Failed to start the debugging session");
            }
            _ => {}
        }
    }

    println!("Goodbye!");
    Ok(())
}

/// ログは標準エラー出力へ。`RUST_LOG` があればそちらを優先する
fn init_logger(verbose: bool) {
    let default = if verbose {
        "warn,cdbe=debug,cdbe_core=debug,cdbe_target=debug,cdbe_mi=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn engine_settings(cli: &Cli) -> EngineSettings {
    EngineSettings {
        symbol_paths: cli.symbol_paths.clone(),
        source_paths: cli.source_paths.clone(),
        break_events: cli.break_events.clone(),
        ..EngineSettings::default()
    }
}

fn run_parameters(cli: &Cli) -> Result<RunParameters> {
    let mut launch = LaunchParameters::new(cli.cdb.clone(), cli.extension.clone());
    match &cli.command {
        DebugCommand::Run { binary, args } => {
            launch.start_mode = StartMode::StartInternal;
            launch.executable = Some(binary.clone());
            launch.arguments = args.clone();
        }
        DebugCommand::Attach { pid } => {
            launch.start_mode = StartMode::AttachToLocalProcess;
            launch.attach_pid = Some(*pid);
        }
        DebugCommand::Core { file } => {
            launch.start_mode = StartMode::AttachToCore;
            launch.core_file = Some(file.clone());
        }
        DebugCommand::Remote { channel } => {
            launch.start_mode = StartMode::AttachToRemoteServer;
            launch.remote_channel = Some(channel.clone());
        }
    }

    let mut params = RunParameters::new(launch);
    params.break_on_main = cli.break_on_main;
    params.commands_after_connect = cli.commands_after_connect.clone();
    params.cdb_is_64bit = !cli.cdb_32bit;
    for mapping in &cli.source_map {
        let Some((source, debugger)) = mapping.split_once('=') else {
            bail!("Invalid source mapping '{}', expected local=debugger", mapping);
        };
        params.source_path_map.push(SourcePathMapping::new(source, debugger));
    }
    Ok(params)
}

/// 行入力のスレッド
fn spawn_input_thread(events: Sender<Event>) {
    thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Error: {:?}", e);
                let _ = events.send(Event::InputClosed);
                return;
            }
        };
        loop {
            let event = match rl.readline("(cdbe) ") {
                Ok(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(line.as_str());
                    Event::Input(line)
                }
                Err(ReadlineError::Interrupted) => Event::Interrupt,
                Err(ReadlineError::Eof) => {
                    let _ = events.send(Event::InputClosed);
                    return;
                }
                Err(err) => {
                    eprintln!("Error: {:?}", err);
                    let _ = events.send(Event::InputClosed);
                    return;
                }
            };
            if events.send(event).is_err() {
                return;
            }
        }
    });
}

type Engine = CdbEngine<CdbProcess<Event>, ConsoleSink>;

fn handle_command(engine: &mut Engine, line: &str) -> Result<()> {
    let Some(command) = Command::parse(line) else {
        println!("Unknown command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(());
    };
    debug!("Command {:?}", command);

    match command {
        Command::Help => print_help(),
        Command::Quit => engine.shutdown(),
        Command::Break(location, condition) => {
            let mut params = location.to_breakpoint();
            if let Some(condition) = condition {
                params = params.with_condition(condition);
            }
            let id = engine.insert_breakpoint(params)?;
            println!("Breakpoint {} set at {}", id, describe_location(&location));
        }
        Command::Trace(location) => {
            let mut params = location.to_breakpoint();
            params.tracepoint = true;
            let id = engine.insert_breakpoint(params)?;
            println!("Tracepoint {} set at {}", id, describe_location(&location));
        }
        Command::Watch(address, size) => {
            let id = engine.insert_breakpoint(BreakpointParameters::watchpoint(address, size))?;
            println!("Watchpoint {} set at 0x{:x} ({} bytes)", id, address, size);
        }
        Command::Delete(id) => {
            engine.remove_breakpoint(id)?;
            println!("Breakpoint {} deleted", id);
        }
        Command::Enable(id) => set_breakpoint_enabled(engine, id, true)?,
        Command::Disable(id) => set_breakpoint_enabled(engine, id, false)?,
        Command::Breakpoints => print_breakpoints(engine),
        Command::Continue => engine.continue_inferior()?,
        Command::Step => engine.step_in(false)?,
        Command::StepInstruction => engine.step_in(true)?,
        Command::Next => engine.step_over(false)?,
        Command::NextInstruction => engine.step_over(true)?,
        Command::Finish => engine.step_out()?,
        Command::Until(location) => match location {
            Location::FileAndLine(file, line) => engine.run_to_line(&file, line)?,
            Location::Address(address) => engine.run_to_address(address)?,
            Location::Function(function) => engine.run_to_function(&function)?,
        },
        Command::Jump(location) => match location {
            Location::FileAndLine(file, line) => engine.jump_to_line(&file, line)?,
            Location::Address(address) => engine.jump_to(address)?,
            Location::Function(function) => bail!("Cannot jump to function '{}', use file:line or an address", function),
        },
        Command::Interrupt => engine.interrupt_inferior()?,
        Command::Backtrace => print_frames(engine.frames()),
        Command::FullBacktrace => engine.create_full_backtrace()?,
        Command::Threads => print_threads(engine.threads()),
        Command::Thread(id) => engine.select_thread(&id)?,
        Command::Registers => engine.reload_registers(),
        Command::SetRegister(name, value) => engine.set_register_value(&name, &value)?,
        Command::Modules => engine.reload_modules(),
        Command::Memory(address, length) => engine.fetch_memory(address, length)?,
        Command::Print(expression) => engine.evaluate_expression(&expression)?,
        Command::Disassemble(location) => match location {
            None => {
                let Some(frame) = engine.frames().iter().find(|f| f.usable).or_else(|| engine.frames().first()) else {
                    bail!("No current frame");
                };
                let (module, function) = split_function(&frame.function);
                let (address, module, function) = (frame.address, module.to_string(), function.to_string());
                engine.fetch_disassembler(address, &module, &function)?;
            }
            Some(Location::Address(address)) => engine.fetch_disassembler(address, "", "")?,
            Some(Location::Function(name)) => {
                let (module, function) = split_function(&name);
                engine.fetch_disassembler(0, module, function)?;
            }
            Some(Location::FileAndLine(..)) => bail!("Cannot disassemble a source line, use a function or an address"),
        },
        Command::Raw(text) => engine.execute_debugger_command(&text)?,
        Command::Detach => engine.detach()?,
    }

    Ok(())
}

/// `module!function` を分割する
fn split_function(name: &str) -> (&str, &str) {
    name.split_once('!').unwrap_or(("", name))
}

fn describe_location(location: &Location) -> String {
    match location {
        Location::FileAndLine(file, line) => format!("{}:{}", file, line),
        Location::Address(address) => format!("0x{:x}", address),
        Location::Function(function) => function.clone(),
    }
}

fn set_breakpoint_enabled(engine: &mut Engine, id: u32, enabled: bool) -> Result<()> {
    let Some(bp) = engine.breakpoints().get(id) else {
        bail!("No breakpoint number {}", id);
    };
    let mut params = bp.params.clone();
    params.enabled = enabled;
    engine.update_breakpoint(id, params)?;
    Ok(())
}

fn print_breakpoints(engine: &Engine) {
    if engine.breakpoints().is_empty() {
        println!("No breakpoints");
        return;
    }
    for bp in engine.breakpoints().iter() {
        print_breakpoint(bp);
        for sub in &bp.subs {
            println!("    {} {} at 0x{:x}", sub.display_name, sub.params.function, sub.params.address);
        }
    }
}

fn print_breakpoint(bp: &Breakpoint) {
    let params = &bp.params;
    let location = match &params.file {
        Some(file) => format!("{}:{}", file, params.line),
        None if !params.function.is_empty() => params.function.clone(),
        None => format!("0x{:x}", params.address),
    };
    let mut line = format!("  {} {} {}", bp.display_name, params.kind.name(), location);
    if params.address != 0 {
        line.push_str(&format!(" (0x{:x})", params.address));
    }
    if !params.enabled {
        line.push_str(" [disabled]");
    }
    if params.pending {
        line.push_str(" [pending]");
    }
    if !params.condition.is_empty() {
        line.push_str(&format!(" if {}", params.condition));
    }
    println!("{}", line);
}

fn print_frames(frames: &[Frame]) {
    if frames.is_empty() {
        println!("No stack");
        return;
    }
    for frame in frames {
        print_frame(frame);
    }
}

fn print_frame(frame: &Frame) {
    match &frame.file {
        Some(file) if !file.is_empty() => println!(
            "#{:<3} 0x{:016x} {} at {}:{}",
            frame.level, frame.address, frame.function, file, frame.line
        ),
        _ => println!("#{:<3} 0x{:016x} {}", frame.level, frame.address, frame.function),
    }
}

fn print_threads(threads: &ThreadList) {
    if threads.threads.is_empty() {
        println!("No threads");
        return;
    }
    for thread in &threads.threads {
        let marker = if threads.current_id.as_deref() == Some(thread.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:>3} {} {} {} 0x{:x}",
            marker, thread.id, thread.target_id, thread.name, thread.function, thread.address
        );
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help                   - Show this help message");
    println!("  quit/exit/q            - Shut down the debugger");
    println!();
    println!("Execution:");
    println!("  continue (c)           - Continue execution");
    println!("  step (s) / stepi (si)  - Step into by source line / instruction");
    println!("  next (n) / nexti (ni)  - Step over by source line / instruction");
    println!("  finish (f)             - Run until the current function returns");
    println!("  until <loc>            - Run to a location");
    println!("  jump <file:line|addr>  - Move the instruction pointer");
    println!("  interrupt (i)          - Break into the running process (or Ctrl+C)");
    println!("  detach                 - Detach from the process");
    println!();
    println!("Breakpoints:");
    println!("  break <loc> [if cond]  - Set a breakpoint (file:line, [module!]function, *addr)");
    println!("  trace <loc>            - Set a tracepoint");
    println!("  watch <addr> [size]    - Set a data breakpoint");
    println!("  delete/enable/disable <n>");
    println!("  info breakpoints       - List breakpoints");
    println!();
    println!("Inspection:");
    println!("  bt / bt full           - Backtrace of the current / all threads");
    println!("  threads, thread <id>   - List or select threads");
    println!("  registers, modules");
    println!("  set $reg = value       - Change a register");
    println!("  x <addr> [len]         - Dump memory");
    println!("  print (p) <expr>       - Evaluate an expression");
    println!("  disas [loc]            - Disassemble");
    println!("  cdb <command>          - Send a raw CDB command");
    println!();
    println!("Examples:");
    println!("  break main.cpp:18");
    println!("  break app!foo if i == 3");
    println!("  x 0x7ff6a1031000 32");
}

/// 端末へ表示する出力先
struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl EngineSink for ConsoleSink {
    fn show_message(&mut self, text: &str, channel: LogChannel) {
        if text.is_empty() {
            return;
        }
        match channel {
            LogChannel::Input => {
                if self.verbose {
                    println!("> {}", text);
                }
            }
            LogChannel::Misc => println!("{}", text),
            LogChannel::Status => println!("[{}]", text),
            LogChannel::Warning => eprintln!("warning: {}", text),
            LogChannel::Error => eprintln!("error: {}", text),
            LogChannel::AppOutput => print!("{}", text),
        }
    }

    fn state_changed(&mut self, state: EngineState) {
        info!("Engine state {:?}", state);
    }

    fn set_frames(&mut self, frames: &[Frame], incomplete: bool, current: Option<usize>) {
        if let Some(frame) = current.and_then(|i| frames.get(i)) {
            print_frame(frame);
        }
        if incomplete {
            debug!("Stack trace is incomplete ({} frames)", frames.len());
        }
    }

    fn breakpoint_changed(&mut self, breakpoint: &Breakpoint) {
        print_breakpoint(breakpoint);
    }

    fn set_registers(&mut self, registers: &[Register]) {
        for register in registers {
            println!("{:<8} {}", register.name, register.value);
        }
    }

    fn set_modules(&mut self, modules: &[Module]) {
        for module in modules {
            let symbols = if module.symbols_read { "" } else { " (deferred)" };
            println!(
                "0x{:016x} 0x{:016x} {} {}{}",
                module.start, module.end, module.name, module.image, symbols
            );
        }
    }

    fn memory_fetched(&mut self, address: u64, data: &[u8]) {
        for (i, chunk) in data.chunks(16).enumerate() {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            let ascii: String = chunk
                .iter()
                .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
                .collect();
            println!("0x{:016x}  {:<47}  {}", address + (i * 16) as u64, bytes.join(" "), ascii);
        }
    }

    fn disassembly(&mut self, lines: &[DisassemblerLine]) {
        for line in lines {
            match &line.label {
                Some(label) => println!("{}", label),
                None => println!(
                    "  0x{:016x} {:<20} {} {}",
                    line.address, line.bytes, line.mnemonic, line.operands
                ),
            }
        }
    }

    fn full_backtrace(&mut self, text: &str) {
        println!("{}", text);
    }

    fn expression_result(&mut self, expression: &str, value: &MiValue) {
        println!("{} = {}", expression, value);
    }

    fn exception_box(&mut self, message: &str) {
        eprintln!("*** {}", message);
    }

    fn setup_failed(&mut self, message: &str) {
        eprintln!("Setup failed: {}", message);
    }
}
