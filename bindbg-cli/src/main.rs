//! bindbg CLI
//!
//! `bindbg serve` はデバッガ側、`bindbg ui` は解析ツール側を端末上で動かします。

mod console;

use anyhow::{Context, Result};
use bindbg_analyzer::{Action, AnalysisHost, ChildLauncher, DebuggerLauncher, Highlight, SessionRegistry};
use bindbg_core::config::{DEFAULT_CONNECT_RETRY, DEFAULT_POLL_INTERVAL, DEFAULT_SETTLE_DELAY};
use bindbg_core::transport::Endpoint;
use bindbg_core::{Connector, SyncConfig};
use clap::{Args, Parser, Subcommand};
use console::ConsoleHost;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// bindbg - keep a disassembler view and a live debugger in sync
#[derive(Parser)]
#[command(name = "bindbg")]
#[command(version)]
#[command(about = "Synchronize breakpoints and the instruction pointer between an analyzer and a debugger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the debugger side: debug a program and wait for the analyzer
    Serve {
        /// Endpoint name shared with the analyzer
        #[arg(long, env = "BINDBG_PIPE")]
        pipe: String,

        /// Attach to a running process instead of launching one
        #[arg(short, long, conflicts_with = "program")]
        attach: Option<i32>,

        /// Working directory of the launched program
        #[arg(long)]
        cwd: Option<PathBuf>,

        #[command(flatten)]
        sync: SyncArgs,

        /// Path to the executable binary
        #[arg(required_unless_present = "attach")]
        program: Option<PathBuf>,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run the analyzer side on a terminal
    Ui {
        /// Endpoint name shared with the debugger
        #[arg(long, env = "BINDBG_PIPE")]
        pipe: String,

        /// Debugger executable to launch when none is listening (defaults to this binary)
        #[arg(long)]
        debugger: Option<PathBuf>,

        #[command(flatten)]
        sync: SyncArgs,

        /// Path to the executable binary to analyze
        program: PathBuf,

        /// Arguments to pass to the program when the debugger is launched
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// 同期ループの間隔
#[derive(Args)]
struct SyncArgs {
    /// How long each loop waits for a message, in milliseconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    poll_ms: u64,

    /// Delay after interrupting a running target, in milliseconds
    #[arg(long, default_value_t = DEFAULT_SETTLE_DELAY.as_millis() as u64)]
    settle_ms: u64,

    /// Interval between connection attempts, in milliseconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_RETRY.as_millis() as u64)]
    retry_ms: u64,
}

impl SyncArgs {
    fn config(&self) -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(self.poll_ms),
            settle_delay: Duration::from_millis(self.settle_ms),
            connect_retry: Duration::from_millis(self.retry_ms),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Mode::Serve {
            pipe,
            attach,
            cwd,
            sync,
            program,
            args,
        } => run_serve(&pipe, attach, cwd, program, &args, sync.config()),
        Mode::Ui {
            pipe,
            debugger,
            sync,
            program,
            args,
        } => run_ui(pipe, debugger, program, args, sync.config()),
    }
}

/// デバッガ側を実行する
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run_serve(
    pipe: &str,
    attach: Option<i32>,
    cwd: Option<PathBuf>,
    program: Option<PathBuf>,
    args: &[String],
    config: SyncConfig,
) -> Result<()> {
    use bindbg_debugger::{serve, PtraceBackend};
    use std::sync::atomic::Ordering;
    use tracing::info;

    let mut backend = match (attach, program) {
        (Some(pid), _) => PtraceBackend::attach(pid)?,
        (None, Some(program)) => PtraceBackend::launch(&program, args, cwd.as_deref())?,
        (None, None) => anyhow::bail!("Nothing to debug: give a program or --attach"),
    };

    // Ctrl-C（または解析ツールからのSIGINT）でターゲットを止める
    let break_requested = backend.break_handle();
    ctrlc::set_handler(move || break_requested.store(true, Ordering::SeqCst))
        .context("Failed to install the break handler")?;

    let endpoint = Endpoint::new(pipe);
    let mut listener = endpoint.listen()?;
    info!("Waiting for analyzer on {}", endpoint.path().display());

    serve(&mut listener, &mut backend, &config)?;
    info!("Debugging finished");
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run_serve(
    _pipe: &str,
    _attach: Option<i32>,
    _cwd: Option<PathBuf>,
    _program: Option<PathBuf>,
    _args: &[String],
    _config: SyncConfig,
) -> Result<()> {
    anyhow::bail!("The debugger side is only available on x86_64 Linux")
}

/// 解析ツール側を実行する
fn run_ui(
    pipe: String,
    debugger: Option<PathBuf>,
    program: PathBuf,
    args: Vec<String>,
    config: SyncConfig,
) -> Result<()> {
    println!("bindbg - analyzer console");
    println!();

    let host = Arc::new(ConsoleHost::load(&program)?);
    println!("Loaded {} ({} symbols)", program.display(), host.image().symbols().count());

    let debugger = match debugger {
        Some(path) => path,
        None => std::env::current_exe().context("Failed to locate the bindbg executable")?,
    };

    let registry = SessionRegistry::new(
        config,
        Box::new(|endpoint: &str| -> Box<dyn Connector> { Box::new(Endpoint::new(endpoint)) }),
        Box::new(move || -> Box<dyn DebuggerLauncher> { Box::new(ChildLauncher::new(debugger.clone())) }),
    );

    let context = program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());
    registry.open(context.clone(), Arc::clone(&host) as Arc<dyn AnalysisHost>, program, pipe);
    registry.set_args(&context, args)?;

    run_repl(&registry, &host, &context)?;
    registry.shutdown();
    Ok(())
}

/// REPLループを実行する
fn run_repl(registry: &SessionRegistry, host: &ConsoleHost, context: &str) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(bindbg) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match Action::parse(line) {
                    Some(Action::Quit) => break,
                    Some(action) => {
                        if let Err(e) = handle_action(registry, host, context, action) {
                            eprintln!("Error: {:#}", e);
                        }
                    }
                    None => {
                        println!("Unknown command: {}", line);
                        println!("Type 'help' for available commands.");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

fn handle_action(registry: &SessionRegistry, host: &ConsoleHost, context: &str, action: Action) -> Result<()> {
    match action {
        Action::Start => {
            registry.start(context)?;
        }
        Action::Stop => registry.stop(context)?,
        Action::SetBreakpoint(location) => registry.set_bp(context, host.resolve_location(&location)?)?,
        Action::DeleteBreakpoint(location) => registry.delete_bp(context, host.resolve_location(&location)?)?,
        Action::SetIp(location) => registry.set_ip(context, host.resolve_location(&location)?)?,
        Action::RunTo(location) => registry.run_to(context, host.resolve_location(&location)?)?,
        Action::Go => registry.go(context)?,
        Action::Break => registry.interrupt(context)?,
        Action::StepIn => registry.step_in(context)?,
        Action::StepOver => registry.step_over(context)?,
        Action::StepOut => registry.step_out(context)?,
        Action::Sync => registry.sync(context)?,
        Action::SetArgs(args) => {
            println!("Process arguments: {:?}", args);
            registry.set_args(context, args)?;
        }
        Action::Show => print_state(host),
        Action::Help => print_help(),
        Action::Quit => {}
    }
    Ok(())
}

/// ハイライトとコメントを表示する
fn print_state(host: &ConsoleHost) {
    if let Some(cursor) = host.cursor() {
        println!("At {}: {}", host.describe(cursor), host.disassemble(cursor));
    }

    let highlights = host.highlights();
    if highlights.is_empty() {
        println!("No highlights");
    }
    for (addr, highlight) in highlights {
        let label = match highlight {
            Highlight::InstructionPointer => "ip",
            Highlight::Breakpoint => "breakpoint",
            Highlight::BreakpointHit => "breakpoint hit",
            Highlight::BranchTarget => "branch target",
            Highlight::None => continue,
        };
        println!("  [{:>6}] {} {}: {}", highlight.color(), label, host.describe(addr), host.disassemble(addr));
    }

    for (addr, comment) in host.comments() {
        println!("  {}: ; {}", host.describe(addr), comment);
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help           - Show this help message");
    println!("  quit/exit/q    - Exit (stops the session)");
    println!();
    println!("Session commands:");
    println!("  start          - Connect to the debugger, launching it if needed");
    println!("  stop           - End the session");
    println!("  sync           - Ask the debugger for its full state");
    println!("  args [args..]  - Set arguments for the next launched program");
    println!("  show           - Show highlights and comments");
    println!();
    println!("Debug commands:");
    println!("  break <loc>    - Set breakpoint at symbol or address");
    println!("  delete <loc>   - Delete breakpoint");
    println!("  setip <loc>    - Move the instruction pointer");
    println!("  until <loc>    - Run to location");
    println!("  continue (c)   - Continue execution (starts a session if none)");
    println!("  pause          - Break into the debugger");
    println!("  step (s)       - Step into");
    println!("  next (n)       - Step over");
    println!("  finish (f)     - Step out");
    println!();
    println!("Examples:");
    println!("  break main");
    println!("  break 0x1234");
    println!("  until 0x401020");
}
