//! Kotoba CLI - コマンドラインインターフェース
//!
//! 式評価デバッガ kotoba のREPLインターフェース

mod complete;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kotoba_core::{
    Command, Debugger, EvalOptions, Evaluation, ExecutionPolicy, ExprOverrides, StopOutcome,
};
use complete::KotobaHelper;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Kotoba - Expression Evaluating Debugger
#[derive(Parser)]
#[command(name = "kotoba")]
#[command(version = "0.1.0")]
#[command(about = "Debugger that compiles expressions and runs them inside the target", long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by KOTOBA_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Path to the executable binary
        binary: String,

        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("KOTOBA_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    println!("Kotoba - Expression Evaluating Debugger");
    println!("Version 0.1.0");
    println!();

    let debugger = init_debugger(cli.command)?;
    run_repl(Rc::new(RefCell::new(debugger)))?;

    Ok(())
}

/// デバッガを初期化してプロセスにアタッチまたは起動する
fn init_debugger(command: DebugCommand) -> Result<Debugger> {
    let mut debugger = Debugger::new();

    match command {
        DebugCommand::Run { binary, args } => {
            debugger.load_binary(&binary)?;
            println!("Loaded symbols from {}", binary);

            debugger.spawn(&binary, &args)?;
            println!("Process spawned and stopped at first instruction");
            println!("Set breakpoints and use 'continue' to continue execution");
            println!();
        }
        DebugCommand::Attach { binary, pid } => {
            debugger.load_binary(&binary)?;
            println!("Loaded symbols from {}", binary);

            debugger.attach(pid)?;
            println!("Attached to process {}", pid);
            println!();
        }
    }

    Ok(debugger)
}

/// REPLループを実行する
fn run_repl(debugger: Rc<RefCell<Debugger>>) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = Editor::<KotobaHelper, DefaultHistory>::new()?;
    rl.set_helper(Some(KotobaHelper::new(Rc::clone(&debugger))));

    loop {
        match rl.readline("(kotoba) ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                let result = handle_command(&mut debugger.borrow_mut(), line);
                match result {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {}", e),
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

    println!("Goodbye!");
    Ok(())
}

/// コマンドを実行する（falseを返したら終了）
fn handle_command(debugger: &mut Debugger, line: &str) -> Result<bool> {
    let Some(command) = Command::parse(line)? else {
        println!("Unknown command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(true);
    };
    debug!("Command: {:?}", command);

    match command {
        Command::Print(text) => handle_expr(debugger, &text, ExprOverrides::default())?,
        Command::Expr { text, overrides } => handle_expr(debugger, &text, overrides)?,
        Command::Top(text) => handle_expr(
            debugger,
            &text,
            ExprOverrides {
                policy: Some(ExecutionPolicy::TopLevel),
                ..ExprOverrides::default()
            },
        )?,
        Command::RegisterRead(name) => {
            let value = debugger.read_register(&name)?;
            println!("{} = {}", name, value);
        }
        Command::RegisterWrite { name, value } => {
            debugger.write_register(&name, value)?;
            println!("{} = {}", name, debugger.read_register(&name)?);
        }
        Command::Examine { address, len } => {
            let bytes = debugger.examine(address, len)?;
            print_hex_dump(address, &bytes);
            if bytes.len() < len {
                println!("(only {} of {} bytes readable)", bytes.len(), len);
            }
        }
        Command::Break(loc) => handle_break(debugger, &loc)?,
        Command::Continue => handle_continue(debugger)?,
        Command::Find(pattern) => handle_find(debugger, &pattern),
        Command::Source(path) => {
            let options = debugger.options().clone();
            let evaluation = debugger.evaluate_file(&path, &options)?;
            print_evaluation(&evaluation);
        }
        Command::Help => print_help(),
        Command::Quit => return Ok(false),
    }

    Ok(true)
}

/// 式を評価して結果を表示する
fn handle_expr(debugger: &mut Debugger, text: &str, overrides: ExprOverrides) -> Result<()> {
    let options: EvalOptions = overrides.apply(debugger.options());
    let evaluation = debugger.evaluate(text, &options)?;
    print_evaluation(&evaluation);
    Ok(())
}

fn print_evaluation(evaluation: &Evaluation) {
    let source = evaluation.expression.text();
    if evaluation.was_fixed() {
        println!("(fixed) {}", source);
    }
    for diag in &evaluation.diagnostics {
        println!("{}", diag.render(source));
    }
    println!("{}", evaluation.value);
}

/// Breakコマンドを処理する
fn handle_break(debugger: &mut Debugger, loc: &str) -> Result<()> {
    if let Some(hex) = loc.strip_prefix("0x") {
        let addr = u64::from_str_radix(hex, 16)?;
        let id = debugger.set_breakpoint(addr)?;
        println!("Breakpoint {} set at 0x{:x}", id, addr);
        return Ok(());
    }

    let id = debugger.set_breakpoint_by_symbol(loc)?;
    println!("Breakpoint {} set at symbol '{}'", id, loc);
    Ok(())
}

/// Continueコマンドを処理する
fn handle_continue(debugger: &mut Debugger) -> Result<()> {
    println!("Continuing execution...");

    match debugger.continue_execution()? {
        StopOutcome::Breakpoint(pc) => {
            println!();
            println!("Breakpoint hit at 0x{:x}", pc);
            if let Some(symbol) = debugger.reverse_resolve(pc) {
                println!("In function: {}", symbol.demangled_name);
            }
        }
        StopOutcome::Stopped(reason) => {
            println!();
            println!("Process stopped: {}", reason);
        }
        StopOutcome::Exited(code) => {
            println!();
            println!("Process exited with code {}", code);
        }
        StopOutcome::Timeout => {
            println!();
            println!("Process is still running");
        }
    }

    Ok(())
}

/// シンボル検索の結果を表示する
fn handle_find(debugger: &Debugger, pattern: &str) {
    const LIMIT: usize = 10;
    let symbols = debugger.find_symbols(pattern);
    if symbols.is_empty() {
        println!("No symbols matching '{}' found", pattern);
        return;
    }

    println!("Symbols matching '{}' ({} found):", pattern, symbols.len());
    for (i, sym) in symbols.iter().take(LIMIT).enumerate() {
        if sym.size > 0 {
            println!(
                "  {}. {} @ 0x{:x} (size: {})",
                i + 1,
                sym.demangled_name,
                sym.address,
                sym.size
            );
        } else {
            println!("  {}. {} @ 0x{:x}", i + 1, sym.demangled_name, sym.address);
        }
    }
    if symbols.len() > LIMIT {
        println!("  ... and {} more", symbols.len() - LIMIT);
    }
}

fn print_hex_dump(address: u64, bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        println!(
            "0x{:016x}: {:<47}  {}",
            address + (i * 16) as u64,
            hex.join(" "),
            ascii
        );
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help (h, ?)            - Show this help message");
    println!("  quit/exit/q            - Exit the debugger");
    println!();
    println!("Expression commands:");
    println!("  print (p) <expr>       - Evaluate an expression");
    println!("  expr (e) [opts] <expr> - Evaluate with --policy, --lang or --type");
    println!("  top <decl>             - Insert top-level declarations into the target");
    println!("  source <file>          - Evaluate the expression written in a file");
    println!();
    println!("Debug commands:");
    println!("  register read <reg>    - Show a register");
    println!("  register write <reg> <value>");
    println!("  x <addr> [len]         - Dump target memory");
    println!("  break (b) <loc>        - Set breakpoint at symbol or address");
    println!("  continue (c)           - Continue execution");
    println!("  find <pattern>         - Find symbols matching pattern");
    println!();
    println!("Policies: always, never, top-level, if-necessary");
    println!();
    println!("Examples:");
    println!("  p (1 + 2) * 3");
    println!("  expr --policy always -- counter + 1");
    println!("  top int total = 0;");
    println!("  break main");
    println!();
    println!("Press TAB to complete commands and names in expressions.");
}
