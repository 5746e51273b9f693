//! `vtl` — the VitteLight command-line front end: assemble, disassemble,
//! run, dump, benchmark, and a small REPL. This binary is a thin driver
//! over the `vittelight` library; all core semantics live there.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Instant;

use clap::{Parser, Subcommand};

use vittelight::module::Module;
use vittelight::value::Value;
use vittelight::vm::{trace, Context, Status};
use vittelight::{assemble, natives, AssembleError, LoadError};

#[derive(Parser)]
#[command(name = "vtl", about = "VitteLight assembler, loader, and virtual machine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble textual source into a VLBC image.
    Asm {
        input: PathBuf,
        #[arg(short = 'o', long = "out")]
        output: PathBuf,
    },
    /// Disassemble a VLBC image to stdout.
    Dis { input: PathBuf },
    /// Load (assembling if needed), attach, and run a program.
    Run {
        input: PathBuf,
        #[arg(long, value_delimiter = ',')]
        trace: Vec<String>,
        #[arg(long, default_value_t = 0)]
        max_steps: usize,
        #[arg(long)]
        print_stack: bool,
    },
    /// Print VLBC header metadata, optionally raw bytes and the pool.
    Dump {
        input: PathBuf,
        #[arg(long)]
        hexdump: bool,
        #[arg(long)]
        strings: bool,
    },
    /// Attach once, run the body repeatedly with the IP reset between
    /// iterations, and report timing.
    Bench {
        input: PathBuf,
        #[arg(short = 'n', long, default_value_t = 1000)]
        iters: u64,
    },
    /// Read lines of assembly, assembling and running each while
    /// preserving context globals.
    Repl,
}

/// Exit codes per the command-surface contract: 0 success, 1 runtime
/// failure, 2 usage error, 3-10 fine-grained I/O/load failures.
#[repr(u8)]
enum Exit {
    RuntimeFailure = 1,
    IoError = 3,
    LoadFailure = 4,
    AssembleFailure = 5,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code as u8),
    }
}

fn run(command: Command) -> Result<(), Exit> {
    match command {
        Command::Asm { input, output } => cmd_asm(&input, &output),
        Command::Dis { input } => cmd_dis(&input),
        Command::Run { input, trace, max_steps, print_stack } => {
            cmd_run(&input, &trace, max_steps, print_stack)
        }
        Command::Dump { input, hexdump, strings } => cmd_dump(&input, hexdump, strings),
        Command::Bench { input, iters } => cmd_bench(&input, iters),
        Command::Repl => cmd_repl(),
    }
}

fn read_source(path: &Path) -> Result<String, Exit> {
    fs::read_to_string(path).map_err(|e| {
        eprintln!("error reading {}: {e}", path.display());
        Exit::IoError
    })
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, Exit> {
    fs::read(path).map_err(|e| {
        eprintln!("error reading {}: {e}", path.display());
        Exit::IoError
    })
}

fn cmd_asm(input: &Path, output: &Path) -> Result<(), Exit> {
    let source = read_source(input)?;
    let asm = assemble_or_report(&source)?;
    fs::write(output, &asm.bytes).map_err(|e| {
        eprintln!("error writing {}: {e}", output.display());
        Exit::IoError
    })?;
    println!("wrote {} bytes to {}", asm.bytes.len(), output.display());
    Ok(())
}

fn cmd_dis(input: &Path) -> Result<(), Exit> {
    let module = load_module_from_path(input)?;
    let text = vittelight::disassembler::disassemble(&module).map_err(|e| {
        eprintln!("disassembly error: {e}");
        Exit::LoadFailure
    })?;
    print!("{text}");
    Ok(())
}

fn cmd_run(input: &Path, trace_cats: &[String], max_steps: usize, print_stack: bool) -> Result<(), Exit> {
    let module = load_or_assemble(input)?;
    let mut ctx = Context::new();
    ctx.set_trace_mask(parse_trace_mask(trace_cats));
    natives::install_standard_natives(&mut ctx);
    ctx.attach(Rc::new(module));

    match ctx.run(max_steps) {
        Ok(Status::Done) => {
            if print_stack {
                eprintln!("final stack: {:?}", ctx.stack());
            }
            Ok(())
        }
        Ok(Status::StepBudgetExhausted) => {
            eprintln!("step budget of {max_steps} exhausted at ip={}", ctx.ip());
            Err(Exit::RuntimeFailure)
        }
        Ok(Status::Running) => unreachable!("run never returns Running"),
        Err(e) => {
            eprintln!("runtime error: {e}");
            Err(Exit::RuntimeFailure)
        }
    }
}

fn cmd_dump(input: &Path, hexdump: bool, strings: bool) -> Result<(), Exit> {
    let bytes = read_bytes(input)?;
    let module = Module::load(&bytes).map_err(|e| {
        eprintln!("load error: {e}");
        Exit::LoadFailure
    })?;

    println!("magic:        VLBC");
    println!("version:      {}", module.version);
    println!("string count: {}", module.string_count());
    println!("code size:    {} bytes", module.code_size());

    if strings {
        println!("\nstring pool:");
        for (i, s) in module.strings().iter().enumerate() {
            println!("  [{i}] {:?}", s.to_display());
        }
    }

    if hexdump {
        println!("\ncode bytes:");
        for (i, chunk) in module.code().chunks(16).enumerate() {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
            println!("  {:08X}: {}", i * 16, hex.join(" "));
        }
    }

    Ok(())
}

fn cmd_bench(input: &Path, iters: u64) -> Result<(), Exit> {
    let module = Rc::new(load_or_assemble(input)?);
    let mut ctx = Context::new().with_sink(Box::new(std::io::sink()));
    natives::install_standard_natives(&mut ctx);

    let start = Instant::now();
    for _ in 0..iters {
        ctx.attach(module.clone());
        ctx.run(0).map_err(|e| {
            eprintln!("runtime error during bench: {e}");
            Exit::RuntimeFailure
        })?;
    }
    let elapsed = start.elapsed();

    println!(
        "{iters} iterations in {elapsed:?} ({:?}/iter)",
        elapsed / u32::try_from(iters.max(1)).unwrap_or(u32::MAX)
    );
    Ok(())
}

/// One line of assembly at a time, sharing a single growing program: each
/// line is appended to the accumulated source and the whole thing is
/// reassembled, so the string pool's (and thus the globals') existing
/// prefix never changes. Only the newly appended tail is executed.
fn cmd_repl() -> Result<(), Exit> {
    use std::io::{stdin, BufRead};

    println!("vittelight repl — one line of assembly at a time, Ctrl-D to exit");

    let mut ctx = Context::new();
    natives::install_standard_natives(&mut ctx);

    let mut source_buf = String::new();
    let mut code_len_before = 0usize;

    for line in stdin().lock().lines() {
        let line = line.map_err(|e| {
            eprintln!("stdin error: {e}");
            Exit::IoError
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let old_globals: Vec<Value> = ctx.globals().to_vec();
        let candidate = format!("{source_buf}{line}\n");

        match assemble(&format!("{candidate}HALT\n")) {
            Ok(asm) => {
                source_buf = candidate;
                ctx.attach(Rc::new(asm.module));

                let mut globals = old_globals;
                globals.resize(ctx.globals().len(), Value::Nil);
                ctx.set_globals(globals);

                ctx.set_ip(code_len_before);
                match ctx.run(0) {
                    Ok(Status::Done) => {
                        code_len_before = ctx.module().map(|m| m.code_size()).unwrap_or(0) - 1;
                    }
                    Ok(_) => {}
                    Err(e) => eprintln!("runtime error: {e}"),
                }
            }
            Err(e) => eprintln!("assemble error: {e}"),
        }
    }
    Ok(())
}

fn load_or_assemble(path: &Path) -> Result<Module, Exit> {
    if path.extension().and_then(|e| e.to_str()) == Some("vlbc") {
        load_module_from_path(path)
    } else {
        let source = read_source(path)?;
        Ok(assemble_or_report(&source)?.module)
    }
}

fn load_module_from_path(path: &Path) -> Result<Module, Exit> {
    let bytes = read_bytes(path)?;
    Module::load(&bytes).map_err(|e: LoadError| {
        eprintln!("load error: {e}");
        Exit::LoadFailure
    })
}

fn assemble_or_report(source: &str) -> Result<vittelight::Assembled, Exit> {
    assemble(source).map_err(|e: AssembleError| {
        eprintln!("assemble error: {e}");
        Exit::AssembleFailure
    })
}

fn parse_trace_mask(cats: &[String]) -> u8 {
    let mut mask = trace::NONE;
    for cat in cats {
        mask |= match cat.as_str() {
            "op" => trace::OP,
            "stack" => trace::STACK,
            "global" => trace::GLOBAL,
            "call" => trace::CALL,
            "all" => trace::ALL,
            _ => trace::NONE,
        };
    }
    mask
}
