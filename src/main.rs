// # RepliDB Driver
//
// Binary entry point for the simulator. Feeds script lines from standard
// input or from interactively chosen files into a `TransactionManager` and
// prints its protocol trace.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};

use clap::Parser;
use tracing::info;

use replidb::{SimConfig, TransactionManager};

/// Replicated database simulator.
#[derive(Debug, Parser)]
#[command(name = "replidb", version, about)]
struct Args {
    /// Read script paths interactively and execute each file.
    #[arg(long, conflicts_with = "std")]
    file: bool,

    /// Read commands from standard input; `exit` terminates.
    #[arg(long)]
    std: bool,
}

fn main() -> replidb::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut manager = TransactionManager::new(SimConfig::default());
    info!(version = replidb::VERSION, "replidb starting");

    if args.file {
        run_files(&mut manager)?;
    } else {
        run_stdin(&mut manager)?;
    }
    println!("bye");
    Ok(())
}

/// Prompt-for-path loop: run a script file, then offer to run another.
fn run_files(manager: &mut TransactionManager) -> replidb::Result<()> {
    let stdin = io::stdin();
    loop {
        let Some(path) = prompt(&stdin, "script path> ")? else {
            break;
        };
        if path.is_empty() {
            continue;
        }
        info!(%path, "running script");
        let file = File::open(&path)?;
        for line in BufReader::new(file).lines() {
            feed_line(manager, &line?)?;
        }
        match prompt(&stdin, "continue with another file [y/n]? ")? {
            Some(answer) if !answer.to_lowercase().starts_with('n') => continue,
            _ => break,
        }
    }
    Ok(())
}

/// Standard-input loop; the literal command `exit` terminates.
fn run_stdin(manager: &mut TransactionManager) -> replidb::Result<()> {
    println!("reading commands from standard input; 'exit' quits");
    let stdin = io::stdin();
    loop {
        let Some(line) = prompt(&stdin, "> ")? else {
            break;
        };
        if line == "exit" {
            break;
        }
        feed_line(manager, &line)?;
    }
    Ok(())
}

/// Runs one line and prints whatever trace it produced.
fn feed_line(manager: &mut TransactionManager, line: &str) -> replidb::Result<()> {
    manager.process_line(line)?;
    for emitted in manager.take_trace() {
        println!("{emitted}");
    }
    Ok(())
}

/// Prints `message` and reads one trimmed line; `None` at end of input.
fn prompt(stdin: &io::Stdin, message: &str) -> io::Result<Option<String>> {
    print!("{message}");
    io::stdout().flush()?;
    let mut buf = String::new();
    if stdin.lock().read_line(&mut buf)? == 0 {
        return Ok(None);
    }
    Ok(Some(buf.trim().to_string()))
}
