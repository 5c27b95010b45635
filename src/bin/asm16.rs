// Command-line front of the assembler. Exit codes matter to build scripts:
// 0 on success, 1 for invocation or I/O problems, 2 when the source had
// errors and nothing was written.

use clap::Parser;
use em16::assembler;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "asm16", about = "Assembler for the em16 virtual machine")]
struct Args {
    /// Assembly source file
    input: PathBuf,
    /// Binary image to write
    output: PathBuf,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            process::exit(code);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    process::exit(run(&args));
}

fn run(args: &Args) -> i32 {
    let source = match fs::read_to_string(&args.input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot open {}: {err}", args.input.display());
            return 1;
        }
    };
    match assembler::assemble(&source) {
        Ok(image) => {
            if let Err(err) = image.write_to(&args.output) {
                eprintln!("cannot write {}: {err}", args.output.display());
                return 1;
            }
            println!(
                "compiled {} word(s) to {} (org={:#06x}, data_end={:#06x})",
                image.code.len(),
                args.output.display(),
                image.org,
                image.data_end,
            );
            0
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("error: {error}");
            }
            eprintln!("compilation failed, no output written");
            2
        }
    }
}
