mod apply;
mod bps;
mod ips;
mod patch_format;
mod stream;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser};

use crate::patch_format::{PatchCommand, PatchStatus};

/// Poll cadence for the progress observer.
const POLL_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[command(name = "rombp", about = "IPS and BPS ROM patcher")]
struct Cli {
    /// Input ROM file
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: Option<PathBuf>,
    /// IPS or BPS patch file
    #[arg(short = 'p', long = "patch", value_name = "FILE")]
    patch: Option<PathBuf>,
    /// Patched output file
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let command = match (cli.input, cli.patch, cli.output) {
        (Some(input_file), Some(patch_file), Some(output_file)) => PatchCommand {
            input_file,
            patch_file,
            output_file,
        },
        (None, None, None) => {
            // Running with no arguments launched the menu UI in the
            // original program; this build ships the patch engine only.
            Cli::command().print_help()?;
            std::process::exit(2);
        }
        _ => anyhow::bail!("-i, -p, and -o must be given together; see --help"),
    };

    println!("Applying patch...");
    println!("  Input: {}", command.input_file.display());
    println!("  Patch: {}", command.patch_file.display());
    println!("  Output: {}", command.output_file.display());

    let start = Instant::now();
    let status = Arc::new(Mutex::new(PatchStatus::default()));
    let worker = apply::spawn_patch_worker(command, Arc::clone(&status));

    let mut last_hunk_count = 0;
    loop {
        thread::sleep(POLL_INTERVAL);
        let snapshot = status.lock().expect("patch status lock poisoned").clone();
        if snapshot.hunk_count != last_hunk_count {
            log::info!("patching, wrote {} hunks", snapshot.hunk_count);
            last_hunk_count = snapshot.hunk_count;
        }
        if snapshot.is_done {
            break;
        }
    }

    let hunk_count = worker
        .join()
        .map_err(|_| anyhow::anyhow!("patch worker panicked"))??;
    let elapsed = start.elapsed();

    println!("\nPatch applied successfully!");
    println!("  Hunks written: {hunk_count}");
    println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

    Ok(())
}
