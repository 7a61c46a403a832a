use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chdv_core::{Chd, PipelineConfig};

#[derive(Parser)]
#[command(
    name = "chdv",
    version,
    about = "CHD disk-image verifier",
    long_about = "Verify the integrity of CHD images: per-block checksums \
                  and whole-image digests, decoded on a worker pipeline."
)]
struct Cli {
    /// Files to verify, or directories to scan recursively for *.chd.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Number of decode worker threads (defaults to CPU count).
    #[arg(long, default_value_t = num_cpus::get())]
    workers: usize,

    /// Print recorded and computed digests for each file.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(2);
        }
    }
}

fn run() -> anyhow::Result<bool> {
    let cli = Cli::parse();
    let config = PipelineConfig::with_workers(cli.workers);

    let mut files = Vec::new();
    for path in &cli.paths {
        collect(path, &mut files)
            .with_context(|| format!("scanning {}", path.display()))?;
    }
    if files.is_empty() {
        anyhow::bail!("no .chd files found");
    }

    let mut all_ok = true;
    for file in &files {
        all_ok &= verify_one(file, &config, cli.verbose);
    }
    Ok(all_ok)
}

/// Gathers `path` itself if it is a file, or every `.chd` under it.
fn collect(path: &Path, files: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let meta = fs::metadata(path)?;
    if meta.is_file() {
        files.push(path.to_path_buf());
        return Ok(());
    }
    let mut entries: Vec<_> = fs::read_dir(path)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            collect(&entry_path, files)?;
        } else if entry_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("chd"))
        {
            files.push(entry_path);
        }
    }
    Ok(())
}

fn verify_one(path: &Path, config: &PipelineConfig, verbose: bool) -> bool {
    let started = Instant::now();
    let result = File::open(path)
        .map_err(chdv_core::ChdError::from)
        .and_then(|file| Chd::open(BufReader::new(file)))
        .and_then(|mut chd| chd.verify_with(config));
    match result {
        Ok(report) => {
            let elapsed = started.elapsed();
            println!(
                "PASS {} ({} blocks, {} bytes, {:.1?})",
                path.display(),
                report.blocks,
                report.bytes,
                elapsed
            );
            if verbose {
                if let Some(md5) = report.md5 {
                    println!("     md5  {}", hex(&md5));
                }
                if let Some(sha1) = report.sha1 {
                    println!("     sha1 {}", hex(&sha1));
                }
            }
            true
        }
        Err(error) => {
            println!("FAIL {}: {error}", path.display());
            false
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
