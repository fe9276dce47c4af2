//! Hammer one store from several OS processes at once.
//!
//! `concurrency spawn --dir ./tmp --workers 8` starts eight copies of this
//! binary as `worker` processes and waits for them; add `--race` to have
//! every process race `store_if_absent` on a single key instead.
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use kvshelf::{Error, Store, StoreConfig};

#[derive(Parser)]
#[command(about = "multi-process stress driver for kvshelf stores")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Start `workers` processes and wait for all of them
    Spawn {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = 4)]
        workers: u32,
        #[arg(long, default_value_t = 1000)]
        entries: u64,
        /// Race on one key instead of running the set/get/delete workload
        #[arg(long)]
        race: bool,
    },
    /// Set, read back and delete `entries` keys, then fill a write-once store
    Worker {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        rank: u32,
        #[arg(long)]
        entries: u64,
    },
    /// Try to be the one process that stores the answer
    Race {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        rank: u32,
    },
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    match Cli::parse().command {
        Cmd::Spawn {
            dir,
            workers,
            entries,
            race,
        } => spawn(&dir, workers, entries, race),
        Cmd::Worker { dir, rank, entries } => worker(&dir, rank, entries),
        Cmd::Race { dir, rank } => race(&dir, rank),
    }
}

fn spawn(dir: &Path, workers: u32, entries: u64, race: bool) -> Result<()> {
    let exe = std::env::current_exe().context("can't locate own executable")?;
    let children = (0..workers)
        .map(|rank| {
            let mut cmd = Command::new(&exe);
            if race {
                cmd.arg("race");
            } else {
                cmd.arg("worker").arg("--entries").arg(entries.to_string());
            }
            cmd.arg("--dir")
                .arg(dir)
                .arg("--rank")
                .arg(rank.to_string())
                .stdout(Stdio::piped())
                .spawn()
                .with_context(|| format!("can't start rank {}", rank))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut winners = 0;
    for (rank, child) in children.into_iter().enumerate() {
        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        print!("{}", stdout);
        if !output.status.success() {
            bail!("rank {} failed with {}", rank, output.status);
        }
        winners += stdout.lines().filter(|l| l.ends_with(" won")).count();
    }
    if race {
        println!("winners={}", winners);
    }
    Ok(())
}

fn worker(dir: &Path, rank: u32, entries: u64) -> Result<()> {
    let kv: Store<u64, u64> = Store::open_in(dir, "skv", StoreConfig::default())?;
    let mut sum = 0;
    let start = Instant::now();
    for i in 0..entries {
        if i % 1000 == 0 {
            info!("rank={} i={}", rank, i);
        }
        patiently(rank, || kv.set(&i, &i))?;
        // another rank may have deleted the entry in between
        match kv.get(&i) {
            Ok(v) => sum += v,
            Err(Error::KeyNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        match kv.delete(&i) {
            Ok(()) | Err(Error::KeyNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    println!(
        "rank={} kv entries={} elapsed={:?} sum={}",
        rank,
        entries,
        start.elapsed(),
        sum
    );

    let once: Store<u64, u64> = Store::open_in(dir, "skv_writeonce", StoreConfig::write_once())?;
    info!("rank={} opened {:?} in {:?} mode", rank, once.path(), once.mode());
    let mut sum = 0;
    let start = Instant::now();
    for i in 0..entries {
        match patiently(rank, || once.set(&i, &i)) {
            Ok(()) | Err(Error::EntryExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        sum += once.get(&i)?;
    }
    println!(
        "rank={} write-once entries={} elapsed={:?} sum={}",
        rank,
        entries,
        start.elapsed(),
        sum
    );
    Ok(())
}

/// Run `op` again for as long as other processes keep the store locked past
/// the retry policy.
fn patiently<T>(rank: u32, mut op: impl FnMut() -> kvshelf::Result<T>) -> kvshelf::Result<T> {
    loop {
        match op() {
            Err(e) if e.is_contention() => warn!("rank={} {}, trying again", rank, e),
            other => return other,
        }
    }
}

fn race(dir: &Path, rank: u32) -> Result<()> {
    let store: Store<String, u32> = Store::open_in(dir, "race", StoreConfig::default())?;
    let key = "answer".to_owned();
    let won = store.store_if_absent(&key, &rank)?;
    let stored = store.get(&key)?;
    if won && stored != rank {
        bail!("rank {} won but the store holds {}", rank, stored);
    }
    println!("rank={} {}", rank, if won { "won" } else { "lost" });
    Ok(())
}
