//! # CLI - verified image shell
//!
//! A REPL over a file-backed, hash-tree verified image. Reads commands from
//! stdin, runs them against the image and prints results to stdout. Works
//! both interactively and scripted (pipe commands via stdin). Logs go to
//! stderr.
//!
//! ## Commands
//!
//! ```text
//! FORMAT size_kib [layers] [block]  Create a zeroed image (default 5 layers, 16 KiB blocks)
//! INFO                              Print the image's layout
//! READ offset len                   Print bytes (non-printable as '.')
//! HEX offset len                    Print bytes as hex
//! WRITE offset text                 Write text at offset
//! COMMIT                            Write every level back, data first
//! ROLLBACK                          Discard uncommitted writes
//! CORRUPT offset                    Flip a data byte on disk and reload
//! STATS                             Print buffer pool statistics
//! EXIT / QUIT                       Leave (uncommitted writes are lost)
//! ```
//!
//! ## Configuration
//!
//! ```text
//! VERICACHE_IMAGE   image file path   (default: "image.ivfc")
//! RUST_LOG          log filter        (default: "warn")
//! ```
//!
//! Pool, cache and concurrency settings come from the `VERICACHE_*`
//! variables read by the `config` crate.
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! no image at image.ivfc; use FORMAT
//! > FORMAT 1024
//! OK (1048576 bytes, 5 layers)
//! > WRITE 0 hello
//! OK
//! > COMMIT
//! OK
//! > READ 0 5
//! hello
//! > EXIT
//! bye
//! ```

mod image;

use anyhow::{anyhow, Result};
use config::Config;
use image::Image;
use integrity::INTEGRITY_LAYER_COUNT_SAVE;
use std::io::{self, BufRead, Write};
use storage::Storage;
use tracing_subscriber::EnvFilter;

const DEFAULT_BLOCK_SIZE: usize = 0x4000;

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse<T: std::str::FromStr>(arg: Option<&str>, usage: &str) -> Result<T> {
    arg.and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("usage: {usage}"))
}

fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn require(image: &Option<Image>) -> Result<&Image> {
    image.as_ref().ok_or_else(|| anyhow!("no image; use FORMAT"))
}

/// Runs one command line, returning what to print.
fn execute(cmd: &str, mut args: std::str::SplitWhitespace<'_>, image: &mut Option<Image>, config: &Config, path: &str) -> Result<String> {
    match cmd {
        "FORMAT" => {
            let usage = "FORMAT size_kib [layers] [block]";
            let size_kib: i64 = parse(args.next(), usage)?;
            let layers = args.next().map_or(Ok(INTEGRITY_LAYER_COUNT_SAVE), |s| parse(Some(s), usage))?;
            let block = args.next().map_or(Ok(DEFAULT_BLOCK_SIZE), |s| parse(Some(s), usage))?;

            // Drop the old tree before its file is truncated.
            *image = None;
            let formatted = Image::format(path, size_kib * 1024, layers, block, config)?;
            let out = format!("OK ({} bytes, {} layers)", formatted.data_size(), layers);
            *image = Some(formatted);
            Ok(out)
        }
        "INFO" => {
            let image = require(image)?;
            let info = &image.meta().level_hash_info;
            let mut out = format!(
                "path={} layers={} master_hash={} data={}",
                image.path().display(),
                info.max_layers,
                image.meta().master_hash_size,
                image.data_size()
            );
            for (i, level) in info.levels().iter().enumerate() {
                out.push_str(&format!(
                    "\nL{} offset={} size={} block={}",
                    i + 1,
                    level.offset,
                    level.size,
                    level.block_size()
                ));
            }
            Ok(out)
        }
        "READ" | "HEX" => {
            let image = require(image)?;
            let usage = "READ|HEX offset len";
            let offset: i64 = parse(args.next(), usage)?;
            let len: usize = parse(args.next(), usage)?;
            let mut buf = vec![0u8; len];
            image.tree().read(offset, &mut buf)?;
            Ok(if cmd == "HEX" { hex(&buf) } else { printable(&buf) })
        }
        "WRITE" => {
            let image = require(image)?;
            let offset: i64 = parse(args.next(), "WRITE offset text")?;
            let text = args.collect::<Vec<&str>>().join(" ");
            if text.is_empty() {
                return Err(anyhow!("usage: WRITE offset text"));
            }
            image.tree().write(offset, text.as_bytes())?;
            Ok("OK".to_string())
        }
        "COMMIT" => {
            require(image)?.commit()?;
            Ok("OK".to_string())
        }
        "ROLLBACK" => {
            require(image)?.tree().on_rollback()?;
            Ok("OK".to_string())
        }
        "CORRUPT" => {
            let offset: i64 = parse(args.next(), "CORRUPT offset")?;
            let image = image.as_mut().ok_or_else(|| anyhow!("no image; use FORMAT"))?;
            image.corrupt(offset)?;
            Ok("OK".to_string())
        }
        "STATS" => {
            let image = require(image)?;
            let m = image.manager();
            m.dump();
            let tree = image.tree();
            let mut levels = String::new();
            for level in 0..tree.level_count() {
                let cache = tree.level_storage(level);
                levels.push_str(&format!(
                    "\nL{} cached={} dirty={}",
                    level + 1,
                    cache.cached_entry_count(),
                    cache.dirty_entry_count()
                ));
            }
            Ok(format!(
                "pool total={} free={} allocatable={} peak_free={} peak_allocatable={} retried={} cached={}\n{:?}",
                m.total_size(),
                m.free_size(),
                m.total_allocatable_size(),
                m.peak_free_size(),
                m.peak_total_allocatable_size(),
                m.retried_count(),
                m.cached_count(),
                tree
            ) + &levels)
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let path = env_or("VERICACHE_IMAGE", "image.ivfc");
    let config = Config::from_env();

    let mut image = if std::path::Path::new(&path).exists() {
        match Image::open(&path, &config) {
            Ok(image) => {
                println!("opened {} ({} bytes)", path, image.data_size());
                Some(image)
            }
            Err(e) => {
                println!("ERR open failed: {e:#}");
                None
            }
        }
    } else {
        println!("no image at {path}; use FORMAT");
        None
    };
    println!("Commands: FORMAT size_kib [layers] [block] | INFO | READ off len | HEX off len");
    println!("          WRITE off text | COMMIT | ROLLBACK | CORRUPT off | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            let cmd = cmd.to_uppercase();
            if cmd == "EXIT" || cmd == "QUIT" {
                println!("bye");
                break;
            }
            match execute(&cmd, parts, &mut image, &config, &path) {
                Ok(out) => println!("{out}"),
                Err(e) => println!("ERR {e:#}"),
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    Ok(())
}
