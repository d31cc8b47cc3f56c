//! cvp-ctl: submit a file to cvpd for inspection.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::TcpStream;

use cvp_core::config::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT};
use cvp_core::verdict::Action;
use cvp_core::RequestParams;
use cvp_services::submit_content;

fn print_usage() {
    println!("Usage: cvp-ctl [options] <file>");
    println!();
    println!("Options:");
    println!("  --addr <host:port>     Daemon address (default: 127.0.0.1:{DEFAULT_PORT})");
    println!("  --action <ro|rw|none>  What the daemon may do with the content (default: ro)");
    println!("  --out <path>           Write the returned content here");
}

fn parse_action(value: &str) -> Result<Action> {
    match value {
        "ro" => Ok(Action::ReadOnly),
        "rw" => Ok(Action::ReadWrite),
        "none" => Ok(Action::None),
        other => bail!("unknown action '{other}', expected ro, rw or none"),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut addr = format!("127.0.0.1:{DEFAULT_PORT}");
    let mut action = Action::ReadOnly;
    let mut out: Option<PathBuf> = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" => {
                i += 1;
                addr = args.get(i).context("--addr requires a value")?.clone();
            }
            "--action" => {
                i += 1;
                action = parse_action(args.get(i).context("--action requires a value")?)?;
            }
            "--out" => {
                i += 1;
                out = Some(args.get(i).context("--out requires a path")?.into());
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let file = match remaining.as_slice() {
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            return Ok(());
        }
        [file] => PathBuf::from(*file),
        other => {
            eprintln!("Unexpected arguments: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    let content = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let request = RequestParams {
        filename: file.file_name().map(|n| n.to_string_lossy().into_owned()),
        action,
        ..Default::default()
    };

    let mut stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to cvpd at {addr}, is it running?"))?;
    let (verdict, returned) = submit_content(
        &mut stream,
        request,
        Bytes::from(content),
        DEFAULT_CHUNK_SIZE,
    )
    .await
    .context("inspection failed")?;

    println!("Verdict:     {:?} (flags {:#04x})", verdict.opinion, verdict.flags());
    println!("Explanation: {}", verdict.explanation);
    println!("Warning:     {}", verdict.warning);
    println!("Returned:    {} bytes", returned.len());

    if let Some(path) = out {
        tokio::fs::write(&path, &returned)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Saved to:    {}", path.display());
    }
    Ok(())
}
