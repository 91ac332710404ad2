//! Thin interactive client: reads a command per line from stdin, frames it
//! to the server, and prints back whatever frames come in reply. Grounded
//! on `original_source/robin/src/robin_client.c`'s role (argument parsing,
//! connect, a read/print loop) — not its code, which is a synchronous,
//! newline-protocol CLI this crate's wire format has moved past.

use std::io::{self, Write};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use cips::frame;

#[derive(Parser, Debug)]
#[command(name = "cips-client", about = "Interactive client for the cips server")]
struct Args {
    /// Remote hostname to connect to.
    host: String,

    /// Remote port to connect to.
    port: u16,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let addr = format!("{}:{}", args.host, args.port);
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to connect to {addr}: {e}");
            std::process::exit(1);
        }
    };

    println!("connected to {addr}. Type `help` for a list of commands.");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("cips> ");
        let _ = io::stdout().flush();

        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break, // stdin closed
            Err(e) => {
                eprintln!("stdin error: {e}");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        if let Err(e) = frame::send(&mut stream, line.as_bytes()).await {
            eprintln!("send failed: {e}");
            break;
        }

        if let Err(e) = print_reply(&mut stream).await {
            eprintln!("connection closed: {e}");
            break;
        }

        if line.trim() == "quit" {
            break;
        }
    }
}

/// Reads and prints the reply to one command: a header frame whose leading
/// signed integer is either an error code (negative, no further frames) or
/// a count of additional data frames to read.
async fn print_reply(stream: &mut TcpStream) -> Result<(), cips::errors::Error> {
    let Some(header) = frame::recv(stream, frame::DEFAULT_MAX_FRAME_LEN).await? else {
        return Err(cips::errors::Error::Protocol("server closed the connection".into()));
    };
    let header = String::from_utf8_lossy(&header).into_owned();
    println!("{header}");

    let count: i64 = header
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(-1);

    if count <= 0 {
        return Ok(());
    }

    for _ in 0..count {
        match frame::recv(stream, frame::DEFAULT_MAX_FRAME_LEN).await? {
            Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
            None => break,
        }
    }

    Ok(())
}
