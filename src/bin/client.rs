//! Hearth chat client.
//!
//! Joins the chat hosted by the process at `--host <pid>`, over the
//! transport picked with `--transport`. Plain input lines are broadcast,
//! `@<id> <text>` goes to one peer, `/quit` leaves.
//!
//! # Usage
//!
//! ```sh
//! hearth-client --host 12345 --transport socket
//! ```

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use hearth::client::ClientSession;
use hearth::conn::Kind;
use hearth::console::{parse_line, Command, StdioConsole};

struct Config {
    host_pid: libc::pid_t,
    kind: Kind,
}

fn main() {
    hearth::init_tracing();
    let args: Vec<String> = std::env::args().collect();
    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("hearth-client: {msg}");
            print_usage();
            std::process::exit(2);
        }
    };

    let session = match ClientSession::connect(config.host_pid, config.kind, Arc::new(StdioConsole))
    {
        Ok(session) => Arc::new(session),
        Err(e) => {
            eprintln!("hearth-client: {e}");
            std::process::exit(1);
        }
    };

    // Stdin blocks below, so session death (host shutdown, kill, timeout)
    // ends the process from here.
    {
        let session = Arc::clone(&session);
        std::thread::Builder::new()
            .name("session-watch".into())
            .spawn(move || loop {
                if session.is_terminated() {
                    std::process::exit(0);
                }
                std::thread::sleep(Duration::from_millis(50));
            })
            .expect("spawning session watcher");
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match parse_line(&line) {
            Some(Command::Broadcast(text)) => session.send_broadcast(&text),
            Some(Command::Private { to, text }) => session.send_private(to, &text),
            Some(Command::Quit) => break,
            None => {}
        }
    }

    session.leave();
}

fn parse_args(args: &[String]) -> Result<Config, String> {
    let mut host_pid: Option<libc::pid_t> = None;
    let mut kind = Kind::Fifo;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-H" => {
                i += 1;
                let value = args.get(i).ok_or("missing value for --host")?;
                host_pid = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid pid: {value}"))?,
                );
            }
            "--transport" | "-t" => {
                i += 1;
                let value = args.get(i).ok_or("missing value for --transport")?;
                kind = match value.as_str() {
                    "fifo" | "pipe" => Kind::Fifo,
                    "mq" | "queue" => Kind::Queue,
                    "socket" => Kind::Socket,
                    other => return Err(format!("unknown transport: {other}")),
                };
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    let host_pid = host_pid.ok_or("--host is required")?;
    Ok(Config { host_pid, kind })
}

fn print_usage() {
    eprintln!(
        r#"hearth-client - join a local hearth chat

USAGE:
    hearth-client --host <PID> [OPTIONS]

OPTIONS:
    -H, --host <PID>         Pid of the running hearth-host (required)
    -t, --transport <KIND>   fifo | mq | socket (default: fifo)
    -h, --help               Print this help message

CONSOLE:
    <text>        broadcast to everyone
    @<id> <text>  private message to one peer
    /quit         leave the chat
"#
    );
}
