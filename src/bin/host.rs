//! Hearth chat host.
//!
//! Runs the broker and gives the operator a console: plain lines are
//! broadcast to every client, `@<id> <text>` goes to one client, `/quit`
//! shuts the chat down.
//!
//! # Usage
//!
//! ```sh
//! hearth-host
//! ```
//!
//! Clients connect by pid; the host prints its own at startup.

use std::io::BufRead;
use std::sync::Arc;

use hearth::console::{parse_line, Command, StdioConsole};
use hearth::host::{ChatHost, HostError};

fn main() {
    hearth::init_tracing();
    if let Err(e) = run() {
        eprintln!("hearth-host: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), HostError> {
    let args: Vec<String> = std::env::args().collect();
    for arg in &args[1..] {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                eprintln!("hearth-host: unknown argument: {other}");
                print_usage();
                std::process::exit(2);
            }
        }
    }

    let host = ChatHost::start(Arc::new(StdioConsole))?;
    eprintln!("hearth-host: ready, pid {}", host.pid());

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match parse_line(&line) {
            Some(Command::Broadcast(text)) => host.send_broadcast(&text),
            Some(Command::Private { to, text }) => host.send_private(to, &text),
            Some(Command::Quit) => break,
            None => {}
        }
    }

    eprintln!("hearth-host: shutting down");
    host.shutdown();
    Ok(())
}

fn print_usage() {
    eprintln!(
        r#"hearth-host - local chat broker

USAGE:
    hearth-host

CONSOLE:
    <text>        broadcast to every client
    @<id> <text>  private message to one client
    /quit         shut the chat down

Clients join with: hearth-client --host <pid>
"#
    );
}
