//! Konsolen-Frontend
//!
//! Liest Befehle von stdin und gibt `CallEvent`s aus.

use crate::call_engine::{CallEngine, CallEvent, CallState};
use crate::signaling::Peer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const HELP: &str = "\
Commands:
  list              show reachable peers
  call <id-prefix>  call a peer
  accept            accept the incoming call
  reject            reject the incoming call
  hangup            end the current call
  status            show the call state
  quit              exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Call(String),
    Accept,
    Reject,
    Hangup,
    Status,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Ok(None);
        };
        let command = match verb.to_ascii_lowercase().as_str() {
            "list" | "ls" => Command::List,
            "call" => match parts.next() {
                Some(target) => Command::Call(target.to_string()),
                None => return Err("usage: call <id-prefix>".to_string()),
            },
            "accept" | "a" => Command::Accept,
            "reject" | "r" => Command::Reject,
            "hangup" | "h" => Command::Hangup,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            other => return Err(format!("unknown command: {} (try `help`)", other)),
        };
        Ok(Some(command))
    }
}

/// Sucht einen Peer über ein eindeutiges ID-Präfix
pub fn resolve_peer<'a>(roster: &'a [Peer], prefix: &str) -> Result<&'a Peer, String> {
    if let Some(peer) = roster.iter().find(|p| p.id.as_str() == prefix) {
        return Ok(peer);
    }
    let matches: Vec<&Peer> = roster
        .iter()
        .filter(|p| p.id.as_str().starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [peer] => Ok(*peer),
        [] => Err(format!("no peer matches {}", prefix)),
        _ => Err(format!("{} matches {} peers", prefix, matches.len())),
    }
}

/// Liest Befehle bis `quit` oder EOF
pub async fn run_console(engine: CallEngine) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };

        let result = match command {
            Command::List => {
                let roster = engine.roster();
                if roster.is_empty() {
                    println!("No peers online");
                }
                for peer in roster {
                    println!("  {}  {}", peer.id, peer.name);
                }
                Ok(())
            }
            Command::Call(prefix) => match resolve_peer(&engine.roster(), &prefix) {
                Ok(peer) => engine.call(peer.id.clone()).await,
                Err(message) => {
                    println!("{}", message);
                    Ok(())
                }
            },
            Command::Accept => engine.accept_incoming().await,
            Command::Reject => engine.reject_incoming().await,
            Command::Hangup => engine.hangup().await,
            Command::Status => {
                let status = engine.status();
                match status.peer {
                    Some(peer) => println!("{} with {} since {}", status.state, peer.name, status.since),
                    None => println!("{} since {}", status.state, status.since),
                }
                Ok(())
            }
            Command::Help => {
                println!("{}", HELP);
                Ok(())
            }
            Command::Quit => break,
        };

        if let Err(e) = result {
            println!("Error: {}", e);
        }
    }

    engine.hangup().await?;
    Ok(())
}

/// Gibt Call-Events aus, bis die Engine stoppt
pub async fn print_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Skipped {} call events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            CallEvent::RosterChanged(peers) => println!("{} peer(s) online", peers.len()),
            CallEvent::IncomingCall(peer) => {
                println!("Incoming call from {} ({}), `accept` or `reject`", peer.name, peer.id.short())
            }
            CallEvent::StateChanged {
                state: CallState::Idle,
                ..
            } => {}
            CallEvent::StateChanged { state, peer_name } => match peer_name {
                Some(name) => println!("[{}] {}", state, name),
                None => println!("[{}]", state),
            },
            CallEvent::Ended { peer, reason } => println!("Call with {} ended: {}", peer.name, reason),
            CallEvent::AudioLevel { direction, level } => {
                tracing::trace!("Audio level {:?}: {:.1}", direction, level);
            }
        }
    }
}
