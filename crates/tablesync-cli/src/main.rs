//! tablesync CLI
//!
//! Host or join a shared tabletop session over iroh and talk in its chat.
//!
//! ## Usage
//!
//! ```bash
//! # Host a session under a stable name (prints the session id)
//! tablesync host --name room-1
//!
//! # Join it from another machine, by name or by endpoint id
//! tablesync join room-1 --profile Aria
//!
//! # Print the endpoint id a name resolves to
//! tablesync id room-1
//! ```
//!
//! Inside a session, plain lines are chat. Commands start with `/`:
//!
//! ```text
//! /accept [n]          approve the n-th pending join (host)
//! /reject <reason>     decline the oldest pending join (host)
//! /move <id> <x> <y>   place or move a token
//! /note <title>        pin a note
//! /roll <text>         ephemeral broadcast, never stored
//! /turn                advance the turn (host)
//! /peers /tokens       show state
//! /quit
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use iroh::EndpointId;
use tablesync_core::transport::quic::derive_secret_key;
use tablesync_core::{
    ChatMessage, ControlAction, DocOp, IrohTransport, ItemId, Note, PeerId, Region, Session,
    SessionConfig, SessionEvent, TokenRecord,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;

/// tablesync - peer-to-peer tabletop sessions
#[derive(Parser)]
#[command(name = "tablesync")]
#[command(version = "0.1.0")]
#[command(about = "tablesync - peer-to-peer tabletop sessions")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Session config as JSON (default: built-in timings)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a new session
    Host {
        /// Stable session name; the same name always gives the same id
        #[arg(short, long)]
        name: Option<String>,

        /// Name shown next to your chat lines
        #[arg(short, long, default_value = "Host")]
        display: String,

        /// Approve every join request without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Join a hosted session
    Join {
        /// Host session name or endpoint id
        host: String,

        /// Profile sent with the join request and shown in chat
        #[arg(short, long)]
        profile: String,

        /// Stable name for this process (random when omitted)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print the endpoint id a session name resolves to
    Id {
        /// Session name
        name: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(SessionConfig::default()),
    }
}

/// Endpoint id for a host argument: either an id already, or a session name
fn resolve_host(host: &str) -> PeerId {
    match EndpointId::from_str(host) {
        Ok(id) => PeerId::new(id.to_string()),
        Err(_) => PeerId::new(derive_secret_key(host).public().to_string()),
    }
}

/// Interactive state shared by host and client sessions
struct Console {
    session: Session,
    display: String,
    seen: HashSet<ItemId>,
}

impl Console {
    fn new(session: Session, display: String) -> Self {
        Self {
            session,
            display,
            seen: HashSet::new(),
        }
    }

    fn say(&mut self, text: &str) -> Result<()> {
        let message = ChatMessage::new(self.session.local_id().clone(), &self.display, text);
        self.seen.insert(message.id);
        self.session.mutate(DocOp::AppendMessage(message))?;
        Ok(())
    }

    /// Print chat lines that arrived from elsewhere
    fn print_new_messages(&mut self) -> Result<()> {
        for message in self.session.document().messages()? {
            if self.seen.insert(message.id) {
                println!("<{}> {}", message.display_name, message.text);
            }
        }
        Ok(())
    }

    fn print_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::PeerConnected { peer, role } => {
                println!("* {} connected ({})", peer.short(), role)
            }
            SessionEvent::PeerDisconnected { peer } => println!("* {} disconnected", peer.short()),
            SessionEvent::ConnectionRequest { peer, profile, .. } => {
                println!(
                    "* {} asks to join as {:?} (/accept or /reject <reason>)",
                    peer.short(),
                    String::from_utf8_lossy(profile)
                )
            }
            SessionEvent::PeerStatusChanged { peer, status } => {
                println!("* {} is {}", peer.short(), status)
            }
            SessionEvent::PeerAnnounced { peer, profile } => {
                println!(
                    "* {} is at the table as {}",
                    peer.short(),
                    String::from_utf8_lossy(profile)
                )
            }
            SessionEvent::PeerLeft { peer } => println!("* {} left the table", peer.short()),
            SessionEvent::Ephemeral {
                from,
                subtype,
                data,
            } => println!(
                "~ {} [{}] {}",
                from.short(),
                subtype,
                String::from_utf8_lossy(data)
            ),
            SessionEvent::Control { from, action } => {
                println!("! {} {:?}", from.short(), action)
            }
            SessionEvent::Directed {
                from,
                subtype,
                data,
            } => println!(
                "> {} whispers [{}] {}",
                from.short(),
                subtype,
                String::from_utf8_lossy(data)
            ),
            SessionEvent::LocalLinkChanged(link) => println!("* rendezvous {}", link),
        }
    }

    /// Run one input line; returns false when the user asked to quit
    fn handle_line(&mut self, line: &str) -> Result<bool> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(true);
        }
        if !line.starts_with('/') {
            self.say(line)?;
            return Ok(true);
        }

        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default().trim();
        match command {
            "/quit" | "/exit" => return Ok(false),
            "/accept" => {
                let pending = self.session.pending_requests();
                let index = if rest.is_empty() {
                    0
                } else {
                    rest.parse::<usize>().context("usage: /accept [n]")?
                };
                let Some((request, peer)) = pending.get(index) else {
                    println!("No pending join request #{}", index);
                    return Ok(true);
                };
                self.session.accept_join(*request)?;
                println!("Accepted {}", peer.short());
            }
            "/reject" => {
                let Some((request, peer)) = self.session.pending_requests().into_iter().next()
                else {
                    println!("No pending join requests");
                    return Ok(true);
                };
                let reason = if rest.is_empty() { "declined" } else { rest };
                self.session.reject_join(request, reason)?;
                println!("Rejected {}", peer.short());
            }
            "/move" => {
                let args: Vec<&str> = rest.split_whitespace().collect();
                let [id, x, y] = args.as_slice() else {
                    bail!("usage: /move <id> <x> <y>");
                };
                let x: i32 = x.parse().context("x must be a number")?;
                let y: i32 = y.parse().context("y must be a number")?;
                let token = match self.session.document().token(&(*id).into())? {
                    Some(existing) => existing.moved_to(x, y),
                    None => TokenRecord::new(*id, *id, x, y)
                        .with_owner(self.session.local_id().clone()),
                };
                self.session.mutate(DocOp::UpsertToken(token))?;
            }
            "/note" => {
                let note = Note::new(rest, "");
                self.session.mutate(DocOp::AppendNote(note))?;
            }
            "/roll" => {
                let sent = self
                    .session
                    .send_ephemeral("roll", rest.as_bytes().to_vec());
                println!("~ rolled to {} peer(s)", sent);
            }
            "/turn" => {
                self.session.send_control(ControlAction::AdvanceTurn);
                println!("Turn {}", self.session.session_state().turn);
            }
            "/peers" => {
                for summary in self.session.peers() {
                    println!(
                        "  {} {} {}",
                        summary.peer.short(),
                        summary.role,
                        summary.status
                    );
                }
                println!("  rendezvous: {}", self.session.local_link());
            }
            "/tokens" => {
                for (id, token) in self.session.document().tokens()? {
                    println!("  {} ({}, {})", id, token.x, token.y);
                }
            }
            other => println!("Unknown command {}", other),
        }
        Ok(true)
    }
}

/// Drive the console until stdin closes, `/quit`, or Ctrl+C
async fn run_console(mut console: Console, auto_accept: bool) -> Result<()> {
    let mut events = console.session.subscribe();
    let mut changes = console.session.document().subscribe();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    console.print_new_messages()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        match console.handle_line(&line) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => println!("Error: {}", e),
                        }
                    }
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::ConnectionRequest { request, peer, .. }) if auto_accept => {
                        match console.session.accept_join(request) {
                            Ok(_) => println!("* accepted {}", peer.short()),
                            Err(e) => println!("Error accepting {}: {}", peer.short(), e),
                        }
                    }
                    Ok(event) => console.print_event(&event),
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Event feed lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
            change = changes.recv() => {
                match change {
                    Ok(change) if change.origin.is_local() => {}
                    Ok(change) => {
                        if change.region.is_none() || change.region == Some(Region::Messages) {
                            console.print_new_messages()?;
                        }
                    }
                    Err(RecvError::Lagged(_)) => console.print_new_messages()?,
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    println!("Shutting down...");
    console.session.shutdown();
    println!("Goodbye.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Id { name } => {
            println!("{}", resolve_host(&name));
        }

        Commands::Host {
            name,
            display,
            auto_accept,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let transport = Arc::new(IrohTransport::new());
            let session = Session::initialize(transport.clone(), config, name.map(PeerId::new))
                .await
                .context("starting session")?;
            session.set_profile(display.clone().into_bytes());

            println!("Hosting session");
            println!("  ID: {}", session.local_id());
            if let Some(addr) = transport.endpoint_addr() {
                println!("  Addresses: {}", addr.addrs.len());
            }
            println!();
            println!("Players join with: tablesync join {}", session.local_id());
            println!("Type to chat, /quit to stop.");
            println!();

            run_console(Console::new(session, display), auto_accept).await?;
        }

        Commands::Join {
            host,
            profile,
            name,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let transport = Arc::new(IrohTransport::new());
            let session = Session::initialize(transport, config, name.map(PeerId::new))
                .await
                .context("starting session")?;

            let host = resolve_host(&host);
            println!("Joining {} as {}...", host.short(), profile);
            session
                .connect_as_client(host.clone(), profile.clone().into_bytes())
                .await
                .with_context(|| format!("joining {}", host))?;

            println!("Joined. Type to chat, /quit to leave.");
            println!();

            run_console(Console::new(session, profile), false).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_host_and_join() {
        let cli = Cli::try_parse_from(["tablesync", "-vv", "host", "--name", "room-1"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Host { name: Some(ref n), auto_accept: false, .. } if n == "room-1"
        ));

        let cli = Cli::try_parse_from([
            "tablesync",
            "--config",
            "timings.json",
            "join",
            "room-1",
            "--profile",
            "Aria",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("timings.json")));
        assert!(matches!(
            cli.command,
            Commands::Join { ref host, ref profile, name: None } if host == "room-1" && profile == "Aria"
        ));
    }

    #[test]
    fn test_join_requires_profile() {
        assert!(Cli::try_parse_from(["tablesync", "join", "room-1"]).is_err());
    }

    #[test]
    fn test_resolve_host_by_name_is_stable() {
        let by_name = resolve_host("room-1");
        assert_eq!(by_name, resolve_host("room-1"));
        assert_ne!(by_name, resolve_host("room-2"));
        // An endpoint id resolves to itself
        assert_eq!(resolve_host(by_name.as_str()), by_name);
    }
}
