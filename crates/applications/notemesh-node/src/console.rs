//! Line commands accepted on stdin by a running node.

use anyhow::{anyhow, bail, Context, Result};
use notemesh_net::{BroadcastPolicyKind, MutationOutcome, NodeHandle, StrategyType};
use notemesh_replica::{ConflictPolicyKind, NodeId, NoteId};

pub const HELP: &str = "\
commands:
  create <title> | <body>
  update <id> <title> | <body>
  delete <id>
  list
  peers
  conflict <last-write-wins|first-write-wins|version-based|content-merge|author-priority>
  broadcast <broadcast-all|selective|gossip|priority|batch>
  priority <peer> <0-10>
  request <conflict|broadcast> <name>
  stats
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Create { title: String, body: String },
    Update { id: NoteId, title: String, body: String },
    Delete { id: NoteId },
    List,
    Peers,
    Conflict(ConflictPolicyKind),
    Broadcast(BroadcastPolicyKind),
    Priority { peer: NodeId, priority: u8 },
    Request { strategy_type: StrategyType, name: String },
    Stats,
    Help,
    Quit,
}

fn title_and_body(text: &str) -> Result<(String, String)> {
    let (title, body) = text
        .split_once('|')
        .ok_or_else(|| anyhow!("expected <title> | <body>"))?;
    let title = title.trim();
    if title.is_empty() {
        bail!("title must not be empty");
    }
    Ok((title.to_string(), body.trim().to_string()))
}

/// Parses one input line.
pub fn parse(line: &str) -> Result<ConsoleCommand> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match word {
        "create" => {
            let (title, body) = title_and_body(rest)?;
            ConsoleCommand::Create { title, body }
        }
        "update" => {
            let (id, text) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("usage: update <id> <title> | <body>"))?;
            let (title, body) = title_and_body(text)?;
            ConsoleCommand::Update {
                id: NoteId::from(id),
                title,
                body,
            }
        }
        "delete" if !rest.is_empty() => ConsoleCommand::Delete { id: NoteId::from(rest) },
        "delete" => bail!("usage: delete <id>"),
        "list" => ConsoleCommand::List,
        "peers" => ConsoleCommand::Peers,
        "conflict" => ConsoleCommand::Conflict(rest.parse()?),
        "broadcast" => ConsoleCommand::Broadcast(rest.parse()?),
        "priority" => {
            let (peer, priority) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("usage: priority <peer> <0-10>"))?;
            let priority = priority
                .trim()
                .parse()
                .with_context(|| format!("invalid priority {priority:?}"))?;
            ConsoleCommand::Priority {
                peer: NodeId::from(peer),
                priority,
            }
        }
        "request" => {
            let (kind, name) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("usage: request <conflict|broadcast> <name>"))?;
            let strategy_type = match kind {
                "conflict" => StrategyType::Conflict,
                "broadcast" => StrategyType::Broadcast,
                other => bail!("unknown strategy type {other:?}"),
            };
            ConsoleCommand::Request {
                strategy_type,
                name: name.trim().to_string(),
            }
        }
        "stats" => ConsoleCommand::Stats,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("unknown command {other:?}, type help"),
    };
    Ok(command)
}

fn print_outcome(action: &str, outcome: &MutationOutcome) {
    let report = &outcome.report;
    if let Some(note) = &outcome.note {
        println!("{action} {} (v{})", note.id.as_str(), note.effective_version());
    }
    if !outcome.persisted {
        println!("warning: snapshot was not saved");
    }
    if report.queued {
        println!("queued for batch ({} pending)", report.messages_in_batch);
    } else {
        println!(
            "{}: sent {}, failed {}, skipped {}",
            report.policy, report.sent, report.failed, report.skipped
        );
    }
}

/// Runs a command against the node; returns false when the console should stop.
pub async fn execute(handle: &NodeHandle, command: ConsoleCommand) -> Result<bool> {
    match command {
        ConsoleCommand::Create { title, body } => {
            let outcome = handle.create_note(title, body).await?;
            print_outcome("created", &outcome);
        }
        ConsoleCommand::Update { id, title, body } => {
            let outcome = handle.update_note(id, title, body).await?;
            print_outcome("updated", &outcome);
        }
        ConsoleCommand::Delete { id } => {
            let outcome = handle.delete_note(id.clone()).await?;
            if !outcome.removed {
                println!("{} was not present locally", id.as_str());
            }
            print_outcome("deleted", &outcome);
        }
        ConsoleCommand::List => {
            let notes = handle.notes().await?;
            if notes.is_empty() {
                println!("no notes");
            }
            for note in notes {
                let marker = if note.merged { " [merged]" } else { "" };
                println!(
                    "{}  {}{}  (v{}, by {}, at {})",
                    note.id.as_str(),
                    note.title,
                    marker,
                    note.effective_version(),
                    note.author_node_id,
                    note.updated_at.as_millis()
                );
                for line in note.body.lines() {
                    println!("    {line}");
                }
            }
        }
        ConsoleCommand::Peers => {
            let status = handle.peer_status().await?;
            if status.is_empty() {
                println!("no peers");
            }
            for peer in status {
                let role = if peer.initiator { "offerer" } else { "answerer" };
                println!("{}  {} ({role}, channel open: {})", peer.id, peer.phase, peer.channel_open);
            }
        }
        ConsoleCommand::Conflict(kind) => {
            handle.set_conflict_policy(kind).await?;
            println!("conflict policy: {kind}");
        }
        ConsoleCommand::Broadcast(kind) => {
            if let Some(flushed) = handle.set_broadcast_policy(kind).await? {
                println!("flushed {} queued messages", flushed.messages_in_batch);
            }
            println!("broadcast policy: {kind}");
        }
        ConsoleCommand::Priority { peer, priority } => {
            handle.set_peer_priority(peer.clone(), priority).await?;
            println!("priority of {peer}: {}", priority.min(10));
        }
        ConsoleCommand::Request { strategy_type, name } => {
            let asked = handle.request_strategy_change(strategy_type, name.clone()).await?;
            println!("asked {asked} peers to switch {strategy_type} policy to {name}");
        }
        ConsoleCommand::Stats => {
            let stats = handle.stats().await?;
            println!("node {}", stats.node_id);
            println!("  notes: {}, connected peers: {}", stats.notes, stats.connected_peers);
            println!("  policies: {} / {}", stats.conflict_policy, stats.broadcast_policy);
            println!(
                "  negotiation: {} offers, {} answers, {} glare yields, {} retries, {} failures",
                stats.coordinator.offers_sent,
                stats.coordinator.answers_sent,
                stats.coordinator.glare_yielded,
                stats.coordinator.retries_scheduled,
                stats.coordinator.negotiation_failures
            );
            println!(
                "  sync: {} sent, {} received, {} inserted, {} replaced, {} deletes",
                stats.sync.full_syncs_sent,
                stats.sync.full_syncs_received,
                stats.sync.notes_inserted,
                stats.sync.notes_replaced,
                stats.sync.deletes_applied
            );
            let rate = stats
                .broadcast_success_rate
                .map(|r| format!("{:.1}%", r * 100.0))
                .unwrap_or_else(|| "n/a".to_string());
            println!(
                "  dissemination: {} messages, {} delivered, {} failed, success {rate}",
                stats.broadcast.total_messages, stats.broadcast.total_sent, stats.broadcast.total_failed
            );
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_note_commands() {
        assert_eq!(
            parse("create Groceries | milk, eggs").unwrap(),
            ConsoleCommand::Create {
                title: "Groceries".into(),
                body: "milk, eggs".into()
            }
        );
        assert_eq!(
            parse("update note_1_abc Groceries | bread").unwrap(),
            ConsoleCommand::Update {
                id: NoteId::from("note_1_abc"),
                title: "Groceries".into(),
                body: "bread".into()
            }
        );
        assert_eq!(
            parse("  delete note_1_abc ").unwrap(),
            ConsoleCommand::Delete { id: NoteId::from("note_1_abc") }
        );
    }

    #[test]
    fn test_parse_policy_commands() {
        assert_eq!(
            parse("conflict version-based").unwrap(),
            ConsoleCommand::Conflict(ConflictPolicyKind::VersionBased)
        );
        assert_eq!(
            parse("broadcast gossip").unwrap(),
            ConsoleCommand::Broadcast(BroadcastPolicyKind::Gossip)
        );
        assert_eq!(
            parse("priority node_b 9").unwrap(),
            ConsoleCommand::Priority {
                peer: NodeId::from("node_b"),
                priority: 9
            }
        );
        assert_eq!(
            parse("request broadcast batch").unwrap(),
            ConsoleCommand::Request {
                strategy_type: StrategyType::Broadcast,
                name: "batch".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse("create no separator").is_err());
        assert!(parse("create  | body only").is_err());
        assert!(parse("delete").is_err());
        assert!(parse("conflict newest").is_err());
        assert!(parse("priority node_b high").is_err());
        assert!(parse("request quorum x").is_err());
        assert!(parse("teleport").is_err());
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse("list").unwrap(), ConsoleCommand::List);
        assert_eq!(parse("peers").unwrap(), ConsoleCommand::Peers);
        assert_eq!(parse("stats").unwrap(), ConsoleCommand::Stats);
        assert_eq!(parse("quit").unwrap(), ConsoleCommand::Quit);
        assert_eq!(parse("help").unwrap(), ConsoleCommand::Help);
    }
}
