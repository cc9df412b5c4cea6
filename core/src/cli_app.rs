use crate::backend::{Backend, SledBackend};
use crate::config::Config;
use crate::conversations::ConversationList;
use crate::identity::{self, SessionIdentity};
use crate::models::{Profile, ThreadMessage};
use crate::thread::ThreadSession;
use colored::*;
use std::sync::Arc;

/// `inbox` binary: inspect and drive threads stored in a local data directory.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let Some(command) = config.command.first().cloned() else {
        print_usage();
        return Ok(());
    };

    let store = Arc::new(SledBackend::new(&config.data_dir, config.feed_capacity)?);

    if command == "profile" {
        return put_profile(&store, &config.command[1..]);
    }

    let viewer = match config.viewer_id.clone() {
        Some(v) => {
            identity::save_session(&config.data_dir, &v)?;
            Some(v)
        }
        None => identity::load_session(&config.data_dir)?,
    };
    let Some(viewer) = viewer else {
        eprintln!("{}", "✗ No user: pass --as <user> once to sign in".red().bold());
        return Ok(());
    };

    let backend: Arc<dyn Backend> = store;
    let identity = Arc::new(SessionIdentity::signed_in(viewer.clone()));
    let scope = config.scope_id.as_deref();
    let args = &config.command[1..];

    match command.as_str() {
        "inbox" => {
            let inbox = ConversationList::new(
                backend,
                identity,
                config.scope_id.clone(),
                config.refresh_debounce,
            );
            inbox.fetch_all().await?;
            print_inbox(&viewer, &inbox).await;
            inbox.close().await;
        }
        "thread" => {
            let Some(peer) = args.first() else {
                eprintln!("{}", "Usage: inbox <dir> thread <peer>".yellow());
                return Ok(());
            };
            let thread = ThreadSession::new(backend, identity);
            thread.open(peer, scope).await?;
            print_thread(&viewer, &thread.messages().await);
            thread.close().await;
        }
        "send" => {
            if args.len() < 2 {
                eprintln!("{}", "Usage: inbox <dir> send <peer> <message>".yellow());
                return Ok(());
            }
            let peer = &args[0];
            let body = args[1..].join(" ");
            let thread = ThreadSession::new(backend, identity);
            thread.open(peer, scope).await?;
            let sent = thread.send(&body, peer, scope).await?;
            println!("{} Sent {}", "✓".green(), sent.id.dimmed());
            thread.close().await;
        }
        "read" => {
            let Some(peer) = args.first() else {
                eprintln!("{}", "Usage: inbox <dir> read <peer>".yellow());
                return Ok(());
            };
            let inbox = ConversationList::new(
                backend.clone(),
                identity.clone(),
                config.scope_id.clone(),
                config.refresh_debounce,
            );
            let thread = ThreadSession::new(backend, identity);
            thread.attach_inbox(inbox.clone()).await;
            thread.open(peer, scope).await?;
            let before = thread.unread_count().await;
            thread.mark_thread_read().await?;
            println!(
                "{} Marked {} message(s) read; {} unread in inbox",
                "✓".green(),
                before.to_string().cyan(),
                inbox.total_unread().await.to_string().cyan()
            );
            thread.close().await;
            inbox.close().await;
        }
        other => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), other.red());
            print_usage();
        }
    }

    Ok(())
}

fn put_profile(store: &SledBackend, args: &[String]) -> anyhow::Result<()> {
    if args.len() < 3 {
        eprintln!(
            "{}",
            "Usage: inbox <dir> profile <id> <first> <last> [role] [username]".yellow()
        );
        return Ok(());
    }
    let profile = Profile {
        id: args[0].clone(),
        first_name: Some(args[1].clone()),
        last_name: Some(args[2].clone()),
        role: args.get(3).cloned(),
        username: args.get(4).cloned(),
    };
    store.put_profile(&profile)?;
    println!("{} Saved profile {}", "✓".green(), profile.display_name().cyan());
    Ok(())
}

async fn print_inbox(viewer: &str, inbox: &ConversationList) {
    let conversations = inbox.conversations().await;
    println!(
        "{} {} ({} unread)",
        "Inbox of".bright_white().bold(),
        viewer.cyan(),
        inbox.total_unread().await
    );
    if conversations.is_empty() {
        println!("  {}", "no conversations".dimmed());
        return;
    }
    for c in conversations {
        let name = c
            .other_profile
            .as_ref()
            .map(Profile::display_name)
            .unwrap_or_else(|| c.other_user_id.clone());
        let badge = if c.unread_count > 0 {
            format!("[{}]", c.unread_count).yellow().bold().to_string()
        } else {
            String::new()
        };
        let when = c
            .last_message_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "  {} {} {} {}",
            name.bright_white(),
            badge,
            when.dimmed(),
            c.last_message.unwrap_or_default()
        );
    }
}

fn print_thread(viewer: &str, messages: &[ThreadMessage]) {
    if messages.is_empty() {
        println!("  {}", "no messages".dimmed());
        return;
    }
    for m in messages {
        let who = m
            .sender
            .as_ref()
            .map(Profile::display_name)
            .unwrap_or_else(|| m.message.sender_id.clone());
        let who = if m.message.sender_id == viewer {
            who.green()
        } else {
            who.cyan()
        };
        let read = if m.message.is_unread() { "•" } else { " " };
        println!(
            "  {} {} {}: {}",
            read.yellow(),
            m.message.created_at.format("%H:%M:%S").to_string().dimmed(),
            who,
            m.message.body
        );
    }
}

fn print_usage() {
    println!("{}", "✉ Inbox CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!(
        "  {} <data-dir> [--as <user>] [--scope <id>] <command> [args]",
        "inbox".cyan()
    );
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                          List conversations", "inbox".cyan());
    println!("  {} <peer>                  Show a thread", "thread".cyan());
    println!("  {} <peer> <message>          Send a message", "send".cyan());
    println!("  {} <peer>                    Mark a thread read", "read".cyan());
    println!(
        "  {} <id> <first> <last> [role] [username]  Create or update a profile",
        "profile".cyan()
    );
}
