//! Chatline - terminal chat client
//!
//! Reads its configuration from `CHATLINE_*` environment variables, connects,
//! loads the history and maps stdin lines to chat actions:
//!
//! - `/edit <id> <text>`, `/delete <id>`, `/quit`
//! - `@<user> <text>` sends a direct message
//! - anything else is broadcast

use std::collections::HashMap;

use anyhow::Context;
use chatline_client::{
    logging, ActionHandle, ChatClient, ClientConfig, ConnectionEvent, ConversationEvent,
    UserDirectory,
};
use chatline_shared::{Message, MessageId};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, PartialEq)]
enum Input {
    Broadcast(String),
    Direct { to: String, content: String },
    Edit { id: MessageId, content: String },
    Delete(MessageId),
    Quit,
    Empty,
    Invalid(&'static str),
}

fn parse_line(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if line == "/quit" {
        return Input::Quit;
    }
    if let Some(rest) = line.strip_prefix("/edit ") {
        let (id, content) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
        return match id.parse() {
            Ok(id) => Input::Edit {
                id,
                content: content.to_string(),
            },
            Err(_) => Input::Invalid("usage: /edit <id> <text>"),
        };
    }
    if let Some(rest) = line.strip_prefix("/delete ") {
        return match rest.trim().parse() {
            Ok(id) => Input::Delete(id),
            Err(_) => Input::Invalid("usage: /delete <id>"),
        };
    }
    if line.starts_with('/') {
        return Input::Invalid("commands: /edit <id> <text>, /delete <id>, /quit");
    }
    if let Some(rest) = line.strip_prefix('@') {
        return match rest.split_once(' ') {
            Some((to, content)) if !to.is_empty() => Input::Direct {
                to: to.to_string(),
                content: content.to_string(),
            },
            _ => Input::Invalid("usage: @<user> <text>"),
        };
    }
    Input::Broadcast(line.to_string())
}

async fn render(message: &Message, directory: &UserDirectory) -> String {
    let sender = directory.label(&message.sender_id).await;
    let target = match &message.receiver_id {
        Some(receiver) => format!(" -> {}", directory.label(receiver).await),
        None => String::new(),
    };
    let mut line = format!(
        "[{}] #{} {}{}: {}",
        message.timestamp.format("%H:%M:%S"),
        message.id,
        sender,
        target,
        message.content
    );
    if message.last_edited_at.is_some() && !message.deleted {
        line.push_str(" (edited)");
    }
    line
}

fn report<T: Send + 'static>(what: &'static str, handle: ActionHandle<T>) {
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            eprintln!("{what} failed: {e}");
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = ClientConfig::from_env().context("invalid CHATLINE_* configuration")?;
    let client = ChatClient::from_config(config);

    client.events().connection.subscribe(|event| match event {
        ConnectionEvent::StateChanged(state) => eprintln!("* connection: {state:?}"),
        ConnectionEvent::ReconnectScheduled { attempt, delay } => {
            eprintln!("* retrying in {}ms (attempt {attempt})", delay.as_millis())
        }
    });
    client.events().conversation.subscribe(|event| match event {
        ConversationEvent::Rejected { kind, target, error } => {
            eprintln!("! {kind:?} of #{target} was undone: {error}")
        }
        ConversationEvent::ServerError { message } => eprintln!("! server: {message}"),
        ConversationEvent::Changed(_) => {}
    });

    // Print each entry again whenever it changes.
    let mut snapshots = client.snapshots();
    let directory = client.directory().clone();
    tokio::spawn(async move {
        let mut shown: HashMap<MessageId, Message> = HashMap::new();
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            for message in snapshot.iter() {
                if shown.get(&message.id) != Some(message) {
                    println!("{}", render(message, &directory).await);
                    shown.insert(message.id, message.clone());
                }
            }
        }
    });

    client.connect()?;
    report("loading history", client.load_history());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else { break };

        match parse_line(&line) {
            Input::Broadcast(content) => report("send", client.send_message(content, None)),
            Input::Direct { to, content } => report("send", client.send_message(content, Some(to))),
            Input::Edit { id, content } => report("edit", client.edit_message(id, content)),
            Input::Delete(id) => report("delete", client.delete_message(id)),
            Input::Quit => break,
            Input::Empty => {}
            Input::Invalid(usage) => eprintln!("{usage}"),
        }
    }

    client.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_terminal_input() {
        assert_eq!(parse_line("hello all"), Input::Broadcast("hello all".into()));
        assert_eq!(
            parse_line("@bob hi there"),
            Input::Direct {
                to: "bob".into(),
                content: "hi there".into()
            }
        );
        assert_eq!(
            parse_line("/edit 42 fixed typo"),
            Input::Edit {
                id: 42,
                content: "fixed typo".into()
            }
        );
        assert_eq!(parse_line("/delete 7"), Input::Delete(7));
        assert_eq!(parse_line(" /quit "), Input::Quit);
        assert_eq!(parse_line("   "), Input::Empty);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(matches!(parse_line("/edit abc x"), Input::Invalid(_)));
        assert!(matches!(parse_line("/delete"), Input::Invalid(_)));
        assert!(matches!(parse_line("@bob"), Input::Invalid(_)));
        assert!(matches!(parse_line("/shrug"), Input::Invalid(_)));
    }
}
