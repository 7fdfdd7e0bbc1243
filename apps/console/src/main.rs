use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use push_transport::WsPushConnector;
use realtime_core::{
    api::HttpConversationApi, events::SessionEvent, transport::HttpChannelAuthorizer,
    RealtimeSession,
};
use shared::{
    domain::{ConversationId, MessageKind, UserId},
    protocol::OutgoingMessage,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    /// WebSocket endpoint of the push broker.
    #[arg(long)]
    push_url: String,
    /// Base URL of the conversation repository.
    #[arg(long)]
    api_url: String,
    /// Channel authorization endpoint.
    #[arg(long)]
    auth_url: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long, default_value = "console user")]
    display_name: String,
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::NewMessage { message } => {
            let sender = message.sender_name.as_deref().unwrap_or("system");
            println!("[{}] {sender}: {}", message.conversation_id.0, message.body);
        }
        SessionEvent::ShowToast { title, body, .. } => println!("* {title}: {body}"),
        SessionEvent::TypingChanged {
            conversation_id,
            names,
        } => {
            if !names.is_empty() {
                println!("[{}] typing: {}", conversation_id.0, names.join(", "));
            }
        }
        SessionEvent::ConnectionChanged(state) => println!("-- connection: {state:?}"),
        SessionEvent::CallChanged(snapshot) => {
            println!("-- call: {:?} peer={:?}", snapshot.status, snapshot.remote_peer)
        }
        SessionEvent::CallEnded { reason } => println!("-- call ended: {reason:?}"),
        SessionEvent::Error(message) => println!("!! {message}"),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let session = RealtimeSession::new(
        Arc::new(WsPushConnector),
        Arc::new(HttpChannelAuthorizer::new(args.auth_url)),
        Arc::new(HttpConversationApi::new(args.api_url)),
        args.push_url,
    );
    session.init(UserId(args.user_id), args.display_name).await?;
    if let Err(err) = session.refresh().await {
        warn!("initial conversation list load failed: {err}");
    }

    for conversation in session.conversations().await {
        println!(
            "[{}] {} (unread {})",
            conversation.conversation_id.0, conversation.title, conversation.unread
        );
    }
    println!("commands: /select <id>, /end, /quit, anything else sends to the selection");

    let mut events = session.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if line == "/end" {
            if let Err(err) = session.call().end().await {
                warn!("hangup failed: {err}");
            }
            continue;
        }
        if let Some(raw) = line.strip_prefix("/select ") {
            match raw.trim().parse::<i64>() {
                Ok(id) => {
                    if let Err(err) = session.select_conversation(ConversationId(id)).await {
                        warn!("select failed: {err}");
                    }
                }
                Err(_) => println!("usage: /select <conversation id>"),
            }
            continue;
        }
        let Some(conversation_id) = session.selected_conversation().await else {
            println!("no conversation selected, use /select first");
            continue;
        };
        let outgoing = OutgoingMessage {
            body: line.to_string(),
            kind: MessageKind::Text,
            reply_to: None,
            attachments: Vec::new(),
            client_ref: None,
        };
        if let Err(err) = session.send_message(conversation_id, outgoing).await {
            warn!("send failed: {err}");
        }
    }

    printer.abort();
    session.teardown().await;
    Ok(())
}
