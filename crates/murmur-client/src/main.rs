//! # murmur-client
//!
//! Terminal driver for the chat gateway. Joins under the name given as the
//! first argument (or `CHAT_USERNAME`), prints every message the gateway
//! delivers and turns typed lines into broadcasts, direct messages and
//! file transfers.

mod commands;

use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use murmur_net::{BrokerTransport, Gateway, GatewayConfig};
use murmur_shared::{ChatMessage, InboundMessage, MessageBody, Topic};

use crate::commands::Command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("murmur_client=info,murmur_net=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // -----------------------------------------------------------------------
    // 2. Configuration
    // -----------------------------------------------------------------------
    let name = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CHAT_USERNAME").ok())
        .filter(|n| !n.trim().is_empty())
        .context("usage: murmur-client <display name> (or set CHAT_USERNAME)")?;

    let config = GatewayConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Join
    // -----------------------------------------------------------------------
    let gateway = Gateway::new(transport(&config), config);

    let directory = match gateway.join(&name).await {
        Ok(directory) => directory,
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "Could not join chat");
            return Err(e.into());
        }
    };

    let identity = gateway
        .identity()
        .await
        .context("session vanished right after joining")?;
    let me = identity
        .announced_name()
        .unwrap_or_else(|| identity.display_name().to_string());

    info!(name = %me, group = %identity.group_id(), "Joined");
    println!("online: {}", directory.participants().join(", "));
    println!("{}", commands::HELP);

    let _inbox = {
        let me = me.clone();
        gateway.on_message(move |topic, message| print_inbound(&me, topic, message))
    };

    // -----------------------------------------------------------------------
    // 4. Prompt loop (until /quit, EOF or Ctrl+C)
    // -----------------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving");
                break;
            }
        };

        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(usage) => {
                println!("{usage}");
                continue;
            }
        };

        if command == Command::Quit {
            break;
        }
        if let Err(e) = run_command(&gateway, &me, command).await {
            warn!(error = %e, "Command failed");
            println!("! {e:#}");
        }
    }

    gateway.leave().await;
    Ok(())
}

#[cfg(feature = "kafka")]
fn transport(config: &GatewayConfig) -> Arc<dyn BrokerTransport> {
    Arc::new(murmur_net::KafkaTransport::new(config))
}

#[cfg(not(feature = "kafka"))]
fn transport(_config: &GatewayConfig) -> Arc<dyn BrokerTransport> {
    warn!("Built without Kafka support, using an in-process broker");
    Arc::new(murmur_net::MemoryBroker::new().transport())
}

async fn run_command(gateway: &Gateway, me: &str, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Say(text) => {
            gateway
                .send(Topic::Broadcast, &ChatMessage::text(me, text))
                .await?;
        }
        Command::Direct { to, text } => {
            gateway
                .send(Topic::Direct, &ChatMessage::text(me, text).to(to))
                .await?;
        }
        Command::File { to, path } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file")
                .to_string();
            let mut message =
                ChatMessage::file(me, filename.clone(), commands::mime_type_for(&path), data);
            let topic = match to {
                Some(to) => {
                    message = message.to(to);
                    Topic::Direct
                }
                None => Topic::Broadcast,
            };
            let receipt = gateway.send(topic, &message).await?;
            info!(file = %filename, records = receipt.records, "File sent");
        }
        Command::Who => {
            let directory = gateway.refresh_participants().await?;
            println!("online: {}", directory.participants().join(", "));
        }
        Command::Help => println!("{}", commands::HELP),
        Command::Quit => {}
    }
    Ok(())
}

fn print_inbound(me: &str, topic: Topic, message: &InboundMessage) {
    let now = Local::now().format("%H:%M:%S");
    match message {
        InboundMessage::Chat(chat) => {
            if topic == Topic::Direct && !chat.involves(me) {
                return;
            }
            let from = match &chat.recipient {
                Some(to) => format!("{} -> {}", chat.sender, to),
                None => chat.sender.clone(),
            };
            match &chat.body {
                MessageBody::Text(text) => println!("[{now}] {from}: {text}"),
                MessageBody::File(file) => println!(
                    "[{now}] {from} shared {} ({} bytes, {})",
                    file.filename,
                    file.data.len(),
                    file.mime_type
                ),
            }
        }
        InboundMessage::Joined(notice) => println!("[{now}] * {} joined", notice.username),
        InboundMessage::Left(notice) => println!("[{now}] * {} left", notice.username),
        InboundMessage::Unrecognized(_) => {}
    }
}
