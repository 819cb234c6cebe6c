use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use spoke::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};

const CHAT: &str = "chat.lobby";
const STATUS: &str = "host.status";
const PASSWORD_VAR: &str = "SPOKE_PASSWORD";

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize)]
enum ChatCall {
    Said { from: String, text: String },
    Me { from: String, action: String },
}

struct Chat;

impl ChannelContract for Chat {
    const NAME: &'static str = "chat";
    type Call = ChatCall;

    fn method(call: &ChatCall) -> &'static str {
        match call {
            ChatCall::Said { .. } => "said",
            ChatCall::Me { .. } => "me",
        }
    }
}

#[derive(Serialize, Deserialize)]
enum StatusCall {
    Players,
    Uptime,
}

#[derive(Serialize, Deserialize)]
enum StatusReply {
    Players(Vec<String>),
    Uptime(u64),
}

struct Status;

impl RemoteContract for Status {
    const NAME: &'static str = "status";
    type Call = StatusCall;
    type Reply = StatusReply;

    fn method(call: &StatusCall) -> &'static str {
        match call {
            StatusCall::Players => "players",
            StatusCall::Uptime => "uptime",
        }
    }
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

struct Printer;

impl ChannelSubscriber<Chat> for Printer {
    fn on_call(&self, call: ChatCall) {
        match call {
            ChatCall::Said { from, text } => println!("<{from}> {text}"),
            ChatCall::Me { from, action } => println!("* {from} {action}"),
        }
    }
}

struct HostStatus {
    server: ServerMessenger,
    started: Instant,
}

impl RemoteImplementor<Status> for HostStatus {
    async fn invoke(&self, call: StatusCall) -> Result<StatusReply, RemoteFailure> {
        Ok(match call {
            StatusCall::Players => {
                let mut names: Vec<String> = self
                    .server
                    .nodes()
                    .iter()
                    .map(|n| n.name().to_string())
                    .collect();
                names.sort();
                StatusReply::Players(names)
            }
            StatusCall::Uptime => StatusReply::Uptime(self.started.elapsed().as_secs()),
        })
    }
}

// ---------------------------------------------------------------------------
// Chat loop
// ---------------------------------------------------------------------------

/// Relays stdin lines as chat calls until `/quit`, EOF or disconnect.
async fn chat<M: Messenger>(unified: UnifiedMessenger<M>) -> Result<(), Box<dyn std::error::Error>> {
    let messenger = unified.messenger().clone();
    let me = messenger.local_node().name().to_string();
    let channels = ChannelMessenger::new(unified.clone());
    let remotes = RemoteMessenger::new(unified);

    channels
        .wait_for_channel(CHAT, Some(Duration::from_secs(10)))
        .await?;
    channels.register_subscriber::<Chat, _>(Arc::new(Printer), CHAT)?;
    let lobby = channels.broadcaster::<Chat>(CHAT)?;
    remotes
        .wait_for_remote(STATUS, Some(Duration::from_secs(10)))
        .await?;
    let status = remotes.remote::<Status>(STATUS)?;

    eprintln!("joined as {me}; /me <action>, /who, /uptime, /quit");

    let closed = messenger.closed();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => {
                eprintln!("disconnected");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => {}
            "/quit" => break,
            "/who" => match status.call(StatusCall::Players).await {
                Ok(StatusReply::Players(names)) => println!("online: {}", names.join(", ")),
                Ok(_) => {}
                Err(e) => eprintln!("status unavailable: {e}"),
            },
            "/uptime" => match status.call(StatusCall::Uptime).await {
                Ok(StatusReply::Uptime(secs)) => println!("host up for {secs}s"),
                Ok(_) => {}
                Err(e) => eprintln!("status unavailable: {e}"),
            },
            text => {
                let call = match text.strip_prefix("/me ") {
                    Some(action) => ChatCall::Me {
                        from: me.clone(),
                        action: action.to_string(),
                    },
                    None => ChatCall::Said {
                        from: me.clone(),
                        text: text.to_string(),
                    },
                };
                lobby.call(call)?;
            }
        }
    }

    messenger.flush().await;
    messenger.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

async fn host(port: u16, name: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = ServerMessenger::builder().name(name).port(port);
    if let Ok(password) = std::env::var(PASSWORD_VAR) {
        builder = builder.login_validator(PasswordValidator::new(password));
    }
    let server = builder.build().await?;
    tracing::info!(addr = %server.local_addr(), "hosting");

    let unified = UnifiedMessenger::new(server.clone(), InvokeConfig::default()).await?;
    ChannelMessenger::new(unified.clone()).create_channel::<Chat>(CHAT)?;
    RemoteMessenger::new(unified.clone()).register_remote::<Status, _>(
        Arc::new(HostStatus {
            server: server.clone(),
            started: Instant::now(),
        }),
        STATUS,
    )?;
    server.enable_chat_muting::<Chat>(
        CHAT,
        &ChatCall::Said {
            from: "host".into(),
            text: "you are muted".into(),
        },
    )?;

    chat(unified).await
}

async fn join(host: String, port: u16, name: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = ClientMessenger::builder(host, port, name);
    if let Ok(password) = std::env::var(PASSWORD_VAR) {
        builder = builder.credentials(PasswordCredentials::new(password));
    }
    let client = builder.connect().await?;
    let unified = UnifiedMessenger::new(client, InvokeConfig::default()).await?;
    chat(unified).await
}

fn usage() -> ! {
    eprintln!("usage: spoke-chat host <port> <name>");
    eprintln!("       spoke-chat join <host> <port> <name>");
    eprintln!("set {PASSWORD_VAR} to require or supply a game password");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [mode, port, name] if mode == "host" => {
            let port = port.parse().unwrap_or_else(|_| usage());
            host(port, name.clone()).await
        }
        [mode, host_addr, port, name] if mode == "join" => {
            let port = port.parse().unwrap_or_else(|_| usage());
            join(host_addr.clone(), port, name.clone()).await
        }
        _ => usage(),
    }
}
