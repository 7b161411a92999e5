use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{load_settings, ChatClient, ClientEvent, ClientSettings, HydrationPolicy};
use pubsub_integration::InMemoryBroker;
use storage::{MemoryStore, SessionStore, SqliteSessionStore, StoreKey};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Ephemeral chat room client running against an in-process broker")]
struct Cli {
    /// Overrides `store_url` from client.toml / APP__STORE_URL.
    #[arg(long)]
    store_url: Option<String>,
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    Merge,
    Replace,
}

impl From<PolicyArg> for HydrationPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Merge => HydrationPolicy::Merge,
            PolicyArg::Replace => HydrationPolicy::Replace,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host creates a room, a guest joins it and both exchange messages.
    Demo {
        #[arg(long, default_value = "Finch")]
        host: String,
        #[arg(long, default_value = "Wren")]
        guest: String,
        #[arg(long = "message", default_values_t = ["hello".to_string(), "anyone here?".to_string()])]
        messages: Vec<String>,
        /// Keep the host's room persisted instead of leaving at the end.
        #[arg(long)]
        stay: bool,
    },
    /// Reopens the persisted session the way a page reload would.
    Restore,
    /// Prints the persisted session fields.
    Show,
    /// Removes every persisted session field.
    Forget,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(store_url) = cli.store_url {
        settings.store_url = store_url;
    }
    if let Some(policy) = cli.policy {
        settings.hydration_policy = policy.into();
    }

    let store = SqliteSessionStore::new(&settings.store_url)
        .await
        .map_err(|err| {
            error!(
                store_url = %settings.store_url,
                "failed to open session store: {err:#}"
            );
            err
        })?;
    store.health_check().await?;
    let store = Arc::new(store);

    match cli.command {
        Command::Demo {
            host,
            guest,
            messages,
            stay,
        } => run_demo(&settings, store, &host, &guest, &messages, stay).await,
        Command::Restore => run_restore(&settings, store).await,
        Command::Show => {
            let values = store.get_many(&StoreKey::ALL).await?;
            for key in StoreKey::ALL {
                let value = values.get(&key).map(String::as_str).unwrap_or("<unset>");
                println!("{key}={value}");
            }
            Ok(())
        }
        Command::Forget => {
            store.clear().await?;
            println!("session cleared");
            Ok(())
        }
    }
}

async fn run_demo(
    settings: &ClientSettings,
    store: Arc<SqliteSessionStore>,
    host_name: &str,
    guest_name: &str,
    messages: &[String],
    stay: bool,
) -> Result<()> {
    let broker = InMemoryBroker::new();
    let host = ChatClient::new(settings, Arc::new(broker.connect().await), store);
    let guest = ChatClient::new(
        settings,
        Arc::new(broker.connect().await),
        Arc::new(MemoryStore::new()),
    );
    log_notices("guest", &guest);

    if let Some(channel) = host.start().await? {
        info!(channel = %channel, "host: leaving restored room before the demo");
        host.leave_room().await?;
    }
    guest.start().await?;
    host.set_screen_name(host_name).await?;
    guest.set_screen_name(guest_name).await?;

    let Some(code) = host.create_room().await? else {
        bail!("host could not create a room");
    };
    println!("room code: {code}");
    guest.join_room(code.as_str()).await?;

    for (index, text) in messages.iter().enumerate() {
        let sender = if index % 2 == 0 { &host } else { &guest };
        sender.send_message(text).await?;
    }
    settle(&guest, messages.len()).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&guest.timeline().await)?
    );

    guest.leave_room().await?;
    if !stay {
        host.end_session().await?;
    }
    println!("{}", serde_json::to_string_pretty(&host.room().await)?);
    Ok(())
}

async fn run_restore(settings: &ClientSettings, store: Arc<SqliteSessionStore>) -> Result<()> {
    let broker = InMemoryBroker::new();
    let client = ChatClient::new(settings, Arc::new(broker.connect().await), store);
    match client.start().await? {
        Some(channel) => println!("restored room {channel}"),
        None => println!("no persisted room"),
    }
    println!("{}", serde_json::to_string_pretty(&client.room().await)?);
    Ok(())
}

fn log_notices(label: &'static str, client: &ChatClient) {
    tokio::spawn(forward_notices(label, client.subscribe_events()));
}

/// Logs notices until the feed closes and returns how many were logged.
async fn forward_notices(
    label: &'static str,
    mut events: broadcast::Receiver<ClientEvent>,
) -> usize {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(ClientEvent::Notice(notice)) => {
                info!(client = label, code = ?notice.code, "{}", notice.message);
                logged += 1;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(client = label, skipped, "notice feed lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    logged
}

async fn settle(client: &ChatClient, expected: usize) {
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while client.timeline().await.len() < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
