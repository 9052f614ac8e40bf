//! Subscribe to a channel, publish a greeting to it, and print what arrives.
//!
//! ```sh
//! cargo run -p pubsub-session --example subscribe -- <SUBSCRIBE_KEY> <PUBLISH_KEY> <CHANNEL> [ORIGIN]
//! ```
//!
//! Or pass the keys via environment variables:
//! ```sh
//! PUBSUB_SUBSCRIBE_KEY=sub-c-... PUBSUB_PUBLISH_KEY=pub-c-... \
//!     cargo run -p pubsub-session --example subscribe -- <CHANNEL> [ORIGIN]
//! ```
//!
//! Message payloads are printed to stdout (pipe to `jq` for formatting).
//! Press Ctrl-C to shut down.

use std::sync::Arc;

use pubsub_session::{CallbackListener, Client, Config, StatusCategory};

const USAGE: &str = "usage: subscribe <SUBSCRIBE_KEY> <PUBLISH_KEY> <CHANNEL> [ORIGIN]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let env_keys = std::env::var("PUBSUB_SUBSCRIBE_KEY")
        .ok()
        .zip(std::env::var("PUBSUB_PUBLISH_KEY").ok());

    let (subscribe_key, publish_key, channel, origin) = match env_keys {
        Some((sub, publ)) => {
            let channel = args.first().ok_or("usage: subscribe <CHANNEL> [ORIGIN]")?;
            (sub, publ, channel.clone(), args.get(1).cloned())
        }
        None => {
            let sub = args.first().ok_or(USAGE)?;
            let publ = args.get(1).ok_or(USAGE)?;
            let channel = args.get(2).ok_or(USAGE)?;
            (sub.clone(), publ.clone(), channel.clone(), args.get(3).cloned())
        }
    };

    let mut config = Config::new(subscribe_key).with_publish_key(publish_key);
    if let Some(origin) = origin {
        config = config.with_origin(origin);
    }
    let client = Client::with_http(config)?;

    // Publish once the session is connected so our own greeting comes back.
    let publisher = client.downgrade();
    let greeting_channel = channel.clone();
    client.add_listener(Arc::new(
        CallbackListener::new()
            .with_message(|m| {
                eprintln!(
                    "[message] channel={} publisher={} tt={}",
                    m.channel,
                    m.publisher.as_deref().unwrap_or("-"),
                    m.timetoken
                );
                println!("{}", m.payload);
            })
            .with_presence(|p| {
                eprintln!(
                    "[presence] channel={} action={:?} uuid={} occupancy={}",
                    p.channel,
                    p.action,
                    p.uuid.as_deref().unwrap_or("-"),
                    p.occupancy.map_or_else(|| "-".to_string(), |o| o.to_string()),
                );
            })
            .with_status(move |s| {
                eprintln!(
                    "[status] {:?} {}",
                    s.category,
                    s.error.as_deref().unwrap_or("")
                );
                if s.category == StatusCategory::Connected
                    && let Some(publisher) = publisher.upgrade()
                {
                    let handle = publisher.publish(
                        greeting_channel.clone(),
                        &serde_json::json!({"text": "Hello from pubsub-session"}),
                        false,
                    );
                    tokio::spawn(async move {
                        match handle.await {
                            Ok(tt) => eprintln!("[publish] sent at {tt}"),
                            Err(failure) => eprintln!("[publish] {failure}"),
                        }
                    });
                }
            }),
    ));

    eprintln!("subscribing to '{channel}' ...");
    client.subscribe([channel], true);

    tokio::signal::ctrl_c().await?;
    client.shutdown().await;
    Ok(())
}
