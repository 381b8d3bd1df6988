use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use tidelink::cli::{ChatCommand, Cli};
use tidelink::telemetry::logging;
use tidelink::transport::factory_for;
use tidelink::{LinkConfig, PeerEvent, PeerLink, TransportConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initialising logging")?;

    let mut transport = TransportConfig::default();
    if cli.no_stun.unwrap_or(false) {
        transport.ice_servers.clear();
    }
    let config = LinkConfig::new(&cli.relay_url, &cli.user).with_transport(transport);
    let link = PeerLink::new(config, factory_for(cli.transport));

    let printer = tokio::spawn(print_events(link.subscribe()));

    match link.connect().await {
        Ok(()) => println!("registered as {} at {}", cli.user, cli.relay_url),
        Err(err) => println!("relay unavailable ({err}); retrying in the background"),
    }
    if let Some(peer) = &cli.peer {
        call(&link, peer).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match ChatCommand::parse(&line) {
            Ok(ChatCommand::Call(peer)) => call(&link, &peer).await,
            Ok(ChatCommand::Hangup) => link.disconnect().await,
            Ok(ChatCommand::Status) => {
                let snapshot = link.snapshot();
                println!(
                    "signaling: {} | session: {} peer={} role={}",
                    link.signaling_status(),
                    snapshot.state,
                    snapshot.peer.as_deref().unwrap_or("-"),
                    snapshot
                        .role
                        .map(|role| role.to_string())
                        .unwrap_or_else(|| "-".into()),
                );
            }
            Ok(ChatCommand::Quit) => break,
            Ok(ChatCommand::Say(content)) => {
                if let Err(err) = link.send(&content).await {
                    println!("! not sent: {err}");
                }
            }
            Ok(ChatCommand::Empty) => {}
            Err(usage) => println!("! {usage}"),
        }
    }

    link.full_disconnect().await;
    printer.abort();
    Ok(())
}

async fn call(link: &PeerLink, peer: &str) {
    match link.initiate(peer).await {
        Ok(()) => println!("calling {peer}..."),
        Err(err) => println!("! cannot call {peer}: {err}"),
    }
}

async fn print_events(mut events: broadcast::Receiver<PeerEvent>) {
    loop {
        match events.recv().await {
            Ok(PeerEvent::StateChanged { peer, state }) => {
                println!("* session {state} ({})", peer.as_deref().unwrap_or("no peer"));
            }
            Ok(PeerEvent::SignalingChanged(status)) => println!("* relay {status}"),
            Ok(PeerEvent::MessageReceived(message)) => {
                println!("<{}> {}", message.sender, message.content);
            }
            Ok(PeerEvent::NegotiationFailed { peer, reason }) => {
                println!("* call with {peer} failed: {reason}");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
