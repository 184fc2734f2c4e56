use anyhow::{anyhow, bail, Result};
use tokio::signal;
use tracing::{debug, info};

use crate::cli::output::print_event;
use crate::cli::Commands;
use portbridge::Coordinator;
use portbridge::events::{Event, EventReceiver};
use portbridge::network::Protocol;

pub async fn handle_command(
    coordinator: &Coordinator,
    events: &mut EventReceiver,
    command: Commands,
    json: bool,
) -> Result<()> {
    match command {
        Commands::Discover => {
            coordinator.discover();
            expect_success(wait_for_terminal(events, json).await?)?;
        }
        Commands::List => {
            connect(coordinator, events, json).await?;
            coordinator.list_mappings();
            expect_success(wait_for_terminal(events, json).await?)?;
        }
        Commands::Add { external_port, internal_ip, internal_port, protocol, description } => {
            connect(coordinator, events, json).await?;
            coordinator.add_mapping(external_port, &internal_ip, internal_port, protocol, &description)?;
            expect_success(wait_for_terminal(events, json).await?)?;
        }
        Commands::Remove { external_port, protocol } => {
            connect(coordinator, events, json).await?;
            coordinator.remove_mapping(external_port, protocol)?;
            expect_success(wait_for_terminal(events, json).await?)?;
        }
        Commands::Check { external_port, protocol } => {
            connect(coordinator, events, json).await?;
            coordinator.check_port(external_port, protocol)?;
            expect_success(wait_for_terminal(events, json).await?)?;
        }
        Commands::Scan => {
            coordinator.scan_subnet();
            expect_success(wait_for_terminal(events, json).await?)?;
        }
        Commands::Test { ip, port } => {
            // The mapping part of the test is skipped without a gateway
            coordinator.discover();
            wait_for_terminal(events, json).await?;
            coordinator.test_connection(&ip, port)?;
            expect_success(wait_for_terminal(events, json).await?)?;
        }
        Commands::Relay { listen_port, target_ip, target_port } => {
            coordinator.start_relay(listen_port, &target_ip, target_port)?;
            expect_success(wait_for_terminal(events, json).await?)?;
            serve_until_interrupted(coordinator, events, json).await?;
        }
        Commands::Forward { external_port, target_ip, target_port } => {
            connect(coordinator, events, json).await?;
            coordinator.forward(external_port, &target_ip, target_port, Protocol::Tcp)?;
            expect_success(wait_for_terminal(events, json).await?)?;
            serve_until_interrupted(coordinator, events, json).await?;
        }
        Commands::Addresses => {
            let choices = coordinator.address_choices().await;
            if json {
                println!("{}", serde_json::to_string(&choices)?);
            } else {
                for ip in choices {
                    println!("{}", ip);
                }
            }
        }
    }

    Ok(())
}

/// Print events until one ends the current operation, and return that one
async fn wait_for_terminal(events: &mut EventReceiver, json: bool) -> Result<Event> {
    while let Some(event) = events.recv().await {
        print_event(&event, json);
        if event.is_terminal() {
            return Ok(event);
        }
    }
    Err(anyhow!("Event channel closed before the operation finished"))
}

fn expect_success(event: Event) -> Result<()> {
    match event {
        Event::DiscoveryFailed { reason } => bail!("Discovery failed: {}", reason),
        Event::OperationFailed { message, .. } => bail!(message),
        _ => Ok(()),
    }
}

async fn connect(coordinator: &Coordinator, events: &mut EventReceiver, json: bool) -> Result<()> {
    coordinator.discover();
    match wait_for_terminal(events, json).await? {
        Event::DiscoverySucceeded { .. } => Ok(()),
        other => expect_success(other).and_then(|_| Err(anyhow!("No UPnP gateway available"))),
    }
}

/// Keep relays running and print their events until Ctrl+C
async fn serve_until_interrupted(coordinator: &Coordinator, events: &mut EventReceiver, json: bool) -> Result<()> {
    if !json {
        println!("Relaying. Press Ctrl+C to stop.");
    }

    let interrupted = signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            result = &mut interrupted => {
                result?;
                info!("Interrupted, stopping relays");
                break;
            }
            event = events.recv() => match event {
                Some(event) => print_event(&event, json),
                None => break,
            },
        }
    }

    coordinator.stop_all_relays().await;
    for event in events.drain() {
        print_event(&event, json);
    }
    debug!("All relays stopped");
    Ok(())
}
