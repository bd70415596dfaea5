//! Single-core watch mode: follow one core and print what it reports.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use poolwatch_client::CoreConnector;
use poolwatch_types::{HealthCheckConfig, Message, Payload};
use tokio_util::sync::CancellationToken;

use crate::broadcast::Subscription;
use crate::credentials::{Credential, CredentialStore};
use crate::manager::{CoreManager, CoreSpec};

const CREDENTIAL_NAME: &str = "watch";

/// Messages held for the terminal before it counts as lagging.
const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// `host:port` of the core.
    pub addr: String,
    pub interval: String,
    /// PEM file to trust; plain TCP when absent.
    pub cert_path: Option<PathBuf>,
    pub health_check: HealthCheckConfig,
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_address(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("address {:?} is missing a port", addr))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in address {:?}", addr))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(anyhow!("address {:?} is missing a host", addr));
    }
    Ok((host.to_string(), port))
}

/// Text printed for one message.
pub fn render(message: &Message) -> String {
    match &message.payload {
        Payload::Metrics(snapshot) => format!("[{}] metrics\n{}\n", message.name, snapshot),
        Payload::Events(batch) => batch
            .iter()
            .map(|log| format!("[{}] {}\n", message.name, log))
            .collect(),
    }
}

/// Watch one core until `shutdown` fires, writing every message to `out`.
pub async fn run<W: Write>(
    options: WatchOptions,
    connector: Arc<dyn CoreConnector>,
    mut out: W,
    shutdown: CancellationToken,
) -> Result<()> {
    let (host, port) = split_address(&options.addr)?;

    let credential = match &options.cert_path {
        Some(path) => {
            writeln!(out, "[-]Using credential '{}'.", path.display())?;
            Credential::tls(CREDENTIAL_NAME, path.clone())
        }
        None => {
            writeln!(out, "[!]Ignore credential.")?;
            Credential::insecure(CREDENTIAL_NAME)
        }
    };

    let manager = CoreManager::new(CredentialStore::new([credential]), connector)
        .with_health_check(options.health_check);
    let subscription = manager.subscribe(SUBSCRIPTION_BUFFER);

    manager.add_core(CoreSpec::new(
        options.addr.clone(),
        host,
        port,
        options.interval.clone(),
        CREDENTIAL_NAME,
    ))?;
    writeln!(out, "[-]Receiving from {} every {}", options.addr, options.interval)?;
    out.flush()?;

    let printed = print_messages(subscription, &mut out, &shutdown).await;
    manager.shutdown().await;
    printed
}

/// Print until `shutdown` fires. Losing the subscription is an error: it
/// only happens when output falls too far behind.
async fn print_messages<W: Write>(
    mut subscription: Subscription,
    out: &mut W,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            message = subscription.recv() => message,
        };
        let Some(message) = message else {
            tracing::warn!(subscriber = %subscription.id(), "Output lagged, subscription dropped");
            return Err(anyhow!("output fell behind, subscription dropped"));
        };
        out.write_all(render(&message).as_bytes())?;
        out.flush()?;
    }
}
