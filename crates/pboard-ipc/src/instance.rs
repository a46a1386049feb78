use std::io;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of the single-instance check.
///
/// The IPC port doubles as the instance lock: whoever holds the bind is the
/// primary instance, and a second launch finds the port taken.
pub enum InstanceGate {
    /// This process won the bind and must serve the IPC bridge on it.
    Primary(TcpListener),
    /// Another instance already holds the port.
    AlreadyRunning,
}

/// Try to become the primary instance by binding the loopback IPC port.
pub async fn acquire_instance(port: u16) -> io::Result<InstanceGate> {
    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => {
            info!(port, "bound IPC port; running as primary instance");
            Ok(InstanceGate::Primary(listener))
        }
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Ok(InstanceGate::AlreadyRunning),
        Err(err) => Err(err),
    }
}

/// Hand a deep-link URL to the primary instance, then the caller exits.
///
/// Used by a rejected second launch that was started by the OS to deliver a
/// custom-scheme URL.
pub async fn forward_deep_link(port: u16, url: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(FORWARD_TIMEOUT)
        .build()?;
    let response = client
        .post(format!("http://127.0.0.1:{port}/ipc/deep-link"))
        .json(&json!({ "url": url }))
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!(
            "primary instance rejected forwarded deep link: {}",
            response.status()
        );
    }
    info!(%url, "forwarded deep link to primary instance");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_bind_wins_and_second_is_rejected() {
        // Grab an ephemeral port, keep it held, and race a second acquire.
        let holder = match acquire_instance(0).await.unwrap() {
            InstanceGate::Primary(listener) => listener,
            InstanceGate::AlreadyRunning => panic!("ephemeral bind cannot lose"),
        };
        let port = holder.local_addr().unwrap().port();

        match acquire_instance(port).await.unwrap() {
            InstanceGate::AlreadyRunning => {}
            InstanceGate::Primary(_) => panic!("second bind should have been rejected"),
        }

        // Releasing the port lets the next launch become primary.
        drop(holder);
        match acquire_instance(port).await.unwrap() {
            InstanceGate::Primary(_) => {}
            InstanceGate::AlreadyRunning => panic!("released port should be bindable"),
        }
    }
}
