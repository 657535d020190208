//! Remote Command Execution Example
//!
//! Opens an exec channel, reads the command output and closes the channel,
//! all over the scripted in-memory engine so it runs without a server.
//!
//! Usage:
//!   cargo run --example exec_command

use std::sync::Arc;
use std::time::Duration;

use skiff_ssh::engine::testing::ScriptedEngine;
use skiff_ssh::engine::HostKey;
use skiff_ssh::{ChannelSpec, Session, SessionConfig, SessionDelegate, TokioCallbackQueue};

struct Trusting;

impl SessionDelegate for Trusting {
    fn should_trust_host_key(&self, _key: &HostKey) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let engine = ScriptedEngine::new().with_read_data(b"Linux demo 6.1.0 x86_64\n".to_vec());

    let delegate = Arc::new(Trusting);
    let session = Session::new(
        engine,
        "demo.invalid",
        22,
        "deploy",
        SessionConfig::new(),
        &delegate,
        Arc::new(TokioCallbackQueue),
    )?;

    session.connect(Duration::from_secs(10))?;
    session.authenticate_with_password(Box::new(|| Some("secret".to_string())))?;

    let channel = session
        .open_channel(ChannelSpec::Exec {
            command: "uname -a".to_string(),
        })
        .await?;
    println!("channel {} is {}", channel.id(), channel.stage());

    let output = channel.read(4096).await?;
    print!("{}", String::from_utf8_lossy(&output));

    channel.close().await?;
    session.disconnect()?;
    Ok(())
}
