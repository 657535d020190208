//! SFTP Operations Walkthrough
//!
//! This example drives a session through connect, password authentication
//! and a tour of the SFTP path operations, using the scripted in-memory
//! engine so it runs without a real server.
//!
//! Key features:
//! - Host key verification through a delegate
//! - Awaited path operations (mkdir, stat, rename, readlink)
//! - Queued requests with completion callbacks and cancellation
//!
//! Usage:
//!   cargo run --example sftp_tour

use std::sync::Arc;
use std::time::Duration;

use skiff_ssh::engine::testing::ScriptedEngine;
use skiff_ssh::engine::HostKey;
use skiff_ssh::{
    Session, SessionConfig, SessionDelegate, SftpCallbacks, SftpOperation, SkiffError,
    TokioCallbackQueue,
};

struct PrintingDelegate;

impl SessionDelegate for PrintingDelegate {
    fn should_trust_host_key(&self, key: &HostKey) -> bool {
        println!("host key: {} {}", key.kind, key.fingerprint());
        true
    }

    fn on_authenticated(&self, username: &str) {
        println!("authenticated as {username}");
    }

    fn on_disconnected(&self, error: Option<&SkiffError>) {
        match error {
            Some(error) => println!("disconnected: {error}"),
            None => println!("disconnected"),
        }
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

    let delegate = Arc::new(PrintingDelegate);
    let session = Session::new(
        ScriptedEngine::new(),
        "demo.invalid",
        22,
        "deploy",
        SessionConfig::new(),
        &delegate,
        Arc::new(TokioCallbackQueue),
    )?;

    session.connect(Duration::from_secs(10))?;
    session.authenticate_with_password(Box::new(|| Some("secret".to_string())))?;

    let sftp = session.open_sftp_channel().await?;

    // Awaited operations resolve with the result directly.
    sftp.mkdir("/upload").await?;
    println!("created /upload");
    sftp.rename("/upload", "/incoming").await?;
    println!("renamed to /incoming");

    let attributes = sftp.stat("/incoming").await?;
    println!("stat: {:?}", attributes.attributes());
    sftp.free_attributes(attributes).await?;

    println!("canonical: {}", sftp.canonicalize("notes.txt").await?);
    println!("exists: {:?}", sftp.file_exists("/etc/hosts").await);

    // Queued requests deliver through callbacks instead.
    let request = sftp.enqueue(
        SftpOperation::Chmod {
            path: "/incoming".to_string(),
            mode: 0o700,
        },
        SftpCallbacks::new()
            .on_success(|_| println!("chmod request succeeded"))
            .on_failure(|error| println!("chmod request failed: {error}")),
    )?;
    println!("queued request {}", request.id());

    // A request cancelled before the worker reaches it never fires its
    // success or failure callback.
    let doomed = sftp.enqueue(
        SftpOperation::Unlink {
            path: "/incoming/never".to_string(),
        },
        SftpCallbacks::new().on_cancelled(|| println!("unlink request cancelled")),
    )?;
    doomed.cancel();

    sftp.close().await?;
    session.disconnect()?;

    // Give the callback queue a moment to flush before exiting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
