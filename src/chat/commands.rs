// Command handler for the mochat CLI

use crate::chat::cli::{MochatCommand, ServeArgs};
use crate::chat::gate::hash_secret;
use crate::chat::server;
use anyhow::{Context, Result};

/// Execute a mochat command
pub async fn execute_command(command: MochatCommand) -> Result<()> {
    match command {
        MochatCommand::Serve(args) => handle_serve(args).await,
        MochatCommand::HashCode { code, salt } => handle_hash_code(&code, &salt),
    }
}

async fn handle_serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config().context("Invalid configuration")?;
    server::run(config).await
}

fn handle_hash_code(code: &str, salt: &str) -> Result<()> {
    if salt.is_empty() {
        tracing::warn!("Hashing with an empty salt");
    }
    let hash = hash_secret(code.trim(), salt).context("Failed to hash secret code")?;
    println!("{}", hash);
    Ok(())
}
