//! Status command implementation

use anyhow::Result;

use rde_core::AgentId;

use crate::client::{agent_status, Server};
use crate::output::print_error;

/// Print the broker's record for `agent_id`
pub async fn status_command(server: &Server, token: &str, agent_id: &AgentId) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let status = match agent_status(&http, server, token, agent_id).await {
        Ok(status) => status,
        Err(e) => {
            print_error(&format!("Failed to get status of {}: {}", agent_id, e));
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
