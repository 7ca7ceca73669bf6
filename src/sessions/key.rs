//! Session key derivation
//!
//! A session key binds agent, channel, account and peer:
//! `agent:<agentId>:<channel>:<accountId|default>:<peer>`. Keys are
//! lowercased so the same conversation always maps to one record.

/// Account segment used when the channel has a single account
pub const DEFAULT_ACCOUNT: &str = "default";

/// Agent used when none is given
pub const DEFAULT_AGENT: &str = "main";

const PREFIX: &str = "agent";

/// Build the stable session key for an inbound conversation
pub fn session_key(agent_id: &str, channel: &str, account_id: Option<&str>, peer: &str) -> String {
    let account = account_id
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or(DEFAULT_ACCOUNT);
    format!(
        "{}:{}:{}:{}:{}",
        PREFIX,
        normalize(agent_id),
        normalize(channel),
        normalize(account),
        normalize(peer)
    )
}

/// Extract the agent id from a session key, if it has the agent prefix
pub fn agent_id_from_key(key: &str) -> Option<&str> {
    let mut parts = key.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(PREFIX), Some(agent), Some(_)) if !agent.is_empty() => Some(agent),
        _ => None,
    }
}

/// Validate an agent id so it can be used as a directory name
pub fn is_valid_agent_id(agent_id: &str) -> bool {
    !agent_id.is_empty()
        && agent_id.len() <= 64
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn normalize(part: &str) -> String {
    part.trim().to_lowercase()
}
