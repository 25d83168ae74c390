//! Inbound command validation.
//!
//! Raw commands pushed by the control plane are untrusted. A command is only
//! turned into a [`CommandEnvelope`] after it passes, in order: the UTF-8
//! byte ceiling, the nesting-depth bound, case-insensitive parsing, the node
//! and organization checks, and the expiry check. Rejections are returned as
//! [`CommandRejection`] for the caller to log and drop.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fleetlink_protocol::constants::{
    KNOWN_COMMAND_TYPES, MAX_COMMAND_DEPTH, MAX_COMMAND_PAYLOAD_BYTES, MAX_COMMAND_TYPE_LEN,
    UNKNOWN_COMMAND_TYPE,
};
use fleetlink_protocol::messages::CommandEnvelope;
use serde_json::Value;
use uuid::Uuid;

use crate::types::AgentIdentity;

/// Reason an inbound command was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandRejection {
    #[error("payload of {0} bytes exceeds the size limit")]
    TooLarge(usize),

    #[error("JSON nesting exceeds the depth limit")]
    TooDeep,

    #[error("command is null")]
    Null,

    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("field {0:?} appears more than once ignoring case")]
    AmbiguousField(String),

    #[error("command addressed to another node")]
    NodeMismatch,

    #[error("command has an empty organization id")]
    MissingOrganization,

    #[error("command addressed to another organization")]
    OrganizationMismatch,

    #[error("command expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Validates a raw command against the agent's identity at time `now`.
pub fn validate_command(
    raw: &str,
    identity: &AgentIdentity,
    now: DateTime<Utc>,
) -> Result<CommandEnvelope, CommandRejection> {
    // str::len is the UTF-8 byte length, not the character count.
    if raw.len() > MAX_COMMAND_PAYLOAD_BYTES {
        return Err(CommandRejection::TooLarge(raw.len()));
    }
    if exceeds_depth(raw, MAX_COMMAND_DEPTH) {
        return Err(CommandRejection::TooDeep);
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|e| CommandRejection::Malformed(e.to_string()))?;
    let command = parse_envelope(value)?;

    if let Some(node_id) = identity.node_id
        && command.node_id != node_id
    {
        return Err(CommandRejection::NodeMismatch);
    }

    if let Some(organization_id) = identity.organization_id {
        if command.organization_id.is_nil() {
            return Err(CommandRejection::MissingOrganization);
        }
        if command.organization_id != organization_id {
            return Err(CommandRejection::OrganizationMismatch);
        }
    }

    if let Some(expires_at) = command.expires_at
        && command.is_expired(now)
    {
        return Err(CommandRejection::Expired(expires_at));
    }

    Ok(command)
}

/// Maps a command type onto the fixed allow-list used for metric labels.
///
/// Empty, overlong and unrecognised types all collapse into
/// [`UNKNOWN_COMMAND_TYPE`], so the label set stays bounded whatever the
/// control plane sends.
pub fn sanitize_command_type(command_type: &str) -> &'static str {
    if command_type.is_empty() || command_type.len() > MAX_COMMAND_TYPE_LEN {
        return UNKNOWN_COMMAND_TYPE;
    }
    KNOWN_COMMAND_TYPES
        .iter()
        .copied()
        .find(|known| known.eq_ignore_ascii_case(command_type))
        .unwrap_or(UNKNOWN_COMMAND_TYPE)
}

/// Returns `true` if `raw` nests objects/arrays deeper than `max`.
///
/// Brackets inside string literals are ignored.
fn exceeds_depth(raw: &str, max: usize) -> bool {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for b in raw.bytes() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > max {
                    return true;
                }
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    false
}

/// Builds an envelope from a parsed document, matching top-level field
/// names without regard to ASCII case.
fn parse_envelope(value: Value) -> Result<CommandEnvelope, CommandRejection> {
    let map = match value {
        Value::Object(map) => map,
        Value::Null => return Err(CommandRejection::Null),
        _ => return Err(CommandRejection::Malformed("expected a JSON object".into())),
    };

    let mut fields: HashMap<String, Value> = HashMap::with_capacity(map.len());
    for (key, v) in map {
        let lower = key.to_ascii_lowercase();
        if fields.insert(lower, v).is_some() {
            return Err(CommandRejection::AmbiguousField(key));
        }
    }

    let command_id = take_uuid(&mut fields, "commandid")?
        .ok_or_else(|| CommandRejection::Malformed("missing commandId".into()))?;
    let command_type = match fields.remove("commandtype") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(_) => {
            return Err(CommandRejection::Malformed(
                "commandType must be a string".into(),
            ));
        }
    };
    let node_id = take_uuid(&mut fields, "nodeid")?.unwrap_or_default();
    let organization_id = take_uuid(&mut fields, "organizationid")?.unwrap_or_default();
    let expires_at = match fields.remove("expiresat") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value::<DateTime<Utc>>(v)
                .map_err(|_| CommandRejection::Malformed("invalid expiresAt".into()))?,
        ),
    };
    let payload = fields.remove("payload").unwrap_or(Value::Null);

    Ok(CommandEnvelope {
        command_id,
        command_type,
        node_id,
        organization_id,
        expires_at,
        payload,
    })
}

fn take_uuid(
    fields: &mut HashMap<String, Value>,
    name: &str,
) -> Result<Option<Uuid>, CommandRejection> {
    match fields.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Uuid::parse_str(&s)
            .map(Some)
            .map_err(|_| CommandRejection::Malformed(format!("{name} is not a UUID"))),
        Some(_) => Err(CommandRejection::Malformed(format!(
            "{name} must be a string"
        ))),
    }
}
