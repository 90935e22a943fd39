//! Client/server transport negotiation.
//!
//! Each side declares whether it requires, tolerates or refuses an encrypted
//! channel; [`negotiate`] maps the pair onto the transport to use. The outcome
//! travels back to the client as a KVP payload carrying the signed server id.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{ResourceError, ResourceResult};
use crate::kvp::{parse_kvp, serialize_kvp, KvpMap};

/// Payload key for the signed server id.
pub const CS_NEG_SID_KW: &str = "cs_neg_sid_kw";
/// Payload key for the negotiation result.
pub const CS_NEG_RESULT_KW: &str = "cs_neg_result_kw";

/// Policy token: encryption is required.
pub const CS_NEG_REQUIRE: &str = "CS_NEG_REQUIRE";
/// Policy token: either transport is acceptable.
pub const CS_NEG_DONT_CARE: &str = "CS_NEG_DONT_CARE";
/// Policy token: encryption is refused.
pub const CS_NEG_REFUSE: &str = "CS_NEG_REFUSE";
/// Result token: use the encrypted transport.
pub const CS_NEG_USE_SSL: &str = "CS_NEG_USE_SSL";
/// Result token: use plain TCP.
pub const CS_NEG_USE_TCP: &str = "CS_NEG_USE_TCP";
/// Result token: the policies are incompatible.
pub const CS_NEG_FAILURE: &str = "CS_NEG_FAILURE";

/// One side's transport policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPolicy {
    /// Encryption is required.
    Require,
    /// Either transport is fine.
    DontCare,
    /// Encryption is refused.
    Refuse,
}

impl NegotiationPolicy {
    /// Wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationPolicy::Require => CS_NEG_REQUIRE,
            NegotiationPolicy::DontCare => CS_NEG_DONT_CARE,
            NegotiationPolicy::Refuse => CS_NEG_REFUSE,
        }
    }
}

impl FromStr for NegotiationPolicy {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            CS_NEG_REQUIRE => Ok(NegotiationPolicy::Require),
            CS_NEG_DONT_CARE => Ok(NegotiationPolicy::DontCare),
            CS_NEG_REFUSE => Ok(NegotiationPolicy::Refuse),
            other => Err(ResourceError::SysInvalidInputParam {
                msg: format!("unknown negotiation policy {other:?}"),
            }),
        }
    }
}

impl fmt::Display for NegotiationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agreed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationResult {
    /// Encrypted channel.
    UseSsl,
    /// Plain TCP.
    UseTcp,
    /// No acceptable transport.
    Failure,
}

impl NegotiationResult {
    /// Wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationResult::UseSsl => CS_NEG_USE_SSL,
            NegotiationResult::UseTcp => CS_NEG_USE_TCP,
            NegotiationResult::Failure => CS_NEG_FAILURE,
        }
    }
}

impl FromStr for NegotiationResult {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            CS_NEG_USE_SSL => Ok(NegotiationResult::UseSsl),
            CS_NEG_USE_TCP => Ok(NegotiationResult::UseTcp),
            CS_NEG_FAILURE => Ok(NegotiationResult::Failure),
            other => Err(ResourceError::SysInvalidInputParam {
                msg: format!("unknown negotiation result {other:?}"),
            }),
        }
    }
}

impl fmt::Display for NegotiationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport for a client and server policy pair.
pub fn negotiate(client: NegotiationPolicy, server: NegotiationPolicy) -> NegotiationResult {
    use NegotiationPolicy::*;
    let result = match (client, server) {
        (Require, Refuse) | (Refuse, Require) => NegotiationResult::Failure,
        (Refuse, _) | (_, Refuse) => NegotiationResult::UseTcp,
        _ => NegotiationResult::UseSsl,
    };
    debug!(%client, %server, %result, "Negotiated transport");
    result
}

/// Like [`negotiate`], from wire tokens.
pub fn negotiate_tokens(client: &str, server: &str) -> ResourceResult<NegotiationResult> {
    Ok(negotiate(client.parse()?, server.parse()?))
}

/// Server reply to a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationPayload {
    /// Server id signed with the zone key.
    pub signed_sid: String,
    /// Agreed transport.
    pub result: NegotiationResult,
}

impl NegotiationPayload {
    /// KVP text with reserved tokens escaped.
    pub fn encode(&self) -> String {
        let mut map = KvpMap::new();
        map.insert(CS_NEG_SID_KW.to_string(), self.signed_sid.clone());
        map.insert(CS_NEG_RESULT_KW.to_string(), self.result.as_str().to_string());
        serialize_kvp(&map, true)
    }

    /// Parses KVP text produced by [`NegotiationPayload::encode`].
    pub fn decode(payload: &str) -> ResourceResult<Self> {
        let map = parse_kvp(payload)?;
        let field = |key: &str| {
            map.get(key).ok_or_else(|| ResourceError::SysInvalidInputParam {
                msg: format!("negotiation payload lacks {key}"),
            })
        };
        Ok(Self {
            signed_sid: field(CS_NEG_SID_KW)?.clone(),
            result: field(CS_NEG_RESULT_KW)?.parse()?,
        })
    }
}
