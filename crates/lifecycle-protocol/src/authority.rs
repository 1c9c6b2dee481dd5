//! Authority levels and actors.
//!
//! Three levels exist: `observer` (read-only), `executor` (may drive
//! pipeline stages) and `human` (sole authority for approvals, clearing
//! failures and confirming completion).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Authority level carried by an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    Observer,
    Executor,
    Human,
}

impl Authority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authority::Observer => "observer",
            Authority::Executor => "executor",
            Authority::Human => "human",
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Authority {
    type Err = ActorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observer" => Ok(Authority::Observer),
            "executor" => Ok(Authority::Executor),
            "human" => Ok(Authority::Human),
            other => Err(ActorParseError::UnknownAuthority(other.to_string())),
        }
    }
}

/// Errors building an actor from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorParseError {
    #[error("unknown authority level '{0}' (expected observer, executor or human)")]
    UnknownAuthority(String),

    #[error("invalid actor id '{0}': must be 1-64 chars of [A-Za-z0-9._@-]")]
    InvalidId(String),
}

/// The principal issuing a command.
///
/// Ids read off the wire are validated the same way as [`Actor::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawActor")]
pub struct Actor {
    /// Stable identifier (user name, service name)
    pub id: String,

    /// Authority level claimed by the caller
    pub authority: Authority,

    /// Human principal an executor is acting for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_behalf_of: Option<String>,
}

impl Actor {
    /// Create an actor after validating its identifier.
    pub fn new(id: impl Into<String>, authority: Authority) -> Result<Self, ActorParseError> {
        let id = id.into();
        validate_actor_id(&id)?;
        Ok(Self {
            id,
            authority,
            on_behalf_of: None,
        })
    }

    pub fn human(id: &str) -> Self {
        Self {
            id: id.to_string(),
            authority: Authority::Human,
            on_behalf_of: None,
        }
    }

    pub fn observer(id: &str) -> Self {
        Self {
            id: id.to_string(),
            authority: Authority::Observer,
            on_behalf_of: None,
        }
    }

    /// An executor acting for the named human.
    pub fn executor_for(id: &str, human: &str) -> Self {
        Self {
            id: id.to_string(),
            authority: Authority::Executor,
            on_behalf_of: Some(human.to_string()),
        }
    }

    /// Attach the human principal this actor works for.
    pub fn on_behalf_of(mut self, human: impl Into<String>) -> Result<Self, ActorParseError> {
        let human = human.into();
        validate_actor_id(&human)?;
        self.on_behalf_of = Some(human);
        Ok(self)
    }

    /// Whether the actor carries human-initiated executor authority.
    pub fn is_human_initiated_executor(&self) -> bool {
        self.authority == Authority::Executor && self.on_behalf_of.is_some()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawActor {
    id: String,
    authority: Authority,
    #[serde(default)]
    on_behalf_of: Option<String>,
}

impl TryFrom<RawActor> for Actor {
    type Error = ActorParseError;

    fn try_from(raw: RawActor) -> Result<Self, Self::Error> {
        let actor = Actor::new(raw.id, raw.authority)?;
        match raw.on_behalf_of {
            Some(human) => actor.on_behalf_of(human),
            None => Ok(actor),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.on_behalf_of {
            Some(human) => write!(f, "{}({}) for {}", self.id, self.authority, human),
            None => write!(f, "{}({})", self.id, self.authority),
        }
    }
}

fn validate_actor_id(id: &str) -> Result<(), ActorParseError> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ActorParseError::InvalidId(id.to_string()))
    }
}

/// Authority a command demands of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Any actor, including observers
    Observer,
    /// Executor or human
    Operator,
    /// Executor acting on behalf of a named human
    ExecutorForHuman,
    /// Human only
    Human,
}

impl Requirement {
    pub fn permits(&self, actor: &Actor) -> bool {
        match self {
            Requirement::Observer => true,
            Requirement::Operator => {
                matches!(actor.authority, Authority::Executor | Authority::Human)
            }
            Requirement::ExecutorForHuman => actor.is_human_initiated_executor(),
            Requirement::Human => actor.authority == Authority::Human,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Requirement::Observer => "observer",
            Requirement::Operator => "executor or human",
            Requirement::ExecutorForHuman => "executor+human",
            Requirement::Human => "human",
        }
    }
}
