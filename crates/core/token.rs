//! Job token wire format: `name^^id^^payload`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FleetError, Result};

/// Separator between the parts of a job token. Job names and ids must not
/// contain it.
pub const SEPARATOR: &str = "^^";

/// Optional structured job payload.
///
/// Encodes to compact JSON, or to the empty string when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Option<Value>);

impl Payload {
    /// A payload carrying no data.
    pub fn none() -> Self {
        Self(None)
    }

    /// Serialize any value into a payload.
    pub fn new<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(Some(serde_json::to_value(value)?)))
    }

    /// Borrow the raw JSON value.
    pub fn value(&self) -> Option<&Value> {
        self.0.as_ref()
    }

    /// Take the raw JSON value.
    pub fn into_value(self) -> Option<Value> {
        self.0
    }

    /// Whether the payload carries no data.
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Deserialize the payload into `T`. An absent payload yields `None`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.0 {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    /// Wire form: compact JSON or `""`.
    pub fn encode(&self) -> Result<String> {
        match &self.0 {
            Some(value) => Ok(serde_json::to_string(value)?),
            None => Ok(String::new()),
        }
    }

    /// Parse the wire form produced by [`encode`](Self::encode).
    pub fn parse(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Ok(Self(None));
        }
        Ok(Self(Some(serde_json::from_str(text)?)))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self(Some(value))
    }
}

impl From<Option<Value>> for Payload {
    fn from(value: Option<Value>) -> Self {
        Self(value)
    }
}

/// A decoded job token.
#[derive(Debug, Clone, PartialEq)]
pub struct JobToken {
    /// Handler name.
    pub name: String,
    /// Caller supplied job id.
    pub id: String,
    /// Job payload.
    pub payload: Payload,
}

impl JobToken {
    /// Create a token.
    pub fn new(name: impl Into<String>, id: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            payload,
        }
    }

    /// Serialize into the string stored in the queue lists.
    pub fn encode(&self) -> Result<String> {
        Ok(format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.name,
            self.id,
            self.payload.encode()?
        ))
    }

    /// Split a stored token. The payload part may itself contain the
    /// separator; the name and id may not.
    pub fn parse(token: &str) -> Result<Self> {
        let mut parts = token.splitn(3, SEPARATOR);
        let (Some(name), Some(id), Some(payload)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(FleetError::InvalidToken(token.to_string()));
        };

        Ok(Self {
            name: name.to_string(),
            id: id.to_string(),
            payload: Payload::parse(payload)?,
        })
    }
}
