use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::key::ParamSignature;
use crate::RankerError;

/// One measured test inside a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreRecord {
    pub test_key: String,
    pub score: i64,
    pub dirty: bool,
}

/// One benchmark run and its scores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeasurementGroup {
    pub group_id: Ulid,
    pub category: String,
    pub user_agent_pretty: String,
    pub params: ParamSignature,
    pub created_at: OffsetDateTime,
    pub scores: Vec<ScoreRecord>,
}

impl MeasurementGroup {
    pub fn clean_scores(&self) -> impl Iterator<Item = &ScoreRecord> {
        self.scores.iter().filter(|record| !record.dirty)
    }

    pub fn dirty_scores(&self) -> impl Iterator<Item = &ScoreRecord> {
        self.scores.iter().filter(|record| record.dirty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeasurementGroupInput {
    pub group_id: Option<Ulid>,
    pub category: String,
    pub user_agent_pretty: String,
    pub params: ParamSignature,
    /// `(test_key, score)` pairs; stored dirty until the live path folds them in.
    pub scores: Vec<(String, i64)>,
}

impl MeasurementGroupInput {
    /// Validates a group before it is stored.
    ///
    /// # Errors
    /// Returns [`RankerError::Validation`] for an empty category or browser
    /// string and for repeated test keys.
    pub fn validate(&self) -> Result<(), RankerError> {
        if self.category.trim().is_empty() {
            return Err(RankerError::Validation(
                "category MUST be provided".to_string(),
            ));
        }
        if self.user_agent_pretty.trim().is_empty() {
            return Err(RankerError::Validation(
                "user_agent_pretty MUST be provided".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for (test_key, _) in &self.scores {
            if !seen.insert(test_key.as_str()) {
                return Err(RankerError::Validation(format!(
                    "duplicate score for test {test_key}"
                )));
            }
        }
        Ok(())
    }
}

/// Resumption point in the (browser pretty, group id) order of a category scan.
///
/// A scan resumed from a cursor starts strictly after the group it names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor {
    pub user_agent_pretty: String,
    pub group_id: Ulid,
}

#[derive(Serialize, Deserialize)]
struct CursorWire {
    ua: String,
    id: Ulid,
}

impl Cursor {
    #[must_use]
    pub fn after(group: &MeasurementGroup) -> Self {
        Self {
            user_agent_pretty: group.user_agent_pretty.clone(),
            group_id: group.group_id,
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        let wire = CursorWire {
            ua: self.user_agent_pretty.clone(),
            id: self.group_id,
        };
        // Serializing a struct of a string and a ULID cannot fail.
        let json = serde_json::to_vec(&wire).unwrap_or_default();
        hex::encode(json)
    }

    /// Decodes a token produced by [`Cursor::encode`].
    ///
    /// # Errors
    /// Returns [`RankerError::Validation`] when the token is not a cursor.
    pub fn decode(token: &str) -> Result<Self, RankerError> {
        let bytes = hex::decode(token)
            .map_err(|err| RankerError::Validation(format!("invalid bookmark encoding: {err}")))?;
        let wire: CursorWire = serde_json::from_slice(&bytes)
            .map_err(|err| RankerError::Validation(format!("invalid bookmark payload: {err}")))?;
        Ok(Self {
            user_agent_pretty: wire.ua,
            group_id: wire.id,
        })
    }
}

impl TryFrom<String> for Cursor {
    type Error = RankerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

impl From<Cursor> for String {
    fn from(value: Cursor) -> Self {
        value.encode()
    }
}

/// One page of a category scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    pub groups: Vec<MeasurementGroup>,
    /// Cursor after the last returned group, or `None` when the scan is exhausted.
    pub next_cursor: Option<Cursor>,
}
