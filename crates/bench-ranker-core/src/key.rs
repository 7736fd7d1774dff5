use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

/// Blue/green publication state of a ranker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RankerVersion {
    Current,
    Next,
}

impl RankerVersion {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Next => "next",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "current" => Some(Self::Current),
            "next" => Some(Self::Next),
            _ => None,
        }
    }
}

/// Canonical, order-independent form of a run's parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ParamSignature(String);

impl ParamSignature {
    #[must_use]
    pub fn none() -> Self {
        Self(String::new())
    }

    /// Sorts the parameters and joins them with `&`. A parameter may itself
    /// contain `&`; the joined form is only ever compared, never split.
    pub fn from_params<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts = params
            .into_iter()
            .map(|item| item.as_ref().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>();
        parts.sort();
        Self(parts.join("&"))
    }

    /// Wraps an already-canonical signature as stored by a backend.
    #[must_use]
    pub fn from_canonical(raw: &str) -> Self {
        Self(raw.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ParamSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RankerKey {
    pub category: String,
    pub test_key: String,
    pub user_agent_version: String,
    pub params: ParamSignature,
}

impl RankerKey {
    pub fn new(
        category: impl Into<String>,
        test_key: impl Into<String>,
        user_agent_version: impl Into<String>,
        params: ParamSignature,
    ) -> Self {
        Self {
            category: category.into(),
            test_key: test_key.into(),
            user_agent_version: user_agent_version.into(),
            params,
        }
    }

    /// Stable name used for cache entries, e.g. `reflow_testDisplay_Firefox 3`.
    ///
    /// A non-empty parameter signature is folded into a fixed-width digest so
    /// long parameter lists do not blow up the cache key.
    #[must_use]
    pub fn cache_name(&self) -> String {
        let mut name = format!(
            "{}_{}_{}",
            self.category, self.test_key, self.user_agent_version
        );
        if !self.params.is_empty() {
            let digest = Sha256::digest(self.params.as_str().as_bytes());
            let encoded = hex::encode(digest);
            name.push('_');
            name.push_str(&encoded[..32]);
        }
        name
    }
}

impl Display for RankerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.category, self.test_key, self.user_agent_version
        )?;
        if !self.params.is_empty() {
            write!(f, "?{}", self.params)?;
        }
        Ok(())
    }
}

/// Persisted metadata for one ranker key at one version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankerRecord {
    pub record_id: Ulid,
    pub key: RankerKey,
    pub version: RankerVersion,
    pub min_value: i64,
    pub max_value: i64,
    pub branching_factor: u32,
    pub created_at: OffsetDateTime,
}
