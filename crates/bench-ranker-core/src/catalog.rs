use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RankerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestDefinition {
    pub key: String,
    pub name: String,
    pub min_value: i64,
    pub max_value: i64,
}

impl TestDefinition {
    /// True when `score` lies within `[min_value, max_value]`.
    #[must_use]
    pub fn contains(&self, score: i64) -> bool {
        (self.min_value..=self.max_value).contains(&score)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedScore {
    pub key: String,
    pub score: i64,
}

/// All tests of one category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestSet {
    pub category: String,
    pub category_name: String,
    pub tests: Vec<TestDefinition>,
}

impl TestSet {
    /// Looks up a test by key.
    ///
    /// # Errors
    /// Returns [`RankerError::UnknownTest`] when the key is not defined.
    pub fn get_test(&self, test_key: &str) -> Result<&TestDefinition, RankerError> {
        self.tests
            .iter()
            .find(|test| test.key == test_key)
            .ok_or_else(|| RankerError::UnknownTest {
                category: self.category.clone(),
                test_key: test_key.to_string(),
            })
    }

    #[must_use]
    pub fn num_tests(&self) -> usize {
        self.tests.len()
    }

    #[must_use]
    pub fn test_keys(&self) -> Vec<String> {
        let mut keys = self
            .tests
            .iter()
            .map(|test| test.key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Parses a submission string like `test1=time1,test2=time2`.
    ///
    /// # Errors
    /// Returns [`RankerError::MalformedResultsKey`] when the submitted keys
    /// differ from the declared tests and
    /// [`RankerError::MalformedResultsValue`] when a score is not an integer.
    pub fn parse_results(&self, results: &str) -> Result<Vec<ParsedScore>, RankerError> {
        let pairs = results
            .split(',')
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (key.trim().to_string(), value.trim().to_string())
            })
            .collect::<Vec<_>>();

        let mut actual = pairs.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>();
        actual.sort();
        let expected = self.test_keys();
        if actual != expected {
            return Err(RankerError::MalformedResultsKey { expected, actual });
        }

        pairs
            .into_iter()
            .map(|(key, value)| {
                let score = value.parse::<i64>().map_err(|_| {
                    RankerError::MalformedResultsValue(format!("{key}={value}"))
                })?;
                Ok(ParsedScore { key, score })
            })
            .collect()
    }

    fn validate(&self) -> Result<(), RankerError> {
        if self.category.trim().is_empty() {
            return Err(RankerError::Configuration(
                "category MUST be non-empty".to_string(),
            ));
        }
        if self.tests.is_empty() {
            return Err(RankerError::Configuration(format!(
                "category {} MUST define at least one test",
                self.category
            )));
        }
        let mut keys = BTreeSet::new();
        for test in &self.tests {
            if !keys.insert(test.key.as_str()) {
                return Err(RankerError::Configuration(format!(
                    "duplicate test key {} in category {}",
                    test.key, self.category
                )));
            }
            if test.min_value > test.max_value {
                return Err(RankerError::Configuration(format!(
                    "test {} has min_value > max_value",
                    test.key
                )));
            }
        }
        Ok(())
    }
}

/// Ordered list of categories; the rebuild walks them by index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCatalog {
    pub categories: Vec<TestSet>,
}

impl TestCatalog {
    /// Validates category and test definitions.
    ///
    /// # Errors
    /// Returns [`RankerError::Configuration`] for empty catalogs, duplicate
    /// categories or tests, and inverted test bounds.
    pub fn validate(&self) -> Result<(), RankerError> {
        if self.categories.is_empty() {
            return Err(RankerError::Configuration(
                "catalog MUST define at least one category".to_string(),
            ));
        }
        let mut names = BTreeSet::new();
        for test_set in &self.categories {
            if !names.insert(test_set.category.as_str()) {
                return Err(RankerError::Configuration(format!(
                    "duplicate category {}",
                    test_set.category
                )));
            }
            test_set.validate()?;
        }
        Ok(())
    }

    /// Decodes and validates a catalog from JSON.
    ///
    /// # Errors
    /// Returns [`RankerError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, RankerError> {
        let catalog: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RankerError::Configuration(format!("invalid catalog JSON payload: {err}"))
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.categories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TestSet> {
        self.categories.get(index)
    }

    #[must_use]
    pub fn test_set(&self, category: &str) -> Option<&TestSet> {
        self.categories
            .iter()
            .find(|test_set| test_set.category == category)
    }

    /// Resolves a test through its category.
    ///
    /// # Errors
    /// Returns [`RankerError::UnknownTest`] when either the category or the
    /// test is not defined.
    pub fn get_test(&self, category: &str, test_key: &str) -> Result<&TestDefinition, RankerError> {
        self.test_set(category)
            .ok_or_else(|| RankerError::UnknownTest {
                category: category.to_string(),
                test_key: test_key.to_string(),
            })?
            .get_test(test_key)
    }

    /// The reflow timing suite.
    #[must_use]
    pub fn builtin() -> Self {
        let tests = [
            ("testDisplay", "Display Block"),
            ("testVisibility", "Visiblility None"),
            ("testNonMatchingClass", "Non Matching Class"),
            ("testFourClassReflows", "Four Reflows by Class"),
            ("testFourScriptReflows", "Four Reflows by Script"),
            ("testTwoScriptReflows", "Two Reflows by Script"),
            ("testPaddingPx", "Padding px"),
            ("testPaddingLeftPx", "Padding Left px"),
            ("testFontSizeEm", "Font Size em"),
            ("testWidthPercent", "Width %"),
            ("testBackground", "Background Color"),
            ("testOverflowHidden", "Overflow Hidden"),
            ("testSelectorMatchTime", "Selector Match Time"),
            ("testGetOffsetHeight", "Do Nothing / OffsetHeight"),
        ]
        .into_iter()
        .map(|(key, name)| TestDefinition {
            key: key.to_string(),
            name: name.to_string(),
            min_value: 0,
            max_value: 60_000,
        })
        .collect();

        Self {
            categories: vec![TestSet {
                category: "reflow".to_string(),
                category_name: "Reflow".to_string(),
                tests,
            }],
        }
    }
}
