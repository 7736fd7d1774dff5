//! Browser version hierarchy expansion.

/// Expands a pretty browser string into the chain of rankable versions, most
/// general first: `"Safari 4.3"` becomes `["Safari", "Safari 4", "Safari 4.3"]`.
pub trait VersionHierarchy {
    fn expand(&self, pretty: &str) -> Vec<String>;
}

impl<F> VersionHierarchy for F
where
    F: Fn(&str) -> Vec<String>,
{
    fn expand(&self, pretty: &str) -> Vec<String> {
        self(pretty)
    }
}

/// Hierarchy derived from `family v1.v2.v3` pretty strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyVersionHierarchy;

impl VersionHierarchy for PrettyVersionHierarchy {
    fn expand(&self, pretty: &str) -> Vec<String> {
        let parts = VersionParts::parse(pretty);
        parts.string_list()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct VersionParts {
    family: String,
    v1: Option<String>,
    v2: Option<String>,
    v3: Option<String>,
}

impl VersionParts {
    fn parse(pretty: &str) -> Self {
        let Some((family, version)) = pretty.rsplit_once(' ') else {
            return Self {
                family: pretty.to_string(),
                ..Self::default()
            };
        };
        if family.is_empty() {
            return Self {
                family: version.to_string(),
                ..Self::default()
            };
        }

        let mut bits = version.split('.');
        let v1 = bits.next().unwrap_or_default();
        if !is_numeric(v1) {
            return Self {
                family: pretty.to_string(),
                ..Self::default()
            };
        }

        let mut parts = Self {
            family: family.to_string(),
            v1: Some(v1.to_string()),
            ..Self::default()
        };

        if let Some(v2) = bits.next() {
            if is_numeric(v2) {
                parts.v2 = Some(v2.to_string());
                parts.v3 = bits.next().map(str::to_string);
            } else {
                // "6b1" splits into a numeric minor and a suffix patch ("b1").
                let split = v2
                    .char_indices()
                    .find(|(_, ch)| !ch.is_ascii_digit())
                    .map_or(v2.len(), |(index, _)| index);
                let (minor, suffix) = v2.split_at(split);
                parts.v2 = Some(minor.to_string());
                parts.v3 = Some(suffix.to_string());
            }
        }

        parts.v2 = parts.v2.filter(|value| !value.is_empty());
        parts.v3 = parts.v3.filter(|value| !value.is_empty());
        parts
    }

    fn pretty(&self, depth: usize) -> String {
        let v1 = self.v1.as_deref().unwrap_or_default();
        let v2 = self.v2.as_deref().unwrap_or_default();
        match (depth, self.v3.as_deref()) {
            (0, _) => self.family.clone(),
            (1, _) => format!("{} {v1}", self.family),
            (2, _) | (_, None) => format!("{} {v1}.{v2}", self.family),
            (_, Some(v3)) if v3.starts_with(|ch: char| ch.is_ascii_digit()) => {
                format!("{} {v1}.{v2}.{v3}", self.family)
            }
            (_, Some(v3)) => format!("{} {v1}.{v2}{v3}", self.family),
        }
    }

    fn string_list(&self) -> Vec<String> {
        let mut list = Vec::new();
        if self.family.is_empty() {
            return list;
        }
        list.push(self.pretty(0));
        if self.v1.is_some() {
            list.push(self.pretty(1));
            if self.v2.is_some() {
                list.push(self.pretty(2));
                if self.v3.is_some() {
                    list.push(self.pretty(3));
                }
            }
        }
        list
    }
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit())
}
