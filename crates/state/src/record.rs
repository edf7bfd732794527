//! Application records: ordered, named fields emitted by the upstream source.

use serde::{Deserialize, Serialize};

/// An immutable, ordered set of named string fields (e.g. `word`, `count`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: append a field. A repeated name shadows the earlier one.
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((name.into(), value.to_string()));
        self
    }

    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }

    /// Value of the last field named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_last_wins() {
        let r = Record::new().with("word", "storm").with("count", 1).with("count", 2);
        assert_eq!(r.get("word"), Some("storm"));
        assert_eq!(r.get("count"), Some("2"));
        assert_eq!(r.get("missing"), None);
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn test_serde_keeps_field_order() {
        let r = Record::from_pairs([("word", "needs"), ("count", "1")]);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"fields":[["word","needs"],["count","1"]]}"#);
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
