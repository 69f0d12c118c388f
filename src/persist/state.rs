//! Hierarchical key/value state documents.
//!
//! Persisted state is an ordered list of tagged nodes. A node carries either
//! a scalar value or a nested level. Scalars are written with `Display` so
//! floating point values survive a round trip exactly.

use std::fmt::Display;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::tags::StateTag;
use super::{PersistError, RestoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateNode {
    #[serde(rename = "t")]
    pub tag: String,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<StateNode>>,
}

impl StateNode {
    pub fn tag(&self) -> Option<StateTag> {
        StateTag::parse(&self.tag)
    }

    pub fn is(&self, tag: StateTag) -> bool {
        self.tag == tag.as_str()
    }

    pub fn value(&self) -> Result<&str, RestoreError> {
        self.value
            .as_deref()
            .ok_or_else(|| RestoreError::MissingValue {
                tag: self.tag.clone(),
            })
    }

    pub fn parse<T: FromStr>(&self) -> Result<T, RestoreError> {
        let raw = self.value()?;
        raw.parse().map_err(|_| RestoreError::InvalidValue {
            tag: self.tag.clone(),
            value: raw.to_string(),
        })
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RestoreError> {
        Ok(serde_json::from_str(self.value()?)?)
    }

    pub fn level(&self) -> Result<StateTraverser<'_>, RestoreError> {
        self.children
            .as_deref()
            .map(StateTraverser::new)
            .ok_or_else(|| RestoreError::NotALevel {
                tag: self.tag.clone(),
            })
    }
}

/// Builds one level of a state document.
#[derive(Debug, Default)]
pub struct StateInserter {
    nodes: Vec<StateNode>,
}

impl StateInserter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_value(&mut self, tag: StateTag, value: impl Display) {
        self.nodes.push(StateNode {
            tag: tag.as_str().to_string(),
            value: Some(value.to_string()),
            children: None,
        });
    }

    pub fn insert_json<T: Serialize + ?Sized>(
        &mut self,
        tag: StateTag,
        value: &T,
    ) -> Result<(), PersistError> {
        let encoded = serde_json::to_string(value)?;
        self.insert_value(tag, encoded);
        Ok(())
    }

    /// Insert a nested level filled by `fill`.
    pub fn insert_level<F>(&mut self, tag: StateTag, fill: F) -> Result<(), PersistError>
    where
        F: FnOnce(&mut StateInserter) -> Result<(), PersistError>,
    {
        let mut child = StateInserter::new();
        fill(&mut child)?;
        self.nodes.push(StateNode {
            tag: tag.as_str().to_string(),
            value: None,
            children: Some(child.nodes),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn into_nodes(self) -> Vec<StateNode> {
        self.nodes
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string(&self.nodes)?)
    }
}

/// Walks one level of a state document in write order.
#[derive(Debug, Clone)]
pub struct StateTraverser<'a> {
    nodes: &'a [StateNode],
    position: usize,
}

impl<'a> StateTraverser<'a> {
    pub fn new(nodes: &'a [StateNode]) -> Self {
        Self { nodes, position: 0 }
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.nodes.len()
    }

    pub fn peek(&self) -> Option<&'a StateNode> {
        self.nodes.get(self.position)
    }

    /// The next node, which must carry `tag`.
    pub fn expect(&mut self, tag: StateTag) -> Result<&'a StateNode, RestoreError> {
        match self.next() {
            Some(node) if node.is(tag) => Ok(node),
            Some(node) => Err(RestoreError::UnexpectedTag {
                expected: tag.as_str(),
                found: node.tag.clone(),
            }),
            None => Err(RestoreError::UnexpectedTag {
                expected: tag.as_str(),
                found: "<end of level>".to_string(),
            }),
        }
    }
}

impl<'a> Iterator for StateTraverser<'a> {
    type Item = &'a StateNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.nodes.get(self.position)?;
        self.position += 1;
        Some(node)
    }
}

/// Parse a serialized document.
pub fn parse_document(json: &str) -> Result<Vec<StateNode>, RestoreError> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_levels_round_trip() {
        let mut root = StateInserter::new();
        root.insert_value(StateTag::Time, 1200);
        root.insert_level(StateTag::Entity, |level| {
            level.insert_value(StateTag::Partition, "web-01");
            level.insert_value(StateTag::WindowBucketCount, 0.1 + 0.2);
            Ok(())
        })
        .unwrap();

        let json = root.to_json().unwrap();
        let nodes = parse_document(&json).unwrap();
        let mut t = StateTraverser::new(&nodes);
        assert_eq!(t.expect(StateTag::Time).unwrap().parse::<i64>().unwrap(), 1200);
        let entity = t.next().unwrap();
        assert_eq!(entity.tag(), Some(StateTag::Entity));
        let mut inner = entity.level().unwrap();
        assert_eq!(inner.next().unwrap().value().unwrap(), "web-01");
        // Exact float round trip.
        assert_eq!(inner.next().unwrap().parse::<f64>().unwrap(), 0.1 + 0.2);
        assert!(inner.is_eof());
        assert!(t.is_eof());
    }

    #[test]
    fn test_expect_reports_wrong_tag() {
        let mut root = StateInserter::new();
        root.insert_value(StateTag::Version, "x");
        let nodes = root.into_nodes();
        let mut t = StateTraverser::new(&nodes);
        let err = t.expect(StateTag::Time).unwrap_err();
        assert!(matches!(err, RestoreError::UnexpectedTag { expected: "time", .. }));
    }

    #[test]
    fn test_scalar_is_not_a_level() {
        let mut root = StateInserter::new();
        root.insert_value(StateTag::Pruned, true);
        let nodes = root.into_nodes();
        assert!(nodes[0].level().is_err());
        assert!(nodes[0].parse::<bool>().unwrap());
    }
}
