//! Converter registry with conversion-path finding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use hm_common::SerializedMessage;
use tracing::debug;

use crate::version::MessageVersion;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("no conversion path for '{message_type}' from {from} to {to}")]
    NoConversionPath {
        message_type: String,
        from: MessageVersion,
        to: MessageVersion,
    },

    #[error("converter failed for '{message_type}' at step {from} -> {to}: {reason}")]
    StepFailed {
        message_type: String,
        from: MessageVersion,
        to: MessageVersion,
        reason: String,
    },
}

/// A direct payload conversion between two versions of one message type.
pub trait MessageConverter: Send + Sync {
    fn message_type(&self) -> &str;
    fn from_version(&self) -> MessageVersion;
    fn to_version(&self) -> MessageVersion;

    fn convert(&self, message: &SerializedMessage) -> Result<SerializedMessage, ConversionError>;
}

/// A resolved chain of direct converters.
pub struct ConversionPath {
    pub steps: Vec<Arc<dyn MessageConverter>>,
}

impl std::fmt::Debug for ConversionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionPath")
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl ConversionPath {
    pub fn is_direct(&self) -> bool {
        self.steps.len() == 1
    }

    /// Run every step in order.
    pub fn apply(&self, message: &SerializedMessage) -> Result<SerializedMessage, ConversionError> {
        let mut current = message.clone();
        for step in &self.steps {
            current = step.convert(&current)?;
        }
        Ok(current)
    }
}

/// Lookup and shortest-path discovery over registered converters.
///
/// The path finder is a breadth-first search over version nodes, so the
/// shortest chain wins and cycles in the conversion graph terminate.
#[derive(Default)]
pub struct ConverterRegistry {
    by_type: HashMap<String, Vec<Arc<dyn MessageConverter>>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, converter: Arc<dyn MessageConverter>) {
        debug!(
            message_type = %converter.message_type(),
            from = %converter.from_version(),
            to = %converter.to_version(),
            "registered message converter"
        );
        self.by_type
            .entry(converter.message_type().to_string())
            .or_default()
            .push(converter);
    }

    pub fn find_direct(
        &self,
        message_type: &str,
        from: MessageVersion,
        to: MessageVersion,
    ) -> Option<Arc<dyn MessageConverter>> {
        self.by_type.get(message_type)?.iter().find_map(|c| {
            (c.from_version() == from && c.to_version() == to).then(|| Arc::clone(c))
        })
    }

    /// Shortest converter chain from `from` to `to`.
    pub fn find_path(
        &self,
        message_type: &str,
        from: MessageVersion,
        to: MessageVersion,
    ) -> Result<ConversionPath, ConversionError> {
        let no_path = || ConversionError::NoConversionPath {
            message_type: message_type.to_string(),
            from,
            to,
        };

        if from == to {
            return Err(no_path());
        }
        let converters = self.by_type.get(message_type).ok_or_else(no_path)?;

        let mut queue: VecDeque<MessageVersion> = VecDeque::new();
        let mut visited: HashSet<MessageVersion> = HashSet::new();
        let mut came_from: HashMap<MessageVersion, Arc<dyn MessageConverter>> = HashMap::new();

        queue.push_back(from);
        visited.insert(from);

        while let Some(current) = queue.pop_front() {
            for converter in converters.iter().filter(|c| c.from_version() == current) {
                let next = converter.to_version();
                if !visited.insert(next) {
                    continue;
                }
                came_from.insert(next, Arc::clone(converter));
                if next == to {
                    // Walk back to assemble the chain.
                    let mut steps = Vec::new();
                    let mut cursor = to;
                    while cursor != from {
                        let step = Arc::clone(&came_from[&cursor]);
                        cursor = step.from_version();
                        steps.push(step);
                    }
                    steps.reverse();
                    return Ok(ConversionPath { steps });
                }
                queue.push_back(next);
            }
        }

        Err(no_path())
    }

    /// Convert a serialized message across versions, chaining converters as
    /// needed.
    pub fn convert(
        &self,
        message: &SerializedMessage,
        from: MessageVersion,
        to: MessageVersion,
    ) -> Result<SerializedMessage, ConversionError> {
        let path = self.find_path(&message.message_type, from, to)?;
        path.apply(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hm_common::MessageKind;
    use uuid::Uuid;

    struct FieldAdder {
        message_type: String,
        from: MessageVersion,
        to: MessageVersion,
    }

    impl MessageConverter for FieldAdder {
        fn message_type(&self) -> &str {
            &self.message_type
        }

        fn from_version(&self) -> MessageVersion {
            self.from
        }

        fn to_version(&self) -> MessageVersion {
            self.to
        }

        fn convert(
            &self,
            message: &SerializedMessage,
        ) -> Result<SerializedMessage, ConversionError> {
            let mut out = message.clone();
            if let serde_json::Value::Object(map) = &mut out.payload {
                map.insert(
                    format!("upgraded_{}_{}", self.from, self.to).replace('.', "_"),
                    serde_json::json!(true),
                );
            }
            Ok(out)
        }
    }

    fn converter(from: &str, to: &str) -> Arc<dyn MessageConverter> {
        Arc::new(FieldAdder {
            message_type: "orders.create".to_string(),
            from: from.parse().unwrap(),
            to: to.parse().unwrap(),
        })
    }

    fn message() -> SerializedMessage {
        SerializedMessage {
            message_id: Uuid::new_v4(),
            message_type: "orders.create".to_string(),
            kind: MessageKind::Command,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: Default::default(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn direct_converter_found() {
        let mut registry = ConverterRegistry::new();
        registry.register(converter("1.0", "1.3"));

        let path = registry
            .find_path("orders.create", "1.0".parse().unwrap(), "1.3".parse().unwrap())
            .unwrap();
        assert!(path.is_direct());
    }

    #[test]
    fn chained_path_is_discovered_shortest_first() {
        let mut registry = ConverterRegistry::new();
        registry.register(converter("1.0", "1.3"));
        registry.register(converter("1.3", "2.0"));
        // A longer detour that must not be chosen.
        registry.register(converter("1.0", "1.1"));
        registry.register(converter("1.1", "1.3"));

        let path = registry
            .find_path("orders.create", "1.0".parse().unwrap(), "2.0".parse().unwrap())
            .unwrap();
        assert_eq!(path.steps.len(), 2);
        assert!(!path.is_direct());

        let converted = path.apply(&message()).unwrap();
        let obj = converted.payload.as_object().unwrap();
        assert!(obj.contains_key("upgraded_1_0_0_1_3_0"));
        assert!(obj.contains_key("upgraded_1_3_0_2_0_0"));
    }

    #[test]
    fn cycles_do_not_hang_the_search() {
        let mut registry = ConverterRegistry::new();
        registry.register(converter("1.0", "1.1"));
        registry.register(converter("1.1", "1.0"));

        let err = registry
            .find_path("orders.create", "1.0".parse().unwrap(), "3.0".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, ConversionError::NoConversionPath { .. }));
    }

    #[test]
    fn unknown_type_has_no_path() {
        let registry = ConverterRegistry::new();
        let err = registry
            .find_path("unknown.type", "1.0".parse().unwrap(), "2.0".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, ConversionError::NoConversionPath { .. }));
    }
}
