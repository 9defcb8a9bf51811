//! Queue naming convention.
//!
//! For message type `T` the broker-side names are `mq:T.inq`, `mq:T.priorityq`,
//! `mq:T.outq` and `mq:T.dlq`. Broker tooling relies on these exact strings.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Default prefix for every queue and topic name
pub const MQ_PREFIX: &str = "mq:";

/// Shared control/notification topic
pub const TOPIC_IN: &str = "mq:topic:in";

/// Role of a queue relative to its message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
pub enum QueueRole {
    /// Normal inbox.
    #[strum(serialize = "inq")]
    In,
    /// Priority inbox, drained by dedicated workers.
    #[strum(serialize = "priorityq")]
    Priority,
    /// Responses for requests without a reply-to.
    #[strum(serialize = "outq")]
    Out,
    /// Dead letters.
    #[strum(serialize = "dlq")]
    Dlq,
}

impl QueueRole {
    /// Get all role variants.
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}

/// The four queue names derived from one message type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueNames {
    pub type_name: String,
    pub in_q: String,
    pub priority_q: String,
    pub out_q: String,
    pub dlq: String,
}

impl QueueNames {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self::with_prefix(MQ_PREFIX, type_name)
    }

    pub fn with_prefix(prefix: &str, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let name = |role: QueueRole| format!("{}{}.{}", prefix, type_name, role);

        Self {
            in_q: name(QueueRole::In),
            priority_q: name(QueueRole::Priority),
            out_q: name(QueueRole::Out),
            dlq: name(QueueRole::Dlq),
            type_name,
        }
    }

    pub fn for_role(&self, role: QueueRole) -> &str {
        match role {
            QueueRole::In => &self.in_q,
            QueueRole::Priority => &self.priority_q,
            QueueRole::Out => &self.out_q,
            QueueRole::Dlq => &self.dlq,
        }
    }

    /// Split a queue name back into its message type and role.
    ///
    /// Returns `None` for names that do not follow the convention, including
    /// the control topic.
    pub fn resolve(prefix: &str, queue_name: &str) -> Option<(String, QueueRole)> {
        let rest = queue_name.strip_prefix(prefix)?;
        let (type_name, suffix) = rest.rsplit_once('.')?;
        if type_name.is_empty() {
            return None;
        }
        let role = QueueRole::from_str(suffix).ok()?;
        Some((type_name.to_string(), role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names_are_bit_exact() {
        let names = QueueNames::new("Hello");

        assert_eq!(names.in_q, "mq:Hello.inq");
        assert_eq!(names.priority_q, "mq:Hello.priorityq");
        assert_eq!(names.out_q, "mq:Hello.outq");
        assert_eq!(names.dlq, "mq:Hello.dlq");
        assert_eq!(names.for_role(QueueRole::Dlq), "mq:Hello.dlq");
    }

    #[test]
    fn test_queue_names_are_distinct_across_types() {
        let a = QueueNames::new("Hello");
        let b = QueueNames::new("HelloResponse");

        for role in QueueRole::all() {
            assert_ne!(a.for_role(role), b.for_role(role));
        }
    }

    #[test]
    fn test_custom_prefix() {
        let names = QueueNames::with_prefix("site1:", "Reverse");
        assert_eq!(names.in_q, "site1:Reverse.inq");
    }

    #[test]
    fn test_resolve_round_trips_roles() {
        let names = QueueNames::new("app.Reverse");

        assert_eq!(
            QueueNames::resolve(MQ_PREFIX, &names.priority_q),
            Some(("app.Reverse".to_string(), QueueRole::Priority))
        );
        assert_eq!(QueueNames::resolve(MQ_PREFIX, TOPIC_IN), None);
        assert_eq!(QueueNames::resolve(MQ_PREFIX, "mq:Hello.unknown"), None);
        assert_eq!(QueueNames::resolve(MQ_PREFIX, "other:Hello.inq"), None);
    }
}
