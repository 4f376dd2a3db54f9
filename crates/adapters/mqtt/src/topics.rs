//! Topic naming for one MQTT connection.

use homebus_domain::id::ConnectionId;

/// Bus topic and private reply namespace of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    bus: String,
    reply_prefix: String,
}

impl Topics {
    #[must_use]
    pub fn new(base: &str, connection: ConnectionId) -> Self {
        Self {
            bus: format!("{base}/legacy"),
            reply_prefix: format!("{base}/{connection}/replies/"),
        }
    }

    /// Topic every agent publishes to and subscribes on.
    #[must_use]
    pub fn bus(&self) -> &str {
        &self.bus
    }

    /// Prefix of every reply topic of this connection; reply ids are
    /// `<prefix><seq>`.
    #[must_use]
    pub fn reply_prefix(&self) -> &str {
        &self.reply_prefix
    }

    /// Subscription filter matching every reply topic of this connection.
    #[must_use]
    pub fn reply_filter(&self) -> String {
        format!("{}+", self.reply_prefix)
    }

    #[must_use]
    pub fn is_reply(&self, topic: &str) -> bool {
        topic.starts_with(&self.reply_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_scope_replies_to_connection() {
        let connection: ConnectionId = "4f0f3a52-8d1c-4c4e-9d0a-2b1f7f0c9e11".parse().unwrap();
        let topics = Topics::new("home", connection);

        assert_eq!(topics.bus(), "home/legacy");
        assert_eq!(
            topics.reply_filter(),
            "home/4f0f3a52-8d1c-4c4e-9d0a-2b1f7f0c9e11/replies/+"
        );
        assert!(topics.is_reply("home/4f0f3a52-8d1c-4c4e-9d0a-2b1f7f0c9e11/replies/12"));
        assert!(!topics.is_reply("home/legacy"));
    }

    #[test]
    fn should_not_overlap_between_connections() {
        let a = Topics::new("home", ConnectionId::new());
        let b = Topics::new("home", ConnectionId::new());
        assert_eq!(a.bus(), b.bus());
        assert!(!a.is_reply(&format!("{}1", b.reply_prefix())));
    }
}
