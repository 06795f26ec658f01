//! Store key layout.

/// Builds every key the broker and inspector use under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Set of every queue name that has ever received a task.
    pub fn all_queues(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    /// Ready list of one queue.
    pub fn queue(&self, name: &str) -> String {
        format!("{}:queues:{}", self.namespace, name)
    }

    pub fn in_progress(&self) -> String {
        format!("{}:in_progress", self.namespace)
    }

    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    pub fn retry(&self) -> String {
        format!("{}:retry", self.namespace)
    }

    pub fn dead(&self) -> String {
        format!("{}:dead", self.namespace)
    }

    pub fn unique(&self, key: &str) -> String {
        format!("{}:unique:{}", self.namespace, key)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("spindle")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_namespace_prefix() {
        let keys = Keys::new("app");
        assert_eq!(keys.all_queues(), "app:queues");
        assert_eq!(keys.queue("critical"), "app:queues:critical");
        assert_eq!(keys.in_progress(), "app:in_progress");
        assert_eq!(keys.scheduled(), "app:scheduled");
        assert_eq!(keys.retry(), "app:retry");
        assert_eq!(keys.dead(), "app:dead");
        assert_eq!(keys.unique("user:42"), "app:unique:user:42");
        assert_eq!(Keys::default().namespace(), "spindle");
    }
}
