use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use vigil_core::channel::ChannelType;

use crate::channels::NotificationChannel;

type Snapshot = Arc<HashMap<ChannelType, Arc<dyn NotificationChannel>>>;

/// Copy-on-write registry of channel type implementations.
///
/// Reads take a snapshot without blocking writers; a reload swaps the whole
/// snapshot under the lock. No process-wide singleton is exposed: the
/// dispatcher owns its registry.
pub struct ChannelRegistry {
    snapshot: RwLock<Snapshot>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Look up the implementation for a channel type.
    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn NotificationChannel>> {
        self.snapshot
            .read()
            .expect("registry lock poisoned")
            .get(&channel_type)
            .cloned()
    }

    /// Register one implementation in a new snapshot.
    pub fn register(&self, channel_type: ChannelType, imp: Arc<dyn NotificationChannel>) {
        let mut guard = self.snapshot.write().expect("registry lock poisoned");
        let mut next: HashMap<_, _> = guard.as_ref().clone();
        next.insert(channel_type, imp);
        *guard = Arc::new(next);
    }

    /// Replace the whole snapshot (management/reload path).
    pub fn reload(&self, implementations: HashMap<ChannelType, Arc<dyn NotificationChannel>>) {
        let mut guard = self.snapshot.write().expect("registry lock poisoned");
        *guard = Arc::new(implementations);
    }

    /// Registered channel types.
    pub fn types(&self) -> Vec<ChannelType> {
        self.snapshot
            .read()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::alert::Alert;
    use vigil_core::channel::Channel;

    use crate::channels::ChannelFuture;

    struct NullChannel(ChannelType);

    impl NotificationChannel for NullChannel {
        fn channel_type(&self) -> ChannelType {
            self.0
        }

        fn send<'a>(&'a self, _alert: &'a Alert, _channel: &'a Channel) -> ChannelFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = ChannelRegistry::new();
        assert!(registry.get(ChannelType::Webhook).is_none());

        registry.register(ChannelType::Webhook, Arc::new(NullChannel(ChannelType::Webhook)));
        assert!(registry.get(ChannelType::Webhook).is_some());
        assert!(registry.get(ChannelType::Email).is_none());
    }

    #[test]
    fn test_reload_replaces_snapshot() {
        let registry = ChannelRegistry::new();
        registry.register(ChannelType::Webhook, Arc::new(NullChannel(ChannelType::Webhook)));

        let mut next: HashMap<ChannelType, Arc<dyn NotificationChannel>> = HashMap::new();
        next.insert(ChannelType::Sms, Arc::new(NullChannel(ChannelType::Sms)));
        registry.reload(next);

        assert!(registry.get(ChannelType::Webhook).is_none());
        assert!(registry.get(ChannelType::Sms).is_some());
    }

    #[test]
    fn test_old_snapshots_stay_valid() {
        let registry = ChannelRegistry::new();
        registry.register(ChannelType::Webhook, Arc::new(NullChannel(ChannelType::Webhook)));

        // A reader that resolved before the reload keeps its Arc.
        let held = registry.get(ChannelType::Webhook).unwrap();
        registry.reload(HashMap::new());
        assert_eq!(held.channel_type(), ChannelType::Webhook);
    }
}
