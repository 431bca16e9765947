use std::collections::HashMap;

use tracing::{info, warn};

use crate::{Error, plugin::ChannelPlugin};

/// Registry of all loaded channel plugins.
pub struct ChannelRegistry {
    plugins: HashMap<String, Box<dyn ChannelPlugin>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn ChannelPlugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    pub fn get(&self, id: &str) -> Option<&dyn ChannelPlugin> {
        self.plugins.get(id).map(|p| p.as_ref())
    }

    /// Start one account on the named plugin.
    pub async fn start_account(
        &mut self,
        plugin_id: &str,
        account_id: &str,
        config: serde_json::Value,
    ) -> anyhow::Result<()> {
        let plugin = self
            .plugins
            .get_mut(plugin_id)
            .ok_or_else(|| Error::invalid_input(format!("unknown channel plugin: {plugin_id}")))?;
        plugin.start_account(account_id, config).await
    }

    /// Stop every started account on every plugin. Failures are logged and
    /// do not prevent the remaining accounts from stopping.
    pub async fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for (plugin_id, plugin) in &mut self.plugins {
            for account_id in plugin.account_ids() {
                match plugin.stop_account(&account_id).await {
                    Ok(()) => {
                        stopped += 1;
                        info!(plugin = %plugin_id, account_id, "channel account stopped");
                    },
                    Err(e) => {
                        warn!(plugin = %plugin_id, account_id, error = %e, "failed to stop channel account");
                    },
                }
            }
        }
        stopped
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, async_trait::async_trait};

    #[derive(Default)]
    struct FakePlugin {
        accounts: Vec<String>,
        fail_stop: bool,
    }

    #[async_trait]
    impl ChannelPlugin for FakePlugin {
        fn id(&self) -> &str {
            "fake"
        }

        fn name(&self) -> &str {
            "Fake"
        }

        async fn start_account(
            &mut self,
            account_id: &str,
            _config: serde_json::Value,
        ) -> anyhow::Result<()> {
            self.accounts.push(account_id.to_string());
            Ok(())
        }

        async fn stop_account(&mut self, account_id: &str) -> anyhow::Result<()> {
            if self.fail_stop {
                anyhow::bail!("boom");
            }
            self.accounts.retain(|a| a != account_id);
            Ok(())
        }

        fn account_ids(&self) -> Vec<String> {
            self.accounts.clone()
        }
    }

    #[tokio::test]
    async fn start_and_stop_all() {
        let mut registry = ChannelRegistry::new();
        registry.register(Box::new(FakePlugin::default()));
        registry
            .start_account("fake", "a", serde_json::Value::Null)
            .await
            .unwrap();
        registry
            .start_account("fake", "b", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(registry.get("fake").unwrap().account_ids().len(), 2);

        assert_eq!(registry.stop_all().await, 2);
        assert!(registry.get("fake").unwrap().account_ids().is_empty());
    }

    #[tokio::test]
    async fn unknown_plugin_is_error() {
        let mut registry = ChannelRegistry::new();
        let err = registry
            .start_account("nope", "a", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown channel plugin"));
    }

    #[tokio::test]
    async fn stop_failures_are_not_counted() {
        let mut registry = ChannelRegistry::new();
        registry.register(Box::new(FakePlugin {
            accounts: vec!["a".into()],
            fail_stop: true,
        }));
        assert_eq!(registry.stop_all().await, 0);
    }
}
