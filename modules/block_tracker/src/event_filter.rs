use std::collections::HashSet;

use agora_common::ChainEvent;

use crate::configuration::EventsConfig;

/// Deny/allow list over `Pallet.Variant` names. `Pallet.*` in the deny list
/// drops a whole pallet; an allow entry always wins over the deny list.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    deny: HashSet<String>,
    allow: HashSet<String>,
}

impl EventFilter {
    pub fn new<S: Into<String>>(
        deny: impl IntoIterator<Item = S>,
        allow: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            deny: deny.into_iter().map(Into::into).collect(),
            allow: allow.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(config.deny.iter().cloned(), config.allow.iter().cloned())
    }

    pub fn accepts(&self, event: &ChainEvent) -> bool {
        let name = event.name();
        if self.allow.contains(&name) {
            return true;
        }
        !self.deny.contains(&format!("{}.*", event.pallet)) && !self.deny.contains(&name)
    }
}
