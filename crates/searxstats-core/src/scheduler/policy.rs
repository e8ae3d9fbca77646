//! Backend selection per check kind.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::check::CheckKind;
use crate::instance::{Instance, NetworkType};
use crate::transport::{BackendKind, BackendSet, Transport};

/// Ordered backend preferences for each check kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendPolicy {
    pub liveness: Vec<BackendKind>,
    pub capability: Vec<BackendKind>,
    pub correctness: Vec<BackendKind>,
}

impl Default for BackendPolicy {
    fn default() -> Self {
        Self {
            liveness: vec![BackendKind::Direct, BackendKind::Tor],
            capability: vec![BackendKind::Direct, BackendKind::Tor],
            correctness: vec![BackendKind::Browser, BackendKind::Direct, BackendKind::Tor],
        }
    }
}

impl BackendPolicy {
    pub fn preferences(&self, kind: CheckKind) -> &[BackendKind] {
        match kind {
            CheckKind::Liveness => &self.liveness,
            CheckKind::CapabilityProbe => &self.capability,
            CheckKind::CorrectnessProbe => &self.correctness,
        }
    }

    /// First preferred backend that is configured and allowed for `instance`.
    ///
    /// Onion instances only go through Tor. With `allow_direct` off, nothing
    /// leaves through the plain network path.
    pub fn select(
        &self,
        kind: CheckKind,
        instance: &Instance,
        backends: &BackendSet,
        allow_direct: bool,
    ) -> Option<Arc<dyn Transport>> {
        self.preferences(kind)
            .iter()
            .copied()
            .filter(|backend| eligible(*backend, instance.network, allow_direct))
            .find_map(|backend| backends.get(backend).cloned())
    }
}

fn eligible(backend: BackendKind, network: NetworkType, allow_direct: bool) -> bool {
    match (network, backend) {
        (NetworkType::Tor, BackendKind::Tor) => true,
        (NetworkType::Tor, _) => false,
        (NetworkType::Normal, BackendKind::Tor) => true,
        (NetworkType::Normal, _) => allow_direct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedTransport;

    fn backends(kinds: &[BackendKind]) -> BackendSet {
        kinds.iter().fold(BackendSet::new(), |set, kind| {
            set.with(Arc::new(ScriptedTransport::new(*kind)))
        })
    }

    #[test]
    fn test_first_configured_preference_wins() {
        let policy = BackendPolicy::default();
        let instance = Instance::parse("https://searx.example/").unwrap();
        let set = backends(&[BackendKind::Direct, BackendKind::Tor]);

        let chosen = policy
            .select(CheckKind::CorrectnessProbe, &instance, &set, true)
            .unwrap();
        assert_eq!(chosen.kind(), BackendKind::Direct);
    }

    #[test]
    fn test_onion_only_uses_tor() {
        let policy = BackendPolicy::default();
        let onion = Instance::parse("http://abcdefghijklmnop.onion/").unwrap();

        let direct_only = backends(&[BackendKind::Direct, BackendKind::Browser]);
        assert!(policy
            .select(CheckKind::Liveness, &onion, &direct_only, true)
            .is_none());

        let with_tor = backends(&[BackendKind::Direct, BackendKind::Tor]);
        let chosen = policy
            .select(CheckKind::Liveness, &onion, &with_tor, true)
            .unwrap();
        assert_eq!(chosen.kind(), BackendKind::Tor);
    }

    #[test]
    fn test_direct_disallowed_falls_through_to_tor() {
        let policy = BackendPolicy::default();
        let instance = Instance::parse("https://searx.example/").unwrap();
        let set = backends(&[BackendKind::Direct, BackendKind::Browser, BackendKind::Tor]);

        let chosen = policy
            .select(CheckKind::CorrectnessProbe, &instance, &set, false)
            .unwrap();
        assert_eq!(chosen.kind(), BackendKind::Tor);
    }

    #[test]
    fn test_nothing_eligible() {
        let policy = BackendPolicy::default();
        let instance = Instance::parse("https://searx.example/").unwrap();
        let set = backends(&[BackendKind::Direct]);
        assert!(policy
            .select(CheckKind::Liveness, &instance, &set, false)
            .is_none());
    }
}
