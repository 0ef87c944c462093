//! Provider registry
//!
//! Providers are grouped by priority (higher wins) and shuffled inside a
//! tier weighted by provider weight, so candidate order is stable across a
//! request but load-spreads across requests. Readers take a copy-on-write
//! snapshot at request entry.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use rand::Rng;

/// Upstream provider type tag. `glm` speaks the OpenAI-compatible wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Kiro,
    Glm,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            "google" | "gemini" => Some(ProviderKind::Google),
            "kiro" => Some(ProviderKind::Kiro),
            "glm" | "zhipu" => Some(ProviderKind::Glm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Kiro => "kiro",
            ProviderKind::Glm => "glm",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub priority: i32,
    pub weight: u32,
    pub group: String,
    pub models: Vec<String>,
    pub base_url: Option<String>,
    pub extra_headers: Vec<(String, String)>,
}

impl Provider {
    pub fn supports(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

pub struct ProviderRegistry {
    inner: RwLock<Arc<Vec<Arc<Provider>>>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(providers.into_iter().map(Arc::new).collect())),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Provider>>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, providers: Vec<Provider>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::new(providers.into_iter().map(Arc::new).collect());
    }

    pub fn get(&self, id: i64) -> Option<Arc<Provider>> {
        self.snapshot().iter().find(|p| p.id == id).cloned()
    }

    /// Candidate providers for a canonical model, ordered for attempts:
    /// priority tiers descending, weighted shuffle within a tier.
    ///
    /// `group` restricts candidates to providers carrying that label; pass
    /// `None` for no restriction. Disabled providers and providers that do
    /// not support the model are excluded.
    pub fn resolve(&self, model: &str, group: Option<&str>) -> Vec<Arc<Provider>> {
        let snapshot = self.snapshot();
        let mut matching: Vec<Arc<Provider>> = snapshot
            .iter()
            .filter(|p| p.enabled && p.supports(model))
            .filter(|p| group.map(|g| p.group == g).unwrap_or(true))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut ordered = Vec::with_capacity(matching.len());
        let mut rng = rand::thread_rng();
        let mut index = 0;
        while index < matching.len() {
            let priority = matching[index].priority;
            let mut tier: Vec<Arc<Provider>> = Vec::new();
            while index < matching.len() && matching[index].priority == priority {
                tier.push(matching[index].clone());
                index += 1;
            }
            while !tier.is_empty() {
                let total: u64 = tier.iter().map(|p| p.weight.max(1) as u64).sum();
                let mut roll = rng.gen_range(0..total);
                let mut chosen = 0;
                for (i, p) in tier.iter().enumerate() {
                    let w = p.weight.max(1) as u64;
                    if roll < w {
                        chosen = i;
                        break;
                    }
                    roll -= w;
                }
                ordered.push(tier.remove(chosen));
            }
        }

        ordered
    }

    /// Candidate order for a token: its own group first, then (when the
    /// token opts into cross-group retry) every other group, each block
    /// keeping its priority/weight ordering.
    pub fn resolve_for_token(
        &self,
        model: &str,
        group: &str,
        cross_group_retry: bool,
    ) -> Vec<Arc<Provider>> {
        let mut candidates = self.resolve(model, Some(group));
        if cross_group_retry {
            let seen: BTreeSet<i64> = candidates.iter().map(|p| p.id).collect();
            for provider in self.resolve(model, None) {
                if !seen.contains(&provider.id) {
                    candidates.push(provider);
                }
            }
        }
        candidates
    }

    /// Union of canonical models across enabled providers, sorted, with an
    /// optional whitelist intersection.
    pub fn models_union(&self, whitelist: &[String]) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut models: BTreeSet<String> = BTreeSet::new();
        for provider in snapshot.iter().filter(|p| p.enabled) {
            for model in &provider.models {
                if whitelist.is_empty() || whitelist.iter().any(|w| w == model) {
                    models.insert(model.clone());
                }
            }
        }
        models.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: i64, priority: i32, weight: u32, group: &str, models: &[&str]) -> Provider {
        Provider {
            id,
            name: format!("p{}", id),
            kind: ProviderKind::OpenAi,
            enabled: true,
            priority,
            weight,
            group: group.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            base_url: None,
            extra_headers: Vec::new(),
        }
    }

    #[test]
    fn resolve_excludes_disabled_and_unsupporting() {
        let mut off = provider(1, 5, 1, "", &["gpt-4o-mini"]);
        off.enabled = false;
        let registry = ProviderRegistry::new(vec![
            off,
            provider(2, 5, 1, "", &["gpt-4o-mini"]),
            provider(3, 5, 1, "", &["claude-3-opus"]),
        ]);
        let out = registry.resolve("gpt-4o-mini", None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 2);
    }

    #[test]
    fn resolve_orders_by_priority_desc() {
        let registry = ProviderRegistry::new(vec![
            provider(1, 1, 1, "", &["m"]),
            provider(2, 9, 1, "", &["m"]),
            provider(3, 5, 1, "", &["m"]),
        ]);
        let out = registry.resolve("m", None);
        let ids: Vec<i64> = out.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn weighted_shuffle_prefers_heavy_providers() {
        let registry = ProviderRegistry::new(vec![
            provider(1, 5, 1, "", &["m"]),
            provider(2, 5, 50, "", &["m"]),
        ]);
        let mut first_counts = [0u32; 2];
        for _ in 0..200 {
            let out = registry.resolve("m", None);
            first_counts[(out[0].id - 1) as usize] += 1;
        }
        assert!(first_counts[1] > first_counts[0]);
    }

    #[test]
    fn group_restriction_and_cross_group_extension() {
        let registry = ProviderRegistry::new(vec![
            provider(1, 5, 1, "alpha", &["m"]),
            provider(2, 5, 1, "beta", &["m"]),
        ]);
        let own = registry.resolve_for_token("m", "alpha", false);
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].id, 1);

        let extended = registry.resolve_for_token("m", "alpha", true);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended[0].id, 1);
        assert_eq!(extended[1].id, 2);
    }

    #[test]
    fn models_union_intersects_whitelist() {
        let registry = ProviderRegistry::new(vec![
            provider(1, 5, 1, "", &["a", "b"]),
            provider(2, 5, 1, "", &["b", "c"]),
        ]);
        assert_eq!(registry.models_union(&[]), vec!["a", "b", "c"]);
        assert_eq!(
            registry.models_union(&["b".to_string(), "z".to_string()]),
            vec!["b"]
        );
    }
}
