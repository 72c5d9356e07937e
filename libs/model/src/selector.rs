//! Label selectors.

use std::collections::BTreeMap;

use crate::Pod;

/// Equality-based label selector.
///
/// A pod matches when every selector key is present in its labels with an
/// equal value. Extra pod labels are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    terms: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new(terms: BTreeMap<String, String>) -> Self {
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &BTreeMap<String, String> {
        &self.terms
    }

    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    pub fn matches(&self, pod: &Pod) -> bool {
        self.matches_labels(&pod.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_matches_subset_of_labels() {
        let pod = Pod::new("p").with_label("app", "web").with_label("tier", "front");
        assert!(selector(&[("app", "web")]).matches(&pod));
        assert!(selector(&[("app", "web"), ("tier", "front")]).matches(&pod));
    }

    #[test]
    fn test_rejects_missing_or_different_value() {
        let pod = Pod::new("p").with_label("app", "web");
        assert!(!selector(&[("app", "db")]).matches(&pod));
        assert!(!selector(&[("app", "web"), ("tier", "front")]).matches(&pod));
    }

    proptest! {
        #[test]
        fn prop_selector_built_from_labels_matches(
            labels in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..6),
            take in 0usize..6,
        ) {
            let terms: BTreeMap<String, String> =
                labels.iter().take(take).map(|(k, v)| (k.clone(), v.clone())).collect();
            let selector = LabelSelector::new(terms);
            prop_assert!(selector.matches_labels(&labels));
        }

        #[test]
        fn prop_changed_value_never_matches(
            labels in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{1,8}", 1..6),
        ) {
            let (key, value) = labels.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap();
            let mut terms = BTreeMap::new();
            terms.insert(key, format!("{value}-other"));
            prop_assert!(!LabelSelector::new(terms).matches_labels(&labels));
        }
    }
}
