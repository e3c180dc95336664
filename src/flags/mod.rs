use serde_json::Value;
use std::collections::BTreeMap;

/// Flag name to value, as returned by the backend for one context.
pub type FlagSet = BTreeMap<String, Value>;

/// Flags of the form `featureService.<FEATURE>` toggle application features.
///
/// | value                | meaning                        |
/// |----------------------|--------------------------------|
/// | `{}`                 | use the application default    |
/// | `{"enabled": true}`  | enable the feature             |
/// | `{"enabled": false}` | disable the feature            |
pub const FEATURE_FLAG_PREFIX: &str = "featureService.";

/// Flags of the form `i18n_<message id>` overwrite bundled messages.
pub const MESSAGE_FLAG_PREFIX: &str = "i18n_";

/// Message id to overwrite string. Empty or non-string values are not
/// overwrites.
pub fn message_overwrites(flags: &FlagSet) -> BTreeMap<String, String> {
    flags
        .iter()
        .filter_map(|(name, value)| {
            let id = name.strip_prefix(MESSAGE_FLAG_PREFIX)?;
            match value {
                Value::String(message) if !message.is_empty() => {
                    Some((id.to_string(), message.clone()))
                }
                _ => None,
            }
        })
        .collect()
}

/// Feature name to forced state. Toggles without a boolean `enabled` field
/// are left out so the application default applies.
pub fn feature_overwrites(flags: &FlagSet) -> BTreeMap<String, bool> {
    flags
        .iter()
        .filter_map(|(name, value)| {
            let feature = name.strip_prefix(FEATURE_FLAG_PREFIX)?;
            let enabled = value.get("enabled")?.as_bool()?;
            Some((feature.to_string(), enabled))
        })
        .collect()
}

/// A single flag whose value differs between two flag sets.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagChange {
    pub name: String,
    pub previous: Option<Value>,
    /// `None` when the flag disappeared.
    pub current: Option<Value>,
}

/// Flags that were added, removed or changed value going from `old` to `new`,
/// ordered by name.
pub fn changed_flags(old: &FlagSet, new: &FlagSet) -> Vec<FlagChange> {
    let mut changes: Vec<FlagChange> = new
        .iter()
        .filter(|(name, value)| old.get(*name) != Some(*value))
        .map(|(name, value)| FlagChange {
            name: name.clone(),
            previous: old.get(name).cloned(),
            current: Some(value.clone()),
        })
        .collect();

    changes.extend(
        old.iter()
            .filter(|(name, _)| !new.contains_key(*name))
            .map(|(name, value)| FlagChange {
                name: name.clone(),
                previous: Some(value.clone()),
                current: None,
            }),
    );

    changes.sort_by(|a, b| a.name.cmp(&b.name));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flag_set(value: Value) -> FlagSet {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_message_overwrites_skip_empty() {
        let flags = flag_set(json!({
            "i18n_connector.title": "Custom Title",
            "i18n_empty.one": "",
            "i18n_not.a.string": 42,
            "unrelated": "value",
        }));

        let overwrites = message_overwrites(&flags);
        assert_eq!(overwrites.len(), 1);
        assert_eq!(overwrites["connector.title"], "Custom Title");
    }

    #[test]
    fn test_feature_overwrites_need_enabled_field() {
        let flags = flag_set(json!({
            "featureService.FEATURE_X": { "enabled": true },
            "featureService.FEATURE_Y": {},
            "featureService.FEATURE_Z": { "enabled": false },
            "featureService.FEATURE_W": { "enabled": "yes" },
            "other.FEATURE_X": { "enabled": true },
        }));

        let overwrites = feature_overwrites(&flags);
        assert_eq!(overwrites.len(), 2);
        assert_eq!(overwrites.get("FEATURE_X"), Some(&true));
        assert_eq!(overwrites.get("FEATURE_Z"), Some(&false));
        assert!(!overwrites.contains_key("FEATURE_Y"));
    }

    #[test]
    fn test_changed_flags() {
        let old = flag_set(json!({ "a": 1, "b": true, "gone": "x" }));
        let new = flag_set(json!({ "a": 2, "b": true, "fresh": {} }));

        let changes = changed_flags(&old, &new);
        let names: Vec<&str> = changes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "fresh", "gone"]);

        assert_eq!(changes[0].previous, Some(json!(1)));
        assert_eq!(changes[0].current, Some(json!(2)));
        assert_eq!(changes[1].previous, None);
        assert_eq!(changes[2].current, None);
    }

    #[test]
    fn test_identical_sets_have_no_changes() {
        let flags = flag_set(json!({ "a": 1 }));
        assert!(changed_flags(&flags, &flags).is_empty());
    }
}
