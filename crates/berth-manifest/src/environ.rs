//! Environment resolution.
//!
//! Layers, lowest precedence first: built-in defaults, container `environ`,
//! command `environ`, explicit overrides from the command line. A later layer
//! replaces a key from an earlier one; no key is ever dropped.

use std::collections::BTreeMap;

/// A resolved environment, ordered by key so launches are reproducible.
pub type Environ = BTreeMap<String, String>;

/// `PATH` used when neither the container nor the command sets one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host variables passed through when present.
const PASSTHROUGH: &[&str] = &["TERM"];

/// Merge container defaults with command overrides.
#[must_use]
pub fn merge(container: &Environ, command: &Environ) -> Environ {
    let mut env = container.clone();
    env.extend(command.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Fully resolve the environment of a process.
#[must_use]
pub fn resolve(container: &Environ, command: &Environ, overrides: &[(String, String)]) -> Environ {
    let mut env = defaults();
    env.extend(merge(container, command));
    env.extend(overrides.iter().cloned());
    env
}

fn defaults() -> Environ {
    let mut env = Environ::new();
    env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
    for key in PASSTHROUGH {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }
    env
}

/// Parse a `KEY=VALUE` override.
///
/// # Errors
///
/// Returns a message when the `=` is missing or the key is empty.
pub fn parse_override(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn env(pairs: &[(&str, &str)]) -> Environ {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn command_wins_on_conflict() {
        let merged = merge(
            &env(&[("A", "container"), ("B", "b")]),
            &env(&[("A", "command"), ("C", "c")]),
        );
        assert_eq!(merged, env(&[("A", "command"), ("B", "b"), ("C", "c")]));
    }

    #[test]
    fn defaults_are_lowest() {
        let resolved = resolve(&Environ::new(), &Environ::new(), &[]);
        assert_eq!(resolved["PATH"], DEFAULT_PATH);

        let resolved = resolve(&env(&[("PATH", "/opt/bin")]), &Environ::new(), &[]);
        assert_eq!(resolved["PATH"], "/opt/bin");
    }

    #[test]
    fn overrides_are_highest() {
        let resolved = resolve(
            &env(&[("X", "1")]),
            &env(&[("X", "2")]),
            &[("X".to_string(), "3".to_string())],
        );
        assert_eq!(resolved["X"], "3");
    }

    #[test]
    fn parse_overrides() {
        assert_eq!(
            parse_override("A=b=c"),
            Ok(("A".to_string(), "b=c".to_string()))
        );
        assert_eq!(parse_override("A="), Ok(("A".to_string(), String::new())));
        assert!(parse_override("=x").is_err());
        assert!(parse_override("novalue").is_err());
    }

    proptest! {
        #[test]
        fn merge_keeps_every_key_and_prefers_command(
            container in proptest::collection::btree_map("[A-Z]{1,4}", "[a-z]{0,4}", 0..8),
            command in proptest::collection::btree_map("[A-Z]{1,4}", "[a-z]{0,4}", 0..8),
        ) {
            let merged = merge(&container, &command);
            for (k, v) in &command {
                prop_assert_eq!(merged.get(k), Some(v));
            }
            for (k, v) in &container {
                if !command.contains_key(k) {
                    prop_assert_eq!(merged.get(k), Some(v));
                }
            }
            prop_assert!(merged.keys().all(|k| container.contains_key(k) || command.contains_key(k)));
            prop_assert_eq!(merge(&container, &command), merged);
        }
    }
}
