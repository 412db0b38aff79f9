use dtx_core::{DataPath, DatastoreScope, Participant, Value};
use serde_json::json;

use crate::backends::Backends;
use crate::config::Config;

pub const SCOPE: DatastoreScope = DatastoreScope::Configuration;

/// One inner list entry and the participant it is written to.
#[derive(Debug, Clone)]
pub struct Element {
    pub participant: Participant,
    pub path: DataPath,
    pub value: Value,
}

fn inner_path(outer: usize, inner: usize) -> DataPath {
    DataPath::new(format!("/outer-list/{}/inner-list/{}", outer, inner))
}

/// Spread `outer_elements * inner_elements` entries round-robin over
/// `participants`.
pub fn build(config: &Config, participants: &[Participant]) -> Vec<Element> {
    let mut elements = Vec::with_capacity(config.element_count());
    if participants.is_empty() {
        return elements;
    }
    for outer in 0..config.outer_elements {
        for inner in 0..config.inner_elements {
            let participant = &participants[elements.len() % participants.len()];
            elements.push(Element {
                participant: participant.clone(),
                path: inner_path(outer, inner),
                value: json!({"name": inner, "value": format!("Value {}", inner)}),
            });
        }
    }
    elements
}

/// A path under an outer entry that is never written by `build`.
pub fn error_path(config: &Config) -> DataPath {
    inner_path(config.outer_elements, 0)
}

/// Commit every element directly, so a delete run has something to remove.
pub fn seed(backends: &Backends, elements: &[Element]) {
    for element in elements {
        if let Some(device) = backends.device(&element.participant) {
            device.set(SCOPE, element.path.clone(), element.value.clone());
        }
    }
}

/// Number of elements whose committed presence differs from `expect_present`.
pub fn mismatches(backends: &Backends, elements: &[Element], expect_present: bool) -> usize {
    elements
        .iter()
        .filter(|element| {
            let present = backends
                .device(&element.participant)
                .and_then(|device| device.get(SCOPE, &element.path))
                .is_some();
            present != expect_present
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(args: &[&str]) -> Config {
        let mut argv = vec!["dtx-bench"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_build_spreads_over_participants() {
        let config = config(&["--outer-elements", "2", "--inner-elements", "3", "--devices", "1"]);
        let backends = Backends::new(&config);
        let elements = build(&config, backends.participants());

        assert_eq!(elements.len(), 6);
        assert_eq!(elements[0].path.as_str(), "/outer-list/0/inner-list/0");
        assert_eq!(elements[5].path.as_str(), "/outer-list/1/inner-list/2");
        // Mixed mode with one device per kind alternates kinds
        assert_ne!(elements[0].participant, elements[1].participant);
        assert_eq!(elements[0].participant, elements[2].participant);
    }

    #[test]
    fn test_error_path_is_outside_workload() {
        let config = config(&["--outer-elements", "2", "--inner-elements", "2"]);
        let backends = Backends::new(&config);
        let elements = build(&config, backends.participants());
        let error = error_path(&config);
        assert!(elements.iter().all(|element| element.path != error));
    }

    #[test]
    fn test_seed_and_mismatches() {
        let config = config(&["--outer-elements", "1", "--inner-elements", "4"]);
        let backends = Backends::new(&config);
        let elements = build(&config, backends.participants());

        assert_eq!(mismatches(&backends, &elements, true), 4);
        seed(&backends, &elements);
        assert_eq!(mismatches(&backends, &elements, true), 0);
        assert_eq!(mismatches(&backends, &elements, false), 4);
    }
}
