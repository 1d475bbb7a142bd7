//! JSON permutator: element duplication and scalar inflation over a
//! parsed JSON seed.

use std::fs;
use std::io;
use std::path::Path;

use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use super::{publish, Permutator};
use crate::errors::{FuzzerError, Result};
use crate::test_case::TestCase;

/// Spam permutations published per seed on top of the plain form.
const SPAM_ROUNDS: usize = 6;

/// A seed is JSON when it parses to a top-level object or array;
/// bare scalars are left to the other sniffers.
pub fn is_valid_json(bytes: &[u8]) -> bool {
    matches!(
        serde_json::from_slice::<Value>(bytes),
        Ok(Value::Object(_)) | Ok(Value::Array(_))
    )
}

/// Duplicates members of containers and nudges scalars: strings
/// double, numbers jump by 0xffffffff. Containers gain 3..=12 copies
/// of randomly chosen members, then one member is spammed recursively.
///
/// JSON objects cannot hold duplicate keys the way the raw text could,
/// so duplicated members get derived key names instead.
fn spam_value(value: &mut Value, rng: &mut StdRng, changes: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            let keys: Vec<String> = map.keys().cloned().collect();
            if keys.is_empty() {
                return;
            }
            let count = rng.gen_range(3, 13);
            for i in 0..count {
                let key = &keys[rng.gen_range(0, keys.len())];
                let duplicate = map[key.as_str()].clone();
                map.insert(format!("{}_{}", key, i), duplicate);
            }
            changes.push(format!("duplicated {} object members", count));
            let descend = keys[rng.gen_range(0, keys.len())].clone();
            if let Some(member) = map.get_mut(&descend) {
                spam_value(member, rng, changes);
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                return;
            }
            let count = rng.gen_range(3, 13);
            for _ in 0..count {
                let duplicate = items[rng.gen_range(0, items.len())].clone();
                items.push(duplicate);
            }
            changes.push(format!("duplicated {} array elements", count));
            let index = rng.gen_range(0, items.len());
            spam_value(&mut items[index], rng, changes);
        }
        Value::String(s) => {
            let doubled = format!("{}{}", s, s);
            *s = doubled;
            changes.push("doubled string value".to_string());
        }
        Value::Number(_) => {
            if let Some(n) = value.as_f64() {
                *value = serde_json::json!(n + 4_294_967_295.0);
                changes.push("offset numeric value by 0xffffffff".to_string());
            }
        }
        _ => {}
    }
}

pub struct JsonPermutator {
    to_harness: Sender<TestCase>,
    to_mutator: Sender<TestCase>,
    rng: StdRng,
}

impl JsonPermutator {
    pub fn new(
        to_harness: Sender<TestCase>,
        to_mutator: Sender<TestCase>,
        rng_seed: Option<u64>,
        stream: u64,
    ) -> JsonPermutator {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_entropy(),
        };
        JsonPermutator {
            to_harness,
            to_mutator,
            rng,
        }
    }
}

impl Permutator for JsonPermutator {
    fn permutate_input(&mut self, file: &Path) -> Result<()> {
        let bytes = fs::read(file).map_err(FuzzerError::SeedInput)?;
        let root: Value = serde_json::from_slice(&bytes)
            .map_err(|e| FuzzerError::SeedInput(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let mut plain = TestCase::new(root.to_string().into_bytes());
        plain.record_change(format!("read JSON seed from {}", file.display()));
        plain.record_change("initial input".to_string());
        publish(&self.to_harness, &self.to_mutator, plain);

        for _ in 0..SPAM_ROUNDS {
            let mut value = root.clone();
            let mut changes = vec![format!("read JSON seed from {}", file.display())];
            spam_value(&mut value, &mut self.rng, &mut changes);
            let case = TestCase {
                input: value.to_string().into_bytes(),
                changes,
            };
            publish(&self.to_harness, &self.to_mutator, case);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_sniffing() {
        assert!(is_valid_json(b"{\"a\": 1}"));
        assert!(is_valid_json(b"[1, 2, 3]"));
        assert!(!is_valid_json(b"42"));
        assert!(!is_valid_json(b"\"bare string\""));
        assert!(!is_valid_json(b"not json"));
        assert!(!is_valid_json(b"{\"unterminated\": "));
    }

    #[test]
    fn object_spam_duplicates_members() {
        let mut value: Value = serde_json::from_str("{\"a\": 1, \"b\": \"x\"}").unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let mut changes = Vec::new();
        spam_value(&mut value, &mut rng, &mut changes);

        let map = value.as_object().unwrap();
        assert!(map.len() >= 2 + 3);
        assert!(map.len() <= 2 + 12);
        assert!(!changes.is_empty());
    }

    #[test]
    fn array_spam_appends_duplicates() {
        let mut value: Value = serde_json::from_str("[1, 2]").unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let mut changes = Vec::new();
        spam_value(&mut value, &mut rng, &mut changes);

        let items = value.as_array().unwrap();
        assert!(items.len() >= 2 + 3);
        // Every element is a duplicate of an original.
        for item in items {
            let n = item.as_f64().unwrap();
            assert!(n == 1.0 || n == 2.0 || n == 1.0 + 4_294_967_295.0 || n == 2.0 + 4_294_967_295.0);
        }
        assert!(!changes.is_empty());
    }

    #[test]
    fn scalar_spam_inflates_values() {
        let mut s: Value = serde_json::json!("ab");
        let mut rng = StdRng::seed_from_u64(6);
        let mut changes = Vec::new();
        spam_value(&mut s, &mut rng, &mut changes);
        assert_eq!(s, serde_json::json!("abab"));

        let mut n: Value = serde_json::json!(1);
        spam_value(&mut n, &mut rng, &mut changes);
        assert_eq!(n.as_f64().unwrap(), 1.0 + 4_294_967_295.0);
    }

    #[test]
    fn empty_containers_are_left_alone() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut changes = Vec::new();
        let mut empty_obj: Value = serde_json::json!({});
        spam_value(&mut empty_obj, &mut rng, &mut changes);
        assert_eq!(empty_obj, serde_json::json!({}));

        let mut empty_arr: Value = serde_json::json!([]);
        spam_value(&mut empty_arr, &mut rng, &mut changes);
        assert_eq!(empty_arr, serde_json::json!([]));
        assert!(changes.is_empty());
    }

    #[test]
    fn permutator_output_stays_valid_json() {
        let (harness_tx, harness_rx) = crossbeam_channel::bounded(100);
        let (mutator_tx, _mutator_rx) = crossbeam_channel::bounded(100);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"{\"name\": \"seed\", \"values\": [1, 2, 3]}",
        )
        .unwrap();

        let mut p = JsonPermutator::new(harness_tx, mutator_tx, Some(13), 0);
        p.permutate_input(file.path()).unwrap();

        let cases: Vec<_> = harness_rx.try_iter().collect();
        assert_eq!(cases.len(), 1 + SPAM_ROUNDS);
        for case in &cases {
            assert!(serde_json::from_slice::<Value>(&case.input).is_ok());
            assert!(!case.changes.is_empty());
        }
    }
}
