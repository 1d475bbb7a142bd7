//! Byte-level mutation of test cases, the mutator worker pool and the
//! feedback mutator that closes the coverage loop.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::test_case::TestCase;

/// Byte values worth planting whole into inputs.
const INTERESTING_BYTES: &[u8] = &[0x00, 0x01, 0x0a, 0x20, 0x7f, 0x80, 0xff];

/// Replacement pools for numeric-looking tokens.
const INTERESTING_INTEGERS: &[&str] = &[
    "0",
    "-1",
    "-100",
    "100",
    "2147483647",
    "-2147483648",
    "4294967295",
];
const INTERESTING_FLOATS: &[&str] = &["0.0", "-1.5", "1e308", "-1e308", "0.00000001"];
const INTERESTING_HEX: &[&str] = &["0x0", "0xff", "0x7fffffff", "0x80000000", "0xffffffff"];

const FORMAT_STRINGS: &[&str] = &["%s", "%n", "%p", "%x%x%x%x", "%s%s%s%s"];

/// Applies randomized byte-level transformations to test cases,
/// recording each one in the case's audit log.
pub struct MutationEngine {
    rng: StdRng,
}

impl MutationEngine {
    /// `stream` decorrelates engines sharing one fixed seed so every
    /// worker explores a different sequence.
    pub fn new(rng_seed: Option<u64>, stream: u64) -> MutationEngine {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_entropy(),
        };
        MutationEngine { rng }
    }

    /// Applies a uniformly random 1..=8 mutations to `case`.
    pub fn apply(&mut self, case: &mut TestCase) {
        let count = self.rng.gen_range(1, 9);
        for _ in 0..count {
            match self.rng.gen_range(0, 11) {
                0 => self.flip_bits(case),
                1 => self.flip_bytes(case),
                2 => self.delete_slice(case),
                3 => self.duplicate_slice(case),
                4 => self.insert_interesting_byte(case),
                5 => self.replace_tokens(case, "replace_int", is_int_token, INTERESTING_INTEGERS),
                6 => self.replace_tokens(case, "replace_float", is_float_token, INTERESTING_FLOATS),
                7 => self.replace_tokens(case, "replace_hex", is_hex_token, INTERESTING_HEX),
                8 => self.shuffle(case),
                9 => self.reverse(case),
                _ => self.insert_format_string(case),
            }
        }
    }

    /// Flips one random bit in roughly a tenth of the input bytes.
    fn flip_bits(&mut self, case: &mut TestCase) {
        if case.input.is_empty() {
            return;
        }
        let nbytes = (case.input.len() / 10).max(1);
        for _ in 0..nbytes {
            let index = self.rng.gen_range(0, case.input.len());
            let offset = self.rng.gen_range(0, 8);
            case.input[index] ^= 1 << offset;
            case.record_change(format!("flip_bits: byte {}, bit {}", index, offset));
        }
    }

    /// Inverts roughly a tenth of the input bytes.
    fn flip_bytes(&mut self, case: &mut TestCase) {
        if case.input.is_empty() {
            return;
        }
        let nbytes = (case.input.len() / 10).max(1);
        for _ in 0..nbytes {
            let index = self.rng.gen_range(0, case.input.len());
            case.input[index] ^= 0xff;
            case.record_change(format!("flip_bytes: byte {}", index));
        }
    }

    fn delete_slice(&mut self, case: &mut TestCase) {
        if case.input.len() < 2 {
            return;
        }
        let start = self.rng.gen_range(0, case.input.len());
        let len = self.rng.gen_range(1, case.input.len() - start + 1);
        case.input.drain(start..start + len);
        case.record_change(format!("delete_slice: {} bytes at {}", len, start));
    }

    fn duplicate_slice(&mut self, case: &mut TestCase) {
        if case.input.is_empty() {
            return;
        }
        let start = self.rng.gen_range(0, case.input.len());
        let max_len = (case.input.len() - start).min(64);
        let len = self.rng.gen_range(1, max_len + 1);
        let slice: Vec<u8> = case.input[start..start + len].to_vec();
        let at = self.rng.gen_range(0, case.input.len() + 1);
        case.input.splice(at..at, slice.into_iter());
        case.record_change(format!(
            "duplicate_slice: {} bytes from {} inserted at {}",
            len, start, at
        ));
    }

    fn insert_interesting_byte(&mut self, case: &mut TestCase) {
        let value = INTERESTING_BYTES[self.rng.gen_range(0, INTERESTING_BYTES.len())];
        let at = self.rng.gen_range(0, case.input.len() + 1);
        case.input.insert(at, value);
        case.record_change(format!("insert_interesting_byte: {:#04x} at {}", value, at));
    }

    /// Token-level substitution: split on spaces, swap a random subset
    /// of the tokens the predicate accepts for entries from `pool`,
    /// rejoin. Non-UTF-8 inputs are left alone.
    fn replace_tokens(
        &mut self,
        case: &mut TestCase,
        label: &str,
        accepts: fn(&str) -> bool,
        pool: &[&str],
    ) {
        let text = match String::from_utf8(case.input.clone()) {
            Ok(text) => text,
            Err(_) => return,
        };
        let mut tokens: Vec<String> = text.split(' ').map(str::to_string).collect();
        let mut candidates: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| accepts(token))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return;
        }
        candidates.shuffle(&mut self.rng);
        let num_to_change = self.rng.gen_range(1, candidates.len() + 1);
        candidates.truncate(num_to_change);
        for index in candidates {
            let replacement = pool[self.rng.gen_range(0, pool.len())];
            case.record_change(format!(
                "{}: token {} '{}' -> '{}'",
                label, index, tokens[index], replacement
            ));
            tokens[index] = replacement.to_string();
        }
        case.input = tokens.join(" ").into_bytes();
    }

    fn shuffle(&mut self, case: &mut TestCase) {
        if case.input.len() < 2 {
            return;
        }
        case.input.shuffle(&mut self.rng);
        case.record_change("shuffle".to_string());
    }

    fn reverse(&mut self, case: &mut TestCase) {
        if case.input.len() < 2 {
            return;
        }
        case.input.reverse();
        case.record_change("reverse".to_string());
    }

    fn insert_format_string(&mut self, case: &mut TestCase) {
        let payload = FORMAT_STRINGS[self.rng.gen_range(0, FORMAT_STRINGS.len())];
        let at = self.rng.gen_range(0, case.input.len() + 1);
        case.input
            .splice(at..at, payload.as_bytes().iter().cloned());
        case.record_change(format!("insert_format_string: '{}' at {}", payload, at));
    }
}

fn is_int_token(token: &str) -> bool {
    token.parse::<i64>().is_ok()
}

fn is_float_token(token: &str) -> bool {
    token.parse::<i64>().is_err() && token.parse::<f64>().is_ok()
}

fn is_hex_token(token: &str) -> bool {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"));
    match digits {
        Some(digits) if !digits.is_empty() => u64::from_str_radix(digits, 16).is_ok(),
        _ => false,
    }
}

/// One member of the mutator pool. Pulls a case from the mutator
/// channel when one is ready, falling back to a fresh copy of the
/// pristine seed, mutates it, and fans the result out to both the
/// harness queue and the mutator queue for compounding.
pub struct MutatorWorker {
    id: usize,
    engine: MutationEngine,
    seed: Vec<u8>,
    inputs: Receiver<TestCase>,
    to_harness: Sender<TestCase>,
    to_mutator: Sender<TestCase>,
}

impl MutatorWorker {
    pub fn new(
        id: usize,
        rng_seed: Option<u64>,
        seed: Vec<u8>,
        inputs: Receiver<TestCase>,
        to_harness: Sender<TestCase>,
        to_mutator: Sender<TestCase>,
    ) -> MutatorWorker {
        MutatorWorker {
            id,
            engine: MutationEngine::new(rng_seed, id as u64),
            seed,
            inputs,
            to_harness,
            to_mutator,
        }
    }

    pub fn run(mut self) {
        log::debug!("mutator {}: running", self.id);
        loop {
            self.mutate_once();
        }
    }

    fn mutate_once(&mut self) {
        let mut case = match self.inputs.try_recv() {
            Ok(case) => case,
            Err(_) => TestCase::new(self.seed.clone()),
        };
        self.engine.apply(&mut case);
        // The pool is both producer and sole consumer of the mutator
        // queue; a blocking send at capacity would deadlock it, so this
        // edge drops on overload.
        let _ = self.to_mutator.try_send(case.clone());
        if self.to_harness.send(case).is_err() {
            // Harness receivers are gone; the program is shutting down.
            return;
        }
    }
}

/// Closes the coverage loop: blockingly drains the interesting channel
/// and republishes a mutated derivative of every novel case onto the
/// harness queue.
pub struct FeedbackWorker {
    engine: MutationEngine,
    interesting: Receiver<TestCase>,
    to_harness: Sender<TestCase>,
}

impl FeedbackWorker {
    pub fn new(
        rng_seed: Option<u64>,
        interesting: Receiver<TestCase>,
        to_harness: Sender<TestCase>,
    ) -> FeedbackWorker {
        FeedbackWorker {
            // Stream offset keeps this engine off the pool workers'
            // sequences.
            engine: MutationEngine::new(rng_seed, 0x0fee_dbac),
            interesting,
            to_harness,
        }
    }

    pub fn run(mut self) {
        for case in self.interesting.iter() {
            let mut derived = case.clone();
            derived.record_change("derived from interesting case".to_string());
            self.engine.apply(&mut derived);
            if self.to_harness.send(derived).is_err() {
                return;
            }
            // Brief pause so a burst of novel traces cannot starve the
            // ordinary mutators out of the harness queue.
            thread::sleep(Duration::from_micros(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_are_logged_and_bounded() {
        let mut engine = MutationEngine::new(Some(7), 0);
        for _ in 0..100 {
            let mut case = TestCase::new(b"some reasonable input 123 0xff 1.5".to_vec());
            engine.apply(&mut case);
            assert!(!case.changes.is_empty());
        }
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let mut a = MutationEngine::new(Some(42), 3);
        let mut b = MutationEngine::new(Some(42), 3);
        for _ in 0..50 {
            let mut case_a = TestCase::new(b"determinism check 99 0x10".to_vec());
            let mut case_b = case_a.clone();
            a.apply(&mut case_a);
            b.apply(&mut case_b);
            assert_eq!(case_a, case_b);
        }
    }

    #[test]
    fn streams_decorrelate_workers() {
        let mut a = MutationEngine::new(Some(42), 0);
        let mut b = MutationEngine::new(Some(42), 1);
        let mut diverged = false;
        for _ in 0..20 {
            let mut case_a = TestCase::new(b"stream check 1234".to_vec());
            let mut case_b = case_a.clone();
            a.apply(&mut case_a);
            b.apply(&mut case_b);
            if case_a != case_b {
                diverged = true;
            }
        }
        assert!(diverged);
    }

    #[test]
    fn never_panics_on_tiny_inputs() {
        let mut engine = MutationEngine::new(Some(1), 0);
        for len in 0..4 {
            for _ in 0..200 {
                let mut case = TestCase::new(vec![b'A'; len]);
                engine.apply(&mut case);
            }
        }
    }

    #[test]
    fn token_predicates() {
        assert!(is_int_token("42"));
        assert!(is_int_token("-7"));
        assert!(!is_int_token("4.2"));
        assert!(!is_int_token("abc"));

        assert!(is_float_token("4.2"));
        assert!(is_float_token("-0.5"));
        assert!(!is_float_token("42"));
        assert!(!is_float_token("xyz"));

        assert!(is_hex_token("0xff"));
        assert!(is_hex_token("0X10"));
        assert!(!is_hex_token("0x"));
        assert!(!is_hex_token("ff"));
        assert!(!is_hex_token("0xzz"));
    }

    #[test]
    fn int_tokens_get_replaced_from_the_pool() {
        let mut engine = MutationEngine::new(Some(5), 0);
        let mut case = TestCase::new(b"a 12 b 34 c".to_vec());
        engine.replace_tokens(&mut case, "replace_int", is_int_token, INTERESTING_INTEGERS);
        let text = String::from_utf8(case.input).unwrap();
        let tokens: Vec<&str> = text.split(' ').collect();
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[0], "a");
        assert_eq!(tokens[2], "b");
        assert_eq!(tokens[4], "c");
        let replaced = (tokens[1] != "12") as usize + (tokens[3] != "34") as usize;
        assert!(replaced >= 1);
        for token in &[tokens[1], tokens[3]] {
            assert!(*token == "12" || *token == "34" || INTERESTING_INTEGERS.contains(token));
        }
        assert!(!case.changes.is_empty());
    }

    #[test]
    fn seed_fallback_copies_not_aliases() {
        let (to_mutator_tx, to_mutator_rx) = crossbeam_channel::bounded(10);
        let (to_harness_tx, to_harness_rx) = crossbeam_channel::bounded(10);
        let seed = b"pristine seed".to_vec();
        let mut worker = MutatorWorker::new(
            0,
            Some(11),
            seed.clone(),
            to_mutator_rx,
            to_harness_tx,
            to_mutator_tx,
        );
        worker.mutate_once();
        let published = to_harness_rx.recv().unwrap();
        assert!(!published.changes.is_empty());
        // The pristine seed is still the worker's baseline.
        assert_eq!(worker.seed, seed);
    }
}
