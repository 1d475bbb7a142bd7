//! Format-aware input generators.
//!
//! Each permutator parses the seed into a structured form, publishes a
//! set of format-level permutations of it to both the harness and
//! mutator queues, and returns. Publication is copy-on-publish: the
//! channels only ever see flattened byte buffers, never the parsed
//! form.

pub mod csv;
pub mod json;
pub mod xml;

use std::fs;
use std::path::Path;

use crossbeam_channel::Sender;

use crate::errors::{FuzzerError, Result};
use crate::test_case::TestCase;

/// A format-aware generator. Emits zero or more TestCases to both
/// outbound channels, then returns; the orchestrator does not require
/// a specific cardinality.
pub trait Permutator {
    fn permutate_input(&mut self, file: &Path) -> Result<()>;
}

/// Classifies the seed and builds the matching permutator.
///
/// Strictest formats are probed first (JSON, XML, then CSV) so that
/// arbitrary bytes fall through to the plain generator instead of
/// being claimed by a looser parse.
pub fn create_permutator(
    to_harness: Sender<TestCase>,
    to_mutator: Sender<TestCase>,
    file: &Path,
    rng_seed: Option<u64>,
    stream: u64,
) -> Result<Box<dyn Permutator>> {
    let bytes = fs::read(file).map_err(FuzzerError::SeedInput)?;
    if json::is_valid_json(&bytes) {
        return Ok(Box::new(json::JsonPermutator::new(
            to_harness, to_mutator, rng_seed, stream,
        )));
    }
    if xml::is_valid_xml(&bytes) {
        return Ok(Box::new(xml::XmlPermutator::new(
            to_harness, to_mutator, rng_seed, stream,
        )));
    }
    if csv::is_valid_csv(&bytes) {
        return Ok(Box::new(csv::CsvPermutator::new(to_harness, to_mutator)));
    }
    Ok(Box::new(PlainPermutator {
        to_harness,
        to_mutator,
    }))
}

/// Fallback for seeds that match no structured format: republishes the
/// raw bytes untouched and leaves exploration to the mutator pool.
pub struct PlainPermutator {
    to_harness: Sender<TestCase>,
    to_mutator: Sender<TestCase>,
}

impl Permutator for PlainPermutator {
    fn permutate_input(&mut self, file: &Path) -> Result<()> {
        let bytes = fs::read(file).map_err(FuzzerError::SeedInput)?;
        let mut case = TestCase::new(bytes);
        case.record_change(format!("raw seed from {}", file.display()));
        publish(&self.to_harness, &self.to_mutator, case);
        Ok(())
    }
}

/// Best-effort fan-out to both queues; drops on overload are fine for
/// generator output.
pub(crate) fn publish(to_harness: &Sender<TestCase>, to_mutator: &Sender<TestCase>, case: TestCase) {
    let _ = to_mutator.try_send(case.clone());
    let _ = to_harness.try_send(case);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::io::Write;

    fn channels() -> (
        Sender<TestCase>,
        crossbeam_channel::Receiver<TestCase>,
        Sender<TestCase>,
        crossbeam_channel::Receiver<TestCase>,
    ) {
        let (harness_tx, harness_rx) = bounded(100);
        let (mutator_tx, mutator_rx) = bounded(100);
        (harness_tx, harness_rx, mutator_tx, mutator_rx)
    }

    fn seed_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[test]
    fn plain_permutator_republishes_the_seed() {
        let (harness_tx, harness_rx, mutator_tx, mutator_rx) = channels();
        let seed = seed_file(b"\x00\x01binary blob\xff");
        let mut p = create_permutator(harness_tx, mutator_tx, seed.path(), Some(1), 0).unwrap();
        p.permutate_input(seed.path()).unwrap();

        let case = harness_rx.recv().unwrap();
        assert_eq!(case.input, b"\x00\x01binary blob\xff");
        assert_eq!(mutator_rx.recv().unwrap().input, case.input);
    }

    #[test]
    fn sniffing_prefers_strict_formats() {
        let (harness_tx, _hrx, mutator_tx, _mrx) = channels();
        // Valid CSV and valid JSON would both accept this; JSON wins.
        let seed = seed_file(b"[1, 2, 3]");
        let mut p = create_permutator(harness_tx, mutator_tx, seed.path(), Some(1), 0).unwrap();
        // Structured permutators always emit at least the plain form.
        p.permutate_input(seed.path()).unwrap();
    }

    #[test]
    fn missing_seed_is_an_error() {
        let (harness_tx, _hrx, mutator_tx, _mrx) = channels();
        let missing = Path::new("/nonexistent/seed/file");
        assert!(create_permutator(harness_tx, mutator_tx, missing, None, 0).is_err());
    }
}
