//! Bounded channels shuttling TestCases between producers and
//! consumers.
//!
//! The pipeline is a cycle: harness workers feed novel cases back to
//! the mutator pool, which re-emits derivatives onto the harness input
//! queue. Soundness of a cycle of bounded queues requires at least one
//! non-blocking edge; here the harness-to-interesting edge (and the
//! mutator pool's self-feeding edge) drop on overload. Crash delivery
//! is the one edge that must never lose a message.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::test_case::TestCase;

/// Capacity of every pipeline channel.
pub const CHANNEL_CAPACITY: usize = 1000;

/// The four queues of the fuzzing loop. Endpoints are cloned into each
/// worker thread; the orchestrator keeps one copy of everything, so no
/// channel closes in the steady state.
pub struct Pipeline {
    /// Producers -> harness workers.
    pub to_harness_tx: Sender<TestCase>,
    pub to_harness_rx: Receiver<TestCase>,
    /// Producers -> mutator pool (compounding input).
    pub to_mutator_tx: Sender<TestCase>,
    pub to_mutator_rx: Receiver<TestCase>,
    /// Harness workers -> feedback mutator. Best-effort.
    pub interesting_tx: Sender<TestCase>,
    pub interesting_rx: Receiver<TestCase>,
    /// Harness workers -> crash sink. Must-deliver, single consumer.
    pub crash_tx: Sender<TestCase>,
    pub crash_rx: Receiver<TestCase>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        let (to_harness_tx, to_harness_rx) = bounded(CHANNEL_CAPACITY);
        let (to_mutator_tx, to_mutator_rx) = bounded(CHANNEL_CAPACITY);
        let (interesting_tx, interesting_rx) = bounded(CHANNEL_CAPACITY);
        let (crash_tx, crash_rx) = bounded(CHANNEL_CAPACITY);
        Pipeline {
            to_harness_tx,
            to_harness_rx,
            to_mutator_tx,
            to_mutator_rx,
            interesting_tx,
            interesting_rx,
            crash_tx,
            crash_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cases_cross_channels_unchanged() {
        let pipeline = Pipeline::new();
        let mut case = TestCase::new(b"payload".to_vec());
        case.record_change("origin".to_string());

        pipeline.to_harness_tx.send(case.clone()).unwrap();
        pipeline.interesting_tx.send(case.clone()).unwrap();

        let via_harness = pipeline.to_harness_rx.recv().unwrap();
        let via_interesting = pipeline.interesting_rx.recv().unwrap();
        assert_eq!(via_harness, case);
        assert_eq!(via_interesting, case);
        assert_eq!(via_harness.input, via_interesting.input);
    }

    #[test]
    fn full_channel_rejects_non_blocking_sends() {
        let (tx, _rx) = bounded::<TestCase>(2);
        assert!(tx.try_send(TestCase::new(vec![1])).is_ok());
        assert!(tx.try_send(TestCase::new(vec![2])).is_ok());
        assert!(tx.try_send(TestCase::new(vec![3])).is_err());
    }
}
