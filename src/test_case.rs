use std::fmt;

/// A candidate input plus the audit log of every transformation that
/// produced it.
///
/// TestCases cross channels by value and are never mutated after
/// publication; producers deep-copy before deriving a new case.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestCase {
    /// The bytes fed to the target's standard input.
    pub input: Vec<u8>,
    /// One entry per transformation, opaque to the harness.
    pub changes: Vec<String>,
}

impl TestCase {
    pub fn new(input: Vec<u8>) -> TestCase {
        TestCase {
            input,
            changes: Vec::new(),
        }
    }

    /// Appends one entry to the audit log.
    pub fn record_change(&mut self, change: String) {
        self.changes.push(change);
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", String::from_utf8_lossy(&self.input))?;
        for (index, change) in self.changes.iter().enumerate() {
            writeln!(f, "change {}: {}", index, change)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_are_independent() {
        let mut original = TestCase::new(b"hello".to_vec());
        original.record_change("seed".to_string());

        let published = original.clone();
        original.input[0] = b'X';
        original.record_change("post-publish edit".to_string());

        assert_eq!(published.input, b"hello");
        assert_eq!(published.changes, vec!["seed".to_string()]);
    }

    #[test]
    fn display_includes_input_and_changes() {
        let mut case = TestCase::new(b"ab".to_vec());
        case.record_change("flipped a bit".to_string());
        let rendered = format!("{}", case);
        assert!(rendered.contains("ab"));
        assert!(rendered.contains("change 0: flipped a bit"));
    }
}
