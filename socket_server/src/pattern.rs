/// Streaming matcher for a fixed packet terminator.
///
/// Bytes are fed one at a time; [`push`](Self::push) reports when the bytes fed so
/// far end with the pattern. Partial matches are tracked with a KMP failure table,
/// so overlapping prefixes (`"AAB"` inside `"AAAB"`) are found.
#[derive(Debug, Clone)]
pub struct TerminatorMatcher {
    pattern: Vec<u8>,
    failure: Vec<usize>,
    state: usize,
}

impl TerminatorMatcher {
    /// Returns `None` for an empty pattern.
    pub fn new(pattern: &[u8]) -> Option<Self> {
        if pattern.is_empty() {
            return None;
        }

        // failure[i]: length of the longest proper prefix of pattern[..=i] which is
        // also a suffix of it
        let mut failure = vec![0; pattern.len()];
        let mut k = 0;
        for i in 1..pattern.len() {
            while k > 0 && pattern[i] != pattern[k] {
                k = failure[k - 1];
            }
            if pattern[i] == pattern[k] {
                k += 1;
            }
            failure[i] = k;
        }

        Some(Self { pattern: pattern.to_vec(), failure, state: 0 })
    }

    pub fn push(&mut self, byte: u8) -> bool {
        while self.state > 0 && self.pattern[self.state] != byte {
            self.state = self.failure[self.state - 1];
        }
        if self.pattern[self.state] == byte {
            self.state += 1;
        }
        if self.state == self.pattern.len() {
            self.state = self.failure[self.state - 1];
            return true;
        }
        false
    }
}
