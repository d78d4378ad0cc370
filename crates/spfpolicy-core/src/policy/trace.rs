//! Per-transaction trace of SPF results

use crate::email_auth::SpfResult;
use std::fmt;

/// First allocation beyond the appended text
const INITIAL_CAPACITY: usize = 256;

/// Concatenation of every result seen in the current transaction
#[derive(Debug, Default)]
pub struct ResultTrace {
    buf: String,
}

impl ResultTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new transaction, keeping the allocation
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append the symbolic name of a result
    pub fn append(&mut self, result: SpfResult) {
        self.push_str(result.as_str());
    }

    fn push_str(&mut self, text: &str) {
        let needed = self.buf.len() + text.len();
        if self.buf.capacity() == 0 {
            self.buf.reserve_exact(INITIAL_CAPACITY + text.len());
        } else if needed >= self.buf.capacity() {
            let cap = self.buf.capacity();
            let target = cap + (cap >> 1) + 8 + text.len();
            self.buf.reserve_exact(target - self.buf.len());
        }
        self.buf.push_str(text);
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

impl fmt::Display for ResultTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_concatenates_in_order() {
        let mut trace = ResultTrace::new();
        trace.append(SpfResult::None);
        trace.append(SpfResult::Pass);
        assert_eq!(trace.as_str(), "nonepass");

        trace.reset();
        assert!(trace.is_empty());
        trace.append(SpfResult::Fail);
        assert_eq!(trace.to_string(), "fail");
    }

    #[test]
    fn test_growth_keeps_content() {
        let mut trace = ResultTrace::new();
        let mut expected = String::new();

        // Cross the initial allocation and several growth steps
        for i in 0..200 {
            let result = SpfResult::ALL[i % SpfResult::ALL.len()];
            trace.append(result);
            expected.push_str(result.as_str());
            assert!(trace.capacity() > trace.as_str().len());
        }

        assert!(expected.len() > INITIAL_CAPACITY * 2);
        assert_eq!(trace.as_str(), expected);
    }

    #[test]
    fn test_two_queries_straddling_threshold() {
        let mut trace = ResultTrace::new();
        trace.append(SpfResult::PermError);
        // Fill to just below the first allocation boundary
        while trace.as_str().len() + SpfResult::PermError.as_str().len() < trace.capacity() {
            trace.append(SpfResult::PermError);
        }
        let before = trace.as_str().to_string();
        let capacity = trace.capacity();

        trace.append(SpfResult::TempError);
        trace.append(SpfResult::SoftFail);

        assert!(trace.capacity() > capacity);
        assert_eq!(trace.as_str(), format!("{}temperrorsoftfail", before));
    }
}
