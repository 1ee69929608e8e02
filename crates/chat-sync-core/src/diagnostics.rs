use std::fmt::Display;

/// Where components report failures they handle themselves.
pub trait DiagnosticsSink: Send + Sync {
    fn warn(&self, context: &str, err: &dyn Display);
    fn error(&self, context: &str, err: &dyn Display);
}

/// Forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn warn(&self, context: &str, err: &dyn Display) {
        tracing::warn!(context, error = %err);
    }

    fn error(&self, context: &str, err: &dyn Display) {
        tracing::error!(context, error = %err);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Keeps every report for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub reports: Mutex<Vec<(String, String)>>,
    }

    impl DiagnosticsSink for RecordingSink {
        fn warn(&self, context: &str, err: &dyn Display) {
            self.reports.lock().push((context.to_string(), err.to_string()));
        }

        fn error(&self, context: &str, err: &dyn Display) {
            self.reports.lock().push((context.to_string(), err.to_string()));
        }
    }
}
