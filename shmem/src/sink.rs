use tracing::error;

/// Destination for every failure the allocator and the pinning service
/// absorb instead of returning.
pub trait ErrorSink {
    fn report(&self, message: &str, code: Option<i32>);
}

impl<S: ErrorSink + ?Sized> ErrorSink for &S {
    fn report(&self, message: &str, code: Option<i32>) {
        (**self).report(message, code)
    }
}

/// Forwards reports to `tracing` at error level.
#[derive(Default, Debug, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, message: &str, code: Option<i32>) {
        match code {
            Some(code) => error!(code, "{}", message),
            None => error!("{}", message),
        }
    }
}

/// Keeps every report in memory. Used to check what was reported.
#[cfg(any(test, feature = "testing"))]
#[derive(Default, Debug)]
pub struct RecordingSink {
    reports: std::sync::Mutex<Vec<(String, Option<i32>)>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingSink {
    pub fn new() -> RecordingSink {
        Default::default()
    }

    pub fn reports(&self) -> Vec<(String, Option<i32>)> {
        match self.reports.lock() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.reports().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(any(test, feature = "testing"))]
impl ErrorSink for RecordingSink {
    fn report(&self, message: &str, code: Option<i32>) {
        let mut reports = match self.reports.lock() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        reports.push((message.to_string(), code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.report("first", Some(12));
        (&sink).report("second", None);
        assert_eq!(
            sink.reports(),
            vec![("first".to_string(), Some(12)), ("second".to_string(), None)]
        );
    }
}
