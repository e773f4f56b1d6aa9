use log::info;

/// One-way sink for human-readable lifecycle messages.
///
/// Implementations must not block or fail in ways that would affect
/// proxying.
pub trait StatusSink: Send + Sync {
    fn display(&self, message: &str);
}

/// Sends status messages to the `log` facade at INFO.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn display(&self, message: &str) {
        info!("{}", message);
    }
}

/// Keeps every message in memory; used to assert on lifecycle events.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    messages: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        match self.messages.lock() {
            Ok(messages) => messages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

#[cfg(test)]
impl StatusSink for MemorySink {
    fn display(&self, message: &str) {
        match self.messages.lock() {
            Ok(mut messages) => messages.push(message.to_string()),
            Err(poisoned) => poisoned.into_inner().push(message.to_string()),
        }
    }
}
