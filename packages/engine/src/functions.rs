use std::sync::{Arc, Mutex};

/// Source of generated identifiers and timestamps. Deterministic mode swaps
/// the system provider for a seeded one, so everything that mints an id or a
/// timestamp goes through this trait.
pub trait FunctionProvider {
    fn uuid_v7(&mut self) -> String;
    fn timestamp(&mut self) -> String;
}

pub fn uuid_v7() -> String {
    uuid::Uuid::now_v7().to_string()
}

pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFunctionProvider;

impl FunctionProvider for SystemFunctionProvider {
    fn uuid_v7(&mut self) -> String {
        uuid_v7()
    }

    fn timestamp(&mut self) -> String {
        timestamp()
    }
}

/// Clonable handle sharing one provider between the planner and the CEL
/// evaluation context within a single execute.
pub struct SharedFunctionProvider<P: FunctionProvider> {
    inner: Arc<Mutex<P>>,
}

impl<P: FunctionProvider> SharedFunctionProvider<P> {
    pub fn new(provider: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(provider)),
        }
    }

    pub fn uuid_v7(&self) -> String {
        self.inner.lock().expect("function provider poisoned").uuid_v7()
    }

    pub fn timestamp(&self) -> String {
        self.inner
            .lock()
            .expect("function provider poisoned")
            .timestamp()
    }

    pub fn with_inner<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.inner.lock().expect("function provider poisoned"))
    }
}

impl<P: FunctionProvider> Clone for SharedFunctionProvider<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{timestamp, uuid_v7};

    #[test]
    fn uuid_v7_is_uuid_shaped() {
        let value = uuid_v7();
        assert_eq!(value.len(), 36);
        assert_eq!(value.as_bytes()[14], b'7');
    }

    #[test]
    fn timestamp_is_rfc3339_millis_utc() {
        let value = timestamp();
        assert!(value.ends_with('Z'));
        assert!(value.contains('T'));
        assert_eq!(value.len(), "2024-01-01T00:00:00.000Z".len());
    }
}
