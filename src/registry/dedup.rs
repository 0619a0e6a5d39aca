use std::collections::HashMap;

/// Last display value forwarded per scale
#[derive(Debug, Default)]
pub struct WeightDeduplicator {
    last: HashMap<String, String>,
}

impl WeightDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `value` differs from what was last forwarded for the scale
    pub fn is_changed(&self, scale_id: &str, value: &str) -> bool {
        self.last.get(scale_id).map(String::as_str) != Some(value)
    }

    /// Remembers a successfully forwarded value
    pub fn record(&mut self, scale_id: &str, value: String) {
        self.last.insert(scale_id.to_string(), value);
    }

    pub fn last(&self, scale_id: &str) -> Option<&str> {
        self.last.get(scale_id).map(String::as_str)
    }

    pub fn forget(&mut self, scale_id: &str) {
        self.last.remove(scale_id);
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }
}
