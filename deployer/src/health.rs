use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Thread-safe degradation registry shared between the workers and the API.
#[derive(Clone, Default)]
pub struct Health {
    errors: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub degraded: bool,
    pub errors: HashMap<String, Vec<String>>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_degraded(&self, key: &str, error: impl Into<String>) {
        self.errors
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .push(error.into());
    }

    pub fn set_ok(&self, key: &str) {
        self.errors.lock().unwrap().remove(key);
    }

    pub fn status(&self) -> HealthStatus {
        let errors = self.errors.lock().unwrap().clone();
        HealthStatus {
            degraded: !errors.is_empty(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degradations_accumulate_per_key_until_cleared() {
        let health = Health::new();
        assert!(!health.status().degraded);

        health.add_degraded("releases", "env prod out of sync");
        health.add_degraded("releases", "env beta out of sync");
        health.add_degraded("workers", "thread died");

        let status = health.status();
        assert!(status.degraded);
        assert_eq!(status.errors["releases"].len(), 2);

        health.set_ok("releases");
        let status = health.status();
        assert!(status.degraded, "other keys stay degraded");
        assert!(!status.errors.contains_key("releases"));

        health.set_ok("workers");
        assert!(!health.status().degraded);
    }
}
