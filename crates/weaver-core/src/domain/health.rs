use std::fmt;

/// Transient readiness of a service. Polled, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    Ready,
    NotReady(String),
}

impl HealthState {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady(reason.into())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::NotReady(reason) => write!(f, "not ready: {reason}"),
        }
    }
}
