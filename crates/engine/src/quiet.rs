use serde::{Deserialize, Serialize};

/// A configured time range (UTC hours) during which triggering actions are
/// suppressed. Supports wrap-around ranges such as 22..4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietWindow {
    /// Inclusive start hour.
    pub start_hour: u32,
    /// Exclusive end hour.
    pub end_hour: u32,
}

impl QuietWindow {
    #[must_use]
    pub const fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    /// Whether `hour` falls inside the window. An equal start and end is an
    /// empty window.
    #[must_use]
    pub const fn contains(&self, hour: u32) -> bool {
        if self.start_hour == self.end_hour {
            false
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}
