//! PRIORITY scales per server family.
//!
//! RFC 5545 servers: 1-4 high, 5 medium, 6-9 low.
//! Open-Xchange: 1-3 high, 4-6 medium, 7-9 low.
//! 0, missing and out-of-range values mean no priority.

use crate::model::{Priority, ServerFamily};

fn classify(value: u8, family: ServerFamily) -> Priority {
    match family {
        ServerFamily::OpenXchange => match value {
            1..=3 => Priority::High,
            4..=6 => Priority::Medium,
            7..=9 => Priority::Low,
            _ => Priority::None,
        },
        _ => match value {
            1..=4 => Priority::High,
            5 => Priority::Medium,
            6..=9 => Priority::Low,
            _ => Priority::None,
        },
    }
}

pub fn decode(value: Option<u8>, family: ServerFamily) -> Priority {
    value.map(|v| classify(v, family)).unwrap_or(Priority::None)
}

/// Encode a priority, keeping `previous` when it already falls into the same class.
pub fn encode(priority: Priority, previous: Option<u8>, family: ServerFamily) -> u8 {
    if let Some(previous) = previous {
        if previous != 0 && classify(previous, family) == priority {
            return previous;
        }
    }
    match priority {
        Priority::None => 0,
        Priority::High => 1,
        Priority::Medium => 5,
        Priority::Low => 9,
    }
}
