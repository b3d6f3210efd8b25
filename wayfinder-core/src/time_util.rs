use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Clock regressions saturate to zero
/// rather than panicking.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_ms_is_monotonic_enough() {
        let a = epoch_ms();
        let b = epoch_ms();
        assert!(b >= a);
        // Sanity: later than 2024-01-01.
        assert!(a > 1_704_067_200_000);
    }
}
