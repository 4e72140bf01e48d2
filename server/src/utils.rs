use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current wall-clock time in milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_monotonic_enough() {
        let a = now_ms();
        std::thread::sleep(Duration::from_millis(2));
        let b = now_ms();
        assert!(b > a);
    }
}
