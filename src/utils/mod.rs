pub mod serde;

use chrono::{DateTime, Utc};
use std::time::Duration;

/// The instant `age` before `now`, saturating at the earliest representable time
pub fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff_before_saturates() {
        let now = Utc::now();
        assert_eq!(cutoff_before(now, Duration::ZERO), now);
        assert_eq!(cutoff_before(now, Duration::from_secs(60)), now - chrono::Duration::seconds(60));
        assert_eq!(cutoff_before(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
