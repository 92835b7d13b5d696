use rand::RngCore;
use rand::rngs::OsRng;

use crate::clock::Clock;

/// `<prefix>_<base36 ms>_<6 hex>`, e.g. `sess_lz3k2q1_a1b2c3` — monotonic-ish
/// and collision-resistant without a shared counter or central service.
pub fn new_session_id(prefix: &str, clock: &dyn Clock) -> String {
    let millis = clock.now().timestamp_millis().max(0) as u64;
    let mut suffix = [0u8; 3];
    OsRng.fill_bytes(&mut suffix);
    format!("{prefix}_{}_{}", to_base36(millis), hex::encode(suffix))
}

/// Base36 encoding of the current millisecond timestamp, used for
/// filenames that want a sortable, human-shorter stamp without the random
/// suffix a full session id carries (e.g. `audit-<base36-ms>.jsonl`).
pub fn base36_millis(clock: &dyn Clock) -> String {
    to_base36(clock.now().timestamp_millis().max(0) as u64)
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use chrono::DateTime;

    #[test]
    fn id_has_expected_shape() {
        let clock = FakeClock::new(
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00+00:00").expect("fixed ts"),
        );
        let id = new_session_id("sess", &clock);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "sess");
        assert_eq!(parts[2].len(), 6);
    }

    #[test]
    fn ids_are_not_repeated() {
        let clock = FakeClock::new(
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00+00:00").expect("fixed ts"),
        );
        let a = new_session_id("sess", &clock);
        let b = new_session_id("sess", &clock);
        assert_ne!(a, b);
    }

    #[test]
    fn base36_round_trips_zero() {
        assert_eq!(to_base36(0), "0");
    }
}
