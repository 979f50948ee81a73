//! Parsing and validation of untrusted per-guest meminfo reports.
//!
//! Two shapes are accepted: a bare decimal kibibyte count (the "compact"
//! form newer guests publish), and a legacy `/proc/meminfo`-style
//! key/value dump. Anything that fails to parse or fails validation
//! yields `None` rather than a best-effort guess: a guest that lies about
//! its own memory can only hurt itself (see `parse`'s doc comment).

use std::collections::HashMap;

const LEGACY_KEYS: [&str; 6] = [
    "MemTotal",
    "MemFree",
    "Buffers",
    "Cached",
    "SwapTotal",
    "SwapFree",
];

/// Parse an untrusted meminfo report into a byte count of "truly used"
/// memory, or `None` if the report is malformed or fails validation.
///
/// No bound is placed on individual values: a guest that reports an
/// absurdly large `SwapTotal` only inflates its own preference and can be
/// granted more host-free memory, but the allocator's invariants (see
/// [`crate::allocator`]) guarantee it cannot starve other guests.
pub fn parse(raw: &[u8]) -> Option<u64> {
    if raw.is_empty() {
        return None;
    }

    if let Some(compact) = parse_compact(raw) {
        return Some(compact);
    }

    parse_legacy(raw)
}

fn parse_compact(raw: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(raw).ok()?;
    let text = text.trim();
    if text.is_empty() || text.contains(char::is_whitespace) {
        return None;
    }
    let kib: i64 = text.parse().ok()?;
    if kib < 0 {
        return None;
    }
    Some(kib as u64 * 1024)
}

fn parse_legacy(raw: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(raw).ok()?;

    let mut values: HashMap<&str, i64> = HashMap::new();
    for line in text.lines() {
        let mut words = line.split_whitespace();
        let Some(key) = words.next() else { continue };
        let Some(value) = words.next() else { continue };
        let key = key.trim_end_matches(':');
        if let Ok(parsed) = value.parse::<i64>() {
            values.insert(key, parsed);
        }
    }

    let mut fields = HashMap::with_capacity(LEGACY_KEYS.len());
    for key in LEGACY_KEYS {
        let value = *values.get(key)?;
        if value < 0 {
            return None;
        }
        fields.insert(key, value as u64);
    }

    let mem_total = fields["MemTotal"];
    let mem_free = fields["MemFree"];
    let cached = fields["Cached"];
    let buffers = fields["Buffers"];
    let swap_total = fields["SwapTotal"];
    let swap_free = fields["SwapFree"];

    if swap_total < swap_free {
        return None;
    }
    if mem_total < mem_free + cached + buffers {
        return None;
    }

    let used_kib = (mem_total - mem_free - cached - buffers + swap_total - swap_free) as u64;
    Some(used_kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_form_round_trips() {
        assert_eq!(parse(b"4096"), Some(4096 * 1024));
        assert_eq!(parse(b"0"), Some(0));
    }

    #[test]
    fn empty_input_is_unknown() {
        assert_eq!(parse(b""), None);
    }

    #[test]
    fn garbled_compact_form_is_unknown() {
        assert_eq!(parse(b"a4096"), None);
        assert_eq!(parse(b"4096a"), None);
        assert_eq!(parse(b"4096 1024"), None);
        assert_eq!(parse(b"4096\n1024"), None);
    }

    #[test]
    fn negative_compact_form_is_unknown() {
        assert_eq!(parse(b"-1"), None);
    }

    fn legacy(
        mem_total: i64,
        mem_free: i64,
        cached: i64,
        buffers: i64,
        swap_total: i64,
        swap_free: i64,
    ) -> Vec<u8> {
        format!(
            "MemTotal: {mem_total}\nMemFree: {mem_free}\nCached: {cached}\n\
             Buffers: {buffers}\nSwapTotal: {swap_total}\nSwapFree: {swap_free}\n"
        )
        .into_bytes()
    }

    #[test]
    fn legacy_form_computes_used_memory() {
        let raw = legacy(2_000_000, 500_000, 300_000, 100_000, 1_000_000, 200_000);
        // (2_000_000 - 500_000 - 300_000 - 100_000 + 1_000_000 - 200_000) * 1024
        assert_eq!(parse(&raw), Some(1_900_000 * 1024));
    }

    #[test]
    fn legacy_missing_key_is_unknown() {
        let raw = b"MemTotal: 100\nMemFree: 200\n";
        assert_eq!(parse(raw), None);
    }

    #[test]
    fn legacy_negative_key_is_unknown() {
        let raw = legacy(2_000_000, -1, 300_000, 100_000, 1_000_000, 200_000);
        assert_eq!(parse(&raw), None);
    }

    #[test]
    fn legacy_inconsistent_total_is_unknown() {
        // MemTotal < MemFree + Cached + Buffers
        let raw = legacy(100, 200, 0, 0, 0, 0);
        assert_eq!(parse(&raw), None);
    }

    #[test]
    fn legacy_swap_free_exceeds_total_is_unknown() {
        let raw = legacy(2_000_000, 500_000, 0, 0, 100, 200);
        assert_eq!(parse(&raw), None);
    }
}
