use crate::model::*;

/// Suggestions returned when the caller does not ask for a count.
pub const DEFAULT_SUGGESTIONS: usize = 3;

/// Step and duration used when availability is asked without a service.
pub const DEFAULT_GRANULARITY_MS: Ms = 15 * MINUTE_MS;

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Candidate start instants `t` with `[t, t + duration)` inside a working
/// window and clear of every busy interval. Each window is walked from its
/// start in `step` increments. Output is chronological and deduplicated.
pub fn generate_slots(busy: &[Span], windows: &[Span], duration: Ms, step: Ms) -> Vec<Ms> {
    if duration <= 0 || step <= 0 {
        return Vec::new();
    }

    let mut sorted = busy.to_vec();
    sorted.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&sorted);

    let mut slots = Vec::new();
    for window in windows {
        let mut t = window.start;
        while t + duration <= window.end {
            let candidate = Span::new(t, t + duration);
            // First merged busy interval ending after the candidate starts.
            let i = busy.partition_point(|b| b.end <= candidate.start);
            if busy.get(i).is_none_or(|b| !b.overlaps(&candidate)) {
                slots.push(t);
            }
            t += step;
        }
    }
    slots.sort_unstable();
    slots.dedup();
    slots
}

/// The `max` slots nearest to `preferred`, nearest first; equal distances
/// keep the earlier slot first. Without a preference, the first `max` slots.
pub fn suggest(slots: &[WallClock], preferred: Option<WallClock>, max: usize) -> Vec<WallClock> {
    let mut picked = slots.to_vec();
    if let Some(preferred) = preferred {
        let target = preferred.minutes() as i32;
        picked.sort_by_key(|s| ((s.minutes() as i32 - target).abs(), *s));
    }
    picked.truncate(max);
    picked
}
