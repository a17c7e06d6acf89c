use crate::types::{HistoryEvent, PackageInfo};

/// Largest serialized record we hand to the output sink in one line,
/// sized to stay well below journald's per-entry limit.
pub const MAX_CHUNK_BYTES: usize = 16 * 999;

type Getter = fn(&HistoryEvent) -> &Vec<PackageInfo>;
type Setter = fn(&mut HistoryEvent, Vec<PackageInfo>);

/// Enumerated accessors over every splittable package-list attribute.
/// Adding a new list field to `HistoryEvent` means adding a row here.
const LIST_FIELDS: [(Getter, Setter); 5] = [
    (|e| &e.install, |e, v| e.install = v),
    (|e| &e.reinstall, |e, v| e.reinstall = v),
    (|e| &e.upgrade, |e, v| e.upgrade = v),
    (|e| &e.remove, |e, v| e.remove = v),
    (|e| &e.purge, |e, v| e.purge = v),
];

/// Split an event into chunks whose serialized size fits `max_size`.
///
/// If the whole record fits it is returned untouched. Otherwise each
/// package list too large to ride along is moved into its own chunks by
/// midpoint bisection, left halves before right halves, preserving
/// element order. Scalar fields are duplicated into every chunk. A
/// single-element list that still exceeds the bound is emitted as-is;
/// it cannot be subdivided further.
pub fn split_event(event: &HistoryEvent, max_size: usize) -> serde_json::Result<Vec<HistoryEvent>> {
    if serialized_len(event)? <= max_size {
        return Ok(vec![event.clone()]);
    }

    let mut base = event.clone();
    let mut extra = Vec::new();

    for (idx, (getter, setter)) in LIST_FIELDS.iter().enumerate() {
        if getter(event).is_empty() {
            continue;
        }

        // Measure this list riding alone with the scalar fields.
        let mut isolated = event.clone();
        for (other_idx, (_, other_setter)) in LIST_FIELDS.iter().enumerate() {
            if other_idx != idx {
                other_setter(&mut isolated, Vec::new());
            }
        }

        if serialized_len(&isolated)? <= max_size {
            // Small enough, stays in the base record.
            continue;
        }

        setter(&mut base, Vec::new());
        bisect(isolated, *getter, *setter, max_size, &mut extra)?;
    }

    let mut chunks = vec![base];
    chunks.append(&mut extra);
    Ok(chunks)
}

fn bisect(
    event: HistoryEvent,
    getter: Getter,
    setter: Setter,
    max_size: usize,
    out: &mut Vec<HistoryEvent>,
) -> serde_json::Result<()> {
    if getter(&event).len() <= 1 || serialized_len(&event)? <= max_size {
        out.push(event);
        return Ok(());
    }

    let list = getter(&event);
    let mid = list.len() / 2;
    let lower = list[..mid].to_vec();
    let upper = list[mid..].to_vec();

    let mut left = event.clone();
    setter(&mut left, lower);
    let mut right = event;
    setter(&mut right, upper);

    bisect(left, getter, setter, max_size, out)?;
    bisect(right, getter, setter, max_size, out)
}

fn serialized_len(event: &HistoryEvent) -> serde_json::Result<usize> {
    Ok(serde_json::to_vec(event)?.len())
}
