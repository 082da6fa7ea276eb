use uuid::Uuid;

/// Canonical room key for a pair of participants. The pair is sorted
/// before joining, so both sides derive the same key without any
/// coordination: `room_id(a, b) == room_id(b, a)`.
///
/// This is the single source of truth for room naming. Deriving a key
/// any other way risks the two participants resolving different rooms.
pub fn room_id(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}_{hi}")
}

/// Parses a room key back into its sorted participant pair.
pub fn participants(room_id: &str) -> Option<(Uuid, Uuid)> {
    let (lo, hi) = room_id.split_once('_')?;
    Some((lo.parse().ok()?, hi.parse().ok()?))
}

/// The participant in `room_id` that is not `me`. Both halves are `me`
/// in the degenerate self-room.
pub fn other_participant(room_id: &str, me: Uuid) -> Option<Uuid> {
    let (lo, hi) = participants(room_id)?;
    Some(if lo == me { hi } else { lo })
}
