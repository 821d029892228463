//! Folds per-operation statuses into the batch's top-level status.
//!
//! Precedence, highest first: 5xx, 409, 403, 401, other 4xx, 404, 201,
//! other 2xx. A cancelled operation (202) never decides the outcome on its
//! own: it only exists because something worse happened.

/// Rank of a status in the aggregate precedence.
pub fn severity(status: u16) -> u8 {
    match status {
        500..=599 => 8,
        409 => 7,
        403 => 6,
        401 => 5,
        404 => 3,
        400..=499 => 4,
        201 => 2,
        202 => 0,
        _ => 1,
    }
}

/// The aggregate status of a batch; 200 for an empty batch.
pub fn aggregate_status<I>(statuses: I) -> u16
where
    I: IntoIterator<Item = u16>,
{
    statuses
        .into_iter()
        .max_by_key(|status| severity(*status))
        .map(|status| if status == 202 { 200 } else { status })
        .unwrap_or(200)
}
