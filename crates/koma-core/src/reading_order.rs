//! Manga reading order: rows top to bottom, bubbles in a row right to left.

use crate::model::Bubble;

/// Bubbles whose tops are within this distance (0–1000 scale) share a row.
pub const DEFAULT_ROW_TOLERANCE: u16 = 50;

/// Sort `bubbles` in place into reading order.
///
/// Rows are grown greedily from the topmost remaining bubble: every bubble
/// whose `ymin` is within `row_tolerance` of the row's first bubble joins the
/// row. Inside a row the rightmost bubble comes first. Both passes are stable,
/// so identical keys keep the order the service returned them in.
pub fn sort_reading_order(bubbles: &mut Vec<Bubble>, row_tolerance: u16) {
    if bubbles.len() < 2 {
        return;
    }
    bubbles.sort_by_key(|bubble| bubble.bbox.ymin());

    let mut ordered = Vec::with_capacity(bubbles.len());
    let mut row: Vec<Bubble> = Vec::new();
    for bubble in bubbles.drain(..) {
        let starts_new_row = row
            .first()
            .is_some_and(|anchor| bubble.bbox.ymin() - anchor.bbox.ymin() > row_tolerance);
        if starts_new_row {
            flush_row(&mut row, &mut ordered);
        }
        row.push(bubble);
    }
    flush_row(&mut row, &mut ordered);
    *bubbles = ordered;
}

fn flush_row(row: &mut Vec<Bubble>, ordered: &mut Vec<Bubble>) {
    row.sort_by_key(|bubble| std::cmp::Reverse(bubble.bbox.xmin()));
    ordered.append(row);
}
