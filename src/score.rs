/// Top-of-book composite score.
///
/// Only level 0 of each side contributes. Deeper levels are kept by the book
/// but deliberately left out of the price.
///
/// All arithmetic stays in the scaled integer domain. Products are widened to
/// i128: a scaled value times a u32 volume does not fit in i64. The result is
/// a weighted average of two i64 values (or their midpoint), so it always
/// fits back. Division truncates toward zero.

use crate::orderbook::TopOfBook;
use crate::types::SCALE;

/// Scaled composite score for one book's top of book.
#[inline]
pub fn composite_score(top: &TopOfBook) -> i64 {
    let demand_val = top.demand.value as i128;
    let supply_val = top.supply.value as i128;
    let demand_vol = top.demand.volume as i128;
    let supply_vol = top.supply.volume as i128;

    let total_vol = demand_vol + supply_vol;
    if total_vol == 0 {
        if demand_val > 0 && supply_val > 0 {
            return ((demand_val + supply_val) / 2) as i64;
        }
        return 0;
    }

    ((demand_val * supply_vol + supply_val * demand_vol) / total_vol) as i64
}

/// Scaled integer to a real number, for display only.
#[inline(always)]
pub fn to_real(scaled: i64) -> f64 {
    scaled as f64 / SCALE as f64
}
