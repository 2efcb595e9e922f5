//! The frames-per-step curriculum. Training starts with the decoder emitting several mel
//! frames per step (cheap, coarse) and narrows as the global step crosses each window boundary.
use crate::config::ReductionWindow;
use crate::error::Error;

/// Move `index` forward through the schedule until the window covering `global_step` is found.
/// Windows are half open: a window with `until_step = Some(n)` covers steps strictly below `n`.
/// The cursor only ever moves forward, and several boundaries can be crossed in one call (a
/// resumed run may land deep into the schedule). Running past the final closed window is an
/// error rather than a silent stall.
pub fn advance(
    schedule: &[ReductionWindow],
    mut index: usize,
    global_step: u64,
) -> Result<usize, Error> {
    loop {
        let window = schedule
            .get(index)
            .ok_or(Error::ScheduleExhausted {
                index,
                step: global_step,
            })?;
        match window.until_step {
            Some(until) if global_step >= until => {
                if index + 1 >= schedule.len() {
                    return Err(Error::ScheduleExhausted {
                        index,
                        step: global_step,
                    });
                }
                index += 1;
            }
            _ => return Ok(index),
        }
    }
}
