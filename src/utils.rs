use crate::{branch::BranchId, error::corruption, Error};

/// Detects pointer loops while following child pointers.
///
/// Brent-style: remembers the id seen at exponentially spaced checkpoints and
/// fails if that id recurs before the next checkpoint. A healthy traversal
/// visits each id at most once, so any recurrence means a corrupted pointer.
#[derive(Debug)]
pub(crate) struct LoopGuard {
    mark: BranchId,
    steps: u32,
    next_check: u32,
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self {
            mark: 0,
            steps: 0,
            next_check: 1,
        }
    }
}

impl LoopGuard {
    #[inline]
    pub fn step(&mut self, id: BranchId) -> Result<(), Error> {
        if id != 0 && id == self.mark {
            return Err(corruption!("pointer loop detected at branch {id}"));
        }
        self.steps += 1;
        if self.steps == self.next_check {
            self.mark = id;
            self.next_check = self.next_check.saturating_mul(2);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_accepts_distinct_ids() {
        let mut guard = LoopGuard::default();
        for id in 1..10_000 {
            guard.step(id).unwrap();
        }
    }

    #[test]
    fn guard_detects_cycles() {
        // any cycle must trip the guard eventually, whatever its phase
        for cycle_len in 1..32 {
            let mut guard = LoopGuard::default();
            let mut tripped = false;
            'outer: for round in 0..4 {
                for id in 1..=cycle_len {
                    // unique prefix on round 0, then the same cycle repeated
                    let id = if round == 0 { id + 100 } else { id };
                    if guard.step(id).is_err() {
                        tripped = true;
                        break 'outer;
                    }
                }
            }
            assert!(tripped, "cycle of length {cycle_len} not detected");
        }
    }
}
