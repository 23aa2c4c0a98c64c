//! Choice-point frames on the non-deterministic stack
//!
//! Frame layout, in words from the frame address:
//!
//! | offset | slot     | meaning                                  |
//! |--------|----------|------------------------------------------|
//! | 0      | `prevfr` | previous frame, or [`NO_FRAME`]          |
//! | 1      | `redoip` | failure continuation                     |
//! | 2      | `redofr` | frame to make current on redo            |
//! | 3      | `succip` | success continuation of the creator      |
//! | 4      | `succfr` | frame current when this one was created  |
//! | 5      | `nslots` | number of frame variables that follow    |
//!
//! Frames are stacked in creation order; `maxfr` is always the newest one
//! still alive, so failure resumes the most recent undisposed frame.

use tracing::debug;

use super::CodeAddr;
use crate::engine::{Machine, Reg};
use crate::error::{Result, RuntimeError};
use crate::memory::{Word, Zone, ZoneKind};

/// Frame pointer value meaning "no frame".
pub const NO_FRAME: Word = Word::MAX;

const PREVFR: usize = 0;
const REDOIP: usize = 1;
const REDOFR: usize = 2;
const SUCCIP: usize = 3;
const SUCCFR: usize = 4;
const NSLOTS: usize = 5;

/// Words taken by the fixed part of every frame.
pub const FRAME_FIXED_WORDS: usize = 6;

/// One past the last word of the frame at `frame` (zone base if none).
pub fn frame_end(zone: &Zone, frame: Word) -> Result<usize> {
    if frame == NO_FRAME {
        return Ok(zone.base());
    }
    let slots = zone.read(frame + NSLOTS)?;
    Ok(frame + FRAME_FIXED_WORDS + slots)
}

impl Machine<'_> {
    fn nondet(&self) -> &Zone {
        self.zone(ZoneKind::NondetStack)
    }

    fn frame_slot(&self, frame: Word, slot: usize) -> Result<Word> {
        if frame == NO_FRAME {
            return Err(RuntimeError::ZoneUnderflow {
                zone: ZoneKind::NondetStack,
                index: frame,
            });
        }
        self.nondet().read(frame + slot)
    }

    /// Push a choice point whose failure continuation is `redoip`, and make
    /// it current.
    pub fn mkframe(&mut self, name: &str, slots: usize, redoip: CodeAddr) -> Result<Word> {
        let prev = self.reg(Reg::Maxfr);
        let frame = frame_end(self.nondet(), prev)?;
        let end = frame
            .checked_add(FRAME_FIXED_WORDS + slots)
            .ok_or(RuntimeError::ZoneOverflow {
                zone: ZoneKind::NondetStack,
                index: usize::MAX,
            })?;
        let succip = self.reg(Reg::Succip);
        let succfr = self.reg(Reg::Curfr);

        let zone = self.zone_mut(ZoneKind::NondetStack);
        zone.set_top(end)?;
        zone.write(frame + PREVFR, prev)?;
        zone.write(frame + REDOIP, redoip.to_word())?;
        zone.write(frame + REDOFR, frame)?;
        zone.write(frame + SUCCIP, succip)?;
        zone.write(frame + SUCCFR, succfr)?;
        zone.write(frame + NSLOTS, slots)?;

        self.set_reg(Reg::Maxfr, frame);
        self.set_reg(Reg::Curfr, frame);
        self.metrics().record_frame_push();
        if self.options().debug.nondetstack {
            debug!(engine = self.engine_id(), name, frame, %redoip, "mkframe");
        }
        Ok(frame)
    }

    /// Change the failure continuation of the current frame.
    pub fn set_redoip(&mut self, redoip: CodeAddr) -> Result<()> {
        let frame = self.reg(Reg::Curfr);
        self.frame_slot(frame, REDOIP)?;
        self.zone_mut(ZoneKind::NondetStack)
            .write(frame + REDOIP, redoip.to_word())
    }

    /// Mark the current frame as exhausted: failing into it fails through.
    pub fn exhaust_frame(&mut self) -> Result<()> {
        self.set_redoip(CodeAddr::DO_FAIL)
    }

    pub fn framevar(&self, n: usize) -> Result<Word> {
        let frame = self.reg(Reg::Curfr);
        self.frame_slot(frame, FRAME_FIXED_WORDS + n)
    }

    pub fn set_framevar(&mut self, n: usize, value: Word) -> Result<()> {
        let frame = self.reg(Reg::Curfr);
        self.frame_slot(frame, FRAME_FIXED_WORDS + n)?;
        self.zone_mut(ZoneKind::NondetStack)
            .write(frame + FRAME_FIXED_WORDS + n, value)
    }

    /// Return to the creator of the current frame, leaving it on the stack
    /// for later backtracking.
    pub fn succeed(&mut self) -> Result<CodeAddr> {
        let frame = self.reg(Reg::Curfr);
        let succip = self.frame_slot(frame, SUCCIP)?;
        let succfr = self.frame_slot(frame, SUCCFR)?;
        self.set_reg(Reg::Curfr, succfr);
        if self.options().debug.goto {
            debug!(engine = self.engine_id(), frame, "succeed");
        }
        Ok(CodeAddr::from_word(succip))
    }

    /// Return to the creator of the current frame and pop it, which must
    /// be the newest one.
    pub fn succeed_discard(&mut self) -> Result<CodeAddr> {
        let frame = self.reg(Reg::Curfr);
        let prev = self.frame_slot(frame, PREVFR)?;
        let target = self.succeed()?;
        self.set_maxfr(prev)?;
        Ok(target)
    }

    /// Continue at the success continuation held in `succip`.
    pub fn proceed(&self) -> CodeAddr {
        CodeAddr::from_word(self.reg(Reg::Succip))
    }

    /// Invoke `target`, which resumes at `cont` on success.
    pub fn call(&mut self, target: CodeAddr, cont: CodeAddr) -> CodeAddr {
        self.set_reg(Reg::Succip, cont.to_word());
        if self.options().debug.goto {
            debug!(engine = self.engine_id(), %target, %cont, "call");
        }
        target
    }

    /// Resume at the failure continuation of the newest frame.
    pub fn fail(&mut self) -> Result<CodeAddr> {
        let top = self.reg(Reg::Maxfr);
        let redofr = self.frame_slot(top, REDOFR)?;
        let redoip = self.frame_slot(top, REDOIP)?;
        self.set_reg(Reg::Curfr, redofr);
        if self.options().debug.goto {
            debug!(engine = self.engine_id(), frame = top, %redoip, "fail");
        }
        Ok(CodeAddr::from_word(redoip))
    }

    /// Backtrack into the newest choice point to look for another solution.
    pub fn redo(&mut self) -> Result<CodeAddr> {
        self.metrics().record_redo();
        self.fail()
    }

    /// Pop the newest frame, which has no alternatives left, and fail into
    /// the one below it.
    pub fn discard_and_fail(&mut self) -> Result<CodeAddr> {
        let top = self.reg(Reg::Maxfr);
        let prev = self.frame_slot(top, PREVFR)?;
        if prev == NO_FRAME {
            return Err(RuntimeError::BootstrapInvariant(
                "failure past the bottom choice point".into(),
            ));
        }
        self.set_maxfr(prev)?;
        self.fail()
    }

    fn set_maxfr(&mut self, frame: Word) -> Result<()> {
        let top = frame_end(self.nondet(), frame)?;
        self.zone_mut(ZoneKind::NondetStack).set_top(top)?;
        self.set_reg(Reg::Maxfr, frame);
        Ok(())
    }

    /// Number of live frames.
    pub fn frame_depth(&self) -> Result<usize> {
        let mut depth = 0;
        let mut frame = self.reg(Reg::Maxfr);
        while frame != NO_FRAME {
            depth += 1;
            frame = self.frame_slot(frame, PREVFR)?;
        }
        Ok(depth)
    }

    /// Pop every frame newer than `saved`, returning how many were popped.
    pub(crate) fn discard_frames_to(&mut self, saved: Word) -> Result<usize> {
        let mut discarded = 0;
        let mut frame = self.reg(Reg::Maxfr);
        while frame != saved {
            if frame == NO_FRAME {
                return Err(RuntimeError::BootstrapInvariant(
                    "choice-point chain does not reach the saved frame".into(),
                ));
            }
            frame = self.frame_slot(frame, PREVFR)?;
            discarded += 1;
        }
        self.set_maxfr(saved)?;
        self.set_reg(Reg::Curfr, saved);
        Ok(discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::small_engine;

    #[test]
    fn test_frames_stack_in_creation_order() {
        let mut engine = small_engine(0);
        let mut m = engine.enter_managed();
        let a = m.mkframe("a", 0, CodeAddr::GLOBAL_FAIL).unwrap();
        let b = m.mkframe("b", 2, CodeAddr::new(7)).unwrap();
        assert_eq!(a, m.zone(ZoneKind::NondetStack).base());
        assert_eq!(b, a + FRAME_FIXED_WORDS);
        assert_eq!(m.reg(Reg::Maxfr), b);
        assert_eq!(m.frame_depth().unwrap(), 2);
        assert_eq!(
            m.zone(ZoneKind::NondetStack).top(),
            b + FRAME_FIXED_WORDS + 2
        );
    }

    #[test]
    fn test_fail_resumes_newest_frame() {
        let mut engine = small_engine(0);
        let mut m = engine.enter_managed();
        m.mkframe("a", 0, CodeAddr::new(5)).unwrap();
        let b = m.mkframe("b", 0, CodeAddr::new(6)).unwrap();
        assert_eq!(m.fail().unwrap(), CodeAddr::new(6));
        assert_eq!(m.reg(Reg::Maxfr), b);
    }

    #[test]
    fn test_discard_and_fail_resumes_frame_below() {
        let mut engine = small_engine(0);
        let mut m = engine.enter_managed();
        let a = m.mkframe("a", 0, CodeAddr::new(5)).unwrap();
        m.mkframe("b", 0, CodeAddr::new(6)).unwrap();
        assert_eq!(m.discard_and_fail().unwrap(), CodeAddr::new(5));
        assert_eq!(m.reg(Reg::Maxfr), a);
        assert_eq!(m.reg(Reg::Curfr), a);
    }

    #[test]
    fn test_discarding_bottom_frame_is_error() {
        let mut engine = small_engine(0);
        let mut m = engine.enter_managed();
        m.mkframe("only", 0, CodeAddr::GLOBAL_FAIL).unwrap();
        assert!(m.discard_and_fail().is_err());
    }

    #[test]
    fn test_succeed_keeps_frame_for_redo() {
        let mut engine = small_engine(0);
        let mut m = engine.enter_managed();
        let cont = m.call(CodeAddr::new(9), CodeAddr::new(4));
        assert_eq!(cont, CodeAddr::new(9));
        let frame = m.mkframe("gen", 1, CodeAddr::new(8)).unwrap();
        m.set_framevar(0, 33).unwrap();
        assert_eq!(m.succeed().unwrap(), CodeAddr::new(4));
        assert_eq!(m.reg(Reg::Curfr), NO_FRAME);
        assert_eq!(m.redo().unwrap(), CodeAddr::new(8));
        assert_eq!(m.reg(Reg::Curfr), frame);
        assert_eq!(m.framevar(0).unwrap(), 33);
    }

    #[test]
    fn test_succeed_discard_pops_frame() {
        let mut engine = small_engine(0);
        let mut m = engine.enter_managed();
        m.mkframe("det", 0, CodeAddr::new(3)).unwrap();
        m.succeed_discard().unwrap();
        assert_eq!(m.reg(Reg::Maxfr), NO_FRAME);
        assert_eq!(m.frame_depth().unwrap(), 0);
    }

    #[test]
    fn test_nondet_overflow_detected() {
        let mut engine = small_engine(0);
        let mut m = engine.enter_managed();
        let capacity = m.zone(ZoneKind::NondetStack).capacity();
        assert!(matches!(
            m.mkframe("huge", capacity, CodeAddr::GLOBAL_FAIL),
            Err(RuntimeError::ZoneOverflow { zone: ZoneKind::NondetStack, .. })
        ));
    }
}
