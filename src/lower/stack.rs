//! Pure stack shuffles.

use super::translator::FunctionTranslator;
use crate::core::TranslateResult;

impl FunctionTranslator<'_, '_> {
    pub(super) fn pop_top(&mut self) -> TranslateResult<()> {
        let value = self.pop()?;
        self.release(value)
    }

    pub(super) fn rot_two(&mut self) -> TranslateResult<()> {
        let top = self.pop()?;
        let second = self.pop()?;
        self.push(top)?;
        self.push(second)
    }

    /// `[.. c b a]` becomes `[.. a c b]`.
    pub(super) fn rot_three(&mut self) -> TranslateResult<()> {
        let top = self.pop()?;
        let second = self.pop()?;
        let third = self.pop()?;
        self.push(top)?;
        self.push(third)?;
        self.push(second)
    }

    /// `[.. d c b a]` becomes `[.. a d c b]`.
    pub(super) fn rot_four(&mut self) -> TranslateResult<()> {
        let top = self.pop()?;
        let second = self.pop()?;
        let third = self.pop()?;
        let fourth = self.pop()?;
        self.push(top)?;
        self.push(fourth)?;
        self.push(third)?;
        self.push(second)
    }

    pub(super) fn dup_top(&mut self) -> TranslateResult<()> {
        let top = self.pop()?;
        let copy = self.dup(&top)?;
        self.push(top)?;
        self.push(copy)
    }

    /// Duplicate the top `count` values, preserving their order.
    pub(super) fn dup_topx(&mut self, count: usize) -> TranslateResult<()> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop()?);
        }
        values.reverse();

        let mut copies = Vec::with_capacity(count);
        for value in &values {
            copies.push(self.dup(value)?);
        }
        for value in values.into_iter().chain(copies) {
            self.push(value)?;
        }
        Ok(())
    }
}
