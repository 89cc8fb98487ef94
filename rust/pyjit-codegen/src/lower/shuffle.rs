//! Pure stack rearrangement.

use cranelift_module::Module;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    pub(super) fn pop_top(&mut self) -> Result<(), CodegenError> {
        let top = self.pop();
        self.release(top)
    }

    /// Move the top of the stack `depth - 1` slots down. Ownership moves
    /// with the values; no counts change.
    pub(super) fn rotate(&mut self, depth: usize) -> Result<(), CodegenError> {
        let popped: Vec<_> = (0..depth).map(|_| self.pop()).collect();
        let (first, rest) = popped
            .split_first()
            .ok_or_else(|| CodegenError::Lowering("rotation of an empty window".into()))?;
        self.push(*first);
        for value in rest.iter().rev() {
            self.push(*value);
        }
        Ok(())
    }

    /// Duplicate the top `count` values, preserving their order.
    pub(super) fn duplicate(&mut self, count: usize) -> Result<(), CodegenError> {
        let mut window: Vec<_> = (0..count).map(|_| self.pop()).collect();
        window.reverse();
        for value in &window {
            self.acquire(*value)?;
        }
        for _ in 0..2 {
            for value in &window {
                self.push(*value);
            }
        }
        Ok(())
    }
}
