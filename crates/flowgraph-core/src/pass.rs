//! Graph rewrite pass trait.

use crate::Result;
use crate::ir::Module;
use crate::registry::OpRegistry;

/// Trait for implementing graph rewrite passes.
///
/// A pass mutates a module in place.
///
/// # Return Value
///
/// The `run()` method returns `Ok(true)` if the pass made changes to the
/// module, or `Ok(false)` if no changes were made. Transformations that would
/// be unsafe are skipped and count as no change. On `Err(_)` the pass must not
/// have partially mutated the region it was working on.
///
/// # Example
///
/// ```ignore
/// struct DropUnusedNoOps;
///
/// impl Pass for DropUnusedNoOps {
///     fn name(&self) -> &str {
///         "drop-unused-noops"
///     }
///
///     fn run(&self, module: &mut Module, registry: &OpRegistry) -> Result<bool> {
///         let mut changed = false;
///         // Erase NoOps nothing depends on...
///         Ok(changed)
///     }
/// }
/// ```
pub trait Pass: Send + Sync {
    /// Get the pass name (used for logging and by-name construction).
    fn name(&self) -> &str;

    /// Run the pass on the given module.
    ///
    /// # Arguments
    ///
    /// * `module` - The module to transform (mutable).
    /// * `registry` - Op-kind traits and shape functions.
    fn run(&self, module: &mut Module, registry: &OpRegistry) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOpPass;

    impl Pass for NoOpPass {
        fn name(&self) -> &str {
            "noop"
        }

        fn run(&self, _module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_pass_trait() {
        let pass: Box<dyn Pass> = Box::new(NoOpPass);
        assert_eq!(pass.name(), "noop");
        let mut module = Module::new();
        assert!(!pass.run(&mut module, &OpRegistry::new()).unwrap());
    }
}
