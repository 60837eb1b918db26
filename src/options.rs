// src/options.rs
//
// Compiler options relevant to expression lowering. The full option record
// lives with the driver; lowering only reads these two switches.

#[derive(Debug, Clone, Copy)]
pub struct CompilerOptions {
    /// When false, every projection is compiled with the direct strategy and
    /// non-SQL-representable results become placement errors.
    pub split_projections: bool,
    /// Instrument interpreter expressions with a check that the enclosing
    /// lexical block is still live at evaluation time.
    pub scope_checks: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            split_projections: true,
            scope_checks: false,
        }
    }
}
