// =============================================================================
// Exit Management Module
// =============================================================================
//
// Breakeven / trailing stop state machine and the R-multiple partial exit.
// Both are driven once per tick by the position engine with the same price
// observation.

pub mod partial;
pub mod trailing;
