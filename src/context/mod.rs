pub mod vars;

pub use vars::{VariableContext, VariableContextBuilder};
