pub mod col;
pub mod completion;
pub mod conn;
pub mod constant;
pub mod error;
mod opts;
pub mod param;
pub mod reconnect;
pub mod statement;

pub use completion::{Completer, Completion};
pub use conn::{Connection, ConnectionInfo, RestoreFactory, Restored};
pub use opts::Opts;
pub use param::{Argument, BoundValue, ParamId, ParamLayout};
pub use statement::{PreparedStatement, StatementState};

#[cfg(test)]
mod constant_test;
#[cfg(test)]
mod opts_test;
