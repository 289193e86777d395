use std::rc::Rc;

use crate::col::ColumnDefinition;
use crate::completion::Completion;
use crate::constant::StatusFlags;
use crate::opts::Opts;
use crate::param::Argument;

/// The statement-level commands a live MySQL connection performs
///
/// Implemented by the protocol layer; every command is accepted right away and its
/// result is delivered through the returned [`Completion`].
pub trait Connection: Sized + 'static {
    type ResultSet: 'static;

    /// Whether commands sent now can still reach the server
    fn is_alive(&self) -> bool;

    fn opts(&self) -> &Opts<Self>;

    /// `COM_STMT_SEND_LONG_DATA`: stream `data` into placeholder `slot`
    fn bind_param(&self, statement_id: u32, slot: usize, data: &[u8]) -> Completion<()>;

    /// `COM_STMT_EXECUTE` with one argument per placeholder
    fn execute(
        &self,
        statement_id: u32,
        query: &str,
        params: &[ColumnDefinition],
        args: &[Argument],
    ) -> Completion<Self::ResultSet>;

    /// `COM_STMT_CLOSE`; the server sends no response
    fn close_statement(&self, statement_id: u32) -> Completion<()>;

    /// `COM_STMT_RESET`
    fn reset_statement(&self, statement_id: u32) -> Completion<()>;

    /// `COM_STMT_FETCH`
    fn fetch_statement(&self, statement_id: u32) -> Completion<Self::ResultSet>;

    fn connection_info(&self) -> ConnectionInfo;
}

/// Server facts learned during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: u64,
    pub server_version: String,
    pub host: String,
    pub port: u16,
    pub status_flags: StatusFlags,
}

/// A statement prepared again on a replacement connection
pub struct Restored<C> {
    pub connection: Rc<C>,
    pub statement_id: u32,
}

/// Opens a replacement connection and prepares the given query on it
pub type RestoreFactory<C> = Rc<dyn Fn(&str) -> Completion<Restored<C>>>;
