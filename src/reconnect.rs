use std::rc::Rc;

use crossbeam_queue::SegQueue;
use tracing::warn;

use crate::col::ColumnDefinition;
use crate::completion::{Completer, Completion};
use crate::conn::Connection;
use crate::constant::CommandByte;
use crate::error::Error;
use crate::param::Argument;

/// A statement command issued while no live connection was available
pub enum BufferedCall<C: Connection> {
    BindParam {
        statement_id: u32,
        slot: usize,
        data: Vec<u8>,
        done: Completer<()>,
    },
    Execute {
        statement_id: u32,
        query: Rc<str>,
        params: Vec<ColumnDefinition>,
        args: Vec<Argument>,
        done: Completer<C::ResultSet>,
    },
    ResetStatement {
        statement_id: u32,
        done: Completer<()>,
    },
    FetchStatement {
        statement_id: u32,
        done: Completer<C::ResultSet>,
    },
}

impl<C: Connection> BufferedCall<C> {
    pub fn command(&self) -> CommandByte {
        match self {
            BufferedCall::BindParam { .. } => CommandByte::StmtSendLongData,
            BufferedCall::Execute { .. } => CommandByte::StmtExecute,
            BufferedCall::ResetStatement { .. } => CommandByte::StmtReset,
            BufferedCall::FetchStatement { .. } => CommandByte::StmtFetch,
        }
    }

    /// Statement id the call was issued against
    pub fn statement_id(&self) -> u32 {
        match self {
            BufferedCall::BindParam { statement_id, .. }
            | BufferedCall::Execute { statement_id, .. }
            | BufferedCall::ResetStatement { statement_id, .. }
            | BufferedCall::FetchStatement { statement_id, .. } => *statement_id,
        }
    }

    pub fn fail(self, error: Error) {
        match self {
            BufferedCall::BindParam { done, .. } | BufferedCall::ResetStatement { done, .. } => {
                done.fail(error);
            }
            BufferedCall::Execute { done, .. } | BufferedCall::FetchStatement { done, .. } => {
                done.fail(error);
            }
        }
    }

    /// Issue the call on `conn` against `statement_id` and resolve the original completion
    /// with its outcome. An execute is sent with `params` instead of the definitions it
    /// was recorded with.
    pub fn replay(self, conn: &C, statement_id: u32, params: &[ColumnDefinition]) {
        if self.statement_id() != statement_id {
            tracing::trace!(
                command = self.command().name(),
                stale = self.statement_id(),
                statement_id,
                "rewriting statement id"
            );
        }
        match self {
            BufferedCall::BindParam {
                slot, data, done, ..
            } => done.forward(conn.bind_param(statement_id, slot, &data)),
            BufferedCall::Execute {
                query, args, done, ..
            } => done.forward(conn.execute(statement_id, &query, params, &args)),
            BufferedCall::ResetStatement { done, .. } => {
                done.forward(conn.reset_statement(statement_id));
            }
            BufferedCall::FetchStatement { done, .. } => {
                done.forward(conn.fetch_statement(statement_id));
            }
        }
    }
}

/// Stands in for the connection while a replacement is being prepared
///
/// Every command is recorded and answered with a pending completion; nothing is sent
/// and nothing resolves until the calls are taken out and replayed or failed.
pub struct ReconnectBuffer<C: Connection> {
    calls: SegQueue<BufferedCall<C>>,
}

impl<C: Connection> ReconnectBuffer<C> {
    pub fn new() -> Self {
        Self {
            calls: SegQueue::new(),
        }
    }

    pub fn bind_param(&self, statement_id: u32, slot: usize, data: &[u8]) -> Completion<()> {
        let (done, completion) = Completion::pending();
        self.calls.push(BufferedCall::BindParam {
            statement_id,
            slot,
            data: data.to_vec(),
            done,
        });
        completion
    }

    pub fn execute(
        &self,
        statement_id: u32,
        query: &Rc<str>,
        params: &[ColumnDefinition],
        args: Vec<Argument>,
    ) -> Completion<C::ResultSet> {
        let (done, completion) = Completion::pending();
        self.calls.push(BufferedCall::Execute {
            statement_id,
            query: Rc::clone(query),
            params: params.to_vec(),
            args,
            done,
        });
        completion
    }

    pub fn reset_statement(&self, statement_id: u32) -> Completion<()> {
        let (done, completion) = Completion::pending();
        self.calls.push(BufferedCall::ResetStatement { statement_id, done });
        completion
    }

    pub fn fetch_statement(&self, statement_id: u32) -> Completion<C::ResultSet> {
        let (done, completion) = Completion::pending();
        self.calls.push(BufferedCall::FetchStatement { statement_id, done });
        completion
    }

    /// The oldest recorded call
    pub fn get_call(&self) -> Option<BufferedCall<C>> {
        self.calls.pop()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl<C: Connection> Default for ReconnectBuffer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> Drop for ReconnectBuffer<C> {
    fn drop(&mut self) {
        let mut abandoned = 0;
        while let Some(call) = self.get_call() {
            call.fail(Error::ConnectionLost);
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(abandoned, "reconnect buffer dropped with pending calls");
        }
    }
}
