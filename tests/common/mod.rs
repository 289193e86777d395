//! Spy connection recording every statement command in the order it was issued

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use zero_mysql_stmt::col::ColumnDefinition;
use zero_mysql_stmt::constant::StatusFlags;
use zero_mysql_stmt::error::Error;
use zero_mysql_stmt::{
    Argument, Completer, Completion, Connection, ConnectionInfo, Opts, ParamId, Restored,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Bind {
        conn: u64,
        stmt: u32,
        slot: usize,
        data: Vec<u8>,
    },
    Execute {
        conn: u64,
        stmt: u32,
        query: String,
        params: Vec<ColumnDefinition>,
        args: Vec<Argument>,
    },
    Close {
        conn: u64,
        stmt: u32,
    },
    Reset {
        conn: u64,
        stmt: u32,
    },
    Fetch {
        conn: u64,
        stmt: u32,
    },
}

/// What the spy answers to execute and fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub connection_id: u64,
    pub statement_id: u32,
    pub args: Vec<Argument>,
}

#[derive(Clone, Default)]
pub struct CallLog(Rc<RefCell<Vec<Call>>>);

impl CallLog {
    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    fn push(&self, call: Call) {
        self.0.borrow_mut().push(call);
    }
}

pub struct PendingRestore {
    pub query: String,
    pub done: Completer<Restored<SpyConn>>,
}

/// Restore factory whose attempts stay pending until the test resolves them
#[derive(Clone, Default)]
pub struct Restores(Rc<RefCell<Vec<PendingRestore>>>);

impl Restores {
    pub fn factory(&self) -> impl Fn(&str) -> Completion<Restored<SpyConn>> + 'static {
        let attempts = self.clone();
        move |query: &str| {
            let (done, completion) = Completion::pending();
            attempts.0.borrow_mut().push(PendingRestore {
                query: query.to_string(),
                done,
            });
            completion
        }
    }

    pub fn count(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn next(&self) -> PendingRestore {
        let mut attempts = self.0.borrow_mut();
        assert!(!attempts.is_empty(), "no restore was requested");
        attempts.remove(0)
    }
}

pub struct SpyConn {
    pub id: u64,
    alive: Cell<bool>,
    fail_binds: Cell<bool>,
    log: CallLog,
    opts: Opts<SpyConn>,
}

impl SpyConn {
    pub fn new(id: u64, log: &CallLog) -> Rc<Self> {
        Self::with_opts(id, log, Opts::default())
    }

    pub fn with_opts(id: u64, log: &CallLog, opts: Opts<SpyConn>) -> Rc<Self> {
        Rc::new(Self {
            id,
            alive: Cell::new(true),
            fail_binds: Cell::new(false),
            log: log.clone(),
            opts,
        })
    }

    /// A connection that restores through `restores` once it dies
    pub fn restorable(id: u64, log: &CallLog, restores: &Restores) -> Rc<Self> {
        Self::with_opts(id, log, Opts::default().with_restore(restores.factory()))
    }

    pub fn kill(&self) {
        self.alive.set(false);
    }

    pub fn fail_binds(&self) {
        self.fail_binds.set(true);
    }
}

impl Connection for SpyConn {
    type ResultSet = Outcome;

    fn is_alive(&self) -> bool {
        self.alive.get()
    }

    fn opts(&self) -> &Opts<Self> {
        &self.opts
    }

    fn bind_param(&self, statement_id: u32, slot: usize, data: &[u8]) -> Completion<()> {
        self.log.push(Call::Bind {
            conn: self.id,
            stmt: statement_id,
            slot,
            data: data.to_vec(),
        });
        if self.fail_binds.get() {
            return Completion::ready(Err(Error::ServerError("Unknown prepared statement handler".to_string())));
        }
        Completion::ready(Ok(()))
    }

    fn execute(
        &self,
        statement_id: u32,
        query: &str,
        params: &[ColumnDefinition],
        args: &[Argument],
    ) -> Completion<Outcome> {
        self.log.push(Call::Execute {
            conn: self.id,
            stmt: statement_id,
            query: query.to_string(),
            params: params.to_vec(),
            args: args.to_vec(),
        });
        Completion::ready(Ok(Outcome {
            connection_id: self.id,
            statement_id,
            args: args.to_vec(),
        }))
    }

    fn close_statement(&self, statement_id: u32) -> Completion<()> {
        self.log.push(Call::Close {
            conn: self.id,
            stmt: statement_id,
        });
        Completion::ready(Ok(()))
    }

    fn reset_statement(&self, statement_id: u32) -> Completion<()> {
        self.log.push(Call::Reset {
            conn: self.id,
            stmt: statement_id,
        });
        Completion::ready(Ok(()))
    }

    fn fetch_statement(&self, statement_id: u32) -> Completion<Outcome> {
        self.log.push(Call::Fetch {
            conn: self.id,
            stmt: statement_id,
        });
        Completion::ready(Ok(Outcome {
            connection_id: self.id,
            statement_id,
            args: Vec::new(),
        }))
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id,
            server_version: "8.0.36".to_string(),
            host: "localhost".to_string(),
            port: 3306,
            status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
        }
    }
}

pub fn no_args() -> Vec<(ParamId, Vec<u8>)> {
    Vec::new()
}

pub fn given(data: &str) -> Argument {
    Argument::Given(data.as_bytes().to_vec())
}

pub fn bind(conn: u64, stmt: u32, slot: usize, data: &str) -> Call {
    Call::Bind {
        conn,
        stmt,
        slot,
        data: data.as_bytes().to_vec(),
    }
}
