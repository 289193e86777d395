use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tracing::{debug, info, instrument, warn};

use crate::col::ColumnDefinition;
use crate::completion::{Completer, Completion, Drive};
use crate::conn::{Connection, ConnectionInfo, Restored};
use crate::error::{Error, Result};
use crate::param::{Argument, BoundValue, ParamId, ParamLayout, SlotKind};
use crate::reconnect::ReconnectBuffer;

/// How far the protocol layer got in describing the result columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatementState {
    Unfetched,
    ColumnsFetched,
}

/// A server-side prepared statement that keeps working across a lost connection
///
/// When the connection is found dead and [`Opts::restore`](crate::Opts::restore) is set,
/// the statement is prepared again on a fresh connection. Commands issued in the meantime
/// are queued and replayed in order once the replacement is ready, after the values
/// bound so far have been streamed again.
///
/// Nothing is spawned. The restore makes progress whenever one of the queued completions
/// is polled, or when the next command is issued on the statement.
///
/// The server-side statement is closed when the handle is dropped.
pub struct PreparedStatement<C: Connection> {
    shared: Rc<RefCell<Shared<C>>>,
}

struct Shared<C: Connection> {
    query: Rc<str>,
    statement_id: u32,
    column_count: usize,
    layout: ParamLayout,
    prebound: BTreeMap<ParamId, BoundValue>,
    params: Vec<ColumnDefinition>,
    columns: Columns,
    waiters: Vec<Completer<Rc<[ColumnDefinition]>>>,
    connection: ConnectionRef<C>,
    closed: bool,
}

enum Columns {
    Collecting(Vec<ColumnDefinition>),
    Fetched(Rc<[ColumnDefinition]>),
}

enum ConnectionRef<C: Connection> {
    Live(Rc<C>),
    Recovering(Recovery<C>),
}

struct Recovery<C: Connection> {
    restoring: Completion<Restored<C>>,
    buffer: ReconnectBuffer<C>,
    lost: Rc<C>,
    /// Values bound before the connection went away
    prebound: BTreeMap<ParamId, BoundValue>,
}

impl<C: Connection> ConnectionRef<C> {
    fn bind_param(&self, statement_id: u32, slot: usize, data: &[u8]) -> Completion<()> {
        match self {
            ConnectionRef::Live(conn) => conn.bind_param(statement_id, slot, data),
            ConnectionRef::Recovering(recovery) => recovery.buffer.bind_param(statement_id, slot, data),
        }
    }

    fn execute(
        &self,
        statement_id: u32,
        query: &Rc<str>,
        params: &[ColumnDefinition],
        args: Vec<Argument>,
    ) -> Completion<C::ResultSet> {
        match self {
            ConnectionRef::Live(conn) => conn.execute(statement_id, query, params, &args),
            ConnectionRef::Recovering(recovery) => {
                recovery.buffer.execute(statement_id, query, params, args)
            }
        }
    }

    fn reset_statement(&self, statement_id: u32) -> Completion<()> {
        match self {
            ConnectionRef::Live(conn) => conn.reset_statement(statement_id),
            ConnectionRef::Recovering(recovery) => recovery.buffer.reset_statement(statement_id),
        }
    }

    fn fetch_statement(&self, statement_id: u32) -> Completion<C::ResultSet> {
        match self {
            ConnectionRef::Live(conn) => conn.fetch_statement(statement_id),
            ConnectionRef::Recovering(recovery) => recovery.buffer.fetch_statement(statement_id),
        }
    }

    /// The most recent real connection, alive or not
    fn connection(&self) -> &Rc<C> {
        match self {
            ConnectionRef::Live(conn) => conn,
            ConnectionRef::Recovering(recovery) => &recovery.lost,
        }
    }

    /// Leave the recovery window, falling back to the lost connection
    fn take_recovery(&mut self) -> Option<Recovery<C>> {
        let ConnectionRef::Recovering(recovery) = self else {
            return None;
        };
        let lost = Rc::clone(&recovery.lost);
        match mem::replace(self, ConnectionRef::Live(lost)) {
            ConnectionRef::Recovering(recovery) => Some(recovery),
            ConnectionRef::Live(_) => None,
        }
    }
}

impl<C: Connection> Shared<C> {
    /// One argument per placeholder. Values passed to execute take precedence over
    /// values bound earlier under the same identifier.
    fn arguments(&self, data: &BTreeMap<ParamId, Vec<u8>>) -> Result<Vec<Argument>> {
        if let Some(unknown) = data.keys().find(|id| !self.layout.contains(id)) {
            return Err(Error::UnknownParameter(unknown.clone()));
        }

        let expected = self.layout.logical_count();
        let actual = data.len()
            + self
                .prebound
                .keys()
                .filter(|id| !data.contains_key(id))
                .count();
        if actual != expected {
            return Err(Error::ArityMismatch { expected, actual });
        }

        self.layout
            .slots()
            .map(|(_, kind)| {
                let id = match kind {
                    SlotKind::Unnamed(index) => ParamId::Index(index),
                    SlotKind::Named(name) => ParamId::Name(name.to_string()),
                };
                if let Some(given) = data.get(&id) {
                    Ok(Argument::Given(given.clone()))
                } else if let Some(bound) = self.prebound.get(&id) {
                    Ok(Argument::Prebound(bound.clone()))
                } else {
                    Err(Error::MissingParameter(id))
                }
            })
            .collect()
    }

    /// Placeholders to stream again after a reconnect, ordered by slot
    fn replay_plan<'a>(
        &self,
        prebound: &'a BTreeMap<ParamId, BoundValue>,
    ) -> Vec<(usize, &'a BoundValue)> {
        let mut plan: Vec<_> = prebound
            .iter()
            .filter_map(|(id, value)| self.layout.resolve(id).ok().map(|slots| (slots, value)))
            .flat_map(|(slots, value)| slots.iter().map(move |&slot| (slot, value)))
            .collect();
        plan.sort_by_key(|(slot, _)| *slot);
        plan
    }

    /// Finish the recovery window once the restore has resolved
    fn poll_restore(&mut self, cx: &mut Context<'_>) {
        let ConnectionRef::Recovering(recovery) = &mut self.connection else {
            return;
        };
        let Poll::Ready(restored) = Pin::new(&mut recovery.restoring).poll(cx) else {
            return;
        };
        self.finish_restore(restored);
    }

    /// Adopt the replacement connection, or fail everything queued while waiting for it
    #[instrument(skip_all)]
    fn finish_restore(&mut self, restored: Result<Restored<C>>) {
        let Some(Recovery {
            buffer, prebound, ..
        }) = self.connection.take_recovery()
        else {
            return;
        };

        match restored {
            Err(error) => {
                let cause = Arc::new(error);
                let mut failed = 0;
                while let Some(call) = buffer.get_call() {
                    call.fail(Error::RestoreFailed(Arc::clone(&cause)));
                    failed += 1;
                }
                // Binds and resets of the window failed, so they must not take effect.
                self.prebound = prebound;
                warn!(error = %cause, failed, "failed to restore connection");
            }
            Ok(Restored {
                connection,
                statement_id,
            }) => {
                let stale = mem::replace(&mut self.statement_id, statement_id);
                self.connection = ConnectionRef::Live(Rc::clone(&connection));

                let plan = self.replay_plan(&prebound);
                let rebound = plan.len();
                for (slot, value) in plan {
                    let mut binding = connection.bind_param(statement_id, slot, value.as_bytes());
                    if let Some(Err(error)) = binding.try_take() {
                        warn!(slot, %error, "failed to bind value again after reconnect");
                    }
                }

                let mut replayed = 0;
                while let Some(call) = buffer.get_call() {
                    call.replay(&connection, statement_id, &self.params);
                    replayed += 1;
                }

                info!(
                    stale,
                    statement_id, rebound, replayed, "statement restored on a new connection"
                );

                if self.closed {
                    let _ = connection.close_statement(statement_id);
                }
            }
        }
    }
}

impl<C: Connection> Drive for RefCell<Shared<C>> {
    fn drive(&self, cx: &mut Context<'_>) {
        if let Ok(mut shared) = self.try_borrow_mut() {
            shared.poll_restore(cx);
        }
    }
}

impl<C: Connection> PreparedStatement<C> {
    /// Wrap a statement the server just prepared on `connection`
    pub fn new(
        connection: Rc<C>,
        query: impl Into<Rc<str>>,
        statement_id: u32,
        column_count: usize,
        layout: ParamLayout,
    ) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                query: query.into(),
                statement_id,
                column_count,
                layout,
                prebound: BTreeMap::new(),
                params: Vec::new(),
                columns: Columns::Collecting(Vec::with_capacity(column_count)),
                waiters: Vec::new(),
                connection: ConnectionRef::Live(connection),
                closed: false,
            })),
        }
    }

    pub fn query(&self) -> Rc<str> {
        Rc::clone(&self.shared.borrow().query)
    }

    /// Server-side id; changes when the statement is prepared again after a reconnect
    pub fn statement_id(&self) -> u32 {
        self.shared.borrow().statement_id
    }

    pub fn column_count(&self) -> usize {
        self.shared.borrow().column_count
    }

    pub fn param_count(&self) -> usize {
        self.shared.borrow().layout.param_count()
    }

    /// Whether commands are currently being queued for a replacement connection
    pub fn is_recovering(&self) -> bool {
        matches!(self.shared.borrow().connection, ConnectionRef::Recovering(_))
    }

    /// The accumulated value bound under `id`, if any
    pub fn prebound(&self, id: impl Into<ParamId>) -> Option<BoundValue> {
        self.shared.borrow().prebound.get(&id.into()).cloned()
    }

    /// The connection to issue commands on: the live one, or a buffer while a
    /// replacement is being prepared
    #[instrument(skip_all)]
    fn current_connection(&self) -> Result<RefMut<'_, Shared<C>>> {
        let lost = {
            let mut shared = self.shared.borrow_mut();
            shared.poll_restore(&mut Context::from_waker(Waker::noop()));
            match &shared.connection {
                ConnectionRef::Live(conn) if !conn.is_alive() => Some((
                    Rc::clone(conn),
                    Rc::clone(&shared.query),
                    shared.statement_id,
                )),
                _ => None,
            }
        };
        let Some((lost, query, statement_id)) = lost else {
            return Ok(self.shared.borrow_mut());
        };

        let Some(restore) = lost.opts().restore.clone() else {
            return Err(Error::ConnectionLost);
        };

        debug!(
            statement_id,
            query = %query,
            "connection went away, preparing statement on a new connection"
        );
        let restoring = restore(&*query);

        let mut shared = self.shared.borrow_mut();
        let prebound = shared.prebound.clone();
        shared.connection = ConnectionRef::Recovering(Recovery {
            restoring,
            buffer: ReconnectBuffer::new(),
            lost,
            prebound,
        });
        Ok(shared)
    }

    /// Completions of queued calls push the restore forward when polled
    fn track<T>(&self, shared: &Shared<C>, completion: Completion<T>) -> Completion<T> {
        if matches!(shared.connection, ConnectionRef::Recovering(_)) {
            completion.driven_by(Rc::clone(&self.shared) as Rc<dyn Drive>)
        } else {
            completion
        }
    }

    /// Bind `data` to every placeholder `id` stands for
    ///
    /// The value is remembered and counts as supplied for later executes. Binding the
    /// same identifier again appends to the stored value. A bind that fails because the
    /// connection could not be restored is forgotten again.
    ///
    /// # Errors
    /// `UnknownParameter` if `id` does not name a parameter of this statement,
    /// `ConnectionLost` if the connection is dead and cannot be restored.
    pub fn bind(&self, id: impl Into<ParamId>, data: impl AsRef<[u8]>) -> Result<Completion<()>> {
        let id = id.into();
        let data = data.as_ref();
        let slots = self.shared.borrow().layout.resolve(&id)?.to_vec();

        let mut guard = self.current_connection()?;
        let shared = &mut *guard;
        let parts = slots
            .iter()
            .map(|&slot| shared.connection.bind_param(shared.statement_id, slot, data))
            .collect();

        shared
            .prebound
            .entry(id)
            .and_modify(|value| value.append(data))
            .or_insert_with(|| BoundValue::new(data));

        Ok(self.track(shared, Completion::all(parts)))
    }

    /// Execute with the given values; identifiers left out fall back to bound values
    ///
    /// # Errors
    /// `UnknownParameter` for a key that is not a parameter, `ArityMismatch` when the given
    /// and bound values together do not cover every parameter exactly once,
    /// `ConnectionLost` if the connection is dead and cannot be restored.
    pub fn execute<I, K, V>(&self, data: I) -> Result<Completion<C::ResultSet>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<ParamId>,
        V: Into<Vec<u8>>,
    {
        let data: BTreeMap<ParamId, Vec<u8>> = data
            .into_iter()
            .map(|(id, value)| (id.into(), value.into()))
            .collect();
        let args = self.shared.borrow().arguments(&data)?;

        let guard = self.current_connection()?;
        let completion = guard
            .connection
            .execute(guard.statement_id, &guard.query, &guard.params, args);
        Ok(self.track(&guard, completion))
    }

    /// Reset the server-side statement, discarding every bound value
    pub fn reset(&self) -> Result<Completion<()>> {
        let mut guard = self.current_connection()?;
        guard.prebound.clear();
        let completion = guard.connection.reset_statement(guard.statement_id);
        Ok(self.track(&guard, completion))
    }

    /// Fetch rows from an open cursor
    pub fn fetch(&self) -> Result<Completion<C::ResultSet>> {
        let guard = self.current_connection()?;
        let completion = guard.connection.fetch_statement(guard.statement_id);
        Ok(self.track(&guard, completion))
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.shared.borrow().connection.connection().connection_info()
    }

    /// Result column definitions, available once the protocol layer has read them
    pub fn fields(&self) -> Completion<Rc<[ColumnDefinition]>> {
        let mut guard = self.shared.borrow_mut();
        let shared = &mut *guard;
        match &shared.columns {
            Columns::Fetched(columns) => Completion::ready(Ok(Rc::clone(columns))),
            Columns::Collecting(_) => {
                let (waiter, completion) = Completion::pending();
                shared.waiters.push(waiter);
                completion
            }
        }
    }

    /// Record the parameter definitions sent by the server
    pub fn define_params(&self, params: Vec<ColumnDefinition>) {
        self.shared.borrow_mut().params = params;
    }

    /// Record one result column definition; ignored once the columns are published
    pub fn define_column(&self, column: ColumnDefinition) {
        match &mut self.shared.borrow_mut().columns {
            Columns::Collecting(columns) => columns.push(column),
            Columns::Fetched(_) => {
                warn!(column = %column.name, "column metadata already published, ignoring");
            }
        }
    }

    /// Advance the metadata state. Reaching `ColumnsFetched` publishes the columns to
    /// every pending [`fields`](Self::fields) call; it happens at most once.
    pub fn update_state(&self, state: StatementState) {
        if state != StatementState::ColumnsFetched {
            return;
        }
        let mut guard = self.shared.borrow_mut();
        let shared = &mut *guard;
        let Columns::Collecting(columns) = &mut shared.columns else {
            return;
        };
        let published: Rc<[ColumnDefinition]> = mem::take(columns).into();
        shared.columns = Columns::Fetched(Rc::clone(&published));

        debug!(
            columns = published.len(),
            waiters = shared.waiters.len(),
            "column metadata fetched"
        );
        for waiter in shared.waiters.drain(..) {
            waiter.succeed(Rc::clone(&published));
        }
    }

    pub fn state(&self) -> StatementState {
        match self.shared.borrow().columns {
            Columns::Collecting(_) => StatementState::Unfetched,
            Columns::Fetched(_) => StatementState::ColumnsFetched,
        }
    }

    /// Close the server-side statement now instead of on drop
    ///
    /// Returns `None` when there is nothing to close on a live connection. A statement
    /// closed during recovery is closed on the replacement connection once it is ready.
    pub fn close(self) -> Option<Completion<()>> {
        self.release()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }

    fn release(&self) -> Option<Completion<()>> {
        let Ok(mut shared) = self.shared.try_borrow_mut() else {
            warn!("statement released while in use, leaking the server-side statement");
            return None;
        };
        if shared.closed {
            return None;
        }
        shared.closed = true;
        for waiter in shared.waiters.drain(..) {
            waiter.fail(Error::ConnectionLost);
        }
        match &shared.connection {
            ConnectionRef::Live(conn) if conn.is_alive() => {
                Some(conn.close_statement(shared.statement_id))
            }
            ConnectionRef::Live(_) => None,
            ConnectionRef::Recovering(_) => {
                debug!(
                    statement_id = shared.statement_id,
                    "closing once the connection is restored"
                );
                None
            }
        }
    }
}

impl<C: Connection> Drop for PreparedStatement<C> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl<C: Connection> std::fmt::Debug for PreparedStatement<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("PreparedStatement")
            .field("query", &shared.query)
            .field("statement_id", &shared.statement_id)
            .field("column_count", &shared.column_count)
            .field("layout", &shared.layout)
            .field("prebound", &shared.prebound)
            .field(
                "recovering",
                &matches!(shared.connection, ConnectionRef::Recovering(_)),
            )
            .field("closed", &shared.closed)
            .finish_non_exhaustive()
    }
}
