use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker, ready};

use color_eyre::eyre::eyre;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// A value or a failure that becomes available later
///
/// Every operation on a prepared statement returns one of these. It resolves exactly once;
/// awaiting it yields the result. Dropping it discards the result but never cancels the
/// operation that produces it.
pub struct Completion<T> {
    state: State<T>,
    driver: Option<Rc<dyn Drive>>,
}

enum State<T> {
    Ready(Option<Result<T>>),
    /// The completer answers with the completion that carries the result
    Waiting(oneshot::Receiver<Completion<T>>),
    All(VecDeque<Completion<T>>),
}

/// Work that has to make progress before a completion can resolve
pub(crate) trait Drive {
    fn drive(&self, cx: &mut Context<'_>);
}

// No field is ever pinned structurally.
impl<T> Unpin for Completion<T> {}

/// The producing side of a [`Completion`]
pub struct Completer<T> {
    tx: oneshot::Sender<Completion<T>>,
}

impl<T> Completion<T> {
    /// A completion that has already resolved
    pub fn ready(result: Result<T>) -> Self {
        Self {
            state: State::Ready(Some(result)),
            driver: None,
        }
    }

    /// A pending completion and the handle that resolves it
    pub fn pending() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            Completer { tx },
            Self {
                state: State::Waiting(rx),
                driver: None,
            },
        )
    }

    /// Resolves with the result of the last part once every part has succeeded,
    /// or with the first failure in order
    pub fn all(parts: Vec<Completion<T>>) -> Self {
        let mut parts = VecDeque::from(parts);
        if parts.len() == 1
            && let Some(single) = parts.pop_front()
        {
            return single;
        }
        Self {
            state: State::All(parts),
            driver: None,
        }
    }

    /// Poll `driver` whenever this completion is polled
    pub(crate) fn driven_by(mut self, driver: Rc<dyn Drive>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Take the result without waiting, if it is already available
    pub fn try_take(&mut self) -> Option<Result<T>> {
        let mut cx = Context::from_waker(Waker::noop());
        loop {
            self.drive(&mut cx);
            let next = match &mut self.state {
                State::Ready(result) => return result.take(),
                State::Waiting(rx) => match rx.try_recv() {
                    Ok(next) => next,
                    Err(oneshot::error::TryRecvError::Empty) => return None,
                    Err(oneshot::error::TryRecvError::Closed) => return Some(Err(dropped())),
                },
                State::All(parts) => {
                    while let Some(front) = parts.front_mut() {
                        let result = front.try_take()?;
                        parts.pop_front();
                        if result.is_err() || parts.is_empty() {
                            return Some(result);
                        }
                    }
                    return Some(Err(empty_join()));
                }
            };
            self.adopt(next);
        }
    }

    fn drive(&self, cx: &mut Context<'_>) {
        if let Some(driver) = &self.driver {
            driver.drive(cx);
        }
    }

    /// Continue as `next`, keeping the current driver unless `next` brings its own
    fn adopt(&mut self, next: Completion<T>) {
        self.state = next.state;
        if next.driver.is_some() {
            self.driver = next.driver;
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            this.drive(cx);
            let next = match &mut this.state {
                State::Ready(result) => {
                    return Poll::Ready(result.take().unwrap_or_else(|| {
                        Err(Error::LibraryBug(eyre!("completion polled after it resolved")))
                    }));
                }
                State::Waiting(rx) => {
                    let received = ready!(Pin::new(rx).poll(cx));
                    received.unwrap_or_else(|_recv_err| Completion::ready(Err(dropped())))
                }
                State::All(parts) => loop {
                    let Some(front) = parts.front_mut() else {
                        return Poll::Ready(Err(empty_join()));
                    };
                    let result = ready!(Pin::new(front).poll(cx));
                    parts.pop_front();
                    if result.is_err() || parts.is_empty() {
                        return Poll::Ready(result);
                    }
                },
            };
            this.adopt(next);
        }
    }
}

impl<T> Completer<T> {
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: Error) {
        self.complete(Err(error));
    }

    /// Resolve the paired completion; a no-op when the caller already dropped it
    pub fn complete(self, result: Result<T>) {
        self.forward(Completion::ready(result));
    }

    /// Resolve with whatever `completion` resolves to
    ///
    /// The paired completion takes `completion` over and polls it in its own place.
    pub fn forward(self, completion: Completion<T>) {
        let _ = self.tx.send(completion);
    }
}

fn dropped() -> Error {
    Error::LibraryBug(eyre!("completion dropped before it resolved"))
}

fn empty_join() -> Error {
    Error::LibraryBug(eyre!("joined an empty set of completions"))
}
