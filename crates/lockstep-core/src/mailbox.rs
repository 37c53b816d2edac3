use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A deferred call executed exactly once on the consumer thread, with mutable
/// access to the consumer's context.
pub type Call<C> = Box<dyn FnOnce(&mut C) + Send>;

enum Payload<C> {
    Call(Call<C>),
    SetCanWait(bool),
}

struct Message<C> {
    payload: Payload<C>,
    id: u64,
    sync: bool,
    breakpoint: bool,
}

struct Inner<C> {
    calls: VecDeque<Message<C>>,
    can_wait: bool,
    /// Id handed to the most recently enqueued message.
    issued: u64,
    /// Id of the last completed synchronous message. `None` once released.
    processed: Option<u64>,
}

/// Ordered command queue between any number of producer threads and a single
/// consumer thread.
///
/// Producers enqueue calls with [`Mailbox::send_call`] or [`Mailbox::post_call`];
/// the consumer drains them with [`Mailbox::receive_call`]. Calls run outside
/// the queue lock, so a call may itself enqueue further calls. A synchronous
/// send blocks until its own call has run, or until the mailbox is released.
///
/// A synchronous send issued from the consumer thread never completes; only
/// producers may wait.
pub struct Mailbox<C> {
    inner: Mutex<Inner<C>>,
    call_available: Condvar,
    call_finished: Condvar,
}

impl<C> Mailbox<C> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                calls: VecDeque::new(),
                can_wait: true,
                issued: 0,
                processed: Some(0),
            }),
            call_available: Condvar::new(),
            call_finished: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `call`. Blocks until it has executed when `wait_for_completion`
    /// is set (and waiting is enabled) or when `breakpoint` is set.
    ///
    /// Does nothing once the mailbox has been released.
    pub fn send_call<F>(&self, call: F, wait_for_completion: bool, breakpoint: bool)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.post(Payload::Call(Box::new(call)), wait_for_completion, breakpoint);
    }

    /// Enqueue `call` without waiting for it.
    pub fn post_call<F>(&self, call: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.post(Payload::Call(Box::new(call)), false, false);
    }

    /// Barrier: returns once every previously enqueued call has executed.
    pub fn flush_calls(&self) {
        self.send_call(|_| {}, true, false);
    }

    fn post(&self, payload: Payload<C>, wait_for_completion: bool, breakpoint: bool) {
        let mut inner = self.lock();
        if inner.processed.is_none() {
            return;
        }

        inner.issued += 1;
        let id = inner.issued;
        let sync = (wait_for_completion && inner.can_wait) || breakpoint;
        inner.calls.push_back(Message {
            payload,
            id,
            sync,
            breakpoint,
        });
        self.call_available.notify_all();

        if sync {
            let _inner = self
                .call_finished
                .wait_while(inner, |inner| inner.processed.is_some_and(|done| done < id))
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.lock().calls.is_empty()
    }

    /// Whether [`Mailbox::release`] has been called without a later reset.
    pub fn is_released(&self) -> bool {
        self.lock().processed.is_none()
    }

    /// Block until a call is available or the mailbox is released.
    pub fn wait_for_call(&self) {
        let inner = self.lock();
        let _inner = self
            .call_available
            .wait_while(inner, |inner| {
                inner.calls.is_empty() && inner.processed.is_some()
            })
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like [`Mailbox::wait_for_call`] but gives up after `timeout`. Returns
    /// whether a call is pending.
    pub fn wait_for_call_timeout(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let (inner, _) = self
            .call_available
            .wait_timeout_while(inner, timeout, |inner| {
                inner.calls.is_empty() && inner.processed.is_some()
            })
            .unwrap_or_else(PoisonError::into_inner);
        !inner.calls.is_empty()
    }

    /// Pop and execute the oldest call. Returns whether it was a breakpoint
    /// call; returns `false` when the queue is empty.
    pub fn receive_call(&self, ctx: &mut C) -> bool {
        let message = {
            let mut inner = self.lock();
            match inner.calls.pop_front() {
                Some(message) => message,
                None => return false,
            }
        };

        match message.payload {
            Payload::Call(call) => call(ctx),
            Payload::SetCanWait(enabled) => self.lock().can_wait = enabled,
        }

        if message.sync {
            let mut inner = self.lock();
            if let Some(done) = inner.processed.as_mut() {
                *done = (*done).max(message.id);
            }
            drop(inner);
            self.call_finished.notify_all();
        }

        message.breakpoint
    }

    /// Drain calls until a breakpoint call has executed or the mailbox is
    /// released.
    pub fn process_until_breakpoint(&self, ctx: &mut C) {
        loop {
            self.wait_for_call();
            if !self.is_pending() && self.is_released() {
                return;
            }
            if self.receive_call(ctx) {
                return;
            }
        }
    }

    /// Toggle whether `wait_for_completion` sends block. The flag flips from
    /// the consumer thread once every earlier call has run; this call blocks
    /// until then.
    pub fn set_can_wait(&self, enabled: bool) {
        self.post(Payload::SetCanWait(enabled), true, true);
    }

    /// Drop every queued call and wake all waiters. Later sends are ignored
    /// until [`Mailbox::reset`].
    pub fn release(&self) {
        let dropped = {
            let mut inner = self.lock();
            inner.processed = None;
            std::mem::take(&mut inner.calls)
        };
        self.call_finished.notify_all();
        self.call_available.notify_all();
        drop(dropped);
    }

    /// Release, then accept sends again.
    pub fn reset(&self) {
        self.release();
        let mut inner = self.lock();
        inner.processed = Some(inner.issued);
    }
}

impl<C> Default for Mailbox<C> {
    fn default() -> Self {
        Self::new()
    }
}
