use crate::error::{AckError, QueueError};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Handle as TokioHandle, RuntimeFlavor};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Number of scheduler passes a non-blocking taker gets to call its
/// [`AckHandle`] before the handle is revoked.
///
/// The window opens when the take future resolves. The revocation runs on a
/// separate Tokio task that yields this many times, so any code the taker runs
/// before its own next suspension point is always inside the window.
///
/// Timed revocation only happens on a current-thread runtime, where the
/// revoking task cannot run in parallel with the taker. On any other runtime
/// (or outside a runtime) a non-blocking handle stays valid until it is
/// answered or dropped.
pub const REVOCATION_TICKS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckOutcome {
  Pending,
  Confirmed,
  Declined,
}

/// Per-take acknowledgment state, shared by the queue and the handle.
#[derive(Debug)]
struct AckState {
  outcome: AckOutcome,
  revoked: bool,
}

/// A waiting take request. Tickets are served strictly in issue order.
struct Ticket<T: Clone + Send + 'static> {
  id: u64,
  blocking: bool,
  tx: oneshot::Sender<(T, AckHandle<T>)>,
}

struct QueueState<T: Clone + Send + 'static> {
  /// Buffered values tagged with their insertion sequence number.
  values: VecDeque<(u64, T)>,
  tickets: VecDeque<Ticket<T>>,
  /// Ticket currently holding first claim on the front value.
  active: Option<u64>,
  next_seq: u64,
  next_ticket_id: u64,
  closed: bool,
}

struct Shared<T: Clone + Send + 'static> {
  state: Mutex<QueueState<T>>,
}

/// An unbounded FIFO queue whose consumers must acknowledge what they take.
///
/// A taker receives the front value together with an [`AckHandle`]. Confirming
/// the handle removes the value; declining it (or letting a non-blocking
/// handle lapse) leaves the value at the front for the next taker in line.
/// Take requests are served one at a time in the order they were issued, so
/// two takers never hold an acknowledgment for the same value at once.
///
/// Cloning an `AckQueue` yields another handle to the same queue.
pub struct AckQueue<T: Clone + Send + 'static> {
  shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Clone for AckQueue<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T: Clone + Send + 'static> fmt::Debug for AckQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.shared.state.lock();
    f.debug_struct("AckQueue")
      .field("len", &state.values.len())
      .field("waiting_takers", &state.tickets.len())
      .field("active_ticket", &state.active)
      .field("closed", &state.closed)
      .finish()
  }
}

impl<T: Clone + Send + 'static> Default for AckQueue<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Send + 'static> AckQueue<T> {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(QueueState {
          values: VecDeque::new(),
          tickets: VecDeque::new(),
          active: None,
          next_seq: 0,
          next_ticket_id: 0,
          closed: false,
        }),
      }),
    }
  }

  /// Appends `value` to the tail and hands it to the next taker if one is
  /// waiting and no acknowledgment is outstanding.
  pub fn add(&self, value: T) -> Result<(), QueueError> {
    let mut state = self.shared.state.lock();
    if state.closed {
      return Err(QueueError::Closed);
    }
    let seq = state.next_seq;
    state.next_seq += 1;
    state.values.push_back((seq, value));
    trace!(seq, len = state.values.len(), "AckQueue: value added.");
    dispatch(&self.shared, &mut state);
    Ok(())
  }

  /// Takes the front value and removes it from the queue.
  pub async fn take(&self) -> Result<T, QueueError> {
    // A blocking ticket is never revoked, so the confirm below cannot fail.
    let (value, ack) = self.acquire(true).await?;
    let _ = ack.confirm();
    Ok(value)
  }

  /// Takes the front value without removing it.
  ///
  /// With `blocking == false` the returned handle is revoked
  /// [`REVOCATION_TICKS`] scheduler passes after this future resolves; an
  /// unanswered handle then counts as declined and the value goes to the next
  /// taker. With `blocking == true` the next taker waits until the handle is
  /// confirmed, declined or dropped.
  pub async fn take_ack(&self, blocking: bool) -> Result<(T, AckHandle<T>), QueueError> {
    let (value, ack) = self.acquire(blocking).await?;
    if !blocking {
      ack.arm_revocation();
    }
    Ok((value, ack))
  }

  /// Shorthand for `take_ack(true)`.
  pub async fn take_blocking_ack(&self) -> Result<(T, AckHandle<T>), QueueError> {
    self.take_ack(true).await
  }

  async fn acquire(&self, blocking: bool) -> Result<(T, AckHandle<T>), QueueError> {
    let (ticket_id, rx) = {
      let mut state = self.shared.state.lock();
      if state.closed {
        return Err(QueueError::Closed);
      }
      let (tx, rx) = oneshot::channel();
      let id = state.next_ticket_id;
      state.next_ticket_id += 1;
      state.tickets.push_back(Ticket { id, blocking, tx });
      trace!(ticket_id = id, blocking, waiting = state.tickets.len(), "AckQueue: take request issued.");
      dispatch(&self.shared, &mut state);
      (id, rx)
    };
    let mut pending = PendingTake {
      shared: &self.shared,
      ticket_id,
      served: false,
    };
    let taken = rx.await.map_err(|_| QueueError::Closed);
    pending.served = true;
    taken
  }

  /// Number of take requests waiting for their turn.
  pub fn waiting_takers(&self) -> usize {
    self.shared.state.lock().tickets.len()
  }

  /// Number of values not yet confirmed.
  pub fn len(&self) -> usize {
    self.shared.state.lock().values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Ordered snapshot of the buffered values.
  pub fn iter(&self) -> std::vec::IntoIter<T> {
    let state = self.shared.state.lock();
    state
      .values
      .iter()
      .map(|(_, value)| value.clone())
      .collect::<Vec<_>>()
      .into_iter()
  }

  /// Removes and returns every buffered value.
  ///
  /// An outstanding acknowledgment for a drained value becomes a no-op
  /// confirm; it never pops a value added later.
  pub fn drain(&self) -> Vec<T> {
    let mut state = self.shared.state.lock();
    let drained: Vec<T> = state.values.drain(..).map(|(_, value)| value).collect();
    debug!(count = drained.len(), "AckQueue: drained buffered values.");
    drained
  }

  /// Closes the queue. Waiting and future take requests fail with
  /// [`QueueError::Closed`], as does `add`. Buffered values stay available to
  /// [`drain`](Self::drain).
  pub fn close(&self) {
    let mut state = self.shared.state.lock();
    if state.closed {
      return;
    }
    state.closed = true;
    let waiting = state.tickets.len();
    // Dropping the senders wakes every waiting taker with an error.
    state.tickets.clear();
    debug!(waiting, buffered = state.values.len(), "AckQueue: closed.");
  }

  pub fn is_closed(&self) -> bool {
    self.shared.state.lock().closed
  }
}

impl<'a, T: Clone + Send + 'static> IntoIterator for &'a AckQueue<T> {
  type Item = T;
  type IntoIter = std::vec::IntoIter<T>;

  fn into_iter(self) -> Self::IntoIter {
    self.iter()
  }
}

/// Withdraws a take request whose future is dropped before it was served.
struct PendingTake<'a, T: Clone + Send + 'static> {
  shared: &'a Arc<Shared<T>>,
  ticket_id: u64,
  served: bool,
}

impl<T: Clone + Send + 'static> Drop for PendingTake<'_, T> {
  fn drop(&mut self) {
    if self.served {
      return;
    }
    let mut state = self.shared.state.lock();
    if let Some(position) = state.tickets.iter().position(|ticket| ticket.id == self.ticket_id) {
      state.tickets.remove(position);
      trace!(
        ticket_id = self.ticket_id,
        waiting = state.tickets.len(),
        "AckQueue: take request withdrawn."
      );
    }
  }
}

/// Serves waiting tickets while no acknowledgment is outstanding.
fn dispatch<T: Clone + Send + 'static>(shared: &Arc<Shared<T>>, state: &mut QueueState<T>) {
  while state.active.is_none() && !state.values.is_empty() {
    let Some(ticket) = state.tickets.pop_front() else {
      return;
    };
    if ticket.tx.is_closed() {
      trace!(ticket_id = ticket.id, "AckQueue: skipping abandoned take request.");
      continue;
    }
    let Some((seq, value)) = state.values.front().map(|(seq, value)| (*seq, value.clone())) else {
      return;
    };

    let handle = AckHandle {
      ticket_id: ticket.id,
      seq,
      blocking: ticket.blocking,
      state: Arc::new(Mutex::new(AckState {
        outcome: AckOutcome::Pending,
        revoked: false,
      })),
      queue: shared.clone(),
    };
    state.active = Some(ticket.id);
    trace!(ticket_id = ticket.id, seq, "AckQueue: front value handed to taker.");

    if let Err((_, handle)) = ticket.tx.send((value, handle)) {
      // Taker went away between the check above and the send.
      handle.disarm();
      state.active = None;
    }
  }
}

fn release<T: Clone + Send + 'static>(shared: &Arc<Shared<T>>, state: &mut QueueState<T>, ticket_id: u64) {
  if state.active == Some(ticket_id) {
    state.active = None;
    dispatch(shared, state);
  }
}

/// One-shot decision on a value obtained from [`AckQueue::take_ack`].
///
/// `ack(true)` removes the value, `ack(false)` leaves it for the next taker.
/// Repeated calls are no-ops until the handle is revoked, after which every
/// call fails with [`AckError::Revoked`]. Dropping an unanswered handle
/// declines it.
pub struct AckHandle<T: Clone + Send + 'static> {
  ticket_id: u64,
  seq: u64,
  blocking: bool,
  state: Arc<Mutex<AckState>>,
  queue: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> fmt::Debug for AckHandle<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("AckHandle")
      .field("ticket_id", &self.ticket_id)
      .field("blocking", &self.blocking)
      .field("outcome", &state.outcome)
      .field("revoked", &state.revoked)
      .finish()
  }
}

impl<T: Clone + Send + 'static> AckHandle<T> {
  pub fn ack(&self, confirm: bool) -> Result<(), AckError> {
    // Lock order is always queue state, then handle state.
    let mut queue = self.queue.state.lock();
    {
      let mut ack = self.state.lock();
      if ack.revoked {
        return Err(AckError::Revoked);
      }
      if ack.outcome != AckOutcome::Pending {
        return Ok(());
      }
      ack.outcome = if confirm {
        AckOutcome::Confirmed
      } else {
        AckOutcome::Declined
      };
    }

    if confirm {
      if queue.values.front().map(|(seq, _)| *seq) == Some(self.seq) {
        queue.values.pop_front();
      }
      trace!(ticket_id = self.ticket_id, seq = self.seq, len = queue.values.len(), "AckQueue: value confirmed.");
    } else {
      trace!(ticket_id = self.ticket_id, seq = self.seq, "AckQueue: value declined.");
    }
    release(&self.queue, &mut queue, self.ticket_id);
    Ok(())
  }

  /// Shorthand for `ack(true)`.
  pub fn confirm(&self) -> Result<(), AckError> {
    self.ack(true)
  }

  /// Shorthand for `ack(false)`.
  pub fn decline(&self) -> Result<(), AckError> {
    self.ack(false)
  }

  pub fn is_revoked(&self) -> bool {
    self.state.lock().revoked
  }

  pub fn is_blocking(&self) -> bool {
    self.blocking
  }

  fn arm_revocation(&self) {
    let runtime = match TokioHandle::try_current() {
      Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::CurrentThread => runtime,
      _ => {
        trace!(
          ticket_id = self.ticket_id,
          "AckQueue: no current-thread runtime, handle stays valid until answered or dropped."
        );
        return;
      }
    };
    let queue = self.queue.clone();
    let state = self.state.clone();
    let ticket_id = self.ticket_id;
    runtime.spawn(async move {
      for _ in 0..REVOCATION_TICKS {
        tokio::task::yield_now().await;
      }
      let mut queue_state = queue.state.lock();
      {
        let mut ack = state.lock();
        if ack.revoked {
          return;
        }
        ack.revoked = true;
        if ack.outcome == AckOutcome::Pending {
          trace!(ticket_id, "AckQueue: unanswered acknowledgment revoked, value stays queued.");
        }
      }
      release(&queue, &mut queue_state, ticket_id);
    });
  }

  /// Marks the handle dead without touching the queue. Only called while the
  /// queue lock is held.
  fn disarm(&self) {
    self.state.lock().revoked = true;
  }
}

impl<T: Clone + Send + 'static> Drop for AckHandle<T> {
  fn drop(&mut self) {
    let unanswered = {
      let ack = self.state.lock();
      !ack.revoked && ack.outcome == AckOutcome::Pending
    };
    if !unanswered {
      return;
    }
    let mut queue = self.queue.state.lock();
    {
      let mut ack = self.state.lock();
      if ack.revoked || ack.outcome != AckOutcome::Pending {
        return;
      }
      ack.outcome = AckOutcome::Declined;
    }
    trace!(ticket_id = self.ticket_id, "AckQueue: unanswered handle dropped, value stays queued.");
    release(&self.queue, &mut queue, self.ticket_id);
  }
}
