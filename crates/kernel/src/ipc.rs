//! Kernel IPC endpoints: phones and answerboxes.
//!
//! A phone is the client end of a connection; it points at the callee
//! task's answerbox. Calls queue in the callee's box and answers travel
//! back to the caller's box. Killing a task hangs up its phones and
//! force-answers everything still waiting in its box.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use thiserror::Error;

use opal_abi::process::RawIpcPayload;

use crate::sync::waitq::{SleepFlags, SleepResult, WaitQueue};
use crate::task::{self, Task, TaskId};
use crate::utils::locks::SpinLock;
use crate::debug;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum IpcError {
    #[error("phone index out of range or not connected")]
    BadPhone,
    #[error("the peer hung up")]
    HungUp,
    #[error("no such call")]
    BadCall,
    #[error("interrupted")]
    Interrupted,
    #[error("nothing pending")]
    WouldBlock,
}

/// Answer code delivered when a connection dies under a pending call.
pub const ANSWER_HUNG_UP: usize = usize::MAX;

/// An in-flight call.
#[derive(Debug, Clone)]
pub struct Call {
    pub id: u64,
    pub payload: RawIpcPayload,
    pub sender: TaskId,
}

/// A completed call on its way back.
#[derive(Debug, Clone)]
pub struct Answer {
    pub call_id: u64,
    pub retval: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneState {
    Free,
    /// Connected to the answerbox of this task.
    Connected(TaskId),
    HungUp,
}

/// The client end of a connection.
#[derive(Debug)]
pub struct Phone {
    state: SpinLock<PhoneState>,
}

impl Phone {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(PhoneState::Free),
        }
    }

    pub fn state(&self) -> PhoneState {
        *self.state.lock()
    }

    fn connect(&self, callee: TaskId) -> Result<(), IpcError> {
        let mut state = self.state.lock();
        if *state != PhoneState::Free {
            return Err(IpcError::BadPhone);
        }
        *state = PhoneState::Connected(callee);
        Ok(())
    }

    fn hangup(&self) {
        let mut state = self.state.lock();
        if let PhoneState::Connected(_) = *state {
            *state = PhoneState::HungUp;
        }
    }

    fn reset(&self) {
        *self.state.lock() = PhoneState::Free;
    }
}

/// The server end: queues of pending calls and returned answers.
#[derive(Debug)]
pub struct Answerbox {
    calls: SpinLock<VecDeque<Call>>,
    /// calls a callee thread has taken but not answered yet
    taken: SpinLock<VecDeque<Call>>,
    answers: SpinLock<VecDeque<Answer>>,
    pub call_wq: WaitQueue,
    pub answer_wq: WaitQueue,
}

impl Answerbox {
    pub const fn new() -> Self {
        Self {
            calls: SpinLock::new(VecDeque::new()),
            taken: SpinLock::new(VecDeque::new()),
            answers: SpinLock::new(VecDeque::new()),
            call_wq: WaitQueue::new(),
            answer_wq: WaitQueue::new(),
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn pending_answers(&self) -> usize {
        self.answers.lock().len()
    }
}

/// Connects a free phone slot of `caller` to `callee`'s answerbox.
/// Returns the phone index.
pub fn connect(caller: &Task, callee: TaskId) -> Result<usize, IpcError> {
    if task::find(callee).is_none() {
        return Err(IpcError::HungUp);
    }
    for (index, phone) in caller.phones.iter().enumerate() {
        if phone.connect(callee).is_ok() {
            return Ok(index);
        }
    }
    Err(IpcError::BadPhone)
}

/// Sends `payload` over `caller`'s phone `phone_index`. Returns the call
/// id the answer will carry.
pub fn call(caller: &Task, phone_index: usize, payload: RawIpcPayload) -> Result<u64, IpcError> {
    let phone = caller.phones.get(phone_index).ok_or(IpcError::BadPhone)?;
    let callee_id = match phone.state() {
        PhoneState::Connected(id) => id,
        PhoneState::HungUp => return Err(IpcError::HungUp),
        PhoneState::Free => return Err(IpcError::BadPhone),
    };
    let callee = task::find(callee_id).ok_or(IpcError::HungUp)?;

    let id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
    caller.active_calls.fetch_add(1, Ordering::Relaxed);
    callee.answerbox.calls.lock().push_back(Call {
        id,
        payload,
        sender: caller.id(),
    });
    callee.answerbox.call_wq.wake_one();
    Ok(id)
}

/// Takes the next pending call of `callee`, sleeping interruptibly until
/// one arrives. `usec == 0` polls.
pub fn wait_call(callee: &Task, usec: u64) -> Result<Call, IpcError> {
    loop {
        if let Some(call) = callee.answerbox.calls.lock().pop_front() {
            callee.answerbox.taken.lock().push_back(call.clone());
            return Ok(call);
        }
        match callee.answerbox.call_wq.sleep_flags(
            usec,
            SleepFlags::INTERRUPTIBLE | SleepFlags::NON_BLOCKING,
        ) {
            SleepResult::Ok => continue,
            SleepResult::Timeout => return Err(IpcError::WouldBlock),
            SleepResult::Interrupted => return Err(IpcError::Interrupted),
        }
    }
}

/// Answers `call` with `retval`, routing the answer to the caller's box.
pub fn answer(callee: &Task, call: &Call, retval: usize) -> Result<(), IpcError> {
    let mut taken = callee.answerbox.taken.lock();
    let pos = taken
        .iter()
        .position(|c| c.id == call.id)
        .ok_or(IpcError::BadCall)?;
    taken.remove(pos);
    drop(taken);
    route_answer(call, retval)
}

/// Syscall flavor: answers a taken call by id.
pub fn answer_by_id(callee: &Task, call_id: u64, retval: usize) -> Result<(), IpcError> {
    let call = {
        let mut taken = callee.answerbox.taken.lock();
        let pos = taken
            .iter()
            .position(|c| c.id == call_id)
            .ok_or(IpcError::BadCall)?;
        taken.remove(pos).unwrap()
    };
    route_answer(&call, retval)
}

fn route_answer(call: &Call, retval: usize) -> Result<(), IpcError> {
    let Some(sender) = task::find(call.sender) else {
        // the caller died while we serviced it; nobody wants the answer
        return Ok(());
    };
    sender.answerbox.answers.lock().push_back(Answer {
        call_id: call.id,
        retval,
    });
    sender.active_calls.fetch_sub(1, Ordering::Relaxed);
    sender.answerbox.answer_wq.wake_one();
    Ok(())
}

/// Takes the next answer delivered to `caller`. `usec == 0` polls.
pub fn wait_answer(caller: &Task, usec: u64) -> Result<Answer, IpcError> {
    loop {
        if let Some(answer) = caller.answerbox.answers.lock().pop_front() {
            return Ok(answer);
        }
        match caller.answerbox.answer_wq.sleep_flags(
            usec,
            SleepFlags::INTERRUPTIBLE | SleepFlags::NON_BLOCKING,
        ) {
            SleepResult::Ok => continue,
            SleepResult::Timeout => return Err(IpcError::WouldBlock),
            SleepResult::Interrupted => return Err(IpcError::Interrupted),
        }
    }
}

/// Kill-path teardown, phase one: hang up every phone and force-answer
/// everything pending in the box so no caller waits on a dead task.
pub fn hangup_all(task: &Task) {
    for phone in task.phones.iter() {
        phone.hangup();
    }

    let mut pending: VecDeque<Call> = core::mem::take(&mut *task.answerbox.calls.lock());
    pending.extend(core::mem::take(&mut *task.answerbox.taken.lock()));
    for call in pending {
        debug!(Task, "force-answering call {} of task {}", call.id, call.sender);
        let _ = route_answer(&call, ANSWER_HUNG_UP);
    }
    task.answerbox.call_wq.close();
}

/// Kill-path teardown, phase two: once the cleanup thread runs, drop
/// whatever is left and reset the phone slots.
pub fn cleanup(task: &Task) {
    hangup_all(task);
    task.answerbox.answers.lock().clear();
    task.answerbox.answer_wq.close();
    for phone in task.phones.iter() {
        phone.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_memory;
    use crate::task::Task;

    fn payload(method: usize) -> RawIpcPayload {
        RawIpcPayload {
            method,
            args: [0; 5],
        }
    }

    fn two_tasks() -> (alloc::sync::Arc<Task>, alloc::sync::Arc<Task>) {
        init_test_memory();
        let client = Task::create_kernel("ipc-client".try_into().unwrap()).unwrap();
        let server = Task::create_kernel("ipc-server".try_into().unwrap()).unwrap();
        (client, server)
    }

    #[test]
    fn call_travels_and_answer_returns() {
        let (client, server) = two_tasks();
        let phone = connect(&client, server.id()).unwrap();

        let call_id = call(&client, phone, payload(7)).unwrap();
        assert_eq!(client.active_calls.load(Ordering::Relaxed), 1);

        let incoming = wait_call(&server, 0).unwrap();
        assert_eq!(incoming.id, call_id);
        assert_eq!(incoming.payload.method, 7);
        assert_eq!(incoming.sender, client.id());

        answer(&server, &incoming, 123).unwrap();
        let reply = wait_answer(&client, 0).unwrap();
        assert_eq!(reply.call_id, call_id);
        assert_eq!(reply.retval, 123);
        assert_eq!(client.active_calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn calling_a_free_phone_fails() {
        let (client, _server) = two_tasks();
        assert_eq!(
            call(&client, 0, payload(1)).unwrap_err(),
            IpcError::BadPhone
        );
        assert_eq!(
            call(&client, crate::task::MAX_PHONES, payload(1)).unwrap_err(),
            IpcError::BadPhone
        );
    }

    #[test]
    fn hangup_force_answers_pending_calls() {
        let (client, server) = two_tasks();
        let phone = connect(&client, server.id()).unwrap();
        call(&client, phone, payload(9)).unwrap();
        assert_eq!(server.answerbox.pending_calls(), 1);

        hangup_all(&server);

        // the caller got its forced answer and owes nothing
        let reply = wait_answer(&client, 0).unwrap();
        assert_eq!(reply.retval, ANSWER_HUNG_UP);
        assert_eq!(client.active_calls.load(Ordering::Relaxed), 0);
        assert_eq!(server.answerbox.pending_calls(), 0);
    }

    #[test]
    fn a_killed_peer_reads_as_hung_up() {
        let (client, server) = two_tasks();
        let phone = connect(&client, server.id()).unwrap();

        crate::task::cleanup(&server);

        assert_eq!(
            call(&client, phone, payload(2)).unwrap_err(),
            IpcError::HungUp
        );
    }

    #[test]
    fn phone_slots_are_finite() {
        let (client, server) = two_tasks();
        for _ in 0..crate::task::MAX_PHONES {
            connect(&client, server.id()).unwrap();
        }
        assert_eq!(
            connect(&client, server.id()).unwrap_err(),
            IpcError::BadPhone
        );
    }
}
