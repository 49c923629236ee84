//! Cooperative tasks
//!
//! A task is an independent frame stack plus a scheduling state. Tasks never
//! preempt each other: control moves only at explicit yield points, where the
//! running task suspends and the embedder resumes another. All tasks of one
//! context share its heap, so a task switch is just a pointer switch; no
//! synchronization is involved and none is needed.

use crate::stack::ValueStack;
use crate::value::Value;
use crate::{RuntimeError, RuntimeResult};

/// Stable task identifier within one [`TaskSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u32);

/// Scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned, never run
    Ready,
    /// Currently executing (at most one per set)
    Running,
    /// Parked at a yield point
    Suspended,
    /// Finished; stack torn down
    Done,
}

/// One cooperative task: its own frame stack and scheduling state
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    state: TaskState,
    stack: ValueStack,
    /// Value delivered at the next resume, or produced at the last yield
    transfer: Value,
}

impl Task {
    /// Task id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Scheduling state
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The task's frame stack
    pub fn stack(&self) -> &ValueStack {
        &self.stack
    }

    /// The task's frame stack, mutable
    pub fn stack_mut(&mut self) -> &mut ValueStack {
        &mut self.stack
    }
}

/// The tasks of one context and which of them is running
///
/// The set enforces the cooperative discipline: `resume` refuses while
/// another task is running, `suspend`/`finish` only act on the running task.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<Task>,
    running: Option<u32>,
}

impl TaskSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task over `stack` (typically fresh, sized by the context
    /// options). The task starts `Ready` and runs only when resumed.
    pub fn spawn(&mut self, stack: ValueStack) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(Task {
            id,
            state: TaskState::Ready,
            stack,
            transfer: Value::undef(),
        });
        id
    }

    /// Number of tasks ever spawned (ids are never reused)
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when no task has been spawned
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The running task's id, if any
    pub fn running(&self) -> Option<TaskId> {
        self.running.map(|i| self.tasks[i as usize].id)
    }

    /// Shared view of a task
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0 as usize)
    }

    /// Hand control to `id`, delivering `value` (the result of the yield the
    /// task is parked on; `Undef` for a first run). Returns the task for the
    /// embedder to drive.
    pub fn resume(&mut self, id: TaskId, value: Value) -> RuntimeResult<&mut Task> {
        if let Some(running) = self.running() {
            return Err(RuntimeError::Runtime(format!(
                "cannot resume task {} while task {} is running",
                id.0, running.0
            )));
        }
        let task = self
            .tasks
            .get_mut(id.0 as usize)
            .ok_or_else(|| RuntimeError::Runtime(format!("no such task {}", id.0)))?;
        match task.state {
            TaskState::Ready | TaskState::Suspended => {
                task.state = TaskState::Running;
                task.transfer = value;
                self.running = Some(id.0);
                Ok(task)
            }
            TaskState::Running | TaskState::Done => Err(RuntimeError::Runtime(format!(
                "task {} is not resumable ({:?})",
                id.0, task.state
            ))),
        }
    }

    /// Take the value delivered to the running task by its resumer
    pub fn take_transfer(&mut self) -> RuntimeResult<Value> {
        let i = self.running.ok_or(RuntimeError::NoFrame)?;
        Ok(std::mem::take(&mut self.tasks[i as usize].transfer))
    }

    /// Park the running task at a yield point, producing `value` for its
    /// resumer. Its frames stay live for the next resume.
    pub fn suspend(&mut self, value: Value) -> RuntimeResult<TaskId> {
        let i = self
            .running
            .take()
            .ok_or_else(|| RuntimeError::Runtime("no task is running".into()))?;
        let task = &mut self.tasks[i as usize];
        task.state = TaskState::Suspended;
        task.transfer = value;
        Ok(task.id)
    }

    /// Yield value parked with a suspended task, consumed by its resumer
    pub fn take_yielded(&mut self, id: TaskId) -> Option<Value> {
        let task = self.tasks.get_mut(id.0 as usize)?;
        if task.state != TaskState::Suspended {
            return None;
        }
        Some(std::mem::take(&mut task.transfer))
    }

    /// Finish the running task: its remaining frames unwind (local
    /// destructors run) and it can never be resumed again.
    pub fn finish(&mut self, value: Value) -> RuntimeResult<TaskId> {
        let i = self
            .running
            .take()
            .ok_or_else(|| RuntimeError::Runtime("no task is running".into()))?;
        let task = &mut self.tasks[i as usize];
        task.stack.unwind_all();
        task.state = TaskState::Done;
        task.transfer = value;
        Ok(task.id)
    }

    /// Result parked with a finished task
    pub fn result(&self, id: TaskId) -> Option<&Value> {
        let task = self.tasks.get(id.0 as usize)?;
        if task.state != TaskState::Done {
            return None;
        }
        Some(&task.transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string::StrRef;
    use crate::unit::CodeUnit;
    use std::sync::Arc;

    #[test]
    fn test_spawn_resume_suspend_resume() {
        let mut set = TaskSet::new();
        let id = set.spawn(ValueStack::new());
        assert_eq!(set.get(id).unwrap().state(), TaskState::Ready);

        let unit = Arc::new(CodeUnit::stub("task_body", 1));
        let task = set.resume(id, Value::undef()).unwrap();
        assert_eq!(task.state(), TaskState::Running);
        task.stack_mut().push_frame(&unit).unwrap();
        task.stack_mut().enter().unwrap();
        task.stack_mut().store_local(0, Value::int(42)).unwrap();

        set.suspend(Value::int(1)).unwrap();
        assert_eq!(set.get(id).unwrap().state(), TaskState::Suspended);
        assert_eq!(set.take_yielded(id).unwrap().as_int(), Some(1));

        // Frames survive across the suspension.
        let task = set.resume(id, Value::int(2)).unwrap();
        assert_eq!(task.stack().frame_count(), 1);
        assert_eq!(task.stack().load_local(0).unwrap().as_int(), Some(42));
        assert_eq!(set.take_transfer().unwrap().as_int(), Some(2));

        set.finish(Value::int(99)).unwrap();
        assert_eq!(set.get(id).unwrap().state(), TaskState::Done);
        assert_eq!(set.result(id).unwrap().as_int(), Some(99));
    }

    #[test]
    fn test_only_one_task_runs() {
        let mut set = TaskSet::new();
        let a = set.spawn(ValueStack::new());
        let b = set.spawn(ValueStack::new());
        set.resume(a, Value::undef()).unwrap();
        assert!(set.resume(b, Value::undef()).is_err());
        set.suspend(Value::null()).unwrap();
        assert!(set.resume(b, Value::undef()).is_ok());
    }

    #[test]
    fn test_done_task_not_resumable() {
        let mut set = TaskSet::new();
        let id = set.spawn(ValueStack::new());
        set.resume(id, Value::undef()).unwrap();
        set.finish(Value::null()).unwrap();
        assert!(set.resume(id, Value::undef()).is_err());
    }

    #[test]
    fn test_finish_unwinds_frames() {
        let mut set = TaskSet::new();
        let id = set.spawn(ValueStack::new());
        let unit = Arc::new(CodeUnit::stub("f", 1));

        let marker = Value::str(StrRef::alloc("held"));
        let raw = marker.heap_ref().unwrap();
        let outside = marker.clone();

        let task = set.resume(id, Value::undef()).unwrap();
        task.stack_mut().push_frame(&unit).unwrap();
        task.stack_mut().enter().unwrap();
        task.stack_mut().store_local(0, marker).unwrap();
        assert_eq!(raw.header().refcount(), 2);

        set.finish(Value::null()).unwrap();
        assert_eq!(set.get(id).unwrap().stack().frame_count(), 0);
        assert_eq!(raw.header().refcount(), 1);
        drop(outside);
    }

    #[test]
    fn test_suspend_without_running_task() {
        let mut set = TaskSet::new();
        assert!(set.suspend(Value::null()).is_err());
    }
}
