use crate::executor::EngineCore;

/// A unit of work executed on the owning engine's thread. Results travel
/// back to the submitter over a oneshot channel captured by the closure.
pub(crate) type Task = Box<dyn FnOnce(&mut EngineCore) + Send + 'static>;

pub(crate) enum Message {
  Run(Task),
  Stop,
}
