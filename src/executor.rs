use crate::callback::{CallbackRegistry, NativeCallback};
use crate::context::{default_log_sink, install_print, LogSink, ScriptContext};
use crate::error::{ErrorKind, Result};
use crate::handle::ValueKind;
use crate::task::{Message, Task};
use log::{debug, error, trace};
use mlua::{Lua, MultiValue, RegistryKey};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};

/// The part of an engine that any thread may touch: the task channel plus a
/// stop flag. The engine state itself never leaves the executor thread.
pub(crate) struct EngineShared {
  name: String,
  tx: mpsc::UnboundedSender<Message>,
  stopped: AtomicBool,
  thread_id: OnceCell<ThreadId>,
}

impl EngineShared {
  pub(crate) fn name(&self) -> &str {
    &self.name
  }

  pub(crate) fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::Acquire)
  }

  pub(crate) fn on_executor_thread(&self) -> bool {
    (self.thread_id.get()).map(|id| *id == thread::current().id()).unwrap_or(false)
  }

  /// Enqueues a task. Never blocks; tasks execute in submission order, one at
  /// a time, on the executor thread.
  pub(crate) fn submit(&self, task: Task) -> Result<()> {
    if self.is_stopped() {
      return Err(ErrorKind::ActorStopped.into());
    }
    (self.tx.send(Message::Run(task))).map_err(|_| ErrorKind::ActorStopped)?;
    Ok(())
  }

  /// Submits a task and blocks the calling thread until it has run. If the
  /// executor stops before the task runs, the dropped reply channel turns
  /// into `ActorStopped` instead of a hang.
  pub(crate) fn request<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut EngineCore) -> Result<T> + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    self.submit(Box::new(move |core| {
      let _ = tx.send(f(core));
    }))?;
    rx.blocking_recv().map_err(|_| ErrorKind::ActorStopped)?
  }
}

/// Sets the stop flag however the executor thread exits, panics included.
struct StopNotifier(Arc<EngineShared>);

impl Drop for StopNotifier {
  fn drop(&mut self) {
    self.0.stopped.store(true, Ordering::Release);
  }
}

/// One engine's executor: a dedicated OS thread that owns the Lua state and
/// drains the task channel in FIFO order. The state is created and dropped on
/// that thread; no other thread ever sees it.
pub(crate) struct Executor {
  shared: Arc<EngineShared>,
  thread: Option<JoinHandle<()>>,
}

impl Executor {
  pub(crate) fn spawn(name: String) -> Result<Self> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let shared = Arc::new(EngineShared {
      name: name.clone(),
      tx,
      stopped: AtomicBool::new(false),
      thread_id: OnceCell::new(),
    });

    let (init_tx, init_rx) = oneshot::channel();
    let shared2 = shared.clone();
    let thread = thread::Builder::new().name(name.clone()).spawn(move || {
      let _notifier = StopNotifier(shared2.clone());
      let _ = shared2.thread_id.set(thread::current().id());
      let mut core = match EngineCore::new(name.clone()) {
        Ok(core) => {
          let _ = init_tx.send(Ok(()));
          core
        }
        Err(error) => {
          let _ = init_tx.send(Err(error));
          return;
        }
      };
      trace!("engine '{name}' up");
      while let Some(message) = rx.blocking_recv() {
        match message {
          Message::Run(task) => task(&mut core),
          Message::Stop => break,
        }
      }
      trace!("engine '{name}' stopping");
      // `core`, and with it the Lua state, is dropped here on its own thread
    })?;

    init_rx.blocking_recv().map_err(|_| ErrorKind::ActorStopped)??;
    Ok(Self { shared, thread: Some(thread) })
  }

  pub(crate) fn shared(&self) -> &Arc<EngineShared> {
    &self.shared
  }

  /// Requests stop and joins the thread. Tasks already queued still run; new
  /// submissions fail fast with `ActorStopped`.
  pub(crate) fn stop(&mut self) {
    self.shared.stopped.store(true, Ordering::Release);
    let _ = self.shared.tx.send(Message::Stop);
    if let Some(thread) = self.thread.take() {
      trace!("joining engine '{}'", self.shared.name);
      if thread.join().is_err() {
        error!("engine '{}' executor thread panicked", self.shared.name);
      }
    }
  }
}

impl Drop for Executor {
  fn drop(&mut self) {
    self.stop();
  }
}

/// Everything that lives on the executor thread: the Lua state, the current
/// execution context, the callback table and the print sink. Owning the Lua
/// state makes this `!Send`; it can only exist on the thread that created it.
pub(crate) struct EngineCore {
  name: String,
  lua: Lua,
  context: ScriptContext,
  callbacks: CallbackRegistry,
  log_sink: LogSink,
}

impl EngineCore {
  fn new(name: String) -> Result<Self> {
    let lua = Lua::new();
    let log_sink = default_log_sink();
    let context = ScriptContext::create(&lua, log_sink.clone(), 0)?;
    Ok(Self {
      name,
      lua,
      context,
      callbacks: CallbackRegistry::new(),
      log_sink,
    })
  }

  pub(crate) fn lua(&self) -> &Lua {
    &self.lua
  }

  pub(crate) fn expire_registry_values(&self) {
    self.lua.expire_registry_values();
  }

  /// Compiles and runs a chunk in the current context. Compile and runtime
  /// failures come back as distinct error kinds; they never take the
  /// executor down.
  pub(crate) fn execute(&mut self, code: &str, chunk_name: &str) -> Result<(RegistryKey, ValueKind)> {
    let env = self.context.env(&self.lua)?;
    let function = (self.lua)
      .load(code)
      .set_name(chunk_name)?
      .set_environment(env)?
      .into_function()?;
    let value: mlua::Value = function.call(())?;
    self.wrap(value)
  }

  pub(crate) fn create_value(&mut self, expression: &str) -> Result<(RegistryKey, ValueKind)> {
    let code = format!("return ({expression})");
    self.execute(&code, "@[create_value]")
  }

  pub(crate) fn call_function(
    &mut self,
    name: &str,
    args: &[Arc<RegistryKey>],
  ) -> Result<(RegistryKey, ValueKind)> {
    let env = self.context.env(&self.lua)?;
    let value: mlua::Value = env.raw_get(name)?;
    let function = match value {
      mlua::Value::Function(f) => f,
      _ => return Err(ErrorKind::FunctionNotFound(name.into()).into()),
    };
    let mut call_args = Vec::with_capacity(args.len());
    for key in args {
      call_args.push(self.lua.registry_value::<mlua::Value>(key)?);
    }
    let result: mlua::Value = function.call(MultiValue::from_vec(call_args))?;
    self.wrap(result)
  }

  pub(crate) fn register_callback(&mut self, name: String, callback: NativeCallback) -> Result<()> {
    self.callbacks.register(name, callback);
    let env = self.context.env(&self.lua)?;
    self.callbacks.expose(&self.lua, &env)?;
    Ok(())
  }

  /// Clears callbacks and swaps in a fresh context. Tasks queued before the
  /// reset have already run against the old context by the time this task
  /// executes; handles created there stay valid, since the value registry
  /// outlives any single context.
  pub(crate) fn reset(&mut self) -> Result<()> {
    self.callbacks.clear();
    let generation = self.context.generation() + 1;
    let fresh = ScriptContext::create(&self.lua, self.log_sink.clone(), generation)?;
    let old = std::mem::replace(&mut self.context, fresh);
    old.dispose(&self.lua)?;
    self.lua.expire_registry_values();
    debug!("engine '{}' reset to generation {generation}", self.name);
    Ok(())
  }

  pub(crate) fn set_log_sink(&mut self, sink: LogSink) -> Result<()> {
    self.log_sink = sink.clone();
    let env = self.context.env(&self.lua)?;
    install_print(&self.lua, &env, sink)?;
    Ok(())
  }

  fn wrap(&self, value: mlua::Value) -> Result<(RegistryKey, ValueKind)> {
    let kind = ValueKind::of(&value);
    let key = self.lua.create_registry_value(value)?;
    Ok((key, kind))
  }
}
