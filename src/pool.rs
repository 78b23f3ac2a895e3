use crate::config::Config;
use crate::engine::Engine;
use crate::error::{ErrorKind, Result};
use crate::executor::Executor;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;

/// A bounded set of engines, each backed by its own executor thread.
///
/// `acquire` blocks while every engine is borrowed and hands back a scoped
/// [`EngineGuard`]; at most `pool_size` guards exist at any instant. Waiters
/// are woken one per release, in whatever order the condvar chooses; there
/// is no FIFO fairness guarantee.
pub struct EnginePool {
  inner: Arc<PoolInner>,
  executors: Mutex<Vec<Executor>>,
  size: usize,
}

struct PoolInner {
  state: Mutex<PoolState>,
  available_cv: Condvar,
  idle_cv: Condvar,
}

struct PoolState {
  available: VecDeque<Engine>,
  borrowed: usize,
  closed: bool,
}

impl EnginePool {
  pub fn new(size: usize) -> Result<Self> {
    Self::with_config(Config { pool_size: size, ..Default::default() })
  }

  pub fn with_config(config: Config) -> Result<Self> {
    if config.pool_size == 0 {
      return Err(ErrorKind::Config("pool_size must be at least 1".into()).into());
    }
    let mut executors = Vec::with_capacity(config.pool_size);
    let mut available = VecDeque::with_capacity(config.pool_size);
    for i in 0..config.pool_size {
      let executor = Executor::spawn(format!("{}-{i}", config.thread_name))?;
      available.push_back(Engine::new(executor.shared().clone()));
      executors.push(executor);
    }
    let size = config.pool_size;
    debug!("engine pool up with {size} engines");
    Ok(Self {
      inner: Arc::new(PoolInner {
        state: Mutex::new(PoolState { available, borrowed: 0, closed: false }),
        available_cv: Condvar::new(),
        idle_cv: Condvar::new(),
      }),
      executors: Mutex::new(executors),
      size,
    })
  }

  pub fn size(&self) -> usize {
    self.size
  }

  /// Blocks until an engine is free, resets its context and returns it
  /// wrapped in a guard. Fails fast with `PoolClosed` once the pool is shut
  /// down, including for callers already waiting.
  pub fn acquire(&self) -> Result<EngineGuard> {
    let engine = {
      let mut state = self.inner.state.lock();
      loop {
        if state.closed {
          return Err(ErrorKind::PoolClosed.into());
        }
        if let Some(engine) = state.available.pop_front() {
          state.borrowed += 1;
          break engine;
        }
        self.inner.available_cv.wait(&mut state);
      }
    };
    self.checkout(engine)
  }

  /// Non-blocking variant; `PoolExhausted` when every engine is borrowed.
  pub fn try_acquire(&self) -> Result<EngineGuard> {
    let engine = {
      let mut state = self.inner.state.lock();
      if state.closed {
        return Err(ErrorKind::PoolClosed.into());
      }
      match state.available.pop_front() {
        Some(engine) => {
          state.borrowed += 1;
          engine
        }
        None => return Err(ErrorKind::PoolExhausted.into()),
      }
    };
    self.checkout(engine)
  }

  fn checkout(&self, engine: Engine) -> Result<EngineGuard> {
    let guard = EngineGuard { engine: Some(engine), inner: self.inner.clone() };
    // A fresh context per checkout: callbacks cleared, globals rebuilt. The
    // guard is constructed first so the engine goes back even when the reset
    // fails (e.g. the pool raced into shutdown).
    guard.reset()?;
    Ok(guard)
  }

  /// Stops every engine and joins its thread: waits for outstanding guards
  /// to come back, completes whatever work is already queued, then lets each
  /// executor drop its engine state on its own thread. Idempotent; also runs
  /// on drop.
  pub fn shutdown(&self) {
    {
      let mut state = self.inner.state.lock();
      if state.closed {
        return;
      }
      state.closed = true;
      self.inner.available_cv.notify_all();
      while state.borrowed > 0 {
        self.inner.idle_cv.wait(&mut state);
      }
      state.available.clear();
    }
    let mut executors = self.executors.lock();
    for executor in executors.iter_mut() {
      executor.stop();
    }
    executors.clear();
    debug!("engine pool shut down");
  }
}

impl Drop for EnginePool {
  fn drop(&mut self) {
    self.shutdown();
  }
}

impl Debug for EnginePool {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("EnginePool")
      .field("size", &self.size)
      .field("available", &state.available.len())
      .field("closed", &state.closed)
      .finish()
  }
}

/// Scoped checkout of one engine. Dereferences to [`Engine`]; dropping it
/// returns the engine to the pool and wakes one waiter, however the owning
/// scope exits.
pub struct EngineGuard {
  engine: Option<Engine>,
  inner: Arc<PoolInner>,
}

impl Deref for EngineGuard {
  type Target = Engine;

  fn deref(&self) -> &Engine {
    self.engine.as_ref().unwrap()
  }
}

impl Debug for EngineGuard {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("EngineGuard").field("engine", &self.engine).finish()
  }
}

impl Drop for EngineGuard {
  fn drop(&mut self) {
    if let Some(engine) = self.engine.take() {
      let mut state = self.inner.state.lock();
      state.borrowed -= 1;
      state.available.push_back(engine);
      drop(state);
      self.inner.available_cv.notify_one();
      self.inner.idle_cv.notify_one();
    }
  }
}
