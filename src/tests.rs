use crate::{Config, EnginePool, ErrorKind, ValueKind};
use anyhow::Result;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use test_case::test_case;

fn pool(size: usize) -> Arc<EnginePool> {
  let _ = pretty_env_logger::try_init();
  Arc::new(EnginePool::new(size).unwrap())
}

#[test_case("return 1 + 1", 2, ValueKind::Number ; "integer arithmetic")]
#[test_case("return 7 // 2", 3, ValueKind::Number ; "floor division")]
#[test_case("return '10'", 10, ValueKind::String ; "numeric string coercion")]
#[test_case("return 2.9", 2, ValueKind::Number ; "float truncation")]
fn execute_yields_integer(code: &str, expected: i64, kind: ValueKind) {
  let pool = pool(1);
  let engine = pool.acquire().unwrap();
  let value = engine.execute(code).unwrap();
  assert_eq!(value.kind(), kind);
  assert_eq!(value.get::<i64>().unwrap(), expected);
}

#[test]
fn compile_error_is_reported() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  let error = engine.execute("return )").unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::Compile(_)), "got {error}");
  // the engine survives a bad chunk
  assert_eq!(engine.execute("return 1")?.get::<i64>()?, 1);
  Ok(())
}

#[test]
fn script_error_is_reported() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  let error = engine.execute("error('boom')").unwrap_err();
  match error.kind() {
    ErrorKind::Script(message) => assert!(message.contains("boom"), "got {message}"),
    other => panic!("unexpected error: {other}"),
  }
  assert_eq!(engine.execute("return 1")?.get::<i64>()?, 1);
  Ok(())
}

#[test]
fn callback_round_trip() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  engine.register_callback("add", |args| {
    let (a, b) = (args[0].as_i64().unwrap_or(0), args[1].as_i64().unwrap_or(0));
    Ok(json!(a + b))
  })?;
  assert_eq!(engine.execute("return add(2, 3)")?.get::<i64>()?, 5);
  Ok(())
}

#[test]
fn callback_error_surfaces_as_script_error() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  engine.register_callback("explode", |_| Err("no thanks".into()))?;
  let error = engine.execute("return explode()").unwrap_err();
  match error.kind() {
    ErrorKind::Script(message) => assert!(message.contains("no thanks"), "got {message}"),
    other => panic!("unexpected error: {other}"),
  }
  Ok(())
}

// A null from a callback must survive the trip into the engine and back out
// instead of deleting its table slot on the way in.
#[test]
fn callback_null_round_trips() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  engine.register_callback("nulls", |_| Ok(json!(["a", null, 1])))?;
  engine.register_callback("len", |args| Ok(json!(args[0].as_array().map_or(0, Vec::len))))?;
  let value = engine.execute("return nulls()")?;
  assert_eq!(value.kind(), ValueKind::Array);
  assert_eq!(value.to_json()?, json!(["a", null, 1]));
  assert_eq!(engine.execute("return len(nulls())")?.get::<i64>()?, 3);
  Ok(())
}

#[test]
fn create_value_to_json() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  let value = engine.create_value("{a = 1, b = {1, 2, 3}}")?;
  assert_eq!(value.kind(), ValueKind::Object);
  assert_eq!(value.to_json()?, json!({"a": 1, "b": [1, 2, 3]}));
  Ok(())
}

#[test]
fn handle_property_access() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  let value = engine.create_value("{x = 1}")?;
  assert_eq!(value.get_key::<i64>("x")?, 1);

  value.set_key("y", 2i64)?;
  assert_eq!(value.get_key::<i64>("y")?, 2);
  value.set_key("name", "zaphod")?;
  assert_eq!(value.get_key::<String>("name")?, "zaphod");
  value.set_key("tree", json!({"deep": [true]}))?;
  assert_eq!(value.get_key::<serde_json::Value>("tree")?, json!({"deep": [true]}));

  let error = value.get_key::<i64>("missing").unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::PropertyAccess { .. }));

  let number = engine.create_value("42")?;
  let error = number.get_key::<i64>("x").unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::PropertyAccess { .. }));
  Ok(())
}

#[test]
fn handle_index_access() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  let value = engine.create_value("{10, 20, 30}")?;
  assert_eq!(value.kind(), ValueKind::Array);
  assert_eq!(value.get_index::<i64>(2)?, 20);
  value.set_index(2, 25i64)?;
  assert_eq!(value.get::<Vec<i64>>()?, vec![10, 25, 30]);
  let error = value.get_index::<i64>(7).unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::PropertyAccess { .. }));
  Ok(())
}

#[test]
fn coercions() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  assert!(!engine.execute("return nil")?.get::<bool>()?);
  assert!(!engine.execute("return false")?.get::<bool>()?);
  assert!(engine.execute("return 0")?.get::<bool>()?); // zero is truthy here
  assert_eq!(engine.execute("return 1.5")?.get::<f64>()?, 1.5);
  assert_eq!(engine.execute("return 7")?.get::<String>()?, "7");
  let error = engine.create_value("{}")?.get::<i64>().unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::TypeCoercion { .. }));
  Ok(())
}

#[test]
fn call_function() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  engine.execute("function mul(a, b) return a * b end")?;
  let a = engine.create_value("6")?;
  let b = engine.create_value("7")?;
  assert_eq!(engine.call_function("mul", &[a, b])?.get::<i64>()?, 42);

  let error = engine.call_function("nope", &[]).unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::FunctionNotFound(_)));
  Ok(())
}

#[test]
fn foreign_handle_rejected() -> Result<()> {
  let pool_a = pool(1);
  let pool_b = pool(1);
  let engine_a = pool_a.acquire()?;
  let engine_b = pool_b.acquire()?;
  engine_a.execute("function id(x) return x end")?;
  let foreign = engine_b.create_value("1")?;
  let error = engine_a.call_function("id", &[foreign]).unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::ForeignHandle));
  Ok(())
}

#[test]
fn reset_clears_callbacks() -> Result<()> {
  let pool = pool(1);
  {
    let engine = pool.acquire()?;
    engine.register_callback("answer", |_| Ok(json!(42)))?;
    assert_eq!(engine.execute("return answer()")?.get::<i64>()?, 42);
  }
  // same engine, fresh context
  let engine = pool.acquire()?;
  let error = engine.call_function("answer", &[]).unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::FunctionNotFound(_)));
  let error = engine.execute("return answer()").unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::Script(_)));
  Ok(())
}

#[test]
fn reset_does_not_leak_globals() -> Result<()> {
  let pool = pool(1);
  {
    let engine = pool.acquire()?;
    engine.execute("leftover = 'junk'")?;
    assert_eq!(engine.execute("return leftover")?.get::<String>()?, "junk");
  }
  let engine = pool.acquire()?;
  assert!(!engine.execute("return leftover")?.get::<bool>()?);
  Ok(())
}

#[test]
fn handles_survive_reset() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  let value = engine.create_value("{kept = true}")?;
  engine.reset()?;
  assert!(value.get_key::<bool>("kept")?);
  Ok(())
}

#[test]
fn print_goes_to_log_sink() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  let lines = Arc::new(Mutex::new(Vec::<String>::new()));
  let sink_lines = lines.clone();
  engine.set_log_sink(move |line| sink_lines.lock().unwrap().push(line.to_owned()))?;
  engine.execute("print('hi', 1)")?;
  engine.execute("print('there')")?;
  assert_eq!(*lines.lock().unwrap(), ["hi\t1", "there"]);
  Ok(())
}

#[test]
fn pool_and_guard_are_debuggable() -> Result<()> {
  let pool = pool(2);
  let guard = pool.acquire()?;
  assert!(format!("{guard:?}").contains(guard.name()));
  assert!(format!("{:?}", *pool).contains("size: 2"));
  Ok(())
}

#[test]
fn acquire_blocks_until_release() -> Result<()> {
  let pool = pool(1);
  let guard = pool.acquire()?;

  let error = pool.try_acquire().unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::PoolExhausted));

  let (tx, rx) = mpsc::channel();
  let pool2 = pool.clone();
  let waiter = thread::spawn(move || {
    let _guard = pool2.acquire().unwrap();
    tx.send(()).unwrap();
  });
  assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
  drop(guard);
  assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
  waiter.join().unwrap();
  Ok(())
}

// 5 threads × 50 scripts over 2 engines: every call succeeds and no engine
// ever runs two tasks at once.
#[test]
fn pool_concurrency() -> Result<()> {
  let _ = pretty_env_logger::try_init();
  let pool = Arc::new(EnginePool::with_config(Config {
    pool_size: 2,
    thread_name: "concurrency-test".into(),
  })?);
  let in_flight = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
  let overlap = Arc::new(AtomicBool::new(false));
  let successes = Arc::new(AtomicUsize::new(0));

  let threads: Vec<_> = (0..5)
    .map(|_| {
      let pool = pool.clone();
      let in_flight = in_flight.clone();
      let overlap = overlap.clone();
      let successes = successes.clone();
      thread::spawn(move || {
        for _ in 0..50 {
          let engine = pool.acquire().unwrap();
          let index: usize = engine.name().rsplit('-').next().unwrap().parse().unwrap();
          let in_flight = in_flight.clone();
          let overlap = overlap.clone();
          engine
            .register_callback("probe", move |_| {
              if in_flight[index].fetch_add(1, SeqCst) != 0 {
                overlap.store(true, SeqCst);
              }
              thread::yield_now();
              in_flight[index].fetch_sub(1, SeqCst);
              Ok(json!(null))
            })
            .unwrap();
          let value = engine.execute("probe() return 1 + 1").unwrap();
          assert_eq!(value.get::<i64>().unwrap(), 2);
          successes.fetch_add(1, SeqCst);
        }
      })
    })
    .collect();
  for thread in threads {
    thread.join().unwrap();
  }

  assert_eq!(successes.load(SeqCst), 250);
  assert!(!overlap.load(SeqCst), "an engine ran two tasks concurrently");
  Ok(())
}

// Tasks submitted to a single engine from many threads execute in one total
// order: per-submitter order is preserved and calls never interleave.
#[test]
fn single_engine_total_order() -> Result<()> {
  let pool = pool(1);
  let engine = Arc::new(pool.acquire()?);
  let log = Arc::new(Mutex::new(Vec::<(i64, i64)>::new()));
  let busy = Arc::new(AtomicUsize::new(0));
  let overlap = Arc::new(AtomicBool::new(false));
  {
    let log = log.clone();
    let busy = busy.clone();
    let overlap = overlap.clone();
    engine.register_callback("record", move |args| {
      if busy.fetch_add(1, SeqCst) != 0 {
        overlap.store(true, SeqCst);
      }
      log.lock().unwrap().push((args[0].as_i64().unwrap(), args[1].as_i64().unwrap()));
      busy.fetch_sub(1, SeqCst);
      Ok(json!(null))
    })?;
  }

  let threads: Vec<_> = (0..4)
    .map(|t| {
      let engine = engine.clone();
      thread::spawn(move || {
        for i in 0..25 {
          engine.execute(format!("record({t}, {i})")).unwrap();
        }
      })
    })
    .collect();
  for thread in threads {
    thread.join().unwrap();
  }

  let log = log.lock().unwrap();
  assert_eq!(log.len(), 100);
  assert!(!overlap.load(SeqCst));
  for t in 0..4 {
    let seen: Vec<i64> = log.iter().filter(|(thread, _)| *thread == t).map(|(_, i)| *i).collect();
    assert_eq!(seen, (0..25).collect::<Vec<i64>>());
  }
  Ok(())
}

// Shutdown invoked while a script is in flight: the script finishes, engine
// state is disposed on its executor thread, and all threads join.
#[test]
fn shutdown_waits_for_in_flight_work() -> Result<()> {
  let pool = pool(1);
  let (started_tx, started_rx) = mpsc::channel();
  let (result_tx, result_rx) = mpsc::channel();
  let pool2 = pool.clone();
  let worker = thread::spawn(move || {
    let engine = pool2.acquire().unwrap();
    started_tx.send(()).unwrap();
    let value = engine
      .execute("local s = 0 for i = 1, 5000000 do s = s + i end return s")
      .unwrap();
    result_tx.send(value.get::<i64>().unwrap()).unwrap();
  });

  started_rx.recv().unwrap();
  pool.shutdown();

  assert_eq!(result_rx.recv().unwrap(), 12_500_002_500_000);
  worker.join().unwrap();

  let error = pool.acquire().unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::PoolClosed));
  Ok(())
}

#[test]
fn shutdown_is_idempotent() -> Result<()> {
  let pool = pool(2);
  pool.shutdown();
  pool.shutdown();
  Ok(())
}

// A handle outliving its pool must fail fast instead of hanging on a stopped
// executor, and dropping it must not block either.
#[test]
fn handle_outlives_shutdown() -> Result<()> {
  let pool = pool(1);
  let value = {
    let engine = pool.acquire()?;
    engine.create_value("{x = 1}")?
  };
  pool.shutdown();
  let error = value.get_key::<i64>("x").unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::ActorStopped));
  drop(value);
  Ok(())
}

// Dropping the last handle inside a callback happens on the executor thread;
// the release must not round-trip through the task queue it is running on.
#[test]
fn handle_dropped_on_executor_thread() -> Result<()> {
  let pool = pool(1);
  let engine = pool.acquire()?;
  let slot = Arc::new(Mutex::new(None));
  slot.lock().unwrap().replace(engine.create_value("{1, 2}")?);
  let slot2 = slot.clone();
  engine.register_callback("drop_it", move |_| {
    slot2.lock().unwrap().take();
    Ok(json!(true))
  })?;
  assert!(engine.execute("return drop_it()")?.get::<bool>()?);
  assert!(slot.lock().unwrap().is_none());
  Ok(())
}

#[test]
fn zero_sized_pool_rejected() {
  let error = EnginePool::new(0).unwrap_err();
  assert!(matches!(error.kind(), ErrorKind::Config(_)));
}
