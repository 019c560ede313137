use futures_pipers::{Error, Flight};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::sleep;

lazy_static::lazy_static! {
  static ref BOOM: Error = Error::msg("boom");
}

// Helper to initialize tracing for tests
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_pipers=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn counted(calls: &Arc<AtomicUsize>, value: i32) -> Arc<Flight<i32>> {
  let calls = calls.clone();
  Flight::new(move || async move {
    calls.fetch_add(1, Ordering::SeqCst);
    sleep(Duration::from_millis(5)).await;
    Ok(value)
  })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_execute_exactly_once() {
  setup_tracing_for_test();
  let calls = Arc::new(AtomicUsize::new(0));
  let flight = counted(&calls, 7);
  let barrier = Arc::new(Barrier::new(16));

  let mut handles = Vec::new();
  for i in 0..16 {
    let flight = flight.clone();
    let barrier = barrier.clone();
    handles.push(tokio::spawn(async move {
      barrier.wait().await;
      if i % 2 == 0 {
        flight.run().await
      } else {
        flight.run_async()
      }
    }));
  }

  let mut winners = 0;
  for handle in handles {
    if handle.await.unwrap() {
      winners += 1;
    }
  }
  assert_eq!(winners, 1);
  assert_eq!(flight.wait().await, Ok(7));
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_and_cancel_race_has_one_winner() {
  setup_tracing_for_test();
  for _ in 0..32 {
    let calls = Arc::new(AtomicUsize::new(0));
    let flight = counted(&calls, 1);
    let barrier = Arc::new(Barrier::new(2));

    let runner = {
      let flight = flight.clone();
      let barrier = barrier.clone();
      tokio::spawn(async move {
        barrier.wait().await;
        flight.run().await
      })
    };
    let canceller = {
      let flight = flight.clone();
      tokio::spawn(async move {
        barrier.wait().await;
        flight.cancel()
      })
    };

    let ran = runner.await.unwrap();
    let cancelled = canceller.await.unwrap();
    assert!(ran ^ cancelled, "exactly one of run and cancel must win");

    let outcome = flight.wait().await;
    if ran {
      assert_eq!(outcome, Ok(1));
      assert_eq!(calls.load(Ordering::SeqCst), 1);
    } else {
      assert_eq!(outcome, Err(Error::FlightCanceled));
      assert_eq!(calls.load(Ordering::SeqCst), 0);
      assert!(flight.canceled());
    }
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_waiters_share_one_outcome() {
  setup_tracing_for_test();
  let calls = Arc::new(AtomicUsize::new(0));
  let flight = counted(&calls, 11);

  let waiters: Vec<_> = (0..8)
    .map(|_| {
      let flight = flight.clone();
      tokio::spawn(async move { flight.wait().await })
    })
    .collect();

  assert!(flight.run_async());
  for waiter in waiters {
    assert_eq!(waiter.await.unwrap(), Ok(11));
  }
  assert_eq!(flight.hits(), 8);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_then_short_circuits_on_error() {
  setup_tracing_for_test();
  let continued = Arc::new(AtomicUsize::new(0));
  let base: Arc<Flight<i32>> = Flight::new(|| async { Err(BOOM.clone()) });

  let counter = continued.clone();
  let next = base.then(move |v| async move {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(v + 1)
  });

  assert!(next.run().await);
  assert_eq!(next.wait().await, Err(BOOM.clone()));
  assert_eq!(continued.load(Ordering::SeqCst), 0);
  assert_eq!(base.wait().await, Err(BOOM.clone()));
}

#[tokio::test]
async fn test_then_changes_value_type() {
  setup_tracing_for_test();
  let base = Flight::new(|| async { Ok(21) });
  let doubled = base.then(|v| async move { Ok(v * 2) });
  let described = doubled.then(|v| async move { Ok(format!("answer={}", v)) });

  assert!(described.run().await);
  assert_eq!(described.wait().await, Ok("answer=42".to_string()));
  assert!(base.started());
  assert!(doubled.is_done());
}

#[tokio::test]
async fn test_then_reuses_an_already_finished_base() {
  setup_tracing_for_test();
  let calls = Arc::new(AtomicUsize::new(0));
  let base = counted(&calls, 3);
  assert!(base.run().await);

  let next = base.then(|v| async move { Ok(v * 10) });
  next.run().await;
  assert_eq!(next.wait().await, Ok(30));
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_catch_passes_values_through() {
  setup_tracing_for_test();
  let handled = Arc::new(AtomicUsize::new(0));
  let counter = handled.clone();
  let recovered = Flight::new(|| async { Ok(5) }).catch(move |_| async move {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(0)
  });

  recovered.run().await;
  assert_eq!(recovered.wait().await, Ok(5));
  assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_catch_recovers_from_error() {
  setup_tracing_for_test();
  let base: Arc<Flight<i32>> = Flight::new(|| async { Err(BOOM.clone()) });
  let recovered = base.catch(|err| async move {
    assert_eq!(err, *BOOM);
    Ok(-1)
  });

  recovered.run().await;
  assert_eq!(recovered.wait().await, Ok(-1));
}

#[tokio::test]
async fn test_catch_can_replace_the_error() {
  setup_tracing_for_test();
  let base: Arc<Flight<i32>> = Flight::new(|| async { Err(BOOM.clone()) });
  let replaced = base.catch(|_| async { Err(Error::DeadlineExceeded) });

  replaced.run().await;
  assert_eq!(replaced.wait().await, Err(Error::DeadlineExceeded));
}

#[tokio::test]
async fn test_handle_sees_both_outcomes() {
  setup_tracing_for_test();
  let describe = |outcome: Result<i32, Error>| async move {
    Ok(match outcome {
      Ok(v) => format!("ok:{}", v),
      Err(err) => format!("err:{}", err),
    })
  };

  let good = Flight::new(|| async { Ok(9) }).handle(describe);
  let bad = Flight::new(|| async { Err::<i32, _>(BOOM.clone()) }).handle(describe);

  good.run().await;
  bad.run().await;
  assert_eq!(good.wait().await, Ok("ok:9".to_string()));
  assert_eq!(bad.wait().await, Ok("err:boom".to_string()));
}

#[tokio::test]
async fn test_chain_on_cancelled_base_reports_cancellation() {
  setup_tracing_for_test();
  let calls = Arc::new(AtomicUsize::new(0));
  let base = counted(&calls, 1);
  assert!(base.cancel());

  let next = base.then(|v| async move { Ok(v + 1) });
  assert!(next.run().await);
  assert_eq!(next.wait().await, Err(Error::FlightCanceled));
  assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_fails_while_running() {
  setup_tracing_for_test();
  let calls = Arc::new(AtomicUsize::new(0));
  let flight = counted(&calls, 4);

  assert!(flight.run_async());
  assert!(!flight.cancel());
  assert_eq!(flight.wait().await, Ok(4));
  assert!(!flight.canceled());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_run_lands_as_cancelled() {
  setup_tracing_for_test();
  let calls = Arc::new(AtomicUsize::new(0));
  let flight = counted(&calls, 8);

  let abandoned = tokio::time::timeout(Duration::from_millis(1), flight.run()).await;
  assert!(abandoned.is_err());
  assert!(flight.is_done());
  assert!(!flight.run().await);
  assert!(!flight.cancel());

  let outcome = tokio::time::timeout(Duration::from_secs(3600), flight.wait()).await;
  assert_eq!(outcome, Ok(Err(Error::FlightCanceled)));
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_chain_lands_its_base() {
  setup_tracing_for_test();
  let calls = Arc::new(AtomicUsize::new(0));
  let base = counted(&calls, 2);
  let next = base.then(|v| async move { Ok(v + 1) });

  let abandoned = tokio::time::timeout(Duration::from_millis(1), next.run()).await;
  assert!(abandoned.is_err());
  assert_eq!(base.wait().await, Err(Error::FlightCanceled));
  assert_eq!(next.wait().await, Err(Error::FlightCanceled));
}

async fn explode() -> Result<i32, Error> {
  panic!("flight body panicked")
}

#[tokio::test]
async fn test_panicking_flight_lands_as_cancelled() {
  setup_tracing_for_test();
  let flight = Flight::new(explode);
  assert!(flight.run_async());
  assert_eq!(flight.wait().await, Err(Error::FlightCanceled));
  assert!(flight.started());
}
