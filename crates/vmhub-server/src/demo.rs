//! Demo view models served out of the box

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use vmhub_core::{
    BoxError, BuildContext, ChangeNotifier, ChangeSet, ObservableState, StateViewModel,
    ViewModel, ViewModelMetadata, ViewModelTypes,
};

const DEFAULT_TICK: Duration = Duration::from_secs(1);
const MIN_TICK: Duration = Duration::from_millis(10);

/// Register `Counter`, `Clock` and `Admin`
pub fn register(types: &ViewModelTypes) {
    types.register_fn("Counter", |ctx| {
        Ok(Box::new(Counter::new(start_value(ctx.arg.as_ref()))) as Box<dyn ViewModel>)
    });
    types.register_fn("Clock", |ctx: BuildContext| {
        let period = tick_period(ctx.arg.as_ref());
        Ok(Box::new(Clock::start(ctx.notifier, period)) as Box<dyn ViewModel>)
    });
    types.register_fn("Admin", |_| {
        let vm = StateViewModel::new(json!({
            "message": "Welcome, administrator",
            "maintenance": false,
        }))
        .with_metadata(ViewModelMetadata::require_roles(["admin"]));
        Ok(Box::new(vm) as Box<dyn ViewModel>)
    });
}

/// `3` or `{"start": 3}`
fn start_value(arg: Option<&Value>) -> i64 {
    match arg {
        Some(Value::Number(n)) => n.as_i64(),
        Some(other) => other.get("start").and_then(Value::as_i64),
        None => None,
    }
    .unwrap_or(0)
}

fn tick_period(arg: Option<&Value>) -> Duration {
    arg.and_then(|a| a.get("interval_ms"))
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .map(|period| period.max(MIN_TICK))
        .unwrap_or(DEFAULT_TICK)
}

/// `{"count": n}`; writing `increment` adds to the count
pub struct Counter {
    state: ObservableState,
}

impl Counter {
    pub fn new(start: i64) -> Self {
        Self {
            state: ObservableState::new(json!({ "count": start })),
        }
    }

    fn count(&self) -> i64 {
        self.state.get("count").and_then(Value::as_i64).unwrap_or(0)
    }
}

#[async_trait]
impl ViewModel for Counter {
    fn state(&self) -> Value {
        self.state.snapshot()
    }

    async fn apply(&mut self, path: &str, value: Value) -> Result<(), BoxError> {
        match path {
            "increment" => {
                let by = value.as_i64().ok_or("increment expects an integer")?;
                let next = self.count().checked_add(by).ok_or("count overflow")?;
                self.state.set("count", json!(next))?;
            }
            "count" => {
                if !value.is_i64() {
                    return Err("count expects an integer".into());
                }
                self.state.set("count", value)?;
            }
            other => return Err(format!("unknown property '{}'", other).into()),
        }
        Ok(())
    }

    fn take_changes(&mut self) -> Option<ChangeSet> {
        self.state.take_changes()
    }
}

/// Ticks on its own timer and pushes `now` and `ticks` without any client
/// message. Only `paused` is writable.
pub struct Clock {
    state: Arc<Mutex<ObservableState>>,
    ticker: Option<JoinHandle<()>>,
}

impl Clock {
    /// Must be called inside a tokio runtime
    pub fn start(notifier: ChangeNotifier, period: Duration) -> Self {
        let state = Arc::new(Mutex::new(ObservableState::new(json!({
            "now": Utc::now().to_rfc3339(),
            "ticks": 0,
            "paused": false,
        }))));
        let ticker = tokio::spawn(run_clock(Arc::clone(&state), notifier, period));
        Self {
            state,
            ticker: Some(ticker),
        }
    }
}

async fn run_clock(state: Arc<Mutex<ObservableState>>, notifier: ChangeNotifier, period: Duration) {
    let mut interval = interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        {
            let mut state = state.lock();
            if state.get("paused") == Some(&Value::Bool(true)) {
                continue;
            }
            let ticks = state.get("ticks").and_then(Value::as_u64).unwrap_or(0) + 1;
            let _ = state.set("ticks", json!(ticks));
            let _ = state.set("now", json!(Utc::now().to_rfc3339()));
        }
        // registry gone
        if !notifier.notify() {
            break;
        }
    }
}

#[async_trait]
impl ViewModel for Clock {
    fn state(&self) -> Value {
        self.state.lock().snapshot()
    }

    async fn apply(&mut self, path: &str, value: Value) -> Result<(), BoxError> {
        match (path, value) {
            ("paused", Value::Bool(paused)) => {
                self.state.lock().set("paused", json!(paused))?;
                Ok(())
            }
            ("paused", _) => Err("paused expects a boolean".into()),
            (other, _) => Err(format!("'{}' is read-only", other).into()),
        }
    }

    fn take_changes(&mut self) -> Option<ChangeSet> {
        self.state.lock().take_changes()
    }

    fn on_dispose(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_counter_increment_and_set() {
        let mut counter = Counter::new(2);
        counter.apply("increment", json!(3)).await.unwrap();
        assert_eq!(counter.state(), json!({"count": 5}));
        assert_eq!(counter.take_changes().unwrap()["count"], json!(5));

        counter.apply("count", json!(-1)).await.unwrap();
        assert_eq!(counter.state(), json!({"count": -1}));

        assert!(counter.apply("count", json!("ten")).await.is_err());
        assert!(counter.apply("increment", json!(1.5)).await.is_err());
        assert!(counter.apply("total", json!(1)).await.is_err());
    }

    #[test]
    fn test_construction_args() {
        assert_eq!(start_value(None), 0);
        assert_eq!(start_value(Some(&json!(7))), 7);
        assert_eq!(start_value(Some(&json!({"start": 4}))), 4);
        assert_eq!(start_value(Some(&json!({"begin": 4}))), 0);

        assert_eq!(tick_period(None), DEFAULT_TICK);
        assert_eq!(tick_period(Some(&json!({"interval_ms": 250}))), Duration::from_millis(250));
        assert_eq!(tick_period(Some(&json!({"interval_ms": 1}))), MIN_TICK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_ticks_and_pauses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut clock = Clock::start(ChangeNotifier::new("Clock", tx), Duration::from_secs(1));
        clock.take_changes();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("Clock"));
        let delta = clock.take_changes().unwrap();
        assert_eq!(delta["ticks"], json!(1));
        assert!(delta.contains_key("now"));

        clock.apply("paused", json!(true)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        let delta = clock.take_changes().unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta["paused"], json!(true));

        assert!(clock.apply("ticks", json!(0)).await.is_err());
        assert!(clock.apply("paused", json!("yes")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_stops_on_dispose() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut clock = Clock::start(ChangeNotifier::new("Clock", tx), Duration::from_secs(1));

        clock.on_dispose();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(clock.state()["ticks"], json!(0));
    }

    #[test]
    fn test_register_demo_types() {
        let types = ViewModelTypes::new();
        register(&types);
        for name in ["Counter", "Clock", "Admin"] {
            assert!(types.contains(name), "{} missing", name);
        }
    }
}
